use anyhow::{anyhow, Result};

use recap_core::{Core, Source};

use super::print_json;

pub async fn run(core: &Core, sources: Vec<Source>, full: bool) -> Result<()> {
    let results = if sources.is_empty() {
        if core.providers().is_empty() {
            return Err(anyhow!("No sources are enabled in recap.toml"));
        }
        core.sync_all(full).await
    } else {
        let mut results = Vec::with_capacity(sources.len());
        for source in sources {
            results.push(core.sync(source, full).await);
        }
        results
    };

    print_json(&results)?;

    let failed = results.iter().filter(|r| !r.success).count();
    if failed > 0 {
        return Err(anyhow!("{} of {} syncs failed", failed, results.len()));
    }
    Ok(())
}
