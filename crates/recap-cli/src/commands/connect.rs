use anyhow::{anyhow, Result};
use serde_json::json;

use recap_core::{Core, Source};

use super::print_json;

pub fn connect(core: &Core, source: Source, token: &str) -> Result<()> {
    if token.trim().is_empty() {
        return Err(anyhow!("Token for {} is empty", source.display_name()));
    }
    core.connect(source, token)?;
    print_json(&json!({ "source": source, "connected": true }))
}

pub async fn disconnect(core: &Core, source: Source) -> Result<()> {
    let removed = core.disconnect(source).await?;
    print_json(&json!({
        "source": source,
        "connected": false,
        "token_removed": removed,
    }))
}
