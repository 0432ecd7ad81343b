use anyhow::{anyhow, Result};

use recap_core::{Core, Source, SummaryKind, SummaryResponse, TimeFilter};

use super::print_json;

pub async fn source(core: &Core, source: Source, kind: SummaryKind, refresh: bool) -> Result<()> {
    if kind == SummaryKind::DailyCombined {
        return Err(anyhow!("daily-combined covers every source; run `recap digest`"));
    }
    let response = core.summary(source, kind, refresh).await;
    finish(response)
}

pub async fn digest(core: &Core, refresh: bool) -> Result<()> {
    let response = core.digest(refresh).await;
    finish(response)
}

pub async fn overview(core: &Core, filter: TimeFilter) -> Result<()> {
    let all = core.overview(filter).await;
    print_json(&all)
}

/// Print the response either way; a failed one also sets the exit status.
fn finish(response: SummaryResponse) -> Result<()> {
    print_json(&response)?;
    match response.error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
