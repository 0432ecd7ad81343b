use anyhow::Result;

use recap_core::Core;

use super::print_json;

pub async fn run(core: &Core) -> Result<()> {
    let status = core.status().await?;
    print_json(&status)
}
