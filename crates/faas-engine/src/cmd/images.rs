use std::path::Path;
use std::process::ExitCode;

use faas_engine::EngineResult;

use super::{load_config, print_json, start_engine};

pub async fn run_images(config_path: Option<&Path>) -> EngineResult<ExitCode> {
    let mut config = load_config(config_path).await?;
    // Provisioning only: no warm containers.
    config.pool.min_idle = 0;
    for o in config.pools.values_mut() {
        o.min_idle = None;
    }

    let (engine, report) = start_engine(config).await?;
    // Startup already provisioned; this reports the settled state.
    let images = engine.ensure_images().await;
    print_json(&serde_json::json!({
        "backends": report.backends,
        "unavailable": report.unavailable,
        "images": images,
    }))?;
    engine.shutdown().await;

    Ok(if images.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
