use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Args;
use faas_engine::{CompareRequest, EngineResult};
use sandbox::Language;
use tracing::info;

use super::{DEFAULT_TIMEOUT_SECS, function_name, load_config, print_json, read_code, start_engine};

#[derive(Args)]
pub struct CompareArgs {
    /// File with the code to run, or `-` for stdin
    source: PathBuf,
    /// Language runtime: python or node
    #[arg(long, short)]
    language: Language,
    /// Execution timeout in seconds, per backend
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,
    /// Function name recorded in metrics; defaults to the file stem
    #[arg(long)]
    name: Option<String>,
}

pub async fn run_compare(config_path: Option<&Path>, args: CompareArgs) -> EngineResult<ExitCode> {
    let config = load_config(config_path).await?;
    let code = read_code(&args.source).await?;
    let request = CompareRequest {
        code,
        language: args.language,
        timeout_secs: args.timeout_secs,
        function_name: function_name(args.name, &args.source),
    };

    let (engine, report) = start_engine(config).await?;
    if !report.unavailable.is_empty() {
        info!(
            unavailable = report.unavailable.len(),
            "some backends are unavailable, their runs will fail"
        );
    }
    let comparison = engine.compare(&request).await;
    print_json(&comparison)?;
    engine.shutdown().await;

    Ok(if comparison.runs.iter().all(|r| r.outcome.success()) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
