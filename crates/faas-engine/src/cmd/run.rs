use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Args;
use faas_engine::{EngineResult, ExecutionRequest};
use sandbox::{Backend, Language};

use super::{DEFAULT_TIMEOUT_SECS, function_name, load_config, print_json, read_code, start_engine};

#[derive(Args)]
pub struct RunArgs {
    /// File with the code to run, or `-` for stdin
    source: PathBuf,
    /// Language runtime: python or node
    #[arg(long, short)]
    language: Language,
    /// Isolation backend: runc or runsc
    #[arg(long, short, default_value = "runc")]
    backend: Backend,
    /// Execution timeout in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,
    /// Function name recorded in metrics; defaults to the file stem
    #[arg(long)]
    name: Option<String>,
}

pub async fn run_run(config_path: Option<&Path>, args: RunArgs) -> EngineResult<ExitCode> {
    let config = load_config(config_path).await?;
    let code = read_code(&args.source).await?;
    let request = ExecutionRequest {
        code,
        language: args.language,
        timeout_secs: args.timeout_secs,
        backend: args.backend,
        function_name: function_name(args.name, &args.source),
    };

    let (engine, _report) = start_engine(config).await?;
    let outcome = engine.execute(&request).await;
    print_json(&outcome)?;
    engine.shutdown().await;

    Ok(if outcome.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
