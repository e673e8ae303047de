use sandbox::Backend;
use tracing::info;

use crate::config::CompareMode;
use crate::executor::Executor;
use crate::types::{BackendRun, CompareRequest, Comparison};

/// Run the same code once per backend.
///
/// The runs are independent: each outcome is reported as is, whether or
/// not the other backend succeeded.
pub async fn compare(executor: &Executor, request: &CompareRequest, mode: CompareMode) -> Comparison {
    let [first, second] = Backend::ALL;
    let first_request = request.for_backend(first);
    let second_request = request.for_backend(second);

    let (a, b) = match mode {
        CompareMode::Sequential => {
            let a = executor.execute(&first_request).await;
            let b = executor.execute(&second_request).await;
            (a, b)
        }
        CompareMode::Concurrent => tokio::join!(
            executor.execute(&first_request),
            executor.execute(&second_request)
        ),
    };

    info!(
        function = %request.function_name,
        first = %first,
        first_ms = a.metrics.response_time_ms,
        second = %second,
        second_ms = b.metrics.response_time_ms,
        "comparison finished"
    );

    Comparison {
        function_name: request.function_name.clone(),
        runs: [
            BackendRun {
                backend: first,
                outcome: a,
            },
            BackendRun {
                backend: second,
                outcome: b,
            },
        ],
    }
}
