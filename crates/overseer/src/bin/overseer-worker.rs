//! Reference worker: speaks the protocol on stdin/stdout.

use std::sync::Arc;

use overseer::logging::init_tracing;
use overseer::{AgentWorker, WorkerConfig, run_worker};

#[tokio::main]
async fn main() {
    init_tracing();
    tracing::info!(pid = std::process::id(), "Worker starting");

    let code = match run_worker(Arc::new(AgentWorker::new()), WorkerConfig::default()).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "Worker failed");
            1
        }
    };
    // The runtime would otherwise wait on the blocking stdin reader.
    std::process::exit(code);
}
