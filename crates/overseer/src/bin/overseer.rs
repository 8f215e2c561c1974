//! Host CLI.
//!
//! ```text
//! overseer agents              list capabilities registered on the worker
//! overseer run <prompt...>     process a prompt, streaming the answer
//! ```
//!
//! The worker is located through `OVERSEER_WORKER_PATH`; the model endpoint
//! through `OVERSEER_MODEL_URL`, `OVERSEER_MODEL_API_KEY` and
//! `OVERSEER_MODEL_NAME`.

use std::io::Write;

use anyhow::{Context, bail};

use overseer::config::{LaunchSpec, OrchestratorConfig, parse_secs};
use overseer::logging::init_tracing;
use overseer::{ModelCatalog, OpenAiCompatibleModel, Orchestrator, TaskRequest};

const READY_TIMEOUT_ENV: &str = "OVERSEER_READY_TIMEOUT";
const REQUEST_TIMEOUT_ENV: &str = "OVERSEER_REQUEST_TIMEOUT";

fn config_from_env() -> anyhow::Result<OrchestratorConfig> {
    let launch = LaunchSpec::from_env()?;
    let mut config = OrchestratorConfig::new(launch);
    if let Ok(raw) = std::env::var(READY_TIMEOUT_ENV) {
        config = config.with_ready_timeout(parse_secs(READY_TIMEOUT_ENV, &raw)?);
    }
    if let Ok(raw) = std::env::var(REQUEST_TIMEOUT_ENV) {
        config = config.with_request_timeout(parse_secs(REQUEST_TIMEOUT_ENV, &raw)?);
    }
    Ok(config)
}

fn catalog_from_env() -> anyhow::Result<ModelCatalog> {
    let mut catalog = ModelCatalog::new();
    if let Some(model) = OpenAiCompatibleModel::from_env().context("configuring model backend")? {
        catalog.add(std::sync::Arc::new(model));
    }
    if catalog.is_empty() {
        tracing::warn!("No model backend configured, capability requests will fail");
    }
    for info in catalog.models() {
        tracing::info!(model = %info.id, vendor = %info.vendor, "Model backend configured");
    }
    Ok(catalog)
}

async fn run(orch: &Orchestrator, args: &[String]) -> anyhow::Result<()> {
    match args.first().map(String::as_str) {
        Some("agents") => {
            for cap in orch.list_remote_capabilities().await? {
                println!("{}\t{}", cap.name, cap.description);
            }
        }
        Some("run") if args.len() > 1 => {
            let task = TaskRequest::new(args[1..].join(" "));
            let result = orch
                .process_task(&task, |text| {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                })
                .await?;
            println!();
            tracing::info!(model = %result.model, selector_index = result.selector_index, "Task complete");
        }
        _ => bail!("usage: overseer agents | overseer run <prompt...>"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let orch = Orchestrator::new(config_from_env()?, catalog_from_env()?);

    orch.start().await.context("starting worker")?;
    let outcome = run(&orch, &args).await;
    orch.stop().await;
    outcome
}
