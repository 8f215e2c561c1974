//! overseer: a supervised worker process with a host-side capability proxy.
//!
//! The host ([`Orchestrator`]) spawns one worker, waits for its readiness
//! handshake and exchanges correlated requests, responses and stream chunks
//! with it. Workers have no model credentials; they ask the host to call the
//! model on their behalf (see [`proxy`]).

pub mod agents;
pub mod backend;
pub mod bridge;
pub mod config;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod supervisor;
pub mod worker;

pub use agents::{AgentWorker, RemoteCapability, TaskRequest, TaskResult};
pub use backend::{
    BackendError, ChatMessage, LanguageModel, ModelCatalog, ModelInfo, ModelSelector,
    OpenAiCompatibleModel,
};
pub use bridge::protocol::{ErrorInfo, Message, MessageId, StreamChunk};
pub use config::{ConfigError, LaunchSpec, OrchestratorConfig};
pub use orchestrator::Orchestrator;
pub use process::{CommandSpawner, ExitReport, InProcessSpawner, WorkerSpawner};
pub use proxy::{CapabilityProxy, CapabilityRequest, CapabilityResult};
pub use registry::{CorrelationRegistry, RequestError};
pub use supervisor::{LifecycleEvent, Supervisor, SupervisorError, WorkerState};
pub use worker::{HostClient, IncomingRequest, RequestContext, RequestHandler, WorkerConfig, run_worker, serve};

/// Crate version, reported in the backend user agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
