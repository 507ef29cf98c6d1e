//! Loom core: streaming, retry-tolerant LLM orchestration.
//! Provider adapters, JSON recovery, the per-unit processor and pool, progress events,
//! and the iterative orchestrators used by the gateway.

pub mod agents;
pub mod canvas;
pub mod config;
pub mod conversation;
pub mod emitter;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod patch;
pub mod pipeline;
pub mod pool;
pub mod processor;
pub mod provider;
pub mod recovery;
pub mod retry;
pub mod rpc;
pub mod unit;

pub use agents::{AgentJob, AgentOrchestrator, AgentSpec};
pub use canvas::{CanvasOperation, CanvasState};
pub use config::LoomConfig;
pub use conversation::{BlackboardEntry, ContinuationToken, RunOutcome, TurnStatus};
pub use emitter::{channel, EventEmitter, EventStream, HeartbeatGuard};
pub use error::{LoomError, LoomResult};
pub use events::{ProgressEvent, SequencedEvent};
pub use orchestrator::{CollaborationJob, CollaborationOrchestrator};
pub use patch::{apply_edit_values, apply_edits, decode_operations, number_lines, ApplyReport, EditOperation};
pub use processor::{FailurePolicy, UnitProcessor, UnitTask};
pub use provider::{ApiFamily, ChatMessage, HttpProvider, LlmProvider, PromptRequest, ProviderConfig, Role};
pub use recovery::{recover_json, Recovered, Strategy};
pub use retry::RetryPolicy;
pub use rpc::{AccessRole, Broadcaster, Persistence, ProjectStore, RequestContext, RestRpcClient};
pub use unit::{AnalysisResult, LinkedElements, WorkUnit};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
