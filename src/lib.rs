pub mod config;
pub mod dispatch;
pub mod error;
pub mod failover;
pub mod orchestrator;
pub mod policy;
pub mod response;

pub use dispatch::{CallContext, GenerateRequest, HealthReport, Provider, ProviderOutput};
pub use error::OrchestratorError;
pub use orchestrator::{GenerateOptions, Orchestrator};
pub use response::{FailureStage, Response};
