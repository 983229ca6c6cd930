pub mod cli;
pub mod config;
pub mod helper;
pub mod history;
pub mod identifier;
pub mod lint;
pub mod metrics;
pub mod orchestrator;
pub mod session;
pub mod telemetry;
pub mod upload;

pub use config::BenchSettings;
pub use helper::{HelperClient, HelperHttp};
pub use orchestrator::{RunOrchestrator, RunOutcome};
pub use session::BenchSession;
pub use upload::UploadController;
