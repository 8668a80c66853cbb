pub mod agent;
pub mod http;
pub mod source;
pub mod supervisor;

pub use agent::{AgentStats, PollAgent, PollOutcome};
pub use http::HttpSnapshotSource;
pub use source::SnapshotSource;
pub use supervisor::AgentSupervisor;
