pub mod daemon;
pub mod paths;
pub mod provider;
pub mod tracking;

pub use daemon::DaemonConfig;
pub use paths::ConfigPaths;
pub use provider::ProviderConfig;
pub use tracking::TrackingConfig;
