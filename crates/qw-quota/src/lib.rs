pub mod accountant;
pub mod error;
pub mod events;
pub mod memory;
mod migrations;
pub mod sqlite;
pub mod store;
pub mod tracker;
pub mod types;

pub use accountant::{AccountantConfig, CloseReport, SessionAccountant, TouchReport};
pub use error::{SessionError, StoreError, StoreWarning};
pub use events::{BroadcastResetSink, LogResetSink, ResetEvent, ResetSink};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::QuotaStore;
pub use tracker::{
    Anomaly, AnomalyKind, Cadence, CycleSummary, CycleTracker, ProcessReport, TrackerConfig,
};
pub use types::{Cycle, QuotaObservation, ResetMarker, Session, Snapshot};
