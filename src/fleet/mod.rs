//! Per-channel worker processes: manifest, script template, supervisor and
//! the lifecycle operations built on them.

pub mod lifecycle;
pub mod manifest;
pub mod supervisor;
pub mod template;

pub use lifecycle::{
    BatchProgress, BatchReport, EnrollOutcome, FleetManager, FleetStatus, LifecycleError,
};
pub use manifest::{Manifest, WorkerProcessEntry, worker_name};
pub use supervisor::{Pm2Supervisor, ProcessSupervisor};
