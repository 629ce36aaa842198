pub mod queue;

pub use queue::{RemoteJob, RemoteOp, SyncEvent, SyncStatus, WriteQueue};
