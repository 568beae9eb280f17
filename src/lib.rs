// proof_sync - Convergent operation sync for collaborative argument maps

pub mod config;
pub mod convergent;
pub mod error;
pub mod worker;

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use worker::{DeviceSyncWorker, SyncHandle};
