//! Transfer pipeline: probe, quota, download, upload, commit

mod orchestrator;
mod staging;
mod types;

pub use orchestrator::{Delivery, TransferOrchestrator, TransferReceipt};
pub use staging::{sweep_staging_dir, StagedFile};
pub use types::{destinations_for, Destination, TransferSession, TransferState};
