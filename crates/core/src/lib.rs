#![forbid(unsafe_code)]

//! Forensic evidence capture of a running VM's disks.
//!
//! For every disk: snapshot, time-boxed read grant, copy to an archive store
//! and a staging share, SHA-256 over the staged artifact, escrow of digest and
//! disk key into an evidentiary vault, then revoke and clean up.

pub mod access;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod escrow;
pub mod hashing;
pub mod inventory;
pub mod memory;
pub mod model;
pub mod naming;
pub mod pipeline;
pub mod services;
pub mod snapshot;
pub mod transfer;

pub use access::AccessGrantManager;
pub use cleanup::{ArtifactSet, CleanupManager, CleanupReport};
pub use config::CaptureConfig;
pub use error::{CaptureError, DiskFailure, ServiceError};
pub use escrow::KeyEscrowClient;
pub use hashing::{IntegrityHasher, Sha256FileHasher};
pub use inventory::{CaptureTarget, DiskInventory};
pub use model::*;
pub use pipeline::{CapturePipeline, CaptureReport, DiskOutcome, PipelineStage};
pub use services::Services;
pub use snapshot::SnapshotManager;
pub use transfer::TransferCoordinator;
