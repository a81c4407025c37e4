use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::access::AccessGrantManager;
use crate::error::CaptureError;
use crate::model::{AccessGrant, Snapshot, SnapshotState, TransferJob, TransferState};
use crate::services::FileShareService;
use crate::snapshot::SnapshotManager;
use crate::transfer::{require_completed, TransferCoordinator};

/// Transient state created for one disk.
#[derive(Debug)]
pub struct ArtifactSet {
    pub snapshot: Snapshot,
    /// Set once a grant was asked for, whether or not one came back.
    pub grant_requested: bool,
    pub grant: Option<AccessGrant>,
    pub archive: Option<TransferJob>,
    pub staging: Option<TransferJob>,
}

impl ArtifactSet {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot,
            grant_requested: false,
            grant: None,
            archive: None,
            staging: None,
        }
    }
}

/// What finalization did.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// The archive copy did not complete.
    pub archive_error: Option<CaptureError>,
    /// Cleanup steps that failed, plus a note when the snapshot was retained.
    pub errors: Vec<CaptureError>,
    pub snapshot_retained: bool,
    /// `None` when no grant was ever requested.
    pub grant_revoked: Option<bool>,
}

/// Tears down per-disk transient state once the archive copy is settled.
#[derive(Clone)]
pub struct CleanupManager {
    transfers: TransferCoordinator,
    access: AccessGrantManager,
    snapshots: SnapshotManager,
    staging: Arc<dyn FileShareService>,
    staging_share: String,
    archive_timeout: Duration,
}

impl CleanupManager {
    pub fn new(
        transfers: TransferCoordinator,
        access: AccessGrantManager,
        snapshots: SnapshotManager,
        staging: Arc<dyn FileShareService>,
        staging_share: impl Into<String>,
        archive_timeout: Duration,
    ) -> Self {
        Self {
            transfers,
            access,
            snapshots,
            staging,
            staging_share: staging_share.into(),
            archive_timeout,
        }
    }

    /// Runs every step regardless of earlier failures:
    ///
    /// 1. wait (bounded) for the archive copy; settle any copy still running
    /// 2. revoke the access grant, or any access on the snapshot if a grant
    ///    was requested but never returned
    /// 3. delete the snapshot, unless an archive copy was started and did not complete
    /// 4. delete the staging artifact
    pub async fn finalize_artifact(&self, set: &mut ArtifactSet) -> CleanupReport {
        let mut report = CleanupReport::default();

        if let Some(job) = set.archive.as_mut() {
            match self.transfers.await_completion(job, self.archive_timeout).await {
                Ok(_) => report.archive_error = require_completed(job).err(),
                Err(e) => report.archive_error = Some(e),
            }
            if !job.is_terminal() {
                self.transfers.abort(job, "abandoned during cleanup").await;
            }
            if job.state == TransferState::Completed && set.snapshot.state < SnapshotState::Transferred {
                set.snapshot.state = SnapshotState::Transferred;
            }
        }
        if let Some(job) = set.staging.as_mut() {
            if !job.is_terminal() {
                self.transfers.abort(job, "abandoned during cleanup").await;
            }
        }

        let revoked = match set.grant.as_mut() {
            Some(grant) => Some(self.access.revoke(&mut set.snapshot, grant).await),
            None if set.grant_requested => Some(self.access.revoke_snapshot(&mut set.snapshot).await),
            None => None,
        };
        report.grant_revoked = revoked.map(|res| match res {
            Ok(()) => true,
            Err(e) => {
                warn!(snapshot = %set.snapshot.name, error = %e, "cleanup step failed");
                report.errors.push(e);
                false
            }
        });

        let archive_incomplete = set
            .archive
            .as_ref()
            .is_some_and(|job| job.state != TransferState::Completed);
        if archive_incomplete {
            report.snapshot_retained = true;
            let e = CaptureError::Cleanup {
                snapshot: set.snapshot.name.clone(),
                step: "delete snapshot",
                reason: "archive copy did not complete; snapshot retained".to_string(),
            };
            warn!(snapshot = %set.snapshot.name, "archive copy incomplete; retaining snapshot");
            report.errors.push(e);
        } else if let Err(e) = self.snapshots.delete_snapshot(&mut set.snapshot).await {
            warn!(snapshot = %set.snapshot.name, error = %e, "cleanup step failed");
            report.errors.push(e);
        }

        if let Some(job) = set.staging.as_ref() {
            match self.staging.delete(&self.staging_share, &job.handle.path).await {
                Ok(()) => info!(snapshot = %set.snapshot.name, path = %job.handle.path, "staging artifact deleted"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    let e = CaptureError::Cleanup {
                        snapshot: set.snapshot.name.clone(),
                        step: "delete staging artifact",
                        reason: e.to_string(),
                    };
                    warn!(snapshot = %set.snapshot.name, error = %e, "cleanup step failed");
                    report.errors.push(e);
                }
            }
        }

        info!(
            snapshot = %set.snapshot.name,
            state = ?set.snapshot.state,
            failed_steps = report.errors.len(),
            "cleanup done"
        );
        report
    }
}
