use std::sync::Arc;

use tracing::info;

use crate::error::{CaptureError, ServiceError};
use crate::model::{Disk, Snapshot, SnapshotState};
use crate::naming::snapshot_name;
use crate::services::{SnapshotRequest, SnapshotService};

/// Creates and deletes point-in-time snapshots.
#[derive(Clone)]
pub struct SnapshotManager {
    service: Arc<dyn SnapshotService>,
}

impl SnapshotManager {
    pub fn new(service: Arc<dyn SnapshotService>) -> Self {
        Self { service }
    }

    /// Snapshots `disk` in its own region as `<name_prefix>-<diskName>`.
    pub async fn create_snapshot(&self, disk: &Disk, name_prefix: &str) -> Result<Snapshot, CaptureError> {
        let name = snapshot_name(name_prefix, &disk.name);
        let request = SnapshotRequest {
            source_disk_id: disk.id.clone(),
            resource_group: disk.resource_group.clone(),
            region: disk.location.clone(),
            name: name.clone(),
        };
        let id = self.service.create(&request).await.map_err(|e| match e {
            ServiceError::Unauthorized(_) => CaptureError::Authorization {
                resource: disk.id.clone(),
                source: e,
            },
            other => CaptureError::SnapshotCreation {
                snapshot: name.clone(),
                source: other,
            },
        })?;
        info!(disk = %disk.name, snapshot = %name, "snapshot created");
        Ok(Snapshot {
            name,
            id,
            source_disk: disk.name.clone(),
            role: disk.role,
            state: SnapshotState::Created,
        })
    }

    /// Idempotent: an already deleted snapshot is left alone.
    pub async fn delete_snapshot(&self, snapshot: &mut Snapshot) -> Result<(), CaptureError> {
        if snapshot.state == SnapshotState::Deleted {
            return Ok(());
        }
        match self.service.delete(&snapshot.id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                return Err(CaptureError::Cleanup {
                    snapshot: snapshot.name.clone(),
                    step: "delete snapshot",
                    reason: e.to_string(),
                })
            }
        }
        snapshot.state = SnapshotState::Deleted;
        info!(snapshot = %snapshot.name, "snapshot deleted");
        Ok(())
    }
}
