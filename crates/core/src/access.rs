use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::{CaptureError, ServiceError};
use crate::model::{AccessGrant, Snapshot, SnapshotState};
use crate::services::SnapshotService;

/// Issues and revokes time-boxed read access to snapshots.
#[derive(Clone)]
pub struct AccessGrantManager {
    service: Arc<dyn SnapshotService>,
}

impl AccessGrantManager {
    pub fn new(service: Arc<dyn SnapshotService>) -> Self {
        Self { service }
    }

    pub async fn grant(&self, snapshot: &mut Snapshot, duration: Duration) -> Result<AccessGrant, CaptureError> {
        let expires_at = expiry(Utc::now(), duration).ok_or(CaptureError::GrantDuration(duration))?;
        let url = self
            .service
            .grant_read_access(&snapshot.id, duration)
            .await
            .map_err(|e| match e {
                ServiceError::Unauthorized(_) => CaptureError::Authorization {
                    resource: snapshot.id.clone(),
                    source: e,
                },
                other => CaptureError::service(format!("grant access to {}", snapshot.name), other),
            })?;
        snapshot.state = SnapshotState::AccessGranted;
        info!(snapshot = %snapshot.name, expires_at = %expires_at, "read access granted");
        Ok(AccessGrant {
            snapshot_name: snapshot.name.clone(),
            snapshot_id: snapshot.id.clone(),
            access_url: url,
            expires_at,
            revoked: false,
        })
    }

    /// Revokes the grant. A grant that was already revoked is not revoked again.
    pub async fn revoke(&self, snapshot: &mut Snapshot, grant: &mut AccessGrant) -> Result<(), CaptureError> {
        if grant.revoked {
            return Ok(());
        }
        self.service
            .revoke_access(&grant.snapshot_id)
            .await
            .map_err(|e| CaptureError::Cleanup {
                snapshot: snapshot.name.clone(),
                step: "revoke access",
                reason: e.to_string(),
            })?;
        grant.revoked = true;
        if snapshot.state < SnapshotState::Revoked {
            snapshot.state = SnapshotState::Revoked;
        }
        info!(snapshot = %snapshot.name, "read access revoked");
        Ok(())
    }

    /// Revokes access on a snapshot whose grant request never returned a URL.
    ///
    /// The service may still have issued one. A snapshot with nothing to
    /// revoke counts as revoked.
    pub async fn revoke_snapshot(&self, snapshot: &mut Snapshot) -> Result<(), CaptureError> {
        match self.service.revoke_access(&snapshot.id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                return Err(CaptureError::Cleanup {
                    snapshot: snapshot.name.clone(),
                    step: "revoke access",
                    reason: e.to_string(),
                })
            }
        }
        if snapshot.state < SnapshotState::Revoked {
            snapshot.state = SnapshotState::Revoked;
        }
        info!(snapshot = %snapshot.name, "read access revoked after failed grant");
        Ok(())
    }
}

fn expiry(now: DateTime<Utc>, duration: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn expiry_adds_duration() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            expiry(now, Duration::from_secs(72_000)),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap())
        );
    }

    #[test]
    fn expiry_out_of_range_is_none() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(expiry(now, Duration::from_secs(u64::MAX)), None);
        assert_eq!(expiry(now, Duration::from_secs(i64::MAX as u64 / 1000)), None);
    }
}
