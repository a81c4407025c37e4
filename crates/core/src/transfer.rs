use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{CaptureError, ServiceError};
use crate::model::{AccessGrant, CopyHandle, RemoteCopyState, TransferChannel, TransferJob, TransferState};
use crate::services::{FileShareService, ObjectStoreService};

/// Where copies land and how often they are polled.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub archive_container: String,
    pub artifact_extension: String,
    pub staging_share: String,
    pub poll_interval: Duration,
}

/// Copies snapshots to the archive store and the staging share.
#[derive(Clone)]
pub struct TransferCoordinator {
    archive: Arc<dyn ObjectStoreService>,
    staging: Arc<dyn FileShareService>,
    settings: TransferSettings,
}

impl TransferCoordinator {
    pub fn new(
        archive: Arc<dyn ObjectStoreService>,
        staging: Arc<dyn FileShareService>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            archive,
            staging,
            settings,
        }
    }

    /// Starts the archive copy as `<dest_name><artifact_extension>`. Does not wait.
    pub async fn copy_to_archive(&self, grant: &AccessGrant, dest_name: &str) -> Result<TransferJob, CaptureError> {
        let blob = format!("{dest_name}{}", self.settings.artifact_extension);
        let handle = self
            .archive
            .copy_from_url(&grant.access_url, &self.settings.archive_container, &blob)
            .await
            .map_err(|e| start_error(&grant.snapshot_name, TransferChannel::ArchiveStore, e))?;
        info!(
            snapshot = %grant.snapshot_name,
            channel = %TransferChannel::ArchiveStore,
            dest = %blob,
            "transfer started"
        );
        Ok(TransferJob::new(&grant.snapshot_name, TransferChannel::ArchiveStore, handle))
    }

    /// Starts the staging copy as `<dest_name>`. Does not wait.
    pub async fn copy_to_staging(&self, grant: &AccessGrant, dest_name: &str) -> Result<TransferJob, CaptureError> {
        let handle = self
            .staging
            .copy_from_url(&grant.access_url, &self.settings.staging_share, dest_name)
            .await
            .map_err(|e| start_error(&grant.snapshot_name, TransferChannel::StagingShare, e))?;
        info!(
            snapshot = %grant.snapshot_name,
            channel = %TransferChannel::StagingShare,
            dest = %dest_name,
            "transfer started"
        );
        Ok(TransferJob::new(&grant.snapshot_name, TransferChannel::StagingShare, handle))
    }

    /// Polls until the job is terminal.
    ///
    /// Past `timeout` the remote copy is aborted, the job is marked `Failed`
    /// and `TransferTimeout` is returned.
    pub async fn await_completion(
        &self,
        job: &mut TransferJob,
        timeout: Duration,
    ) -> Result<TransferState, CaptureError> {
        if job.is_terminal() {
            return Ok(job.state);
        }
        let outcome = tokio::time::timeout(timeout, self.poll_until_terminal(job)).await;
        match outcome {
            Ok(result) => {
                let state = result?;
                info!(
                    snapshot = %job.snapshot_name,
                    channel = %job.channel,
                    state = ?state,
                    "transfer finished"
                );
                Ok(state)
            }
            Err(_) => {
                warn!(
                    snapshot = %job.snapshot_name,
                    channel = %job.channel,
                    timeout_secs = timeout.as_secs(),
                    "transfer timed out; aborting copy"
                );
                self.abort(job, "timed out").await;
                Err(CaptureError::TransferTimeout {
                    snapshot: job.snapshot_name.clone(),
                    channel: job.channel,
                    timeout,
                })
            }
        }
    }

    /// Aborts a non-terminal copy (best effort) and marks it `Failed`.
    pub async fn abort(&self, job: &mut TransferJob, reason: &str) {
        if job.is_terminal() {
            return;
        }
        let res = match job.channel {
            TransferChannel::ArchiveStore => self.archive.abort_copy(&job.handle).await,
            TransferChannel::StagingShare => self.staging.abort_copy(&job.handle).await,
        };
        if let Err(e) = res {
            warn!(snapshot = %job.snapshot_name, channel = %job.channel, error = %e, "abort copy failed");
        }
        job.mark_failed(reason);
    }

    async fn poll_until_terminal(&self, job: &mut TransferJob) -> Result<TransferState, CaptureError> {
        loop {
            let remote = match self.remote_state(job.channel, &job.handle).await {
                Ok(remote) => remote,
                Err(e) if e.is_retryable() => {
                    warn!(
                        snapshot = %job.snapshot_name,
                        channel = %job.channel,
                        error = %e,
                        "copy state unavailable; polling again"
                    );
                    tokio::time::sleep(self.settings.poll_interval).await;
                    continue;
                }
                Err(e) => {
                    return Err(CaptureError::service(
                        format!("{} copy state of {}", job.channel, job.snapshot_name),
                        e,
                    ))
                }
            };
            let state = job.observe(&remote)?;
            debug!(snapshot = %job.snapshot_name, channel = %job.channel, state = ?state, "copy state");
            if state.is_terminal() {
                return Ok(state);
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn remote_state(
        &self,
        channel: TransferChannel,
        handle: &CopyHandle,
    ) -> Result<RemoteCopyState, ServiceError> {
        match channel {
            TransferChannel::ArchiveStore => self.archive.copy_state(handle).await,
            TransferChannel::StagingShare => self.staging.copy_state(handle).await,
        }
    }
}

/// Converts a terminal state into an error unless it is `Completed`.
pub fn require_completed(job: &TransferJob) -> Result<(), CaptureError> {
    match job.state {
        TransferState::Completed => Ok(()),
        _ => Err(CaptureError::TransferFailed {
            snapshot: job.snapshot_name.clone(),
            channel: job.channel,
            reason: job
                .failure
                .clone()
                .unwrap_or_else(|| format!("copy ended in state {:?}", job.state)),
        }),
    }
}

fn start_error(snapshot: &str, channel: TransferChannel, e: ServiceError) -> CaptureError {
    match e {
        ServiceError::Unauthorized(_) => CaptureError::Authorization {
            resource: format!("{channel} destination for {snapshot}"),
            source: e,
        },
        other => CaptureError::TransferFailed {
            snapshot: snapshot.to_string(),
            channel,
            reason: other.to_string(),
        },
    }
}
