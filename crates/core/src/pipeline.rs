//! Per-disk evidence capture and the run-level orchestrator.
//!
//! Each disk goes through
//! `Snapshotting -> Granting -> Transferring -> Hashing -> Escrowing -> CleaningUp -> Done`,
//! or ends `Failed`. Cleanup runs for every disk that got a snapshot,
//! whatever happened before it.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::access::AccessGrantManager;
use crate::cleanup::{ArtifactSet, CleanupManager};
use crate::config::CaptureConfig;
use crate::error::{CaptureError, DiskFailure, FailureSummary, ServiceError};
use crate::escrow::KeyEscrowClient;
use crate::hashing::IntegrityHasher;
use crate::inventory::{CaptureTarget, DiskInventory};
use crate::model::{Disk, DiskRole, EvidenceRecord, SnapshotState, TransferChannel, TransferState};
use crate::naming::{capture_timestamp, new_run_id};
use crate::services::Services;
use crate::snapshot::SnapshotManager;
use crate::transfer::{require_completed, TransferCoordinator, TransferSettings};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Snapshotting,
    Granting,
    Transferring,
    Hashing,
    Escrowing,
    CleaningUp,
    Done,
    Failed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStage::Snapshotting => "snapshotting",
            PipelineStage::Granting => "granting",
            PipelineStage::Transferring => "transferring",
            PipelineStage::Hashing => "hashing",
            PipelineStage::Escrowing => "escrowing",
            PipelineStage::CleaningUp => "cleaning up",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of capturing one disk.
#[derive(Debug, Serialize)]
pub struct DiskOutcome {
    pub disk: String,
    pub role: DiskRole,
    pub snapshot: Option<String>,
    /// `Done` or `Failed`.
    pub stage: PipelineStage,
    pub record: Option<EvidenceRecord>,
    #[serde(serialize_with = "serialize_failure")]
    pub failure: Option<DiskFailure>,
    #[serde(serialize_with = "serialize_errors")]
    pub cleanup_errors: Vec<CaptureError>,
    pub snapshot_state: Option<SnapshotState>,
    pub snapshot_retained: bool,
    /// `None` when no grant was ever requested.
    pub grant_revoked: Option<bool>,
    pub archive_history: Vec<TransferState>,
    pub staging_history: Vec<TransferState>,
}

impl DiskOutcome {
    pub fn is_done(&self) -> bool {
        self.stage == PipelineStage::Done
    }

    fn failed_early(disk: &Disk, stage: PipelineStage, error: CaptureError) -> Self {
        Self {
            disk: disk.name.clone(),
            role: disk.role,
            snapshot: None,
            stage: PipelineStage::Failed,
            record: None,
            failure: Some(DiskFailure {
                disk: disk.name.clone(),
                stage,
                error,
            }),
            cleanup_errors: vec![],
            snapshot_state: None,
            snapshot_retained: false,
            grant_revoked: None,
            archive_history: vec![],
            staging_history: vec![],
        }
    }
}

fn serialize_failure<S: Serializer>(failure: &Option<DiskFailure>, s: S) -> Result<S::Ok, S::Error> {
    failure.as_ref().map(FailureSummary::from).serialize(s)
}

fn serialize_errors<S: Serializer>(errors: &[CaptureError], s: S) -> Result<S::Ok, S::Error> {
    let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
    messages.serialize(s)
}

/// Result of a whole capture run.
#[derive(Debug, Serialize)]
pub struct CaptureReport {
    pub run_id: String,
    pub destination_subscription_id: String,
    pub destination_resource_group: String,
    pub vm_id: String,
    pub vm_name: String,
    pub capture_timestamp: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// OS disk first, then data disks.
    pub disks: Vec<DiskOutcome>,
}

impl CaptureReport {
    pub fn is_complete(&self) -> bool {
        self.disks.iter().all(DiskOutcome::is_done)
    }

    pub fn failures(&self) -> impl Iterator<Item = &DiskFailure> {
        self.disks.iter().filter_map(|d| d.failure.as_ref())
    }
}

/// Orchestrates evidence capture for every disk of a VM.
#[derive(Clone)]
pub struct CapturePipeline {
    config: Arc<CaptureConfig>,
    inventory: DiskInventory,
    snapshots: SnapshotManager,
    access: AccessGrantManager,
    transfers: TransferCoordinator,
    hasher: IntegrityHasher,
    escrow: KeyEscrowClient,
    cleanup: CleanupManager,
}

impl CapturePipeline {
    pub fn new(config: Arc<CaptureConfig>, services: Services) -> Self {
        let snapshots = SnapshotManager::new(Arc::clone(&services.snapshots));
        let access = AccessGrantManager::new(Arc::clone(&services.snapshots));
        let transfers = TransferCoordinator::new(
            Arc::clone(&services.archive),
            Arc::clone(&services.staging),
            TransferSettings {
                archive_container: config.archive.container.clone(),
                artifact_extension: config.archive.artifact_extension.clone(),
                staging_share: config.staging.share.clone(),
                poll_interval: config.capture.poll_interval(),
            },
        );
        let cleanup = CleanupManager::new(
            transfers.clone(),
            access.clone(),
            snapshots.clone(),
            Arc::clone(&services.staging),
            config.staging.share.clone(),
            config.capture.transfer_timeout(),
        );
        Self {
            inventory: DiskInventory::new(Arc::clone(&services.inventory)),
            hasher: IntegrityHasher::new(Arc::clone(&services.hasher), config.staging.mount_path.clone()),
            escrow: KeyEscrowClient::new(Arc::clone(&services.vault), config.vault.name.clone()),
            snapshots,
            access,
            transfers,
            cleanup,
            config,
        }
    }

    pub async fn run(&self, target: &CaptureTarget) -> Result<CaptureReport, CaptureError> {
        self.run_at(target, Utc::now()).await
    }

    /// Runs a capture whose snapshot names are prefixed with `started_at`.
    ///
    /// Only an inventory failure fails the run as a whole; per-disk failures
    /// are reported in the returned report.
    pub async fn run_at(
        &self,
        target: &CaptureTarget,
        started_at: DateTime<Utc>,
    ) -> Result<CaptureReport, CaptureError> {
        let run_id = new_run_id().to_string();
        let prefix = capture_timestamp(started_at);
        info!(run_id = %run_id, vm = %target.vm_name, prefix = %prefix, "capture run starting");

        let vm = self.inventory.load(target).await?;

        let limit = Arc::new(Semaphore::new(self.config.capture.max_concurrent_disks.max(1)));
        let mut tasks = JoinSet::new();
        for (index, disk) in vm.disks.iter().cloned().enumerate() {
            // Acquired before spawning so disks start in inventory order.
            let permit = Arc::clone(&limit)
                .acquire_owned()
                .await
                .map_err(|e| CaptureError::service("disk scheduling", ServiceError::Protocol(e.to_string())))?;
            let this = self.clone();
            let prefix = prefix.clone();
            tasks.spawn(async move {
                let outcome = this.process_disk(&disk, &prefix).await;
                drop(permit);
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<DiskOutcome>> = vm.disks.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => warn!(error = %e, "disk task aborted"),
            }
        }
        let disks = slots
            .into_iter()
            .zip(vm.disks.iter())
            .map(|(slot, disk)| {
                slot.unwrap_or_else(|| {
                    warn!(disk = %disk.name, "disk task ended without an outcome; its artifacts may need manual cleanup");
                    // The failing stage is unknown here.
                    DiskOutcome::failed_early(
                        disk,
                        PipelineStage::Failed,
                        CaptureError::service("disk task", ServiceError::Protocol("task aborted".into())),
                    )
                })
            })
            .collect::<Vec<_>>();

        let report = CaptureReport {
            run_id,
            destination_subscription_id: self.config.destination.subscription_id.clone(),
            destination_resource_group: self.config.destination.resource_group.clone(),
            vm_id: vm.id.clone(),
            vm_name: vm.name.clone(),
            capture_timestamp: prefix,
            started_at,
            finished_at: Utc::now(),
            disks,
        };
        info!(
            vm = %report.vm_name,
            disks = report.disks.len(),
            failed = report.failures().count(),
            "capture run finished"
        );
        Ok(report)
    }

    /// Captures one disk end to end. Never skips cleanup once a snapshot exists.
    pub async fn process_disk(&self, disk: &Disk, prefix: &str) -> DiskOutcome {
        info!(disk = %disk.name, role = ?disk.role, "capturing disk");
        let snapshot = match self.snapshots.create_snapshot(disk, prefix).await {
            Ok(s) => s,
            Err(error) => {
                warn!(disk = %disk.name, error = %error, "disk failed");
                return DiskOutcome::failed_early(disk, PipelineStage::Snapshotting, error);
            }
        };

        let run = Arc::new(Mutex::new(DiskRun {
            set: ArtifactSet::new(snapshot),
            stage: PipelineStage::Granting,
        }));
        let captured = self.capture_isolated(disk, Arc::clone(&run)).await;

        let mut guard = run.lock().await;
        let DiskRun { set, stage } = &mut *guard;
        let failed_at = *stage;
        enter(stage, PipelineStage::CleaningUp, &disk.name);
        let cleanup = self.cleanup.finalize_artifact(set).await;
        let mut cleanup_errors = cleanup.errors;

        let (record, failure) = match captured {
            Ok(record) => {
                let failure = cleanup.archive_error.map(|error| DiskFailure {
                    disk: disk.name.clone(),
                    stage: PipelineStage::CleaningUp,
                    error,
                });
                (Some(record), failure)
            }
            Err(error) => {
                if let Some(archive_error) = cleanup.archive_error {
                    cleanup_errors.push(archive_error);
                }
                let failure = DiskFailure {
                    disk: disk.name.clone(),
                    stage: failed_at,
                    error,
                };
                (None, Some(failure))
            }
        };

        let final_stage = if failure.is_some() {
            PipelineStage::Failed
        } else {
            PipelineStage::Done
        };
        match &failure {
            Some(f) => warn!(disk = %disk.name, stage = %f.stage, error = %f.error, "disk failed"),
            None => info!(disk = %disk.name, snapshot = %set.snapshot.name, "disk done"),
        }

        DiskOutcome {
            disk: disk.name.clone(),
            role: disk.role,
            snapshot: Some(set.snapshot.name.clone()),
            stage: final_stage,
            record,
            failure,
            cleanup_errors,
            snapshot_state: Some(set.snapshot.state),
            snapshot_retained: cleanup.snapshot_retained,
            grant_revoked: cleanup.grant_revoked,
            archive_history: set.archive.as_ref().map(|j| j.history.clone()).unwrap_or_default(),
            staging_history: set.staging.as_ref().map(|j| j.history.clone()).unwrap_or_default(),
        }
    }

    /// Runs `capture` in its own task. If it panics, the artifact set and
    /// stage it left behind are still there for cleanup.
    async fn capture_isolated(&self, disk: &Disk, run: Arc<Mutex<DiskRun>>) -> Result<EvidenceRecord, CaptureError> {
        let this = self.clone();
        let owned = disk.clone();
        let task = tokio::spawn(async move {
            let mut guard = run.lock().await;
            let DiskRun { set, stage } = &mut *guard;
            this.capture(&owned, set, stage).await
        });
        match task.await {
            Ok(result) => result,
            Err(e) => {
                warn!(disk = %disk.name, error = %e, "capture task aborted; cleaning up");
                Err(CaptureError::service(
                    "disk capture",
                    ServiceError::Protocol(format!("capture task aborted: {e}")),
                ))
            }
        }
    }

    async fn capture(
        &self,
        disk: &Disk,
        set: &mut ArtifactSet,
        stage: &mut PipelineStage,
    ) -> Result<EvidenceRecord, CaptureError> {
        enter(stage, PipelineStage::Granting, &disk.name);
        set.grant_requested = true;
        let grant = self
            .access
            .grant(&mut set.snapshot, self.config.capture.grant_duration())
            .await?;
        let grant = &*set.grant.insert(grant);

        enter(stage, PipelineStage::Transferring, &disk.name);
        let dest_name = set.snapshot.name.as_str();
        let (archive, staging) = tokio::join!(
            self.transfers.copy_to_archive(grant, dest_name),
            self.transfers.copy_to_staging(grant, dest_name),
        );
        let archive_started = archive.map(|job| set.archive = Some(job));
        let staging_started = staging.map(|job| set.staging = Some(job));
        archive_started?;
        staging_started?;

        let Some(staging) = set.staging.as_mut() else {
            return Err(CaptureError::TransferFailed {
                snapshot: set.snapshot.name.clone(),
                channel: TransferChannel::StagingShare,
                reason: "staging copy was not started".into(),
            });
        };
        self.transfers
            .await_completion(staging, self.config.capture.transfer_timeout())
            .await?;
        require_completed(staging)?;

        enter(stage, PipelineStage::Hashing, &disk.name);
        let digest = self.hasher.compute_digest(staging).await?;

        enter(stage, PipelineStage::Escrowing, &disk.name);
        self.escrow.escrow(disk, &set.snapshot, &digest).await
    }
}

/// Per-disk state shared between the capture task and its finalizer.
struct DiskRun {
    set: ArtifactSet,
    stage: PipelineStage,
}

fn enter(stage: &mut PipelineStage, next: PipelineStage, disk: &str) {
    debug!(disk = %disk, from = %stage, to = %next, "stage");
    *stage = next;
}
