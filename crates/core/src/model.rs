use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

/// Role of a disk attached to a virtual machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DiskRole {
    Os,
    Data,
}

/// Encryption settings as carried on the disk resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionSettings {
    /// URL of the BEK secret, `https://<vault>.vault.azure.net/secrets/<name>/<version>`.
    pub secret_url: String,
    /// URL of the key-encryption key wrapping the BEK, if any.
    #[serde(default)]
    pub kek_url: Option<String>,
}

/// A managed disk attached to the target VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Disk {
    /// Full resource id.
    pub id: String,
    pub name: String,
    pub role: DiskRole,
    /// Resource group the disk lives in. Snapshots are created next to it.
    pub resource_group: String,
    /// Region of the disk. Snapshots are created in the same region.
    pub location: String,
    /// Logical unit number for data disks.
    #[serde(default)]
    pub lun: Option<u32>,
    #[serde(default)]
    pub encryption: Option<EncryptionSettings>,
}

/// Read-only description of the VM under capture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    pub resource_group: String,
    pub location: String,
    pub disks: Vec<Disk>,
}

/// Parsed reference to a disk encryption key secret.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionKeyRef {
    pub vault_name: String,
    pub secret_name: String,
    pub secret_version: String,
    #[serde(default)]
    pub kek_url: Option<String>,
}

/// Lifecycle of a snapshot owned by a capture run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Created,
    AccessGranted,
    Transferred,
    Revoked,
    Deleted,
}

/// Point-in-time snapshot of one disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    /// `<captureTimestamp>-<diskName>`.
    pub name: String,
    /// Remote resource id.
    pub id: String,
    pub source_disk: String,
    pub role: DiskRole,
    pub state: SnapshotState,
}

/// Time-boxed read access to a snapshot's bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub snapshot_name: String,
    pub snapshot_id: String,
    /// Signed URL. Never logged.
    pub access_url: String,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl fmt::Debug for AccessGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessGrant")
            .field("snapshot_name", &self.snapshot_name)
            .field("snapshot_id", &self.snapshot_id)
            .field("access_url", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("revoked", &self.revoked)
            .finish()
    }
}

/// Evidentiary destination of a copy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferChannel {
    ArchiveStore,
    StagingShare,
}

impl fmt::Display for TransferChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferChannel::ArchiveStore => f.write_str("archive-store"),
            TransferChannel::StagingShare => f.write_str("staging-share"),
        }
    }
}

/// Local view of a copy job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    Copying,
    Completed,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            TransferState::Pending => 0,
            TransferState::Copying => 1,
            TransferState::Completed | TransferState::Failed => 2,
        }
    }

    /// Legal single-step transitions: `Pending -> Copying -> {Completed | Failed}`.
    pub fn can_advance_to(self, next: TransferState) -> bool {
        matches!(
            (self, next),
            (TransferState::Pending, TransferState::Copying)
                | (TransferState::Copying, TransferState::Completed)
                | (TransferState::Copying, TransferState::Failed)
        )
    }
}

/// Copy state as reported by a storage service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCopyState {
    Pending,
    Copying,
    Success,
    Failed(String),
    Aborted,
}

impl RemoteCopyState {
    fn as_transfer_state(&self) -> TransferState {
        match self {
            RemoteCopyState::Pending => TransferState::Pending,
            RemoteCopyState::Copying => TransferState::Copying,
            RemoteCopyState::Success => TransferState::Completed,
            RemoteCopyState::Failed(_) | RemoteCopyState::Aborted => TransferState::Failed,
        }
    }
}

/// Opaque handle to a server-side copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CopyHandle {
    /// Container (object store) or share (file share).
    pub location: String,
    /// Blob name or file path inside `location`.
    pub path: String,
    pub copy_id: String,
}

/// One destination copy of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferJob {
    pub snapshot_name: String,
    pub channel: TransferChannel,
    pub handle: CopyHandle,
    pub state: TransferState,
    /// Every state the job has been in, in order.
    pub history: Vec<TransferState>,
    #[serde(default)]
    pub failure: Option<String>,
}

impl TransferJob {
    pub fn new(snapshot_name: impl Into<String>, channel: TransferChannel, handle: CopyHandle) -> Self {
        Self {
            snapshot_name: snapshot_name.into(),
            channel,
            handle,
            state: TransferState::Pending,
            history: vec![TransferState::Pending],
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Applies one legal transition.
    pub fn advance(&mut self, next: TransferState) -> Result<(), CaptureError> {
        if !self.state.can_advance_to(next) {
            return Err(CaptureError::IllegalTransition {
                snapshot: self.snapshot_name.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Folds a remotely observed state into the job.
    ///
    /// Stale observations are ignored. A terminal observation seen while still
    /// `Pending` passes through `Copying`.
    pub fn observe(&mut self, remote: &RemoteCopyState) -> Result<TransferState, CaptureError> {
        let target = remote.as_transfer_state();
        if target == self.state {
            return Ok(self.state);
        }
        if self.state.is_terminal() {
            return Err(CaptureError::IllegalTransition {
                snapshot: self.snapshot_name.clone(),
                from: self.state,
                to: target,
            });
        }
        if target.rank() < self.state.rank() {
            return Ok(self.state);
        }
        if self.state == TransferState::Pending && target.is_terminal() {
            self.advance(TransferState::Copying)?;
        }
        self.advance(target)?;
        if let RemoteCopyState::Failed(reason) = remote {
            self.failure = Some(reason.clone());
        } else if matches!(remote, RemoteCopyState::Aborted) {
            self.failure = Some("copy aborted".to_string());
        }
        Ok(self.state)
    }

    /// Forces the job into `Failed`, e.g. after a timeout and abort.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        if self.state == TransferState::Pending {
            self.state = TransferState::Copying;
            self.history.push(TransferState::Copying);
        }
        self.state = TransferState::Failed;
        self.history.push(TransferState::Failed);
        self.failure = Some(reason.into());
    }
}

/// Vault content-type tag of an escrowed record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContentType {
    #[serde(rename = "HASH")]
    Hash,
    #[serde(rename = "BEK")]
    Bek,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Hash => "HASH",
            ContentType::Bek => "BEK",
        }
    }
}

/// A secret as read from or written to a vault.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Secret {
    pub value: String,
    pub content_type: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("value", &"<redacted>")
            .field("content_type", &self.content_type)
            .field("tags", &self.tags)
            .finish()
    }
}

/// SHA-256 digest of one staged artifact, bound to its snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Digest {
    pub snapshot_name: String,
    /// Lowercase hex.
    pub sha256: String,
}

/// Immutable per-disk evidence written to the destination vault.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceRecord {
    pub snapshot_name: String,
    pub sha256: String,
    /// Vault secret holding the digest (content type `HASH`).
    pub digest_secret: String,
    /// Vault secret holding the escrowed BEK (content type `BEK`), if encrypted.
    pub key_secret: Option<String>,
}

impl EvidenceRecord {
    pub fn content_types(&self) -> Vec<ContentType> {
        let mut out = vec![ContentType::Hash];
        if self.key_secret.is_some() {
            out.push(ContentType::Bek);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> TransferJob {
        TransferJob::new(
            "20240101000000-osdisk",
            TransferChannel::StagingShare,
            CopyHandle {
                location: "share".into(),
                path: "20240101000000-osdisk".into(),
                copy_id: "c1".into(),
            },
        )
    }

    #[test]
    fn observe_walks_forward() {
        let mut j = job();
        assert_eq!(j.observe(&RemoteCopyState::Pending).unwrap(), TransferState::Pending);
        assert_eq!(j.observe(&RemoteCopyState::Copying).unwrap(), TransferState::Copying);
        assert_eq!(j.observe(&RemoteCopyState::Success).unwrap(), TransferState::Completed);
        assert_eq!(
            j.history,
            vec![TransferState::Pending, TransferState::Copying, TransferState::Completed]
        );
    }

    #[test]
    fn success_from_pending_passes_through_copying() {
        let mut j = job();
        j.observe(&RemoteCopyState::Success).unwrap();
        assert_eq!(
            j.history,
            vec![TransferState::Pending, TransferState::Copying, TransferState::Completed]
        );
    }

    #[test]
    fn stale_observation_does_not_regress() {
        let mut j = job();
        j.observe(&RemoteCopyState::Copying).unwrap();
        assert_eq!(j.observe(&RemoteCopyState::Pending).unwrap(), TransferState::Copying);
        assert_eq!(j.history.len(), 2);
    }

    #[test]
    fn terminal_state_is_sticky() {
        let mut j = job();
        j.observe(&RemoteCopyState::Success).unwrap();
        let err = j.observe(&RemoteCopyState::Failed("late".into())).unwrap_err();
        assert!(matches!(err, CaptureError::IllegalTransition { .. }));
        assert_eq!(j.state, TransferState::Completed);
    }

    #[test]
    fn advance_rejects_skips() {
        let mut j = job();
        assert!(j.advance(TransferState::Completed).is_err());
        assert_eq!(j.state, TransferState::Pending);
    }

    #[test]
    fn mark_failed_records_reason() {
        let mut j = job();
        j.mark_failed("timed out");
        assert_eq!(j.state, TransferState::Failed);
        assert_eq!(j.failure.as_deref(), Some("timed out"));
        assert_eq!(
            j.history,
            vec![TransferState::Pending, TransferState::Copying, TransferState::Failed]
        );
        j.mark_failed("again");
        assert_eq!(j.failure.as_deref(), Some("timed out"));
    }

    #[test]
    fn grant_debug_hides_url() {
        let g = AccessGrant {
            snapshot_name: "s".into(),
            snapshot_id: "id".into(),
            access_url: "https://x/y?sig=secret".into(),
            expires_at: Utc::now(),
            revoked: false,
        };
        assert!(!format!("{g:?}").contains("sig=secret"));
    }

    #[test]
    fn content_type_serde() {
        assert_eq!(serde_json::to_string(&ContentType::Bek).unwrap(), r#""BEK""#);
        assert_eq!(ContentType::Hash.as_str(), "HASH");
    }
}
