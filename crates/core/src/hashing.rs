use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncReadExt;
use tracing::info;

use crate::error::{CaptureError, ServiceError};
use crate::model::{Digest, TransferChannel, TransferJob, TransferState};
use crate::services::Hasher;

const READ_CHUNK: usize = 4 * 1024 * 1024;

/// Streams a file through SHA-256.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256FileHasher;

#[async_trait]
impl Hasher for Sha256FileHasher {
    async fn digest(&self, path: &Path) -> Result<String, ServiceError> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Digests artifacts that landed on the mounted staging share.
#[derive(Clone)]
pub struct IntegrityHasher {
    hasher: Arc<dyn Hasher>,
    mount_path: PathBuf,
}

impl IntegrityHasher {
    pub fn new(hasher: Arc<dyn Hasher>, mount_path: PathBuf) -> Self {
        Self { hasher, mount_path }
    }

    pub fn staging_path(&self, job: &TransferJob) -> PathBuf {
        self.mount_path.join(&job.handle.path)
    }

    /// Digest of the artifact produced by `job`.
    ///
    /// `job` must be a completed staging copy; the digest is bound to the
    /// job's own snapshot.
    pub async fn compute_digest(&self, job: &TransferJob) -> Result<Digest, CaptureError> {
        let path = self.staging_path(job);
        if job.channel != TransferChannel::StagingShare || job.state != TransferState::Completed {
            return Err(CaptureError::HashComputation {
                path: path.display().to_string(),
                reason: format!("{} copy is {:?}, not a completed staging copy", job.channel, job.state),
            });
        }
        let sha256 = self
            .hasher
            .digest(&path)
            .await
            .map_err(|e| CaptureError::HashComputation {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        info!(snapshot = %job.snapshot_name, sha256 = %sha256, "digest computed");
        Ok(Digest {
            snapshot_name: job.snapshot_name.clone(),
            sha256,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CopyHandle;

    fn staging_job(path: &str) -> TransferJob {
        TransferJob::new(
            "snap",
            TransferChannel::StagingShare,
            CopyHandle {
                location: "share".into(),
                path: path.into(),
                copy_id: "c".into(),
            },
        )
    }

    #[tokio::test]
    async fn hashes_known_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"abc").unwrap();
        let digest = Sha256FileHasher.digest(&dir.path().join("a")).await.unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn refuses_incomplete_copy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"partial").unwrap();
        let hasher = IntegrityHasher::new(Arc::new(Sha256FileHasher), dir.path().to_path_buf());
        let mut job = staging_job("a");
        job.advance(TransferState::Copying).unwrap();
        let err = hasher.compute_digest(&job).await.unwrap_err();
        assert!(matches!(err, CaptureError::HashComputation { .. }));
    }

    #[tokio::test]
    async fn missing_artifact_is_hash_error() {
        let dir = tempfile::tempdir().unwrap();
        let hasher = IntegrityHasher::new(Arc::new(Sha256FileHasher), dir.path().to_path_buf());
        let mut job = staging_job("missing");
        job.advance(TransferState::Copying).unwrap();
        job.advance(TransferState::Completed).unwrap();
        let err = hasher.compute_digest(&job).await.unwrap_err();
        assert!(matches!(err, CaptureError::HashComputation { .. }));
    }

    #[tokio::test]
    async fn digest_is_bound_to_job_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"abc").unwrap();
        let hasher = IntegrityHasher::new(Arc::new(Sha256FileHasher), dir.path().to_path_buf());
        let mut job = staging_job("a");
        job.advance(TransferState::Copying).unwrap();
        job.advance(TransferState::Completed).unwrap();
        let d = hasher.compute_digest(&job).await.unwrap();
        assert_eq!(d.snapshot_name, "snap");
    }
}
