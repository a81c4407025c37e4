//! Remote service contracts consumed by the capture pipeline.
//!
//! Implementations are bound to their subscription/account at construction
//! time; nothing here switches a process-wide context.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ServiceError;
use crate::model::{CopyHandle, RemoteCopyState, Secret, VirtualMachine};

/// Parameters for a snapshot of one disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub source_disk_id: String,
    pub resource_group: String,
    pub region: String,
    pub name: String,
}

#[async_trait]
pub trait InventoryService: Send + Sync {
    async fn get_virtual_machine(
        &self,
        subscription_id: &str,
        resource_group: &str,
        vm_name: &str,
    ) -> Result<VirtualMachine, ServiceError>;
}

#[async_trait]
pub trait SnapshotService: Send + Sync {
    /// Creates a copy-on-write snapshot and returns its resource id.
    async fn create(&self, request: &SnapshotRequest) -> Result<String, ServiceError>;
    async fn delete(&self, snapshot_id: &str) -> Result<(), ServiceError>;
    /// Returns a signed read-only URL valid for `ttl`.
    async fn grant_read_access(&self, snapshot_id: &str, ttl: Duration) -> Result<String, ServiceError>;
    async fn revoke_access(&self, snapshot_id: &str) -> Result<(), ServiceError>;
}

/// Archival object store.
#[async_trait]
pub trait ObjectStoreService: Send + Sync {
    async fn copy_from_url(
        &self,
        source_url: &str,
        container: &str,
        dest_name: &str,
    ) -> Result<CopyHandle, ServiceError>;
    async fn copy_state(&self, handle: &CopyHandle) -> Result<RemoteCopyState, ServiceError>;
    async fn abort_copy(&self, handle: &CopyHandle) -> Result<(), ServiceError>;
}

/// Staging file share.
#[async_trait]
pub trait FileShareService: Send + Sync {
    async fn copy_from_url(
        &self,
        source_url: &str,
        share: &str,
        path: &str,
    ) -> Result<CopyHandle, ServiceError>;
    async fn copy_state(&self, handle: &CopyHandle) -> Result<RemoteCopyState, ServiceError>;
    async fn abort_copy(&self, handle: &CopyHandle) -> Result<(), ServiceError>;
    async fn delete(&self, share: &str, path: &str) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait SecretVaultService: Send + Sync {
    async fn get_secret(
        &self,
        vault: &str,
        name: &str,
        version: Option<&str>,
    ) -> Result<Secret, ServiceError>;
    async fn set_secret(&self, vault: &str, name: &str, secret: &Secret) -> Result<(), ServiceError>;
}

/// Digest of a local file, lowercase hex.
#[async_trait]
pub trait Hasher: Send + Sync {
    async fn digest(&self, path: &Path) -> Result<String, ServiceError>;
}

/// The full set of service handles a pipeline needs.
#[derive(Clone)]
pub struct Services {
    pub inventory: Arc<dyn InventoryService>,
    pub snapshots: Arc<dyn SnapshotService>,
    pub archive: Arc<dyn ObjectStoreService>,
    pub staging: Arc<dyn FileShareService>,
    pub vault: Arc<dyn SecretVaultService>,
    pub hasher: Arc<dyn Hasher>,
}
