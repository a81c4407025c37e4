//! In-memory cloud for tests and local dry runs.
//!
//! Implements every service contract. Snapshot bytes are fixed at creation,
//! archive copies land in a map, and staging copies are written below
//! `share_root`, so the real file hasher can digest them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ServiceError;
use crate::hashing::Sha256FileHasher;
use crate::model::{CopyHandle, RemoteCopyState, Secret, TransferChannel, VirtualMachine};
use crate::services::{
    FileShareService, InventoryService, ObjectStoreService, SecretVaultService, Services, SnapshotRequest,
    SnapshotService,
};

/// Observable side effects, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudEvent {
    SnapshotCreated(String),
    AccessGranted(String),
    CopyStarted(TransferChannel, String),
    CopyCompleted(TransferChannel, String),
    CopyAborted(TransferChannel, String),
    AccessRevoked(String),
    SnapshotDeleted(String),
    SecretWritten { vault: String, name: String },
    StagingFileDeleted(String),
}

/// Per-snapshot bookkeeping exposed to tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotLedger {
    pub disk: String,
    pub grants: u32,
    pub revokes: u32,
    pub deleted: bool,
}

#[derive(Default)]
struct Faults {
    stall_staging: HashSet<String>,
    stall_archive: HashSet<String>,
    fail_archive: HashSet<String>,
    flaky_archive: HashMap<String, u32>,
    deny_grant: HashSet<String>,
    fail_snapshot: HashSet<String>,
}

struct SnapshotRecord {
    name: String,
    bytes: Vec<u8>,
    access_url: Option<String>,
    ledger: SnapshotLedger,
}

struct CopyRecord {
    channel: TransferChannel,
    snapshot_id: String,
    location: String,
    path: String,
    polls: u32,
    done: bool,
    aborted: bool,
    failed: Option<String>,
}

#[derive(Default)]
struct Inner {
    vms: HashMap<(String, String), VirtualMachine>,
    disk_names: HashMap<String, String>,
    disk_bytes: HashMap<String, Vec<u8>>,
    snapshots: HashMap<String, SnapshotRecord>,
    copies: HashMap<String, CopyRecord>,
    blobs: HashMap<(String, String), Vec<u8>>,
    secrets: HashMap<(String, String), Vec<(String, Secret)>>,
    events: Vec<CloudEvent>,
    faults: Faults,
    next_id: u64,
}

impl Inner {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn disk_of(&self, snapshot_id: &str) -> String {
        self.snapshots
            .get(snapshot_id)
            .map(|s| s.ledger.disk.clone())
            .unwrap_or_default()
    }
}

pub struct InMemoryCloud {
    inner: Mutex<Inner>,
    share_root: PathBuf,
    polls_to_complete: u32,
}

impl InMemoryCloud {
    /// `share_root` plays the mounted staging share.
    pub fn new(share_root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            share_root: share_root.into(),
            polls_to_complete: 3,
        }
    }

    /// Number of state polls before a copy reports success.
    pub fn with_polls_to_complete(mut self, polls: u32) -> Self {
        self.polls_to_complete = polls.max(1);
        self
    }

    /// Bundles this cloud and the SHA-256 file hasher as pipeline services.
    pub fn services(self: &Arc<Self>) -> Services {
        Services {
            inventory: self.clone(),
            snapshots: self.clone(),
            archive: self.clone(),
            staging: self.clone(),
            vault: self.clone(),
            hasher: Arc::new(Sha256FileHasher),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_vm(&self, vm: VirtualMachine) {
        let mut inner = self.lock();
        for disk in &vm.disks {
            inner.disk_names.insert(disk.id.clone(), disk.name.clone());
        }
        inner.vms.insert((vm.resource_group.clone(), vm.name.clone()), vm);
    }

    pub fn set_disk_contents(&self, disk_id: &str, bytes: impl Into<Vec<u8>>) {
        self.lock().disk_bytes.insert(disk_id.to_string(), bytes.into());
    }

    pub fn add_secret(&self, vault: &str, name: &str, version: &str, secret: Secret) {
        self.lock()
            .secrets
            .entry((vault.to_string(), name.to_string()))
            .or_default()
            .push((version.to_string(), secret));
    }

    /// Staging copies of this disk never finish.
    pub fn stall_staging_for(&self, disk_name: &str) {
        self.lock().faults.stall_staging.insert(disk_name.to_string());
    }

    /// Archive copies of this disk never finish.
    pub fn stall_archive_for(&self, disk_name: &str) {
        self.lock().faults.stall_archive.insert(disk_name.to_string());
    }

    /// Archive copies of this disk end `failed`.
    pub fn fail_archive_for(&self, disk_name: &str) {
        self.lock().faults.fail_archive.insert(disk_name.to_string());
    }

    /// The next `failures` archive copy-state polls of this disk, after the
    /// first, fail with a transport error.
    pub fn flake_archive_polls_for(&self, disk_name: &str, failures: u32) {
        self.lock().faults.flaky_archive.insert(disk_name.to_string(), failures);
    }

    pub fn deny_grant_for(&self, disk_name: &str) {
        self.lock().faults.deny_grant.insert(disk_name.to_string());
    }

    pub fn fail_snapshot_for(&self, disk_name: &str) {
        self.lock().faults.fail_snapshot.insert(disk_name.to_string());
    }

    pub fn events(&self) -> Vec<CloudEvent> {
        self.lock().events.clone()
    }

    /// Ledger of a snapshot by name.
    pub fn snapshot_ledger(&self, snapshot_name: &str) -> Option<SnapshotLedger> {
        self.lock()
            .snapshots
            .values()
            .find(|s| s.name == snapshot_name)
            .map(|s| s.ledger.clone())
    }

    pub fn snapshot_count(&self) -> usize {
        self.lock().snapshots.len()
    }

    /// Latest version of a secret.
    pub fn secret(&self, vault: &str, name: &str) -> Option<Secret> {
        self.lock()
            .secrets
            .get(&(vault.to_string(), name.to_string()))
            .and_then(|versions| versions.last().map(|(_, s)| s.clone()))
    }

    /// Latest version of every secret in `vault`, by name.
    pub fn secrets_in(&self, vault: &str) -> BTreeMap<String, Secret> {
        self.lock()
            .secrets
            .iter()
            .filter(|((v, _), _)| v == vault)
            .filter_map(|((_, name), versions)| versions.last().map(|(_, s)| (name.clone(), s.clone())))
            .collect()
    }

    pub fn blob(&self, container: &str, name: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(&(container.to_string(), name.to_string())).cloned()
    }

    fn start_copy(
        &self,
        channel: TransferChannel,
        source_url: &str,
        location: &str,
        path: &str,
    ) -> Result<CopyHandle, ServiceError> {
        let mut inner = self.lock();
        let snapshot_id = inner
            .snapshots
            .iter()
            .find(|(_, s)| s.access_url.as_deref() == Some(source_url))
            .map(|(id, _)| id.clone())
            .ok_or_else(|| ServiceError::Unauthorized("source url is not an active grant".into()))?;
        let copy_id = format!("copy-{}", inner.next());
        let name = inner.snapshots.get(&snapshot_id).map(|s| s.name.clone()).unwrap_or_default();
        inner.copies.insert(
            copy_id.clone(),
            CopyRecord {
                channel,
                snapshot_id,
                location: location.to_string(),
                path: path.to_string(),
                polls: 0,
                done: false,
                aborted: false,
                failed: None,
            },
        );
        inner.events.push(CloudEvent::CopyStarted(channel, name));
        Ok(CopyHandle {
            location: location.to_string(),
            path: path.to_string(),
            copy_id,
        })
    }

    fn poll_copy(&self, handle: &CopyHandle) -> Result<RemoteCopyState, ServiceError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let copy = inner
            .copies
            .get_mut(&handle.copy_id)
            .ok_or_else(|| ServiceError::NotFound(handle.copy_id.clone()))?;
        if copy.aborted {
            return Ok(RemoteCopyState::Aborted);
        }
        if let Some(reason) = &copy.failed {
            return Ok(RemoteCopyState::Failed(reason.clone()));
        }
        if copy.done {
            return Ok(RemoteCopyState::Success);
        }

        let disk = inner
            .snapshots
            .get(&copy.snapshot_id)
            .map(|s| s.ledger.disk.clone())
            .unwrap_or_default();
        let stalled = match copy.channel {
            TransferChannel::StagingShare => inner.faults.stall_staging.contains(&disk),
            TransferChannel::ArchiveStore => inner.faults.stall_archive.contains(&disk),
        };
        copy.polls += 1;
        if copy.channel == TransferChannel::ArchiveStore && copy.polls > 1 {
            if let Some(left) = inner.faults.flaky_archive.get_mut(&disk).filter(|n| **n > 0) {
                *left -= 1;
                copy.polls -= 1;
                return Err(ServiceError::Transport("connection reset by peer".into()));
            }
        }
        if stalled {
            return Ok(RemoteCopyState::Copying);
        }
        if copy.polls == 1 && self.polls_to_complete > 1 {
            return Ok(RemoteCopyState::Pending);
        }
        if copy.polls < self.polls_to_complete {
            return Ok(RemoteCopyState::Copying);
        }

        if copy.channel == TransferChannel::ArchiveStore && inner.faults.fail_archive.contains(&disk) {
            copy.failed = Some("destination rejected the copy".into());
            return Ok(RemoteCopyState::Failed("destination rejected the copy".into()));
        }
        let Some(source) = inner.snapshots.get(&copy.snapshot_id) else {
            copy.failed = Some("source snapshot vanished".into());
            return Ok(RemoteCopyState::Failed("source snapshot vanished".into()));
        };
        if source.access_url.is_none() {
            copy.failed = Some("source access revoked".into());
            return Ok(RemoteCopyState::Failed("source access revoked".into()));
        }
        let bytes = source.bytes.clone();
        let name = source.name.clone();
        match copy.channel {
            TransferChannel::StagingShare => {
                let dest = self.share_root.join(&copy.path);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&dest, &bytes)?;
            }
            TransferChannel::ArchiveStore => {
                inner.blobs.insert((copy.location.clone(), copy.path.clone()), bytes);
            }
        }
        copy.done = true;
        let channel = copy.channel;
        inner.events.push(CloudEvent::CopyCompleted(channel, name));
        Ok(RemoteCopyState::Success)
    }

    fn abort(&self, handle: &CopyHandle) -> Result<(), ServiceError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let copy = inner
            .copies
            .get_mut(&handle.copy_id)
            .ok_or_else(|| ServiceError::NotFound(handle.copy_id.clone()))?;
        if copy.done {
            return Err(ServiceError::Conflict("copy already finished".into()));
        }
        copy.aborted = true;
        let channel = copy.channel;
        let name = inner
            .snapshots
            .get(&copy.snapshot_id)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        inner.events.push(CloudEvent::CopyAborted(channel, name));
        Ok(())
    }
}

#[async_trait]
impl InventoryService for InMemoryCloud {
    async fn get_virtual_machine(
        &self,
        _subscription_id: &str,
        resource_group: &str,
        vm_name: &str,
    ) -> Result<VirtualMachine, ServiceError> {
        self.lock()
            .vms
            .get(&(resource_group.to_string(), vm_name.to_string()))
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("{resource_group}/{vm_name}")))
    }
}

#[async_trait]
impl SnapshotService for InMemoryCloud {
    async fn create(&self, request: &SnapshotRequest) -> Result<String, ServiceError> {
        let mut inner = self.lock();
        let disk = inner
            .disk_names
            .get(&request.source_disk_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(request.source_disk_id.clone()))?;
        if inner.faults.fail_snapshot.contains(&disk) {
            return Err(ServiceError::QuotaExceeded(format!("snapshot quota in {}", request.region)));
        }
        let id = format!(
            "/resourceGroups/{}/snapshots/{}",
            request.resource_group, request.name
        );
        if inner.snapshots.contains_key(&id) {
            return Err(ServiceError::Conflict(format!("snapshot {} exists", request.name)));
        }
        let bytes = inner.disk_bytes.get(&request.source_disk_id).cloned().unwrap_or_default();
        inner.snapshots.insert(
            id.clone(),
            SnapshotRecord {
                name: request.name.clone(),
                bytes,
                access_url: None,
                ledger: SnapshotLedger {
                    disk,
                    ..SnapshotLedger::default()
                },
            },
        );
        inner.events.push(CloudEvent::SnapshotCreated(request.name.clone()));
        Ok(id)
    }

    async fn delete(&self, snapshot_id: &str) -> Result<(), ServiceError> {
        let mut inner = self.lock();
        let snap = inner
            .snapshots
            .get_mut(snapshot_id)
            .filter(|s| !s.ledger.deleted)
            .ok_or_else(|| ServiceError::NotFound(snapshot_id.to_string()))?;
        if snap.access_url.is_some() {
            return Err(ServiceError::Conflict("snapshot has an active access grant".into()));
        }
        snap.ledger.deleted = true;
        let name = snap.name.clone();
        inner.events.push(CloudEvent::SnapshotDeleted(name));
        Ok(())
    }

    async fn grant_read_access(&self, snapshot_id: &str, _ttl: Duration) -> Result<String, ServiceError> {
        let mut inner = self.lock();
        let disk = inner.disk_of(snapshot_id);
        if inner.faults.deny_grant.contains(&disk) {
            return Err(ServiceError::Unauthorized(format!("no read rights on {snapshot_id}")));
        }
        let n = inner.next();
        let snap = inner
            .snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| ServiceError::NotFound(snapshot_id.to_string()))?;
        let url = format!("memory://snapshots{snapshot_id}?sig={n}");
        snap.access_url = Some(url.clone());
        snap.ledger.grants += 1;
        let name = snap.name.clone();
        inner.events.push(CloudEvent::AccessGranted(name));
        Ok(url)
    }

    async fn revoke_access(&self, snapshot_id: &str) -> Result<(), ServiceError> {
        let mut inner = self.lock();
        let snap = inner
            .snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| ServiceError::NotFound(snapshot_id.to_string()))?;
        snap.access_url = None;
        snap.ledger.revokes += 1;
        let name = snap.name.clone();
        inner.events.push(CloudEvent::AccessRevoked(name));
        Ok(())
    }
}

#[async_trait]
impl ObjectStoreService for InMemoryCloud {
    async fn copy_from_url(
        &self,
        source_url: &str,
        container: &str,
        dest_name: &str,
    ) -> Result<CopyHandle, ServiceError> {
        self.start_copy(TransferChannel::ArchiveStore, source_url, container, dest_name)
    }

    async fn copy_state(&self, handle: &CopyHandle) -> Result<RemoteCopyState, ServiceError> {
        self.poll_copy(handle)
    }

    async fn abort_copy(&self, handle: &CopyHandle) -> Result<(), ServiceError> {
        self.abort(handle)
    }
}

#[async_trait]
impl FileShareService for InMemoryCloud {
    async fn copy_from_url(&self, source_url: &str, share: &str, path: &str) -> Result<CopyHandle, ServiceError> {
        self.start_copy(TransferChannel::StagingShare, source_url, share, path)
    }

    async fn copy_state(&self, handle: &CopyHandle) -> Result<RemoteCopyState, ServiceError> {
        self.poll_copy(handle)
    }

    async fn abort_copy(&self, handle: &CopyHandle) -> Result<(), ServiceError> {
        self.abort(handle)
    }

    async fn delete(&self, _share: &str, path: &str) -> Result<(), ServiceError> {
        let file = self.share_root.join(path);
        match std::fs::remove_file(&file) {
            Ok(()) => {
                self.lock().events.push(CloudEvent::StagingFileDeleted(path.to_string()));
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ServiceError::NotFound(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SecretVaultService for InMemoryCloud {
    async fn get_secret(&self, vault: &str, name: &str, version: Option<&str>) -> Result<Secret, ServiceError> {
        let inner = self.lock();
        let versions = inner
            .secrets
            .get(&(vault.to_string(), name.to_string()))
            .ok_or_else(|| ServiceError::NotFound(format!("{vault}/{name}")))?;
        let found = match version {
            Some(v) => versions.iter().find(|(ver, _)| ver == v),
            None => versions.last(),
        };
        found
            .map(|(_, s)| s.clone())
            .ok_or_else(|| ServiceError::NotFound(format!("{vault}/{name}/{}", version.unwrap_or("latest"))))
    }

    async fn set_secret(&self, vault: &str, name: &str, secret: &Secret) -> Result<(), ServiceError> {
        let mut inner = self.lock();
        let version = format!("v{}", inner.next());
        inner
            .secrets
            .entry((vault.to_string(), name.to_string()))
            .or_default()
            .push((version, secret.clone()));
        inner.events.push(CloudEvent::SecretWritten {
            vault: vault.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }
}
