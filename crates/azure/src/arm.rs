//! Management-plane client: VM inventory, snapshots and snapshot access.

use std::time::Duration;

use async_trait::async_trait;
use capture_core::model::{Disk, DiskRole, EncryptionSettings, VirtualMachine};
use capture_core::services::{InventoryService, SnapshotRequest, SnapshotService};
use capture_core::ServiceError;
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::http::{self, BearerToken, HttpSettings};

const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";
const COMPUTE_API: &str = "2024-03-02";
const VM_API: &str = "2024-07-01";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmResource {
    id: String,
    name: String,
    location: String,
    properties: VmProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmProperties {
    storage_profile: StorageProfile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageProfile {
    os_disk: VmDisk,
    #[serde(default)]
    data_disks: Vec<VmDisk>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmDisk {
    name: String,
    #[serde(default)]
    lun: Option<u32>,
    managed_disk: Option<ManagedDiskRef>,
    #[serde(default)]
    encryption_settings: Option<AdeSettings>,
}

#[derive(Debug, Deserialize)]
struct ManagedDiskRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdeSettings {
    #[serde(default)]
    enabled: Option<bool>,
    disk_encryption_key: Option<SecretRef>,
    key_encryption_key: Option<KeyRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretRef {
    secret_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyRef {
    key_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiskResource {
    location: String,
    #[serde(default)]
    properties: DiskProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiskProperties {
    encryption_settings_collection: Option<EncryptionCollection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptionCollection {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    encryption_settings: Vec<AdeSettings>,
}

impl AdeSettings {
    fn to_settings(&self) -> Option<EncryptionSettings> {
        if self.enabled == Some(false) {
            return None;
        }
        let secret = self.disk_encryption_key.as_ref()?;
        Some(EncryptionSettings {
            secret_url: secret.secret_url.clone(),
            kek_url: self.key_encryption_key.as_ref().map(|k| k.key_url.clone()),
        })
    }
}

impl DiskResource {
    fn encryption(&self) -> Option<EncryptionSettings> {
        let collection = self.properties.encryption_settings_collection.as_ref()?;
        if !collection.enabled {
            return None;
        }
        collection.encryption_settings.iter().find_map(AdeSettings::to_settings)
    }
}

/// `/subscriptions/<sub>/resourceGroups/<rg>/...` -> `(sub, rg)`.
pub fn scope_of(resource_id: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = resource_id.trim_start_matches('/').split('/').collect();
    match parts.as_slice() {
        [s, sub, r, rg, ..] if s.eq_ignore_ascii_case("subscriptions") && r.eq_ignore_ascii_case("resourceGroups") => {
            Some((sub.to_string(), rg.to_string()))
        }
        _ => None,
    }
}

/// Azure Resource Manager client bound to one bearer token.
#[derive(Debug, Clone)]
pub struct ArmClient {
    http: reqwest::Client,
    endpoint: String,
    token: BearerToken,
    settings: HttpSettings,
}

impl ArmClient {
    pub fn new(token: BearerToken, settings: HttpSettings) -> Result<Self, ServiceError> {
        Ok(Self {
            http: http::client()?,
            endpoint: MANAGEMENT_ENDPOINT.to_string(),
            token,
            settings,
        })
    }

    /// Points the client at another management endpoint (sovereign clouds).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, resource_id: &str, api_version: &str) -> String {
        format!("{}{}?api-version={api_version}", self.endpoint, resource_id)
    }

    pub fn snapshot_id(subscription_id: &str, resource_group: &str, name: &str) -> String {
        format!("/subscriptions/{subscription_id}/resourceGroups/{resource_group}/providers/Microsoft.Compute/snapshots/{name}")
    }

    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Response, ServiceError> {
        let mut req = self
            .http
            .request(method, url)
            .bearer_auth(self.token.as_str())
            .header("x-ms-client-request-id", Uuid::new_v4().to_string());
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(http::transport)?;
        http::check(resp).await
    }

    async fn get_disk(&self, disk_id: &str) -> Result<DiskResource, ServiceError> {
        let resp = self.send(Method::GET, &self.url(disk_id, COMPUTE_API), None).await?;
        http::json(resp).await
    }

    /// Follows a long-running operation started by `resp` to its end.
    ///
    /// Returns the final body, if the operation produced one.
    async fn follow(&self, resp: Response) -> Result<Option<Value>, ServiceError> {
        let async_op = http::header(resp.headers(), "azure-asyncoperation");
        let location = http::header(resp.headers(), "location");
        let status = resp.status();
        let body: Option<Value> = resp.json().await.ok();

        let Some(poll_url) = async_op.clone().or(location) else {
            return Ok(body);
        };
        if status != StatusCode::ACCEPTED && status != StatusCode::CREATED && async_op.is_none() {
            return Ok(body);
        }

        let outcome = tokio::time::timeout(self.settings.operation_timeout, self.poll(&poll_url)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Transport(format!(
                "operation did not finish within {}s",
                self.settings.operation_timeout.as_secs()
            ))),
        }
    }

    async fn poll(&self, url: &str) -> Result<Option<Value>, ServiceError> {
        loop {
            tokio::time::sleep(self.settings.poll_interval).await;
            let resp = self.send(Method::GET, url, None).await?;
            if resp.status() == StatusCode::ACCEPTED {
                debug!(url = %strip_query(url), "operation in progress");
                continue;
            }
            let bytes = resp.bytes().await.map_err(http::transport)?;
            let Some(body) = decode_operation_body(&bytes)? else {
                return Ok(None);
            };
            match operation_status(&body) {
                OperationStatus::InProgress => continue,
                OperationStatus::Failed(reason) => return Err(http::status_error(StatusCode::OK, &reason)),
                OperationStatus::Done => return Ok(Some(body)),
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum OperationStatus {
    InProgress,
    Failed(String),
    Done,
}

/// Reads an `Azure-AsyncOperation` status document. Bodies without a
/// `status` field are final results.
fn operation_status(body: &Value) -> OperationStatus {
    match body.get("status").and_then(Value::as_str) {
        Some("InProgress") | Some("Running") | Some("Accepted") => OperationStatus::InProgress,
        Some("Failed") | Some("Canceled") => OperationStatus::Failed(body.get("error").map(Value::to_string).unwrap_or_default()),
        _ => OperationStatus::Done,
    }
}

/// An empty body ends an operation without a result; anything else must be JSON.
fn decode_operation_body(bytes: &[u8]) -> Result<Option<Value>, ServiceError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(bytes)
        .map(Some)
        .map_err(|e| ServiceError::Protocol(format!("decode operation status: {e}")))
}

/// Extracts the SAS from a get-access result, wrapped or not.
fn access_sas(body: &Value) -> Option<String> {
    body.get("accessSAS")
        .or_else(|| body.pointer("/properties/output/accessSAS"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[async_trait]
impl InventoryService for ArmClient {
    async fn get_virtual_machine(
        &self,
        subscription_id: &str,
        resource_group: &str,
        vm_name: &str,
    ) -> Result<VirtualMachine, ServiceError> {
        let id = format!(
            "/subscriptions/{subscription_id}/resourceGroups/{resource_group}/providers/Microsoft.Compute/virtualMachines/{vm_name}"
        );
        let resp = self.send(Method::GET, &self.url(&id, VM_API), None).await?;
        let vm: VmResource = http::json(resp).await?;

        let storage = vm.properties.storage_profile;
        let listed = std::iter::once((storage.os_disk, DiskRole::Os))
            .chain(storage.data_disks.into_iter().map(|d| (d, DiskRole::Data)));
        let mut disks = Vec::new();
        for (vm_disk, role) in listed {
            let managed = vm_disk.managed_disk.as_ref().ok_or_else(|| {
                ServiceError::Protocol(format!("disk {} is not a managed disk", vm_disk.name))
            })?;
            let resource = self.get_disk(&managed.id).await?;
            let encryption = resource
                .encryption()
                .or_else(|| vm_disk.encryption_settings.as_ref().and_then(AdeSettings::to_settings));
            let disk_rg = scope_of(&managed.id).map(|(_, rg)| rg).unwrap_or_else(|| resource_group.to_string());
            disks.push(Disk {
                id: managed.id.clone(),
                name: vm_disk.name,
                role,
                resource_group: disk_rg,
                location: resource.location,
                lun: vm_disk.lun,
                encryption,
            });
        }
        Ok(VirtualMachine {
            id: vm.id,
            name: vm.name,
            resource_group: resource_group.to_string(),
            location: vm.location,
            disks,
        })
    }
}

#[async_trait]
impl SnapshotService for ArmClient {
    async fn create(&self, request: &SnapshotRequest) -> Result<String, ServiceError> {
        let (subscription, _) = scope_of(&request.source_disk_id)
            .ok_or_else(|| ServiceError::Protocol(format!("malformed disk id {}", request.source_disk_id)))?;
        let id = Self::snapshot_id(&subscription, &request.resource_group, &request.name);
        let body = json!({
            "location": request.region,
            "properties": {
                "creationData": {
                    "createOption": "Copy",
                    "sourceResourceId": request.source_disk_id,
                },
                "incremental": false,
            },
        });
        let resp = self.send(Method::PUT, &self.url(&id, COMPUTE_API), Some(&body)).await?;
        self.follow(resp).await?;
        debug!(snapshot = %request.name, "snapshot provisioned");
        Ok(id)
    }

    async fn delete(&self, snapshot_id: &str) -> Result<(), ServiceError> {
        let resp = self.send(Method::DELETE, &self.url(snapshot_id, COMPUTE_API), None).await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Err(ServiceError::NotFound(snapshot_id.to_string()));
        }
        self.follow(resp).await?;
        Ok(())
    }

    async fn grant_read_access(&self, snapshot_id: &str, ttl: Duration) -> Result<String, ServiceError> {
        let url = self.url(&format!("{snapshot_id}/beginGetAccess"), COMPUTE_API);
        let body = json!({ "access": "Read", "durationInSeconds": ttl.as_secs() });
        let resp = self.send(Method::POST, &url, Some(&body)).await?;
        let result = self.follow(resp).await?.unwrap_or(Value::Null);
        access_sas(&result).ok_or_else(|| ServiceError::Protocol("get-access result carried no accessSAS".into()))
    }

    async fn revoke_access(&self, snapshot_id: &str) -> Result<(), ServiceError> {
        let url = self.url(&format!("{snapshot_id}/endGetAccess"), COMPUTE_API);
        let resp = self.send(Method::POST, &url, None).await?;
        self.follow(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VM_JSON: &str = r#"{
        "id": "/subscriptions/s1/resourceGroups/prod/providers/Microsoft.Compute/virtualMachines/web-01",
        "name": "web-01",
        "location": "westeurope",
        "properties": {
            "storageProfile": {
                "osDisk": {
                    "name": "web-01-os",
                    "managedDisk": { "id": "/subscriptions/s1/resourceGroups/PROD-DISKS/providers/Microsoft.Compute/disks/web-01-os" },
                    "encryptionSettings": {
                        "enabled": true,
                        "diskEncryptionKey": { "secretUrl": "https://kv.vault.azure.net/secrets/bek/1" },
                        "keyEncryptionKey": { "keyUrl": "https://kv.vault.azure.net/keys/kek/2" }
                    }
                },
                "dataDisks": [
                    { "name": "web-01-data0", "lun": 0, "managedDisk": { "id": "/subscriptions/s1/resourceGroups/prod/providers/Microsoft.Compute/disks/web-01-data0" } }
                ]
            }
        }
    }"#;

    #[test]
    fn parses_vm_storage_profile() {
        let vm: VmResource = serde_json::from_str(VM_JSON).unwrap();
        let storage = &vm.properties.storage_profile;
        assert_eq!(storage.os_disk.name, "web-01-os");
        let ade = storage.os_disk.encryption_settings.as_ref().and_then(AdeSettings::to_settings).unwrap();
        assert_eq!(ade.secret_url, "https://kv.vault.azure.net/secrets/bek/1");
        assert_eq!(ade.kek_url.as_deref(), Some("https://kv.vault.azure.net/keys/kek/2"));
        assert_eq!(storage.data_disks[0].lun, Some(0));
        assert!(storage.data_disks[0].encryption_settings.is_none());
    }

    #[test]
    fn reads_disk_encryption_collection() {
        let disk: DiskResource = serde_json::from_str(
            r#"{
                "location": "westeurope",
                "properties": {
                    "encryptionSettingsCollection": {
                        "enabled": true,
                        "encryptionSettings": [
                            { "diskEncryptionKey": { "secretUrl": "https://kv.vault.azure.net/secrets/bek/1" } }
                        ]
                    }
                }
            }"#,
        )
        .unwrap();
        let settings = disk.encryption().unwrap();
        assert_eq!(settings.secret_url, "https://kv.vault.azure.net/secrets/bek/1");
        assert_eq!(settings.kek_url, None);

        let plain: DiskResource = serde_json::from_str(r#"{ "location": "westeurope", "properties": {} }"#).unwrap();
        assert!(plain.encryption().is_none());
    }

    #[test]
    fn splits_resource_scope() {
        assert_eq!(
            scope_of("/subscriptions/s1/resourceGroups/PROD-DISKS/providers/Microsoft.Compute/disks/d"),
            Some(("s1".into(), "PROD-DISKS".into()))
        );
        assert_eq!(scope_of("/providers/Microsoft.Compute"), None);
    }

    #[test]
    fn reads_operation_documents() {
        assert_eq!(operation_status(&json!({ "status": "InProgress" })), OperationStatus::InProgress);
        assert_eq!(operation_status(&json!({ "status": "Succeeded" })), OperationStatus::Done);
        assert!(matches!(
            operation_status(&json!({ "status": "Failed", "error": { "code": "OperationNotAllowed" } })),
            OperationStatus::Failed(reason) if reason.contains("OperationNotAllowed")
        ));
        assert_eq!(operation_status(&json!({ "accessSAS": "https://x" })), OperationStatus::Done);
    }

    #[test]
    fn garbled_operation_body_is_a_protocol_error() {
        assert!(matches!(
            decode_operation_body(b"<html>502 Bad Gateway</html>"),
            Err(ServiceError::Protocol(_))
        ));
        assert_eq!(decode_operation_body(b"").unwrap(), None);
        assert_eq!(
            decode_operation_body(br#"{"status":"Succeeded"}"#).unwrap(),
            Some(json!({ "status": "Succeeded" }))
        );
    }

    #[test]
    fn extracts_access_sas() {
        assert_eq!(access_sas(&json!({ "accessSAS": "https://a?sig=1" })).as_deref(), Some("https://a?sig=1"));
        assert_eq!(
            access_sas(&json!({ "status": "Succeeded", "properties": { "output": { "accessSAS": "https://b" } } }))
                .as_deref(),
            Some("https://b")
        );
        assert_eq!(access_sas(&json!({})), None);
    }

    #[test]
    fn builds_snapshot_ids() {
        assert_eq!(
            ArmClient::snapshot_id("s1", "rg", "20240101000000-os"),
            "/subscriptions/s1/resourceGroups/rg/providers/Microsoft.Compute/snapshots/20240101000000-os"
        );
    }
}
