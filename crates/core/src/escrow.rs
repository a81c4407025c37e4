use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::error::{CaptureError, ServiceError};
use crate::model::{ContentType, Digest, Disk, EncryptionKeyRef, EvidenceRecord, Secret, Snapshot};
use crate::naming::{digest_secret_name, vault_secret_name};
use crate::services::SecretVaultService;

/// Tag carrying the artifact digest on an escrowed key.
pub const HASH_TAG: &str = "hash";
/// Tag carrying the key-encryption key URL on an escrowed key.
pub const KEK_TAG: &str = "kek";

/// Parses `https://<vault>.<suffix>/secrets/<name>/<version>`.
pub fn parse_secret_url(url: &str) -> Result<(String, String, String), CaptureError> {
    let invalid = || CaptureError::InvalidKeyRef(url.to_string());
    let rest = url.strip_prefix("https://").ok_or_else(invalid)?;
    let mut parts = rest.trim_end_matches('/').split('/');
    let host = parts.next().ok_or_else(invalid)?;
    let vault = host.split('.').next().filter(|v| !v.is_empty()).ok_or_else(invalid)?;
    if parts.next() != Some("secrets") {
        return Err(invalid());
    }
    let name = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
    let version = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok((vault.to_string(), name.to_string(), version.to_string()))
}

/// Reads disk keys from their source vault and escrows key and digest into
/// the evidentiary vault.
#[derive(Clone)]
pub struct KeyEscrowClient {
    vault: Arc<dyn SecretVaultService>,
    dest_vault: String,
}

impl KeyEscrowClient {
    pub fn new(vault: Arc<dyn SecretVaultService>, dest_vault: impl Into<String>) -> Self {
        Self {
            vault,
            dest_vault: dest_vault.into(),
        }
    }

    /// `None` for an unencrypted disk.
    pub fn resolve_key_ref(&self, disk: &Disk) -> Result<Option<EncryptionKeyRef>, CaptureError> {
        let Some(settings) = &disk.encryption else {
            return Ok(None);
        };
        let (vault_name, secret_name, secret_version) = parse_secret_url(&settings.secret_url)?;
        Ok(Some(EncryptionKeyRef {
            vault_name,
            secret_name,
            secret_version,
            kek_url: settings.kek_url.clone(),
        }))
    }

    /// Reads the key secret (value and tags) from the source vault.
    pub async fn fetch_key(&self, key_ref: &EncryptionKeyRef) -> Result<Secret, CaptureError> {
        self.vault
            .get_secret(&key_ref.vault_name, &key_ref.secret_name, Some(&key_ref.secret_version))
            .await
            .map_err(|e| match e {
                ServiceError::NotFound(_) => CaptureError::SecretNotFound {
                    vault: key_ref.vault_name.clone(),
                    name: key_ref.secret_name.clone(),
                },
                ServiceError::Unauthorized(_) => CaptureError::Authorization {
                    resource: format!("{}/{}", key_ref.vault_name, key_ref.secret_name),
                    source: e,
                },
                other => CaptureError::service(format!("read secret {}", key_ref.secret_name), other),
            })
    }

    /// Tags the key with the digest and writes it under `secret_name` as `BEK`.
    pub async fn escrow_key(
        &self,
        mut secret: Secret,
        digest: &Digest,
        secret_name: &str,
        kek_url: Option<&str>,
    ) -> Result<(), CaptureError> {
        secret.tags.insert(HASH_TAG.to_string(), digest.sha256.clone());
        if let Some(kek) = kek_url {
            secret.tags.insert(KEK_TAG.to_string(), kek.to_string());
        }
        secret.content_type = Some(ContentType::Bek.as_str().to_string());
        self.write(secret_name, &secret).await?;
        info!(snapshot = %digest.snapshot_name, secret = %secret_name, "key escrowed");
        Ok(())
    }

    /// Writes the digest alone under `<secret_name>-sha256` as `HASH`.
    pub async fn escrow_digest(&self, digest: &Digest, snapshot_name: &str) -> Result<String, CaptureError> {
        let name = digest_secret_name(snapshot_name);
        let secret = Secret {
            value: digest.sha256.clone(),
            content_type: Some(ContentType::Hash.as_str().to_string()),
            tags: BTreeMap::new(),
        };
        self.write(&name, &secret).await?;
        info!(snapshot = %digest.snapshot_name, secret = %name, "digest escrowed");
        Ok(name)
    }

    /// Escrows everything for one disk and returns its evidence record.
    ///
    /// Every disk gets a digest record; only encrypted disks get a key record.
    pub async fn escrow(
        &self,
        disk: &Disk,
        snapshot: &Snapshot,
        digest: &Digest,
    ) -> Result<EvidenceRecord, CaptureError> {
        if digest.snapshot_name != snapshot.name {
            return Err(CaptureError::HashComputation {
                path: digest.snapshot_name.clone(),
                reason: format!("digest belongs to {}, not {}", digest.snapshot_name, snapshot.name),
            });
        }
        let digest_secret = self.escrow_digest(digest, &snapshot.name).await?;

        let key_secret = match self.resolve_key_ref(disk)? {
            Some(key_ref) => {
                let secret = self.fetch_key(&key_ref).await?;
                let name = vault_secret_name(&snapshot.name);
                self.escrow_key(secret, digest, &name, key_ref.kek_url.as_deref()).await?;
                Some(name)
            }
            None => {
                info!(disk = %disk.name, "disk not encrypted; no key to escrow");
                None
            }
        };

        Ok(EvidenceRecord {
            snapshot_name: snapshot.name.clone(),
            sha256: digest.sha256.clone(),
            digest_secret,
            key_secret,
        })
    }

    async fn write(&self, name: &str, secret: &Secret) -> Result<(), CaptureError> {
        self.vault
            .set_secret(&self.dest_vault, name, secret)
            .await
            .map_err(|e| match e {
                ServiceError::Unauthorized(_) => CaptureError::Authorization {
                    resource: format!("{}/{}", self.dest_vault, name),
                    source: e,
                },
                other => CaptureError::service(format!("write secret {name}"), other),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_secret_url() {
        let (vault, name, version) = parse_secret_url(
            "https://src-kv.vault.azure.net/secrets/6f1f5a36-bek/0123456789abcdef",
        )
        .unwrap();
        assert_eq!(vault, "src-kv");
        assert_eq!(name, "6f1f5a36-bek");
        assert_eq!(version, "0123456789abcdef");
    }

    #[test]
    fn rejects_malformed_urls() {
        for url in [
            "http://kv.vault.azure.net/secrets/a/b",
            "https://kv.vault.azure.net/keys/a/b",
            "https://kv.vault.azure.net/secrets/a",
            "https://kv.vault.azure.net/secrets/a/b/c",
            "https:///secrets/a/b",
        ] {
            assert!(
                matches!(parse_secret_url(url), Err(CaptureError::InvalidKeyRef(_))),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn trailing_slash_is_accepted() {
        let (_, name, version) = parse_secret_url("https://kv.vault.azure.net/secrets/a/b/").unwrap();
        assert_eq!((name.as_str(), version.as_str()), ("a", "b"));
    }
}
