use std::collections::BTreeMap;

use async_trait::async_trait;
use capture_core::model::Secret;
use capture_core::services::SecretVaultService;
use capture_core::ServiceError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::http::{self, BearerToken};

const VAULT_API: &str = "7.4";
const VAULT_SUFFIX: &str = "vault.azure.net";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretBundle {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

impl From<SecretBundle> for Secret {
    fn from(b: SecretBundle) -> Self {
        Secret {
            value: b.value,
            content_type: b.content_type,
            tags: b.tags,
        }
    }
}

/// Key Vault secrets data-plane client. One token serves every vault it
/// talks to, source and evidentiary alike.
#[derive(Debug, Clone)]
pub struct KeyVaultClient {
    http: reqwest::Client,
    token: BearerToken,
    suffix: String,
}

impl KeyVaultClient {
    pub fn new(token: BearerToken) -> Result<Self, ServiceError> {
        Ok(Self {
            http: http::client()?,
            token,
            suffix: VAULT_SUFFIX.to_string(),
        })
    }

    pub fn secret_url(&self, vault: &str, name: &str, version: Option<&str>) -> String {
        match version {
            Some(v) => format!("https://{vault}.{}/secrets/{name}/{v}?api-version={VAULT_API}", self.suffix),
            None => format!("https://{vault}.{}/secrets/{name}?api-version={VAULT_API}", self.suffix),
        }
    }
}

#[async_trait]
impl SecretVaultService for KeyVaultClient {
    async fn get_secret(&self, vault: &str, name: &str, version: Option<&str>) -> Result<Secret, ServiceError> {
        let resp = self
            .http
            .get(self.secret_url(vault, name, version))
            .bearer_auth(self.token.as_str())
            .header("x-ms-client-request-id", Uuid::new_v4().to_string())
            .send()
            .await
            .map_err(http::transport)?;
        let bundle: SecretBundle = http::json(resp).await?;
        Ok(bundle.into())
    }

    async fn set_secret(&self, vault: &str, name: &str, secret: &Secret) -> Result<(), ServiceError> {
        let body = SecretBundle {
            value: secret.value.clone(),
            content_type: secret.content_type.clone(),
            tags: secret.tags.clone(),
        };
        let resp = self
            .http
            .put(self.secret_url(vault, name, None))
            .bearer_auth(self.token.as_str())
            .header("x-ms-client-request-id", Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await
            .map_err(http::transport)?;
        http::check(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_secret_urls() {
        let client = KeyVaultClient::new(BearerToken::new("t")).unwrap();
        assert_eq!(
            client.secret_url("src-kv", "bek", Some("v1")),
            "https://src-kv.vault.azure.net/secrets/bek/v1?api-version=7.4"
        );
        assert_eq!(
            client.secret_url("evidence-kv", "snap-sha256", None),
            "https://evidence-kv.vault.azure.net/secrets/snap-sha256?api-version=7.4"
        );
    }

    #[test]
    fn decodes_secret_bundles() {
        let bundle: SecretBundle = serde_json::from_str(
            r#"{
                "value": "a2V5",
                "contentType": "Wrapped BEK",
                "id": "https://src-kv.vault.azure.net/secrets/bek/v1",
                "tags": { "DiskEncryptionKeyFileName": "os.BEK" }
            }"#,
        )
        .unwrap();
        let secret: Secret = bundle.into();
        assert_eq!(secret.value, "a2V5");
        assert_eq!(secret.content_type.as_deref(), Some("Wrapped BEK"));
        assert_eq!(secret.tags.get("DiskEncryptionKeyFileName").map(String::as_str), Some("os.BEK"));
    }

    #[test]
    fn encodes_content_type_camel_case() {
        let body = SecretBundle {
            value: "abc".into(),
            content_type: Some("HASH".into()),
            tags: BTreeMap::new(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["contentType"], "HASH");
        assert_eq!(json["value"], "abc");
    }
}
