use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Destination-side configuration. Built once at startup, never mutated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub destination: DestinationConfig,
    pub archive: ArchiveConfig,
    pub staging: StagingConfig,
    pub vault: VaultConfig,
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub subscription_id: String,
    pub resource_group: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub storage_account: String,
    pub container: String,
    /// Env var holding a SAS token with write access to the container.
    #[serde(default = "default_archive_sas_env")]
    pub sas_token_env: String,
    #[serde(default = "default_artifact_extension")]
    pub artifact_extension: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StagingConfig {
    pub storage_account: String,
    pub share: String,
    #[serde(default = "default_staging_sas_env")]
    pub sas_token_env: String,
    /// Where the share is mounted on the execution host.
    pub mount_path: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VaultConfig {
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptureSettings {
    #[serde(default = "default_grant_seconds")]
    pub grant_duration_secs: u64,
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    /// Bound on long-running management operations (snapshot create, get-access).
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Disks processed at once. 1 keeps the OS-disk-first sequential order.
    #[serde(default = "default_concurrency")]
    pub max_concurrent_disks: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            grant_duration_secs: default_grant_seconds(),
            poll_interval_ms: default_poll_ms(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
            max_concurrent_disks: default_concurrency(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Env var holding a bearer token for the management plane.
    #[serde(default = "default_arm_token_env")]
    pub management_token_env: String,
    /// Env var holding a bearer token for the vault data plane.
    #[serde(default = "default_vault_token_env")]
    pub vault_token_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            management_token_env: default_arm_token_env(),
            vault_token_env: default_vault_token_env(),
        }
    }
}

fn default_archive_sas_env() -> String {
    "CAPTURE_ARCHIVE_SAS".to_string()
}

fn default_staging_sas_env() -> String {
    "CAPTURE_STAGING_SAS".to_string()
}

fn default_artifact_extension() -> String {
    ".vhd".to_string()
}

fn default_grant_seconds() -> u64 {
    72_000
}

fn default_poll_ms() -> u64 {
    5_000
}

fn default_transfer_timeout_secs() -> u64 {
    72_000
}

fn default_operation_timeout_secs() -> u64 {
    1_800
}

fn default_concurrency() -> usize {
    1
}

fn default_arm_token_env() -> String {
    "CAPTURE_ARM_TOKEN".to_string()
}

fn default_vault_token_env() -> String {
    "CAPTURE_VAULT_TOKEN".to_string()
}

impl CaptureSettings {
    pub fn grant_duration(&self) -> Duration {
        Duration::from_secs(self.grant_duration_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl CaptureConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: CaptureConfig =
            toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let names = [
            ("destination.subscription_id", &self.destination.subscription_id),
            ("destination.resource_group", &self.destination.resource_group),
            ("archive.storage_account", &self.archive.storage_account),
            ("archive.container", &self.archive.container),
            ("staging.storage_account", &self.staging.storage_account),
            ("staging.share", &self.staging.share),
            ("vault.name", &self.vault.name),
        ];
        for (field, value) in names {
            if value.trim().is_empty() {
                bail!("{field} must not be empty");
            }
        }
        if self.capture.max_concurrent_disks == 0 {
            bail!("capture.max_concurrent_disks must be at least 1");
        }
        if self.capture.poll_interval_ms == 0 {
            bail!("capture.poll_interval_ms must be positive");
        }
        if self.capture.transfer_timeout_secs == 0 {
            bail!("capture.transfer_timeout_secs must be positive");
        }
        if self.capture.grant_duration_secs == 0 {
            bail!("capture.grant_duration_secs must be positive");
        }
        Ok(())
    }
}
