use std::sync::Arc;

use anyhow::{Context, Result};
use capture_azure::{
    ArmClient, BearerToken, BlobArchiveClient, FileShareClient, HttpSettings, KeyVaultClient, SasToken,
};
use capture_core::{CaptureConfig, Services, Sha256FileHasher};

fn env_secret(var: &str) -> Result<String> {
    std::env::var(var).with_context(|| format!("environment variable {var} is not set"))
}

/// Builds the Azure-backed services from config and credentials in the
/// environment.
pub fn azure_services(config: &CaptureConfig) -> Result<Services> {
    let settings = HttpSettings {
        poll_interval: config.capture.poll_interval(),
        operation_timeout: config.capture.operation_timeout(),
    };
    let arm_token = BearerToken::new(env_secret(&config.auth.management_token_env)?);
    let vault_token = BearerToken::new(env_secret(&config.auth.vault_token_env)?);
    let archive_sas = SasToken::new(env_secret(&config.archive.sas_token_env)?);
    let staging_sas = SasToken::new(env_secret(&config.staging.sas_token_env)?);

    let arm = Arc::new(ArmClient::new(arm_token, settings).context("management client")?);
    Ok(Services {
        inventory: arm.clone(),
        snapshots: arm,
        archive: Arc::new(
            BlobArchiveClient::new(&config.archive.storage_account, archive_sas).context("archive client")?,
        ),
        staging: Arc::new(
            FileShareClient::new(&config.staging.storage_account, staging_sas).context("staging client")?,
        ),
        vault: Arc::new(KeyVaultClient::new(vault_token).context("vault client")?),
        hasher: Arc::new(Sha256FileHasher),
    })
}
