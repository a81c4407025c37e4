use chrono::{DateTime, Utc};
use ulid::Ulid;

/// Capture-start timestamp used as the snapshot name prefix.
pub fn capture_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S").to_string()
}

/// Generates a new run id.
pub fn new_run_id() -> Ulid {
    Ulid::new()
}

/// `<prefix>-<diskName>`.
pub fn snapshot_name(prefix: &str, disk_name: &str) -> String {
    format!("{prefix}-{disk_name}")
}

/// Vault secret names only allow alphanumerics and hyphens.
pub fn vault_secret_name(snapshot_name: &str) -> String {
    snapshot_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Name of the digest-only record for a snapshot.
pub fn digest_secret_name(snapshot_name: &str) -> String {
    format!("{}-sha256", vault_secret_name(snapshot_name))
}
