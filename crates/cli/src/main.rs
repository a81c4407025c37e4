use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use capture_core::{CaptureConfig, CapturePipeline, CaptureReport, CaptureTarget};

mod wiring;

#[derive(Debug, Parser)]
#[command(name = "capture", version, about = "Capture forensic evidence from a VM's disks")]
struct Cli {
    /// Subscription of the VM under capture
    subscription_id: String,
    /// Resource group of the VM under capture
    resource_group: String,
    /// Name of the VM under capture
    vm_name: String,

    /// Destination configuration (TOML)
    #[arg(long, short, default_value = "capture.toml")]
    config: PathBuf,

    /// Write the run report as JSON here
    #[arg(long)]
    report: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    tracing_subscriber::fmt().with_target(false).with_env_filter(filter).init();

    let config = CaptureConfig::load_from(&cli.config)?;
    if !eligible_host(&config) {
        info!(
            mount_path = %config.staging.mount_path.display(),
            "staging share not mounted; not an eligible execution host, nothing to do"
        );
        return Ok(ExitCode::SUCCESS);
    }

    let services = wiring::azure_services(&config)?;
    let pipeline = CapturePipeline::new(Arc::new(config), services);
    let target = CaptureTarget {
        subscription_id: cli.subscription_id,
        resource_group: cli.resource_group,
        vm_name: cli.vm_name,
    };

    let report = pipeline.run(&target).await.context("capture run")?;
    print_summary(&report);
    if let Some(path) = &cli.report {
        write_report(&report, path)?;
    }

    if report.is_complete() {
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(failed = report.failures().count(), "capture incomplete");
        Ok(ExitCode::FAILURE)
    }
}

fn eligible_host(config: &CaptureConfig) -> bool {
    config.staging.mount_path.is_dir()
}

fn print_summary(report: &CaptureReport) {
    println!("run {} vm {} ({})", report.run_id, report.vm_name, report.capture_timestamp);
    for disk in &report.disks {
        let snapshot = disk.snapshot.as_deref().unwrap_or("-");
        match (&disk.record, &disk.failure) {
            (_, Some(failure)) => println!("  {:<24} {:<40} FAILED {failure}", disk.disk, snapshot),
            (Some(record), None) => println!("  {:<24} {:<40} ok sha256={}", disk.disk, snapshot, record.sha256),
            (None, None) => println!("  {:<24} {:<40} {}", disk.disk, snapshot, disk.stage),
        }
        for e in &disk.cleanup_errors {
            println!("  {:<24} cleanup: {e}", "");
        }
    }
}

fn write_report(report: &CaptureReport, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("serialize report")?;
    std::fs::write(path, json).with_context(|| format!("write report to {}", path.display()))?;
    info!(path = %path.display(), "report written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_target_and_flags() {
        let cli = Cli::try_parse_from(["capture", "sub", "rg", "vm", "--report", "out.json"]).unwrap();
        assert_eq!((cli.subscription_id.as_str(), cli.vm_name.as_str()), ("sub", "vm"));
        assert_eq!(cli.config, PathBuf::from("capture.toml"));
        assert_eq!(cli.report, Some(PathBuf::from("out.json")));
        assert_eq!(cli.log, "info");
    }

    #[test]
    fn target_is_required() {
        assert!(Cli::try_parse_from(["capture", "sub", "rg"]).is_err());
    }

    #[test]
    fn host_needs_mounted_share() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
[destination]
subscription_id = "s"
resource_group = "rg"
[archive]
storage_account = "a"
container = "c"
[staging]
storage_account = "b"
share = "hash"
mount_path = "{}"
[vault]
name = "kv"
"#,
            dir.path().display()
        );
        let mut config: CaptureConfig = toml::from_str(&toml).unwrap();
        assert!(eligible_host(&config));
        config.staging.mount_path = dir.path().join("missing");
        assert!(!eligible_host(&config));
    }
}
