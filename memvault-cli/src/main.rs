/*!
memvault CLI - backup, restore and verification for the memory stack.

Wires the coordinators in `memvault-core` to the real stack: the Qdrant,
Postgres and Neo4j adapters, `docker compose` service control, and
configuration resolved from the environment.
*/

use clap::{ArgGroup, Parser, Subcommand};
use memvault_core::{
    archive, BackupCoordinator, BackupOptions, BackupOutcome, CheckOutcome, CheckReport,
    ComposeControl, GraphAdapter, RelationalAdapter, RestoreCoordinator, RestoreOptions,
    StackConfig, StoreAdapter, VectorAdapter, VerifyMode, VerifyStatus, Verifier,
};
use std::path::PathBuf;
use tabled::{Table, Tabled};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "memvault")]
#[command(about = "Backup, restore and verify the memory stack")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture all stores into one archive
    Backup {
        /// Archive name; defaults to a UTC timestamp
        #[arg(short, long)]
        name: Option<String>,
        /// Report what would be captured without touching anything
        #[arg(long)]
        dry_run: bool,
        /// Also capture recent service logs into the archive
        #[arg(long)]
        include_logs: bool,
    },
    /// Load an archive back into the stack
    Restore {
        /// Path to a memvault archive
        archive: PathBuf,
        /// Overwrite non-empty target stores
        #[arg(short, long)]
        force: bool,
        /// Validate the archive and stop before touching any store
        #[arg(long)]
        dry_run: bool,
        /// Skip the post-load verification pass
        #[arg(long)]
        skip_verify: bool,
    },
    /// Check the health and content of the running stack
    #[command(group(ArgGroup::new("scope").args(["api_only", "data_only", "config_only"])))]
    Verify {
        /// Only probe the HTTP endpoints of the API/UI services
        #[arg(long)]
        api_only: bool,
        /// Only check the data stores
        #[arg(long)]
        data_only: bool,
        /// Only check configuration completeness
        #[arg(long)]
        config_only: bool,
    },
    /// List archives in the backup directory
    List,
}

#[derive(Tabled)]
struct CheckRow {
    #[tabled(rename = "Check")]
    name: String,
    #[tabled(rename = "Critical")]
    critical: String,
    #[tabled(rename = "Result")]
    result: String,
}

#[derive(Tabled)]
struct ArchiveRow {
    #[tabled(rename = "Archive")]
    name: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Stores")]
    stores: String,
    #[tabled(rename = "Size")]
    size: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = StackConfig::from_env()?;

    match cli.command {
        Commands::Backup {
            name,
            dry_run,
            include_logs,
        } => {
            let options = BackupOptions {
                name,
                dry_run,
                include_logs,
            };
            run_backup(config, options).await?
        }
        Commands::Restore {
            archive,
            force,
            dry_run,
            skip_verify,
        } => {
            let options = RestoreOptions {
                force,
                dry_run,
                skip_verify,
            };
            run_restore(config, &archive, options).await?
        }
        Commands::Verify {
            api_only,
            data_only,
            config_only,
        } => {
            let mode = if api_only {
                VerifyMode::ApiOnly
            } else if data_only {
                VerifyMode::DataOnly
            } else if config_only {
                VerifyMode::ConfigOnly
            } else {
                VerifyMode::Full
            };
            run_verify(config, mode).await?
        }
        Commands::List => list_archives(&config)?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_adapters(config: &StackConfig) -> Result<Vec<Box<dyn StoreAdapter>>, anyhow::Error> {
    Ok(vec![
        Box::new(VectorAdapter::new(config.vector.clone())?),
        Box::new(RelationalAdapter::new(config.relational.clone())),
        Box::new(GraphAdapter::new(config.graph.clone())?),
    ])
}

/// Cancel the returned token on Ctrl-C so a run aborts between units, after
/// its service-restart cleanup.
fn cancellation_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting after the current unit");
            token.cancel();
        }
    });
    cancel
}

async fn run_backup(config: StackConfig, options: BackupOptions) -> Result<(), anyhow::Error> {
    let adapters = build_adapters(&config)?;
    let services = ComposeControl::new(config.services.compose_dir.clone());
    let coordinator = BackupCoordinator::new(config, adapters, Box::new(services))
        .with_cancellation(cancellation_on_interrupt());

    if options.dry_run {
        let plan = coordinator.plan(&options).await?;
        println!("Would write: {}", plan.archive_path.display());
        for (kind, units) in &plan.stores {
            match units {
                Ok(units) => println!("  {kind}: {}", units.join(", ")),
                Err(reason) => println!("  {kind}: discovery failed ({reason})"),
            }
        }
        return Ok(());
    }

    let outcome = coordinator.run(&options).await?;
    print_backup_summary(&outcome);
    Ok(())
}

fn print_backup_summary(outcome: &BackupOutcome) {
    println!("Archive: {}", outcome.archive_path.display());
    for store in &outcome.metadata.stores {
        let captured = store.captured_units().count();
        let failed: Vec<&str> = store.failed_units().map(|u| u.name.as_str()).collect();
        if failed.is_empty() {
            println!("  {}: {captured} unit(s) captured", store.kind);
        } else {
            println!(
                "  {}: {captured} unit(s) captured, failed: {}",
                store.kind,
                failed.join(", ")
            );
        }
    }
    if outcome.is_degraded() {
        println!("Backup completed DEGRADED: some units were not captured");
    } else {
        println!("Backup completed successfully");
    }
}

async fn run_restore(
    config: StackConfig,
    archive: &PathBuf,
    options: RestoreOptions,
) -> Result<(), anyhow::Error> {
    let adapters = build_adapters(&config)?;
    let services = ComposeControl::new(config.services.compose_dir.clone());
    let coordinator = RestoreCoordinator::new(config, adapters, Box::new(services))
        .with_cancellation(cancellation_on_interrupt());

    let outcome = coordinator.run(archive, &options).await?;

    if options.dry_run {
        println!(
            "Archive valid: {} (created {} on {})",
            outcome.metadata.name, outcome.metadata.created_at, outcome.metadata.source_host
        );
        for store in outcome.metadata.captured_stores() {
            let units: Vec<&str> = store.captured_units().map(|u| u.name.as_str()).collect();
            println!("  would restore {}: {}", store.kind, units.join(", "));
        }
        return Ok(());
    }

    let loaded: Vec<String> = outcome.loaded.iter().map(|k| k.to_string()).collect();
    println!("Restored stores: {}", loaded.join(", "));
    match outcome.verification.as_ref().map(CheckReport::status) {
        Some(VerifyStatus::Pass) => println!("Post-restore verification passed"),
        Some(status) => {
            println!("Post-restore verification: {status:?}");
            if let Some(report) = &outcome.verification {
                print_check_table(report);
            }
        }
        None => info!("post-restore verification skipped"),
    }
    Ok(())
}

async fn run_verify(config: StackConfig, mode: VerifyMode) -> Result<(), anyhow::Error> {
    let adapters = build_adapters(&config)?;
    let verifier = Verifier::new(config)?;
    let report = verifier.run(&adapters, mode).await;

    print_check_table(&report);
    let status = report.status();
    println!("Overall: {status:?}");

    // Exit code is the verdict: 0 pass, 1 degraded, 2 fail.
    std::process::exit(match status {
        VerifyStatus::Pass => 0,
        VerifyStatus::Degraded => 1,
        VerifyStatus::Fail => 2,
    });
}

fn print_check_table(report: &CheckReport) {
    let rows: Vec<CheckRow> = report
        .checks
        .iter()
        .map(|check| CheckRow {
            name: check.name.clone(),
            critical: if check.critical { "yes" } else { "no" }.to_string(),
            result: match &check.outcome {
                CheckOutcome::Pass { detail } => format!("pass ({detail})"),
                CheckOutcome::Fail { reason } => format!("FAIL: {reason}"),
            },
        })
        .collect();
    println!("{}", Table::new(rows));
}

fn list_archives(config: &StackConfig) -> Result<(), anyhow::Error> {
    if !config.backup_dir.exists() {
        println!("No backup directory at: {}", config.backup_dir.display());
        return Ok(());
    }

    let mut rows = Vec::new();
    for entry in std::fs::read_dir(&config.backup_dir)? {
        let path = entry?.path();
        let is_archive = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("memvault-") && n.ends_with(".tar.gz"))
            .unwrap_or(false);
        if !is_archive {
            continue;
        }
        match archive::read_metadata(&path) {
            Ok(metadata) => {
                let stores: Vec<String> = metadata
                    .stores
                    .iter()
                    .map(|s| {
                        if s.failed_units().next().is_some() {
                            format!("{}*", s.kind)
                        } else {
                            s.kind.to_string()
                        }
                    })
                    .collect();
                let size = std::fs::metadata(&path)
                    .map(|m| format_size(m.len()))
                    .unwrap_or_else(|_| "?".to_string());
                rows.push(ArchiveRow {
                    name: metadata.name.clone(),
                    created: metadata.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    host: metadata.source_host.clone(),
                    stores: stores.join(", "),
                    size,
                });
            }
            Err(e) => warn!(path = %path.display(), error = %e, "unreadable archive skipped"),
        }
    }

    if rows.is_empty() {
        println!("No archives found in {}", config.backup_dir.display());
    } else {
        rows.sort_by(|a, b| a.created.cmp(&b.created));
        println!("{}", Table::new(rows));
        println!("* = archive is degraded (some units failed to capture)");
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
