//! Tableau Server backup to S3
//!
//! Usage:
//!     tableau-backup --config /etc/tableau-backup/config.toml workbooks
//!     tableau-backup full backup
//!     tableau-backup full upload

use anyhow::Context;
use bridge_traits::time::LogLevel;
use clap::{Parser, Subcommand};
use core_runtime::logging::{init_logging, LoggingConfig};
use core_runtime::FileConfig;
use core_service::Wiring;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tableau-backup", version, about = "Back up Tableau Server content to S3")]
struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        env = "TABLEAU_BACKUP_CONFIG",
        default_value = "/etc/tableau-backup/config.toml"
    )]
    config: PathBuf,

    /// Log at debug level regardless of the config file
    #[arg(short, long)]
    debug: bool,

    /// Do not send anything to Zabbix
    #[arg(long)]
    no_telemetry: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Incremental backup of workbooks, per site and per project mapping
    Workbooks,
    /// Full-server `.tsbak` backup
    Full {
        #[command(subcommand)]
        action: FullAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum FullAction {
    /// Take a snapshot, then upload every archive in the backup directory
    Backup,
    /// Upload archives left in the backup directory without a new snapshot
    Upload,
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight work and stopping");
            token.cancel();
        }
    });
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = FileConfig::from_path(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let level = if cli.debug {
        LogLevel::Debug
    } else {
        config.logging.level()?
    };
    let mut logging = LoggingConfig::default()
        .with_level(level)
        .with_format(config.logging.format()?)
        .with_max_log_files(config.logging.max_log_files);
    if let Some(dir) = &config.logging.dir {
        logging = logging.with_log_dir(dir.clone());
    }
    let _guard = init_logging(logging).context("initializing logging")?;

    let wiring = Wiring::new(config, !cli.no_telemetry)
        .await
        .context("building adapters")?;

    match cli.command {
        Command::Workbooks => {
            let service = wiring.backup_service().await?;
            cancel_on_ctrl_c(service.cancellation_token());

            let outcome = service.run_sites().await.context("workbook backup")?;
            print!("{}", outcome.render_report());
            info!(runs = outcome.runs.len(), exit_code = outcome.exit_code(), "Workbook backup finished");
            Ok(exit_code(outcome.exit_code()))
        }
        Command::Full { action } => {
            let runner = wiring.full_backup_runner().await?;
            let report = match action {
                FullAction::Backup => runner.backup().await,
                FullAction::Upload => runner.upload_only().await,
            }
            .context("full backup")?;

            if let Some(snapshot) = &report.snapshot {
                println!(
                    "snapshot result_code={} exit_code={} duration={}s",
                    snapshot.result_code,
                    snapshot.exit_code.unwrap_or(-1),
                    snapshot.duration.as_secs()
                );
            }
            for file in &report.uploads.files {
                match &file.error {
                    None => println!("uploaded {} ({} bytes)", file.file_name, file.bytes),
                    Some(error) => println!("failed {}: {}", file.file_name, error),
                }
            }
            info!(
                uploaded = report.uploads.uploaded(),
                failed = report.uploads.failed(),
                exit_code = report.exit_code(),
                "Full backup finished"
            );
            Ok(exit_code(report.exit_code()))
        }
    }
}
