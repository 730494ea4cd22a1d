use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use grantloader_adapters::connector_for_file;
use grantloader_core::SourceProfile;
use grantloader_storage::{InMemoryRepository, NoDirectory};
use grantloader_sync::{recent_reports, MailSpoolNotifier, SyncConfig, SyncMode, SyncPipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "grantloader")]
#[command(about = "Loads grant, person and funder records into the repository")]
struct Cli {
    /// YAML config file; GRANTLOADER_* variables override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile one batch from an export file.
    Sync(SyncArgs),
    /// Print the stored last-updated watermark for a mode.
    Watermark {
        #[arg(long, default_value = "grant")]
        mode: SyncMode,
    },
    /// Summarize the most recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, short, default_value = "grant")]
    mode: SyncMode,

    /// Export file to load (.csv or .json).
    #[arg(long, short)]
    file: PathBuf,

    /// Start bound; defaults to the stored watermark for the mode.
    #[arg(long, short = 's')]
    start_date: Option<String>,

    /// Source profile; overrides the configured one.
    #[arg(long, short)]
    profile: Option<SourceProfile>,

    /// Mail the run report to this address through the spool directory.
    #[arg(long, short)]
    email: Option<String>,

    /// Reconcile against an empty in-memory repository and keep the stored watermark.
    #[arg(long)]
    dry_run: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig> {
    let config = match path {
        Some(path) => SyncConfig::from_yaml_file(path)?.apply_env()?,
        None => SyncConfig::from_env()?,
    };
    Ok(config)
}

async fn sync(mut config: SyncConfig, args: SyncArgs) -> Result<()> {
    if let Some(profile) = args.profile {
        config.profile = profile;
    }
    if let Some(recipient) = &args.email {
        config.mail_recipient = Some(recipient.clone());
    }
    let notifier = match args.email {
        Some(_) => Some(MailSpoolNotifier::from_config(&config)?),
        None => None,
    };

    let connector = connector_for_file(&args.file, config.profile);
    let pipeline = if args.dry_run {
        config.validate()?;
        SyncPipeline::with_clients(
            config,
            Arc::new(InMemoryRepository::new()),
            Arc::new(NoDirectory),
        )
        .without_watermark_persistence()
    } else {
        SyncPipeline::new(config).context("building sync pipeline")?
    };
    let pipeline = match notifier {
        Some(notifier) => pipeline.with_hook(Box::new(notifier)),
        None => pipeline,
    };

    let summary = pipeline
        .run_once(args.mode, connector.as_ref(), args.start_date)
        .await?;
    print!("{}", summary.statistics.report(summary.mode));
    println!(
        "sync complete: run_id={} mode={} watermark={} reports={}",
        summary.run_id,
        summary.mode,
        summary.watermark.as_deref().unwrap_or("(none)"),
        summary.reports_dir
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Sync(args) => sync(config, args).await?,
        Commands::Watermark { mode } => {
            let pipeline = SyncPipeline::with_clients(
                config,
                Arc::new(InMemoryRepository::new()),
                Arc::new(NoDirectory),
            );
            match pipeline.stored_watermark(mode).await? {
                Some(value) => println!("{}={value}", mode.watermark_key()),
                None => println!("{} has no stored watermark", mode.watermark_key()),
            }
        }
        Commands::Report { runs } => {
            println!("{}", recent_reports(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sync_arguments_parse() {
        let cli = Cli::try_parse_from([
            "grantloader",
            "sync",
            "--mode",
            "existing-user",
            "--file",
            "users.csv",
            "--start-date",
            "01/01/2018",
            "--profile",
            "spreadsheet",
            "--dry-run",
        ])
        .unwrap();
        let Commands::Sync(args) = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(args.mode, SyncMode::ExistingUser);
        assert_eq!(args.profile, Some(SourceProfile::Spreadsheet));
        assert_eq!(args.start_date.as_deref(), Some("01/01/2018"));
        assert!(args.dry_run);
        assert!(args.email.is_none());
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(Cli::try_parse_from(["grantloader", "sync", "--mode", "grants", "--file", "x.csv"]).is_err());
    }
}
