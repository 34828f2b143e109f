use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use campaign_mailer::campaign::{CampaignRegistry, catalog};
use campaign_mailer::config::{MailerConfig, parse_date};
use campaign_mailer::mailer::{self, Mailer};
use campaign_mailer::store::{LibSqlBackend, MailStore};
use campaign_mailer::subject::SubjectRecord;
use campaign_mailer::template::TemplateRegistry;
use campaign_mailer::transport::{LogOnlyTransport, SmtpMailer, Transport};

#[derive(Parser)]
#[command(author, version, about = "Automated convention email campaigns")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile campaigns and send everything currently eligible, once.
    Run {
        /// Evaluate as of this time (RFC 3339 or YYYY-MM-DD) instead of now.
        #[arg(long)]
        now: Option<String>,
    },
    /// Run batches on the configured cron schedule until interrupted.
    Daemon {
        /// Seconds between schedule checks.
        #[arg(long, default_value_t = 30)]
        poll_secs: u64,
    },
    /// Approve a campaign so its pending emails go out on the next run.
    Approve { ident: String },
    /// Print campaign rows and pending-approval counts as JSON.
    Status,
    /// Load subject records from a JSON array or JSON-lines file.
    Import { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Logs go to stderr; stdout carries JSON output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = MailerConfig::from_env().context("failed to load configuration")?;

    let store: Arc<dyn MailStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    match cli.command {
        Command::Run { now } => {
            let now = match now {
                Some(raw) => parse_now(&raw)?,
                None => Utc::now(),
            };
            let mailer = build_mailer(&config, store)?;
            let report = mailer.run_once(now).await?;
            println!("{}", serde_json::to_string_pretty(report.pending_counts())?);
        }
        Command::Daemon { poll_secs } => {
            let schedule = config.schedule.schedule()?;
            let mailer = Arc::new(build_mailer(&config, store)?);
            info!(schedule = %config.schedule.cron, "Starting daemon");

            let report = mailer.run_once(Utc::now()).await?;
            println!("{}", serde_json::to_string(report.pending_counts())?);

            let ticker =
                mailer::spawn_cron_ticker(mailer.clone(), schedule, Duration::from_secs(poll_secs));
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            ticker.abort();
        }
        Command::Approve { ident } => {
            let mailer = build_mailer(&config, store)?;
            mailer.approve(&ident).await?;
            println!("{}", serde_json::json!({ "approved": ident }));
        }
        Command::Status => {
            let mailer = build_mailer(&config, store)?;
            let reconcile = mailer.reconcile().await?;
            let campaigns = mailer.store().list_campaigns().await?;
            let pending = mailer.store().pending_counts().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "registered": mailer.registry().len(),
                    "reconcile": reconcile,
                    "campaigns": campaigns,
                    "pending_counts": pending,
                }))?
            );
        }
        Command::Import { file } => {
            let count = import_subjects(store.as_ref(), &file).await?;
            println!("{}", serde_json::json!({ "imported": count }));
        }
    }

    Ok(())
}

/// Register the built-in campaigns, load templates and pick a transport.
fn build_mailer(config: &MailerConfig, store: Arc<dyn MailStore>) -> anyhow::Result<Mailer> {
    let registry = CampaignRegistry::new(Arc::new(config.event.clone()));
    catalog::register_defaults(&registry).context("failed to register campaigns")?;
    let templates = TemplateRegistry::load_dir(&config.template_dir).with_context(|| {
        format!("failed to load templates from {}", config.template_dir.display())
    })?;

    let transport: Arc<dyn Transport> = match &config.smtp {
        Some(smtp) => Arc::new(SmtpMailer::new(smtp)?),
        None => {
            warn!("SMTP_HOST not set, emails will be logged instead of sent");
            Arc::new(LogOnlyTransport)
        }
    };

    Ok(
        Mailer::new(Arc::new(registry), Arc::new(templates), store, transport)
            .with_claim_lease(config.claim_lease),
    )
}

fn parse_now(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    parse_date(raw).ok_or_else(|| anyhow::anyhow!("not a date: {raw}"))
}

async fn import_subjects(store: &dyn MailStore, path: &Path) -> anyhow::Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let records: Vec<SubjectRecord> = if raw.trim_start().starts_with('[') {
        serde_json::from_str(&raw).context("invalid subject record array")?
    } else {
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("invalid subject record on line {}", i + 1))
            })
            .collect::<anyhow::Result<_>>()?
    };

    for record in &records {
        store.upsert_subject(record).await?;
    }
    info!(count = records.len(), path = %path.display(), "Subject records imported");
    Ok(records.len())
}
