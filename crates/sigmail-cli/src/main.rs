use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sigmail_core::{MessageStage, TableCounts};
use sigmail_mail::{FixtureMailbox, MailSource};
use sigmail_storage::SignalStore;
use sigmail_sync::{export_final_signals, gmail_source, PipelineConfig, SignalPipeline};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sigmail-cli")]
#[command(about = "Signal mail ingestion pipeline")]
struct Cli {
    /// Serve the mailbox from a JSON fixture instead of Gmail.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List matching messages and land their threads.
    Ingest,
    /// Expand landed threads into full records.
    Enrich,
    /// Run the rule engine over candidate records.
    Extract,
    /// Move clean signals into the final store.
    Promote,
    /// Re-read provider timestamps for stored records.
    RepairDates,
    /// All four stages in order.
    Run,
    Migrate,
    Status {
        #[arg(long)]
        message: Option<String>,
    },
    /// Write the final signal store as Parquet with a digest manifest.
    Export {
        #[arg(long)]
        out: PathBuf,
    },
    /// Run the pipeline on the configured cron schedule until interrupted.
    Daemon,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    counts: TableCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<MessageStatus>,
}

#[derive(Debug, Serialize)]
struct MessageStatus {
    id: String,
    stage: Option<MessageStage>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "sigmail=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Ingest => print_json(&pipeline(config, cli.fixture).await?.run_ingestion().await?),
        Commands::Enrich => print_json(&pipeline(config, cli.fixture).await?.run_enrichment().await?),
        Commands::Extract => print_json(&pipeline(config, cli.fixture).await?.run_extraction().await?),
        Commands::Promote => print_json(&pipeline(config, cli.fixture).await?.run_promotion().await?),
        Commands::RepairDates => print_json(&pipeline(config, cli.fixture).await?.run_date_repair().await?),
        Commands::Run => print_json(&pipeline(config, cli.fixture).await?.run_all().await?),
        Commands::Migrate => {
            let store = open_store(&config).await?;
            store.migrate().await?;
            info!(database = %config.database_url, "migrations applied");
            Ok(())
        }
        Commands::Status { message } => {
            let store = open_store(&config).await?;
            let counts = store.counts().await?;
            let message = match message {
                Some(id) => Some(MessageStatus {
                    stage: store.message_stage(&id).await?,
                    id,
                }),
                None => None,
            };
            print_json(&StatusReport { counts, message })
        }
        Commands::Export { out } => {
            let store = open_store(&config).await?;
            print_json(&export_final_signals(&store, &out).await?)
        }
        Commands::Daemon => daemon(config, cli.fixture).await,
    }
}

async fn pipeline(config: PipelineConfig, fixture: Option<PathBuf>) -> Result<SignalPipeline> {
    let mail: Arc<dyn MailSource> = match fixture {
        Some(path) => Arc::new(FixtureMailbox::load(&path)?),
        None => gmail_source(&config)?,
    };
    info!(source = mail.source_id(), database = %config.database_url, "pipeline ready");
    Ok(SignalPipeline::connect(config, mail).await?)
}

async fn open_store(config: &PipelineConfig) -> Result<SignalStore> {
    let store = SignalStore::connect(&config.store_config())
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    store.migrate().await?;
    Ok(store)
}

async fn daemon(config: PipelineConfig, fixture: Option<PathBuf>) -> Result<()> {
    let cron = config.sync_cron.clone();
    let pipeline = Arc::new(pipeline(config, fixture).await?);
    let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
        bail!("scheduler disabled; set SIGMAIL_SCHEDULER_ENABLED=true to run the daemon");
    };

    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}
