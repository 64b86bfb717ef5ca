use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use transcript_keeper::file_sink::read_session_log;
use transcript_keeper::server::{self, AppState};
use transcript_keeper::settings::{resolve_effective_config, CaptureSettings};
use transcript_keeper::storage::SqliteTranscriptStore;
use transcript_keeper::{JsonFileHistory, SessionRecord, SessionRegistry, TranscriptPipeline};

#[derive(Debug, Parser)]
#[command(name = "transcript_keeper")]
#[command(about = "Conversation transcript capture with file and SQLite sinks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the capture pipeline with HTTP ingestion until Ctrl-C.
    Serve {
        #[arg(long, default_value = "127.0.0.1:7272")]
        listen: String,
        /// JSON settings file.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        log_path: Option<String>,
        #[arg(long)]
        artifact_dir: Option<String>,
        /// Also write events to the SQLite store.
        #[arg(long)]
        durable_store: bool,
        #[arg(long)]
        database_url: Option<String>,
        /// Poll this JSON file as the session history.
        #[arg(long)]
        history_file: Option<PathBuf>,
        #[arg(long)]
        poll_interval_ms: Option<u64>,
        #[arg(long)]
        drain_timeout_ms: Option<u64>,
        #[arg(long)]
        queue_capacity: Option<usize>,
        /// Expose Prometheus metrics on this address.
        #[arg(long)]
        metrics_listen: Option<String>,
    },
    /// Rebuild a session document from the JSONL log (or the SQLite store) and print it.
    Assemble {
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        log_path: Option<String>,
        /// Read the finalized document, or failing that the stored events, from SQLite.
        #[arg(long)]
        from_store: bool,
        #[arg(long)]
        database_url: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()).to_lowercase();
        EnvFilter::new(format!("{},sqlx=warn,hyper=warn", level))
    });
    fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            listen,
            config,
            log_path,
            artifact_dir,
            durable_store,
            database_url,
            history_file,
            poll_interval_ms,
            drain_timeout_ms,
            queue_capacity,
            metrics_listen,
        } => {
            let addr: SocketAddr = listen.parse()?;
            if let Some(metrics_addr) = metrics_listen {
                let metrics_addr: SocketAddr = metrics_addr.parse()?;
                metrics_exporter_prometheus::PrometheusBuilder::new()
                    .with_http_listener(metrics_addr)
                    .install()?;
            }

            let file = match config {
                Some(path) => CaptureSettings::from_file(&path)?,
                None => CaptureSettings::default(),
            };
            let overrides = CaptureSettings {
                durable_store_enabled: durable_store.then_some(true),
                database_url,
                log_path,
                artifact_dir,
                poll_interval_ms,
                drain_timeout_ms,
                queue_capacity,
            };
            let effective = resolve_effective_config(&file, &CaptureSettings::from_env(), &overrides);

            let registry = Arc::new(SessionRegistry::new());
            let mut pipeline = TranscriptPipeline::from_config(&effective, registry).await?;
            if let Some(path) = history_file {
                pipeline.watch_history(Arc::new(JsonFileHistory::new(path)));
            }

            let state = AppState { queue: pipeline.queue().clone() };
            server::serve(addr, state, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;

            let report = pipeline.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Assemble { session_id, log_path, from_store, database_url } => {
            let env = CaptureSettings::from_env();
            let cli = CaptureSettings { log_path, database_url, ..Default::default() };
            let effective = resolve_effective_config(&CaptureSettings::default(), &env, &cli);
            let record = if from_store {
                let store = SqliteTranscriptStore::initialize(effective.database_url.clone()).await?;
                match store.get_session_document(&session_id).await? {
                    Some(doc) => doc,
                    None => {
                        let items = store.events_for_session(&session_id).await?;
                        SessionRecord::assemble(session_id, items, serde_json::Map::new())
                    }
                }
            } else {
                let items = read_session_log(&effective.log_path, &session_id)?;
                SessionRecord::assemble(session_id, items, serde_json::Map::new())
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }
    Ok(())
}
