use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use shiftcheck::action_plans::{NotionClient, notion};
use shiftcheck::api::{self, AppState};
use shiftcheck::config::{NotionConfig, ScoringConfig, ServerConfig, StorageConfig};
use shiftcheck::evidence::{BucketStore, EvidenceStore, FallbackStore, LocalStore};
use shiftcheck::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;

    // Stderr always; a daily rolling file as well when a log dir is set.
    // The guard must live until shutdown so buffered lines get flushed.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "shiftcheck.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("shiftcheck v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api", config.port);
    eprintln!("   Duel feed: ws://0.0.0.0:{}/ws/duels", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Evidence ─────────────────────────────────────────────────────────
    let bucket: Option<Box<dyn EvidenceStore>> = match StorageConfig::from_env() {
        Some(storage) => {
            eprintln!("   Evidence bucket: {}/{}", storage.url, storage.bucket);
            Some(Box::new(BucketStore::new(storage)))
        }
        None => {
            eprintln!("   Evidence bucket: disabled (local only)");
            None
        }
    };
    let local = LocalStore::new(&config.evidence_dir, "/evidence");
    eprintln!("   Evidence dir: {}", config.evidence_dir.display());
    let evidence = Arc::new(FallbackStore::new(bucket, local));

    // ── Notion ───────────────────────────────────────────────────────────
    let notion_client = NotionConfig::from_env().map(|cfg| Arc::new(NotionClient::new(cfg)));
    match &notion_client {
        Some(client) => match client.sync_interval() {
            Some(interval) => {
                let _sync_handle =
                    notion::spawn_sync_ticker(Arc::clone(&db), Arc::clone(client), interval);
                eprintln!("   Notion: enabled (sync every {}s)", interval.as_secs());
            }
            None => eprintln!("   Notion: enabled (manual sync only)"),
        },
        None => eprintln!("   Notion: disabled"),
    }

    // ── Server ───────────────────────────────────────────────────────────
    let state = AppState::new(db, ScoringConfig::from_env(), evidence, notion_client);
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "shiftcheck server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
