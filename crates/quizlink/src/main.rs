// Quiz battle client entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file; stdout belongs to the console)
// 2. Load config
// 3. Open database, look for a match to resume
// 4. Create mpsc channels
// 5. Build the push connector and the fallback API client
// 6. Spawn the client event loop
// 7. Run the console until the user quits
// 8. Cleanup on exit

use std::sync::Arc;

use quizlink::app;
use quizlink::clock::SystemClock;
use quizlink::config;
use quizlink::console;
use quizlink::db;
use quizlink::fallback::{DisabledFallback, FallbackApi, FallbackDispatcher, HttpFallback};
use quizlink::link::connection::{ConnectionManager, WsConnector};
use quizlink::protocol::UserCommand;
use quizlink::ws_client::TransportSettings;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("Quiz client starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: {} ({:?} mode)",
        config.server.ws_url, config.transport.mode
    );
    let bearer_token = config.bearer_token();
    if bearer_token.is_none() {
        warn!("No bearer token configured; the server may refuse the connection");
    }

    // 3. Open database
    let db_path = config.database.resolved_path();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let db_path = db_path.to_string_lossy().into_owned();
    let db = db::Database::open(&db_path).context("failed to open database")?;
    info!("Database opened at {}", db_path);

    let resume = db.last_match_id().context("failed to read resumable match")?;

    // 4. Create mpsc channels
    let (transport_tx, transport_rx) = mpsc::channel(256);
    let (fallback_tx, fallback_rx) = mpsc::channel(64);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (notice_tx, notice_rx) = mpsc::channel(256);

    // 5. Push connector and fallback API
    let connector = WsConnector::new(TransportSettings {
        url: config.server.ws_url.clone(),
        bearer_token: bearer_token.clone(),
        reconnect_delay: config.reconnect_delay(),
    });
    let connection = ConnectionManager::new(
        Arc::new(connector),
        transport_tx,
        config.settle_delay(),
        config.connect_timeout(),
    );

    let api: Arc<dyn FallbackApi> = match &config.server.http_base_url {
        Some(base_url) => {
            info!("HTTP fallback enabled at {}", base_url);
            Arc::new(
                HttpFallback::new(base_url, bearer_token, config.http_timeout())
                    .context("failed to build HTTP client")?,
            )
        }
        None => {
            info!("HTTP fallback disabled (no http_base_url)");
            Arc::new(DisabledFallback)
        }
    };
    let fallback = FallbackDispatcher::new(api, fallback_tx);

    let client = app::Client::new(
        app::ClientSettings::from_config(&config),
        db,
        connection,
        fallback,
        Arc::new(SystemClock),
    );

    // 6. Spawn the event loop, resuming the last match if there was one
    if let Some(match_id) = resume {
        info!("Resuming match {}", match_id);
        cmd_tx
            .send(UserCommand::Join(match_id))
            .await
            .context("event loop channel closed before start")?;
    }
    let app_handle = tokio::spawn(async move {
        if let Err(e) = app::run(transport_rx, fallback_rx, cmd_rx, notice_tx, client).await {
            error!("Client loop error: {}", e);
        }
    });

    // 7. Run the console (blocking until the user quits)
    if let Err(e) = console::run(notice_rx, cmd_tx).await {
        error!("Console error: {}", e);
    }

    // 8. Cleanup: wait for the event loop to finish (with timeout)
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let _ = app_handle.await;
    })
    .await;

    info!("Quiz client shut down cleanly");
    Ok(())
}

/// Initialize tracing to log to a file (not the terminal, which the console uses).
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("quizlink.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("quizlink=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
