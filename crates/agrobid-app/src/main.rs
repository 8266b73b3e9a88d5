// agrobid watcher entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file, stdout is for the console)
// 2. Load config
// 3. Open the REST client and the WebSocket transport
// 4. Spawn the session loop
// 5. Spawn the update printer
// 6. Join the configured auction, if any
// 7. Read commands from stdin until quit or EOF
// 8. Close the transport

use std::sync::Arc;

use agrobid_app::config;
use agrobid_app::console;
use agrobid_app::session::{Session, SessionCommand, SessionTimings};
use agrobid_core::reconciler::Reconciler;
use agrobid_core::transport::{RestClient, WsConfig, WsTransport};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("agrobid starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: ws={}, api={}",
        config.server.ws_url, config.server.api_base_url
    );
    let token = config.credentials.auth_token.clone();

    // 3. Transport
    let (events_tx, events_rx) = mpsc::channel(256);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (update_tx, mut update_rx) = mpsc::channel(256);

    let api = Arc::new(RestClient::new(config.server.api_base_url.clone(), token.clone()));
    let transport = Arc::new(
        WsTransport::open(
            WsConfig {
                url: config.server.ws_url.clone(),
                token,
                policy: config.reconnect.policy(),
            },
            events_tx,
        )
        .context("failed to open real-time connection")?,
    );

    // 4. Session loop
    let session = Session::new(
        transport.clone(),
        api,
        SessionTimings::from(&config.timing),
        Reconciler::new(
            config.reconciler.recent_bids_cap,
            config.reconciler.delta_buffer_cap,
        ),
        update_tx,
    );
    let session_handle = tokio::spawn(async move {
        if let Err(e) = session.run(events_rx, cmd_rx).await {
            error!("Session loop error: {}", e);
        }
    });

    // 5. Print updates as they arrive
    let printer_handle = tokio::spawn(async move {
        while let Some(update) = update_rx.recv().await {
            if let Some(line) = console::render_update(&update) {
                println!("{line}");
            }
        }
    });

    // 6. Auto-join
    if let Some(auction_id) = config.session.startup_auction() {
        info!("Joining auction {} from config", auction_id);
        cmd_tx
            .send(SessionCommand::Join(auction_id))
            .await
            .context("session loop stopped before startup join")?;
    }

    // 7. Commands from stdin
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        match console::parse_command(&line) {
            Ok(Some(cmd)) => {
                let quit = cmd == SessionCommand::Shutdown;
                if cmd_tx.send(cmd).await.is_err() || quit {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => println!("{e}"),
        }
    }
    let _ = cmd_tx.send(SessionCommand::Shutdown).await;

    // 8. Cleanup
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), session_handle).await;
    transport.close().await;
    drop(transport);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), printer_handle).await;

    info!("agrobid shut down cleanly");
    Ok(())
}

/// Initialize tracing to log to a file (stdout carries the console output).
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("agrobid.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("agrobid=info,agrobid_app=info,agrobid_core=info,warn")),
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
