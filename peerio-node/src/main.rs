// peer-io node: discovery, transport and handler pump daemon. Lines read
// from stdin are sent as text to all connected peers.

mod config;
mod discovery;
mod events;
mod transport;

use std::sync::Arc;

use peerio_core::session::PeerSession;
use peerio_core::Keypair;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("peerio-node {VERSION}");
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let keypair = Arc::new(Keypair::generate());
    let session = Arc::new(Mutex::new(PeerSession::with_keypair(
        keypair.clone(),
        cfg.display_name.clone().unwrap_or_default(),
    )));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        let peer_senders: transport::PeerSenders = Arc::new(Mutex::new(Default::default()));

        {
            let s = session.lock().await;
            info!(peer = %s.peer_id(), name = s.display_name(), "session ready");
        }

        let handlers = Arc::new(Mutex::new(make_handlers()));
        tokio::spawn(events::run_pump(event_rx, handlers.clone()));

        let disc_session = session.clone();
        let disc_event_tx = event_tx.clone();
        let disc_senders = peer_senders.clone();
        let disc_port = cfg.discovery_port;
        let transport_port = cfg.transport_port;
        tokio::spawn(async move {
            if let Err(e) = discovery::run_discovery(
                disc_session,
                disc_port,
                transport_port,
                connect_tx,
                disc_event_tx,
                disc_senders,
            )
            .await
            {
                warn!(error = %e, "discovery stopped");
            }
        });

        let trans_session = session.clone();
        let trans_keypair = keypair.clone();
        let trans_senders = peer_senders.clone();
        let trans_event_tx = event_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = transport::run_transport(
                trans_session,
                trans_keypair,
                transport_port,
                connect_rx,
                trans_senders,
                trans_event_tx,
            )
            .await
            {
                warn!(error = %e, "transport stopped");
            }
        });

        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        let mut stdin_open = true;
        loop {
            tokio::select! {
                res = &mut shutdown => {
                    res?;
                    break;
                }
                line = lines.next_line(), if stdin_open => {
                    match line {
                        Ok(Some(line)) if !line.is_empty() => {
                            handlers.lock().await.set_send_callback(|| info!("delivered"));
                            let step = session.lock().await.send_text(&line);
                            if step.outbound.is_empty() {
                                info!("no connected peers; message not sent");
                            }
                            transport::dispatch(step, &event_tx, &peer_senders).await;
                        }
                        Ok(Some(_)) => {}
                        // stdin closed; keep the daemon running headless.
                        Ok(None) | Err(_) => stdin_open = false,
                    }
                }
            }
        }

        // Tell peers we are leaving before the process exits.
        let step = session.lock().await.send_disconnect();
        transport::dispatch(step, &event_tx, &peer_senders).await;
        info!("shutting down");
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}

fn make_handlers() -> events::Handlers {
    let mut handlers = events::Handlers::new();
    handlers.on_text = Some(Box::new(|body| info!(%body, "message")));
    handlers.on_image = Some(Box::new(|bytes| info!(len = bytes.len(), "image")));
    handlers.on_peer_state =
        Some(Box::new(|state, name| info!(peer = %name, %state, "peer state")));
    handlers.on_disconnect = Some(Box::new(|| info!("peer requested disconnect")));
    handlers
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<(), anyhow::Error> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
