//! Local transport: TCP server (incoming), TCP client (outbound to
//! discovered peers), handshake + encrypted frames.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use peerio_core::identity::{decrypt_wire, derive_session_key, encrypt_wire, PublicKey};
use peerio_core::session::{Event, Outbound, PeerSession, Step};
use peerio_core::{Keypair, PeerId, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const HANDSHAKE_SIZE: usize = 1 + 16 + 32; // version + peer_id + public_key
const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Write half of each live connection, keyed by peer.
pub type PeerSenders = Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<Vec<u8>>>>>;

/// Route a session step: events to the pump queue, frames to the matching
/// connection. Frames for peers with no live connection are dropped and
/// logged; sends are fire-and-forget.
pub async fn dispatch(
    step: Step,
    event_tx: &mpsc::UnboundedSender<Event>,
    peer_senders: &PeerSenders,
) {
    for event in step.events {
        let _ = event_tx.send(event);
    }
    if step.outbound.is_empty() {
        return;
    }
    let senders = peer_senders.lock().await;
    for Outbound::Frame { to, bytes } in step.outbound {
        match senders.get(&to) {
            Some(tx) => {
                if tx.send(bytes).is_err() {
                    warn!(peer = %to, "connection writer gone; frame dropped");
                }
            }
            None => debug!(peer = %to, "no live connection; frame dropped"),
        }
    }
}

/// Run transport: listen for incoming TCP and handshake; connect outbound
/// when discovery pushes a peer into `connect_rx`; tick the session once a
/// second.
pub async fn run_transport(
    session: Arc<Mutex<PeerSession>>,
    keypair: Arc<Keypair>,
    transport_port: u16,
    mut connect_rx: mpsc::UnboundedReceiver<(PeerId, SocketAddr)>,
    peer_senders: PeerSenders,
    event_tx: mpsc::UnboundedSender<Event>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", transport_port)).await?;
    info!(port = transport_port, "transport listening");

    let tick_session = session.clone();
    let tick_senders = peer_senders.clone();
    let tick_event_tx = event_tx.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            let step = tick_session.lock().await.tick();
            dispatch(step, &tick_event_tx, &tick_senders).await;
        }
    });

    let accept_session = session.clone();
    let accept_keypair = keypair.clone();
    let accept_senders = peer_senders.clone();
    let accept_event_tx = event_tx.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut stream, from)) => {
                    let session = accept_session.clone();
                    let keypair = accept_keypair.clone();
                    let senders = accept_senders.clone();
                    let event_tx = accept_event_tx.clone();
                    tokio::spawn(async move {
                        match handshake_accept(&mut stream, keypair.as_ref()).await {
                            Ok((peer_id, session_key)) => {
                                run_connection(
                                    stream,
                                    peer_id,
                                    session_key,
                                    session,
                                    senders,
                                    event_tx,
                                )
                                .await;
                            }
                            Err(e) => warn!(%from, error = %e, "inbound handshake failed"),
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed; transport stopping");
                    break;
                }
            }
        }
    });

    while let Some((peer_id, addr)) = connect_rx.recv().await {
        if peer_senders.lock().await.contains_key(&peer_id) {
            continue;
        }
        let session = session.clone();
        let keypair = keypair.clone();
        let senders = peer_senders.clone();
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            match TcpStream::connect(addr).await {
                Ok(mut stream) => match handshake_connect(&mut stream, keypair.as_ref()).await {
                    Ok((peer_id, session_key)) => {
                        run_connection(stream, peer_id, session_key, session, senders, event_tx)
                            .await;
                    }
                    Err(e) => {
                        warn!(peer = %peer_id, error = %e, "outbound handshake failed");
                        let step = session.lock().await.on_peer_lost(peer_id);
                        dispatch(step, &event_tx, &senders).await;
                    }
                },
                Err(e) => {
                    warn!(peer = %peer_id, %addr, error = %e, "connect failed");
                    let step = session.lock().await.on_peer_lost(peer_id);
                    dispatch(step, &event_tx, &senders).await;
                }
            }
        });
    }
    Ok(())
}

async fn handshake_accept(
    stream: &mut TcpStream,
    keypair: &Keypair,
) -> std::io::Result<(PeerId, [u8; 32])> {
    let (mut r, mut w) = stream.split();
    let mut buf = [0u8; HANDSHAKE_SIZE];
    r.read_exact(&mut buf).await?;
    let (peer_id, session_key) = parse_handshake(&buf, keypair)?;
    w.write_all(&handshake_bytes(keypair)).await?;
    w.flush().await?;
    Ok((peer_id, session_key))
}

async fn handshake_connect(
    stream: &mut TcpStream,
    keypair: &Keypair,
) -> std::io::Result<(PeerId, [u8; 32])> {
    let (mut r, mut w) = stream.split();
    w.write_all(&handshake_bytes(keypair)).await?;
    w.flush().await?;
    let mut buf = [0u8; HANDSHAKE_SIZE];
    r.read_exact(&mut buf).await?;
    parse_handshake(&buf, keypair)
}

fn parse_handshake(
    buf: &[u8; HANDSHAKE_SIZE],
    keypair: &Keypair,
) -> std::io::Result<(PeerId, [u8; 32])> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    let mut peer_id = [0u8; 16];
    peer_id.copy_from_slice(&buf[1..17]);
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&buf[17..49]);
    let peer_public = PublicKey::from_bytes(public_key);
    let secret = keypair.shared_secret(&peer_public);
    Ok((PeerId::from_bytes(peer_id), derive_session_key(&secret)))
}

fn handshake_bytes(keypair: &Keypair) -> [u8; HANDSHAKE_SIZE] {
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..17].copy_from_slice(keypair.peer_id().as_bytes());
    out[17..49].copy_from_slice(keypair.public_key().as_bytes());
    out
}

async fn run_connection(
    stream: TcpStream,
    peer_id: PeerId,
    session_key: [u8; 32],
    session: Arc<Mutex<PeerSession>>,
    peer_senders: PeerSenders,
    event_tx: mpsc::UnboundedSender<Event>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    peer_senders.lock().await.insert(peer_id, tx);

    let step = session.lock().await.on_peer_connected(peer_id);
    dispatch(step, &event_tx, &peer_senders).await;
    info!(peer = %peer_id, "peer connected");

    let (mut reader, mut writer) = stream.into_split();
    let writer_key = session_key;
    tokio::spawn(async move {
        let mut write_nonce: u64 = 0;
        while let Some(plain) = rx.recv().await {
            match encrypt_wire(&writer_key, write_nonce, &plain) {
                Ok(cipher) => {
                    write_nonce = write_nonce.saturating_add(1);
                    let len = cipher.len() as u32;
                    if writer.write_all(&len.to_le_bytes()).await.is_err()
                        || writer.write_all(&cipher).await.is_err()
                        || writer.flush().await.is_err()
                    {
                        warn!(peer = %peer_id, "send failed; dropping frame");
                        break;
                    }
                }
                Err(e) => warn!(peer = %peer_id, error = %e, "encrypt failed; dropping frame"),
            }
        }
    });

    let mut read_nonce: u64 = 0;
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        if reader.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN as usize {
            warn!(peer = %peer_id, len, "oversized frame; closing connection");
            break;
        }
        let mut cipher = vec![0u8; len];
        if reader.read_exact(&mut cipher).await.is_err() {
            break;
        }
        let plain = match decrypt_wire(&session_key, read_nonce, &cipher) {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "decrypt failed; closing connection");
                break;
            }
        };
        read_nonce = read_nonce.saturating_add(1);
        let step = session.lock().await.on_frame(peer_id, &plain);
        dispatch(step, &event_tx, &peer_senders).await;
    }

    peer_senders.lock().await.remove(&peer_id);
    let step = session.lock().await.on_peer_lost(peer_id);
    dispatch(step, &event_tx, &peer_senders).await;
    info!(peer = %peer_id, "peer disconnected");
}
