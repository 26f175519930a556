//! LAN discovery: UDP multicast beacons, answer browsing peers, hand new
//! sightings to the transport for an outbound connect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use peerio_core::session::{Event, PeerSession};
use peerio_core::wire::{decode_frame, encode_frame};
use peerio_core::{Message, PeerId, PROTOCOL_VERSION, SERVICE_TAG};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::transport::{dispatch, PeerSenders};

const MULTICAST_GROUP: &str = "239.255.77.77";
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

struct Sighting {
    addr: SocketAddr,
    last_seen: Instant,
}

pub async fn run_discovery(
    session: Arc<Mutex<PeerSession>>,
    discovery_port: u16,
    transport_port: u16,
    connect_tx: mpsc::UnboundedSender<(PeerId, SocketAddr)>,
    event_tx: mpsc::UnboundedSender<Event>,
    peer_senders: PeerSenders,
) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port).await?);
    let sightings: Arc<Mutex<HashMap<PeerId, Sighting>>> = Arc::new(Mutex::new(HashMap::new()));

    let (beacon_frame, response_frame) = {
        let s = session.lock().await;
        let beacon = encode_frame(&s.beacon(transport_port))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let response = encode_frame(&s.discovery_response(transport_port))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        (beacon, response)
    };
    info!(port = discovery_port, group = MULTICAST_GROUP, "discovery running");

    let send_socket = socket.clone();
    let beacon_task = tokio::spawn(async move {
        beacon_loop(send_socket, beacon_frame, discovery_port).await
    });

    let recv_socket = socket.clone();
    let recv_sightings = sightings.clone();
    let recv_session = session.clone();
    let recv_senders = peer_senders.clone();
    let recv_event_tx = event_tx.clone();
    let recv_task = tokio::spawn(async move {
        recv_loop(
            recv_socket,
            recv_sightings,
            recv_session,
            response_frame,
            connect_tx,
            recv_event_tx,
            recv_senders,
        )
        .await
    });

    let timeout_task =
        tokio::spawn(async move { timeout_loop(sightings, session, event_tx, peer_senders).await });

    let _ = tokio::try_join!(beacon_task, recv_task, timeout_task);
    Ok(())
}

async fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", discovery_port))?;
    let multicast: std::net::Ipv4Addr =
        MULTICAST_GROUP
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
            })?;
    std_sock.join_multicast_v4(&multicast, &std::net::Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    beacon_frame: Vec<u8>,
    discovery_port: u16,
) -> std::io::Result<()> {
    let dest: SocketAddr = format!("{MULTICAST_GROUP}:{discovery_port}")
        .parse()
        .map_err(|e: std::net::AddrParseError| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        })?;
    loop {
        if let Err(e) = socket.send_to(&beacon_frame, dest).await {
            warn!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn recv_loop(
    socket: Arc<UdpSocket>,
    sightings: Arc<Mutex<HashMap<PeerId, Sighting>>>,
    session: Arc<Mutex<PeerSession>>,
    response_frame: Vec<u8>,
    connect_tx: mpsc::UnboundedSender<(PeerId, SocketAddr)>,
    event_tx: mpsc::UnboundedSender<Event>,
    peer_senders: PeerSenders,
) -> std::io::Result<()> {
    let my_id = session.lock().await.peer_id();
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Ok((msg, _)) = decode_frame(&buf[..n]) else {
            continue;
        };
        let (is_beacon, fields) = match msg {
            Message::Beacon {
                protocol_version,
                service_tag,
                peer_id,
                public_key,
                display_name,
                listen_port,
                ..
            } => (
                true,
                (protocol_version, service_tag, peer_id, public_key, display_name, listen_port),
            ),
            Message::DiscoveryResponse {
                protocol_version,
                service_tag,
                peer_id,
                public_key,
                display_name,
                listen_port,
                ..
            } => (
                false,
                (protocol_version, service_tag, peer_id, public_key, display_name, listen_port),
            ),
            _ => continue,
        };
        let (protocol_version, service_tag, peer_id, public_key, display_name, listen_port) =
            fields;
        if protocol_version != PROTOCOL_VERSION || service_tag != SERVICE_TAG || peer_id == my_id {
            continue;
        }
        let addr = SocketAddr::new(from.ip(), listen_port);
        let is_new = record_sighting(&sightings, peer_id, addr).await;
        if is_new {
            debug!(peer = %peer_id, name = %display_name, %addr, "peer discovered");
            let step = session
                .lock()
                .await
                .on_peer_discovered(peer_id, &display_name, &public_key);
            dispatch(step, &event_tx, &peer_senders).await;
            let _ = connect_tx.send((peer_id, addr));
        }
        if is_beacon {
            if let Err(e) = socket.send_to(&response_frame, from).await {
                warn!(error = %e, "discovery response send failed");
            }
        }
    }
}

async fn record_sighting(
    sightings: &Arc<Mutex<HashMap<PeerId, Sighting>>>,
    peer_id: PeerId,
    addr: SocketAddr,
) -> bool {
    let mut map = sightings.lock().await;
    let is_new = !map.contains_key(&peer_id);
    map.insert(
        peer_id,
        Sighting {
            addr,
            last_seen: Instant::now(),
        },
    );
    is_new
}

async fn timeout_loop(
    sightings: Arc<Mutex<HashMap<PeerId, Sighting>>>,
    session: Arc<Mutex<PeerSession>>,
    event_tx: mpsc::UnboundedSender<Event>,
    peer_senders: PeerSenders,
) -> std::io::Result<()> {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        let now = Instant::now();
        let expired: Vec<(PeerId, SocketAddr)> = {
            let mut map = sightings.lock().await;
            let gone: Vec<PeerId> = map
                .iter()
                .filter(|(_, s)| now.duration_since(s.last_seen) >= PEER_TIMEOUT)
                .map(|(&id, _)| id)
                .collect();
            gone.iter()
                .filter_map(|id| map.remove(id).map(|s| (*id, s.addr)))
                .collect()
        };
        for (peer_id, addr) in expired {
            debug!(peer = %peer_id, %addr, "beacon silence; peer expired");
            let step = session.lock().await.on_peer_lost(peer_id);
            dispatch(step, &event_tx, &peer_senders).await;
        }
    }
}
