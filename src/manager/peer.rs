use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::bencoding::Value;
use crate::torrent_protocol::wire_protocol::{
    BlockRequest, Message, Protocol, ProtocolReadHalf, ProtocolWriteHalf,
};
use crate::util::{force_string, pretty_info_hash, version_string};

pub const UT_PEX_EXTENSION_ID: i64 = 1;
pub const MAX_OUTSTANDING_INCOMING_PIECE_BLOCK_REQUESTS_PER_PEER: i64 = 250;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const CANCELLATION_RETENTION: Duration = Duration::from_secs(120);
const PEER_NO_INBOUND_TRAFFIC_FAILURE_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug)]
pub enum ToPeerMsg {
    Send(Message),
    Disconnect(),
}

pub type PeerAddr = String;

#[derive(Debug)]
pub enum PeersToManagerMsg {
    Error(PeerAddr, PeerError),
    Receive(PeerAddr, Message),
    NewPeer(TcpStream),
}

#[derive(PartialEq, Debug)]
pub enum PeerError {
    HandshakeError,
    Timeout,
    Others,
}

pub type ToPeerCancelMsg = (BlockRequest, SystemTime); // block request, cancel time

pub async fn connect_to_new_peer(
    host: String,
    port: u16,
    info_hash: [u8; 20],
    own_peer_id: String,
    piece_completion_status: Vec<bool>,
    peers_to_manager_tx: Sender<PeersToManagerMsg>,
) {
    let dest = format!("{host}:{port}");
    log::trace!("initiating connection to peer: {dest}");
    let tcp_stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(dest.clone())).await {
        Err(_elapsed) => {
            log::trace!("timed out connecting to peer {dest}");
            send_to_manager(
                &peers_to_manager_tx,
                PeersToManagerMsg::Error(dest, PeerError::HandshakeError),
            )
            .await;
            return;
        }
        Ok(Err(e)) => {
            log::trace!("error initiating connection to peer {dest}: {e}");
            send_to_manager(
                &peers_to_manager_tx,
                PeersToManagerMsg::Error(dest, PeerError::HandshakeError),
            )
            .await;
            return;
        }
        Ok(Ok(tcp_stream)) => tcp_stream,
    };

    match timeout(
        HANDSHAKE_TIMEOUT,
        handshake(tcp_stream, info_hash, own_peer_id, piece_completion_status),
    )
    .await
    {
        Err(_elapsed) => {
            log::trace!("timed out completing handshake with peer {dest}");
            send_to_manager(
                &peers_to_manager_tx,
                PeersToManagerMsg::Error(dest, PeerError::HandshakeError),
            )
            .await;
        }
        Ok(Err(e)) => {
            log::trace!("error completing handshake with peer {dest}: {e}");
            send_to_manager(
                &peers_to_manager_tx,
                PeersToManagerMsg::Error(dest, PeerError::HandshakeError),
            )
            .await;
        }
        Ok(Ok(tcp_stream)) => {
            send_to_manager(&peers_to_manager_tx, PeersToManagerMsg::NewPeer(tcp_stream)).await;
        }
    }
}

pub async fn run_new_incoming_peers_handler(
    info_hash: [u8; 20],
    own_peer_id: String,
    listening_port: u16,
    piece_completion_status: Vec<bool>,
    mut ok_to_accept_connection_rx: Receiver<bool>,
    mut piece_completion_status_rx: Receiver<Vec<bool>>,
    peers_to_manager_tx: Sender<PeersToManagerMsg>,
) {
    let ok_to_accept_connection_for_rcv: Arc<Mutex<bool>> = Arc::new(Mutex::new(true));
    let ok_to_accept_connection = ok_to_accept_connection_for_rcv.clone();
    tokio::spawn(async move {
        while let Some(msg) = ok_to_accept_connection_rx.recv().await {
            log::trace!("got message to accept/refuse new incoming connections: {msg}");
            *ok_to_accept_connection_for_rcv.lock().await = msg;
        }
    });

    let piece_completion_status_for_rcv: Arc<Mutex<Vec<bool>>> =
        Arc::new(Mutex::new(piece_completion_status));
    let piece_completion_status = piece_completion_status_for_rcv.clone();
    tokio::spawn(async move {
        while let Some(msg) = piece_completion_status_rx.recv().await {
            log::trace!("got message to update piece_completion_status");
            *piece_completion_status_for_rcv.lock().await = msg;
        }
    });

    let incoming_connection_listener =
        match TcpListener::bind(format!("0.0.0.0:{listening_port}")).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!(
                    "could not bind port {listening_port} for incoming peer connections, \
                     the swarm will be outbound-only: {e}"
                );
                return;
            }
        };

    tokio::spawn(async move {
        loop {
            log::trace!("waiting for incoming peer connections...");
            // never timeout on accept, wait forever if needed
            let mut stream = match incoming_connection_listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    continue;
                }
            };
            if !*ok_to_accept_connection.lock().await {
                log::trace!(
                    "reached the limit of incoming connections, shutting down new connection from: {}",
                    addr_or_unknown(&stream)
                );
                _ = stream.shutdown().await;
                continue;
            }

            let pcs_for_spawn = piece_completion_status.clone();
            let own_peer_id_for_spawn = own_peer_id.clone();
            let peers_to_manager_tx_for_spawn = peers_to_manager_tx.clone();
            tokio::spawn(async move {
                let pcs = pcs_for_spawn.lock().await.clone();
                let remote_addr = addr_or_unknown(&stream);
                match timeout(
                    HANDSHAKE_TIMEOUT,
                    handshake(stream, info_hash, own_peer_id_for_spawn, pcs),
                )
                .await
                {
                    Err(_elapsed) => {
                        log::trace!("handshake timeout with peer {remote_addr}");
                    }
                    Ok(Err(e)) => {
                        log::trace!("handshake failed with peer {remote_addr}: {e}");
                    }
                    Ok(Ok(tcp_stream)) => {
                        send_to_manager(
                            &peers_to_manager_tx_for_spawn,
                            PeersToManagerMsg::NewPeer(tcp_stream),
                        )
                        .await;
                    }
                }
            });
        }
    });
}

fn addr_or_unknown(stream: &TcpStream) -> String {
    match stream.peer_addr() {
        Ok(s) => s.to_string(),
        Err(_) => "<unknown>".to_string(),
    }
}

pub fn start_peer_msg_handlers(
    peer_addr: String,
    tcp_stream: TcpStream,
    peers_to_manager_tx: Sender<PeersToManagerMsg>,
    to_peer_rx: Receiver<ToPeerMsg>,
    to_peer_cancel_rx: Receiver<ToPeerCancelMsg>,
) {
    let peers_to_manager_tx_for_snd_message_handler = peers_to_manager_tx.clone();
    let (read, write) = tokio::io::split(tcp_stream);
    let mut rcv = tokio::spawn(rcv_message_handler(
        peer_addr.clone(),
        peers_to_manager_tx,
        read,
    ));
    let mut snd = tokio::spawn(snd_message_handler(
        peer_addr.clone(),
        to_peer_rx,
        peers_to_manager_tx_for_snd_message_handler,
        write,
        to_peer_cancel_rx,
    ));
    tokio::spawn(async move {
        tokio::select! {
            _ = &mut rcv => snd.abort(), // the read half is gone, drop the write half too, avoiding connection leaks
            _ = &mut snd => rcv.abort(), // vice-versa
        }
    });
}

async fn handshake(
    mut stream: TcpStream,
    info_hash: [u8; 20],
    own_peer_id: String,
    piece_completion_status: Vec<bool>,
) -> Result<TcpStream> {
    let (peer_protocol, reserved, peer_info_hash, peer_id) = stream
        .handshake(info_hash, own_peer_id.as_bytes().try_into()?)
        .await?;
    log::trace!(
        "received handshake info from {}: peer protocol: {peer_protocol}, info_hash: {}, peer_id: {}, reserved: {reserved:?}",
        addr_or_unknown(&stream),
        pretty_info_hash(peer_info_hash),
        force_string(&peer_id),
    );
    if peer_info_hash != info_hash {
        log::debug!(
            "handshake errored: the info hash received during handshake does not match the one we serve (ours: {}, theirs: {})",
            pretty_info_hash(info_hash),
            pretty_info_hash(peer_info_hash)
        );
        bail!("own and their info hash did not match");
    }

    let peer_addr = addr_or_unknown(&stream);
    let (read, mut write) = tokio::io::split(stream);

    write
        .send(Message::Bitfield(piece_completion_status))
        .await?;
    log::trace!("bitfield sent to peer {peer_addr}");

    // if the peer supports the extension protocol, advertise our pex id
    if reserved[5] & 0x10 != 0 {
        let handshake_dict = HashMap::from([
            (
                b"m".to_vec(),
                Value::Dict(
                    HashMap::from([(b"ut_pex".to_vec(), Value::Int(UT_PEX_EXTENSION_ID))]),
                    0,
                    0,
                ),
            ),
            (
                b"reqq".to_vec(),
                Value::Int(MAX_OUTSTANDING_INCOMING_PIECE_BLOCK_REQUESTS_PER_PEER),
            ),
            (b"v".to_vec(), Value::Str(version_string().into_bytes())),
        ]);
        write
            .send(Message::Extended(0, Value::Dict(handshake_dict, 0, 0), Vec::new()))
            .await?;
        log::trace!("extension handshake sent to peer {peer_addr}");
    }

    let stream = read.unsplit(write);

    // handshake completed successfully
    Ok(stream)
}

async fn rcv_message_handler<T: ProtocolReadHalf + 'static>(
    peer_addr: String,
    peers_to_manager_tx: Sender<PeersToManagerMsg>,
    mut wire_proto: T,
) {
    loop {
        match timeout(PEER_NO_INBOUND_TRAFFIC_FAILURE_TIMEOUT, wire_proto.receive()).await {
            Err(_elapsed) => {
                log::trace!(
                    "did not receive anything (not even keep-alive messages) from peer {peer_addr} in {PEER_NO_INBOUND_TRAFFIC_FAILURE_TIMEOUT:#?}"
                );
                send_to_manager(
                    &peers_to_manager_tx,
                    PeersToManagerMsg::Error(peer_addr, PeerError::Timeout),
                )
                .await;
                break;
            }
            Ok(Err(e)) => {
                log::trace!("receive failed with peer {peer_addr}: {e}");
                send_to_manager(
                    &peers_to_manager_tx,
                    PeersToManagerMsg::Error(peer_addr, PeerError::Others),
                )
                .await;
                break;
            }
            Ok(Ok(proto_msg)) => {
                log::trace!("received from {peer_addr}: {proto_msg}");
                send_to_manager(
                    &peers_to_manager_tx,
                    PeersToManagerMsg::Receive(peer_addr.clone(), proto_msg),
                )
                .await;
            }
        }
    }
}

async fn snd_message_handler<T: ProtocolWriteHalf + 'static>(
    peer_addr: String,
    mut to_peer_rx: Receiver<ToPeerMsg>,
    peers_to_manager_tx: Sender<PeersToManagerMsg>,
    mut wire_proto: T,
    mut to_peer_cancel_rx: Receiver<ToPeerCancelMsg>,
) {
    let mut cancellations = HashMap::<BlockRequest, SystemTime>::new();
    while let Some(manager_msg) = to_peer_rx.recv().await {
        match manager_msg {
            ToPeerMsg::Send(proto_msg) => {
                // avoid sending data the peer has canceled in the meantime
                if let Message::Piece(piece_idx, begin, data) = &proto_msg {
                    while let Ok((block_request, cancel_time)) = to_peer_cancel_rx.try_recv() {
                        cancellations.insert(block_request, cancel_time);
                    }
                    cancellations.retain(|_, cancel_time| {
                        SystemTime::now()
                            .duration_since(*cancel_time)
                            .unwrap_or_default()
                            < CANCELLATION_RETENTION
                    });
                    let block_request = BlockRequest {
                        piece_idx: *piece_idx,
                        block_begin: *begin,
                        data_len: data.len() as u32,
                    };
                    if cancellations.remove(&block_request).is_some() {
                        log::trace!(
                            "avoided sending canceled block to peer {peer_addr} (piece_idx: {piece_idx}, begin: {begin}, len: {})",
                            data.len()
                        );
                        continue;
                    }
                }

                log::trace!("sending message {proto_msg} to peer {peer_addr}");
                match timeout(SEND_TIMEOUT, wire_proto.send(proto_msg)).await {
                    Err(_elapsed) => {
                        log::trace!("timeout sending message to peer {peer_addr}");
                        send_to_manager(
                            &peers_to_manager_tx,
                            PeersToManagerMsg::Error(peer_addr.clone(), PeerError::Others),
                        )
                        .await;
                        break;
                    }
                    Ok(Err(e)) => {
                        log::trace!("sending failed to peer {peer_addr}: {e}");
                        send_to_manager(
                            &peers_to_manager_tx,
                            PeersToManagerMsg::Error(peer_addr.clone(), PeerError::Others),
                        )
                        .await;
                        break;
                    }
                    Ok(Ok(_)) => {}
                }
            }
            ToPeerMsg::Disconnect() => {
                break;
            }
        }
    }
}

async fn send_to_manager(peers_to_manager_tx: &Sender<PeersToManagerMsg>, msg: PeersToManagerMsg) {
    if peers_to_manager_tx.capacity() <= 5 {
        log::warn!(
            "low peers_to_manager_tx capacity: {}",
            peers_to_manager_tx.capacity()
        );
    }
    // ignore errors here: the manager can drop this peer due to errors in the
    // rcv handler while the snd handler is still sending messages, or vice versa
    _ = peers_to_manager_tx.send(msg).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn connecting_to_a_peer_on_a_different_swarm_fails_the_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // a remote serving some other torrent
            let _ = stream
                .handshake([0xee; 20], *b"-UW0001-000000000009")
                .await;
        });

        let (tx, mut rx) = mpsc::channel(16);
        connect_to_new_peer(
            "127.0.0.1".to_string(),
            addr.port(),
            [0x11; 20],
            "-UW0001-000000000001".to_string(),
            vec![false; 4],
            tx,
        )
        .await;

        match rx.recv().await {
            Some(PeersToManagerMsg::Error(peer_addr, PeerError::HandshakeError)) => {
                assert_eq!(peer_addr, format!("127.0.0.1:{}", addr.port()));
            }
            Some(PeersToManagerMsg::NewPeer(_)) => panic!("the session must not be established"),
            other => panic!(
                "expected a handshake error, got {}",
                match other {
                    Some(PeersToManagerMsg::Receive(_, m)) => format!("a message: {m}"),
                    _ => "nothing".to_string(),
                }
            ),
        }
    }

    #[tokio::test]
    async fn outbound_connect_to_a_dead_port_reports_a_handshake_error() {
        // bind and drop a listener so the port is closed
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::channel(16);
        connect_to_new_peer(
            "127.0.0.1".to_string(),
            addr.port(),
            [0x11; 20],
            "-UW0001-000000000001".to_string(),
            vec![false; 4],
            tx,
        )
        .await;

        assert_matches!(
            rx.recv().await,
            Some(PeersToManagerMsg::Error(_, PeerError::HandshakeError))
        );
    }
}
