use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail, Result};
use rand::seq::IndexedRandom;
use rand::Rng;
use size::Size;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::bencoding::Value::{self, Dict, Int, Str};
use crate::manager::bandwidth_tracker::BandwidthTracker;
use crate::manager::peer::{
    self, PeerAddr, PeerError, PeersToManagerMsg, ToPeerCancelMsg, ToPeerMsg, UT_PEX_EXTENSION_ID,
};
use crate::manager::piece_scheduler::{BlockOutcome, BlockReject, PieceScheduler};
use crate::metadata::metainfo::Metainfo;
use crate::persistence::file_manager::FileManager;
use crate::torrent_protocol::wire_protocol::Message;
use crate::tracker::{self, Event, NoTrackerError, Response, TrackerClient};
use crate::util::start_tick;
use crate::web_seed::{self, WebSeedError};

// outbound connect budget: drain candidates while below, pause inbound above
const CONNECTED_PEERS_TO_START_NEW_PEER_CONNECTIONS: usize = 50;
const CONNECTED_PEERS_TO_STOP_INCOMING_PEER_CONNECTIONS: usize = 80;
const MAX_INFLIGHT_REQUESTS_PER_PEER: usize = 16;
const MAX_SERVED_BLOCK_SIZE: u64 = 128 * 1024;
const KEEP_ALIVE_FREQ: Duration = Duration::from_secs(90);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const NEW_CONNECTION_COOL_OFF_PERIOD: Duration = Duration::from_secs(180);
const TRACKER_RETRY_BACKOFF: Duration = Duration::from_secs(30);
const CHOKE_REVIEW_PERIOD: Duration = Duration::from_secs(10);
const OPTIMISTIC_UNCHOKE_PERIOD: Duration = Duration::from_secs(30);
const UNCHOKE_SLOTS: usize = 3;
const ADDED_DROPPED_PEER_EVENTS_RETENTION: Duration = Duration::from_secs(90);
const PEX_MESSAGE_COOL_OFF_PERIOD: Duration = Duration::from_secs(60);
const MAX_CONSECUTIVE_STORAGE_FAILURES: u32 = 3;
const TO_PEER_CHANNEL_CAPACITY: usize = 256;
const TO_PEER_CANCEL_CHANNEL_CAPACITY: usize = 64;
const PEERS_TO_MANAGER_CHANNEL_CAPACITY: usize = 4096;
const WEB_SEED_CHANNEL_CAPACITY: usize = 4;

pub struct Peer {
    peer_addr: PeerAddr,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    haves: Vec<bool>,
    to_peer_tx: Sender<ToPeerMsg>,
    to_peer_cancel_tx: Sender<ToPeerCancelMsg>,
    last_sent: SystemTime, // to understand when to send keep-alive messages
    ut_pex_id: u8,         // 0 means the peer does not support pex
    last_pex_message_sent: SystemTime,
    bandwidth: BandwidthTracker,
}

impl Peer {
    fn new(
        peer_addr: PeerAddr,
        num_pieces: usize,
        to_peer_tx: Sender<ToPeerMsg>,
        to_peer_cancel_tx: Sender<ToPeerCancelMsg>,
    ) -> Self {
        Peer {
            peer_addr,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            haves: vec![false; num_pieces],
            to_peer_tx,
            to_peer_cancel_tx,
            last_sent: SystemTime::now(), // no need for a keep-alive right after the handshake
            ut_pex_id: 0,
            last_pex_message_sent: SystemTime::UNIX_EPOCH,
            bandwidth: BandwidthTracker::new(),
        }
    }

    async fn send(&mut self, msg: ToPeerMsg) {
        if self.to_peer_tx.capacity() <= 5 {
            log::warn!("low to_peer_tx capacity: {}", self.to_peer_tx.capacity());
        }
        self.last_sent = SystemTime::now();
        // ignore errors: the channel can be closed on the other side if the
        // handler loop exited on a network error while the peer still lingers
        // here because the error message has not been handled yet
        let _ = self.to_peer_tx.send(msg).await;
    }

    fn supports_pex(&self) -> bool {
        self.ut_pex_id != 0
    }

    async fn send_pex_message(&mut self, added: Vec<PeerAddr>, dropped: Vec<PeerAddr>) {
        let mut h = HashMap::new();
        if !added.is_empty() {
            h.insert(b"added".to_vec(), Str(ip_port_list_to_compact_format(&added)));
        }
        if !dropped.is_empty() {
            h.insert(
                b"dropped".to_vec(),
                Str(ip_port_list_to_compact_format(&dropped)),
            );
        }
        self.last_pex_message_sent = SystemTime::now();
        if !h.is_empty() {
            let pex_msg = Message::Extended(self.ut_pex_id, Dict(h, 0, 0), Vec::new());
            log::trace!("sending pex message to peer {}: {pex_msg}", self.peer_addr);
            self.send(ToPeerMsg::Send(pex_msg)).await;
        }
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum PexEvent {
    Added,
    Dropped,
}

pub struct SwarmManager {
    file_manager: FileManager,
    scheduler: PieceScheduler,
    payload_name: String,
    web_seeds: Vec<String>,
    current_web_seed: usize,
    web_seed_fetch_inflight: bool,
    tracker_client: Arc<Mutex<TrackerClient>>,
    last_tracker_announce_attempt: SystemTime,
    completed_sent_to_tracker: bool,
    info_hash: [u8; 20],
    own_peer_id: String,
    block_size: u64,
    peers: HashMap<PeerAddr, Peer>,
    advertised_peers: Arc<Mutex<HashMap<PeerAddr, (tracker::Peer, SystemTime)>>>, // peer addr -> (peer, last connection attempt)
    bad_peers: HashSet<PeerAddr>,
    bandwidth: BandwidthTracker,
    added_dropped_peer_events: Vec<(SystemTime, PeerAddr, PexEvent)>,
    last_choke_review: SystemTime,
    last_optimistic_rotation: SystemTime,
    optimistic_unchoked: Option<PeerAddr>,
    consecutive_storage_failures: u32,
    download_complete: bool,
    fatal_error: Option<anyhow::Error>,
    listening_port: u16,

    // internal channels; receiver halves are moved out at start
    ok_to_accept_connection_tx: Sender<bool>,
    ok_to_accept_connection_rx: Option<Receiver<bool>>,
    piece_completion_status_tx: Sender<Vec<bool>>,
    piece_completion_status_rx: Option<Receiver<Vec<bool>>>,
    peers_to_manager_tx: Sender<PeersToManagerMsg>,
    peers_to_manager_rx: Receiver<PeersToManagerMsg>,
    web_seed_tx: Sender<(u32, Result<Vec<u8>, WebSeedError>)>,
    web_seed_rx: Option<Receiver<(u32, Result<Vec<u8>, WebSeedError>)>>,
}

impl SwarmManager {
    pub fn new(
        metainfo: &Metainfo,
        base_path: &Path,
        listening_port: u16,
        block_size: u64,
        initial_peers: Vec<String>,
    ) -> Result<Self> {
        if block_size == 0 {
            bail!("block size cannot be zero");
        }
        let mut file_manager = FileManager::new(
            base_path,
            metainfo.get_files(),
            metainfo.piece_length,
            metainfo.pieces.clone(),
        )?;
        file_manager.refresh_completed_pieces();

        let scheduler = PieceScheduler::new(
            metainfo.pieces.clone(),
            metainfo.piece_length,
            file_manager.total_length(),
            block_size,
            &file_manager.piece_completion_status,
        );

        let own_peer_id = generate_peer_id();
        let mut initial_advertised_peers = HashMap::new();
        for peer_addr in initial_peers {
            let Some((host, port)) = peer_addr.rsplit_once(':') else {
                bail!("initial peer {peer_addr} is not in the host:port format");
            };
            let port = port
                .parse::<u16>()
                .map_err(|_| anyhow!("initial peer {peer_addr} has an invalid port"))?;
            let p = tracker::Peer {
                peer_id: None,
                ip: host.to_string(),
                port,
            };
            initial_advertised_peers.insert(peer_addr.clone(), (p, SystemTime::UNIX_EPOCH));
        }

        let (ok_to_accept_connection_tx, ok_to_accept_connection_rx) = mpsc::channel(10);
        let (piece_completion_status_tx, piece_completion_status_rx) = mpsc::channel(100);
        let (peers_to_manager_tx, peers_to_manager_rx) =
            mpsc::channel::<PeersToManagerMsg>(PEERS_TO_MANAGER_CHANNEL_CAPACITY);
        let (web_seed_tx, web_seed_rx) = mpsc::channel(WEB_SEED_CHANNEL_CAPACITY);

        Ok(SwarmManager {
            file_manager,
            scheduler,
            payload_name: metainfo.name().to_string(),
            web_seeds: metainfo.url_list.clone(),
            current_web_seed: 0,
            web_seed_fetch_inflight: false,
            tracker_client: Arc::new(Mutex::new(TrackerClient::new(
                own_peer_id.clone(),
                metainfo.announce_list.clone(),
                listening_port,
            ))),
            last_tracker_announce_attempt: SystemTime::UNIX_EPOCH,
            completed_sent_to_tracker: false,
            info_hash: metainfo.info_hash,
            own_peer_id,
            block_size,
            peers: HashMap::new(),
            advertised_peers: Arc::new(Mutex::new(initial_advertised_peers)),
            bad_peers: HashSet::new(),
            bandwidth: BandwidthTracker::new(),
            added_dropped_peer_events: Vec::new(),
            last_choke_review: SystemTime::UNIX_EPOCH,
            last_optimistic_rotation: SystemTime::UNIX_EPOCH,
            optimistic_unchoked: None,
            consecutive_storage_failures: 0,
            download_complete: false,
            fatal_error: None,
            listening_port,

            ok_to_accept_connection_tx,
            ok_to_accept_connection_rx: Some(ok_to_accept_connection_rx),
            piece_completion_status_tx,
            piece_completion_status_rx: Some(piece_completion_status_rx),
            peers_to_manager_tx,
            peers_to_manager_rx,
            web_seed_tx,
            web_seed_rx: Some(web_seed_rx),
        })
    }

    /// Runs the engine until the payload is fully verified and persisted, the
    /// operator interrupts it, or storage fails for good.
    pub async fn start(&mut self) -> Result<()> {
        let has_usable_tracker = {
            let tracker_client = self
                .tracker_client
                .lock()
                .expect("another user panicked while holding the lock");
            tracker_client
                .trackers_url
                .iter()
                .flatten()
                .any(|url| tracker::is_supported_scheme(url))
        };
        let has_initial_candidates = !self
            .advertised_peers
            .lock()
            .expect("another user panicked while holding the lock")
            .is_empty();
        if !has_usable_tracker && self.web_seeds.is_empty() && !has_initial_candidates {
            bail!("the torrent has no usable tracker (http, https or udp) and no web seed");
        }

        if self.payload_complete() {
            log::info!("the payload is already complete on disk, nothing to download");
            return Ok(());
        }

        // start the incoming peer connections handler
        peer::run_new_incoming_peers_handler(
            self.info_hash,
            self.own_peer_id.clone(),
            self.listening_port,
            self.file_manager.piece_completion_status.clone(),
            self.ok_to_accept_connection_rx
                .take()
                .expect("no ok_to_accept_connection_rx, has start been called twice?"),
            self.piece_completion_status_rx
                .take()
                .expect("no piece_completion_status_rx, has start been called twice?"),
            self.peers_to_manager_tx.clone(),
        )
        .await;

        // start the ticker
        let (tick_tx, tick_rx) = mpsc::channel(1);
        start_tick(tick_tx, Duration::from_secs(1)).await;

        let web_seed_rx = self
            .web_seed_rx
            .take()
            .expect("no web_seed_rx, has start been called twice?");

        self.control_loop(tick_rx, web_seed_rx).await
    }

    pub fn payload_complete(&self) -> bool {
        self.scheduler.is_complete()
    }

    async fn control_loop(
        &mut self,
        mut tick_rx: Receiver<()>,
        mut web_seed_rx: Receiver<(u32, Result<Vec<u8>, WebSeedError>)>,
    ) -> Result<()> {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        loop {
            tokio::select! {
                Some(msg) = self.peers_to_manager_rx.recv() => {
                    match msg {
                        PeersToManagerMsg::Error(peer_addr, error_type) => {
                            self.handle_peer_error(peer_addr, error_type).await;
                        }
                        PeersToManagerMsg::Receive(peer_addr, msg) => {
                            self.handle_receive_message(peer_addr, msg).await;
                        }
                        PeersToManagerMsg::NewPeer(tcp_stream) => {
                            self.handle_new_peer(tcp_stream).await;
                        }
                    }
                }
                Some(()) = tick_rx.recv() => {
                    self.handle_ticker().await;
                }
                Some((piece_idx, result)) = web_seed_rx.recv() => {
                    self.handle_web_seed_result(piece_idx, result).await;
                }
                _ = &mut ctrl_c => {
                    log::info!("shutdown requested, stopping the swarm...");
                    self.announce_inline(Event::Stopped).await;
                    return Ok(());
                }
                else => return Ok(()),
            }
            if let Some(e) = self.fatal_error.take() {
                return Err(e);
            }
            if self.download_complete {
                return Ok(());
            }
        }
    }

    async fn handle_receive_message(&mut self, peer_addr: PeerAddr, msg: Message) {
        log::trace!("received message from peer {peer_addr}: {msg}");
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                if let Some(peer) = self.peers.get_mut(&peer_addr) {
                    peer.peer_choking = true;
                    // a choked peer must not have requests in flight: return
                    // its blocks to the pool right away
                    self.scheduler.cancel_requests(&peer_addr);
                }
            }
            Message::Unchoke => {
                if let Some(peer) = self.peers.get_mut(&peer_addr) {
                    peer.peer_choking = false;
                    self.fill_requests(&peer_addr).await;
                }
            }
            Message::Interested => {
                if let Some(peer) = self.peers.get_mut(&peer_addr) {
                    peer.peer_interested = true;
                }
            }
            Message::NotInterested => {
                if let Some(peer) = self.peers.get_mut(&peer_addr) {
                    peer.peer_interested = false;
                }
            }
            Message::Have(piece_idx) => {
                self.handle_receive_have_message(peer_addr, piece_idx).await;
            }
            Message::Bitfield(bitfield) => {
                self.handle_receive_bitfield_message(peer_addr, bitfield)
                    .await;
            }
            Message::Request(piece_idx, begin, length) => {
                self.handle_receive_request_message(peer_addr, piece_idx, begin, length)
                    .await;
            }
            Message::Piece(piece_idx, begin, data) => {
                self.handle_receive_piece_message(peer_addr, piece_idx, begin, data)
                    .await;
            }
            Message::Cancel(piece_idx, begin, length) => {
                if let Some(peer) = self.peers.get_mut(&peer_addr) {
                    // let the send handler know; if its buffer is full there
                    // were no queued uploads and the cancel has no effect
                    let _ = peer.to_peer_cancel_tx.try_send((
                        crate::torrent_protocol::wire_protocol::BlockRequest {
                            piece_idx,
                            block_begin: begin,
                            data_len: length,
                        },
                        SystemTime::now(),
                    ));
                }
            }
            Message::Extended(extension_id, extended_message, _additional_data) => {
                self.handle_receive_extended_message(peer_addr, extension_id, extended_message)
                    .await;
            }
        }
    }

    async fn handle_receive_have_message(&mut self, peer_addr: PeerAddr, piece_idx: u32) {
        let num_pieces = self.scheduler.num_pieces();
        let Some(peer) = self.peers.get_mut(&peer_addr) else {
            return;
        };
        if piece_idx as usize >= num_pieces {
            log::warn!(
                "got message \"have\" {piece_idx} from peer {peer_addr} but the torrent has only {num_pieces} pieces"
            );
            self.bad_peers.insert(peer_addr.clone());
            self.remove_peer(peer_addr).await;
            return;
        }
        if !peer.haves[piece_idx as usize] {
            peer.haves[piece_idx as usize] = true;
            self.scheduler.peer_has_piece(piece_idx);
        }
        self.update_interest(&peer_addr).await;
        self.fill_requests(&peer_addr).await;
    }

    async fn handle_receive_bitfield_message(&mut self, peer_addr: PeerAddr, bitfield: Vec<bool>) {
        let num_pieces = self.scheduler.num_pieces();
        if bitfield.len() < num_pieces {
            log::warn!(
                "received a wrongly sized bitfield from peer {peer_addr}: {} bits but expected at least {num_pieces}",
                bitfield.len()
            );
            self.bad_peers.insert(peer_addr.clone());
            self.remove_peer(peer_addr).await;
            return;
        }
        let Some(peer) = self.peers.get_mut(&peer_addr) else {
            return;
        };
        // the bitfield is byte aligned and can carry more bits than pieces
        let new_haves = bitfield[0..num_pieces].to_vec();
        self.scheduler.remove_peer_bitfield(&peer.haves);
        self.scheduler.add_peer_bitfield(&new_haves);
        peer.haves = new_haves;
        log::trace!(
            "received bitfield from peer {peer_addr}: it has {}/{} pieces",
            peer.haves.iter().filter(|h| **h).count(),
            num_pieces
        );
        self.update_interest(&peer_addr).await;
        self.fill_requests(&peer_addr).await;
    }

    async fn handle_receive_request_message(
        &mut self,
        peer_addr: PeerAddr,
        piece_idx: u32,
        begin: u32,
        length: u32,
    ) {
        let Some(peer) = self.peers.get_mut(&peer_addr) else {
            return;
        };
        // serve only unchoked peers, verified pieces and sane, in-bounds
        // ranges; anything else is silently dropped
        if peer.am_choking {
            return;
        }
        if !self.scheduler.have_piece(piece_idx) {
            return;
        }
        let piece_len = self.scheduler.piece_length_for(piece_idx);
        if length as u64 > MAX_SERVED_BLOCK_SIZE || begin as u64 + length as u64 > piece_len {
            return;
        }
        match self
            .file_manager
            .read_block(piece_idx as usize, begin as u64, length as u64)
        {
            Err(e) => {
                log::error!("error reading block for peer {peer_addr}: {e}");
            }
            Ok(data) => {
                let data_len = data.len() as u64;
                peer.send(ToPeerMsg::Send(Message::Piece(piece_idx, begin, data)))
                    .await;
                peer.bandwidth.add_uploaded_bytes(data_len);
                self.bandwidth.add_uploaded_bytes(data_len);
            }
        }
    }

    async fn handle_receive_piece_message(
        &mut self,
        peer_addr: PeerAddr,
        piece_idx: u32,
        begin: u32,
        data: Vec<u8>,
    ) {
        let data_len = data.len() as u64;
        match self.scheduler.handle_block(piece_idx, begin, &data) {
            BlockOutcome::Accepted => {
                if let Some(peer) = self.peers.get_mut(&peer_addr) {
                    peer.bandwidth.add_downloaded_bytes(data_len);
                }
                self.bandwidth.add_downloaded_bytes(data_len);
                self.fill_requests(&peer_addr).await;
            }
            BlockOutcome::PieceComplete { piece_idx, data } => {
                if let Some(peer) = self.peers.get_mut(&peer_addr) {
                    peer.bandwidth.add_downloaded_bytes(data_len);
                }
                self.bandwidth.add_downloaded_bytes(data_len);
                self.commit_completed_piece(piece_idx, data).await;
                self.fill_requests(&peer_addr).await;
            }
            BlockOutcome::Rejected(BlockReject::DigestMismatch) => {
                // the delivering session gets closed: it fed us a corrupted piece
                log::warn!("removing peer {peer_addr}: it delivered a corrupted piece");
                self.bad_peers.insert(peer_addr.clone());
                if let Some(peer) = self.peers.get_mut(&peer_addr) {
                    peer.send(ToPeerMsg::Disconnect()).await;
                }
                self.remove_peer(peer_addr).await;
            }
            BlockOutcome::Rejected(reason) => {
                // late or duplicated deliveries are routine after re-requests
                log::trace!("dropped block from {peer_addr} (piece {piece_idx}, begin {begin}): {reason}");
            }
        }
    }

    async fn handle_receive_extended_message(
        &mut self,
        peer_addr: PeerAddr,
        extension_id: u8,
        extended_message: Value,
    ) {
        match extension_id {
            0 => {
                self.handle_receive_extended_handshake(peer_addr, extended_message)
                    .await;
            }
            id if id as i64 == UT_PEX_EXTENSION_ID => {
                self.handle_receive_pex_message(peer_addr, extended_message);
            }
            _ => {
                log::debug!(
                    "got an extension message from {peer_addr} with an id we did not register: {extension_id}"
                );
            }
        }
    }

    async fn handle_receive_extended_handshake(
        &mut self,
        peer_addr: PeerAddr,
        extended_message: Value,
    ) {
        let Dict(extended_message_dict, _, _) = extended_message else {
            log::debug!("got an extension handshake that is not a dict, ignoring it");
            return;
        };
        let Some(Dict(m, _, _)) = extended_message_dict.get(&b"m".to_vec()) else {
            log::debug!(
                "got an extension handshake without an \"m\" dict entry, ignoring it"
            );
            return;
        };

        if let Some(Int(ut_pex_id)) = m.get(&b"ut_pex".to_vec()) {
            let other_active_peers = self
                .peers
                .keys()
                .filter(|k| peer_addr != **k)
                .cloned()
                .collect::<Vec<_>>();
            if let Some(peer) = self.peers.get_mut(&peer_addr) {
                // the peer supports pex, registered under ut_pex_id on its side
                peer.ut_pex_id = *ut_pex_id as u8;
                if !other_active_peers.is_empty() {
                    peer.send_pex_message(other_active_peers, Vec::new()).await;
                }
            }
        }
    }

    fn handle_receive_pex_message(&mut self, peer_addr: PeerAddr, extended_message: Value) {
        let Dict(d, _, _) = extended_message else {
            log::debug!("got a pex message from {peer_addr} that is not a dict, ignoring it");
            return;
        };
        // we only consume the ipv4 "added" field; "dropped" peers are still
        // worth keeping as candidates, so it is ignored on purpose
        if let Some(Str(compact_contacts_info)) = d.get(&b"added".to_vec()) {
            if compact_contacts_info.len() % 6 != 0 {
                log::debug!(
                    "got a pex message from {peer_addr} with an \"added\" field not divisible by 6, ignoring it"
                );
                return;
            }
            let mut advertised_peers = self
                .advertised_peers
                .lock()
                .expect("another user panicked while holding the lock");
            for chunk in compact_contacts_info.chunks_exact(6) {
                let ip = format!("{}.{}.{}.{}", chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                log::debug!("adding peer advertised by {peer_addr} through pex: {ip}:{port}");
                advertised_peers.insert(
                    format!("{ip}:{port}"),
                    (
                        tracker::Peer {
                            peer_id: None,
                            ip,
                            port,
                        },
                        SystemTime::UNIX_EPOCH,
                    ),
                );
            }
        }
    }

    async fn handle_new_peer(&mut self, tcp_stream: TcpStream) {
        let peer_addr = match tcp_stream.peer_addr() {
            Ok(s) => s.to_string(),
            Err(e) => {
                log::trace!("new peer initialization failed, could not get peer_addr: {e}");
                return;
            }
        };
        let (to_peer_tx, to_peer_rx) = mpsc::channel(TO_PEER_CHANNEL_CAPACITY);
        let (to_peer_cancel_tx, to_peer_cancel_rx) = mpsc::channel(TO_PEER_CANCEL_CHANNEL_CAPACITY);
        peer::start_peer_msg_handlers(
            peer_addr.clone(),
            tcp_stream,
            self.peers_to_manager_tx.clone(),
            to_peer_rx,
            to_peer_cancel_rx,
        );
        self.peers.insert(
            peer_addr.clone(),
            Peer::new(
                peer_addr.clone(),
                self.scheduler.num_pieces(),
                to_peer_tx,
                to_peer_cancel_tx,
            ),
        );
        log::debug!("new peer initialized: {peer_addr}");
        self.added_dropped_peer_events
            .push((SystemTime::now(), peer_addr, PexEvent::Added));
        if self.peers.len() > CONNECTED_PEERS_TO_STOP_INCOMING_PEER_CONNECTIONS {
            log::trace!("stop accepting new peers");
            let _ = self.ok_to_accept_connection_tx.send(false).await;
        }
    }

    async fn handle_peer_error(&mut self, peer_addr: PeerAddr, error_type: PeerError) {
        log::debug!("removing errored peer {peer_addr} ({error_type:?})");
        if error_type == PeerError::HandshakeError {
            self.bad_peers.insert(peer_addr.clone());
        }
        self.remove_peer(peer_addr).await;
    }

    async fn remove_peer(&mut self, peer_addr: PeerAddr) {
        self.added_dropped_peer_events.push((
            SystemTime::now(),
            peer_addr.clone(),
            PexEvent::Dropped,
        ));
        if let Some(removed_peer) = self.peers.remove(&peer_addr) {
            self.scheduler.cancel_requests(&peer_addr);
            self.scheduler.remove_peer_bitfield(&removed_peer.haves);
        }
        if self.optimistic_unchoked.as_deref() == Some(peer_addr.as_str()) {
            self.optimistic_unchoked = None;
        }
        if self.peers.len() < CONNECTED_PEERS_TO_STOP_INCOMING_PEER_CONNECTIONS {
            let _ = self.ok_to_accept_connection_tx.send(true).await;
        }
    }

    /// Tell the peer whether it has pieces we need, but only on changes.
    async fn update_interest(&mut self, peer_addr: &str) {
        let Some(peer) = self.peers.get_mut(peer_addr) else {
            return;
        };
        let has_needed = self.scheduler.peer_has_needed(&peer.haves);
        if has_needed != peer.am_interested {
            peer.am_interested = has_needed;
            let msg = if has_needed {
                Message::Interested
            } else {
                Message::NotInterested
            };
            peer.send(ToPeerMsg::Send(msg)).await;
        }
    }

    /// Pipelines requests to an unchoked peer up to the in-flight cap.
    async fn fill_requests(&mut self, peer_addr: &str) {
        loop {
            let request = {
                let Some(peer) = self.peers.get(peer_addr) else {
                    return;
                };
                if peer.peer_choking {
                    return;
                }
                if self.scheduler.pending_request_count(peer_addr)
                    >= MAX_INFLIGHT_REQUESTS_PER_PEER
                {
                    return;
                }
                self.scheduler.next_request(peer_addr, &peer.haves)
            };
            let Some(request) = request else {
                return;
            };
            let Some(peer) = self.peers.get_mut(peer_addr) else {
                return;
            };
            peer.send(ToPeerMsg::Send(Message::Request(
                request.piece_idx,
                request.block_begin,
                request.data_len,
            )))
            .await;
        }
    }

    /// Persists a verified piece, then fans out the side effects: bitfield
    /// refresh for the accept path, HAVE broadcast, interest updates, the
    /// completed announce once everything is on disk.
    async fn commit_completed_piece(&mut self, piece_idx: u32, data: Vec<u8>) {
        match self.file_manager.write_piece(piece_idx as usize, &data) {
            Err(e) => {
                log::error!("could not persist piece {piece_idx}: {e}");
                // the piece must be downloaded again
                self.scheduler.reset_piece(piece_idx);
                self.consecutive_storage_failures += 1;
                if self.consecutive_storage_failures >= MAX_CONSECUTIVE_STORAGE_FAILURES {
                    self.fatal_error = Some(anyhow!(
                        "storage keeps failing, giving up: {e}"
                    ));
                }
                return;
            }
            Ok(()) => {
                self.consecutive_storage_failures = 0;
            }
        }
        log::info!(
            "piece {piece_idx} verified and persisted ({}/{})",
            self.file_manager.completed_pieces(),
            self.file_manager.num_pieces()
        );

        let _ = self
            .piece_completion_status_tx
            .send(self.file_manager.piece_completion_status.clone())
            .await;

        // broadcast HAVE to every live session that lacks the piece and
        // withdraw interest where nothing is needed anymore
        let peer_addrs: Vec<PeerAddr> = self.peers.keys().cloned().collect();
        for peer_addr in peer_addrs {
            let Some(peer) = self.peers.get_mut(&peer_addr) else {
                continue;
            };
            if !peer.haves[piece_idx as usize] {
                peer.send(ToPeerMsg::Send(Message::Have(piece_idx))).await;
            }
            self.update_interest(&peer_addr).await;
        }

        if self.scheduler.is_complete() {
            log::info!("torrent download completed");
            if !self.completed_sent_to_tracker {
                self.completed_sent_to_tracker = true;
                self.announce_inline(Event::Completed).await;
            }
            self.download_complete = true;
        }
    }

    async fn handle_ticker(&mut self) {
        self.bandwidth.poll();
        for peer in self.peers.values_mut() {
            peer.bandwidth.poll();
        }
        self.log_stats();

        self.connect_to_new_candidates();
        self.send_keep_alives().await;
        self.announce_on_schedule();
        self.review_chokes().await;
        self.scheduler.remove_stale_requests(REQUEST_TIMEOUT);
        self.send_pex_messages().await;
        self.maybe_start_web_seed_fetch();

        // refill pipelines, some requests may have gone stale
        let peer_addrs: Vec<PeerAddr> = self.peers.keys().cloned().collect();
        for peer_addr in peer_addrs {
            self.fill_requests(&peer_addr).await;
        }
    }

    fn connect_to_new_candidates(&mut self) {
        let current_peers_n = self.peers.len();
        if current_peers_n >= CONNECTED_PEERS_TO_START_NEW_PEER_CONNECTIONS {
            return;
        }
        let now = SystemTime::now();
        let mut advertised_peers = self
            .advertised_peers
            .lock()
            .expect("another user panicked while holding the lock");
        let possible_peers = advertised_peers
            .iter()
            .filter(|(k, (_, last_connection_attempt))| {
                // skip peers we are connected to, peers we know are bad, and
                // peers with a recent (possibly still inflight) attempt
                !self.peers.contains_key(*k)
                    && !self.bad_peers.contains(*k)
                    && now
                        .duration_since(*last_connection_attempt)
                        .unwrap_or_default()
                        > NEW_CONNECTION_COOL_OFF_PERIOD
            })
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>();
        let candidates = possible_peers.choose_multiple(
            &mut rand::rng(),
            CONNECTED_PEERS_TO_START_NEW_PEER_CONNECTIONS - current_peers_n,
        );
        for candidate in candidates {
            let (peer, last_connection_attempt) = advertised_peers
                .get_mut(candidate)
                .expect("filtered from the same map above");
            *last_connection_attempt = now;
            log::trace!("connecting to candidate peer {}:{}", peer.ip, peer.port);
            tokio::spawn(peer::connect_to_new_peer(
                peer.ip.clone(),
                peer.port,
                self.info_hash,
                self.own_peer_id.clone(),
                self.scheduler.have_vec(),
                self.peers_to_manager_tx.clone(),
            ));
        }
    }

    async fn send_keep_alives(&mut self) {
        let now = SystemTime::now();
        for peer in self.peers.values_mut() {
            if let Ok(elapsed) = now.duration_since(peer.last_sent) {
                if elapsed > KEEP_ALIVE_FREQ {
                    peer.send(ToPeerMsg::Send(Message::KeepAlive)).await;
                }
            }
        }
    }

    fn announce_on_schedule(&mut self) {
        let (tracker_request_interval, last_successful_announce) = {
            let tracker_client = self
                .tracker_client
                .lock()
                .expect("another user panicked while holding the lock");
            (
                tracker_client.tracker_request_interval,
                tracker_client.last_successful_announce,
            )
        };
        let now = SystemTime::now();
        if announce_is_due(
            now,
            tracker_request_interval,
            last_successful_announce,
            self.last_tracker_announce_attempt,
        ) {
            let event = if last_successful_announce == SystemTime::UNIX_EPOCH {
                Event::Started
            } else {
                Event::None
            };
            self.announce_in_background(event);
        }
    }

    /// Rate-based choking: every 10 seconds the top interested peers by
    /// recent download rate keep the unchoke slots; every 30 seconds a random
    /// choked interested peer is unchoked optimistically, re-choking the
    /// previous optimistic pick through the regular review.
    async fn review_chokes(&mut self) {
        let now = SystemTime::now();
        if now
            .duration_since(self.last_choke_review)
            .unwrap_or_default()
            < CHOKE_REVIEW_PERIOD
        {
            return;
        }
        self.last_choke_review = now;

        if now
            .duration_since(self.last_optimistic_rotation)
            .unwrap_or_default()
            >= OPTIMISTIC_UNCHOKE_PERIOD
        {
            self.last_optimistic_rotation = now;
            let candidates: Vec<PeerAddr> = self
                .peers
                .iter()
                .filter(|(addr, p)| {
                    p.am_choking
                        && p.peer_interested
                        && self.optimistic_unchoked.as_deref() != Some(addr.as_str())
                })
                .map(|(addr, _)| addr.clone())
                .collect();
            self.optimistic_unchoked = candidates.choose(&mut rand::rng()).cloned();
        }

        let mut ranked: Vec<(PeerAddr, f64)> = self
            .peers
            .iter()
            .filter(|(_, p)| p.peer_interested)
            .map(|(addr, p)| (addr.clone(), p.bandwidth.download_rate()))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut unchoked: HashSet<PeerAddr> = ranked
            .into_iter()
            .take(UNCHOKE_SLOTS)
            .map(|(addr, _)| addr)
            .collect();
        if let Some(optimistic) = &self.optimistic_unchoked {
            unchoked.insert(optimistic.clone());
        }

        for (addr, peer) in self.peers.iter_mut() {
            let should_unchoke = unchoked.contains(addr);
            if should_unchoke && peer.am_choking {
                peer.am_choking = false;
                peer.send(ToPeerMsg::Send(Message::Unchoke)).await;
            } else if !should_unchoke && !peer.am_choking {
                peer.am_choking = true;
                peer.send(ToPeerMsg::Send(Message::Choke)).await;
            }
        }
    }

    async fn send_pex_messages(&mut self) {
        let now = SystemTime::now();
        self.added_dropped_peer_events
            .retain(|(event_timestamp, _, _)| {
                now.duration_since(*event_timestamp).unwrap_or_default()
                    < ADDED_DROPPED_PEER_EVENTS_RETENTION
            });
        for peer in self.peers.values_mut().filter(|p| {
            p.supports_pex()
                && now
                    .duration_since(p.last_pex_message_sent)
                    .unwrap_or_default()
                    > PEX_MESSAGE_COOL_OFF_PERIOD
        }) {
            // collapse the event stream: the latest event per address wins
            let elided_events = self
                .added_dropped_peer_events
                .iter()
                .filter(|(event_timestamp, addr, _)| {
                    *event_timestamp > peer.last_pex_message_sent && *addr != peer.peer_addr
                })
                .fold(HashMap::new(), |mut map, (_, addr, event_type)| {
                    map.insert(addr.clone(), *event_type);
                    map
                });
            let added = elided_events
                .iter()
                .filter(|(_, event_type)| **event_type == PexEvent::Added)
                .map(|(p, _)| p.clone())
                .collect::<Vec<_>>();
            let dropped = elided_events
                .iter()
                .filter(|(_, event_type)| **event_type == PexEvent::Dropped)
                .map(|(p, _)| p.clone())
                .collect::<Vec<_>>();
            if !added.is_empty() || !dropped.is_empty() {
                peer.send_pex_message(added, dropped).await;
            }
        }
    }

    /// Web-seed fallback: with zero live peers, fetch the first missing piece
    /// from the current seed over HTTP ranges. Results come back on the
    /// web_seed channel and flow through the same verification path blocks
    /// from peers take.
    fn maybe_start_web_seed_fetch(&mut self) {
        if !self.peers.is_empty() || self.web_seed_fetch_inflight || self.download_complete {
            return;
        }
        let Some(base_url) = self.web_seeds.get(self.current_web_seed).cloned() else {
            return;
        };
        let Some(piece_idx) = self.scheduler.first_missing_piece() else {
            return;
        };
        self.web_seed_fetch_inflight = true;
        let name = self.payload_name.clone();
        let offset = self.scheduler.piece_offset(piece_idx);
        let length = self.scheduler.piece_length_for(piece_idx);
        let web_seed_tx = self.web_seed_tx.clone();
        log::debug!("falling back to web seed {base_url} for piece {piece_idx}");
        tokio::spawn(async move {
            let result = web_seed::fetch_piece(&base_url, &name, offset, length).await;
            let _ = web_seed_tx.send((piece_idx, result)).await;
        });
    }

    async fn handle_web_seed_result(
        &mut self,
        piece_idx: u32,
        result: Result<Vec<u8>, WebSeedError>,
    ) {
        self.web_seed_fetch_inflight = false;
        let bytes = match result {
            Err(e) => {
                log::warn!(
                    "web seed {} disqualified: {e}",
                    self.web_seeds
                        .get(self.current_web_seed)
                        .map(|s| s.as_str())
                        .unwrap_or("<gone>")
                );
                self.current_web_seed += 1;
                return;
            }
            Ok(bytes) => bytes,
        };
        self.bandwidth.add_downloaded_bytes(bytes.len() as u64);

        let mut begin = 0u32;
        for chunk in bytes.chunks(self.block_size as usize) {
            match self.scheduler.handle_block(piece_idx, begin, chunk) {
                BlockOutcome::Accepted => {}
                BlockOutcome::PieceComplete { piece_idx, data } => {
                    self.commit_completed_piece(piece_idx, data).await;
                }
                BlockOutcome::Rejected(BlockReject::Duplicate)
                | BlockOutcome::Rejected(BlockReject::AlreadyHave) => {
                    // the piece was partially there already, keep feeding
                }
                BlockOutcome::Rejected(reason) => {
                    log::warn!(
                        "web seed {} disqualified on piece {piece_idx}: {reason}",
                        self.web_seeds
                            .get(self.current_web_seed)
                            .map(|s| s.as_str())
                            .unwrap_or("<gone>")
                    );
                    self.current_web_seed += 1;
                    return;
                }
            }
            begin += chunk.len() as u32;
        }
    }

    fn announce_in_background(&mut self, event: Event) {
        self.last_tracker_announce_attempt = SystemTime::now();
        let info_hash = self.info_hash;
        let uploaded_bytes = self.bandwidth.uploaded_bytes();
        let downloaded_bytes = self.bandwidth.downloaded_bytes();
        let bytes_left = self.file_manager.bytes_left();
        let advertised_peers = self.advertised_peers.clone();
        let tracker_client_arc = self.tracker_client.clone();
        let tracker_client = tracker_client_arc
            .lock()
            .expect("another user panicked while holding the lock")
            .clone();
        tokio::spawn(async move {
            if let Ok((updated_tracker_client, latest_advertised_peers)) = announce(
                tracker_client,
                event,
                info_hash,
                uploaded_bytes,
                downloaded_bytes,
                bytes_left,
            )
            .await
            {
                update_tracker_client_and_advertised_peers(
                    tracker_client_arc,
                    advertised_peers,
                    updated_tracker_client,
                    latest_advertised_peers,
                );
            }
        });
    }

    // awaited announce, used for the completed/stopped events right before
    // the engine winds down
    async fn announce_inline(&mut self, event: Event) {
        self.last_tracker_announce_attempt = SystemTime::now();
        let tracker_client = self
            .tracker_client
            .lock()
            .expect("another user panicked while holding the lock")
            .clone();
        if let Ok((updated_tracker_client, latest_advertised_peers)) = announce(
            tracker_client,
            event,
            self.info_hash,
            self.bandwidth.uploaded_bytes(),
            self.bandwidth.downloaded_bytes(),
            self.file_manager.bytes_left(),
        )
        .await
        {
            update_tracker_client_and_advertised_peers(
                self.tracker_client.clone(),
                self.advertised_peers.clone(),
                updated_tracker_client,
                latest_advertised_peers,
            );
        }
    }

    fn log_stats(&self) {
        let advertised_peers_len = self
            .advertised_peers
            .lock()
            .expect("another user panicked while holding the lock")
            .len();
        log::info!(
            "left: {left}, pieces: {completed_pieces}/{total_pieces} | {bandwidth} | known peers: {known_peers} (bad: {bad_peers}), connected: {connected_peers}, unchoked towards us: {unchoked_peers}",
            left = Size::from_bytes(self.file_manager.bytes_left()),
            completed_pieces = self.file_manager.completed_pieces(),
            total_pieces = self.file_manager.num_pieces(),
            bandwidth = self.bandwidth,
            known_peers = advertised_peers_len,
            bad_peers = self.bad_peers.len(),
            connected_peers = self.peers.len(),
            unchoked_peers = self.peers.values().filter(|p| !p.peer_choking).count(),
        );
    }
}

async fn announce(
    mut tracker_client: TrackerClient,
    event: Event,
    info_hash: [u8; 20],
    uploaded_bytes: u64,
    downloaded_bytes: u64,
    bytes_left: u64,
) -> Result<(TrackerClient, Vec<tracker::Peer>)> {
    match tracker_client
        .request(
            info_hash,
            uploaded_bytes,
            downloaded_bytes,
            bytes_left,
            event,
        )
        .await
    {
        Err(e) => {
            match e.downcast_ref::<NoTrackerError>() {
                Some(_) => log::debug!("could not perform request to tracker: {e}"),
                None => log::error!("could not perform request to tracker: {e}"),
            }
            Err(e)
        }
        Ok(Response::Failure(msg)) => {
            log::error!("tracker rejected the announce: {msg}");
            bail!(msg);
        }
        Ok(Response::Ok(ok_response)) => {
            if let Some(msg) = ok_response.warning_message.clone() {
                log::warn!("tracker sent a warning: {msg}");
            }
            log::info!(
                "tracker request succeeded: seeders: {}, leechers: {}, peers provided: {}",
                ok_response.complete,
                ok_response.incomplete,
                ok_response.peers.len()
            );
            Ok((tracker_client, ok_response.peers))
        }
    }
}

fn update_tracker_client_and_advertised_peers(
    tracker_client: Arc<Mutex<TrackerClient>>,
    advertised_peers: Arc<Mutex<HashMap<PeerAddr, (tracker::Peer, SystemTime)>>>,
    updated_tracker_client: TrackerClient,
    latest_advertised_peers: Vec<tracker::Peer>,
) {
    *tracker_client
        .lock()
        .expect("another user panicked while holding the lock") = updated_tracker_client;
    let mut advertised_peers = advertised_peers
        .lock()
        .expect("another user panicked while holding the lock");
    for p in latest_advertised_peers {
        advertised_peers
            .entry(format!("{}:{}", p.ip, p.port))
            .or_insert((p, SystemTime::UNIX_EPOCH));
    }
}

// the re-announce schedule stays anchored to the last successful announce: a
// failed attempt only delays the next try by a short backoff, it never pushes
// the schedule a whole interval forward
fn announce_is_due(
    now: SystemTime,
    interval: Duration,
    last_successful_announce: SystemTime,
    last_announce_attempt: SystemTime,
) -> bool {
    now.duration_since(last_successful_announce)
        .unwrap_or_default()
        > interval
        && now
            .duration_since(last_announce_attempt)
            .unwrap_or_default()
            >= TRACKER_RETRY_BACKOFF
}

fn generate_peer_id() -> String {
    const CHARSET: &[u8] = b"0123456789";
    let mut rng = rand::rng();
    let one_char = || CHARSET[rng.random_range(0..CHARSET.len())] as char;
    let random_string: String = std::iter::repeat_with(one_char).take(12).collect();
    format!("-UW0001-{random_string}")
}

fn ip_port_list_to_compact_format(addrs: &[PeerAddr]) -> Vec<u8> {
    let mut compact_format: Vec<u8> = Vec::new();
    for addr in addrs {
        let Some((ip, port)) = addr.rsplit_once(':') else {
            continue;
        };
        // pex carries ipv4 contacts only
        let Ok(ipv4_addr) = ip.parse::<Ipv4Addr>() else {
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            continue;
        };
        compact_format.extend_from_slice(&ipv4_addr.octets());
        compact_format.extend_from_slice(&port.to_be_bytes());
    }
    compact_format
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::infodict::{MetainfoFile, MetainfoSingleFile};
    use crate::torrent_protocol::wire_protocol::{Protocol, ProtocolReadHalf, ProtocolWriteHalf};
    use sha1::{Digest, Sha1};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    static TEST_DIR_SEQ: AtomicU64 = AtomicU64::new(0);

    fn test_dir(name: &str) -> PathBuf {
        let seq = TEST_DIR_SEQ.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!(
            "undertow-swarm-test-{}-{}-{}",
            name,
            std::process::id(),
            seq
        ))
    }

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(seed)).collect()
    }

    fn single_file_metainfo(name: &str, pieces: &[Vec<u8>], piece_length: u64) -> Metainfo {
        let total: u64 = pieces.iter().map(|p| p.len() as u64).sum();
        Metainfo {
            announce_list: vec![],
            url_list: vec![],
            piece_length,
            pieces: pieces
                .iter()
                .map(|p| {
                    let digest: [u8; 20] = Sha1::digest(p).into();
                    digest
                })
                .collect(),
            info_hash: [0x42; 20],
            file: MetainfoFile::SingleFile(MetainfoSingleFile {
                name: name.to_string(),
                length: total,
            }),
        }
    }

    fn register_test_peer(mgr: &mut SwarmManager, peer_addr: &str) -> Receiver<ToPeerMsg> {
        let (to_peer_tx, to_peer_rx) = mpsc::channel(TO_PEER_CHANNEL_CAPACITY);
        let (to_peer_cancel_tx, _to_peer_cancel_rx) =
            mpsc::channel(TO_PEER_CANCEL_CHANNEL_CAPACITY);
        mgr.peers.insert(
            peer_addr.to_string(),
            Peer::new(
                peer_addr.to_string(),
                mgr.scheduler.num_pieces(),
                to_peer_tx,
                to_peer_cancel_tx,
            ),
        );
        to_peer_rx
    }

    #[test]
    fn generated_peer_id_has_client_prefix_and_random_tail() {
        let peer_id = generate_peer_id();
        assert_eq!(peer_id.len(), 20);
        assert!(peer_id.starts_with("-UW0001-"));
        assert!(peer_id[8..].bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn failed_announces_do_not_reset_the_schedule() {
        let interval = Duration::from_secs(600);
        let epoch = SystemTime::UNIX_EPOCH;
        let start = epoch + Duration::from_secs(1_000_000);

        // nothing announced yet: due right away
        assert!(announce_is_due(start, interval, epoch, epoch));

        // a successful announce holds the next one for a full interval
        assert!(!announce_is_due(
            start + Duration::from_secs(30),
            interval,
            start,
            start
        ));
        assert!(announce_is_due(
            start + interval + Duration::from_secs(1),
            interval,
            start,
            start
        ));

        // a failed attempt made once the interval expired only backs off
        // briefly instead of waiting out another whole interval
        let failed_attempt = start + interval + Duration::from_secs(1);
        assert!(!announce_is_due(
            failed_attempt + Duration::from_secs(5),
            interval,
            start,
            failed_attempt
        ));
        assert!(announce_is_due(
            failed_attempt + TRACKER_RETRY_BACKOFF,
            interval,
            start,
            failed_attempt
        ));
    }

    #[test]
    fn compact_format_skips_malformed_addresses() {
        let compact = ip_port_list_to_compact_format(&[
            "1.2.3.4:80".to_string(),
            "not-an-addr".to_string(),
            "::1:6881".to_string(),
            "5.6.7.8:1213".to_string(),
        ]);
        assert_eq!(
            compact,
            vec![0x1, 0x2, 0x3, 0x4, 0x00, 0x50, 0x5, 0x6, 0x7, 0x8, 0x04, 0xbd]
        );
    }

    #[tokio::test]
    async fn corrupted_piece_closes_the_delivering_session() {
        let dir = test_dir("corrupted");
        let piece = patterned(16384, 3);
        let metainfo = single_file_metainfo("payload.bin", &[piece.clone()], 16384);
        let mut mgr = SwarmManager::new(&metainfo, &dir, 0, 16384, vec![]).unwrap();

        let peer_addr = "127.0.0.1:50000".to_string();
        let mut to_peer_rx = register_test_peer(&mut mgr, &peer_addr);
        mgr.handle_receive_bitfield_message(peer_addr.clone(), vec![true; 8])
            .await;
        // the peer looks interesting, we told it so
        assert_matches!(
            to_peer_rx.recv().await,
            Some(ToPeerMsg::Send(Message::Interested))
        );

        let mut corrupted = piece.clone();
        corrupted[16383] ^= 0xff;
        mgr.handle_receive_piece_message(peer_addr.clone(), 0, 0, corrupted)
            .await;

        assert!(mgr.peers.is_empty());
        assert!(mgr.bad_peers.contains(&peer_addr));
        assert!(!mgr.scheduler.have_piece(0));

        // a clean delivery from another peer completes the piece
        let other_addr = "127.0.0.1:50001".to_string();
        let _rx = register_test_peer(&mut mgr, &other_addr);
        mgr.handle_receive_piece_message(other_addr, 0, 0, piece.clone())
            .await;
        assert!(mgr.scheduler.have_piece(0));
        assert!(mgr.download_complete);
        let on_disk = std::fs::read(dir.join("payload.bin")).unwrap();
        assert_eq!(on_disk, piece);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn requests_are_served_only_when_unchoked() {
        let dir = test_dir("upload");
        let piece = patterned(16384, 9);
        let metainfo = single_file_metainfo("payload.bin", &[piece.clone()], 16384);
        let mut mgr = SwarmManager::new(&metainfo, &dir, 0, 16384, vec![]).unwrap();

        let peer_addr = "127.0.0.1:50002".to_string();
        let mut to_peer_rx = register_test_peer(&mut mgr, &peer_addr);

        // we own the piece; the registered peer gets the HAVE broadcast
        mgr.handle_receive_piece_message("127.0.0.1:50009".to_string(), 0, 0, piece.clone())
            .await;
        assert_matches!(
            to_peer_rx.recv().await,
            Some(ToPeerMsg::Send(Message::Have(0)))
        );

        // choked requests are silently dropped
        mgr.handle_receive_request_message(peer_addr.clone(), 0, 0, 1024)
            .await;
        assert!(to_peer_rx.try_recv().is_err());

        mgr.peers.get_mut(&peer_addr).unwrap().am_choking = false;
        // out-of-bounds requests are silently dropped too
        mgr.handle_receive_request_message(peer_addr.clone(), 0, 16000, 1024)
            .await;
        assert!(to_peer_rx.try_recv().is_err());

        mgr.handle_receive_request_message(peer_addr.clone(), 0, 1024, 2048)
            .await;
        match to_peer_rx.recv().await {
            Some(ToPeerMsg::Send(Message::Piece(0, 1024, data))) => {
                assert_eq!(data, piece[1024..3072].to_vec());
            }
            _ => panic!("expected a piece reply"),
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn pex_added_contacts_become_candidates() {
        let dir = test_dir("pex");
        let metainfo = single_file_metainfo("payload.bin", &[patterned(16384, 5)], 16384);
        let mut mgr = SwarmManager::new(&metainfo, &dir, 0, 16384, vec![]).unwrap();

        let peer_addr = "127.0.0.1:50003".to_string();
        let _rx = register_test_peer(&mut mgr, &peer_addr);

        let pex_dict = Dict(
            HashMap::from([(
                b"added".to_vec(),
                Str(vec![10, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x1a, 0xe2]),
            )]),
            0,
            0,
        );
        mgr.handle_receive_extended_message(peer_addr, UT_PEX_EXTENSION_ID as u8, pex_dict)
            .await;

        let advertised = mgr.advertised_peers.lock().unwrap();
        assert!(advertised.contains_key("10.0.0.1:6881"));
        assert!(advertised.contains_key("10.0.0.2:6882"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    // a scripted remote seeder speaking the real wire protocol: handshake,
    // bitfield, unchoke on interest, serve every request
    async fn run_scripted_seeder(listener: TcpListener, info_hash: [u8; 20], pieces: Vec<Vec<u8>>) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (_, _, their_hash, _) = stream
            .handshake(info_hash, *b"-UW0001-999999999999")
            .await
            .unwrap();
        assert_eq!(their_hash, info_hash);
        let (mut read, mut write) = tokio::io::split(stream);
        write
            .send(Message::Bitfield(vec![true; pieces.len()]))
            .await
            .unwrap();
        loop {
            match read.receive().await {
                Ok(Message::Interested) => {
                    write.send(Message::Unchoke).await.unwrap();
                }
                Ok(Message::Request(piece_idx, begin, length)) => {
                    let piece = &pieces[piece_idx as usize];
                    let block =
                        piece[begin as usize..(begin + length) as usize].to_vec();
                    write
                        .send(Message::Piece(piece_idx, begin, block))
                        .await
                        .unwrap();
                }
                Ok(_) => {}
                Err(_) => break, // the downloader is done and went away
            }
        }
    }

    #[tokio::test]
    async fn single_file_end_to_end_download_from_a_scripted_seeder() {
        let dir = test_dir("end-to-end");
        let piece0 = patterned(16384, 31);
        let piece1 = patterned(16384, 37);
        let metainfo =
            single_file_metainfo("payload.bin", &[piece0.clone(), piece1.clone()], 16384);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let seeder_addr = listener.local_addr().unwrap();
        let seeder = tokio::spawn(run_scripted_seeder(
            listener,
            metainfo.info_hash,
            vec![piece0.clone(), piece1.clone()],
        ));

        let mut mgr = SwarmManager::new(
            &metainfo,
            &dir,
            0, // ephemeral listen port, this test only connects outbound
            16384,
            vec![seeder_addr.to_string()],
        )
        .unwrap();
        timeout(Duration::from_secs(60), mgr.start())
            .await
            .expect("download should complete well within the timeout")
            .unwrap();

        assert!(mgr.payload_complete());
        let on_disk = std::fs::read(dir.join("payload.bin")).unwrap();
        assert_eq!(on_disk.len(), 32768);
        let mut expected = piece0;
        expected.extend_from_slice(&piece1);
        assert_eq!(on_disk, expected);
        let expected_digest: [u8; 20] = Sha1::digest(&expected).into();
        let on_disk_digest: [u8; 20] = Sha1::digest(&on_disk).into();
        assert_eq!(on_disk_digest, expected_digest);

        seeder.abort();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    // a canned http server able to answer several range requests, for the
    // web-seed fallback path
    async fn run_scripted_web_seed(listener: TcpListener, payload: Vec<u8>) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let payload = payload.clone();
            tokio::spawn(async move {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    let Ok(n) = stream.read(&mut buf).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    request.extend_from_slice(&buf[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let request = String::from_utf8_lossy(&request).to_string();
                let range_line = request
                    .lines()
                    .find(|l| l.to_ascii_lowercase().starts_with("range:"))
                    .expect("range header present")
                    .to_string();
                let range_spec = range_line.split('=').nth(1).unwrap().trim().to_string();
                let (from, to) = range_spec.split_once('-').unwrap();
                let from: usize = from.parse().unwrap();
                let to: usize = to.parse().unwrap();
                let body = &payload[from..=to];
                let header = format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {}-{}/{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    from,
                    to,
                    payload.len(),
                    body.len()
                );
                let _ = stream.write_all(header.as_bytes()).await;
                let _ = stream.write_all(body).await;
                let _ = stream.shutdown().await;
            });
        }
    }

    #[tokio::test]
    async fn web_seed_fallback_downloads_the_payload_without_peers() {
        let dir = test_dir("web-seed-fallback");
        let piece0 = patterned(16384, 41);
        let piece1 = patterned(7232, 43); // short last piece
        let mut metainfo =
            single_file_metainfo("payload.bin", &[piece0.clone(), piece1.clone()], 16384);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let mut payload = piece0.clone();
        payload.extend_from_slice(&piece1);
        let server = tokio::spawn(run_scripted_web_seed(listener, payload.clone()));

        metainfo.url_list = vec![format!("http://{server_addr}/files/")];

        let mut mgr = SwarmManager::new(&metainfo, &dir, 0, 16384, vec![]).unwrap();
        timeout(Duration::from_secs(60), mgr.start())
            .await
            .expect("web seed download should complete well within the timeout")
            .unwrap();

        assert!(mgr.payload_complete());
        let on_disk = std::fs::read(dir.join("payload.bin")).unwrap();
        assert_eq!(on_disk.len(), 23616);
        assert_eq!(on_disk, payload);

        server.abort();
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
