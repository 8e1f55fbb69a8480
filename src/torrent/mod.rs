//! Per-torrent controller.
//!
//! The controller is the single owner of everything mutable about one
//! torrent: the piece store, the storage mapping, every peer session, the
//! tracker records, and the strategy. It runs the torrent's event loop -
//! a select over the tick timer, completed announce futures, and the byte
//! stream coming off every connection pump - and it alone routes peer
//! messages into state changes. Handlers never let an error escape the
//! loop: a misbehaving peer is dropped, a failing tracker is rescheduled,
//! and only storage failures end the torrent.
use crate::config::Config;
use crate::config::MAX_REQUEST_BYTES;
use crate::metainfo::Metainfo;
use crate::peer::connection;
use crate::peer::connection::ConnCommand;
use crate::peer::connection::ConnEvent;
use crate::peer::PeerSession;
use crate::piece::BlockOutcome;
use crate::piece::PieceError;
use crate::piece::PieceStore;
use crate::storage::Storage;
use crate::storage::StorageError;
use crate::strategy::Action;
use crate::strategy::Strategy;
use crate::strategy::SwarmView;
use crate::tracker;
use crate::tracker::AnnounceEvent;
use crate::tracker::AnnounceRequest;
use crate::tracker::Tracker;
use crate::tracker::TrackerResult;
use crate::wire::Handshake;
use crate::wire::Message;

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub mod event;

use event::Event;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type TorrentResult<T> = std::result::Result<T, TorrentError>;

/// Input delivered to the controller from outside the peer pumps.
#[derive(Debug)]
pub enum Input {
    /// An accepted connection whose handshake already matched this
    /// torrent's info-hash. `leftover` is whatever arrived after the
    /// handshake bytes.
    Inbound {
        addr: SocketAddr,
        stream: TcpStream,
        remote: Handshake,
        leftover: Bytes,
    },
    /// A completed announce round-trip.
    AnnounceOutcome {
        url: String,
        result: TrackerResult<tracker::AnnounceResponse>,
    },
    /// Stop the torrent: close peers and tell the trackers we left.
    Shutdown,
}

/// A point-in-time progress snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentStats {
    pub pieces_have: usize,
    pub pieces_total: usize,
    pub bytes_left: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub connected_peers: usize,
}

impl TorrentStats {
    pub fn percent_complete(&self) -> f64 {
        if self.pieces_total == 0 {
            return 100.0;
        }
        self.pieces_have as f64 * 100.0 / self.pieces_total as f64
    }
}

/// One tracker plus its announce schedule.
struct TrackerSlot {
    tracker: Tracker,
    next_due: Instant,
    in_flight: bool,
    started_sent: bool,
}

/// The transport half of a peer: the pump's command channel and whether
/// its write buffer has drained (write credit).
struct Link {
    commands: mpsc::Sender<ConnCommand>,
    pump_idle: bool,
}

pub struct Torrent {
    metainfo: Metainfo,
    config: Config,
    peer_id: [u8; 20],
    store: PieceStore,
    storage: Storage,
    sessions: HashMap<SocketAddr, PeerSession>,
    links: HashMap<SocketAddr, Link>,
    trackers: Vec<TrackerSlot>,
    strategy: Option<Box<dyn Strategy>>,
    uploaded: u64,
    downloaded: u64,
    input_tx: mpsc::Sender<Input>,
    input_rx: mpsc::Receiver<Input>,
    conn_tx: mpsc::Sender<ConnEvent>,
    conn_rx: mpsc::Receiver<ConnEvent>,
    done: bool,
    last_stats: Instant,
}

/// Cadence of the progress log line.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

impl Torrent {
    /// Builds the controller: storage is created up front (a failure here
    /// is fatal for the torrent) and every known tracker URL gets a slot
    /// that is immediately due.
    pub fn new(
        metainfo: Metainfo,
        config: Config,
        peer_id: [u8; 20],
        strategy: Box<dyn Strategy>,
    ) -> TorrentResult<Self> {
        let storage = Storage::create(&metainfo, &config.download_root)?;
        let store = PieceStore::new(&metainfo);
        let trackers = metainfo
            .all_announce_urls()
            .map(|url| TrackerSlot {
                tracker: Tracker::new(url.to_string()),
                next_due: Instant::now(),
                in_flight: false,
                started_sent: false,
            })
            .collect();
        let (input_tx, input_rx) = mpsc::channel(64);
        let (conn_tx, conn_rx) = mpsc::channel(256);
        Ok(Self {
            metainfo,
            config,
            peer_id,
            store,
            storage,
            sessions: HashMap::new(),
            links: HashMap::new(),
            trackers,
            strategy: Some(strategy),
            uploaded: 0,
            downloaded: 0,
            input_tx,
            input_rx,
            conn_tx,
            conn_rx,
            done: false,
            last_stats: Instant::now(),
        })
    }

    /// Current progress, for logging and front-ends.
    pub fn stats(&self) -> TorrentStats {
        TorrentStats {
            pieces_have: (0..self.metainfo.num_pieces() as u32)
                .filter(|i| self.store.has_piece(*i))
                .count(),
            pieces_total: self.metainfo.num_pieces(),
            bytes_left: self.store.bytes_left(),
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            connected_peers: self.sessions.len(),
        }
    }

    /// A clone of the input channel, used by the client's accept loop to
    /// hand over inbound connections.
    pub fn input_sender(&self) -> mpsc::Sender<Input> {
        self.input_tx.clone()
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.metainfo.info_hash
    }

    pub fn name(&self) -> &str {
        &self.metainfo.name
    }

    /**
    Drives the torrent to completion.

    One loop iteration handles exactly one of: a tick (timers, due
    announces, then the strategy), a completed announce future, or a
    connection event. Everything a handler touches lives on this task,
    so no locking is involved anywhere.
    */
    pub async fn run(&mut self) -> TorrentResult<()> {
        tracing::info!(
            name = %self.metainfo.name,
            info_hash = %hex::encode(self.metainfo.info_hash),
            pieces = self.metainfo.num_pieces(),
            "Starting torrent"
        );
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        while !self.done {
            tokio::select! {
                _ = ticker.tick() => self.tick()?,
                Some(input) = self.input_rx.recv() => self.handle_input(input)?,
                Some(conn_event) = self.conn_rx.recv() => self.handle_conn_event(conn_event)?,
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Timer pass: evictions, keep-alives, due announces, then the
    /// strategy's own tick.
    fn tick(&mut self) -> TorrentResult<()> {
        let now = Instant::now();

        let evict: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.into_std().duration_since(s.last_heard_from()) > self.config.evict_after)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in evict {
            tracing::info!(%addr, "Evicting silent peer");
            self.drop_peer(addr, "eviction timeout");
        }

        let keepalive: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|(_, s)| {
                s.is_active()
                    && !s.wants_write()
                    && now.into_std().duration_since(s.last_spoke_to()) > self.config.keepalive_after
            })
            .map(|(addr, _)| *addr)
            .collect();
        for addr in keepalive {
            if let Some(session) = self.sessions.get_mut(&addr) {
                session.enqueue(Message::KeepAlive);
            }
            self.kick(addr);
        }

        let due: Vec<usize> = self
            .trackers
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.in_flight && slot.next_due <= now)
            .map(|(i, _)| i)
            .collect();
        for index in due {
            self.start_announce(index);
        }

        if now.into_std().duration_since(self.last_stats.into_std()) > STATS_INTERVAL {
            self.last_stats = now;
            let stats = self.stats();
            tracing::info!(
                name = %self.metainfo.name,
                percent = format!("{:.1}", stats.percent_complete()),
                peers = stats.connected_peers,
                down = stats.downloaded,
                up = stats.uploaded,
                "Progress"
            );
        }

        self.strategy_tick();
        Ok(())
    }

    fn strategy_tick(&mut self) {
        let mut strategy = self.strategy.take().expect("strategy present");
        let actions = {
            let view = SwarmView {
                store: &self.store,
                peers: &self.sessions,
                config: &self.config,
                local_port: self.config.port,
            };
            strategy.on_tick(&view)
        };
        self.strategy = Some(strategy);
        self.execute(actions);
    }

    /// Routes an event through the strategy and executes what comes back.
    fn emit(&mut self, torrent_event: Event) {
        tracing::debug!(?torrent_event, "Event");
        let mut strategy = self.strategy.take().expect("strategy present");
        let actions = {
            let view = SwarmView {
                store: &self.store,
                peers: &self.sessions,
                config: &self.config,
                local_port: self.config.port,
            };
            strategy.on_event(&torrent_event, &view)
        };
        self.strategy = Some(strategy);
        self.execute(actions);
    }

    fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(addr, message) => {
                    if let Some(session) = self.sessions.get_mut(&addr) {
                        if session.is_active() {
                            session.enqueue(message);
                            self.kick(addr);
                        }
                    }
                }
                Action::Broadcast(message) => {
                    let targets: Vec<SocketAddr> = self
                        .sessions
                        .iter()
                        .filter(|(_, s)| s.is_active())
                        .map(|(addr, _)| *addr)
                        .collect();
                    for addr in targets {
                        if let Some(session) = self.sessions.get_mut(&addr) {
                            session.enqueue(message.clone());
                        }
                        self.kick(addr);
                    }
                }
                Action::Connect(addr) => self.connect_peer(addr),
            }
        }
    }

    /// Opens an outbound connection: pump task, fresh session, handshake
    /// queued, and a bitfield behind it once we have something to claim.
    fn connect_peer(&mut self, addr: SocketAddr) {
        if self.sessions.contains_key(&addr) || self.sessions.len() >= self.config.max_peers {
            return;
        }
        tracing::debug!(%addr, "Connecting to peer");
        let commands = connection::spawn_outbound(addr, self.conn_tx.clone(), self.config.read_chunk);
        let mut session =
            PeerSession::new_outbound(addr, self.metainfo.num_pieces(), self.metainfo.info_hash);
        session.enqueue_handshake(&Handshake::new(self.metainfo.info_hash, self.peer_id));
        if self.store.have_any() {
            session.enqueue(Message::Bitfield(self.store.have_bitfield()));
        }
        self.sessions.insert(addr, session);
        self.links.insert(addr, Link { commands, pump_idle: true });
        self.kick(addr);
        self.emit(Event::PeerConnected(addr));
    }

    /// Adopts an accepted connection the client already handshook.
    fn adopt_inbound(
        &mut self,
        addr: SocketAddr,
        stream: TcpStream,
        remote: &Handshake,
        leftover: &[u8],
    ) -> TorrentResult<()> {
        if self.sessions.contains_key(&addr)
            || self.sessions.len() >= self.config.max_peers
            || remote.info_hash != self.metainfo.info_hash
        {
            return Ok(()); // dropping the stream closes it
        }
        tracing::debug!(%addr, "Adopting inbound peer");
        let commands =
            connection::spawn_inbound(addr, stream, self.conn_tx.clone(), self.config.read_chunk);
        let mut session = PeerSession::new_inbound(
            addr,
            self.metainfo.num_pieces(),
            self.metainfo.info_hash,
            remote,
        );
        session.enqueue_handshake(&Handshake::new(self.metainfo.info_hash, self.peer_id));
        if self.store.have_any() {
            session.enqueue(Message::Bitfield(self.store.have_bitfield()));
        }
        self.sessions.insert(addr, session);
        self.links.insert(addr, Link { commands, pump_idle: true });
        if !leftover.is_empty() {
            self.handle_data(addr, leftover)?;
        }
        self.kick(addr);
        self.emit(Event::PeerConnected(addr));
        Ok(())
    }

    /// Hands the next outbound chunk to the pump if it has credit.
    fn kick(&mut self, addr: SocketAddr) {
        let Some(link) = self.links.get_mut(&addr) else { return };
        if !link.pump_idle {
            return;
        }
        let Some(session) = self.sessions.get_mut(&addr) else { return };
        if let Some(chunk) = session.next_chunk(self.config.read_chunk) {
            link.pump_idle = false;
            let _ = link.commands.try_send(ConnCommand::Write(chunk));
        }
    }

    fn handle_input(&mut self, input: Input) -> TorrentResult<()> {
        match input {
            Input::Inbound { addr, stream, remote, leftover } => {
                self.adopt_inbound(addr, stream, &remote, &leftover)?;
            }
            Input::AnnounceOutcome { url, result } => self.finish_announce(&url, result),
            Input::Shutdown => {
                tracing::info!(name = %self.metainfo.name, "Shutdown requested");
                self.done = true;
            }
        }
        Ok(())
    }

    fn handle_conn_event(&mut self, conn_event: ConnEvent) -> TorrentResult<()> {
        match conn_event {
            ConnEvent::Data(addr, bytes) => self.handle_data(addr, &bytes)?,
            ConnEvent::Wrote(addr, n) => {
                let became_active = match self.sessions.get_mut(&addr) {
                    Some(session) => {
                        let was_active = session.is_active();
                        session.record_written(n);
                        !was_active && session.is_active()
                    }
                    None => false,
                };
                // Going active may unblock messages that arrived behind
                // the remote handshake and are still sitting buffered.
                if became_active {
                    self.handle_data(addr, &[])?;
                }
            }
            ConnEvent::WriteDrained(addr) => {
                if let Some(link) = self.links.get_mut(&addr) {
                    link.pump_idle = true;
                }
                self.kick(addr);
            }
            ConnEvent::Closed(addr, reason) => {
                self.drop_peer(addr, &reason);
            }
        }
        Ok(())
    }

    fn handle_data(&mut self, addr: SocketAddr, bytes: &[u8]) -> TorrentResult<()> {
        let Some(session) = self.sessions.get_mut(&addr) else {
            return Ok(());
        };
        let messages = match session.ingest(bytes) {
            Ok(messages) => messages,
            Err(peer_error) => {
                tracing::warn!(%addr, error = %peer_error, "Protocol violation");
                self.drop_peer(addr, &peer_error.to_string());
                return Ok(());
            }
        };
        for message in messages {
            self.route_message(addr, message)?;
        }
        // Ingest may have unblocked writes (our handshake reply, purges).
        self.kick(addr);
        Ok(())
    }

    /// Controller-level dispatch for one received message. The session
    /// already applied its local transitions; what is left is torrent
    /// state: availability, piece data, and serving.
    fn route_message(&mut self, addr: SocketAddr, message: Message) -> TorrentResult<()> {
        tracing::trace!(%addr, kind = message.name(), "Routing message");
        match message {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::Port(_) => {}
            Message::Have { piece_index } => {
                let newly = self
                    .sessions
                    .get_mut(&addr)
                    .is_some_and(|s| s.record_have(piece_index));
                if newly {
                    self.store.record_have(piece_index);
                }
            }
            Message::Bitfield(bits) => {
                if let Some(session) = self.sessions.get_mut(&addr) {
                    let has = session.apply_bitfield(&bits);
                    self.store.record_bitfield(&has);
                }
            }
            Message::Request { index, begin, length } => {
                self.serve_request(addr, index, begin, length)?;
            }
            Message::Cancel { .. } => {} // wants ledger updated in the session
            Message::Piece { index, begin, block } => {
                self.accept_block(addr, index, begin, &block)?;
            }
        }
        Ok(())
    }

    /// Serves a block back when we are not choking the peer and actually
    /// hold the verified piece. Requests while choked are ignored, not
    /// punished.
    fn serve_request(
        &mut self,
        addr: SocketAddr,
        index: u32,
        begin: u32,
        length: u32,
    ) -> TorrentResult<()> {
        let Some(session) = self.sessions.get_mut(&addr) else {
            return Ok(());
        };
        if session.am_choking() || !self.store.has_piece(index) {
            return Ok(());
        }
        if begin
            .checked_add(length)
            .map_or(true, |end| end > self.store.piece_size(index))
        {
            tracing::warn!(%addr, index, begin, length, "Request outside piece bounds");
            self.drop_peer(addr, "request outside piece bounds");
            return Ok(());
        }
        let block = self.storage.read_block(index, begin, length)?;
        self.uploaded += u64::from(length);
        session.remove_want(index, begin, length);
        session.enqueue(Message::Piece { index, begin, block });
        self.kick(addr);
        Ok(())
    }

    /// Ingests a received block and reacts to what it completed.
    fn accept_block(
        &mut self,
        addr: SocketAddr,
        index: u32,
        begin: u32,
        block: &[u8],
    ) -> TorrentResult<()> {
        self.downloaded += block.len() as u64;
        match self.store.add_block(index, begin, block, &mut self.storage) {
            Ok(BlockOutcome::Verified) => {
                self.emit(Event::HaveCompletePiece(index));
                if self.store.is_complete() {
                    tracing::info!(name = %self.metainfo.name, "Download complete");
                    self.emit(Event::DownloadComplete);
                    self.done = true;
                }
            }
            Ok(BlockOutcome::HashMismatch) => {
                self.rescind_piece_requests(index);
                self.emit(Event::HashMismatch(index));
            }
            Ok(BlockOutcome::Stored) | Ok(BlockOutcome::Ignored) => {}
            Err(PieceError::Storage(storage_error)) => return Err(storage_error.into()),
            Err(PieceError::OutOfRange { .. }) => {
                self.drop_peer(addr, "piece data outside piece bounds");
            }
        }
        Ok(())
    }

    /// After a hash mismatch nothing in flight for the piece can be
    /// trusted to help; cancel every outstanding request for it.
    fn rescind_piece_requests(&mut self, index: u32) {
        let mut kicked = Vec::new();
        for (addr, session) in self.sessions.iter_mut() {
            let stale: Vec<(u32, u32)> = session
                .outstanding_requests()
                .iter()
                .filter(|(piece, _)| *piece == index)
                .copied()
                .collect();
            if stale.is_empty() {
                continue;
            }
            let size = self.store.piece_size(index);
            for (piece, begin) in stale {
                let length = MAX_REQUEST_BYTES.min(size - begin);
                session.enqueue(Message::Cancel { index: piece, begin, length });
            }
            kicked.push(*addr);
        }
        for addr in kicked {
            self.kick(addr);
        }
    }

    /// Full drop procedure: terminal session state, pump shutdown,
    /// frequency release, and the drop event (which also releases any
    /// strategy-side bookkeeping).
    fn drop_peer(&mut self, addr: SocketAddr, reason: &str) {
        let Some(mut session) = self.sessions.remove(&addr) else {
            return;
        };
        tracing::info!(%addr, reason, "Dropping peer");
        session.drop_session();
        self.store.release_peer(session.has());
        if let Some(link) = self.links.remove(&addr) {
            let _ = link.commands.try_send(ConnCommand::Shutdown);
        }
        self.emit(Event::PeerDropped(addr));
    }

    /// Kicks off one announce round-trip on its own task; the outcome
    /// comes back through the input channel.
    fn start_announce(&mut self, index: usize) {
        let slot = &mut self.trackers[index];
        slot.in_flight = true;
        let announce_event = if slot.started_sent {
            AnnounceEvent::None
        } else {
            AnnounceEvent::Started
        };
        slot.started_sent = true;

        let url = slot.tracker.announce_url.clone();
        let request = AnnounceRequest {
            info_hash: self.metainfo.info_hash,
            peer_id: self.peer_id,
            port: self.config.port,
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left: self.store.bytes_left(),
            event: announce_event,
            trackerid: slot.tracker.trackerid.clone(),
            numwant: None,
            key: None,
        };
        let input_tx = self.input_tx.clone();
        tokio::spawn(async move {
            let result = tracker::announce(&url, &request).await;
            let _ = input_tx.send(Input::AnnounceOutcome { url, result }).await;
        });
    }

    fn finish_announce(&mut self, url: &str, result: TrackerResult<tracker::AnnounceResponse>) {
        let Some(slot) = self
            .trackers
            .iter_mut()
            .find(|slot| slot.tracker.announce_url == url)
        else {
            return;
        };
        slot.in_flight = false;
        match result {
            Ok(response) => {
                slot.tracker.note_response(&response);
                slot.next_due = Instant::now()
                    + slot
                        .tracker
                        .next_announce_delay(self.config.default_announce_interval);
                let peers: Vec<SocketAddr> =
                    response.peers.iter().map(|p| p.socket_addr()).collect();
                tracing::info!(url, peers = peers.len(), "Tracker responded");
                self.emit(Event::TrackerResponse { url: url.to_string(), peers });
            }
            Err(tracker_error) => {
                slot.tracker.note_failure();
                slot.next_due = Instant::now()
                    + slot
                        .tracker
                        .next_announce_delay(self.config.default_announce_interval);
                tracing::warn!(url, error = %tracker_error, "Tracker announce failed");
                self.emit(Event::TrackerFailure {
                    url: url.to_string(),
                    reason: tracker_error.to_string(),
                });
            }
        }
    }

    /// Teardown: close every pump, then tell the trackers whether we
    /// finished or merely left.
    async fn shutdown(&mut self) {
        let reason = if self.store.is_complete() {
            "torrent complete"
        } else {
            "torrent stopped"
        };
        let addrs: Vec<SocketAddr> = self.sessions.keys().copied().collect();
        for addr in addrs {
            self.drop_peer(addr, reason);
        }
        let parting_event = if self.store.is_complete() {
            AnnounceEvent::Completed
        } else {
            AnnounceEvent::Stopped
        };
        for slot in &self.trackers {
            if !slot.started_sent {
                continue;
            }
            let request = AnnounceRequest {
                info_hash: self.metainfo.info_hash,
                peer_id: self.peer_id,
                port: self.config.port,
                uploaded: self.uploaded,
                downloaded: self.downloaded,
                left: self.store.bytes_left(),
                event: parting_event,
                trackerid: slot.tracker.trackerid.clone(),
                numwant: None,
                key: None,
            };
            let _ = tokio::time::timeout(
                Duration::from_secs(5),
                tracker::announce(&slot.tracker.announce_url, &request),
            )
            .await;
        }
    }
}
