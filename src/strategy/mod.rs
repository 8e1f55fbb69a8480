//! Download strategy.
//!
//! A strategy decides whom to talk to and what to ask for; it never owns
//! torrent state. On every controller tick it reads a [`SwarmView`] and
//! returns [`Action`]s for the controller to execute, and it hears every
//! torrent [`Event`] the same way. Swapping policies means swapping the
//! boxed trait object, nothing else.
use crate::config::Config;
use crate::config::MAX_REQUEST_BYTES;
use crate::peer::PeerSession;
use crate::piece::PieceStore;
use crate::torrent::event::Event;
use crate::wire::Message;

use rand::seq::IteratorRandom;
use std::collections::HashMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::net::SocketAddr;

/// Read-only view of one torrent's swarm, handed to the strategy.
pub struct SwarmView<'a> {
    pub store: &'a PieceStore,
    pub peers: &'a HashMap<SocketAddr, PeerSession>,
    pub config: &'a Config,
    /// The port we listen on; used to avoid connecting to ourselves.
    pub local_port: u16,
}

/// What the strategy wants done. The controller executes these in order.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// Enqueue a message toward one peer.
    Send(SocketAddr, Message),
    /// Enqueue a message toward every active peer.
    Broadcast(Message),
    /// Open an outbound connection (handshake and bitfield are the
    /// controller's job once the session exists).
    Connect(SocketAddr),
}

/// A replaceable download policy.
pub trait Strategy: Send {
    fn on_tick(&mut self, view: &SwarmView) -> Vec<Action>;

    fn on_event(&mut self, _event: &Event, _view: &SwarmView) -> Vec<Action> {
        Vec::new()
    }
}

/// Admission test for a tracker-supplied address.
fn want_peer(addr: SocketAddr, view: &SwarmView) -> bool {
    let is_self = addr.port() == view.local_port
        && match addr.ip() {
            IpAddr::V4(ip) => ip.is_loopback() || ip.is_unspecified(),
            IpAddr::V6(ip) => ip.is_loopback() || ip.is_unspecified(),
        };
    !is_self && !view.peers.contains_key(&addr) && view.peers.len() < view.config.max_peers
}

/// `(piece, begin)` pairs currently requested anywhere in the swarm,
/// written or queued.
fn requested_everywhere(view: &SwarmView) -> HashSet<(u32, u32)> {
    view.peers
        .values()
        .flat_map(|session| session.requested_blocks())
        .collect()
}

/// The next block of `piece` worth requesting: the first uncovered offset,
/// skipping offsets already in flight. Returns `(begin, length)`.
fn next_block(
    store: &PieceStore,
    piece: u32,
    requested: &HashSet<(u32, u32)>,
) -> Option<(u32, u32)> {
    let size = store.piece_size(piece);
    let mut begin = store.next_gap(piece)?;
    while begin < size {
        let length = MAX_REQUEST_BYTES.min(size - begin);
        if !requested.contains(&(piece, begin)) {
            return Some((begin, length));
        }
        begin += length;
    }
    None
}

/// Interest flips and connect admissions are shared by both policies;
/// only piece ordering differs.
fn interest_actions(
    view: &SwarmView,
    declared: &mut HashMap<SocketAddr, bool>,
) -> Vec<Action> {
    let mut actions = Vec::new();
    for (addr, session) in view.peers.iter() {
        if !session.is_active() {
            continue;
        }
        let wanted = view.store.interesting(session.has());
        let current = *declared.get(addr).unwrap_or(&session.am_interested());
        if wanted && !current {
            declared.insert(*addr, true);
            actions.push(Action::Send(*addr, Message::Interested));
        } else if !wanted && current {
            declared.insert(*addr, false);
            actions.push(Action::Send(*addr, Message::NotInterested));
        }
    }
    actions
}

/// Fills each unchoked peer's pipeline from an ordered piece preference.
fn request_actions(
    view: &SwarmView,
    piece_order: impl Fn(&SwarmView, &PeerSession) -> Vec<u32>,
) -> Vec<Action> {
    let mut actions = Vec::new();
    let mut requested = requested_everywhere(view);

    for (addr, session) in view.peers.iter() {
        if !session.is_active() || session.choking_me() {
            continue;
        }
        let mut capacity = view
            .config
            .max_pipeline
            .saturating_sub(session.inflight_requests());
        if capacity == 0 {
            continue;
        }
        let mut own: HashSet<(u32, u32)> = session.requested_blocks().collect();

        for piece in piece_order(view, session) {
            while capacity > 0 {
                let Some((begin, length)) = next_block(view.store, piece, &requested) else {
                    break;
                };
                requested.insert((piece, begin));
                own.insert((piece, begin));
                actions.push(Action::Send(
                    *addr,
                    Message::Request { index: piece, begin, length },
                ));
                capacity -= 1;
            }
            if capacity == 0 {
                break;
            }
        }

        // Everything left is already in flight somewhere. Rather than
        // idle, duplicate the first gap this peer can serve, as long as
        // this peer itself is not the one waiting on it; the store
        // discards whichever copy loses the race.
        if capacity > 0 {
            for piece in piece_order(view, session) {
                if let Some(begin) = view.store.next_gap(piece) {
                    let length = MAX_REQUEST_BYTES.min(view.store.piece_size(piece) - begin);
                    if !own.contains(&(piece, begin)) {
                        actions.push(Action::Send(
                            *addr,
                            Message::Request { index: piece, begin, length },
                        ));
                        break;
                    }
                }
            }
        }
    }
    actions
}

fn connect_actions(event: &Event, view: &SwarmView) -> Vec<Action> {
    let Event::TrackerResponse { peers, .. } = event else {
        return Vec::new();
    };
    let mut budget = view.config.max_peers.saturating_sub(view.peers.len());
    let mut actions = Vec::new();
    for addr in peers {
        if budget == 0 {
            break;
        }
        if want_peer(*addr, view) {
            actions.push(Action::Connect(*addr));
            budget -= 1;
        }
    }
    actions
}

/// Pieces this peer can give us, rarest first, smallest index breaking
/// ties so runs are reproducible.
fn rarest_order(view: &SwarmView, session: &PeerSession) -> Vec<u32> {
    let mut pieces: Vec<u32> = view
        .store
        .missing_pieces()
        .filter(|i| session.has().get(*i as usize).copied().unwrap_or(false))
        .collect();
    pieces.sort_by_key(|i| (view.store.frequency(*i), *i));
    pieces
}

/// Rarest-first piece selection; the default policy.
#[derive(Default)]
pub struct RarestFirst {
    declared_interest: HashMap<SocketAddr, bool>,
}

impl Strategy for RarestFirst {
    fn on_tick(&mut self, view: &SwarmView) -> Vec<Action> {
        let mut actions = interest_actions(view, &mut self.declared_interest);
        actions.extend(request_actions(view, rarest_order));
        actions.extend(unchoke_actions(view));
        actions
    }

    fn on_event(&mut self, event: &Event, view: &SwarmView) -> Vec<Action> {
        match event {
            Event::HaveCompletePiece(index) => {
                vec![Action::Broadcast(Message::Have { piece_index: *index })]
            }
            Event::PeerDropped(addr) => {
                self.declared_interest.remove(addr);
                Vec::new()
            }
            _ => connect_actions(event, view),
        }
    }
}

/// Wanted pieces this peer holds, in uniformly random order.
fn random_order(view: &SwarmView, session: &PeerSession) -> Vec<u32> {
    let mut rng = rand::rng();
    view.store
        .missing_pieces()
        .filter(|i| session.has().get(*i as usize).copied().unwrap_or(false))
        .choose_multiple(&mut rng, view.store.num_pieces())
}

/// Uniform-random piece selection. Enough to leech; kept as the simplest
/// demonstration that policies swap cleanly.
#[derive(Default)]
pub struct RandomPiece {
    declared_interest: HashMap<SocketAddr, bool>,
}

impl Strategy for RandomPiece {
    fn on_tick(&mut self, view: &SwarmView) -> Vec<Action> {
        let mut actions = interest_actions(view, &mut self.declared_interest);
        actions.extend(request_actions(view, random_order));
        actions.extend(unchoke_actions(view));
        actions
    }

    fn on_event(&mut self, event: &Event, view: &SwarmView) -> Vec<Action> {
        match event {
            Event::HaveCompletePiece(index) => {
                vec![Action::Broadcast(Message::Have { piece_index: *index })]
            }
            Event::PeerDropped(addr) => {
                self.declared_interest.remove(addr);
                Vec::new()
            }
            _ => connect_actions(event, view),
        }
    }
}

/// Unchoke whoever declares interest. No reciprocation accounting; this
/// client's purpose is leeching, and serving the occasional block back is
/// just good citizenship.
fn unchoke_actions(view: &SwarmView) -> Vec<Action> {
    let mut actions = Vec::new();
    for (addr, session) in view.peers.iter() {
        if !session.is_active() {
            continue;
        }
        if session.interested_me() && session.am_choking() {
            actions.push(Action::Send(*addr, Message::Unchoke));
        } else if !session.interested_me() && !session.am_choking() {
            actions.push(Action::Send(*addr, Message::Choke));
        }
    }
    actions
}
