//! Session registry for connected peers
//!
//! This module owns everything the relay knows about a connected client that
//! is only touched from the tick loop:
//! - Client id allocation and reclamation (ids 0..=254, 255 means "full")
//! - The session arena, indexed by client id, with the transport's peer
//!   handle as a lookup key
//! - Per-stream sequence gates, toggles and the persistent-state cache that
//!   is replayed to peers joining later
//! - Per-recipient send timestamps used by pose throttling
//!
//! Positions and distant-peer sets live in [`crate::spatial`] instead, since
//! the culling task writes them concurrently.

use log::info;
use shared::protocol::Rgb;
use shared::transport::PeerHandle;
use shared::{ClientId, SequenceGate, INVALID_CLIENT_ID, MAX_CLIENTS};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::Instant;

/// Display name and avatar colour announced by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerInfo {
    pub name: String,
    pub color: Rgb,
}

/// Key of one entry in a session's replay cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateSlot {
    Accessory(u8),
    Jiminy,
    Collision,
}

/// Hands out the lowest free client id
///
/// Reclaimed ids become available again immediately.
#[derive(Debug)]
pub struct IdAllocator {
    in_use: Vec<bool>,
}

impl IdAllocator {
    /// Creates an allocator for `max_clients` ids, capped at [`MAX_CLIENTS`].
    pub fn new(max_clients: usize) -> Self {
        Self {
            in_use: vec![false; max_clients.min(MAX_CLIENTS)],
        }
    }

    /// Returns the first free id, or [`INVALID_CLIENT_ID`] if every id is taken.
    pub fn allocate(&mut self) -> ClientId {
        match self.in_use.iter().position(|used| !used) {
            Some(index) => {
                self.in_use[index] = true;
                index as ClientId
            }
            None => INVALID_CLIENT_ID,
        }
    }

    pub fn reclaim(&mut self, id: ClientId) {
        if let Some(slot) = self.in_use.get_mut(id as usize) {
            *slot = false;
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.iter().filter(|used| **used).count()
    }

    pub fn capacity(&self) -> usize {
        self.in_use.len()
    }
}

/// Relay-side state of one connected client
#[derive(Debug)]
pub struct Session {
    pub id: ClientId,
    pub peer: PeerHandle,
    pub addr: SocketAddr,
    pub connected_at: Instant,

    /// Unset until the first info update arrives
    pub info: Option<PlayerInfo>,
    pub collisions_enabled: bool,
    pub jiminy_enabled: bool,
    /// Animation loop marker from the latest accepted pose
    pub pose_kickoff: u8,

    pub pose_sequence: SequenceGate,
    pub event_sequence: SequenceGate,

    /// Last broadcast message per slot, replayed to new peers
    pub persistent_state: BTreeMap<StateSlot, Vec<u8>>,
    /// When this client's pose was last forwarded to each recipient
    pub last_send_times: HashMap<ClientId, Instant>,
}

impl Session {
    pub fn new(id: ClientId, peer: PeerHandle, addr: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            peer,
            addr,
            connected_at: now,
            info: None,
            collisions_enabled: true,
            jiminy_enabled: false,
            pose_kickoff: 0,
            pose_sequence: SequenceGate::new(),
            event_sequence: SequenceGate::new(),
            persistent_state: BTreeMap::new(),
            last_send_times: HashMap::new(),
        }
    }

    pub fn has_info(&self) -> bool {
        self.info.is_some()
    }

    /// Name for log lines, falls back to the id before info arrives
    pub fn label(&self) -> String {
        match &self.info {
            Some(info) => format!("{}[{}]", info.name, self.id),
            None => format!("[{}]", self.id),
        }
    }
}

/// All connected sessions
///
/// Sessions are stored in an arena indexed by client id; the peer handle map
/// only points into it.
pub struct SessionRegistry {
    sessions: Vec<Option<Session>>,
    by_peer: HashMap<PeerHandle, ClientId>,
    ids: IdAllocator,
}

impl SessionRegistry {
    pub fn new(max_clients: usize) -> Self {
        let ids = IdAllocator::new(max_clients);
        let mut sessions = Vec::with_capacity(ids.capacity());
        sessions.resize_with(ids.capacity(), || None);

        Self {
            sessions,
            by_peer: HashMap::new(),
            ids,
        }
    }

    /// Creates a session for a freshly accepted peer.
    ///
    /// Returns `None` when no client id is free; nothing is created then.
    pub fn register(&mut self, peer: PeerHandle, addr: SocketAddr, now: Instant) -> Option<ClientId> {
        let id = self.ids.allocate();
        if id == INVALID_CLIENT_ID {
            return None;
        }

        self.sessions[id as usize] = Some(Session::new(id, peer, addr, now));
        self.by_peer.insert(peer, id);
        info!("Client {} registered for {} ({})", id, peer, addr);
        Some(id)
    }

    /// Removes the session of `peer`, reclaims its id and scrubs it from
    /// every other session's send timestamps.
    pub fn remove(&mut self, peer: PeerHandle) -> Option<Session> {
        let id = self.by_peer.remove(&peer)?;
        let session = self.sessions.get_mut(id as usize)?.take();
        self.ids.reclaim(id);

        for other in self.sessions.iter_mut().flatten() {
            other.last_send_times.remove(&id);
        }
        session
    }

    pub fn id_of(&self, peer: PeerHandle) -> Option<ClientId> {
        self.by_peer.get(&peer).copied()
    }

    pub fn get(&self, id: ClientId) -> Option<&Session> {
        self.sessions.get(id as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Session> {
        self.sessions.get_mut(id as usize)?.as_mut()
    }

    pub fn by_peer(&self, peer: PeerHandle) -> Option<&Session> {
        self.get(self.id_of(peer)?)
    }

    pub fn by_peer_mut(&mut self, peer: PeerHandle) -> Option<&mut Session> {
        let id = self.id_of(peer)?;
        self.get_mut(id)
    }

    /// Sessions in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter().flatten()
    }

    /// Peer handles and ids of every session except `exclude`
    pub fn recipients(&self, exclude: Option<PeerHandle>) -> Vec<(PeerHandle, ClientId)> {
        self.iter()
            .filter(|session| Some(session.peer) != exclude)
            .map(|session| (session.peer, session.id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ids.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_allocator_hands_out_lowest_free_id() {
        let mut ids = IdAllocator::new(MAX_CLIENTS);
        assert_eq!(ids.allocate(), 0);
        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.allocate(), 2);

        ids.reclaim(1);
        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.allocate(), 3);
    }

    #[test]
    fn test_allocator_exhaustion_returns_sentinel() {
        let mut ids = IdAllocator::new(MAX_CLIENTS);
        for expected in 0..MAX_CLIENTS {
            assert_eq!(ids.allocate() as usize, expected);
        }
        assert_eq!(ids.allocate(), INVALID_CLIENT_ID);
        assert_eq!(ids.in_use(), MAX_CLIENTS);

        ids.reclaim(200);
        assert_eq!(ids.allocate(), 200);
    }

    #[test]
    fn test_allocator_capacity_is_capped() {
        let ids = IdAllocator::new(1000);
        assert_eq!(ids.capacity(), MAX_CLIENTS);
    }

    #[test]
    fn test_connect_disconnect_cycles_never_double_assign() {
        let mut registry = SessionRegistry::new(8);
        let now = Instant::now();
        let mut next_peer = 0u64;
        let mut connected: Vec<PeerHandle> = Vec::new();

        for round in 0..500u64 {
            // Connect until full, then drop a pseudo-random peer
            if round % 3 != 2 || connected.is_empty() {
                let peer = PeerHandle(next_peer);
                next_peer += 1;
                if registry.register(peer, addr(1000), now).is_some() {
                    connected.push(peer);
                } else {
                    assert!(registry.is_full());
                }
            } else {
                let index = (round as usize * 7) % connected.len();
                let peer = connected.swap_remove(index);
                assert!(registry.remove(peer).is_some());
            }

            let ids: Vec<ClientId> = registry.iter().map(|session| session.id).collect();
            let unique: HashSet<ClientId> = ids.iter().copied().collect();
            assert_eq!(ids.len(), unique.len());
            assert!(ids.len() <= 8);
            assert!(ids.iter().all(|id| (*id as usize) < 8));
        }
    }

    #[test]
    fn test_lookup_by_peer() {
        let mut registry = SessionRegistry::new(MAX_CLIENTS);
        let now = Instant::now();

        let a = registry.register(PeerHandle(10), addr(1), now).unwrap();
        let b = registry.register(PeerHandle(11), addr(2), now).unwrap();

        assert_eq!(registry.id_of(PeerHandle(10)), Some(a));
        assert_eq!(registry.by_peer(PeerHandle(11)).unwrap().id, b);
        assert!(registry.by_peer(PeerHandle(12)).is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_reclaims_id_and_send_times() {
        let mut registry = SessionRegistry::new(MAX_CLIENTS);
        let now = Instant::now();

        let a = registry.register(PeerHandle(1), addr(1), now).unwrap();
        let b = registry.register(PeerHandle(2), addr(2), now).unwrap();
        registry.get_mut(a).unwrap().last_send_times.insert(b, now);

        let removed = registry.remove(PeerHandle(2)).unwrap();
        assert_eq!(removed.id, b);
        assert!(registry.get(a).unwrap().last_send_times.is_empty());
        assert!(registry.remove(PeerHandle(2)).is_none());

        // The id is free for the very next connection
        assert_eq!(registry.register(PeerHandle(3), addr(3), now), Some(b));
    }

    #[test]
    fn test_recipients_exclude_sender() {
        let mut registry = SessionRegistry::new(MAX_CLIENTS);
        let now = Instant::now();
        for handle in 0..3 {
            registry.register(PeerHandle(handle), addr(handle as u16), now);
        }

        let recipients = registry.recipients(Some(PeerHandle(1)));
        assert_eq!(recipients, vec![(PeerHandle(0), 0), (PeerHandle(2), 2)]);
        assert_eq!(registry.recipients(None).len(), 3);
    }

    #[test]
    fn test_session_label() {
        let mut session = Session::new(4, PeerHandle(0), addr(1), Instant::now());
        assert_eq!(session.label(), "[4]");
        session.info = Some(PlayerInfo {
            name: "Nate".to_string(),
            color: Rgb::new(1, 2, 3),
        });
        assert_eq!(session.label(), "Nate[4]");
    }
}
