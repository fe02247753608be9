//! Relay loop tying the transport, registry, scheduler and culling together

use crate::broadcast::{broadcast_message, encode_frame, send_to};
use crate::config::ServerSettings;
use crate::handshake::verify_key;
use crate::registry::SessionRegistry;
use crate::scheduler::{BandwidthScheduler, PassReport, SchedulerConfig};
use crate::spatial::{CullingEngine, SharedSpatial, SpatialTable};
use log::{debug, info, warn};
use shared::protocol::{deframe, ClientMessage, ServerMessage};
use shared::transport::{
    ConnectionRequest, Delivery, DisconnectReason, PeerHandle, RejectReason, Transport,
    TransportEvent,
};
use shared::{ClientId, MAX_CLIENTS};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};

/// Main relay server, generic over the transport it runs on
pub struct RelayServer<T: Transport> {
    pub(crate) transport: T,
    pub(crate) settings: ServerSettings,
    pub(crate) registry: SessionRegistry,
    pub(crate) spatial: SharedSpatial,
    pub(crate) scheduler: BandwidthScheduler,
    culling: CullingEngine,
    tick_duration: Duration,
    last_tick: Instant,
    tick: u64,
}

impl<T: Transport> RelayServer<T> {
    pub fn new(transport: T, settings: ServerSettings, tick_rate: u32) -> Self {
        let now = Instant::now();
        let tick_rate = tick_rate.max(1);
        let spatial = SpatialTable::shared();
        let culling = CullingEngine::new(
            Arc::clone(&spatial),
            settings.static_update_interval(),
            settings.player_transmit_cutoff,
        );
        let scheduler = BandwidthScheduler::new(SchedulerConfig::from_settings(&settings, tick_rate), now);

        Self {
            transport,
            settings,
            registry: SessionRegistry::new(MAX_CLIENTS),
            spatial,
            scheduler,
            culling,
            tick_duration: Duration::from_secs_f64(1.0 / tick_rate as f64),
            last_tick: now,
            tick: 0,
        }
    }

    /// Caps the number of simultaneous clients below the id space.
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.registry = SessionRegistry::new(max_clients);
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn spatial(&self) -> SharedSpatial {
        Arc::clone(&self.spatial)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// One server tick: drain transport events, run a scheduling pass and
    /// start a culling pass if one is due.
    pub async fn tick(&mut self, now: Instant) -> PassReport {
        while let Some(event) = self.transport.poll_event() {
            self.handle_event(event, now).await;
        }

        let report = self
            .scheduler
            .run_pass(&mut self.registry, &self.spatial, &mut self.transport, now)
            .await;

        let elapsed = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        // Detached; completion shows up through the engine's state flag
        let _ = self.culling.advance(elapsed);

        self.tick += 1;
        if self.tick % 600 == 0 && !self.registry.is_empty() {
            debug!(
                "Tick {}: {} clients, queues {:?}",
                self.tick,
                self.registry.len(),
                self.scheduler.depths()
            );
        }
        report
    }

    /// Ticks at the configured rate until `shutdown` resolves.
    pub async fn run_until<F: Future>(&mut self, shutdown: F) {
        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("Relay started, ticking every {:?}", self.tick_duration);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    self.tick(Instant::now()).await;
                }
                _ = &mut shutdown => {
                    info!("Relay shutting down");
                    break;
                }
            }
        }

        let peers: Vec<PeerHandle> = self.registry.iter().map(|session| session.peer).collect();
        for peer in peers {
            self.transport.disconnect(peer);
        }
    }

    pub(crate) async fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::ConnectionRequest(request) => {
                self.handle_connection_request(request, now).await;
            }
            TransportEvent::Received { peer, payload } => {
                self.handle_payload(peer, &payload, now).await;
            }
            TransportEvent::Disconnected { peer, reason } => {
                self.handle_disconnect(peer, reason).await;
            }
        }
    }

    async fn handle_connection_request(&mut self, request: ConnectionRequest, now: Instant) {
        if let Err(e) = verify_key(&request.key, &self.settings.password) {
            warn!("Rejecting connection from {}: {}", request.addr, e);
            self.transport.reject(&request, e.reject_reason());
            return;
        }

        let Some(id) = self.registry.register(request.peer, request.addr, now) else {
            warn!(
                "Maximum number of clients reached, rejecting connection from {}",
                request.addr
            );
            self.transport.reject(&request, RejectReason::ServerFull);
            return;
        };

        self.transport.accept(&request);
        self.spatial.write().await.insert(id);
        info!("Client {} connected from {}", id, request.addr);

        self.send_join_replay(request.peer, id);
    }

    /// Sends the new peer its id, then everything it needs to know about
    /// each existing peer.
    fn send_join_replay(&mut self, peer: PeerHandle, id: ClientId) {
        if let Some(framed) = encode_frame(&ServerMessage::IdentityAssign { id }) {
            send_to(&mut self.transport, peer, &framed, Delivery::ReliableOrdered);
        }

        let mut replay = Vec::new();
        for existing in self.registry.iter().filter(|session| session.peer != peer) {
            replay.push(encode_frame(&ServerMessage::PeerAnnounce { id: existing.id }));
            if let Some(info) = &existing.info {
                replay.push(encode_frame(&ServerMessage::InfoUpdate {
                    id: existing.id,
                    color: info.color,
                    name: info.name.clone(),
                }));
            }
            for framed in existing.persistent_state.values() {
                replay.push(Some(framed.clone()));
            }
        }

        for framed in replay.into_iter().flatten() {
            send_to(&mut self.transport, peer, &framed, Delivery::ReliableOrdered);
        }
    }

    async fn handle_payload(&mut self, peer: PeerHandle, payload: &[u8], now: Instant) {
        let message = match deframe(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed packet from {}: {}", peer, e);
                return;
            }
        };

        let Some(id) = self.registry.id_of(peer) else {
            debug!("Dropping packet from unregistered {}", peer);
            return;
        };

        match ClientMessage::decode(message) {
            Ok(message) => self.handle_message(peer, id, message, now).await,
            Err(e) => warn!("Client {}: {}", id, e),
        }
    }

    async fn handle_disconnect(&mut self, peer: PeerHandle, reason: DisconnectReason) {
        let Some(id) = self.registry.id_of(peer) else {
            return;
        };

        broadcast_message(
            &mut self.transport,
            &self.registry,
            &ServerMessage::PeerDisconnect { id },
            Some(peer),
        );

        if let Some(session) = self.registry.remove(peer) {
            info!("{} disconnected ({})", session.label(), reason);
        }
        self.spatial.write().await.remove(id);
    }
}
