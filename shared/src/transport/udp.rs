//! Server side of the UDP transport
//!
//! [`UdpTransport`] owns nothing but two channels. The socket lives in a
//! spawned driver task that reads datagrams, runs the per-peer reliability
//! state and pushes [`TransportEvent`]s back; the relay loop drains them with
//! [`Transport::poll_event`] once per tick and never waits on the network.

use crate::transport::channel::PeerChannel;
use crate::transport::datagram::Datagram;
use crate::transport::{
    ConnectionRequest, Delivery, DisconnectReason, PeerHandle, RejectReason, Transport,
    TransportConfig, TransportError, TransportEvent, MAX_DATAGRAM_SIZE,
};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Requests sent from the relay loop to the driver task
#[derive(Debug)]
enum Command {
    Send {
        peer: PeerHandle,
        payload: Vec<u8>,
        delivery: Delivery,
    },
    Accept {
        peer: PeerHandle,
    },
    Reject {
        peer: PeerHandle,
        reason: RejectReason,
    },
    Disconnect {
        peer: PeerHandle,
    },
}

pub struct UdpTransport {
    local_addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl UdpTransport {
    /// Binds the socket and spawns the driver task.
    pub async fn bind(addr: &str, config: TransportConfig) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("Transport listening on {}", local_addr);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            socket,
            config,
            peers: HashMap::new(),
            by_addr: HashMap::new(),
            next_handle: 0,
            events: event_tx,
        };
        tokio::spawn(driver.run(command_rx));

        Ok(Self {
            local_addr,
            commands: command_tx,
            events: event_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            error!("Transport driver is gone, dropping command");
        }
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, peer: PeerHandle, payload: &[u8], delivery: Delivery) {
        self.command(Command::Send {
            peer,
            payload: payload.to_vec(),
            delivery,
        });
    }

    fn accept(&mut self, request: &ConnectionRequest) {
        self.command(Command::Accept { peer: request.peer });
    }

    fn reject(&mut self, request: &ConnectionRequest, reason: RejectReason) {
        self.command(Command::Reject {
            peer: request.peer,
            reason,
        });
    }

    fn disconnect(&mut self, peer: PeerHandle) {
        self.command(Command::Disconnect { peer });
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.try_recv().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    /// Connect request surfaced, waiting for accept or reject
    Pending,
    Connected,
}

struct RemotePeer {
    addr: SocketAddr,
    /// Nonce of the connect attempt this peer came from
    nonce: u64,
    state: PeerState,
    channel: PeerChannel,
}

struct Driver {
    socket: UdpSocket,
    config: TransportConfig,
    peers: HashMap<PeerHandle, RemotePeer>,
    by_addr: HashMap<SocketAddr, PeerHandle>,
    next_handle: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut maintenance = interval(self.config.resend_interval / 2);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((len, addr)) => {
                            if !self.handle_datagram(&buffer[..len], addr).await {
                                break;
                            }
                        }
                        Err(e) => error!("Error receiving datagram: {}", e),
                    }
                }

                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            debug!("Transport handle dropped, stopping driver");
                            break;
                        }
                    }
                }

                _ = maintenance.tick() => {
                    if !self.maintain(Instant::now()).await {
                        break;
                    }
                }
            }
        }

        // Tell every connected peer we are going away
        let peers: Vec<PeerHandle> = self.peers.keys().copied().collect();
        for peer in peers {
            self.send_datagram(peer, &Datagram::Disconnect).await;
        }
    }

    /// Returns false once the relay side stopped listening for events.
    fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    async fn handle_datagram(&mut self, bytes: &[u8], addr: SocketAddr) -> bool {
        let datagram = match Datagram::decode(bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!("Undecodable datagram from {}: {}", addr, e);
                return true;
            }
        };
        let now = Instant::now();

        let known = self.by_addr.get(&addr).copied();
        let Some(peer) = known else {
            return match datagram {
                Datagram::Connect { key, nonce } => self.open_pending(addr, key, nonce, now),
                other => {
                    debug!("Ignoring {} from unknown address {}", kind(&other), addr);
                    true
                }
            };
        };

        let Some(remote) = self.peers.get_mut(&peer) else {
            self.by_addr.remove(&addr);
            return true;
        };
        remote.channel.touch(now);
        let state = remote.state;
        let current_nonce = remote.nonce;

        match (datagram, state) {
            (Datagram::Connect { key, nonce }, _) if nonce != current_nonce => {
                // Client restarted on the same address; the old session is over.
                // Pending peers are reported too since the relay may have
                // accepted one whose Accept command has not run yet.
                debug!("{} reconnected from {} with a new attempt", peer, addr);
                self.forget(peer);
                if !self.emit(TransportEvent::Disconnected {
                    peer,
                    reason: DisconnectReason::Replaced,
                }) {
                    return false;
                }
                self.open_pending(addr, key, nonce, now)
            }
            (Datagram::Connect { .. }, PeerState::Connected) => {
                // The accept got lost on the way
                self.send_datagram(peer, &Datagram::Accept).await;
                true
            }
            (Datagram::Connect { .. }, PeerState::Pending) => true,

            (Datagram::Disconnect, PeerState::Connected) => {
                self.forget(peer);
                self.emit(TransportEvent::Disconnected {
                    peer,
                    reason: DisconnectReason::RemoteClosed,
                })
            }
            (Datagram::Disconnect, PeerState::Pending) => {
                self.forget(peer);
                true
            }

            (Datagram::Reliable { sequence, payload }, PeerState::Connected) => {
                let ready = remote.channel.receive_reliable(sequence, payload);
                self.send_datagram(peer, &Datagram::Ack { sequence }).await;
                for payload in ready {
                    if !self.emit(TransportEvent::Received { peer, payload }) {
                        return false;
                    }
                }
                true
            }

            (Datagram::Unreliable { sequence, payload }, PeerState::Connected) => {
                match remote.channel.receive_unreliable(sequence, payload) {
                    Some(payload) => self.emit(TransportEvent::Received { peer, payload }),
                    None => true,
                }
            }

            (Datagram::Ack { sequence }, PeerState::Connected) => {
                remote.channel.acknowledge(sequence);
                true
            }

            (Datagram::Ping, _) => true,

            (other, state) => {
                debug!("Ignoring {} from {} in state {:?}", kind(&other), peer, state);
                true
            }
        }
    }

    fn open_pending(&mut self, addr: SocketAddr, key: String, nonce: u64, now: Instant) -> bool {
        let peer = PeerHandle(self.next_handle);
        self.next_handle += 1;

        debug!("Connection request from {} as {}", addr, peer);
        self.peers.insert(
            peer,
            RemotePeer {
                addr,
                nonce,
                state: PeerState::Pending,
                channel: PeerChannel::new(now),
            },
        );
        self.by_addr.insert(addr, peer);

        self.emit(TransportEvent::ConnectionRequest(ConnectionRequest {
            peer,
            addr,
            key,
        }))
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                peer,
                payload,
                delivery,
            } => {
                let now = Instant::now();
                let datagram = match self.peers.get_mut(&peer) {
                    Some(remote) if remote.state == PeerState::Connected => {
                        remote.channel.wrap(&payload, delivery, now)
                    }
                    _ => {
                        debug!("Dropping send to unknown {}", peer);
                        return;
                    }
                };
                self.send_datagram(peer, &datagram).await;
            }

            Command::Accept { peer } => {
                match self.peers.get_mut(&peer) {
                    Some(remote) => remote.state = PeerState::Connected,
                    None => {
                        debug!("Cannot accept {}, request is gone", peer);
                        return;
                    }
                }
                self.send_datagram(peer, &Datagram::Accept).await;
            }

            Command::Reject { peer, reason } => {
                self.send_datagram(peer, &Datagram::Reject { reason }).await;
                self.forget(peer);
            }

            Command::Disconnect { peer } => {
                self.send_datagram(peer, &Datagram::Disconnect).await;
                self.forget(peer);
            }
        }
    }

    /// Resends, keep-alives and timeouts. Returns false if the relay side is gone.
    async fn maintain(&mut self, now: Instant) -> bool {
        let mut outgoing = Vec::new();
        let mut timed_out = Vec::new();

        for (&peer, remote) in self.peers.iter_mut() {
            if remote.channel.is_timed_out(now, self.config.disconnect_timeout) {
                timed_out.push((peer, remote.state));
                continue;
            }
            if remote.state != PeerState::Connected {
                continue;
            }

            for datagram in remote
                .channel
                .due_resends(now, self.config.resend_interval)
            {
                outgoing.push((peer, datagram));
            }
            if remote
                .channel
                .needs_keepalive(now, self.config.keepalive_interval)
            {
                remote.channel.mark_sent(now);
                outgoing.push((peer, Datagram::Ping));
            }
        }

        for (peer, datagram) in outgoing {
            self.send_datagram(peer, &datagram).await;
        }

        for (peer, state) in timed_out {
            self.forget(peer);
            if state == PeerState::Connected {
                info!("{} timed out", peer);
                if !self.emit(TransportEvent::Disconnected {
                    peer,
                    reason: DisconnectReason::Timeout,
                }) {
                    return false;
                }
            }
        }
        true
    }

    async fn send_datagram(&self, peer: PeerHandle, datagram: &Datagram) {
        let Some(remote) = self.peers.get(&peer) else {
            return;
        };
        match datagram.encode() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, remote.addr).await {
                    error!("Failed to send to {} ({}): {}", peer, remote.addr, e);
                }
            }
            Err(e) => error!("Failed to encode datagram for {}: {}", peer, e),
        }
    }

    fn forget(&mut self, peer: PeerHandle) {
        if let Some(remote) = self.peers.remove(&peer) {
            self.by_addr.remove(&remote.addr);
        }
    }
}

/// Short label for log lines, payloads can be large
fn kind(datagram: &Datagram) -> &'static str {
    match datagram {
        Datagram::Connect { .. } => "Connect",
        Datagram::Accept => "Accept",
        Datagram::Reject { .. } => "Reject",
        Datagram::Disconnect => "Disconnect",
        Datagram::Ping => "Ping",
        Datagram::Reliable { .. } => "Reliable",
        Datagram::Ack { .. } => "Ack",
        Datagram::Unreliable { .. } => "Unreliable",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_event(transport: &mut UdpTransport) -> TransportEvent {
        timeout(Duration::from_secs(2), async {
            loop {
                if let Some(event) = transport.poll_event() {
                    return event;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no transport event")
    }

    async fn raw_socket(server: SocketAddr) -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(server).await.unwrap();
        socket
    }

    async fn recv_datagram(socket: &UdpSocket) -> Datagram {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let len = timeout(Duration::from_secs(2), socket.recv(&mut buffer))
            .await
            .expect("no datagram")
            .unwrap();
        Datagram::decode(&buffer[..len]).unwrap()
    }

    async fn connect_and_accept(
        transport: &mut UdpTransport,
        socket: &UdpSocket,
        nonce: u64,
    ) -> ConnectionRequest {
        let connect = Datagram::Connect {
            key: "104".to_string(),
            nonce,
        };
        socket.send(&connect.encode().unwrap()).await.unwrap();
        let TransportEvent::ConnectionRequest(request) = next_event(transport).await else {
            panic!("Expected a connection request");
        };
        transport.accept(&request);
        assert_eq!(recv_datagram(socket).await, Datagram::Accept);
        request
    }

    #[tokio::test]
    async fn test_connect_request_surfaces_key() {
        let mut transport = UdpTransport::bind("127.0.0.1:0", TransportConfig::default())
            .await
            .unwrap();
        let socket = raw_socket(transport.local_addr()).await;

        let connect = Datagram::Connect {
            key: "104pass".to_string(),
            nonce: 1,
        };
        socket.send(&connect.encode().unwrap()).await.unwrap();

        match next_event(&mut transport).await {
            TransportEvent::ConnectionRequest(request) => {
                assert_eq!(request.key, "104pass");
                assert_eq!(request.addr, socket.local_addr().unwrap());
            }
            other => panic!("Unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reject_is_delivered_to_client() {
        let mut transport = UdpTransport::bind("127.0.0.1:0", TransportConfig::default())
            .await
            .unwrap();
        let socket = raw_socket(transport.local_addr()).await;

        let connect = Datagram::Connect {
            key: "nope".to_string(),
            nonce: 1,
        };
        socket.send(&connect.encode().unwrap()).await.unwrap();

        let TransportEvent::ConnectionRequest(request) = next_event(&mut transport).await else {
            panic!("Expected a connection request");
        };
        transport.reject(&request, RejectReason::IncompatibleVersion);

        assert_eq!(
            recv_datagram(&socket).await,
            Datagram::Reject {
                reason: RejectReason::IncompatibleVersion
            }
        );
    }

    #[tokio::test]
    async fn test_reliable_payload_is_acked_and_received() {
        let mut transport = UdpTransport::bind("127.0.0.1:0", TransportConfig::default())
            .await
            .unwrap();
        let socket = raw_socket(transport.local_addr()).await;

        let request = connect_and_accept(&mut transport, &socket, 1).await;

        let reliable = Datagram::Reliable {
            sequence: 0,
            payload: vec![3, 0, 0x0B],
        };
        socket.send(&reliable.encode().unwrap()).await.unwrap();

        assert_eq!(recv_datagram(&socket).await, Datagram::Ack { sequence: 0 });
        assert_eq!(
            next_event(&mut transport).await,
            TransportEvent::Received {
                peer: request.peer,
                payload: vec![3, 0, 0x0B],
            }
        );
    }

    #[tokio::test]
    async fn test_repeated_connect_resends_accept() {
        let mut transport = UdpTransport::bind("127.0.0.1:0", TransportConfig::default())
            .await
            .unwrap();
        let socket = raw_socket(transport.local_addr()).await;
        connect_and_accept(&mut transport, &socket, 5).await;

        let retry = Datagram::Connect {
            key: "104".to_string(),
            nonce: 5,
        };
        socket.send(&retry.encode().unwrap()).await.unwrap();

        assert_eq!(recv_datagram(&socket).await, Datagram::Accept);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.poll_event(), None);
    }

    #[tokio::test]
    async fn test_restarted_client_on_same_address_gets_new_session() {
        let mut transport = UdpTransport::bind("127.0.0.1:0", TransportConfig::default())
            .await
            .unwrap();
        let socket = raw_socket(transport.local_addr()).await;
        let first = connect_and_accept(&mut transport, &socket, 1).await;

        for sequence in 0..5u16 {
            let reliable = Datagram::Reliable {
                sequence,
                payload: vec![sequence as u8],
            };
            socket.send(&reliable.encode().unwrap()).await.unwrap();
            assert_eq!(recv_datagram(&socket).await, Datagram::Ack { sequence });
            assert_eq!(
                next_event(&mut transport).await,
                TransportEvent::Received {
                    peer: first.peer,
                    payload: vec![sequence as u8],
                }
            );
        }

        // Same socket, fresh attempt, sequence numbers start over
        let restart = Datagram::Connect {
            key: "104again".to_string(),
            nonce: 2,
        };
        socket.send(&restart.encode().unwrap()).await.unwrap();

        assert_eq!(
            next_event(&mut transport).await,
            TransportEvent::Disconnected {
                peer: first.peer,
                reason: DisconnectReason::Replaced,
            }
        );
        let TransportEvent::ConnectionRequest(second) = next_event(&mut transport).await else {
            panic!("Expected a new connection request");
        };
        assert_ne!(second.peer, first.peer);
        assert_eq!(second.key, "104again");
        assert_eq!(second.addr, socket.local_addr().unwrap());

        transport.accept(&second);
        assert_eq!(recv_datagram(&socket).await, Datagram::Accept);

        let reliable = Datagram::Reliable {
            sequence: 0,
            payload: vec![42],
        };
        socket.send(&reliable.encode().unwrap()).await.unwrap();
        assert_eq!(recv_datagram(&socket).await, Datagram::Ack { sequence: 0 });
        assert_eq!(
            next_event(&mut transport).await,
            TransportEvent::Received {
                peer: second.peer,
                payload: vec![42],
            }
        );
    }
}
