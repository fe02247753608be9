//! Client side of the UDP transport
//!
//! [`ClientConnection::connect`] performs the handshake inline and then hands
//! the socket to a background task, mirroring the server driver: sends go in
//! through a command channel, payloads come back out through an event channel.

use crate::transport::channel::PeerChannel;
use crate::transport::datagram::Datagram;
use crate::transport::{Delivery, TransportConfig, TransportError, MAX_DATAGRAM_SIZE};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};

#[derive(Debug)]
enum Command {
    Send { payload: Vec<u8>, delivery: Delivery },
    Disconnect,
}

#[derive(Debug)]
enum Event {
    Payload(Vec<u8>),
    Closed(TransportError),
}

/// An accepted connection to a relay server
pub struct ClientConnection {
    local_addr: SocketAddr,
    server_addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<Event>,
}

impl ClientConnection {
    /// Sends `Connect { key, nonce }` until the server accepts, rejects, or
    /// `connect_timeout` elapses.
    pub async fn connect(
        server_addr: SocketAddr,
        key: &str,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let bind_addr = if server_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server_addr).await?;
        let local_addr = socket.local_addr()?;

        let connect = Datagram::Connect {
            key: key.to_string(),
            nonce: rand::random(),
        }
        .encode()?;

        let started = Instant::now();
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut early = Vec::new();

        info!("Connecting to {}", server_addr);
        'handshake: loop {
            if started.elapsed() >= config.connect_timeout {
                return Err(TransportError::TimedOut);
            }
            socket.send(&connect).await?;

            let deadline = Instant::now() + config.connect_retry_interval;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let len = match timeout(remaining, socket.recv(&mut buffer)).await {
                    Ok(Ok(len)) => len,
                    Ok(Err(e)) => {
                        // Nobody listening yet; wait out this attempt and retry
                        debug!("Handshake receive failed: {}", e);
                        tokio::time::sleep(remaining).await;
                        continue 'handshake;
                    }
                    Err(_) => continue 'handshake,
                };

                match Datagram::decode(&buffer[..len]) {
                    Ok(Datagram::Accept) => break 'handshake,
                    Ok(Datagram::Reject { reason }) => {
                        return Err(TransportError::Rejected(reason));
                    }
                    // Accept was lost but the server already talks to us
                    Ok(datagram @ Datagram::Reliable { .. }) => {
                        early.push(datagram);
                        break 'handshake;
                    }
                    Ok(other) => debug!("Ignoring {:?} during handshake", other),
                    Err(e) => warn!("Undecodable datagram during handshake: {}", e),
                }
            }
        }
        info!("Connected to {} from {}", server_addr, local_addr);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut driver = Driver {
            socket,
            channel: PeerChannel::new(Instant::now()),
            config,
            events: event_tx,
        };
        for datagram in early {
            driver.handle_datagram(datagram).await;
        }
        tokio::spawn(driver.run(command_rx));

        Ok(Self {
            local_addr,
            server_addr,
            commands: command_tx,
            events: event_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn send(&self, payload: &[u8], delivery: Delivery) -> Result<(), TransportError> {
        self.commands
            .send(Command::Send {
                payload: payload.to_vec(),
                delivery,
            })
            .map_err(|_| TransportError::Disconnected)
    }

    /// Waits for the next payload from the server.
    pub async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        match self.events.recv().await {
            Some(Event::Payload(payload)) => Ok(payload),
            Some(Event::Closed(e)) => Err(e),
            None => Err(TransportError::Disconnected),
        }
    }

    /// Returns an already received payload without waiting.
    pub fn try_recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        match self.events.try_recv() {
            Ok(Event::Payload(payload)) => Some(Ok(payload)),
            Ok(Event::Closed(e)) => Some(Err(e)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => Some(Err(TransportError::Disconnected)),
        }
    }

    /// Tells the server we are leaving and stops the background task.
    pub fn disconnect(self) {
        let _ = self.commands.send(Command::Disconnect);
    }
}

struct Driver {
    socket: UdpSocket,
    channel: PeerChannel,
    config: TransportConfig,
    events: mpsc::UnboundedSender<Event>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut maintenance = interval(self.config.resend_interval / 2);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                received = self.socket.recv(&mut buffer) => {
                    match received {
                        Ok(len) => match Datagram::decode(&buffer[..len]) {
                            Ok(datagram) => {
                                if !self.handle_datagram(datagram).await {
                                    break;
                                }
                            }
                            Err(e) => warn!("Undecodable datagram from server: {}", e),
                        },
                        Err(e) => {
                            // ICMP port unreachable surfaces here once the server is gone
                            debug!("Error receiving from server: {}", e);
                        }
                    }
                }

                command = commands.recv() => {
                    match command {
                        Some(Command::Send { payload, delivery }) => {
                            let datagram = self.channel.wrap(&payload, delivery, Instant::now());
                            self.send_datagram(&datagram).await;
                        }
                        Some(Command::Disconnect) | None => {
                            self.send_datagram(&Datagram::Disconnect).await;
                            break;
                        }
                    }
                }

                _ = maintenance.tick() => {
                    let now = Instant::now();
                    if self.channel.is_timed_out(now, self.config.disconnect_timeout) {
                        warn!("Server stopped responding");
                        let _ = self.events.send(Event::Closed(TransportError::TimedOut));
                        break;
                    }
                    for datagram in self.channel.due_resends(now, self.config.resend_interval) {
                        self.send_datagram(&datagram).await;
                    }
                    if self.channel.needs_keepalive(now, self.config.keepalive_interval) {
                        self.channel.mark_sent(now);
                        self.send_datagram(&Datagram::Ping).await;
                    }
                }
            }
        }
    }

    /// Returns false when the connection is over.
    async fn handle_datagram(&mut self, datagram: Datagram) -> bool {
        self.channel.touch(Instant::now());
        match datagram {
            Datagram::Reliable { sequence, payload } => {
                let ready = self.channel.receive_reliable(sequence, payload);
                self.send_datagram(&Datagram::Ack { sequence }).await;
                for payload in ready {
                    if self.events.send(Event::Payload(payload)).is_err() {
                        return false;
                    }
                }
                true
            }
            Datagram::Unreliable { sequence, payload } => {
                match self.channel.receive_unreliable(sequence, payload) {
                    Some(payload) => self.events.send(Event::Payload(payload)).is_ok(),
                    None => true,
                }
            }
            Datagram::Ack { sequence } => {
                self.channel.acknowledge(sequence);
                true
            }
            Datagram::Disconnect => {
                info!("Server closed the connection");
                let _ = self.events.send(Event::Closed(TransportError::Disconnected));
                false
            }
            Datagram::Reject { reason } => {
                let _ = self.events.send(Event::Closed(TransportError::Rejected(reason)));
                false
            }
            Datagram::Accept | Datagram::Ping | Datagram::Connect { .. } => true,
        }
    }

    async fn send_datagram(&self, datagram: &Datagram) {
        match datagram.encode() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send(&bytes).await {
                    error!("Failed to send to server: {}", e);
                }
            }
            Err(e) => error!("Failed to encode datagram: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::udp::UdpTransport;
    use crate::transport::{RejectReason, Transport, TransportEvent};
    use std::time::Duration;

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

    /// Accepts or rejects the first connection request in the background.
    async fn answer_first_request(
        transport: &mut UdpTransport,
        reject: Option<RejectReason>,
    ) -> TransportEvent {
        let event = next_event(transport).await;
        if let TransportEvent::ConnectionRequest(request) = &event {
            match reject {
                Some(reason) => transport.reject(request, reason),
                None => transport.accept(request),
            }
        }
        event
    }

    #[tokio::test]
    async fn test_connect_and_exchange_payloads() {
        let mut server = UdpTransport::bind("127.0.0.1:0", TransportConfig::default())
            .await
            .unwrap();
        let server_addr = server.local_addr();

        let connecting = tokio::spawn(async move {
            ClientConnection::connect(server_addr, "104", TransportConfig::default()).await
        });

        let TransportEvent::ConnectionRequest(request) =
            answer_first_request(&mut server, None).await
        else {
            panic!("Expected a connection request");
        };
        let mut client = connecting.await.unwrap().unwrap();

        server.send(request.peer, b"hello", Delivery::ReliableOrdered);
        let payload = timeout(Duration::from_secs(2), client.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"hello");

        client.send(b"back", Delivery::Unreliable).unwrap();
        assert_eq!(
            next_event(&mut server).await,
            TransportEvent::Received {
                peer: request.peer,
                payload: b"back".to_vec(),
            }
        );

        client.disconnect();
        match next_event(&mut server).await {
            TransportEvent::Disconnected { peer, .. } => assert_eq!(peer, request.peer),
            other => panic!("Unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejection_is_reported() {
        let mut server = UdpTransport::bind("127.0.0.1:0", TransportConfig::default())
            .await
            .unwrap();
        let server_addr = server.local_addr();

        let connecting = tokio::spawn(async move {
            ClientConnection::connect(server_addr, "104wrong", TransportConfig::default()).await
        });
        answer_first_request(&mut server, Some(RejectReason::WrongPassword)).await;

        match connecting.await.unwrap() {
            Err(TransportError::Rejected(reason)) => {
                assert_eq!(reason, RejectReason::WrongPassword)
            }
            Err(e) => panic!("Unexpected error {}", e),
            Ok(_) => panic!("Connection should have been rejected"),
        }
    }

    #[tokio::test]
    async fn test_connect_times_out_without_server() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = TransportConfig {
            connect_timeout: Duration::from_millis(300),
            connect_retry_interval: Duration::from_millis(50),
            ..TransportConfig::default()
        };

        let result = ClientConnection::connect(silent.local_addr().unwrap(), "104", config).await;
        assert!(matches!(result, Err(TransportError::TimedOut)));
    }
}
