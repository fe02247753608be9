//! Headless bot that plays a player for load and smoke testing
//!
//! A [`Bot`] connects like a real mod client, announces its name and colour,
//! then streams poses at a fixed rate while feeding everything the server
//! sends into a [`Roster`].

use crate::roster::{Roster, RosterEvent};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::pose::pose_with_height;
use shared::protocol::{deframe, frame, ClientMessage, Rgb, ServerMessage};
use shared::transport::client::ClientConnection;
use shared::transport::{Delivery, TransportConfig, TransportError};
use shared::{connection_key, DEFAULT_PASSWORD};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

/// Size of the synthetic pose blob the bot sends
pub const BOT_POSE_LEN: usize = 48;

/// Largest height change between two consecutive poses
const MAX_STEP: f32 = 0.5;

/// Chance per pose tick of flipping the jiminy toggle
const JIMINY_TOGGLE_CHANCE: f64 = 0.002;

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub server: SocketAddr,
    pub password: String,
    pub name: String,
    pub color: Rgb,
    /// Sent once right after the info update
    pub chat: Option<String>,
    pub pose_interval: Duration,
    /// Run forever when `None`
    pub duration: Option<Duration>,
    /// Fixed seed for reproducible walks
    pub seed: Option<u64>,
    pub transport: TransportConfig,
}

impl BotConfig {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            password: DEFAULT_PASSWORD.to_string(),
            name: "Nate".to_string(),
            color: Rgb::new(255, 255, 255),
            chat: None,
            pose_interval: Duration::from_millis(16),
            duration: None,
            seed: None,
            transport: TransportConfig::default(),
        }
    }
}

/// Counters reported when a bot run ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BotSummary {
    pub poses_sent: u64,
    pub messages_received: u64,
    pub peers_seen: usize,
}

/// Headless client that walks up and down the mountain
pub struct Bot {
    config: BotConfig,
    connection: ClientConnection,
    roster: Roster,
    rng: StdRng,
    height: f32,
    kickoff: u8,
    pose_sequence: u16,
    jiminy_enabled: bool,
    summary: BotSummary,
}

impl Bot {
    pub async fn connect(config: BotConfig) -> Result<Self, TransportError> {
        let key = connection_key(&config.password);
        let connection =
            ClientConnection::connect(config.server, &key, config.transport.clone()).await?;
        info!(
            "Connected to {} from {}",
            connection.server_addr(),
            connection.local_addr()
        );

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            config,
            connection,
            roster: Roster::new(),
            rng,
            height: 0.0,
            kickoff: 0,
            pose_sequence: 0,
            jiminy_enabled: false,
            summary: BotSummary::default(),
        })
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    /// Sends info and chat, then streams poses until the duration runs out
    /// or the server goes away.
    pub async fn run(mut self) -> Result<BotSummary, TransportError> {
        self.send(
            &ClientMessage::InfoUpdate {
                color: self.config.color,
                name: self.config.name.clone(),
            },
            Delivery::ReliableOrdered,
        )?;
        if let Some(text) = self.config.chat.clone() {
            self.send(
                &ClientMessage::ChatMessage {
                    text: text.into_bytes(),
                },
                Delivery::ReliableOrdered,
            )?;
        }

        let mut ticker = interval(self.config.pose_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // A far-off deadline stands in for "run forever"
        let deadline = Instant::now()
            + self
                .config
                .duration
                .unwrap_or(Duration::from_secs(60 * 60 * 24 * 365));
        let finished = sleep_until(deadline);
        tokio::pin!(finished);

        let result = loop {
            tokio::select! {
                _ = &mut finished => break Ok(()),
                _ = ticker.tick() => {
                    let pose = self.next_pose();
                    if let Err(e) = self.send(&pose, Delivery::Unreliable) {
                        break Err(e);
                    }
                    self.summary.poses_sent += 1;

                    if self.rng.gen_bool(JIMINY_TOGGLE_CHANCE) {
                        self.jiminy_enabled = !self.jiminy_enabled;
                        let toggle = ClientMessage::JiminyToggle { enabled: self.jiminy_enabled };
                        if let Err(e) = self.send(&toggle, Delivery::ReliableOrdered) {
                            break Err(e);
                        }
                    }
                }
                received = self.connection.recv() => {
                    match received {
                        Ok(payload) => self.handle_payload(&payload),
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        self.summary.peers_seen = self.summary.peers_seen.max(self.roster.len());
        let summary = self.summary.clone();
        self.connection.disconnect();
        result.map(|_| summary)
    }

    /// Takes one random step and builds the matching pose update.
    pub fn next_pose(&mut self) -> ClientMessage {
        self.height += self.rng.gen_range(-MAX_STEP..=MAX_STEP);
        self.pose_sequence = self.pose_sequence.wrapping_add(1);
        if self.pose_sequence == 0 {
            self.kickoff = self.kickoff.wrapping_add(1);
        }
        ClientMessage::PoseUpdate {
            kickoff: self.kickoff,
            sequence: self.pose_sequence,
            pose: pose_with_height(self.height, BOT_POSE_LEN),
        }
    }

    fn send(&self, message: &ClientMessage, delivery: Delivery) -> Result<(), TransportError> {
        match frame(&message.encode()) {
            Ok(framed) => self.connection.send(&framed, delivery),
            Err(e) => {
                warn!("Not sending opcode {:#04x}: {}", message.opcode(), e);
                Ok(())
            }
        }
    }

    fn handle_payload(&mut self, payload: &[u8]) {
        let message = match deframe(payload).map(ServerMessage::decode) {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                warn!("Undecodable message from server: {}", e);
                return;
            }
            Err(e) => {
                warn!("Malformed frame from server: {}", e);
                return;
            }
        };
        self.summary.messages_received += 1;

        match self.roster.apply(message) {
            Some(RosterEvent::Joined(id)) => {
                info!("Player [{}] joined", id);
                self.summary.peers_seen = self.summary.peers_seen.max(self.roster.len());
            }
            Some(RosterEvent::Left(id)) => info!("Player [{}] left", id),
            Some(RosterEvent::Chat { id, text }) => {
                let name = self
                    .roster
                    .player(id)
                    .and_then(|player| player.name.clone())
                    .unwrap_or_default();
                info!("{}[{}]: {}", name, id, text);
            }
            Some(event) => debug!("{:?}", event),
            None => {}
        }
    }
}

/// Parses a colour given as `r,g,b`.
pub fn parse_color(input: &str) -> Result<Rgb, String> {
    let parts: Vec<&str> = input.split(',').map(str::trim).collect();
    let [r, g, b] = parts.as_slice() else {
        return Err(format!("expected r,g,b but got '{}'", input));
    };
    let channel = |value: &str| {
        value
            .parse::<u8>()
            .map_err(|e| format!("invalid colour channel '{}': {}", value, e))
    };
    Ok(Rgb::new(channel(r)?, channel(g)?, channel(b)?))
}
