//! Priority queues drained against a per-tick byte budget
//!
//! Traffic that does not go out immediately is queued here with a priority:
//!
//! - **High** (world events): drained completely every pass, reliable-ordered,
//!   never gated by the budget.
//! - **Medium** (poses): drained while budget remains, unreliable, throttled
//!   per recipient by distance.
//! - **Low** (voice): drained with whatever budget is left, unreliable, only
//!   delivered to recipients within [`AUDIO_CUTOFF`].
//!
//! Medium and low queues are bounded. When one is full the oldest packet is
//! dropped: poses and voice are continuously refreshed, so the newest data is
//! the one worth keeping.

use crate::broadcast::{broadcast, send_to};
use crate::config::ServerSettings;
use crate::registry::SessionRegistry;
use crate::spatial::{SharedSpatial, SpatialTable};
use log::debug;
use shared::pose::Vec3;
use shared::transport::{Delivery, PeerHandle, Transport};
use shared::ClientId;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Voice is inaudible beyond this distance, inclusive bound
pub const AUDIO_CUTOFF: f32 = 60.0;

/// Slowest pose rate for the furthest peers, one update per this many ms
pub const MIN_POSE_RATE_MS: f64 = 2000.0;

pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// A framed message waiting for the next pass
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    /// Transport handle of the sender; checked against the registry on dequeue
    pub source: PeerHandle,
    pub framed: Vec<u8>,
    pub priority: Priority,
    pub enqueued_at: Instant,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_bandwidth_kbps: f64,
    pub tick_rate: u32,
    pub inner_cutoff: f32,
    pub outer_cutoff: f32,
    pub queue_capacity: usize,
    pub telemetry_enabled: bool,
    pub telemetry_interval: Duration,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &ServerSettings, tick_rate: u32) -> Self {
        Self {
            max_bandwidth_kbps: settings.max_bandwidth_kbps,
            tick_rate: tick_rate.max(1),
            inner_cutoff: settings.player_transmit_cutoff,
            outer_cutoff: settings.outer_player_transmit_cutoff,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            telemetry_enabled: settings.telemetry_enabled,
            telemetry_interval: settings.telemetry_interval(),
        }
    }

    /// Bytes medium and low traffic may use per pass
    pub fn byte_budget(&self) -> usize {
        (self.max_bandwidth_kbps * 1024.0 / self.tick_rate as f64) as usize
    }

    /// Nominal time between pose updates at full rate
    pub fn update_interval_ms(&self) -> f64 {
        1000.0 / self.tick_rate as f64
    }
}

/// Pose rate multiplier for a distant recipient.
///
/// 1.0 up to `inner`, then an exponential fall towards
/// `update_interval_ms / 2000` which it reaches at `outer` and beyond.
pub fn distance_multiplier(distance: f32, inner: f32, outer: f32, update_interval_ms: f64) -> f64 {
    if distance < inner {
        return 1.0;
    }
    let span = outer - inner;
    let clamped = if span > 0.0 {
        ((distance - inner) / span).clamp(0.0, 1.0) as f64
    } else {
        1.0
    };
    let target = update_interval_ms / MIN_POSE_RATE_MS;
    (clamped * target.ln()).exp()
}

/// Minimum milliseconds between two poses to a recipient at `distance`
pub fn send_interval_ms(distance: f32, inner: f32, outer: f32, update_interval_ms: f64) -> f64 {
    update_interval_ms / distance_multiplier(distance, inner, outer, update_interval_ms)
}

/// What one pass did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub high_packets: usize,
    pub medium_packets: usize,
    pub low_packets: usize,
    /// Packets whose sender disconnected before they were dequeued
    pub orphaned: usize,
    pub bytes_used: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepths {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

/// One telemetry line's worth of numbers
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryReport {
    pub kilobytes_per_second: f64,
    pub utilization_percent: f64,
    pub depths: QueueDepths,
    pub dropped: u64,
}

/// Rolling bandwidth accounting
#[derive(Debug)]
pub struct Telemetry {
    enabled: bool,
    interval: Duration,
    max_kbps: f64,
    bytes_this_interval: u64,
    dropped_this_interval: u64,
    last_report: Instant,
}

impl Telemetry {
    pub fn new(enabled: bool, interval: Duration, max_kbps: f64, now: Instant) -> Self {
        Self {
            enabled,
            interval,
            max_kbps,
            bytes_this_interval: 0,
            dropped_this_interval: 0,
            last_report: now,
        }
    }

    pub fn record_dropped(&mut self) {
        self.dropped_this_interval += 1;
    }

    /// Adds the bytes of one pass and logs a report when the interval elapsed.
    pub fn record(&mut self, bytes: usize, depths: QueueDepths, now: Instant) -> Option<TelemetryReport> {
        self.bytes_this_interval += bytes as u64;
        if !self.enabled {
            return None;
        }

        let elapsed = now.saturating_duration_since(self.last_report);
        if elapsed < self.interval || elapsed.is_zero() {
            return None;
        }

        let kilobytes_per_second = self.bytes_this_interval as f64 / 1024.0 / elapsed.as_secs_f64();
        let report = TelemetryReport {
            kilobytes_per_second,
            utilization_percent: kilobytes_per_second / self.max_kbps * 100.0,
            depths,
            dropped: self.dropped_this_interval,
        };

        log::info!(
            target: "telemetry",
            "Bandwidth: {:.2} KB/s ({:.1}% of {} KB/s limit)",
            report.kilobytes_per_second,
            report.utilization_percent,
            self.max_kbps
        );
        log::info!(
            target: "telemetry",
            "Queue sizes - High: {}, Medium: {}, Low: {}, dropped: {}",
            depths.high,
            depths.medium,
            depths.low,
            report.dropped
        );

        self.bytes_this_interval = 0;
        self.dropped_this_interval = 0;
        self.last_report = now;
        Some(report)
    }
}

pub struct BandwidthScheduler {
    config: SchedulerConfig,
    high: VecDeque<QueuedPacket>,
    medium: VecDeque<QueuedPacket>,
    low: VecDeque<QueuedPacket>,
    telemetry: Telemetry,
}

impl BandwidthScheduler {
    pub fn new(config: SchedulerConfig, now: Instant) -> Self {
        let telemetry = Telemetry::new(
            config.telemetry_enabled,
            config.telemetry_interval,
            config.max_bandwidth_kbps,
            now,
        );
        Self {
            config,
            high: VecDeque::new(),
            medium: VecDeque::new(),
            low: VecDeque::new(),
            telemetry,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn enqueue(&mut self, source: PeerHandle, framed: Vec<u8>, priority: Priority, now: Instant) {
        let packet = QueuedPacket {
            source,
            framed,
            priority,
            enqueued_at: now,
        };

        let capacity = self.config.queue_capacity;
        let queue = match priority {
            Priority::High => {
                self.high.push_back(packet);
                return;
            }
            Priority::Medium => &mut self.medium,
            Priority::Low => &mut self.low,
        };

        if queue.len() >= capacity {
            if let Some(dropped) = queue.pop_front() {
                debug!(
                    "{:?} queue full, dropping packet from {} queued {:?} ago",
                    priority,
                    dropped.source,
                    now.saturating_duration_since(dropped.enqueued_at)
                );
            }
            self.telemetry.record_dropped();
        }
        queue.push_back(packet);
    }

    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            high: self.high.len(),
            medium: self.medium.len(),
            low: self.low.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.medium.is_empty() && self.low.is_empty()
    }

    /// Runs one scheduling pass.
    ///
    /// High is drained first and entirely, then medium and low while the bytes
    /// used so far stay below the budget. Whatever is left waits for the next
    /// pass.
    pub async fn run_pass<T: Transport>(
        &mut self,
        registry: &mut SessionRegistry,
        spatial: &SharedSpatial,
        transport: &mut T,
        now: Instant,
    ) -> PassReport {
        let budget = self.config.byte_budget();
        let mut report = PassReport::default();

        while let Some(packet) = self.high.pop_front() {
            if registry.id_of(packet.source).is_none() {
                report.orphaned += 1;
                continue;
            }
            report.bytes_used += broadcast(
                transport,
                registry,
                &packet.framed,
                Delivery::ReliableOrdered,
                Some(packet.source),
            );
            report.high_packets += 1;
        }

        if (!self.medium.is_empty() || !self.low.is_empty()) && report.bytes_used < budget {
            let table = spatial.read().await;

            while report.bytes_used < budget {
                let Some(packet) = self.medium.pop_front() else {
                    break;
                };
                let Some(sender) = registry.id_of(packet.source) else {
                    report.orphaned += 1;
                    continue;
                };
                report.bytes_used +=
                    self.broadcast_pose(&packet, sender, registry, &table, transport, now);
                report.medium_packets += 1;
            }

            while report.bytes_used < budget {
                let Some(packet) = self.low.pop_front() else {
                    break;
                };
                let Some(sender) = registry.id_of(packet.source) else {
                    report.orphaned += 1;
                    continue;
                };
                report.bytes_used += broadcast_audio(&packet, sender, registry, &table, transport);
                report.low_packets += 1;
            }
        }

        let depths = self.depths();
        self.telemetry.record(report.bytes_used, depths, now);
        report
    }

    /// Sends a pose to every other client whose per-recipient interval elapsed.
    fn broadcast_pose<T: Transport>(
        &self,
        packet: &QueuedPacket,
        sender: ClientId,
        registry: &mut SessionRegistry,
        table: &SpatialTable,
        transport: &mut T,
        now: Instant,
    ) -> usize {
        let update_interval_ms = self.config.update_interval_ms();
        let sender_position = table.position(sender).unwrap_or(Vec3::ZERO);
        let recipients = registry.recipients(Some(packet.source));

        let Some(session) = registry.get_mut(sender) else {
            return 0;
        };

        let mut bytes = 0;
        for (peer, recipient) in recipients {
            let interval_ms = if table.is_distant(sender, recipient) {
                let distance = sender_position.distance(table.position(recipient).unwrap_or(Vec3::ZERO));
                send_interval_ms(
                    distance,
                    self.config.inner_cutoff,
                    self.config.outer_cutoff,
                    update_interval_ms,
                )
            } else {
                update_interval_ms
            };

            let due = match session.last_send_times.get(&recipient) {
                Some(last) => {
                    now.saturating_duration_since(*last).as_secs_f64() * 1000.0 >= interval_ms
                }
                None => true,
            };
            if due {
                bytes += send_to(transport, peer, &packet.framed, Delivery::Unreliable);
                session.last_send_times.insert(recipient, now);
            }
        }
        bytes
    }
}

/// Sends a voice frame to every other client within [`AUDIO_CUTOFF`].
fn broadcast_audio<T: Transport>(
    packet: &QueuedPacket,
    sender: ClientId,
    registry: &SessionRegistry,
    table: &SpatialTable,
    transport: &mut T,
) -> usize {
    let sender_position = table.position(sender).unwrap_or(Vec3::ZERO);

    registry
        .recipients(Some(packet.source))
        .into_iter()
        .filter(|(_, recipient)| {
            let position = table.position(*recipient).unwrap_or(Vec3::ZERO);
            sender_position.distance(position) <= AUDIO_CUTOFF
        })
        .map(|(peer, _)| send_to(transport, peer, &packet.framed, Delivery::Unreliable))
        .sum()
}
