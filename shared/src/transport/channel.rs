//! Per-peer reliability state
//!
//! One [`PeerChannel`] exists for every remote endpoint on both the server
//! and the client. It numbers outgoing datagrams, remembers unacknowledged
//! reliable payloads for resending, puts incoming reliable payloads back into
//! send order and filters stale unreliable payloads.

use crate::sequence::is_newer;
use crate::transport::datagram::Datagram;
use crate::transport::Delivery;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// How far ahead of the next expected reliable sequence we buffer
pub const REORDER_WINDOW: u16 = 1024;

#[derive(Debug)]
struct PendingReliable {
    sequence: u16,
    payload: Vec<u8>,
    last_sent: Instant,
}

#[derive(Debug)]
pub struct PeerChannel {
    next_reliable_out: u16,
    next_unreliable_out: u16,
    unacked: VecDeque<PendingReliable>,

    next_reliable_in: u16,
    reorder_buffer: HashMap<u16, Vec<u8>>,
    last_unreliable_in: Option<u16>,

    last_received: Instant,
    last_sent: Instant,
}

impl PeerChannel {
    pub fn new(now: Instant) -> Self {
        Self {
            next_reliable_out: 0,
            next_unreliable_out: 0,
            unacked: VecDeque::new(),
            next_reliable_in: 0,
            reorder_buffer: HashMap::new(),
            last_unreliable_in: None,
            last_received: now,
            last_sent: now,
        }
    }

    /// Wraps an application payload into the datagram to put on the wire.
    ///
    /// Reliable payloads are remembered until acknowledged.
    pub fn wrap(&mut self, payload: &[u8], delivery: Delivery, now: Instant) -> Datagram {
        self.last_sent = now;
        match delivery {
            Delivery::ReliableOrdered => {
                let sequence = self.next_reliable_out;
                self.next_reliable_out = self.next_reliable_out.wrapping_add(1);
                self.unacked.push_back(PendingReliable {
                    sequence,
                    payload: payload.to_vec(),
                    last_sent: now,
                });
                Datagram::Reliable {
                    sequence,
                    payload: payload.to_vec(),
                }
            }
            Delivery::Unreliable => {
                let sequence = self.next_unreliable_out;
                self.next_unreliable_out = self.next_unreliable_out.wrapping_add(1);
                Datagram::Unreliable {
                    sequence,
                    payload: payload.to_vec(),
                }
            }
        }
    }

    /// Forgets a reliable payload once the remote end confirmed it.
    pub fn acknowledge(&mut self, sequence: u16) {
        self.unacked.retain(|pending| pending.sequence != sequence);
    }

    /// Accepts an incoming reliable payload and returns every payload that is
    /// now deliverable in order. Duplicates and payloads far outside the
    /// window yield nothing; the caller acks them regardless.
    pub fn receive_reliable(&mut self, sequence: u16, payload: Vec<u8>) -> Vec<Vec<u8>> {
        let ahead = sequence.wrapping_sub(self.next_reliable_in);
        if ahead >= REORDER_WINDOW {
            return Vec::new();
        }

        self.reorder_buffer.entry(sequence).or_insert(payload);

        let mut ready = Vec::new();
        while let Some(next) = self.reorder_buffer.remove(&self.next_reliable_in) {
            ready.push(next);
            self.next_reliable_in = self.next_reliable_in.wrapping_add(1);
        }
        ready
    }

    /// Accepts an incoming unreliable payload unless an equal or newer one
    /// was already delivered.
    pub fn receive_unreliable(&mut self, sequence: u16, payload: Vec<u8>) -> Option<Vec<u8>> {
        if let Some(last) = self.last_unreliable_in {
            if sequence == last || !is_newer(sequence, last) {
                return None;
            }
        }
        self.last_unreliable_in = Some(sequence);
        Some(payload)
    }

    /// Collects reliable datagrams whose resend interval elapsed.
    pub fn due_resends(&mut self, now: Instant, resend_interval: Duration) -> Vec<Datagram> {
        let mut resends = Vec::new();
        for pending in self.unacked.iter_mut() {
            if now.duration_since(pending.last_sent) >= resend_interval {
                pending.last_sent = now;
                resends.push(Datagram::Reliable {
                    sequence: pending.sequence,
                    payload: pending.payload.clone(),
                });
            }
        }
        if !resends.is_empty() {
            self.last_sent = now;
        }
        resends
    }

    /// Marks the remote end as alive.
    pub fn touch(&mut self, now: Instant) {
        self.last_received = now;
    }

    /// Records a send that did not go through [`PeerChannel::wrap`].
    pub fn mark_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    pub fn needs_keepalive(&self, now: Instant, interval: Duration) -> bool {
        now.duration_since(self.last_sent) >= interval
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_received) > timeout
    }

    /// Number of reliable payloads still waiting for an ack
    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reliable_sequence(datagram: &Datagram) -> u16 {
        match datagram {
            Datagram::Reliable { sequence, .. } => *sequence,
            other => panic!("Expected reliable datagram, got {:?}", other),
        }
    }

    #[test]
    fn test_reliable_sequences_increment() {
        let now = Instant::now();
        let mut channel = PeerChannel::new(now);

        let first = channel.wrap(b"a", Delivery::ReliableOrdered, now);
        let second = channel.wrap(b"b", Delivery::ReliableOrdered, now);

        assert_eq!(reliable_sequence(&first), 0);
        assert_eq!(reliable_sequence(&second), 1);
        assert_eq!(channel.unacked_len(), 2);
    }

    #[test]
    fn test_acknowledge_stops_resends() {
        let now = Instant::now();
        let mut channel = PeerChannel::new(now);
        channel.wrap(b"a", Delivery::ReliableOrdered, now);
        channel.wrap(b"b", Delivery::ReliableOrdered, now);

        channel.acknowledge(0);

        let later = now + Duration::from_millis(150);
        let resends = channel.due_resends(later, Duration::from_millis(100));
        assert_eq!(resends.len(), 1);
        assert_eq!(reliable_sequence(&resends[0]), 1);
    }

    #[test]
    fn test_resend_waits_for_interval() {
        let now = Instant::now();
        let mut channel = PeerChannel::new(now);
        channel.wrap(b"a", Delivery::ReliableOrdered, now);

        let resends = channel.due_resends(now + Duration::from_millis(50), Duration::from_millis(100));
        assert!(resends.is_empty());
    }

    #[test]
    fn test_unreliable_is_not_tracked() {
        let now = Instant::now();
        let mut channel = PeerChannel::new(now);
        channel.wrap(b"pose", Delivery::Unreliable, now);
        assert_eq!(channel.unacked_len(), 0);
    }

    #[test]
    fn test_reliable_reorders_out_of_order_arrivals() {
        let mut channel = PeerChannel::new(Instant::now());

        assert!(channel.receive_reliable(1, b"second".to_vec()).is_empty());
        assert!(channel.receive_reliable(2, b"third".to_vec()).is_empty());

        let ready = channel.receive_reliable(0, b"first".to_vec());
        assert_eq!(
            ready,
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
    }

    #[test]
    fn test_reliable_drops_duplicates() {
        let mut channel = PeerChannel::new(Instant::now());

        assert_eq!(channel.receive_reliable(0, b"a".to_vec()).len(), 1);
        assert!(channel.receive_reliable(0, b"a".to_vec()).is_empty());
    }

    #[test]
    fn test_unreliable_drops_stale() {
        let mut channel = PeerChannel::new(Instant::now());

        assert!(channel.receive_unreliable(5, b"a".to_vec()).is_some());
        assert!(channel.receive_unreliable(5, b"a".to_vec()).is_none());
        assert!(channel.receive_unreliable(4, b"old".to_vec()).is_none());
        assert!(channel.receive_unreliable(6, b"b".to_vec()).is_some());
    }

    #[test]
    fn test_timeout_and_keepalive() {
        let now = Instant::now();
        let mut channel = PeerChannel::new(now);

        let later = now + Duration::from_secs(2);
        assert!(channel.needs_keepalive(later, Duration::from_secs(1)));
        assert!(!channel.is_timed_out(later, Duration::from_secs(15)));

        channel.mark_sent(later);
        assert!(!channel.needs_keepalive(later, Duration::from_secs(1)));

        let much_later = now + Duration::from_secs(16);
        assert!(channel.is_timed_out(much_later, Duration::from_secs(15)));
        channel.touch(much_later);
        assert!(!channel.is_timed_out(much_later, Duration::from_secs(15)));
    }
}
