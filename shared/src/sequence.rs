//! Wrapping 16-bit sequence numbers
//!
//! Pose and world-event streams carry a `u16` sequence that wraps around.
//! Staleness is decided on the half-range rule: `current` is newer than
//! `previous` when the forward distance from `previous` to `current` is less
//! than 32768.

/// Half of the `u16` range; forward distances below this count as "newer".
pub const HALF_RANGE: u16 = 32768;

/// Returns whether `current` is newer than `previous` under wraparound.
///
/// is_newer(2, 1) == true
/// is_newer(0, 65535) == true
/// is_newer(32768, 0) == false
///
/// A repeated value counts as newer (the forward distance is zero).
pub fn is_newer(current: u16, previous: u16) -> bool {
    current.wrapping_sub(previous) < HALF_RANGE
}

/// Last accepted sequence of one stream
///
/// The first value offered is always accepted; afterwards only values that
/// are newer than the last accepted one get through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceGate {
    last_seen: Option<u16>,
}

impl SequenceGate {
    pub fn new() -> Self {
        Self { last_seen: None }
    }

    /// Records `sequence` and returns true if it is not stale.
    pub fn accept(&mut self, sequence: u16) -> bool {
        match self.last_seen {
            Some(previous) if !is_newer(sequence, previous) => false,
            _ => {
                self.last_seen = Some(sequence);
                true
            }
        }
    }

    pub fn last_seen(&self) -> Option<u16> {
        self.last_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_newer_matches_wrapping_difference() {
        for (current, previous) in [(0u16, 0u16), (1, 0), (500, 40000), (40000, 500), (65535, 1)] {
            assert_eq!(
                is_newer(current, previous),
                current.wrapping_sub(previous) < 32768,
                "is_newer({}, {})",
                current,
                previous
            );
        }
    }

    #[test]
    fn test_is_newer_wraparound_boundaries() {
        assert!(is_newer(0, 65535));
        assert!(is_newer(32767, 0));
        assert!(!is_newer(32768, 0));
        assert!(!is_newer(65535, 0));
    }

    #[test]
    fn test_gate_accepts_first_value() {
        let mut gate = SequenceGate::new();
        assert_eq!(gate.last_seen(), None);
        assert!(gate.accept(40000));
        assert_eq!(gate.last_seen(), Some(40000));
    }

    #[test]
    fn test_gate_rejects_stale_and_keeps_last() {
        let mut gate = SequenceGate::new();
        assert!(gate.accept(10));
        assert!(gate.accept(11));
        assert!(!gate.accept(9));
        assert_eq!(gate.last_seen(), Some(11));
    }

    #[test]
    fn test_gate_follows_wraparound() {
        let mut gate = SequenceGate::new();
        assert!(gate.accept(65534));
        assert!(gate.accept(65535));
        assert!(gate.accept(0));
        assert!(gate.accept(1));
        assert!(!gate.accept(65535));
    }
}
