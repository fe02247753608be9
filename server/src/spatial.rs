//! Positions, distant-peer sets and the culling task that recomputes them
//!
//! The tick loop records raw pose payloads and reads positions and distant
//! sets through a shared [`tokio::sync::RwLock`]. Every
//! `static_update_rate` milliseconds the [`CullingEngine`] spawns one task
//! that takes the write lock, re-derives positions from the cached poses and
//! replaces every distant set wholesale. Readers therefore see either the
//! previous pass or the new one, never a mix.

use log::debug;
use shared::pose::{position_from_pose, Vec3};
use shared::ClientId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

pub type SharedSpatial = Arc<RwLock<SpatialTable>>;

#[derive(Debug, Default)]
pub struct SpatialEntry {
    pub position: Vec3,
    /// Latest accepted pose bytes, parsed only during culling
    pub latest_pose: Option<Vec<u8>>,
    /// Peers classified as far away by the last pass; never contains self
    pub distant: HashSet<ClientId>,
}

/// Spatial state of every connected client
#[derive(Debug, Default)]
pub struct SpatialTable {
    entries: HashMap<ClientId, SpatialEntry>,
}

impl SpatialTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedSpatial {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn insert(&mut self, id: ClientId) {
        self.entries.insert(id, SpatialEntry::default());
    }

    pub fn remove(&mut self, id: ClientId) {
        self.entries.remove(&id);
        for entry in self.entries.values_mut() {
            entry.distant.remove(&id);
        }
    }

    pub fn record_pose(&mut self, id: ClientId, pose: Vec<u8>) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.latest_pose = Some(pose);
        }
    }

    pub fn latest_pose(&self, id: ClientId) -> Option<&[u8]> {
        self.entries.get(&id).and_then(|entry| entry.latest_pose.as_deref())
    }

    pub fn set_position(&mut self, id: ClientId, position: Vec3) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.position = position;
        }
    }

    pub fn position(&self, id: ClientId) -> Option<Vec3> {
        self.entries.get(&id).map(|entry| entry.position)
    }

    /// Whether `to` was classified as far from `from` by the last pass
    pub fn is_distant(&self, from: ClientId, to: ClientId) -> bool {
        self.entries
            .get(&from)
            .map_or(false, |entry| entry.distant.contains(&to))
    }

    pub fn distant_peers(&self, id: ClientId) -> Option<&HashSet<ClientId>> {
        self.entries.get(&id).map(|entry| &entry.distant)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One full O(n²) culling pass.
    ///
    /// Positions are refreshed from cached poses long enough to carry one;
    /// then each client's distant set is rebuilt from scratch with every other
    /// client whose distance exceeds `inner_cutoff`.
    pub fn cull(&mut self, inner_cutoff: f32) {
        for entry in self.entries.values_mut() {
            if let Some(position) = entry.latest_pose.as_deref().and_then(position_from_pose) {
                entry.position = position;
            }
        }

        let positions: Vec<(ClientId, Vec3)> = self
            .entries
            .iter()
            .map(|(id, entry)| (*id, entry.position))
            .collect();

        for (id, entry) in self.entries.iter_mut() {
            entry.distant = positions
                .iter()
                .filter(|(other, position)| {
                    other != id && entry.position.distance(*position) > inner_cutoff
                })
                .map(|(other, _)| *other)
                .collect();
        }
    }
}

/// Whether a culling pass is currently running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullState {
    Idle,
    Culling,
}

/// Schedules culling passes off the tick loop
pub struct CullingEngine {
    spatial: SharedSpatial,
    interval: Duration,
    inner_cutoff: f32,
    accumulated: Duration,
    in_flight: Arc<AtomicBool>,
}

impl CullingEngine {
    pub fn new(spatial: SharedSpatial, interval: Duration, inner_cutoff: f32) -> Self {
        Self {
            spatial,
            interval,
            inner_cutoff,
            accumulated: Duration::ZERO,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> CullState {
        if self.in_flight.load(Ordering::Acquire) {
            CullState::Culling
        } else {
            CullState::Idle
        }
    }

    /// Adds `elapsed` to the time since the last pass and starts a new pass
    /// when the interval is reached and none is running.
    ///
    /// The returned handle is only for callers that want to wait; the tick
    /// loop drops it.
    pub fn advance(&mut self, elapsed: Duration) -> Option<JoinHandle<()>> {
        self.accumulated = self.accumulated.saturating_add(elapsed);
        if self.accumulated < self.interval || self.state() == CullState::Culling {
            return None;
        }

        self.accumulated = Duration::ZERO;
        self.in_flight.store(true, Ordering::Release);

        let spatial = Arc::clone(&self.spatial);
        let in_flight = Arc::clone(&self.in_flight);
        let inner_cutoff = self.inner_cutoff;

        Some(tokio::spawn(async move {
            let started = Instant::now();
            let clients = {
                let mut table = spatial.write().await;
                table.cull(inner_cutoff);
                table.len()
            };
            in_flight.store(false, Ordering::Release);
            debug!(
                "Culling pass over {} clients took {:?}",
                clients,
                started.elapsed()
            );
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::pose::pose_with_height;

    fn table_with_heights(heights: &[(ClientId, f32)]) -> SpatialTable {
        let mut table = SpatialTable::new();
        for (id, z) in heights {
            table.insert(*id);
            table.record_pose(*id, pose_with_height(*z, 64));
        }
        table
    }

    #[test]
    fn test_cull_classifies_by_inner_cutoff() {
        let mut table = table_with_heights(&[(0, 0.0), (1, 5.0), (2, 100.0)]);
        table.cull(10.0);

        assert!(!table.is_distant(0, 1));
        assert!(table.is_distant(0, 2));
        assert!(table.is_distant(1, 2));
        assert!(table.is_distant(2, 0));
        assert!(table.is_distant(2, 1));
        assert_eq!(table.position(2), Some(Vec3::new(0.0, 0.0, 100.0)));
    }

    #[test]
    fn test_cull_boundary_is_exclusive() {
        let mut table = table_with_heights(&[(0, 0.0), (1, 10.0)]);
        table.cull(10.0);
        assert!(!table.is_distant(0, 1));
    }

    #[test]
    fn test_distant_set_never_contains_self() {
        let mut table = table_with_heights(&[(0, 0.0), (1, 50.0), (2, -50.0)]);
        table.cull(1.0);
        for id in 0..3 {
            assert!(!table.distant_peers(id).unwrap().contains(&id));
        }
    }

    #[test]
    fn test_cull_replaces_sets_wholesale() {
        let mut table = table_with_heights(&[(0, 0.0), (1, 100.0)]);
        table.cull(10.0);
        assert!(table.is_distant(0, 1));

        table.record_pose(1, pose_with_height(2.0, 64));
        table.cull(10.0);
        assert!(!table.is_distant(0, 1));
        assert!(!table.is_distant(1, 0));
    }

    #[test]
    fn test_short_pose_keeps_previous_position() {
        let mut table = table_with_heights(&[(0, 40.0)]);
        table.cull(10.0);
        table.record_pose(0, vec![0u8; 12]);
        table.cull(10.0);
        assert_eq!(table.position(0), Some(Vec3::new(0.0, 0.0, 40.0)));
    }

    #[test]
    fn test_remove_scrubs_distant_sets() {
        let mut table = table_with_heights(&[(0, 0.0), (1, 100.0)]);
        table.cull(10.0);
        table.remove(1);
        assert!(table.distant_peers(0).unwrap().is_empty());
        assert_eq!(table.position(1), None);
    }

    #[tokio::test]
    async fn test_engine_waits_for_interval() {
        let spatial = SpatialTable::shared();
        let mut engine = CullingEngine::new(Arc::clone(&spatial), Duration::from_millis(100), 10.0);

        assert!(engine.advance(Duration::from_millis(40)).is_none());
        assert!(engine.advance(Duration::from_millis(40)).is_none());
        let handle = engine.advance(Duration::from_millis(40)).unwrap();
        handle.await.unwrap();
        assert_eq!(engine.state(), CullState::Idle);
    }

    #[tokio::test]
    async fn test_engine_never_overlaps_passes() {
        let spatial = SpatialTable::shared();
        {
            let mut table = spatial.write().await;
            table.insert(0);
            table.insert(1);
            table.record_pose(1, pose_with_height(300.0, 64));
        }
        let mut engine = CullingEngine::new(Arc::clone(&spatial), Duration::from_millis(10), 10.0);

        // Hold a read lock so the pass cannot finish
        let reader = spatial.read().await;
        let handle = engine.advance(Duration::from_millis(10)).unwrap();
        assert_eq!(engine.state(), CullState::Culling);
        assert!(engine.advance(Duration::from_millis(50)).is_none());
        drop(reader);

        handle.await.unwrap();
        assert_eq!(engine.state(), CullState::Idle);
        assert!(spatial.read().await.is_distant(0, 1));
    }
}
