//! Pose payload layout
//!
//! Pose bytes are opaque to the relay except for the avatar position, which
//! drives distance culling. Bytes 8..12 of the pose payload hold the Z
//! coordinate as a little-endian `f32`; the level is a vertical climb, so the
//! relay only tracks height and leaves X and Y at zero.

/// Offset of the Z coordinate inside a pose payload.
pub const POSE_Z_OFFSET: usize = 8;

/// Payloads shorter than this carry no usable transform.
pub const MIN_POSE_LEN: usize = 29;

/// Position in world units
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to `other`
    pub fn distance(self, other: Vec3) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Extracts the avatar position from a pose payload.
///
/// Returns `None` for payloads shorter than [`MIN_POSE_LEN`].
pub fn position_from_pose(pose: &[u8]) -> Option<Vec3> {
    if pose.len() < MIN_POSE_LEN {
        return None;
    }
    let bytes: [u8; 4] = pose[POSE_Z_OFFSET..POSE_Z_OFFSET + 4].try_into().ok()?;
    Some(Vec3::new(0.0, 0.0, f32::from_le_bytes(bytes)))
}

/// Builds a minimal pose payload with the given height, used by bots and tests.
pub fn pose_with_height(z: f32, len: usize) -> Vec<u8> {
    let mut pose = vec![0u8; len.max(MIN_POSE_LEN)];
    pose[POSE_Z_OFFSET..POSE_Z_OFFSET + 4].copy_from_slice(&z.to_le_bytes());
    pose
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_distance() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(3.0, 4.0, 0.0);
        assert_approx_eq!(a.distance(b), 5.0, 1e-6);
        assert_approx_eq!(b.distance(a), 5.0, 1e-6);
        assert_eq!(a.distance(a), 0.0);
    }

    #[test]
    fn test_position_from_pose_reads_height() {
        let pose = pose_with_height(123.5, 64);
        let position = position_from_pose(&pose).unwrap();
        assert_eq!(position, Vec3::new(0.0, 0.0, 123.5));
    }

    #[test]
    fn test_position_from_short_pose() {
        let pose = vec![0u8; MIN_POSE_LEN - 1];
        assert_eq!(position_from_pose(&pose), None);
    }

    #[test]
    fn test_pose_with_height_pads_to_minimum() {
        let pose = pose_with_height(-2.0, 4);
        assert_eq!(pose.len(), MIN_POSE_LEN);
        assert_approx_eq!(position_from_pose(&pose).unwrap().z, -2.0, 1e-6);
    }
}
