//! Minimal vector and rotation types carried on the wire

use std::ops::{Add, AddAssign, Mul, Sub};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const ZERO: Vector3 = Vector3::new(0.0, 0.0, 0.0);
    pub const UP: Vector3 = Vector3::new(0.0, 1.0, 0.0);
    pub const FORWARD: Vector3 = Vector3::new(0.0, 0.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, other: Vector3) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(self, other: Vector3) -> Vector3 {
        Vector3::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    pub fn length(self) -> f32 {
        self.dot(self).sqrt()
    }

    /// Unit vector in the same direction, or zero for a degenerate input
    pub fn normalize(self) -> Vector3 {
        let len = self.length();
        if len > f32::EPSILON {
            self * (1.0 / len)
        } else {
            Vector3::ZERO
        }
    }
}

impl Add for Vector3 {
    type Output = Vector3;

    fn add(self, rhs: Vector3) -> Vector3 {
        Vector3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Vector3 {
    fn add_assign(&mut self, rhs: Vector3) {
        *self = *self + rhs;
    }
}

impl Sub for Vector3 {
    type Output = Vector3;

    fn sub(self, rhs: Vector3) -> Vector3 {
        Vector3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vector3 {
    type Output = Vector3;

    fn mul(self, rhs: f32) -> Vector3 {
        Vector3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Rotation quaternion in (x, y, z, w) order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion::new(0.0, 0.0, 0.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    /// Rotation of `angle` radians around the Y axis
    pub fn from_yaw(angle: f32) -> Self {
        let half = angle * 0.5;
        Quaternion::new(0.0, half.sin(), 0.0, half.cos())
    }

    /// Rotates `v` by this quaternion (assumed unit length)
    pub fn rotate(self, v: Vector3) -> Vector3 {
        let q = Vector3::new(self.x, self.y, self.z);
        let t = q.cross(v) * 2.0;
        v + t * self.w + q.cross(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn test_cross_product() {
        let right = Vector3::FORWARD.cross(Vector3::UP);
        assert_approx_eq!(right.x, -1.0);
        assert_approx_eq!(right.y, 0.0);
        assert_approx_eq!(right.z, 0.0);
    }

    #[test]
    fn test_normalize_degenerate_is_zero() {
        assert_eq!(Vector3::ZERO.normalize(), Vector3::ZERO);
        let n = Vector3::new(3.0, 0.0, 4.0).normalize();
        assert_approx_eq!(n.length(), 1.0);
        assert_approx_eq!(n.x, 0.6);
    }

    #[test]
    fn test_identity_rotation_is_noop() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        assert_eq!(Quaternion::IDENTITY.rotate(v), v);
    }

    #[test]
    fn test_yaw_rotates_forward_to_right() {
        let rotated = Quaternion::from_yaw(FRAC_PI_2).rotate(Vector3::FORWARD);
        assert_approx_eq!(rotated.x, 1.0, 1e-5);
        assert_approx_eq!(rotated.y, 0.0, 1e-5);
        assert_approx_eq!(rotated.z, 0.0, 1e-5);
    }
}
