use serde::{Deserialize, Serialize};
use std::ops::{Add, Div, Mul, Neg, Sub};

/// A simple 3D vector struct used for particle positions and velocities (kpc, km/s).
#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    /// Creates a new Vec3.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Vec3 { x, y, z }
    }

    /// Creates a zero vector.
    pub fn zero() -> Self {
        Vec3 { x: 0.0, y: 0.0, z: 0.0 }
    }

    /// Calculates the squared length (magnitude) of the vector.
    pub fn length_squared(&self) -> f64 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// Calculates the length (magnitude) of the vector.
    pub fn length(&self) -> f64 {
        self.length_squared().sqrt()
    }

    /// Length of the projection onto the x-y plane.
    pub fn length_xy(&self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Calculates the squared distance to another vector (point).
    pub fn distance_squared(&self, other: Vec3) -> f64 {
        (*self - other).length_squared()
    }

    /// Calculates the distance to another vector (point).
    pub fn distance(&self, other: Vec3) -> f64 {
        self.distance_squared(other).sqrt()
    }

    /// Scales the vector by a scalar value.
    pub fn scale(&self, scalar: f64) -> Self {
        Vec3 { x: self.x * scalar, y: self.y * scalar, z: self.z * scalar }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

// Implement standard operators for convenience
impl Add for Vec3 {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self { x: self.x + other.x, y: self.y + other.y, z: self.z + other.z }
    }
}

impl Sub for Vec3 {
    type Output = Self;
    fn sub(self, other: Self) -> Self {
        Self { x: self.x - other.x, y: self.y - other.y, z: self.z - other.z }
    }
}

impl Neg for Vec3 {
    type Output = Self;
    fn neg(self) -> Self {
        Self { x: -self.x, y: -self.y, z: -self.z }
    }
}

impl Mul<f64> for Vec3 {
    type Output = Self;
    fn mul(self, scalar: f64) -> Self {
        self.scale(scalar)
    }
}

impl Div<f64> for Vec3 {
    type Output = Self;
    fn div(self, scalar: f64) -> Self {
        // Callers guard against a zero divisor (zero total mass is reported upstream).
        Self { x: self.x / scalar, y: self.y / scalar, z: self.z / scalar }
    }
}

/// Mass-weighted mean of a set of points. Returns `None` when the total weight is not positive.
pub fn weighted_mean(points: impl IntoIterator<Item = (Vec3, f64)>) -> Option<Vec3> {
    let mut sum = Vec3::zero();
    let mut total = 0.0;
    for (p, w) in points {
        sum = sum + p * w;
        total += w;
    }
    if total > 0.0 && total.is_finite() {
        Some(sum / total)
    } else {
        None
    }
}
