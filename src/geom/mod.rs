//! Minimal 3D geometry used by the solvers.

pub mod aabb;
pub mod triangle;

pub use aabb::Aabb;
pub use triangle::{
    intersect_triangle, mirror_point, point_triangle_distance_sq, triangle_normal, Triangle,
};

use std::ops::{Add, Div, Mul, Neg, Sub};

/// Length below which a vector cannot be normalised.
pub const EPS: f32 = 1e-9;

/// A 3D vector / point in single precision.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Dot product.
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Cross product.
    pub fn cross(self, other: Self) -> Self {
        Self {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    pub fn length_sq(self) -> f32 {
        self.dot(self)
    }

    pub fn length(self) -> f32 {
        self.length_sq().sqrt()
    }

    pub fn distance(self, other: Self) -> f32 {
        (self - other).length()
    }

    /// Normalised copy, or `None` for a (near-)zero vector.
    pub fn normalize(self) -> Option<Self> {
        let len = self.length();
        if len < EPS {
            None
        } else {
            Some(self / len)
        }
    }

    /// Mirror reflection of a direction about a unit surface normal.
    pub fn reflect(self, normal: Self) -> Self {
        self - normal * (2.0 * self.dot(normal))
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn min_components(self, other: Self) -> Self {
        Self::new(
            self.x.min(other.x),
            self.y.min(other.y),
            self.z.min(other.z),
        )
    }

    pub fn max_components(self, other: Self) -> Self {
        Self::new(
            self.x.max(other.x),
            self.y.max(other.y),
            self.z.max(other.z),
        )
    }
}

impl Add for Vec3 {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl Sub for Vec3 {
    type Output = Self;
    fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;
    fn mul(self, scalar: f32) -> Self {
        Self::new(self.x * scalar, self.y * scalar, self.z * scalar)
    }
}

impl Div<f32> for Vec3 {
    type Output = Self;
    fn div(self, scalar: f32) -> Self {
        Self::new(self.x / scalar, self.y / scalar, self.z / scalar)
    }
}

impl Neg for Vec3 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

/// A ray with an origin and a unit direction.
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub position: Vec3,
    pub direction: Vec3,
}

impl Ray {
    /// Creates a ray; the direction is normalised.
    pub fn new(position: Vec3, direction: Vec3) -> Option<Self> {
        Some(Self {
            position,
            direction: direction.normalize()?,
        })
    }

    /// Ray from one point towards another.
    pub fn between(origin: Vec3, target: Vec3) -> Option<Self> {
        Self::new(origin, target - origin)
    }

    pub fn point_at(&self, t: f32) -> Vec3 {
        self.position + self.direction * t
    }
}
