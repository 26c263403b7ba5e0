//! Axis-aligned bounding boxes.

use super::Vec3;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Smallest box containing all points; `None` for an empty slice.
    pub fn from_points(points: &[Vec3]) -> Option<Self> {
        let first = *points.first()?;
        let mut aabb = Self::new(first, first);
        for &p in &points[1..] {
            aabb.min = aabb.min.min_components(p);
            aabb.max = aabb.max.max_components(p);
        }
        Some(aabb)
    }

    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn diagonal(&self) -> f32 {
        self.extent().length()
    }

    pub fn contains(&self, p: Vec3, margin: f32) -> bool {
        p.x >= self.min.x - margin
            && p.x <= self.max.x + margin
            && p.y >= self.min.y - margin
            && p.y <= self.max.y + margin
            && p.z >= self.min.z - margin
            && p.z <= self.max.z + margin
    }

    /// Box expanded by `amount` on every side.
    pub fn padded(&self, amount: f32) -> Self {
        let pad = Vec3::new(amount, amount, amount);
        Self::new(self.min - pad, self.max + pad)
    }

    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_points() {
        let pts = [
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::new(-1.0, 0.0, 5.0),
            Vec3::new(0.5, 4.0, -2.0),
        ];
        let aabb = Aabb::from_points(&pts).unwrap();
        assert_eq!(aabb.min, Vec3::new(-1.0, 0.0, -2.0));
        assert_eq!(aabb.max, Vec3::new(1.0, 4.0, 5.0));
        assert!(Aabb::from_points(&[]).is_none());
    }

    #[test]
    fn test_contains_with_margin() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::new(1.0, 1.0, 1.0));
        assert!(aabb.contains(Vec3::new(0.5, 0.5, 0.5), 0.0));
        assert!(!aabb.contains(Vec3::new(1.1, 0.5, 0.5), 0.0));
        assert!(aabb.contains(Vec3::new(1.1, 0.5, 0.5), 0.2));
    }

    #[test]
    fn test_overlap() {
        let a = Aabb::new(Vec3::ZERO, Vec3::new(1.0, 1.0, 1.0));
        let b = Aabb::new(Vec3::new(0.5, 0.5, 0.5), Vec3::new(2.0, 2.0, 2.0));
        let c = Aabb::new(Vec3::new(3.0, 3.0, 3.0), Vec3::new(4.0, 4.0, 4.0));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}
