//! Geometry and camera types shared by the streaming core.

use glam::{Mat4, Vec3};
use serde::Deserialize;

/// An axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Aabb {
    /// Minimum corner.
    pub min: Vec3,
    /// Maximum corner.
    pub max: Vec3,
}

impl Aabb {
    /// An inverted box that any `grow` call replaces.
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    /// Create a box from its corners.
    #[must_use]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Smallest box containing all `points`, or [`Aabb::EMPTY`] when there are none.
    #[must_use]
    pub fn from_points(points: &[Vec3]) -> Self {
        points.iter().fold(Self::EMPTY, |mut aabb, &p| {
            aabb.grow(p);
            aabb
        })
    }

    /// Whether the box contains no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    /// Extend the box to contain `point`.
    pub fn grow(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Extend the box to contain `other`.
    pub fn merge(&mut self, other: &Aabb) {
        if other.is_empty() {
            return;
        }
        self.grow(other.min);
        self.grow(other.max);
    }

    #[must_use]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[must_use]
    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// The eight corners of the box.
    #[must_use]
    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// Bounding box of this box after applying `transform`.
    #[must_use]
    pub fn transformed(&self, transform: &Mat4) -> Self {
        if self.is_empty() {
            return *self;
        }
        let corners = self.corners().map(|c| transform.transform_point3(c));
        Self::from_points(&corners)
    }
}

/// A bounding sphere, precomputed from node bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

impl BoundingSphere {
    /// The sphere circumscribing `aabb`.
    #[must_use]
    pub fn from_aabb(aabb: &Aabb) -> Self {
        Self {
            center: aabb.center(),
            radius: aabb.half_extents().length(),
        }
    }

    /// Distance from `point` to the sphere surface, zero when inside.
    #[must_use]
    pub fn distance_to(&self, point: Vec3) -> f32 {
        (self.center.distance(point) - self.radius).max(0.0)
    }
}

/// Camera pose consumed each frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraState {
    /// Camera position in world space.
    pub position: Vec3,
    /// Normalized view direction in world space.
    pub forward: Vec3,
}

impl CameraState {
    #[must_use]
    pub fn new(position: Vec3, forward: Vec3) -> Self {
        Self {
            position,
            forward: forward.normalize_or(Vec3::NEG_Z),
        }
    }

    /// The camera expressed in the local space of an object placed at `world_transform`.
    #[must_use]
    pub fn to_local(&self, world_transform: &Mat4) -> Self {
        let inverse = world_transform.inverse();
        Self {
            position: inverse.transform_point3(self.position),
            forward: inverse
                .transform_vector3(self.forward)
                .normalize_or(Vec3::NEG_Z),
        }
    }

    /// Angle in degrees between this camera's view direction and `other`'s.
    #[must_use]
    pub fn angle_to(&self, other: &CameraState) -> f32 {
        self.forward
            .dot(other.forward)
            .clamp(-1.0, 1.0)
            .acos()
            .to_degrees()
    }
}

/// Tracks camera motion since the last time an effect fired.
///
/// Each throttled effect (LOD evaluation, sorting, color refinement) keeps
/// its own tracker so their thresholds can be tuned independently.
#[derive(Debug, Clone, Copy, Default)]
pub struct MotionTrigger {
    last: Option<CameraState>,
}

impl MotionTrigger {
    /// Whether the camera moved further than `distance` or turned more than
    /// `angle` degrees since the last [`MotionTrigger::reset`]. Always true
    /// before the first reset.
    #[must_use]
    pub fn crossed(&self, camera: &CameraState, distance: f32, angle: f32) -> bool {
        match &self.last {
            None => true,
            Some(last) => {
                last.position.distance(camera.position) > distance || last.angle_to(camera) > angle
            }
        }
    }

    /// Only the translation component of [`MotionTrigger::crossed`].
    #[must_use]
    pub fn moved(&self, camera: &CameraState, distance: f32) -> bool {
        self.last
            .is_none_or(|last| last.position.distance(camera.position) > distance)
    }

    /// Only the rotation component of [`MotionTrigger::crossed`].
    #[must_use]
    pub fn turned(&self, camera: &CameraState, angle: f32) -> bool {
        self.last.is_none_or(|last| last.angle_to(camera) > angle)
    }

    /// Record `camera` as the new reference pose.
    pub fn reset(&mut self, camera: &CameraState) {
        self.last = Some(*camera);
    }

    /// Forget the reference pose so the next check fires.
    pub fn invalidate(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aabb_from_points() {
        let aabb = Aabb::from_points(&[Vec3::new(1.0, -2.0, 0.0), Vec3::new(-1.0, 3.0, 5.0)]);
        assert_eq!(aabb.min, Vec3::new(-1.0, -2.0, 0.0));
        assert_eq!(aabb.max, Vec3::new(1.0, 3.0, 5.0));
        assert!(Aabb::from_points(&[]).is_empty());
    }

    #[test]
    fn test_aabb_transformed() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let moved = aabb.transformed(&Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)));
        assert_eq!(moved.min, Vec3::new(10.0, 0.0, 0.0));
        assert_eq!(moved.max, Vec3::new(11.0, 1.0, 1.0));
    }

    #[test]
    fn test_sphere_distance() {
        let sphere = BoundingSphere::from_aabb(&Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0)));
        assert!((sphere.radius - 3.0_f32.sqrt()).abs() < 1e-6);
        assert_eq!(sphere.distance_to(Vec3::ZERO), 0.0);
        let d = sphere.distance_to(Vec3::new(10.0, 0.0, 0.0));
        assert!((d - (10.0 - 3.0_f32.sqrt())).abs() < 1e-5);
    }

    #[test]
    fn test_camera_to_local() {
        let camera = CameraState::new(Vec3::new(5.0, 0.0, 0.0), Vec3::X);
        let local = camera.to_local(&Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0)));
        assert!(local.position.abs_diff_eq(Vec3::ZERO, 1e-6));
        assert!(local.forward.abs_diff_eq(Vec3::X, 1e-6));
    }

    #[test]
    fn test_motion_trigger() {
        let mut trigger = MotionTrigger::default();
        let camera = CameraState::new(Vec3::ZERO, Vec3::NEG_Z);
        assert!(trigger.crossed(&camera, 1.0, 10.0));

        trigger.reset(&camera);
        assert!(!trigger.crossed(&camera, 1.0, 10.0));

        let moved = CameraState::new(Vec3::new(0.0, 0.0, 2.0), Vec3::NEG_Z);
        assert!(trigger.crossed(&moved, 1.0, 10.0));
        assert!(trigger.moved(&moved, 1.0));
        assert!(!trigger.turned(&moved, 10.0));

        let turned = CameraState::new(Vec3::ZERO, Vec3::X);
        assert!(trigger.crossed(&turned, 1.0, 10.0));
        assert!(!trigger.moved(&turned, 1.0));
    }
}
