//! One renderable unit of a world state.

use std::{collections::BTreeMap, sync::Arc};

use glam::Mat4;

use crate::placement::PlacementId;
use crate::resource::SplatResource;
use crate::types::Aabb;

/// A resource (or the active ranges of it) placed in the world, with its
/// allocation in the shared packed buffer.
#[derive(Debug, Clone)]
pub struct SplatInfo {
    pub resource: Arc<SplatResource>,
    /// Scene placement this splat belongs to.
    pub placement: PlacementId,
    /// LOD level of the file, 0 for standalone resources.
    pub lod_index: i32,
    /// Sorted, merged `[start, end)` ranges of active splats.
    pub intervals: Vec<(u32, u32)>,
    /// Number of active splats.
    pub active_splats: u32,
    /// First buffer line of the allocation.
    pub line_start: u32,
    /// Number of buffer lines allocated.
    pub line_count: u32,
    /// Unused slots at the end of the last line.
    pub padding: u32,
    pub world_transform: Mat4,
    /// Transform the work buffer was last synced with.
    pub previous_world_transform: Mat4,
    /// Resource-local bounds of the active splats.
    pub local_aabb: Aabb,
    /// World-space bounds of the active splats.
    pub aabb: Aabb,
    /// Camera rotation in degrees since the last color refresh.
    pub accumulated_rotation: f32,
    /// Camera translation since the last color refresh.
    pub accumulated_translation: f32,
}

impl SplatInfo {
    /// Create the splat for `resource`, restricted to `intervals` when given.
    #[must_use]
    pub fn new(
        resource: Arc<SplatResource>,
        placement: PlacementId,
        world_transform: Mat4,
        lod_index: i32,
        intervals: Option<&BTreeMap<usize, (u32, u32)>>,
    ) -> Self {
        let num_splats = resource.num_splats();
        let (intervals, active_splats, local_aabb) = match intervals {
            None => {
                let whole = if num_splats > 0 { vec![(0, num_splats)] } else { Vec::new() };
                (whole, num_splats, *resource.aabb())
            }
            Some(map) => {
                let intervals = merge_intervals(map.values().copied(), num_splats);
                let centers = resource.centers();
                let active = intervals.iter().map(|(s, e)| e - s).sum();
                let aabb = intervals.iter().fold(Aabb::EMPTY, |mut aabb, &(s, e)| {
                    aabb.merge(&Aabb::from_points(&centers[s as usize..e as usize]));
                    aabb
                });
                (intervals, active, aabb)
            }
        };

        Self {
            resource,
            placement,
            lod_index,
            intervals,
            active_splats,
            line_start: 0,
            line_count: 0,
            padding: 0,
            world_transform,
            previous_world_transform: world_transform,
            aabb: local_aabb.transformed(&world_transform),
            local_aabb,
            accumulated_rotation: 0.0,
            accumulated_translation: 0.0,
        }
    }

    /// Allocate whole lines of a `texture_width` wide buffer starting at `line_start`.
    pub fn set_lines(&mut self, line_start: u32, texture_width: u32) {
        self.line_start = line_start;
        self.line_count = self.active_splats.div_ceil(texture_width);
        self.padding = self.line_count * texture_width - self.active_splats;
    }

    /// Whether this splat shows the same data as `other`.
    #[must_use]
    pub fn same_source(&self, other: &SplatInfo) -> bool {
        self.placement == other.placement && self.resource.id() == other.resource.id()
    }

    /// Continue the transform and color tracking of the same splat in an
    /// older world state.
    pub fn carry_over(&mut self, previous: &SplatInfo) {
        self.previous_world_transform = previous.previous_world_transform;
        self.accumulated_rotation = previous.accumulated_rotation;
        self.accumulated_translation = previous.accumulated_translation;
    }

    /// Set the current world transform, refreshing the world bounds.
    pub fn set_transform(&mut self, world_transform: Mat4) {
        if self.world_transform != world_transform {
            self.world_transform = world_transform;
            self.aabb = self.local_aabb.transformed(&world_transform);
        }
    }

    /// Acknowledge the current transform. Returns true when it changed since
    /// the last acknowledgement, meaning the work buffer needs the update.
    pub fn update(&mut self) -> bool {
        if self.previous_world_transform == self.world_transform {
            return false;
        }
        self.previous_world_transform = self.world_transform;
        true
    }

    /// Add camera motion to the color accumulators.
    pub fn accumulate_motion(&mut self, translation: f32, rotation: f32) {
        self.accumulated_translation += translation;
        self.accumulated_rotation += rotation;
    }

    /// Whether accumulated motion crossed either threshold.
    #[must_use]
    pub fn color_due(&self, distance: f32, angle: f32) -> bool {
        self.accumulated_translation > distance || self.accumulated_rotation > angle
    }

    pub fn reset_color(&mut self) {
        self.accumulated_translation = 0.0;
        self.accumulated_rotation = 0.0;
    }

    /// The ranges to sort and upload.
    #[must_use]
    pub fn active_ranges(&self) -> Vec<(u32, u32)> {
        self.intervals.clone()
    }
}

/// Sort, clamp to `limit` and merge touching or overlapping ranges.
fn merge_intervals(ranges: impl Iterator<Item = (u32, u32)>, limit: u32) -> Vec<(u32, u32)> {
    let mut ranges: Vec<(u32, u32)> = ranges
        .map(|(s, e)| (s.min(limit), e.min(limit)))
        .filter(|(s, e)| s < e)
        .collect();
    ranges.sort_unstable();

    let mut merged: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;

    fn resource(n: usize) -> Arc<SplatResource> {
        let centers = (0..n).map(|i| Vec3::new(i as f32, 0.0, 0.0)).collect();
        Arc::new(SplatResource::new("r.bin", centers))
    }

    #[test]
    fn test_merge_intervals() {
        let merged = merge_intervals([(10, 20), (0, 5), (5, 8), (15, 30), (90, 120)].into_iter(), 100);
        assert_eq!(merged, vec![(0, 8), (10, 30), (90, 100)]);
    }

    #[test]
    fn test_intervals_restrict_active_splats_and_bounds() {
        let intervals = BTreeMap::from([(3, (10, 20)), (7, (40, 45))]);
        let info = SplatInfo::new(resource(100), PlacementId(1), Mat4::IDENTITY, 0, Some(&intervals));
        assert_eq!(info.active_splats, 15);
        assert_eq!(info.local_aabb.min.x, 10.0);
        assert_eq!(info.local_aabb.max.x, 44.0);
        assert_eq!(info.active_ranges(), vec![(10, 20), (40, 45)]);
    }

    #[test]
    fn test_whole_resource_without_intervals() {
        let info = SplatInfo::new(resource(7), PlacementId(1), Mat4::IDENTITY, 0, None);
        assert_eq!(info.active_splats, 7);
        assert_eq!(info.active_ranges(), vec![(0, 7)]);
    }

    #[test]
    fn test_out_of_range_intervals_select_nothing() {
        let intervals = BTreeMap::from([(0, (50, 60))]);
        let info = SplatInfo::new(resource(10), PlacementId(1), Mat4::IDENTITY, 0, Some(&intervals));
        assert_eq!(info.active_splats, 0);
        assert!(info.active_ranges().is_empty());
        assert!(info.local_aabb.is_empty());
    }

    #[test]
    fn test_set_lines() {
        let mut info = SplatInfo::new(resource(10), PlacementId(1), Mat4::IDENTITY, 0, None);
        info.set_lines(4, 4);
        assert_eq!(info.line_start, 4);
        assert_eq!(info.line_count, 3);
        assert_eq!(info.padding, 2);
    }

    #[test]
    fn test_update_detects_transform_change() {
        let mut info = SplatInfo::new(resource(3), PlacementId(1), Mat4::IDENTITY, 0, None);
        assert!(!info.update());

        info.set_transform(Mat4::from_translation(Vec3::Y));
        assert_eq!(info.aabb.min, Vec3::new(0.0, 1.0, 0.0));
        assert!(info.update());
        assert!(!info.update());
    }

    #[test]
    fn test_color_accumulators() {
        let mut info = SplatInfo::new(resource(3), PlacementId(1), Mat4::IDENTITY, 0, None);
        info.accumulate_motion(0.6, 1.0);
        assert!(!info.color_due(1.0, 5.0));
        info.accumulate_motion(0.6, 1.0);
        assert!(info.color_due(1.0, 5.0));
        info.reset_color();
        assert!(!info.color_due(1.0, 5.0));
    }
}
