//! Versioned snapshots of the renderable splat set.

use std::sync::Arc;

use glam::Vec3;

use crate::octree::ReleaseTarget;
use crate::placement::OctreeId;
use crate::sort::{SortParameters, SortRequest, SplatSortView};
use crate::splat_info::SplatInfo;
use crate::types::CameraState;

/// An octree reference to drop once it is safe to do so.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRelease {
    pub octree: OctreeId,
    pub target: ReleaseTarget,
}

/// The complete set of splats to render at one version.
///
/// Membership never changes after creation. Every splat's resource carries
/// one world reference for as long as the state lives; dropping the state
/// releases them.
#[derive(Debug)]
pub struct WorldState {
    version: u64,
    splats: Vec<SplatInfo>,
    pending_releases: Vec<PendingRelease>,
    texture_width: u32,
    total_lines: u32,
    total_used_pixels: u32,
    /// Set once a sort result for this version was accepted.
    pub sorted_before: bool,
    /// Set once the CPU sorter received this version's parameters.
    pub sort_parameters_set: bool,
}

impl WorldState {
    /// Build a state, allocating consecutive buffer lines to `splats`.
    #[must_use]
    pub fn new(
        version: u64,
        mut splats: Vec<SplatInfo>,
        pending_releases: Vec<PendingRelease>,
        texture_width: u32,
    ) -> Self {
        let mut line = 0;
        let mut used = 0;
        for splat in &mut splats {
            splat.set_lines(line, texture_width);
            splat.resource.add_world_ref();
            line += splat.line_count;
            used += splat.active_splats;
        }

        Self {
            version,
            splats,
            pending_releases,
            texture_width,
            total_lines: line,
            total_used_pixels: used,
            sorted_before: false,
            sort_parameters_set: false,
        }
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn splats(&self) -> &[SplatInfo] {
        &self.splats
    }

    pub fn splats_mut(&mut self) -> &mut [SplatInfo] {
        &mut self.splats
    }

    #[must_use]
    pub fn pending_releases(&self) -> &[PendingRelease] {
        &self.pending_releases
    }

    /// Remove the queued releases so they can be applied.
    pub fn take_pending_releases(&mut self) -> Vec<PendingRelease> {
        std::mem::take(&mut self.pending_releases)
    }

    /// Buffer lines used by all splats.
    #[must_use]
    pub fn total_lines(&self) -> u32 {
        self.total_lines
    }

    /// Number of active splats across all entries.
    #[must_use]
    pub fn total_used_pixels(&self) -> u32 {
        self.total_used_pixels
    }

    /// The once-per-version payload for the CPU sorter.
    #[must_use]
    pub fn sort_parameters(&self) -> SortParameters {
        SortParameters {
            version: self.version,
            texture_width: self.texture_width,
            total_used_pixels: self.total_used_pixels,
            ids: self.splats.iter().map(|s| s.resource.id()).collect(),
            line_starts: self.splats.iter().map(|s| s.line_start).collect(),
            padding: self.splats.iter().map(|s| s.padding).collect(),
            intervals: self.splats.iter().map(SplatInfo::active_ranges).collect(),
            centers: self
                .splats
                .iter()
                .map(|s| Arc::clone(s.resource.centers()))
                .collect(),
        }
    }

    /// The camera expressed in every splat's local space.
    #[must_use]
    pub fn sort_request(&self, camera: &CameraState, radial: bool) -> SortRequest {
        let splats = self
            .splats
            .iter()
            .map(|splat| {
                let local = camera.to_local(&splat.world_transform);
                let scale: Vec3 = splat.world_transform.to_scale_rotation_translation().0;
                SplatSortView {
                    camera_position: local.position,
                    camera_direction: local.forward,
                    aabb: splat.local_aabb,
                    scale: scale.abs().max_element(),
                }
            })
            .collect();
        SortRequest {
            version: self.version,
            radial,
            splats,
        }
    }

    /// World-space distance range of all splats from `camera`, used to
    /// normalize sort keys.
    #[must_use]
    pub fn distance_range(&self, camera: &CameraState, radial: bool) -> (f32, f32) {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for splat in &self.splats {
            if splat.aabb.is_empty() {
                continue;
            }
            for corner in splat.aabb.corners() {
                let d = if radial {
                    corner.distance(camera.position)
                } else {
                    (corner - camera.position).dot(camera.forward)
                };
                min = min.min(d);
                max = max.max(d);
            }
        }
        if min > max {
            return (0.0, 0.0);
        }
        if radial {
            // The camera may sit inside a box; nothing is closer than zero.
            min = min.max(0.0);
        }
        (min, max)
    }
}

impl Drop for WorldState {
    fn drop(&mut self) {
        for splat in &self.splats {
            splat.resource.release_world_ref();
        }
        if !self.pending_releases.is_empty() {
            tracing::warn!(
                version = self.version,
                count = self.pending_releases.len(),
                "world state dropped with unapplied releases"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::Mat4;

    use super::*;
    use crate::placement::PlacementId;
    use crate::resource::SplatResource;

    fn splat(n: usize) -> SplatInfo {
        let centers = (0..n).map(|i| Vec3::new(i as f32, 0.0, 0.0)).collect();
        SplatInfo::new(
            Arc::new(SplatResource::new("r.bin", centers)),
            PlacementId(n as u64),
            Mat4::IDENTITY,
            0,
            None,
        )
    }

    #[test]
    fn test_lines_are_allocated_consecutively() {
        let state = WorldState::new(1, vec![splat(5), splat(9), splat(4)], Vec::new(), 4);
        let lines: Vec<_> = state
            .splats()
            .iter()
            .map(|s| (s.line_start, s.line_count, s.padding))
            .collect();
        assert_eq!(lines, vec![(0, 2, 3), (2, 3, 3), (5, 1, 0)]);
        assert_eq!(state.total_lines(), 6);
        assert_eq!(state.total_used_pixels(), 18);
    }

    #[test]
    fn test_world_refs_follow_state_lifetime() {
        let a = splat(3);
        let resource = Arc::clone(&a.resource);

        let first = WorldState::new(1, vec![a.clone()], Vec::new(), 8);
        let second = WorldState::new(2, vec![a], Vec::new(), 8);
        assert_eq!(resource.world_ref_count(), 2);

        drop(first);
        assert_eq!(resource.world_ref_count(), 1);
        drop(second);
        assert_eq!(resource.world_ref_count(), 0);
    }

    #[test]
    fn test_sort_parameters() {
        let state = WorldState::new(7, vec![splat(5), splat(2)], Vec::new(), 4);
        let params = state.sort_parameters();
        assert_eq!(params.version, 7);
        assert_eq!(params.line_starts, vec![0, 2]);
        assert_eq!(params.padding, vec![3, 2]);
        assert_eq!(params.intervals, vec![vec![(0, 5)], vec![(0, 2)]]);
        assert_eq!(params.total_used_pixels, 7);
    }

    #[test]
    fn test_distance_range() {
        let state = WorldState::new(1, vec![splat(11)], Vec::new(), 4);
        let camera = CameraState::new(Vec3::new(-5.0, 0.0, 0.0), Vec3::X);
        let (min, max) = state.distance_range(&camera, false);
        assert!((min - 5.0).abs() < 1e-5);
        assert!((max - 15.0).abs() < 1e-5);

        let (min, max) = state.distance_range(&camera, true);
        assert!((min - 5.0).abs() < 1e-5);
        assert!((max - 15.0).abs() < 1e-5);
    }
}
