//! Scene placements handed to the manager each frame.

use std::sync::Arc;

use glam::Mat4;

use crate::resource::SplatResource;

/// Identifies a placement across frames. Chosen by the host, typically the
/// scene node or entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlacementId(pub u64);

/// Identifies an octree registered with the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OctreeId(pub u32);

/// What a placement renders.
#[derive(Debug, Clone)]
pub enum PlacementSource {
    /// A single, fully resident resource.
    Standalone(Arc<SplatResource>),
    /// A streamed octree asset.
    Octree(OctreeId),
}

/// A resource placed in the scene with its current world transform.
#[derive(Debug, Clone)]
pub struct ScenePlacement {
    pub id: PlacementId,
    pub source: PlacementSource,
    pub world_transform: Mat4,
}

impl ScenePlacement {
    #[must_use]
    pub fn standalone(id: PlacementId, resource: Arc<SplatResource>, world_transform: Mat4) -> Self {
        Self {
            id,
            source: PlacementSource::Standalone(resource),
            world_transform,
        }
    }

    #[must_use]
    pub fn octree(id: PlacementId, octree: OctreeId, world_transform: Mat4) -> Self {
        Self {
            id,
            source: PlacementSource::Octree(octree),
            world_transform,
        }
    }
}
