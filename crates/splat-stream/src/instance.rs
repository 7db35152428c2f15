//! One placement of an [`Octree`] in the scene.
//!
//! An instance assigns a LOD to every node of its octree and keeps one
//! [`FilePlacement`] per file that at least one node currently uses. Two
//! reference layers are maintained on every transition:
//!
//! - the instance-local count per file, which decides when this instance
//!   stops needing a file and tears its placement down;
//! - the octree-global count, shared by all instances of the asset, which
//!   gates eviction. Increments apply immediately, decrements are queued as
//!   releases and applied once a world state without the file was sorted.
//!
//! For every file, `global == sum of local counts + queued releases`.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use glam::Mat4;

use crate::loader::AssetLoader;
use crate::octree::{Octree, OctreeNode, ReleaseTarget};
use crate::resource::SplatResource;
use crate::types::CameraState;

/// A file in use by an instance, and the node ranges of it that are active.
#[derive(Debug, Clone)]
pub struct FilePlacement {
    /// Index into the octree's file table.
    pub file: usize,
    /// LOD level the file was first referenced at.
    pub lod_level: i32,
    /// The loaded file, `None` while the load is in flight.
    pub resource: Option<Arc<SplatResource>>,
    /// Active `[start, end)` splat range per node index.
    pub intervals: BTreeMap<usize, (u32, u32)>,
}

impl FilePlacement {
    /// Whether the placement is registered for rendering.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.resource.is_some()
    }
}

/// Pick the LOD of `node` for a camera `distance` away from its bounding
/// sphere, given the upper bound of each distance band.
///
/// Returns −1 beyond the last band. When the band's level is missing from
/// the node the nearest coarser populated level is used, then the nearest
/// finer one.
#[must_use]
pub fn calculate_node_lod(node: &OctreeNode, distance: f32, lod_distances: &[f32]) -> i32 {
    let Some(band) = lod_distances.iter().position(|&d| distance < d) else {
        return -1;
    };

    let levels = node.lods().len();
    if levels == 0 {
        return -1;
    }
    let preferred = band.min(levels - 1);
    (preferred..levels)
        .chain((0..preferred).rev())
        .find(|&level| !node.lod(level).is_empty())
        .map_or(-1, |level| level as i32)
}

/// One placement of an octree: per-node LOD and per-file placements.
#[derive(Debug)]
pub struct OctreeInstance {
    node_lods: Vec<i32>,
    file_placements: Vec<Option<FilePlacement>>,
    file_ref_counts: Vec<u32>,
    pending: BTreeSet<usize>,
    releases: Vec<ReleaseTarget>,
    /// Whether this instance holds a reference on the octree's environment.
    has_environment: bool,
    environment: Option<Arc<SplatResource>>,
}

impl OctreeInstance {
    /// Create an instance with every node culled. Takes the environment
    /// reference if the asset has one.
    pub fn new(octree: &mut Octree, loader: &dyn AssetLoader) -> Self {
        let has_environment = octree.inc_environment_ref();
        let environment = if has_environment {
            octree.ensure_environment_resource(loader)
        } else {
            None
        };

        let file_count = octree.files().len();
        Self {
            node_lods: vec![-1; octree.nodes().len()],
            file_placements: vec![None; file_count],
            file_ref_counts: vec![0; file_count],
            pending: BTreeSet::new(),
            releases: Vec::new(),
            has_environment,
            environment,
        }
    }

    /// Current LOD of `node`, −1 when culled.
    #[must_use]
    pub fn node_lod(&self, node: usize) -> i32 {
        self.node_lods[node]
    }

    /// Number of nodes of this instance referencing `file`.
    #[must_use]
    pub fn local_file_ref_count(&self, file: usize) -> u32 {
        self.file_ref_counts[file]
    }

    /// The placement of `file`, if any node uses it.
    #[must_use]
    pub fn file_placement(&self, file: usize) -> Option<&FilePlacement> {
        self.file_placements[file].as_ref()
    }

    /// Files whose load is still in flight.
    #[must_use]
    pub fn pending(&self) -> &BTreeSet<usize> {
        &self.pending
    }

    /// Number of resources this instance is still waiting for.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        let environment_pending = self.has_environment && self.environment.is_none();
        self.pending.len() + usize::from(environment_pending)
    }

    /// Placements that are registered for rendering.
    pub fn active_placements(&self) -> impl Iterator<Item = &FilePlacement> {
        self.file_placements
            .iter()
            .flatten()
            .filter(|p| p.is_registered())
    }

    /// Whether this instance holds a reference on the octree's environment.
    #[must_use]
    pub fn holds_environment(&self) -> bool {
        self.has_environment
    }

    /// The environment resource, once loaded.
    #[must_use]
    pub fn environment(&self) -> Option<&Arc<SplatResource>> {
        self.environment.as_ref()
    }

    /// Whether releases are waiting to be handed to the next world state.
    #[must_use]
    pub fn has_releases(&self) -> bool {
        !self.releases.is_empty()
    }

    /// Queued releases for `target` not yet handed to a world state.
    #[must_use]
    pub fn queued_release_count(&self, target: ReleaseTarget) -> usize {
        self.releases.iter().filter(|r| **r == target).count()
    }

    /// Hand the queued releases to the caller.
    pub fn take_releases(&mut self) -> Vec<ReleaseTarget> {
        std::mem::take(&mut self.releases)
    }

    /// Re-evaluate the LOD of every node for `camera`.
    ///
    /// Returns true when the set of rendered splats changed.
    pub fn update_lod(
        &mut self,
        octree: &mut Octree,
        camera: &CameraState,
        world_transform: &Mat4,
        lod_distances: &[f32],
        loader: &dyn AssetLoader,
    ) -> bool {
        let local_camera = camera.to_local(world_transform);
        // Bands are in world units; undo the placement's scale.
        let scale = world_transform
            .to_scale_rotation_translation()
            .0
            .abs()
            .max_element();

        let mut changed = false;
        for node_index in 0..self.node_lods.len() {
            let node = &octree.nodes()[node_index];
            let distance = node.sphere().distance_to(local_camera.position) * scale;
            let new_lod = calculate_node_lod(node, distance, lod_distances);
            let old_lod = self.node_lods[node_index];
            if new_lod == old_lod {
                continue;
            }

            let old = (old_lod >= 0).then(|| *node.lod(old_lod as usize));
            let new = (new_lod >= 0).then(|| *node.lod(new_lod as usize));
            self.node_lods[node_index] = new_lod;

            if let Some(file) = old.and_then(|d| d.file) {
                changed |= self.remove_interval(file, node_index);
            }
            if let Some(descriptor) = new
                && let Some(file) = descriptor.file
            {
                changed |= self.add_interval(
                    octree,
                    file,
                    new_lod,
                    node_index,
                    descriptor.interval(),
                    loader,
                );
            }
        }

        if changed {
            tracing::trace!(url = %octree.url(), "lod membership changed");
        }
        changed
    }

    /// Take a reference on `file` for `node` and expose its range.
    fn add_interval(
        &mut self,
        octree: &mut Octree,
        file: usize,
        lod_level: i32,
        node: usize,
        interval: (u32, u32),
        loader: &dyn AssetLoader,
    ) -> bool {
        octree.inc_ref_count(file);
        self.file_ref_counts[file] += 1;

        if self.file_ref_counts[file] == 1 {
            let resource = octree.ensure_file_resource(file, loader);
            if resource.is_none() {
                self.pending.insert(file);
            }
            self.file_placements[file] = Some(FilePlacement {
                file,
                lod_level,
                resource,
                intervals: BTreeMap::new(),
            });
        }

        let Some(placement) = self.file_placements[file].as_mut() else {
            return false;
        };
        placement.intervals.insert(node, interval);
        placement.is_registered()
    }

    /// Drop `node`'s reference on `file`, tearing the placement down when it
    /// was the last one.
    fn remove_interval(&mut self, file: usize, node: usize) -> bool {
        debug_assert!(self.file_ref_counts[file] > 0, "local ref underflow");
        if self.file_ref_counts[file] == 0 {
            tracing::error!(file, "local ref count underflow");
            return false;
        }

        self.file_ref_counts[file] -= 1;
        self.releases.push(ReleaseTarget::File(file));

        if self.file_ref_counts[file] == 0 {
            self.pending.remove(&file);
            return self.file_placements[file]
                .take()
                .is_some_and(|p| p.is_registered());
        }

        match self.file_placements[file].as_mut() {
            Some(placement) => {
                placement.intervals.remove(&node);
                placement.is_registered()
            }
            None => false,
        }
    }

    /// Adopt resources whose loads completed since the last poll.
    ///
    /// Returns true when a placement was registered.
    pub fn update(&mut self, octree: &mut Octree, loader: &dyn AssetLoader) -> bool {
        let mut changed = false;

        let pending: Vec<usize> = self.pending.iter().copied().collect();
        for file in pending {
            if self.file_ref_counts[file] == 0 {
                self.pending.remove(&file);
                continue;
            }
            let Some(resource) = octree.ensure_file_resource(file, loader) else {
                continue;
            };
            if let Some(placement) = self.file_placements[file].as_mut() {
                placement.resource = Some(resource);
                changed = true;
            }
            self.pending.remove(&file);
        }

        if self.has_environment
            && self.environment.is_none()
            && let Some(resource) = octree.ensure_environment_resource(loader)
        {
            self.environment = Some(resource);
            changed = true;
        }

        changed
    }

    /// Tear the instance down, returning every release it still owes: the
    /// queued ones, one per outstanding node reference and the environment.
    pub fn destroy(&mut self) -> Vec<ReleaseTarget> {
        let mut releases = std::mem::take(&mut self.releases);
        for (file, count) in self.file_ref_counts.iter_mut().enumerate() {
            releases.extend(std::iter::repeat_n(ReleaseTarget::File(file), *count as usize));
            *count = 0;
        }
        if std::mem::take(&mut self.has_environment) {
            releases.push(ReleaseTarget::Environment);
        }

        self.node_lods.fill(-1);
        self.file_placements.fill(None);
        self.pending.clear();
        self.environment = None;
        releases
    }
}
