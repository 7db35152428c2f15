//! Spatial index of one streamable splat asset and the lifecycle of its files.
//!
//! Every file of an [`Octree`] carries a reference count shared by all
//! instances of the asset. When the count drops to zero the file is not
//! unloaded right away: it enters a cooldown of a configurable number of
//! frames, so a camera wobbling across a LOD boundary does not thrash the
//! loader. Re-referencing a file during its cooldown cancels the eviction.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::asset::{OctreeAsset, OctreeFile};
use crate::loader::AssetLoader;
use crate::resource::SplatResource;
use crate::types::{Aabb, BoundingSphere};

/// The backing range of a node at one level of detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LodDescriptor {
    /// Index into the octree's file table, `None` when the level is missing.
    pub file: Option<usize>,
    /// First splat of the node inside the file.
    pub offset: u32,
    /// Number of splats of the node.
    pub count: u32,
}

impl LodDescriptor {
    /// Descriptor of a level the node has no data for.
    pub const EMPTY: Self = Self {
        file: None,
        offset: 0,
        count: 0,
    };

    /// Whether the level has nothing to render.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.file.is_none() || self.count == 0
    }

    /// The `[start, end)` splat range inside the file.
    #[must_use]
    pub fn interval(&self) -> (u32, u32) {
        (self.offset, self.offset.saturating_add(self.count))
    }
}

/// Static metadata of one octree leaf.
#[derive(Debug, Clone)]
pub struct OctreeNode {
    bounds: Aabb,
    sphere: BoundingSphere,
    lods: Vec<LodDescriptor>,
}

impl OctreeNode {
    #[must_use]
    pub fn new(bounds: Aabb, lods: Vec<LodDescriptor>) -> Self {
        Self {
            sphere: BoundingSphere::from_aabb(&bounds),
            bounds,
            lods,
        }
    }

    #[must_use]
    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    #[must_use]
    pub fn sphere(&self) -> &BoundingSphere {
        &self.sphere
    }

    /// Descriptor for `level`; out-of-range levels are empty.
    #[must_use]
    pub fn lod(&self, level: usize) -> &LodDescriptor {
        self.lods.get(level).unwrap_or(&LodDescriptor::EMPTY)
    }

    #[must_use]
    pub fn lods(&self) -> &[LodDescriptor] {
        &self.lods
    }
}

/// Which reference an octree release targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseTarget {
    /// A file of the octree, by index.
    File(usize),
    /// The octree's environment resource.
    Environment,
}

#[derive(Debug)]
struct Environment {
    url: String,
    ref_count: u32,
    resource: Option<Arc<SplatResource>>,
}

/// The spatial index of one streamable asset.
#[derive(Debug)]
pub struct Octree {
    url: String,
    nodes: Vec<OctreeNode>,
    files: Vec<OctreeFile>,
    file_ref_counts: Vec<i32>,
    /// Files with zero references waiting to be unloaded, with ticks remaining.
    cooldowns: HashMap<usize, u32>,
    file_resources: HashMap<usize, Arc<SplatResource>>,
    /// Files with a load issued to the loader and not yet unloaded.
    requested: HashSet<usize>,
    environment: Option<Environment>,
    destroyed: bool,
}

impl Octree {
    /// Create the runtime index of a parsed asset.
    #[must_use]
    pub fn new(asset: OctreeAsset) -> Self {
        Self {
            url: asset.url,
            nodes: asset.nodes,
            file_ref_counts: vec![0; asset.files.len()],
            files: asset.files,
            cooldowns: HashMap::new(),
            file_resources: HashMap::new(),
            requested: HashSet::new(),
            environment: asset.environment.map(|url| Environment {
                url,
                ref_count: 0,
                resource: None,
            }),
            destroyed: false,
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn nodes(&self) -> &[OctreeNode] {
        &self.nodes
    }

    #[must_use]
    pub fn files(&self) -> &[OctreeFile] {
        &self.files
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Global reference count of `file` across all instances.
    #[must_use]
    pub fn file_ref_count(&self, file: usize) -> i32 {
        self.file_ref_counts[file]
    }

    /// Whether `file` is waiting out its cooldown.
    #[must_use]
    pub fn has_cooldown(&self, file: usize) -> bool {
        self.cooldowns.contains_key(&file)
    }

    /// Number of files currently adopted from the loader.
    #[must_use]
    pub fn loaded_file_count(&self) -> usize {
        self.file_resources.len()
    }

    /// Take a reference to `file`, cancelling any pending eviction.
    pub fn inc_ref_count(&mut self, file: usize) {
        self.file_ref_counts[file] += 1;
        if self.cooldowns.remove(&file).is_some() {
            tracing::trace!(url = %self.files[file].url, "cooldown cancelled");
        }
    }

    /// Drop a reference to `file`. At zero the file is unloaded immediately
    /// when `cooldown_ticks` is zero, otherwise after that many ticks.
    pub fn dec_ref_count(&mut self, file: usize, cooldown_ticks: u32, loader: &dyn AssetLoader) {
        let count = self.file_ref_counts[file];
        debug_assert!(count > 0, "ref count underflow on file {file} of {}", self.url);
        if count <= 0 {
            tracing::error!(url = %self.url, file, "ref count underflow");
            return;
        }

        self.file_ref_counts[file] = count - 1;
        if count == 1 {
            if cooldown_ticks == 0 {
                self.unload_resource(file, loader);
            } else {
                self.cooldowns.insert(file, cooldown_ticks);
            }
        }
    }

    /// Advance every cooldown by one tick, unloading files whose cooldown
    /// elapsed and that are still unreferenced. Returns the number unloaded.
    pub fn update_cooldown_tick(&mut self, loader: &dyn AssetLoader) -> usize {
        if self.cooldowns.is_empty() {
            return 0;
        }

        let mut expired = Vec::new();
        for (&file, ticks) in &mut self.cooldowns {
            *ticks = ticks.saturating_sub(1);
            if *ticks == 0 {
                expired.push(file);
            }
        }

        let mut unloaded = 0;
        for file in expired {
            self.cooldowns.remove(&file);
            // The file may have been referenced again since it was scheduled.
            if self.file_ref_counts[file] == 0 {
                self.unload_resource(file, loader);
                unloaded += 1;
            }
        }
        unloaded
    }

    /// Unload every file waiting out a cooldown right away.
    pub fn flush_cooldowns(&mut self, loader: &dyn AssetLoader) {
        let files: Vec<usize> = self.cooldowns.drain().map(|(file, _)| file).collect();
        for file in files {
            if self.file_ref_counts[file] == 0 {
                self.unload_resource(file, loader);
            }
        }
    }

    /// Make sure `file` is loaded or loading, returning it once available.
    ///
    /// Never blocks: the first call issues the load, later calls adopt the
    /// resource once the loader has it. Destroyed octrees issue nothing.
    pub fn ensure_file_resource(
        &mut self,
        file: usize,
        loader: &dyn AssetLoader,
    ) -> Option<Arc<SplatResource>> {
        if let Some(resource) = self.file_resources.get(&file) {
            if self.file_ref_counts[file] > 0 {
                self.cooldowns.remove(&file);
            }
            return Some(Arc::clone(resource));
        }
        if self.destroyed {
            return None;
        }

        let url = &self.files[file].url;
        loader.load(url);
        self.requested.insert(file);

        let resource = loader.get_resource(url)?;
        tracing::debug!(url, "file resource adopted");
        self.file_resources.insert(file, Arc::clone(&resource));
        Some(resource)
    }

    fn unload_resource(&mut self, file: usize, loader: &dyn AssetLoader) {
        self.file_resources.remove(&file);
        if self.destroyed {
            return;
        }
        if self.requested.remove(&file) {
            tracing::debug!(url = %self.files[file].url, "file unloaded");
            loader.unload(&self.files[file].url);
        }
    }

    /// URL of the environment resource, if the asset has one.
    #[must_use]
    pub fn environment_url(&self) -> Option<&str> {
        self.environment.as_ref().map(|e| e.url.as_str())
    }

    /// Reference count of the environment resource.
    #[must_use]
    pub fn environment_ref_count(&self) -> u32 {
        self.environment.as_ref().map_or(0, |e| e.ref_count)
    }

    /// Take a reference to the environment resource. Returns false when the
    /// asset has none.
    pub fn inc_environment_ref(&mut self) -> bool {
        match &mut self.environment {
            Some(environment) => {
                environment.ref_count += 1;
                true
            }
            None => false,
        }
    }

    /// Drop a reference to the environment resource, unloading it at zero.
    pub fn dec_environment_ref(&mut self, loader: &dyn AssetLoader) {
        let destroyed = self.destroyed;
        let Some(environment) = &mut self.environment else {
            return;
        };
        debug_assert!(environment.ref_count > 0, "environment ref underflow");
        if environment.ref_count == 0 {
            tracing::error!(url = %environment.url, "environment ref count underflow");
            return;
        }

        environment.ref_count -= 1;
        if environment.ref_count == 0 {
            environment.resource = None;
            if !destroyed {
                loader.unload(&environment.url);
            }
        }
    }

    /// Environment counterpart of [`Octree::ensure_file_resource`].
    pub fn ensure_environment_resource(
        &mut self,
        loader: &dyn AssetLoader,
    ) -> Option<Arc<SplatResource>> {
        let destroyed = self.destroyed;
        let environment = self.environment.as_mut()?;
        if let Some(resource) = &environment.resource {
            return Some(Arc::clone(resource));
        }
        if destroyed || environment.ref_count == 0 {
            return None;
        }

        loader.load(&environment.url);
        let resource = loader.get_resource(&environment.url)?;
        environment.resource = Some(Arc::clone(&resource));
        Some(resource)
    }

    /// Stop all further loading.
    ///
    /// Every file and the environment are released from the loader, but
    /// resources already handed to world states stay alive until those
    /// states retire. Reference counting keeps working so outstanding
    /// releases can still be applied.
    pub fn destroy(&mut self, loader: &dyn AssetLoader) {
        if self.destroyed {
            return;
        }
        tracing::debug!(url = %self.url, "octree destroyed");

        for file in self.requested.drain() {
            loader.unload(&self.files[file].url);
        }
        if let Some(environment) = &mut self.environment {
            if environment.ref_count > 0 || environment.resource.is_some() {
                loader.unload(&environment.url);
            }
            environment.resource = None;
        }
        self.cooldowns.clear();
        self.file_resources.clear();
        self.destroyed = true;
    }
}
