//! Per-frame coordination of octree streaming, world states and sorting.
//!
//! The manager owns every [`Octree`] (in an arena keyed by [`OctreeId`]), one
//! [`OctreeInstance`] per octree placement, and the live [`WorldState`]s. A
//! world state is immutable once built; a new version is built whenever the
//! set of renderable splats changes. Sort results are matched to world states
//! by version, so a late result can never draw a state that was already
//! replaced.
//!
//! Octree file references dropped by LOD changes are not released right away.
//! They travel with the next world state and are applied once that state, or
//! a newer one, has been sorted, which is the first moment nothing on screen
//! can still need them.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use glam::Mat4;

use crate::asset::OctreeAsset;
use crate::buffer::{GraphicsContext, WorkBuffer};
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::instance::OctreeInstance;
use crate::loader::AssetLoader;
use crate::octree::{Octree, ReleaseTarget};
use crate::placement::{OctreeId, PlacementId, PlacementSource, ScenePlacement};
use crate::resource::SplatResource;
use crate::sort::{DrawOrder, SortBackend, sort_bit_width};
use crate::splat_info::SplatInfo;
use crate::types::{CameraState, MotionTrigger};
use crate::world_state::{PendingRelease, WorldState};

/// Summary of one [`Manager::update`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameReport {
    /// Everything requested is loaded and the newest world state is drawn.
    pub ready: bool,
    /// Version of the world state currently in the work buffer.
    pub drawn_version: Option<u64>,
    /// Version of the newest world state.
    pub latest_version: Option<u64>,
    /// Resources requested by instances that have not arrived yet.
    pub pending_loads: usize,
}

#[derive(Debug)]
struct InstanceEntry {
    octree: OctreeId,
    instance: OctreeInstance,
    world_transform: Mat4,
}

#[derive(Debug)]
struct StandaloneEntry {
    resource: Arc<SplatResource>,
    world_transform: Mat4,
}

/// Drives streaming, world state construction and sorting, one frame at a time.
pub struct Manager {
    config: StreamConfig,
    graphics: GraphicsContext,
    loader: Arc<dyn AssetLoader>,
    texture_width: u32,

    octrees: BTreeMap<OctreeId, Octree>,
    next_octree_id: u32,
    instances: BTreeMap<PlacementId, InstanceEntry>,
    standalone: BTreeMap<PlacementId, StandaloneEntry>,
    /// Releases of destroyed instances, waiting for the next world state.
    released: Vec<PendingRelease>,

    world_states: BTreeMap<u64, WorldState>,
    last_version: u64,
    /// Newest version a sort result was accepted for.
    sorted_version: Option<u64>,
    drawn_version: Option<u64>,
    dirty: bool,
    sort_needed: bool,
    sort_jobs_in_flight: usize,

    lod_trigger: MotionTrigger,
    sort_trigger: MotionTrigger,
    /// Camera of the previous frame, for color accumulation.
    color_camera: Option<CameraState>,
}

impl Manager {
    /// Create a manager drawing into `graphics` and loading through `loader`.
    ///
    /// The work buffer's line width is authoritative; a different
    /// `config.texture_width` is logged and ignored.
    pub fn new(
        config: StreamConfig,
        graphics: GraphicsContext,
        loader: Arc<dyn AssetLoader>,
    ) -> Result<Self> {
        config.validate()?;
        let texture_width = graphics.work_buffer.texture_width();
        if texture_width == 0 {
            return Err(Error::InvalidConfig {
                option: "textureWidth",
                detail: "work buffer reports a zero line width".to_string(),
            });
        }
        if texture_width != config.texture_width {
            tracing::warn!(
                configured = config.texture_width,
                buffer = texture_width,
                "using the work buffer's texture width"
            );
        }

        Ok(Self {
            config,
            graphics,
            loader,
            texture_width,
            octrees: BTreeMap::new(),
            next_octree_id: 0,
            instances: BTreeMap::new(),
            standalone: BTreeMap::new(),
            released: Vec::new(),
            world_states: BTreeMap::new(),
            last_version: 0,
            sorted_version: None,
            drawn_version: None,
            dirty: true,
            sort_needed: false,
            sort_jobs_in_flight: 0,
            lod_trigger: MotionTrigger::default(),
            sort_trigger: MotionTrigger::default(),
            color_camera: None,
        })
    }

    #[must_use]
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Add an octree to the arena.
    pub fn register_octree(&mut self, asset: OctreeAsset) -> OctreeId {
        let id = OctreeId(self.next_octree_id);
        self.next_octree_id += 1;
        tracing::debug!(url = %asset.url, id = id.0, "octree registered");
        self.octrees.insert(id, Octree::new(asset));
        id
    }

    /// Destroy an octree and every instance of it.
    ///
    /// Loads stop immediately. The octree leaves the arena once the releases
    /// of its instances have been applied.
    pub fn remove_octree(&mut self, id: OctreeId) {
        let placements: Vec<PlacementId> = self
            .instances
            .iter()
            .filter(|(_, entry)| entry.octree == id)
            .map(|(placement, _)| *placement)
            .collect();
        for placement in placements {
            self.destroy_instance(placement);
        }
        if let Some(octree) = self.octrees.get_mut(&id) {
            octree.destroy(self.loader.as_ref());
        }
        self.prune_octrees();
    }

    /// A registered octree, until it is removed and fully released.
    #[must_use]
    pub fn octree(&self, id: OctreeId) -> Option<&Octree> {
        self.octrees.get(&id)
    }

    /// The instance backing an octree placement.
    #[must_use]
    pub fn instance(&self, placement: PlacementId) -> Option<&OctreeInstance> {
        self.instances.get(&placement).map(|entry| &entry.instance)
    }

    /// Bring the manager in line with the scene's placements.
    ///
    /// Octree placements get an instance on first sight; instances whose
    /// placement disappeared are destroyed. The standalone set is compared by
    /// placement and resource. Transforms are refreshed on every call.
    pub fn reconcile(&mut self, placements: &[ScenePlacement]) {
        let mut seen = BTreeSet::new();
        let mut standalone = BTreeMap::new();

        for placement in placements {
            match &placement.source {
                PlacementSource::Standalone(resource) => {
                    standalone.insert(
                        placement.id,
                        StandaloneEntry {
                            resource: Arc::clone(resource),
                            world_transform: placement.world_transform,
                        },
                    );
                }
                PlacementSource::Octree(octree_id) => {
                    if self
                        .instances
                        .get(&placement.id)
                        .is_some_and(|entry| entry.octree != *octree_id)
                    {
                        self.destroy_instance(placement.id);
                    }
                    if self.reconcile_instance(placement.id, *octree_id, placement.world_transform) {
                        seen.insert(placement.id);
                    }
                }
            }
        }

        let gone: Vec<PlacementId> = self
            .instances
            .keys()
            .filter(|id| !seen.contains(*id))
            .copied()
            .collect();
        for id in gone {
            self.destroy_instance(id);
        }

        let same_standalone = standalone.len() == self.standalone.len()
            && standalone
                .iter()
                .zip(&self.standalone)
                .all(|((a, x), (b, y))| a == b && x.resource.id() == y.resource.id());
        if !same_standalone {
            self.dirty = true;
        }
        self.standalone = standalone;
    }

    /// Create or refresh the instance of `placement`. Returns false when the
    /// octree is unknown or destroyed.
    fn reconcile_instance(
        &mut self,
        placement: PlacementId,
        octree_id: OctreeId,
        world_transform: Mat4,
    ) -> bool {
        if let Some(entry) = self.instances.get_mut(&placement) {
            if entry.world_transform != world_transform {
                entry.world_transform = world_transform;
                self.lod_trigger.invalidate();
            }
            return true;
        }

        let Some(octree) = self
            .octrees
            .get_mut(&octree_id)
            .filter(|octree| !octree.is_destroyed())
        else {
            tracing::warn!(placement = placement.0, octree = octree_id.0, "unknown octree");
            return false;
        };

        let instance = OctreeInstance::new(octree, self.loader.as_ref());
        tracing::debug!(placement = placement.0, url = %octree.url(), "octree instance created");
        self.instances.insert(
            placement,
            InstanceEntry {
                octree: octree_id,
                instance,
                world_transform,
            },
        );
        self.lod_trigger.invalidate();
        true
    }

    fn destroy_instance(&mut self, placement: PlacementId) {
        let Some(mut entry) = self.instances.remove(&placement) else {
            return;
        };
        let octree = entry.octree;
        self.released.extend(
            entry
                .instance
                .destroy()
                .into_iter()
                .map(|target| PendingRelease { octree, target }),
        );
        tracing::debug!(placement = placement.0, "octree instance destroyed");
        self.dirty = true;
    }

    /// Build a new world state if membership changed, or if none exists yet.
    ///
    /// Releases queued by instances are moved onto the new state. Returns
    /// true when a state was built.
    pub fn update_world_state(&mut self) -> bool {
        let has_releases = !self.released.is_empty()
            || self.instances.values().any(|entry| entry.instance.has_releases());
        if !self.dirty && !has_releases && !self.world_states.is_empty() {
            return false;
        }

        let mut splats = Vec::new();
        for (id, entry) in &self.standalone {
            splats.push(SplatInfo::new(
                Arc::clone(&entry.resource),
                *id,
                entry.world_transform,
                0,
                None,
            ));
        }

        let mut releases = std::mem::take(&mut self.released);
        for (id, entry) in &mut self.instances {
            for placement in entry.instance.active_placements() {
                let Some(resource) = &placement.resource else {
                    continue;
                };
                splats.push(SplatInfo::new(
                    Arc::clone(resource),
                    *id,
                    entry.world_transform,
                    placement.lod_level,
                    Some(&placement.intervals),
                ));
            }
            if let Some(environment) = entry.instance.environment() {
                splats.push(SplatInfo::new(
                    Arc::clone(environment),
                    *id,
                    entry.world_transform,
                    0,
                    None,
                ));
            }
            let octree = entry.octree;
            releases.extend(
                entry
                    .instance
                    .take_releases()
                    .into_iter()
                    .map(|target| PendingRelease { octree, target }),
            );
        }
        splats.retain(|splat| splat.active_splats > 0);

        if let Some(previous) = self.world_states.values().next_back() {
            for splat in &mut splats {
                if let Some(old) = previous.splats().iter().find(|old| old.same_source(splat)) {
                    splat.carry_over(old);
                }
            }
        }

        self.last_version += 1;
        let version = self.last_version;
        let state = WorldState::new(version, splats, releases, self.texture_width);
        tracing::debug!(
            version,
            splats = state.splats().len(),
            lines = state.total_lines(),
            releases = state.pending_releases().len(),
            "world state built"
        );
        self.world_states.insert(version, state);
        self.dirty = false;
        self.sort_needed = true;
        true
    }

    /// Accept a finished sort.
    ///
    /// Results older than the newest accepted one are ignored. Every state
    /// older than `version` is retired; states that were never sorted apply
    /// their pending releases on the way out. The first sort of a version
    /// uploads it to the work buffer. Returns whether the result was used.
    pub fn on_sorted(&mut self, count: u32, version: u64, order: DrawOrder) -> bool {
        if self.sorted_version.is_some_and(|sorted| version < sorted) {
            tracing::trace!(version, "stale sort result ignored");
            return false;
        }
        if !self.world_states.contains_key(&version) {
            tracing::trace!(version, "sort result for a retired world state ignored");
            return false;
        }

        let current = self.world_states.split_off(&version);
        let retired = std::mem::replace(&mut self.world_states, current);
        for (retired_version, mut state) in retired {
            if !state.sorted_before {
                let releases = state.take_pending_releases();
                self.apply_releases(releases);
            }
            tracing::trace!(version = retired_version, "world state retired");
        }

        if !self
            .world_states
            .get(&version)
            .is_some_and(|state| state.sorted_before)
        {
            self.activate(version);
        }

        self.graphics.work_buffer.set_order(&order, count);
        self.sorted_version = Some(version);
        self.drawn_version = Some(version);
        true
    }

    /// Upload the state `version` to the work buffer and apply its releases.
    fn activate(&mut self, version: u64) {
        let Some(state) = self.world_states.get_mut(&version) else {
            return;
        };
        let buffer = &mut self.graphics.work_buffer;
        buffer.resize(state.total_lines());
        buffer.render(state.splats());
        for splat in state.splats_mut() {
            splat.update();
            splat.reset_color();
        }
        let all: Vec<&SplatInfo> = state.splats().iter().collect();
        buffer.update_transforms(&all);
        state.sorted_before = true;

        let releases = state.take_pending_releases();
        tracing::debug!(version, releases = releases.len(), "world state activated");
        self.apply_releases(releases);
    }

    fn apply_releases(&mut self, releases: Vec<PendingRelease>) {
        for release in releases {
            let Some(octree) = self.octrees.get_mut(&release.octree) else {
                tracing::debug!(octree = release.octree.0, "release for a pruned octree");
                continue;
            };
            match release.target {
                ReleaseTarget::File(file) => {
                    octree.dec_ref_count(file, self.config.cooldown_ticks, self.loader.as_ref());
                }
                ReleaseTarget::Environment => octree.dec_environment_ref(self.loader.as_ref()),
            }
        }
    }

    /// Run one frame for `camera`.
    pub fn update(&mut self, camera: &CameraState) -> FrameReport {
        self.poll_sort_results();

        let loader = Arc::clone(&self.loader);
        let mut changed = false;
        for entry in self.instances.values_mut() {
            if let Some(octree) = self.octrees.get_mut(&entry.octree) {
                changed |= entry.instance.update(octree, loader.as_ref());
            }
        }

        let config = &self.config;
        if self
            .lod_trigger
            .crossed(camera, config.lod_update_distance, config.lod_update_angle)
        {
            for entry in self.instances.values_mut() {
                if let Some(octree) = self.octrees.get_mut(&entry.octree) {
                    changed |= entry.instance.update_lod(
                        octree,
                        camera,
                        &entry.world_transform,
                        &config.lod_distances,
                        loader.as_ref(),
                    );
                }
            }
            self.lod_trigger.reset(camera);
        }
        if changed {
            self.dirty = true;
        }

        self.update_world_state();
        self.sync_transforms();
        self.update_colors(camera);
        self.dispatch_sort(camera);

        for octree in self.octrees.values_mut() {
            octree.update_cooldown_tick(loader.as_ref());
        }
        self.prune_octrees();

        self.report()
    }

    fn poll_sort_results(&mut self) {
        let SortBackend::Cpu(worker) = &mut self.graphics.sorter else {
            return;
        };
        let mut results = Vec::new();
        while let Some(result) = worker.try_recv() {
            results.push(result);
        }
        for result in results {
            self.sort_jobs_in_flight = self.sort_jobs_in_flight.saturating_sub(1);
            self.on_sorted(result.count, result.version, result.order);
        }
    }

    /// Push current placement transforms into every live state and upload
    /// the ones of the drawn state that changed.
    fn sync_transforms(&mut self) {
        let transforms: HashMap<PlacementId, Mat4> = self
            .standalone
            .iter()
            .map(|(id, entry)| (*id, entry.world_transform))
            .chain(
                self.instances
                    .iter()
                    .map(|(id, entry)| (*id, entry.world_transform)),
            )
            .collect();
        for state in self.world_states.values_mut() {
            for splat in state.splats_mut() {
                if let Some(transform) = transforms.get(&splat.placement) {
                    splat.set_transform(*transform);
                }
            }
        }

        let Some(state) = self
            .drawn_version
            .and_then(|version| self.world_states.get_mut(&version))
        else {
            return;
        };
        let moved: Vec<usize> = state
            .splats_mut()
            .iter_mut()
            .enumerate()
            .filter_map(|(i, splat)| splat.update().then_some(i))
            .collect();
        if moved.is_empty() {
            return;
        }
        let splats = state.splats();
        let moved: Vec<&SplatInfo> = moved.iter().map(|&i| &splats[i]).collect();
        self.graphics.work_buffer.update_transforms(&moved);
        self.sort_needed = true;
    }

    /// Accumulate camera motion on the drawn splats and refresh the colors
    /// of those past their LOD-scaled thresholds in one batch.
    fn update_colors(&mut self, camera: &CameraState) {
        let Some(last) = self.color_camera.replace(*camera) else {
            return;
        };
        let translation = camera.position.distance(last.position);
        let rotation = camera.angle_to(&last);

        let Some(state) = self
            .drawn_version
            .and_then(|version| self.world_states.get_mut(&version))
        else {
            return;
        };
        let mut due = Vec::new();
        for (i, splat) in state.splats_mut().iter_mut().enumerate() {
            splat.accumulate_motion(translation, rotation);
            let (distance, angle) = self.config.color_thresholds(splat.lod_index);
            if splat.color_due(distance, angle) {
                splat.reset_color();
                due.push(i);
            }
        }
        if due.is_empty() {
            return;
        }
        let splats = state.splats();
        let due: Vec<&SplatInfo> = due.iter().map(|&i| &splats[i]).collect();
        tracing::trace!(count = due.len(), "color refresh");
        self.graphics.work_buffer.render_color(&due);
    }

    fn dispatch_sort(&mut self, camera: &CameraState) {
        let Some(version) = self.latest_version() else {
            return;
        };
        let radial = self.config.radial_sorting;
        // Directional order is translation invariant, radial order rotation invariant.
        let camera_moved = if radial {
            self.sort_trigger
                .moved(camera, self.config.sort_update_distance)
        } else {
            self.sort_trigger.turned(camera, self.config.sort_update_angle)
        };
        if !self.sort_needed && !camera_moved {
            return;
        }

        if self.graphics.sorter.is_gpu() {
            self.sort_gpu(version, camera, radial);
        } else if !self.submit_cpu_sort(version, camera, radial) {
            return;
        }
        self.sort_needed = false;
        self.sort_trigger.reset(camera);
    }

    /// Queue a CPU sort of `version`. Returns false when throttled.
    fn submit_cpu_sort(&mut self, version: u64, camera: &CameraState, radial: bool) -> bool {
        if self.sort_jobs_in_flight >= self.config.max_sort_jobs_in_flight {
            tracing::trace!(in_flight = self.sort_jobs_in_flight, "sort throttled");
            return false;
        }
        let SortBackend::Cpu(worker) = &mut self.graphics.sorter else {
            return false;
        };
        let Some(state) = self.world_states.get_mut(&version) else {
            return false;
        };
        if !state.sort_parameters_set {
            worker.set_sort_parameters(state.sort_parameters());
            state.sort_parameters_set = true;
        }
        worker.sort(state.sort_request(camera, radial));
        self.sort_jobs_in_flight += 1;
        true
    }

    /// Sort `version` on the GPU and accept the result immediately.
    fn sort_gpu(&mut self, version: u64, camera: &CameraState, radial: bool) {
        // Keys are generated from the buffer contents, so upload first.
        if !self
            .world_states
            .get(&version)
            .is_some_and(|state| state.sorted_before)
        {
            self.activate(version);
        }
        let Some(state) = self.world_states.get(&version) else {
            return;
        };
        let count = state.total_used_pixels();
        let (min_distance, max_distance) = state.distance_range(camera, radial);
        let bit_width = sort_bit_width(count);

        let GraphicsContext {
            work_buffer,
            sorter,
        } = &mut self.graphics;
        let SortBackend::Gpu(sorter) = sorter else {
            return;
        };
        let buffer: &dyn WorkBuffer = &**work_buffer;
        let keys = sorter.generate(
            buffer,
            camera,
            radial,
            count,
            bit_width,
            min_distance,
            max_distance,
        );
        let indices = sorter.sort(keys, count, bit_width);
        self.on_sorted(count, version, DrawOrder::Gpu(indices));
    }

    /// Drop destroyed octrees that no queued release refers to any more.
    fn prune_octrees(&mut self) {
        let referenced: BTreeSet<OctreeId> = self
            .released
            .iter()
            .chain(
                self.world_states
                    .values()
                    .flat_map(|state| state.pending_releases()),
            )
            .map(|release| release.octree)
            .collect();
        self.octrees.retain(|id, octree| {
            let keep = !octree.is_destroyed() || referenced.contains(id);
            if !keep {
                tracing::debug!(url = %octree.url(), "octree pruned");
            }
            keep
        });
    }

    /// Treat the GPU as reset: evict every file in cooldown right away and
    /// upload the drawn state again on its next sort.
    pub fn device_lost(&mut self) {
        tracing::info!("device lost, flushing cooldowns");
        for octree in self.octrees.values_mut() {
            octree.flush_cooldowns(self.loader.as_ref());
        }
        if let Some(state) = self
            .drawn_version
            .and_then(|version| self.world_states.get_mut(&version))
        {
            state.sorted_before = false;
        }
        self.sort_needed = true;
    }

    /// Check that every octree reference count equals the references held
    /// by instances plus the releases not applied yet. Logs each mismatch.
    #[must_use]
    pub fn verify_ref_counts(&self) -> bool {
        let queued: Vec<&PendingRelease> = self
            .released
            .iter()
            .chain(
                self.world_states
                    .values()
                    .flat_map(|state| state.pending_releases()),
            )
            .collect();

        let mut ok = true;
        for (id, octree) in &self.octrees {
            let instances: Vec<&OctreeInstance> = self
                .instances
                .values()
                .filter(|entry| entry.octree == *id)
                .map(|entry| &entry.instance)
                .collect();
            let queued_for = |target: ReleaseTarget| {
                queued
                    .iter()
                    .filter(|r| r.octree == *id && r.target == target)
                    .count()
                    + instances
                        .iter()
                        .map(|i| i.queued_release_count(target))
                        .sum::<usize>()
            };

            for file in 0..octree.files().len() {
                let local: usize = instances
                    .iter()
                    .map(|i| i.local_file_ref_count(file) as usize)
                    .sum();
                let expected = local + queued_for(ReleaseTarget::File(file));
                let actual = octree.file_ref_count(file);
                if usize::try_from(actual).ok() != Some(expected) {
                    tracing::error!(url = %octree.files()[file].url, actual, expected, "file ref count mismatch");
                    ok = false;
                }
            }

            let holders = instances.iter().filter(|i| i.holds_environment()).count();
            let expected = holders + queued_for(ReleaseTarget::Environment);
            let actual = octree.environment_ref_count();
            if actual as usize != expected {
                tracing::error!(url = %octree.url(), actual, expected, "environment ref count mismatch");
                ok = false;
            }
        }
        ok
    }

    /// Version of the newest world state.
    #[must_use]
    pub fn latest_version(&self) -> Option<u64> {
        self.world_states.keys().next_back().copied()
    }

    /// Version of the world state in the work buffer.
    #[must_use]
    pub fn drawn_version(&self) -> Option<u64> {
        self.drawn_version
    }

    /// Number of live world states.
    #[must_use]
    pub fn world_state_count(&self) -> usize {
        self.world_states.len()
    }

    #[must_use]
    pub fn world_state(&self, version: u64) -> Option<&WorldState> {
        self.world_states.get(&version)
    }

    /// CPU sorts submitted and not yet returned.
    #[must_use]
    pub fn sort_jobs_in_flight(&self) -> usize {
        self.sort_jobs_in_flight
    }

    fn report(&self) -> FrameReport {
        let pending_loads = self
            .instances
            .values()
            .map(|entry| entry.instance.pending_count())
            .sum();
        let latest_version = self.latest_version();
        let ready = pending_loads == 0
            && !self.dirty
            && self.drawn_version.is_some()
            && self.drawn_version == latest_version;
        FrameReport {
            ready,
            drawn_version: self.drawn_version,
            latest_version,
            pending_loads,
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("octrees", &self.octrees.len())
            .field("instances", &self.instances.len())
            .field("standalone", &self.standalone.len())
            .field("latest_version", &self.latest_version())
            .field("drawn_version", &self.drawn_version)
            .field("graphics", &self.graphics)
            .finish_non_exhaustive()
    }
}
