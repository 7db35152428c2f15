//! Fixtures and fake collaborators shared by the unit tests.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use glam::Vec3;

use crate::asset::{OctreeAsset, OctreeFile};
use crate::buffer::{GraphicsContext, WorkBuffer};
use crate::config::StreamConfig;
use crate::loader::ManualLoader;
use crate::manager::Manager;
use crate::octree::{LodDescriptor, OctreeNode};
use crate::placement::PlacementId;
use crate::sort::{
    CpuSortWorker, DrawOrder, GpuBufferHandle, GpuSorter, SortBackend, SortParameters,
    SortRequest, SortResult, sort_splats,
};
use crate::splat_info::SplatInfo;
use crate::types::{Aabb, CameraState};

/// Two nodes, two LOD levels, one file per level and an environment.
///
/// Node 0 spans `[0, 1]^3`, node 1 sits 100 units along +X.
pub(crate) fn two_file_asset() -> OctreeAsset {
    let lod = |file, offset, count| LodDescriptor {
        file: Some(file),
        offset,
        count,
    };
    OctreeAsset {
        url: "scene/octree.json".to_string(),
        lod_levels: 2,
        files: vec![
            OctreeFile {
                url: "scene/lod0.bin".to_string(),
                lod_level: Some(0),
            },
            OctreeFile {
                url: "scene/lod1.bin".to_string(),
                lod_level: Some(1),
            },
        ],
        environment: Some("scene/env.bin".to_string()),
        nodes: vec![
            OctreeNode::new(
                Aabb::new(Vec3::ZERO, Vec3::ONE),
                vec![lod(0, 0, 100), lod(1, 0, 10)],
            ),
            OctreeNode::new(
                Aabb::new(Vec3::new(100.0, 0.0, 0.0), Vec3::new(101.0, 1.0, 1.0)),
                vec![lod(0, 100, 50), lod(1, 10, 5)],
            ),
        ],
    }
}

/// A camera on the X axis looking down +X.
pub(crate) fn camera_at(x: f32) -> CameraState {
    CameraState::new(Vec3::new(x, 0.5, 0.5), Vec3::X)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

/// Calls seen by a [`RecordingBuffer`].
#[derive(Debug, Default)]
pub(crate) struct BufferLog {
    pub resizes: Vec<u32>,
    /// Placements of every full render.
    pub renders: Vec<Vec<PlacementId>>,
    /// LOD index of each splat of every color-only render.
    pub color_renders: Vec<Vec<i32>>,
    /// Number of splats per transform upload.
    pub transform_updates: Vec<usize>,
    /// Count and GPU-ness of every order set.
    pub orders: Vec<(u32, bool)>,
}

/// A work buffer that records what it was asked to do.
pub(crate) struct RecordingBuffer {
    width: u32,
    log: Arc<Mutex<BufferLog>>,
}

impl RecordingBuffer {
    pub fn new(width: u32) -> (Self, Arc<Mutex<BufferLog>>) {
        let log = Arc::new(Mutex::new(BufferLog::default()));
        (
            Self {
                width,
                log: Arc::clone(&log),
            },
            log,
        )
    }
}

impl WorkBuffer for RecordingBuffer {
    fn texture_width(&self) -> u32 {
        self.width
    }

    fn resize(&mut self, lines: u32) {
        lock(&self.log).resizes.push(lines);
    }

    fn render(&mut self, splats: &[SplatInfo]) {
        lock(&self.log)
            .renders
            .push(splats.iter().map(|s| s.placement).collect());
    }

    fn render_color(&mut self, splats: &[&SplatInfo]) {
        lock(&self.log)
            .color_renders
            .push(splats.iter().map(|s| s.lod_index).collect());
    }

    fn update_transforms(&mut self, splats: &[&SplatInfo]) {
        lock(&self.log).transform_updates.push(splats.len());
    }

    fn set_order(&mut self, order: &DrawOrder, count: u32) {
        lock(&self.log)
            .orders
            .push((count, matches!(order, DrawOrder::Gpu(_))));
    }
}

#[derive(Default)]
struct SortQueue {
    parameters: Vec<SortParameters>,
    requests: Vec<SortRequest>,
    results: VecDeque<SortResult>,
}

/// Controls a [`ManualSortWorker`] from the test body.
#[derive(Clone, Default)]
pub(crate) struct SortControl(Arc<Mutex<SortQueue>>);

impl SortControl {
    /// Versions whose parameters reached the worker.
    pub fn parameter_versions(&self) -> Vec<u64> {
        lock(&self.0).parameters.iter().map(|p| p.version).collect()
    }

    /// Versions of the requests still waiting to be finished.
    pub fn request_versions(&self) -> Vec<u64> {
        lock(&self.0).requests.iter().map(|r| r.version).collect()
    }

    /// Finish the oldest waiting request for `version`. Returns false when
    /// there is none.
    pub fn finish(&self, version: u64) -> bool {
        let mut queue = lock(&self.0);
        let Some(index) = queue.requests.iter().position(|r| r.version == version) else {
            return false;
        };
        let request = queue.requests.remove(index);
        let Some(parameters) = queue.parameters.iter().find(|p| p.version == version) else {
            return false;
        };
        let result = sort_splats(parameters, &request);
        queue.results.push_back(result);
        true
    }

    /// Finish every waiting request in submission order.
    pub fn finish_all(&self) {
        while let Some(version) = self.request_versions().first().copied() {
            self.finish(version);
        }
    }
}

/// A CPU sorter that only sorts when the test says so.
pub(crate) struct ManualSortWorker(SortControl);

impl ManualSortWorker {
    pub fn new() -> (Self, SortControl) {
        let control = SortControl::default();
        (Self(control.clone()), control)
    }
}

impl CpuSortWorker for ManualSortWorker {
    fn set_sort_parameters(&mut self, parameters: SortParameters) {
        lock(&self.0.0).parameters.push(parameters);
    }

    fn sort(&mut self, request: SortRequest) {
        lock(&self.0.0).requests.push(request);
    }

    fn try_recv(&mut self) -> Option<SortResult> {
        lock(&self.0.0).results.pop_front()
    }
}

/// Arguments of one [`GpuSorter::generate`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct GenerateCall {
    pub count: u32,
    pub bit_width: u32,
    pub min_distance: f32,
    pub max_distance: f32,
}

/// A GPU sorter that hands out fresh buffer handles.
pub(crate) struct FakeGpuSorter {
    calls: Arc<Mutex<Vec<GenerateCall>>>,
    next_handle: u64,
}

impl FakeGpuSorter {
    pub fn new() -> (Self, Arc<Mutex<Vec<GenerateCall>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                calls: Arc::clone(&calls),
                next_handle: 0,
            },
            calls,
        )
    }
}

impl GpuSorter for FakeGpuSorter {
    fn generate(
        &mut self,
        _buffer: &dyn WorkBuffer,
        _camera: &CameraState,
        _radial: bool,
        count: u32,
        bit_width: u32,
        min_distance: f32,
        max_distance: f32,
    ) -> GpuBufferHandle {
        lock(&self.calls).push(GenerateCall {
            count,
            bit_width,
            min_distance,
            max_distance,
        });
        self.next_handle += 1;
        GpuBufferHandle(self.next_handle)
    }

    fn sort(&mut self, _keys: GpuBufferHandle, _count: u32, _bit_width: u32) -> GpuBufferHandle {
        self.next_handle += 1;
        GpuBufferHandle(self.next_handle)
    }
}

/// A manager on a manual CPU sorter and a recording buffer.
pub(crate) struct CpuHarness {
    pub manager: Manager,
    pub loader: Arc<ManualLoader>,
    pub buffer: Arc<Mutex<BufferLog>>,
    pub sorts: SortControl,
}

impl CpuHarness {
    pub fn new(config: StreamConfig) -> Self {
        let (buffer, buffer_log) = RecordingBuffer::new(config.texture_width);
        let (worker, sorts) = ManualSortWorker::new();
        let loader = Arc::new(ManualLoader::new());
        let graphics = GraphicsContext::new(Box::new(buffer), SortBackend::Cpu(Box::new(worker)));
        let manager = Manager::new(config, graphics, Arc::clone(&loader) as _).unwrap();
        Self {
            manager,
            loader,
            buffer: buffer_log,
            sorts,
        }
    }

    pub fn buffer(&self) -> MutexGuard<'_, BufferLog> {
        lock(&self.buffer)
    }
}
