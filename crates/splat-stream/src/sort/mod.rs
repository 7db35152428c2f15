//! Draw-order computation.
//!
//! A manager is built with one [`SortBackend`]:
//!
//! - [`SortBackend::Cpu`] hands a [`SortParameters`] payload to a worker once
//!   per world state, followed by cheap [`SortRequest`] camera updates. Results
//!   come back asynchronously and are polled every frame.
//! - [`SortBackend::Gpu`] generates keys from the work buffer and sorts them
//!   inline, so the result is available in the same frame.
//!
//! Either way the order is back-to-front and tagged with the world state
//! version it was computed for.

use std::sync::Arc;

use glam::Vec3;

use crate::resource::ResourceId;
use crate::types::Aabb;

pub mod cpu;
pub mod gpu;

pub use cpu::{CpuSortWorker, ThreadSortWorker, sort_splats};
pub use gpu::{GpuBufferHandle, GpuSorter};

/// Everything a CPU sorter needs about one world state. Sent once per version.
#[derive(Debug, Clone)]
pub struct SortParameters {
    pub version: u64,
    /// Splats per buffer line.
    pub texture_width: u32,
    /// Active splats across all entries; the length of a full order.
    pub total_used_pixels: u32,
    /// Resource of each entry.
    pub ids: Vec<ResourceId>,
    /// First buffer line of each entry.
    pub line_starts: Vec<u32>,
    /// Unused slots at the end of each entry's last line.
    pub padding: Vec<u32>,
    /// Active `[start, end)` ranges of each entry.
    pub intervals: Vec<Vec<(u32, u32)>>,
    /// Splat centers of each entry's resource, in resource-local space.
    pub centers: Vec<Arc<[Vec3]>>,
}

/// The camera as seen by one entry of a world state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplatSortView {
    /// Camera position in the entry's local space.
    pub camera_position: Vec3,
    /// View direction in the entry's local space.
    pub camera_direction: Vec3,
    /// Local bounds of the entry's active splats.
    pub aabb: Aabb,
    /// Largest axis scale of the entry's world transform.
    pub scale: f32,
}

/// A camera update for the world state `version`.
#[derive(Debug, Clone)]
pub struct SortRequest {
    pub version: u64,
    /// Sort by distance from the camera instead of along its view direction.
    pub radial: bool,
    /// One view per entry, in the order of [`SortParameters`].
    pub splats: Vec<SplatSortView>,
}

/// A computed draw order.
#[derive(Debug, Clone)]
pub enum DrawOrder {
    /// Buffer slot indices, back to front.
    Indices(Arc<[u32]>),
    /// A GPU buffer holding the sorted indices.
    Gpu(GpuBufferHandle),
}

/// A finished sort.
#[derive(Debug, Clone)]
pub struct SortResult {
    /// Number of splats in the order.
    pub count: u32,
    /// World state version the order was computed for.
    pub version: u64,
    pub order: DrawOrder,
}

/// The sorting strategy, fixed when the manager is built.
pub enum SortBackend {
    Cpu(Box<dyn CpuSortWorker>),
    Gpu(Box<dyn GpuSorter>),
}

impl SortBackend {
    #[must_use]
    pub fn is_gpu(&self) -> bool {
        matches!(self, SortBackend::Gpu(_))
    }
}

impl std::fmt::Debug for SortBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SortBackend::Cpu(_) => f.write_str("SortBackend::Cpu"),
            SortBackend::Gpu(_) => f.write_str("SortBackend::Gpu"),
        }
    }
}

/// Key width for sorting `count` splats: about four splats per bucket,
/// between 10 and 20 bits.
#[must_use]
pub fn sort_bit_width(count: u32) -> u32 {
    (count as f32 / 4.0).log2().round().clamp(10.0, 20.0) as u32
}
