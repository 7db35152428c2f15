//! Inline GPU sorting.

use crate::buffer::WorkBuffer;
use crate::types::CameraState;

/// Opaque handle to a GPU buffer owned by the host's renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuBufferHandle(pub u64);

/// Key generation and radix sort kernels on the host's GPU.
///
/// Both calls are recorded and executed in the same frame; the manager
/// treats the returned index buffer as the finished order.
pub trait GpuSorter {
    /// Compute one `bit_width`-bit key per splat of `buffer`, back to front,
    /// with distances normalized to `[min_distance, max_distance]`.
    #[allow(clippy::too_many_arguments)]
    fn generate(
        &mut self,
        buffer: &dyn WorkBuffer,
        camera: &CameraState,
        radial: bool,
        count: u32,
        bit_width: u32,
        min_distance: f32,
        max_distance: f32,
    ) -> GpuBufferHandle;

    /// Sort `count` keys, returning the buffer of sorted splat indices.
    fn sort(&mut self, keys: GpuBufferHandle, count: u32, bit_width: u32) -> GpuBufferHandle;
}
