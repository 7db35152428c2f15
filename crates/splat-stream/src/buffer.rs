//! The renderer-facing side of the manager.

use crate::sort::{DrawOrder, SortBackend};
use crate::splat_info::SplatInfo;

/// The packed splat buffer the host renders from.
///
/// Splats are laid out in lines of [`WorkBuffer::texture_width`] slots; each
/// [`SplatInfo`] owns `line_count` whole lines starting at `line_start`.
pub trait WorkBuffer {
    /// Slots per line.
    fn texture_width(&self) -> u32;

    /// Make room for `lines` lines. Contents need not survive.
    fn resize(&mut self, lines: u32);

    /// Upload every splat of a world state into its lines.
    fn render(&mut self, splats: &[SplatInfo]);

    /// Refresh the view-dependent colors of `splats` only.
    fn render_color(&mut self, splats: &[&SplatInfo]);

    /// Upload the world transforms of `splats`.
    fn update_transforms(&mut self, splats: &[&SplatInfo]);

    /// Draw the first `count` slots of `order`.
    fn set_order(&mut self, order: &DrawOrder, count: u32);
}

/// Graphics collaborators handed to the manager at construction.
pub struct GraphicsContext {
    pub work_buffer: Box<dyn WorkBuffer>,
    pub sorter: SortBackend,
}

impl GraphicsContext {
    #[must_use]
    pub fn new(work_buffer: Box<dyn WorkBuffer>, sorter: SortBackend) -> Self {
        Self {
            work_buffer,
            sorter,
        }
    }
}

impl std::fmt::Debug for GraphicsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsContext")
            .field("texture_width", &self.work_buffer.texture_width())
            .field("sorter", &self.sorter)
            .finish()
    }
}
