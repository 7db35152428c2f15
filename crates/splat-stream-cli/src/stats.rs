//! A work buffer that only counts what it is asked to do.

use std::sync::{Arc, Mutex, PoisonError};

use splat_stream::{DrawOrder, SplatInfo, WorkBuffer};

/// Upload counters of a [`StatsBuffer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub lines: u32,
    pub renders: u32,
    pub rendered_splats: u64,
    pub color_refreshes: u32,
    pub transform_uploads: u32,
    pub orders: u32,
    pub last_order_count: u32,
}

/// Stand-in for a GPU work buffer in headless runs.
#[derive(Debug)]
pub struct StatsBuffer {
    width: u32,
    stats: Arc<Mutex<BufferStats>>,
}

impl StatsBuffer {
    pub fn new(width: u32) -> (Self, Arc<Mutex<BufferStats>>) {
        let stats = Arc::default();
        (
            Self {
                width,
                stats: Arc::clone(&stats),
            },
            stats,
        )
    }

    fn with(&self, f: impl FnOnce(&mut BufferStats)) {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut stats);
    }
}

impl WorkBuffer for StatsBuffer {
    fn texture_width(&self) -> u32 {
        self.width
    }

    fn resize(&mut self, lines: u32) {
        self.with(|s| s.lines = lines);
    }

    fn render(&mut self, splats: &[SplatInfo]) {
        let count: u64 = splats.iter().map(|s| u64::from(s.active_splats)).sum();
        self.with(|s| {
            s.renders += 1;
            s.rendered_splats += count;
        });
    }

    fn render_color(&mut self, splats: &[&SplatInfo]) {
        let count = splats.len() as u32;
        self.with(|s| s.color_refreshes += count);
    }

    fn update_transforms(&mut self, _splats: &[&SplatInfo]) {
        self.with(|s| s.transform_uploads += 1);
    }

    fn set_order(&mut self, _order: &DrawOrder, count: u32) {
        self.with(|s| {
            s.orders += 1;
            s.last_order_count = count;
        });
    }
}
