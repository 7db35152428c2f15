//! CPU sorting on a worker thread.

use std::thread::JoinHandle;

use crate::sort::{DrawOrder, SortParameters, SortRequest, SortResult, sort_bit_width};

/// A CPU sorter fed one [`SortParameters`] per world state and any number of
/// [`SortRequest`]s for it. Results are polled, never awaited.
pub trait CpuSortWorker {
    /// Replace the splat set subsequent requests refer to.
    fn set_sort_parameters(&mut self, parameters: SortParameters);

    /// Queue a sort of the current splat set for a new camera.
    fn sort(&mut self, request: SortRequest);

    /// A finished sort, if one is ready.
    fn try_recv(&mut self) -> Option<SortResult>;
}

enum Job {
    Parameters(SortParameters),
    Sort(SortRequest),
}

/// The default [`CpuSortWorker`]: a dedicated thread running [`sort_splats`].
///
/// Jobs are processed in submission order. Dropping the worker closes the
/// job channel and joins the thread.
pub struct ThreadSortWorker {
    jobs: async_channel::Sender<Job>,
    results: async_channel::Receiver<SortResult>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadSortWorker {
    /// Spawn the worker thread.
    pub fn spawn() -> std::io::Result<Self> {
        let (jobs, job_rx) = async_channel::unbounded();
        let (result_tx, results) = async_channel::unbounded();
        let thread = std::thread::Builder::new()
            .name("splat-sort".to_string())
            .spawn(move || run_worker(&job_rx, &result_tx))?;

        Ok(Self {
            jobs,
            results,
            thread: Some(thread),
        })
    }

    fn submit(&self, job: Job) {
        if self.jobs.try_send(job).is_err() {
            tracing::error!("sort worker is gone");
        }
    }
}

impl CpuSortWorker for ThreadSortWorker {
    fn set_sort_parameters(&mut self, parameters: SortParameters) {
        self.submit(Job::Parameters(parameters));
    }

    fn sort(&mut self, request: SortRequest) {
        self.submit(Job::Sort(request));
    }

    fn try_recv(&mut self) -> Option<SortResult> {
        self.results.try_recv().ok()
    }
}

impl Drop for ThreadSortWorker {
    fn drop(&mut self) {
        self.jobs.close();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("sort worker panicked");
        }
    }
}

fn run_worker(jobs: &async_channel::Receiver<Job>, results: &async_channel::Sender<SortResult>) {
    let mut parameters: Option<SortParameters> = None;
    while let Ok(job) = jobs.recv_blocking() {
        match job {
            Job::Parameters(p) => parameters = Some(p),
            Job::Sort(request) => {
                let Some(p) = parameters.as_ref().filter(|p| p.version == request.version) else {
                    tracing::error!(version = request.version, "sort request without parameters");
                    continue;
                };
                if results.send_blocking(sort_splats(p, &request)).is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!("sort worker stopped");
}

/// Order every active splat of `parameters` back to front for `request`.
///
/// Distances are taken in each entry's local space and scaled back to world
/// units, then quantized to [`sort_bit_width`] bits and counting-sorted. The
/// order holds buffer slot indices: entry `i`'s `k`-th active splat lives at
/// `line_starts[i] * texture_width + k`.
#[must_use]
pub fn sort_splats(parameters: &SortParameters, request: &SortRequest) -> SortResult {
    if request.splats.len() != parameters.centers.len() {
        tracing::warn!(
            version = request.version,
            views = request.splats.len(),
            entries = parameters.centers.len(),
            "sort request does not match its parameters"
        );
    }

    let capacity = parameters.total_used_pixels as usize;
    let mut slots = Vec::with_capacity(capacity);
    let mut distances = Vec::with_capacity(capacity);

    let entries = parameters
        .centers
        .iter()
        .zip(&parameters.intervals)
        .zip(&parameters.line_starts)
        .zip(&request.splats);
    for (((centers, intervals), &line_start), view) in entries {
        let mut slot = line_start * parameters.texture_width;
        for &(start, end) in intervals {
            let end = (end as usize).min(centers.len());
            for center in centers.get(start as usize..end).unwrap_or_default() {
                let distance = if request.radial {
                    center.distance(view.camera_position)
                } else {
                    (*center - view.camera_position).dot(view.camera_direction)
                };
                distances.push(distance * view.scale);
                slots.push(slot);
                slot += 1;
            }
        }
    }

    let order = counting_sort_back_to_front(&slots, &distances);
    SortResult {
        count: order.len() as u32,
        version: request.version,
        order: DrawOrder::Indices(order.into()),
    }
}

fn counting_sort_back_to_front(slots: &[u32], distances: &[f32]) -> Vec<u32> {
    let (min, max) = distances
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &d| (lo.min(d), hi.max(d)));
    if slots.is_empty() {
        return Vec::new();
    }

    let buckets = 1usize << sort_bit_width(slots.len() as u32);
    let range = max - min;
    let scale = if range > 0.0 {
        (buckets - 1) as f32 / range
    } else {
        0.0
    };
    // Farthest splat gets key 0.
    let keys: Vec<usize> = distances
        .iter()
        .map(|&d| (((max - d) * scale) as usize).min(buckets - 1))
        .collect();

    let mut offsets = vec![0u32; buckets + 1];
    for &key in &keys {
        offsets[key + 1] += 1;
    }
    for i in 1..offsets.len() {
        offsets[i] += offsets[i - 1];
    }

    let mut order = vec![0u32; slots.len()];
    for (&key, &slot) in keys.iter().zip(slots) {
        order[offsets[key] as usize] = slot;
        offsets[key] += 1;
    }
    order
}
