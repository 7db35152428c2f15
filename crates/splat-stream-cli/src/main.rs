//! Headless flythrough over a streamed splat octree.
//!
//! Drives the stream manager with a scripted camera and logs what it loads,
//! releases and sorts, without any rendering backend.

mod args;
mod stats;

use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use glam::{Mat4, Vec3};
use splat_stream::{
    AssetLoader, CameraState, Fetch, FrameReport, FsFetch, GraphicsContext, HttpFetch, Manager,
    OctreeAsset, PlacementId, ScenePlacement, SortBackend, StreamConfig, StreamingLoader,
    ThreadSortWorker, fetch::is_remote,
};
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::args::Args;
use crate::stats::StatsBuffer;

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> splat_stream::Result<StreamConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path).map_err(|source| splat_stream::Error::Io {
                path: path.display().to_string(),
                source,
            })?;
            StreamConfig::from_json(&json)?
        }
        None => StreamConfig::default(),
    };

    if let Some(ticks) = args.cooldown_ticks {
        config.cooldown_ticks = ticks;
    }
    if let Some(distances) = &args.lod_distances {
        config.lod_distances.clone_from(distances);
    }
    if let Some(jobs) = args.max_sort_jobs {
        config.max_sort_jobs_in_flight = jobs;
    }
    if args.radial {
        config.radial_sorting = true;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let fetch: Arc<dyn Fetch> = if is_remote(&args.asset) {
        Arc::new(HttpFetch::new())
    } else {
        Arc::new(FsFetch)
    };
    let asset = runtime.block_on(OctreeAsset::load(fetch.as_ref(), &args.asset))?;
    tracing::info!(
        url = %asset.url,
        nodes = asset.nodes.len(),
        files = asset.files.len(),
        lod_levels = asset.lod_levels,
        "Loaded octree asset"
    );

    let loader = Arc::new(StreamingLoader::new(fetch, runtime.handle().clone()));
    let (buffer, stats) = StatsBuffer::new(config.texture_width);
    let graphics = GraphicsContext::new(
        Box::new(buffer),
        SortBackend::Cpu(Box::new(ThreadSortWorker::spawn()?)),
    );
    let mut manager = Manager::new(config, graphics, Arc::clone(&loader) as _)?;
    let octree = manager.register_octree(asset);
    let placements = [ScenePlacement::octree(PlacementId(0), octree, Mat4::IDENTITY)];

    let forward = (args.to - args.from).normalize_or(Vec3::NEG_Z);
    let frames = args.frames.max(1);
    let report_every = args.report_every.max(1);

    let last = runtime.block_on(async {
        let mut interval = tokio::time::interval(Duration::from_millis(args.frame_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut report = FrameReport::default();
        for frame in 0..frames + args.settle_frames {
            interval.tick().await;

            let t = (frame as f32 / frames as f32).min(1.0);
            let camera = CameraState::new(args.from.lerp(args.to, t), forward);
            manager.reconcile(&placements);
            report = manager.update(&camera);

            if frame % report_every == 0 {
                tracing::info!(
                    frame,
                    position = ?camera.position,
                    ready = report.ready,
                    drawn = ?report.drawn_version,
                    latest = ?report.latest_version,
                    pending_loads = report.pending_loads,
                    fetches_in_flight = loader.pending_count(),
                    sorts_in_flight = manager.sort_jobs_in_flight(),
                    "Frame"
                );
            }
            if frame >= frames && report.ready {
                tracing::info!(frame, "Settled");
                break;
            }
        }
        report
    });

    if !last.ready {
        tracing::warn!(
            pending_loads = last.pending_loads,
            "Flythrough ended before the scene settled"
        );
    }
    let stats = *stats
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    tracing::info!(
        lines = stats.lines,
        renders = stats.renders,
        rendered_splats = stats.rendered_splats,
        color_refreshes = stats.color_refreshes,
        transform_uploads = stats.transform_uploads,
        orders = stats.orders,
        last_order_count = stats.last_order_count,
        "Buffer activity"
    );

    // Join the sort thread before the runtime shuts down.
    drop(manager);
    Ok(())
}
