//! Streaming and draw-order coordination for Gaussian splat scenes.
//!
//! This crate decides which splat data is resident, which of it is rendered
//! at which level of detail, and when a fresh back-to-front order is needed.
//! Rendering itself stays with the host, behind the [`WorkBuffer`] and sorter
//! traits.
//!
//! # Design principles
//!
//! - **Never blocks the frame**: loads and CPU sorts are polled, not awaited
//! - **Versioned snapshots**: every membership change produces a new
//!   immutable [`WorldState`]; sort results are matched to it by version
//! - **Deferred release**: file references dropped by a LOD change are only
//!   released once a state without them has been sorted
//!
//! # Example
//!
//! ```ignore
//! use splat_stream::{GraphicsContext, Manager, SortBackend, StreamConfig, ThreadSortWorker};
//!
//! let graphics = GraphicsContext::new(
//!     Box::new(my_buffer),
//!     SortBackend::Cpu(Box::new(ThreadSortWorker::spawn()?)),
//! );
//! let mut manager = Manager::new(StreamConfig::default(), graphics, loader)?;
//! let octree = manager.register_octree(OctreeAsset::parse(url, &json)?);
//!
//! // Every frame:
//! manager.reconcile(&[ScenePlacement::octree(PlacementId(1), octree, transform)]);
//! let report = manager.update(&camera);
//! ```

pub mod asset;
pub mod buffer;
pub mod config;
mod error;
pub mod fetch;
pub mod instance;
pub mod loader;
pub mod manager;
pub mod octree;
pub mod placement;
pub mod resource;
pub mod sort;
pub mod splat_info;
pub mod types;
pub mod world_state;

#[cfg(test)]
mod testing;

pub use asset::{OctreeAsset, OctreeFile};
pub use buffer::{GraphicsContext, WorkBuffer};
pub use config::StreamConfig;
pub use error::{Error, Result};
#[cfg(not(target_family = "wasm"))]
pub use fetch::FsFetch;
pub use fetch::{Fetch, HttpFetch};
pub use instance::OctreeInstance;
pub use loader::{AssetLoader, ManualLoader, StreamingLoader};
pub use manager::{FrameReport, Manager};
pub use octree::{LodDescriptor, Octree, OctreeNode, ReleaseTarget};
pub use placement::{OctreeId, PlacementId, PlacementSource, ScenePlacement};
pub use resource::{ResourceId, SplatResource};
pub use sort::{
    CpuSortWorker, DrawOrder, GpuBufferHandle, GpuSorter, SortBackend, SortParameters,
    SortRequest, SortResult, ThreadSortWorker,
};
pub use splat_info::SplatInfo;
pub use types::{Aabb, BoundingSphere, CameraState};
pub use world_state::{PendingRelease, WorldState};
