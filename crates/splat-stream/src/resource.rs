//! Decoded splat resources.
//!
//! The attribute layout of a splat file is owned by the work buffer; the
//! streaming core only needs the splat centers (for bounds and CPU sorting)
//! and a counter of the world states that currently reference the resource.

use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicU64, Ordering},
};

use glam::Vec3;

use crate::error::{Error, Result};
use crate::types::Aabb;

/// Bytes per packed center (three little-endian `f32`s).
const CENTER_STRIDE: usize = 12;

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a loaded resource, used by sorters to key
/// per-resource data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

/// A loaded splat file.
#[derive(Debug)]
pub struct SplatResource {
    id: ResourceId,
    url: String,
    centers: Arc<[Vec3]>,
    aabb: Aabb,
    world_refs: AtomicU32,
}

impl SplatResource {
    /// Create a resource from already decoded centers.
    #[must_use]
    pub fn new(url: impl Into<String>, centers: Vec<Vec3>) -> Self {
        let aabb = Aabb::from_points(&centers);
        Self {
            id: ResourceId(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)),
            url: url.into(),
            centers: centers.into(),
            aabb,
            world_refs: AtomicU32::new(0),
        }
    }

    /// Decode a packed stream of little-endian `f32` xyz centers.
    pub fn decode(url: &str, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % CENTER_STRIDE != 0 {
            return Err(Error::Decode {
                url: url.to_string(),
                detail: format!(
                    "payload of {} bytes is not a multiple of {CENTER_STRIDE}",
                    bytes.len()
                ),
            });
        }

        let centers = bytes
            .chunks_exact(CENTER_STRIDE)
            .map(|chunk| {
                let f = |i: usize| {
                    f32::from_le_bytes([chunk[i], chunk[i + 1], chunk[i + 2], chunk[i + 3]])
                };
                Vec3::new(f(0), f(4), f(8))
            })
            .collect();
        Ok(Self::new(url, centers))
    }

    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of splats in the file.
    #[must_use]
    pub fn num_splats(&self) -> u32 {
        self.centers.len() as u32
    }

    /// Splat centers in resource-local space.
    #[must_use]
    pub fn centers(&self) -> &Arc<[Vec3]> {
        &self.centers
    }

    /// Local-space bounds of all centers.
    #[must_use]
    pub fn aabb(&self) -> &Aabb {
        &self.aabb
    }

    /// Number of live world states referencing this resource.
    #[must_use]
    pub fn world_ref_count(&self) -> u32 {
        self.world_refs.load(Ordering::Acquire)
    }

    pub(crate) fn add_world_ref(&self) {
        self.world_refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_world_ref(&self) {
        let previous = self.world_refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "world ref underflow on {}", self.url);
        if previous == 0 {
            // Restore zero in release builds rather than wrapping.
            self.world_refs.store(0, Ordering::Release);
            tracing::error!(url = %self.url, "world reference released more often than taken");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(points: &[[f32; 3]]) -> Vec<u8> {
        points
            .iter()
            .flat_map(|p| p.iter().flat_map(|v| v.to_le_bytes()))
            .collect()
    }

    #[test]
    fn test_decode_centers() {
        let bytes = pack(&[[1.0, 2.0, 3.0], [-1.0, 0.5, 8.0]]);
        let resource = SplatResource::decode("a.bin", &bytes).unwrap();
        assert_eq!(resource.num_splats(), 2);
        assert_eq!(resource.centers()[1], Vec3::new(-1.0, 0.5, 8.0));
        assert_eq!(resource.aabb().min, Vec3::new(-1.0, 0.5, 3.0));
        assert_eq!(resource.aabb().max, Vec3::new(1.0, 2.0, 8.0));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let mut bytes = pack(&[[1.0, 2.0, 3.0]]);
        bytes.pop();
        assert!(matches!(
            SplatResource::decode("a.bin", &bytes),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = SplatResource::new("a", vec![]);
        let b = SplatResource::new("b", vec![]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_world_refs() {
        let resource = SplatResource::new("a", vec![Vec3::ZERO]);
        resource.add_world_ref();
        resource.add_world_ref();
        assert_eq!(resource.world_ref_count(), 2);
        resource.release_world_ref();
        resource.release_world_ref();
        assert_eq!(resource.world_ref_count(), 0);
    }
}
