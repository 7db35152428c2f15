//! Octree asset parsing.
//!
//! An octree asset is a JSON document describing a hierarchy whose leaves
//! reference ranges of splat files at several levels of detail:
//!
//! ```json
//! {
//!   "lodLevels": 2,
//!   "filenames": ["lod0/0.bin", "lod1/0.bin"],
//!   "environment": "env.bin",
//!   "tree": {
//!     "children": [
//!       {
//!         "bound": { "min": [0, 0, 0], "max": [1, 1, 1] },
//!         "lods": {
//!           "0": { "file": 0, "offset": 0, "count": 1000 },
//!           "1": { "file": 1, "offset": 0, "count": 250 }
//!         }
//!       }
//!     ]
//!   }
//! }
//! ```
//!
//! Leaves are flattened depth-first into the node array. Relative filenames
//! are resolved against the directory of the asset URL.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::fetch::Fetch;
use crate::octree::{LodDescriptor, OctreeNode};
use crate::types::Aabb;

/// A splat file referenced by an octree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OctreeFile {
    /// Resolved URL of the file.
    pub url: String,
    /// LOD level whose descriptors point at this file, if any do.
    pub lod_level: Option<usize>,
}

/// A parsed octree asset.
#[derive(Debug, Clone)]
pub struct OctreeAsset {
    /// URL the asset was loaded from.
    pub url: String,
    /// Number of LOD levels per node.
    pub lod_levels: usize,
    /// Files referenced by the nodes.
    pub files: Vec<OctreeFile>,
    /// Resolved URL of the optional environment splat file.
    pub environment: Option<String>,
    /// Leaf nodes in depth-first order.
    pub nodes: Vec<OctreeNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAsset {
    lod_levels: usize,
    filenames: Vec<String>,
    #[serde(default)]
    environment: Option<String>,
    tree: RawNode,
}

#[derive(Deserialize)]
struct RawNode {
    #[serde(default)]
    children: Vec<RawNode>,
    #[serde(default)]
    lods: Option<HashMap<String, RawLod>>,
    #[serde(default)]
    bound: Option<Aabb>,
}

#[derive(Deserialize)]
struct RawLod {
    file: usize,
    #[serde(default)]
    offset: u32,
    #[serde(default)]
    count: u32,
}

impl OctreeAsset {
    /// Parse the asset JSON loaded from `url`.
    pub fn parse(url: &str, json: &str) -> Result<Self> {
        let raw: RawAsset = serde_json::from_str(json).map_err(|e| Error::Json {
            context: "octree asset",
            source: e,
        })?;
        Self::from_raw(url, raw)
    }

    /// Fetch and parse the asset at `url`.
    pub async fn load(fetch: &dyn Fetch, url: &str) -> Result<Self> {
        let bytes = fetch.fetch(url).await?;
        let json = std::str::from_utf8(&bytes).map_err(|e| Error::InvalidAsset {
            url: url.to_string(),
            detail: format!("not utf-8: {e}"),
        })?;
        Self::parse(url, json)
    }

    fn from_raw(url: &str, raw: RawAsset) -> Result<Self> {
        if raw.lod_levels == 0 {
            return Err(Error::InvalidAsset {
                url: url.to_string(),
                detail: "lodLevels must be at least 1".to_string(),
            });
        }

        let mut files: Vec<OctreeFile> = raw
            .filenames
            .iter()
            .map(|name| OctreeFile {
                url: resolve_url(url, name),
                lod_level: None,
            })
            .collect();

        let mut nodes = Vec::new();
        let mut stack = vec![&raw.tree];
        while let Some(node) = stack.pop() {
            // Push children reversed so leaves come out in document order.
            stack.extend(node.children.iter().rev());

            let Some(lods) = &node.lods else {
                continue;
            };
            let Some(bound) = node.bound else {
                return Err(Error::InvalidAsset {
                    url: url.to_string(),
                    detail: format!("leaf {} has no bound", nodes.len()),
                });
            };

            let mut descriptors = vec![LodDescriptor::EMPTY; raw.lod_levels];
            for (key, lod) in lods {
                let Some(level) = key.parse::<usize>().ok().filter(|l| *l < raw.lod_levels)
                else {
                    tracing::warn!(url, key = %key, "ignoring lod entry with invalid level");
                    continue;
                };
                if lod.offset.checked_add(lod.count).is_none() {
                    tracing::warn!(
                        url,
                        offset = lod.offset,
                        count = lod.count,
                        "lod entry range overflows"
                    );
                    continue;
                }
                let Some(file) = files.get_mut(lod.file) else {
                    tracing::warn!(url, file = lod.file, "lod entry references unknown file");
                    continue;
                };
                file.lod_level.get_or_insert(level);
                descriptors[level] = LodDescriptor {
                    file: Some(lod.file),
                    offset: lod.offset,
                    count: lod.count,
                };
            }

            let missing = descriptors.iter().filter(|d| d.is_empty()).count();
            if missing > 0 {
                tracing::debug!(url, node = nodes.len(), missing, "leaf has missing lod levels");
            }
            nodes.push(OctreeNode::new(bound, descriptors));
        }

        Ok(Self {
            url: url.to_string(),
            lod_levels: raw.lod_levels,
            files,
            environment: raw.environment.map(|name| resolve_url(url, &name)),
            nodes,
        })
    }
}

/// Resolve `name` relative to the directory containing `base`.
///
/// Absolute URLs, `file://` URLs and rooted paths are returned unchanged.
#[must_use]
pub fn resolve_url(base: &str, name: &str) -> String {
    if name.contains("://") || name.starts_with('/') {
        return name.to_string();
    }
    match base.rfind('/') {
        Some(i) => format!("{}{}", &base[..=i], name),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;

    const ASSET: &str = r#"{
        "lodLevels": 2,
        "filenames": ["lod0.bin", "lod1.bin"],
        "environment": "env.bin",
        "tree": {
            "children": [
                {
                    "bound": { "min": [0, 0, 0], "max": [1, 1, 1] },
                    "lods": {
                        "0": { "file": 0, "offset": 0, "count": 100 },
                        "1": { "file": 1, "offset": 0, "count": 10 }
                    }
                },
                {
                    "children": [
                        {
                            "bound": { "min": [1, 0, 0], "max": [2, 1, 1] },
                            "lods": { "1": { "file": 1, "offset": 10, "count": 5 } }
                        }
                    ]
                }
            ]
        }
    }"#;

    #[test]
    fn test_parse_flattens_leaves() {
        let asset = OctreeAsset::parse("https://cdn.example.com/scene/octree.json", ASSET).unwrap();
        assert_eq!(asset.lod_levels, 2);
        assert_eq!(asset.nodes.len(), 2);
        assert_eq!(asset.files[0].url, "https://cdn.example.com/scene/lod0.bin");
        assert_eq!(asset.files[0].lod_level, Some(0));
        assert_eq!(asset.files[1].lod_level, Some(1));
        assert_eq!(
            asset.environment.as_deref(),
            Some("https://cdn.example.com/scene/env.bin")
        );

        let second = &asset.nodes[1];
        assert_eq!(second.bounds().min, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(second.lod(1).offset, 10);
    }

    #[test]
    fn test_missing_lod_degrades_to_empty() {
        let asset = OctreeAsset::parse("octree.json", ASSET).unwrap();
        let second = &asset.nodes[1];
        assert!(second.lod(0).is_empty());
        assert_eq!(second.lod(0).file, None);
    }

    #[test]
    fn test_unknown_file_degrades_to_empty() {
        let json = r#"{
            "lodLevels": 1,
            "filenames": [],
            "tree": { "bound": { "min": [0, 0, 0], "max": [1, 1, 1] },
                      "lods": { "0": { "file": 3, "offset": 0, "count": 1 } } }
        }"#;
        let asset = OctreeAsset::parse("octree.json", json).unwrap();
        assert_eq!(asset.nodes.len(), 1);
        assert!(asset.nodes[0].lod(0).is_empty());
    }

    #[test]
    fn test_overflowing_range_degrades_to_empty() {
        let json = r#"{
            "lodLevels": 2,
            "filenames": ["a.bin", "b.bin"],
            "tree": { "bound": { "min": [0, 0, 0], "max": [1, 1, 1] },
                      "lods": { "0": { "file": 0, "offset": 4294967295, "count": 2 },
                                "1": { "file": 1, "offset": 4, "count": 2 } } }
        }"#;
        let asset = OctreeAsset::parse("octree.json", json).unwrap();
        let node = &asset.nodes[0];
        assert!(node.lod(0).is_empty());
        assert_eq!(asset.files[0].lod_level, None);
        assert_eq!(node.lod(1).interval(), (4, 6));
    }

    #[test]
    fn test_leaf_without_bound_is_invalid() {
        let json = r#"{
            "lodLevels": 1,
            "filenames": ["a.bin"],
            "tree": { "lods": { "0": { "file": 0, "offset": 0, "count": 1 } } }
        }"#;
        assert!(matches!(
            OctreeAsset::parse("octree.json", json),
            Err(Error::InvalidAsset { .. })
        ));
    }

    #[test]
    fn test_resolve_url() {
        assert_eq!(resolve_url("a/b/octree.json", "c.bin"), "a/b/c.bin");
        assert_eq!(resolve_url("octree.json", "c.bin"), "c.bin");
        assert_eq!(resolve_url("a/octree.json", "/abs/c.bin"), "/abs/c.bin");
        assert_eq!(
            resolve_url("a/octree.json", "https://x.com/c.bin"),
            "https://x.com/c.bin"
        );
    }

    #[cfg(not(target_family = "wasm"))]
    #[tokio::test]
    async fn test_load_from_disk() {
        let path = std::env::temp_dir().join(format!("splat-stream-asset-{}.json", std::process::id()));
        std::fs::write(&path, ASSET).unwrap();
        let url = path.display().to_string();

        let asset = OctreeAsset::load(&crate::fetch::FsFetch, &url).await.unwrap();
        assert_eq!(asset.lod_levels, 2);
        assert!(asset.files[0].url.ends_with("lod0.bin"));
        std::fs::remove_file(path).unwrap();
    }
}
