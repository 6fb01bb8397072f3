//! Shader packages: precompiled vertex/pixel variants plus the key metadata
//! used to select among them.
//!
//! A package carries system/scene/material key tables, the shader blobs
//! (already translated to SPIR-V by the external bytecode translator), and
//! routing nodes keyed by selector. The selector is a pure, order-sensitive
//! combine of the four resolved key-value lists.

pub mod reflection;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::pipeline::PASS_COUNT;

/// Well-known key categories and values. The category ids mirror the values
/// the game data declares; material packages reference them by id, never by
/// name.
pub mod keys {
    /// Scene key choosing the vertex transform path.
    pub const CATEGORY_TRANSFORM_VIEW: u32 = 0x5230_9B20;
    pub const VALUE_TRANSFORM_RIGID: u32 = 0x3DF9_0D75;
    pub const VALUE_TRANSFORM_SKINNED: u32 = 0x8254_18F0;

    /// System key controlling how skin shaders decode the depth buffer.
    pub const CATEGORY_DECODE_DEPTH: u32 = 0x2C6C_023C;
    pub const VALUE_DECODE_DEPTH_RGBA: u32 = 0x61B5_90A2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaterialKind {
    #[default]
    Object,
    Skin,
}

/// One declared key: a category id and the value used when nothing in the
/// draw context overrides it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderKey {
    pub category: u32,
    pub default_value: u32,
}

/// Sentinel for "this node does not participate in that global pass".
pub const INVALID_PASS_SLOT: i16 = -1;

/// Vertex/pixel shader indices for one local pass of a node.
#[derive(Debug, Clone, Copy)]
pub struct NodePass {
    pub vertex_shader: usize,
    pub pixel_shader: usize,
}

/// A routing node: maps a selector to the shader pair used in each global
/// pass. `pass_indices[global_pass]` is an index into `passes`, or the
/// sentinel.
#[derive(Debug, Clone)]
pub struct Node {
    pub selector: u32,
    pub pass_indices: [i16; PASS_COUNT],
    pub passes: Vec<NodePass>,
}

/// A bundle of precompiled shader variants plus selection metadata.
#[derive(Debug, Clone, Default)]
pub struct ShaderPackage {
    pub vertex_shaders: Vec<Vec<u8>>,
    pub pixel_shaders: Vec<Vec<u8>>,
    pub system_keys: Vec<ShaderKey>,
    pub scene_keys: Vec<ShaderKey>,
    pub material_keys: Vec<ShaderKey>,
    /// Subview key values combined into every selector (e.g. main vs.
    /// shadow subview).
    pub subview_keys: Vec<u32>,
    pub nodes: Vec<Node>,
}

impl ShaderPackage {
    pub fn find_node(&self, selector: u32) -> Option<&Node> {
        self.nodes.iter().find(|n| n.selector == selector)
    }

    /// Resolve one of a node's pass entries to its shader pair. Returns
    /// `None` when the pass entry or either shader index points outside this
    /// package; routing tables come from the asset layer and are not
    /// trusted.
    pub fn node_pass_shaders(&self, node: &Node, local: i16) -> Option<(&[u8], &[u8])> {
        let node_pass = node.passes.get(usize::try_from(local).ok()?)?;
        let vertex = self.vertex_shaders.get(node_pass.vertex_shader)?;
        let pixel = self.pixel_shaders.get(node_pass.pixel_shader)?;
        Some((vertex.as_slice(), pixel.as_slice()))
    }
}

/// Combine the four resolved key-value lists into a single selector.
///
/// Deterministic and order-sensitive: the same lists in the same order
/// always fold to the same value, and each list's length is folded in so a
/// value cannot migrate between lists.
pub fn combine_selector(system: &[u32], scene: &[u32], material: &[u32], subview: &[u32]) -> u32 {
    let mut hasher = DefaultHasher::new();
    for list in [system, scene, material, subview] {
        list.len().hash(&mut hasher);
        for value in list {
            value.hash(&mut hasher);
        }
    }
    let folded = hasher.finish();
    (folded as u32) ^ ((folded >> 32) as u32)
}

/// Resolve the system key list. Skin materials override the depth-decode
/// key; everything else takes its declared default.
pub fn resolve_system_keys(package: &ShaderPackage, material_kind: MaterialKind) -> Vec<u32> {
    package
        .system_keys
        .iter()
        .map(|key| {
            if key.category == keys::CATEGORY_DECODE_DEPTH && material_kind == MaterialKind::Skin {
                keys::VALUE_DECODE_DEPTH_RGBA
            } else {
                key.default_value
            }
        })
        .collect()
}

/// Resolve the scene key list. The transform-view key becomes the skinned
/// variant when the draw object carries bone weights, the rigid variant
/// otherwise.
pub fn resolve_scene_keys(package: &ShaderPackage, skinned: bool) -> Vec<u32> {
    package
        .scene_keys
        .iter()
        .map(|key| {
            if key.category == keys::CATEGORY_TRANSFORM_VIEW {
                if skinned {
                    keys::VALUE_TRANSFORM_SKINNED
                } else {
                    keys::VALUE_TRANSFORM_RIGID
                }
            } else {
                key.default_value
            }
        })
        .collect()
}

/// Resolve the material key list against the material's own key/value
/// pairs; unmatched categories fall back to the declared default.
pub fn resolve_material_keys(package: &ShaderPackage, material_keys: &[(u32, u32)]) -> Vec<u32> {
    package
        .material_keys
        .iter()
        .map(|key| {
            material_keys
                .iter()
                .find(|(category, _)| *category == key.category)
                .map(|(_, value)| *value)
                .unwrap_or(key.default_value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_is_deterministic_and_order_sensitive() {
        let a = combine_selector(&[1, 2], &[3], &[4, 5], &[0]);
        let b = combine_selector(&[1, 2], &[3], &[4, 5], &[0]);
        assert_eq!(a, b);
        // A value moving between lists changes the selector.
        let c = combine_selector(&[1], &[2, 3], &[4, 5], &[0]);
        assert_ne!(a, c);
        // Reordering within a list changes the selector.
        let d = combine_selector(&[2, 1], &[3], &[4, 5], &[0]);
        assert_ne!(a, d);
    }

    #[test]
    fn changing_one_key_value_changes_only_via_that_list() {
        let base = combine_selector(&[1, 2], &[3], &[4], &[]);
        let changed = combine_selector(&[1, 9], &[3], &[4], &[]);
        assert_ne!(base, changed);
        // Identical inputs elsewhere still reproduce the original.
        assert_eq!(base, combine_selector(&[1, 2], &[3], &[4], &[]));
    }

    #[test]
    fn skin_material_overrides_depth_decode_key() {
        let package = ShaderPackage {
            system_keys: vec![
                ShaderKey {
                    category: keys::CATEGORY_DECODE_DEPTH,
                    default_value: 7,
                },
                ShaderKey {
                    category: 0xAAAA,
                    default_value: 11,
                },
            ],
            ..Default::default()
        };
        assert_eq!(
            resolve_system_keys(&package, MaterialKind::Object),
            vec![7, 11]
        );
        assert_eq!(
            resolve_system_keys(&package, MaterialKind::Skin),
            vec![keys::VALUE_DECODE_DEPTH_RGBA, 11]
        );
    }

    #[test]
    fn transform_view_key_tracks_skinning() {
        let package = ShaderPackage {
            scene_keys: vec![ShaderKey {
                category: keys::CATEGORY_TRANSFORM_VIEW,
                default_value: keys::VALUE_TRANSFORM_RIGID,
            }],
            ..Default::default()
        };
        assert_eq!(
            resolve_scene_keys(&package, false),
            vec![keys::VALUE_TRANSFORM_RIGID]
        );
        assert_eq!(
            resolve_scene_keys(&package, true),
            vec![keys::VALUE_TRANSFORM_SKINNED]
        );
    }

    #[test]
    fn material_keys_fall_back_to_defaults() {
        let package = ShaderPackage {
            material_keys: vec![
                ShaderKey {
                    category: 1,
                    default_value: 10,
                },
                ShaderKey {
                    category: 2,
                    default_value: 20,
                },
            ],
            ..Default::default()
        };
        assert_eq!(
            resolve_material_keys(&package, &[(2, 99)]),
            vec![10, 99]
        );
        assert_eq!(resolve_material_keys(&package, &[]), vec![10, 20]);
    }

    #[test]
    fn malformed_routing_indices_resolve_to_none() {
        let package = ShaderPackage {
            vertex_shaders: vec![vec![1]],
            pixel_shaders: vec![vec![2]],
            ..Default::default()
        };
        let mut node = Node {
            selector: 0,
            pass_indices: [INVALID_PASS_SLOT; PASS_COUNT],
            passes: vec![NodePass {
                vertex_shader: 0,
                pixel_shader: 0,
            }],
        };
        assert!(package.node_pass_shaders(&node, 0).is_some());
        // Pass entry beyond the node's own list.
        assert!(package.node_pass_shaders(&node, 1).is_none());
        assert!(package.node_pass_shaders(&node, -1).is_none());
        // Shader index beyond the package's blobs.
        node.passes[0].pixel_shader = 5;
        assert!(package.node_pass_shaders(&node, 0).is_none());
    }

    #[test]
    fn find_node_matches_selector() {
        let node = Node {
            selector: 42,
            pass_indices: [INVALID_PASS_SLOT; PASS_COUNT],
            passes: Vec::new(),
        };
        let package = ShaderPackage {
            nodes: vec![node],
            ..Default::default()
        };
        assert!(package.find_node(42).is_some());
        assert!(package.find_node(43).is_none());
    }
}
