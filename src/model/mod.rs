//! CPU-side model, material and skeleton data as handed over by the asset
//! parsing layer. Everything here is plain data; GPU mirrors live in
//! [`draw_object`].

pub mod draw_object;
pub mod race;

use std::sync::Arc;

use ash::vk;

use crate::shader::{MaterialKind, ShaderPackage};

/// Semantic of one declared vertex element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexUsage {
    Position,
    BlendWeight,
    BlendIndices,
    Normal,
    TexCoord,
    Binormal,
    Color,
}

/// Component type of one declared vertex element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexKind {
    F32x1,
    F32x2,
    F32x3,
    F32x4,
    U8x4,
    U8x4Norm,
    F16x2,
    F16x4,
}

impl VertexKind {
    pub fn vk_format(self) -> vk::Format {
        match self {
            VertexKind::F32x1 => vk::Format::R32_SFLOAT,
            VertexKind::F32x2 => vk::Format::R32G32_SFLOAT,
            VertexKind::F32x3 => vk::Format::R32G32B32_SFLOAT,
            VertexKind::F32x4 => vk::Format::R32G32B32A32_SFLOAT,
            VertexKind::U8x4 => vk::Format::R8G8B8A8_UINT,
            VertexKind::U8x4Norm => vk::Format::R8G8B8A8_UNORM,
            VertexKind::F16x2 => vk::Format::R16G16_SFLOAT,
            VertexKind::F16x4 => vk::Format::R16G16B16A16_SFLOAT,
        }
    }

    pub fn byte_size(self) -> u32 {
        match self {
            VertexKind::F32x1 => 4,
            VertexKind::F32x2 => 8,
            VertexKind::F32x3 => 12,
            VertexKind::F32x4 => 16,
            VertexKind::U8x4 | VertexKind::U8x4Norm => 4,
            VertexKind::F16x2 => 4,
            VertexKind::F16x4 => 8,
        }
    }
}

/// One declared per-vertex element: which stream it lives in, at what byte
/// offset, its component type and its semantic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexElement {
    pub stream: u8,
    pub offset: u16,
    pub kind: VertexKind,
    pub usage: VertexUsage,
    pub usage_index: u8,
}

/// One mesh part at one level of detail. Vertex data arrives already split
/// into streams; `stream_strides[i]` is the per-vertex stride of
/// `streams[i]`.
#[derive(Debug, Clone, Default)]
pub struct PartData {
    pub streams: Vec<Vec<u8>>,
    pub stream_strides: Vec<u32>,
    pub vertex_count: u32,
    pub indices: Vec<u16>,
    pub material_index: u16,
    pub elements: Vec<VertexElement>,
}

#[derive(Debug, Clone, Default)]
pub struct LodData {
    pub parts: Vec<PartData>,
}

/// A parsed model: LOD levels plus the material list the parts index into.
#[derive(Debug, Clone, Default)]
pub struct ModelData {
    pub name: String,
    pub lods: Vec<LodData>,
    pub materials: Vec<MaterialData>,
}

/// Semantic texture slot of a material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureSlot {
    Diffuse,
    Normal,
    Specular,
    Mask,
    Table,
    Index,
    TileDiffuse,
    TileNormal,
}

/// Decoded texture pixels, tightly packed RGBA8.
#[derive(Debug, Clone, Default)]
pub struct TexturePixels {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// A parsed material: its shader package (parsed by the asset layer, stage
/// bytecode blobs inside stay opaque), key/value pairs steering package
/// routing, texture pixels by slot, and an optional constant block.
///
/// `transparency_constants` is the variant block the composite pass binds
/// in place of `constants`; empty means the material has no variant and the
/// base block serves both.
#[derive(Debug, Clone, Default)]
pub struct MaterialData {
    pub name: String,
    pub kind: MaterialKind,
    pub shader_package: Option<Arc<ShaderPackage>>,
    pub material_keys: Vec<(u32, u32)>,
    pub textures: Vec<(TextureSlot, String, TexturePixels)>,
    pub constants: Vec<u8>,
    pub transparency_constants: Vec<u8>,
}

/// Parsed skeleton: bone names in the order the shaders index them.
#[derive(Debug, Clone, Default)]
pub struct SkeletonData {
    pub bone_names: Vec<String>,
}

/// Models may arrive with an empty material list; pass iteration indexes the
/// list unconditionally, so at least one entry must exist.
pub fn ensure_materials(materials: &mut Vec<MaterialData>) {
    if materials.is_empty() {
        log::debug!("model carries no materials, synthesizing a default entry");
        materials.push(MaterialData {
            name: "default".to_string(),
            ..MaterialData::default()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_material_list_gains_one_default_entry() {
        let mut materials = Vec::new();
        ensure_materials(&mut materials);
        assert_eq!(materials.len(), 1);
        // Idempotent; a populated list is untouched.
        ensure_materials(&mut materials);
        assert_eq!(materials.len(), 1);
    }

    #[test]
    fn vertex_kind_sizes_match_formats() {
        assert_eq!(VertexKind::F32x3.byte_size(), 12);
        assert_eq!(VertexKind::U8x4Norm.byte_size(), 4);
        assert_eq!(VertexKind::F16x4.vk_format(), vk::Format::R16G16B16A16_SFLOAT);
    }
}
