//! SPIR-V reflection for translated game shaders.
//!
//! Given the vertex and pixel stage bytecode, this module discovers the
//! resource bindings (uniform buffers, sampled images, samplers) each stage
//! consumes, merges them across stages, and derives the vertex input layout
//! either from mesh element metadata or from the shader's own declared input
//! types.

use ash::vk;
use spirq::var::Variable;
use spirq::ReflectConfig;

use crate::device::spv_words;
use crate::error::{RenderError, RenderResult};
use crate::model::{VertexElement, VertexUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    Sampler,
    CombinedImageSampler,
}

impl BindingKind {
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            BindingKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            BindingKind::Sampler => vk::DescriptorType::SAMPLER,
            BindingKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }
}

/// One reflected resource binding of a shader stage (or the merged pair).
#[derive(Debug, Clone)]
pub struct ReflectedBinding {
    pub name: String,
    pub set: u32,
    pub binding: u32,
    pub kind: BindingKind,
    pub stages: vk::ShaderStageFlags,
    /// False when the binding is declared but never referenced by the entry
    /// point. Unused bindings still occupy their slot in the set layout.
    pub used: bool,
}

/// A vertex-stage input with the format the shader's own declaration
/// implies. Mesh metadata, when present, overrides this.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub name: String,
    pub location: u32,
    pub fallback_format: vk::Format,
}

#[derive(Debug, Clone, Default)]
pub struct StageReflection {
    pub bindings: Vec<ReflectedBinding>,
    pub inputs: Vec<StageInput>,
}

fn binding_kind(desc_ty: &spirq::ty::DescriptorType) -> Option<BindingKind> {
    use spirq::ty::DescriptorType;
    match desc_ty {
        DescriptorType::UniformBuffer() => Some(BindingKind::UniformBuffer),
        DescriptorType::StorageBuffer(..) => Some(BindingKind::StorageBuffer),
        DescriptorType::SampledImage() => Some(BindingKind::SampledImage),
        DescriptorType::Sampler() => Some(BindingKind::Sampler),
        DescriptorType::CombinedImageSampler() => Some(BindingKind::CombinedImageSampler),
        _ => None,
    }
}

fn format_for_type(ty: &spirq::ty::Type) -> vk::Format {
    use spirq::ty::{ScalarType, Type};
    let (scalar, count) = match ty {
        Type::Scalar(s) => (s.clone(), 1),
        Type::Vector(v) => (v.scalar_ty.clone(), v.nscalar),
        _ => return vk::Format::UNDEFINED,
    };
    match (scalar, count) {
        (ScalarType::Float { bits: 32 }, 1) => vk::Format::R32_SFLOAT,
        (ScalarType::Float { bits: 32 }, 2) => vk::Format::R32G32_SFLOAT,
        (ScalarType::Float { bits: 32 }, 3) => vk::Format::R32G32B32_SFLOAT,
        (ScalarType::Float { bits: 32 }, 4) => vk::Format::R32G32B32A32_SFLOAT,
        (ScalarType::Float { bits: 16 }, 2) => vk::Format::R16G16_SFLOAT,
        (ScalarType::Float { bits: 16 }, 4) => vk::Format::R16G16B16A16_SFLOAT,
        (ScalarType::Integer { is_signed: true, .. }, 1) => vk::Format::R32_SINT,
        (ScalarType::Integer { is_signed: true, .. }, 2) => vk::Format::R32G32_SINT,
        (ScalarType::Integer { is_signed: true, .. }, 4) => vk::Format::R32G32B32A32_SINT,
        (ScalarType::Integer { is_signed: false, .. }, 1) => vk::Format::R32_UINT,
        (ScalarType::Integer { is_signed: false, .. }, 2) => vk::Format::R32G32_UINT,
        (ScalarType::Integer { is_signed: false, .. }, 4) => vk::Format::R32G32B32A32_UINT,
        _ => vk::Format::UNDEFINED,
    }
}

/// Byte size of a vertex attribute format, for packed offset derivation.
pub fn format_size(format: vk::Format) -> u32 {
    match format {
        vk::Format::R32_SFLOAT | vk::Format::R32_SINT | vk::Format::R32_UINT => 4,
        vk::Format::R32G32_SFLOAT | vk::Format::R32G32_SINT | vk::Format::R32G32_UINT => 8,
        vk::Format::R32G32B32_SFLOAT => 12,
        vk::Format::R32G32B32A32_SFLOAT
        | vk::Format::R32G32B32A32_SINT
        | vk::Format::R32G32B32A32_UINT => 16,
        vk::Format::R16G16_SFLOAT => 4,
        vk::Format::R16G16B16A16_SFLOAT => 8,
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_UINT => 4,
        _ => 0,
    }
}

/// Reflect one stage, marking each binding as used or unused.
pub fn reflect_stage(
    bytecode: &[u8],
    stage: vk::ShaderStageFlags,
) -> RenderResult<StageReflection> {
    let words = spv_words(bytecode)?;

    // Two passes: one listing everything for set-layout compatibility, one
    // listing only referenced resources so unused bindings can be flagged.
    let all = ReflectConfig::new()
        .spv(words.as_slice())
        .ref_all_rscs(true)
        .reflect()
        .map_err(|e| RenderError::Reflection(format!("{e:?}")))?;
    let referenced = ReflectConfig::new()
        .spv(words.as_slice())
        .reflect()
        .map_err(|e| RenderError::Reflection(format!("{e:?}")))?;

    let mut used = std::collections::HashSet::new();
    for entry in &referenced {
        for var in &entry.vars {
            if let Variable::Descriptor { desc_bind, .. } = var {
                used.insert((desc_bind.set(), desc_bind.bind()));
            }
        }
    }

    let mut reflection = StageReflection::default();
    for entry in &all {
        for var in &entry.vars {
            match var {
                Variable::Descriptor {
                    name,
                    desc_bind,
                    desc_ty,
                    ..
                } => {
                    let Some(kind) = binding_kind(desc_ty) else {
                        log::warn!(
                            "unsupported descriptor type at set {} binding {}, skipped",
                            desc_bind.set(),
                            desc_bind.bind()
                        );
                        continue;
                    };
                    reflection.bindings.push(ReflectedBinding {
                        name: name.clone().unwrap_or_default(),
                        set: desc_bind.set(),
                        binding: desc_bind.bind(),
                        kind,
                        stages: stage,
                        used: used.contains(&(desc_bind.set(), desc_bind.bind())),
                    });
                }
                Variable::Input { name, location, ty }
                    if stage == vk::ShaderStageFlags::VERTEX =>
                {
                    reflection.inputs.push(StageInput {
                        name: name.clone().unwrap_or_default(),
                        location: location.loc(),
                        fallback_format: format_for_type(ty),
                    });
                }
                _ => {}
            }
        }
    }
    reflection.inputs.sort_by_key(|i| i.location);
    Ok(reflection)
}

/// Merge both stages' bindings. A binding referenced by both stages keeps
/// one slot with the stage flags OR-ed together.
pub fn merge_bindings(
    vertex: &[ReflectedBinding],
    pixel: &[ReflectedBinding],
) -> Vec<ReflectedBinding> {
    let mut merged: Vec<ReflectedBinding> = vertex.to_vec();
    for binding in pixel {
        if let Some(existing) = merged
            .iter_mut()
            .find(|b| b.set == binding.set && b.binding == binding.binding)
        {
            existing.stages |= binding.stages;
            existing.used |= binding.used;
            if existing.name.is_empty() {
                existing.name = binding.name.clone();
            }
        } else {
            merged.push(binding.clone());
        }
    }
    merged.sort_by_key(|b| (b.set, b.binding));
    merged
}

/// Group merged bindings by descriptor set index; the result is indexable by
/// set number (empty sets stay empty).
pub fn group_by_set(merged: &[ReflectedBinding]) -> Vec<Vec<ReflectedBinding>> {
    let set_count = merged.iter().map(|b| b.set + 1).max().unwrap_or(0) as usize;
    let mut sets = vec![Vec::new(); set_count];
    for binding in merged {
        sets[binding.set as usize].push(binding.clone());
    }
    sets
}

/// Map a shader input name (e.g. `in.var.TEXCOORD0`) onto a mesh semantic.
/// Longer semantics are checked first so BINORMAL does not match NORMAL and
/// BLENDINDICES does not match BLENDWEIGHT.
pub fn semantic_usage(name: &str) -> Option<(VertexUsage, u8)> {
    const TABLE: &[(&str, VertexUsage)] = &[
        ("BLENDINDICES", VertexUsage::BlendIndices),
        ("BLENDWEIGHT", VertexUsage::BlendWeight),
        ("BINORMAL", VertexUsage::Binormal),
        ("POSITION", VertexUsage::Position),
        ("TEXCOORD", VertexUsage::TexCoord),
        ("NORMAL", VertexUsage::Normal),
        ("COLOR", VertexUsage::Color),
    ];
    let upper = name.to_ascii_uppercase();
    for (semantic, usage) in TABLE {
        if let Some(pos) = upper.find(semantic) {
            let tail = &upper[pos + semantic.len()..];
            let index = tail
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .unwrap_or(0);
            return Some((*usage, index));
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// Derive the vertex input attributes for a pipeline.
///
/// With mesh metadata each shader input is matched by semantic name against
/// the mesh's declared elements; the format comes from the element type and
/// the binding from its stream. Without mesh metadata (full-screen/utility
/// passes) the shader's own declared types are used with packed offsets on
/// binding 0. A missing semantic is a warning, not an error: the attribute
/// stays UNDEFINED and will render incorrectly but not crash.
pub fn derive_vertex_inputs(
    inputs: &[StageInput],
    mesh: Option<&[VertexElement]>,
) -> Vec<VertexAttribute> {
    match mesh {
        Some(elements) => inputs
            .iter()
            .map(|input| {
                let matched = semantic_usage(&input.name).and_then(|(usage, index)| {
                    elements
                        .iter()
                        .find(|e| e.usage == usage && e.usage_index == index)
                });
                match matched {
                    Some(element) => VertexAttribute {
                        location: input.location,
                        binding: element.stream as u32,
                        format: element.kind.vk_format(),
                        offset: element.offset as u32,
                    },
                    None => {
                        log::warn!(
                            "no mesh element matches shader input '{}' (location {})",
                            input.name,
                            input.location
                        );
                        VertexAttribute {
                            location: input.location,
                            binding: 0,
                            format: vk::Format::UNDEFINED,
                            offset: 0,
                        }
                    }
                }
            })
            .collect(),
        None => {
            let mut offset = 0;
            inputs
                .iter()
                .map(|input| {
                    let attribute = VertexAttribute {
                        location: input.location,
                        binding: 0,
                        format: input.fallback_format,
                        offset,
                    };
                    offset += format_size(input.fallback_format);
                    attribute
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VertexKind;

    fn binding(set: u32, slot: u32, stages: vk::ShaderStageFlags) -> ReflectedBinding {
        ReflectedBinding {
            name: format!("b{set}_{slot}"),
            set,
            binding: slot,
            kind: BindingKind::UniformBuffer,
            stages,
            used: true,
        }
    }

    #[test]
    fn merge_ors_stage_flags_into_one_slot() {
        let vertex = [binding(0, 2, vk::ShaderStageFlags::VERTEX)];
        let pixel = [
            binding(0, 2, vk::ShaderStageFlags::FRAGMENT),
            binding(1, 0, vk::ShaderStageFlags::FRAGMENT),
        ];
        let merged = merge_bindings(&vertex, &pixel);
        assert_eq!(merged.len(), 2);
        assert_eq!(
            merged[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(merged[1].stages, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn group_by_set_indexes_by_set_number() {
        let merged = merge_bindings(
            &[binding(0, 0, vk::ShaderStageFlags::VERTEX)],
            &[binding(2, 1, vk::ShaderStageFlags::FRAGMENT)],
        );
        let sets = group_by_set(&merged);
        assert_eq!(sets.len(), 3);
        assert_eq!(sets[0].len(), 1);
        assert!(sets[1].is_empty());
        assert_eq!(sets[2].len(), 1);
    }

    #[test]
    fn semantic_matching_distinguishes_binormal_from_normal() {
        assert_eq!(
            semantic_usage("in.var.BINORMAL0"),
            Some((VertexUsage::Binormal, 0))
        );
        assert_eq!(semantic_usage("NORMAL"), Some((VertexUsage::Normal, 0)));
        assert_eq!(
            semantic_usage("TEXCOORD1"),
            Some((VertexUsage::TexCoord, 1))
        );
        assert_eq!(
            semantic_usage("in.var.BLENDINDICES"),
            Some((VertexUsage::BlendIndices, 0))
        );
        assert_eq!(semantic_usage("gl_VertexIndex"), None);
    }

    #[test]
    fn mesh_metadata_drives_attribute_format_and_stream() {
        let elements = [
            VertexElement {
                stream: 0,
                offset: 0,
                kind: VertexKind::F32x3,
                usage: VertexUsage::Position,
                usage_index: 0,
            },
            VertexElement {
                stream: 1,
                offset: 8,
                kind: VertexKind::U8x4Norm,
                usage: VertexUsage::Color,
                usage_index: 0,
            },
        ];
        let inputs = [
            StageInput {
                name: "in.var.POSITION0".into(),
                location: 0,
                fallback_format: vk::Format::R32G32B32A32_SFLOAT,
            },
            StageInput {
                name: "in.var.COLOR0".into(),
                location: 1,
                fallback_format: vk::Format::R32G32B32A32_SFLOAT,
            },
        ];
        let attributes = derive_vertex_inputs(&inputs, Some(&elements));
        assert_eq!(attributes[0].format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(attributes[0].binding, 0);
        assert_eq!(attributes[1].format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(attributes[1].binding, 1);
        assert_eq!(attributes[1].offset, 8);
    }

    #[test]
    fn missing_semantic_degrades_to_undefined_format() {
        let inputs = [StageInput {
            name: "in.var.TANGENTFOO".into(),
            location: 0,
            fallback_format: vk::Format::R32G32B32_SFLOAT,
        }];
        let attributes = derive_vertex_inputs(&inputs, Some(&[]));
        assert_eq!(attributes[0].format, vk::Format::UNDEFINED);
    }

    #[test]
    fn shader_only_derivation_packs_offsets() {
        let inputs = [
            StageInput {
                name: "a".into(),
                location: 0,
                fallback_format: vk::Format::R32G32B32A32_SFLOAT,
            },
            StageInput {
                name: "b".into(),
                location: 1,
                fallback_format: vk::Format::R32G32_SFLOAT,
            },
        ];
        let attributes = derive_vertex_inputs(&inputs, None);
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[1].offset, 16);
        assert_eq!(attributes[1].binding, 0);
    }
}
