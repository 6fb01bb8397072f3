//! Name-based descriptor binding resolution.
//!
//! Translated shaders declare their resources by the engine parameter names
//! baked into the original bytecode. Those names are interned into a closed
//! enum once per shader pair; per-frame descriptor writes then switch on the
//! enum instead of comparing strings. Unknown names resolve to a dummy
//! buffer or image so a shader the table does not cover still renders,
//! just incorrectly.

use crate::shader::reflection::{BindingKind, ReflectedBinding};

/// Every global resource a shader may request by name. The renderer owns one
/// concrete buffer/image per variant (some per draw object or per material).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalResource {
    CameraParameter,
    InstanceParameter,
    ModelParameter,
    MaterialParameter,
    LightParameter,
    CommonParameter,
    AmbientParameter,
    JointMatrixArray,
    // Renderer-owned intermediate targets.
    GBufferImage,
    ViewPositionImage,
    LightDiffuseImage,
    LightSpecularImage,
    DepthImage,
    NormalImage,
    IndexImage,
    // Material texture slots.
    DiffuseTexture,
    NormalTexture,
    SpecularTexture,
    MaskTexture,
    TableTexture,
    TileDiffuseTexture,
    TileNormalTexture,
    CommonSampler,
}

const RESOURCE_NAMES: &[(&str, GlobalResource)] = &[
    ("g_CameraParameter", GlobalResource::CameraParameter),
    ("g_InstanceParameter", GlobalResource::InstanceParameter),
    ("g_ModelParameter", GlobalResource::ModelParameter),
    ("g_MaterialParameter", GlobalResource::MaterialParameter),
    ("g_LightParam", GlobalResource::LightParameter),
    ("g_CommonParameter", GlobalResource::CommonParameter),
    ("g_AmbientParam", GlobalResource::AmbientParameter),
    ("g_JointMatrixArray", GlobalResource::JointMatrixArray),
    ("g_SamplerGBuffer", GlobalResource::GBufferImage),
    ("g_SamplerViewPosition", GlobalResource::ViewPositionImage),
    ("g_SamplerLightDiffuse", GlobalResource::LightDiffuseImage),
    ("g_SamplerLightSpecular", GlobalResource::LightSpecularImage),
    ("g_SamplerDepth", GlobalResource::DepthImage),
    ("g_SamplerGBufferNormal", GlobalResource::NormalImage),
    ("g_SamplerIndex", GlobalResource::IndexImage),
    ("g_SamplerDiffuse", GlobalResource::DiffuseTexture),
    ("g_SamplerNormal", GlobalResource::NormalTexture),
    ("g_SamplerSpecular", GlobalResource::SpecularTexture),
    ("g_SamplerMask", GlobalResource::MaskTexture),
    ("g_SamplerTable", GlobalResource::TableTexture),
    ("g_SamplerTileDiffuse", GlobalResource::TileDiffuseTexture),
    ("g_SamplerTileNormal", GlobalResource::TileNormalTexture),
    ("g_Sampler", GlobalResource::CommonSampler),
];

/// What to bind at one slot of one descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingSource {
    Resource(GlobalResource),
    /// Name was not in the table; a shared 1x1 dummy stands in.
    DummyBuffer,
    DummyImage,
    DummySampler,
}

/// One resolved slot of the binding plan.
#[derive(Debug, Clone)]
pub struct PlannedBinding {
    pub binding: u32,
    pub kind: BindingKind,
    pub source: BindingSource,
}

/// Intern a reflected name. Exact match first; names carry no decoration in
/// the translated bytecode so a miss means the table genuinely lacks it.
pub fn intern_resource_name(name: &str) -> Option<GlobalResource> {
    RESOURCE_NAMES
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, resource)| *resource)
}

/// Build the binding plan for one descriptor set, resolving each reflected
/// binding's name once. This runs at pipeline creation, not per frame.
pub fn plan_set(bindings: &[ReflectedBinding]) -> Vec<PlannedBinding> {
    bindings
        .iter()
        .map(|binding| {
            let source = match intern_resource_name(&binding.name) {
                Some(resource) => BindingSource::Resource(resource),
                None => {
                    log::warn!(
                        "unknown shader resource '{}' at set {} binding {}, binding dummy",
                        binding.name,
                        binding.set,
                        binding.binding
                    );
                    match binding.kind {
                        BindingKind::UniformBuffer | BindingKind::StorageBuffer => {
                            BindingSource::DummyBuffer
                        }
                        BindingKind::Sampler => BindingSource::DummySampler,
                        _ => BindingSource::DummyImage,
                    }
                }
            };
            PlannedBinding {
                binding: binding.binding,
                kind: binding.kind,
                source,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    fn reflected(name: &str, kind: BindingKind, slot: u32) -> ReflectedBinding {
        ReflectedBinding {
            name: name.to_string(),
            set: 0,
            binding: slot,
            kind,
            stages: vk::ShaderStageFlags::FRAGMENT,
            used: true,
        }
    }

    #[test]
    fn known_names_resolve_to_engine_resources() {
        assert_eq!(
            intern_resource_name("g_CameraParameter"),
            Some(GlobalResource::CameraParameter)
        );
        assert_eq!(
            intern_resource_name("g_SamplerGBuffer"),
            Some(GlobalResource::GBufferImage)
        );
        assert_eq!(intern_resource_name("g_Unknown"), None);
    }

    #[test]
    fn unknown_names_bind_dummies_and_never_fail() {
        let plan = plan_set(&[
            reflected("g_TotallyNewParameter", BindingKind::UniformBuffer, 0),
            reflected("g_TotallyNewSampler", BindingKind::SampledImage, 1),
            reflected("g_JointMatrixArray", BindingKind::UniformBuffer, 2),
        ]);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].source, BindingSource::DummyBuffer);
        assert_eq!(plan[1].source, BindingSource::DummyImage);
        assert_eq!(
            plan[2].source,
            BindingSource::Resource(GlobalResource::JointMatrixArray)
        );
    }

    #[test]
    fn sampler_kind_gets_dummy_sampler() {
        let plan = plan_set(&[reflected("g_Mystery", BindingKind::Sampler, 0)]);
        assert_eq!(plan[0].source, BindingSource::DummySampler);
    }
}
