//! Pipeline cache keyed by shader content identity and pass.
//!
//! Shader bytecode blobs are interned: two blobs with identical bytes map to
//! the same `ShaderId`, two different blobs never collide. A pipeline is
//! keyed by (vertex id, pixel id, pass), so reusing a shader pair across
//! draw objects hits the cache and distinct pairs never alias.
//!
//! Each cached pipeline also carries its descriptor sets, keyed by set index
//! plus a caller-supplied context value. A window resize invalidates the
//! descriptor sets (they reference resized intermediate targets) but keeps
//! the pipelines, which do not depend on surface extent.

use std::collections::HashMap;

use ash::vk;

use crate::device::Device;
use crate::error::{RenderError, RenderResult};
use crate::model::VertexElement;
use crate::pipeline::bindings::{plan_set, PlannedBinding};
use crate::pipeline::{PassName, PassSpec};
use crate::shader::reflection::{
    self, derive_vertex_inputs, format_size, group_by_set, merge_bindings, VertexAttribute,
};

/// Identity of one interned shader blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderId(u32);

/// Content-identity interner for shader bytecode.
#[derive(Default)]
pub struct ShaderInterner {
    ids: HashMap<Box<[u8]>, ShaderId>,
}

impl ShaderInterner {
    pub fn intern(&mut self, bytecode: &[u8]) -> ShaderId {
        let next = ShaderId(self.ids.len() as u32);
        *self.ids.entry(bytecode.into()).or_insert(next)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub vertex: ShaderId,
    pub pixel: ShaderId,
    pub pass: PassName,
}

pub struct CachedPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    /// Resolved binding plan per descriptor set, in set order.
    pub set_plans: Vec<Vec<PlannedBinding>>,
    pub vertex_module: vk::ShaderModule,
    pub pixel_module: vk::ShaderModule,
    /// Built descriptor sets, keyed by (set index, context hash). The
    /// context hash distinguishes per-draw-object and per-material state.
    pub descriptor_sets: HashMap<(u32, u64), vk::DescriptorSet>,
}

impl CachedPipeline {
    pub fn cached_set(&self, set: u32, context: u64) -> Option<vk::DescriptorSet> {
        self.descriptor_sets.get(&(set, context)).copied()
    }

    pub fn insert_set(&mut self, set: u32, context: u64, descriptor_set: vk::DescriptorSet) {
        self.descriptor_sets.insert((set, context), descriptor_set);
    }
}

#[derive(Default)]
pub struct PipelineCache {
    interner: ShaderInterner,
    pipelines: HashMap<PipelineKey, CachedPipeline>,
}

impl PipelineCache {
    pub fn new() -> PipelineCache {
        PipelineCache::default()
    }

    pub fn key_for(&mut self, vertex: &[u8], pixel: &[u8], pass: PassName) -> PipelineKey {
        PipelineKey {
            vertex: self.interner.intern(vertex),
            pixel: self.interner.intern(pixel),
            pass,
        }
    }

    pub fn get(&mut self, key: &PipelineKey) -> Option<&mut CachedPipeline> {
        self.pipelines.get_mut(key)
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Look up or build the pipeline for a shader pair in a pass.
    ///
    /// `mesh` supplies the part's vertex elements and per-stream strides;
    /// `None` means a full-screen draw whose inputs come from the shader's
    /// own declarations.
    #[allow(clippy::too_many_arguments)]
    pub fn get_or_create(
        &mut self,
        device: &Device,
        vertex_bytecode: &[u8],
        pixel_bytecode: &[u8],
        pass: PassName,
        mesh: Option<(&[VertexElement], &[u32])>,
    ) -> RenderResult<&mut CachedPipeline> {
        let key = self.key_for(vertex_bytecode, pixel_bytecode, pass);
        if !self.pipelines.contains_key(&key) {
            let built = build_pipeline(device, vertex_bytecode, pixel_bytecode, pass, mesh)?;
            self.pipelines.insert(key, built);
        }
        Ok(self.pipelines.get_mut(&key).unwrap())
    }

    /// Drop every cached descriptor set. Called on swapchain resize, when
    /// the intermediate targets the sets reference are recreated. The sets
    /// themselves return to their pools on pool reset; handles are simply
    /// forgotten here.
    pub fn invalidate_descriptor_sets(&mut self) {
        for cached in self.pipelines.values_mut() {
            cached.descriptor_sets.clear();
        }
    }

    pub fn destroy(&mut self, device: &Device) {
        for (_, cached) in self.pipelines.drain() {
            unsafe {
                device.device.destroy_pipeline(cached.pipeline, None);
                device.device.destroy_pipeline_layout(cached.layout, None);
                for layout in cached.set_layouts {
                    device.device.destroy_descriptor_set_layout(layout, None);
                }
                device
                    .device
                    .destroy_shader_module(cached.vertex_module, None);
                device
                    .device
                    .destroy_shader_module(cached.pixel_module, None);
            }
        }
    }
}

fn vertex_binding_descriptions(
    attributes: &[VertexAttribute],
    mesh: Option<(&[VertexElement], &[u32])>,
) -> Vec<vk::VertexInputBindingDescription> {
    match mesh {
        Some((_, strides)) => {
            let mut used: Vec<u32> = attributes.iter().map(|a| a.binding).collect();
            used.sort_unstable();
            used.dedup();
            used.into_iter()
                .map(|binding| vk::VertexInputBindingDescription {
                    binding,
                    stride: strides.get(binding as usize).copied().unwrap_or(0),
                    input_rate: vk::VertexInputRate::VERTEX,
                })
                .collect()
        }
        None => {
            if attributes.is_empty() {
                return Vec::new();
            }
            let stride = attributes
                .iter()
                .map(|a| a.offset + format_size(a.format))
                .max()
                .unwrap_or(0);
            vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride,
                input_rate: vk::VertexInputRate::VERTEX,
            }]
        }
    }
}

fn build_pipeline(
    device: &Device,
    vertex_bytecode: &[u8],
    pixel_bytecode: &[u8],
    pass: PassName,
    mesh: Option<(&[VertexElement], &[u32])>,
) -> RenderResult<CachedPipeline> {
    let spec = PassSpec::for_pass(pass);

    let vertex_reflection =
        reflection::reflect_stage(vertex_bytecode, vk::ShaderStageFlags::VERTEX)?;
    let pixel_reflection =
        reflection::reflect_stage(pixel_bytecode, vk::ShaderStageFlags::FRAGMENT)?;
    let merged = merge_bindings(&vertex_reflection.bindings, &pixel_reflection.bindings);
    let sets = group_by_set(&merged);

    let mut set_layouts = Vec::with_capacity(sets.len());
    let mut set_plans = Vec::with_capacity(sets.len());
    for set in &sets {
        let layout_bindings: Vec<vk::DescriptorSetLayoutBinding> = set
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.kind.descriptor_type())
                    .descriptor_count(1)
                    .stage_flags(b.stages)
            })
            .collect();
        let layout = unsafe {
            device
                .device
                .create_descriptor_set_layout(
                    &vk::DescriptorSetLayoutCreateInfo::default().bindings(&layout_bindings),
                    None,
                )
                .map_err(|e| RenderError::PipelineCreation(e.to_string()))?
        };
        set_layouts.push(layout);
        set_plans.push(plan_set(set));
    }

    let layout = unsafe {
        device
            .device
            .create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts),
                None,
            )
            .map_err(|e| RenderError::PipelineCreation(e.to_string()))?
    };

    let vertex_module = device.create_shader_module(vertex_bytecode)?;
    let pixel_module = device.create_shader_module(pixel_bytecode)?;

    let entry = c"main";
    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_module)
            .name(entry),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(pixel_module)
            .name(entry),
    ];

    let attributes = derive_vertex_inputs(
        &vertex_reflection.inputs,
        mesh.map(|(elements, _)| elements),
    );
    let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = attributes
        .iter()
        .map(|a| vk::VertexInputAttributeDescription {
            location: a.location,
            binding: a.binding,
            format: a.format,
            offset: a.offset,
        })
        .collect();
    let binding_descriptions = vertex_binding_descriptions(&attributes, mesh);
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&binding_descriptions)
        .vertex_attribute_descriptions(&attribute_descriptions);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);
    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(spec.depth_test)
        .depth_write_enable(spec.depth_write)
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);

    let blend_attachment = if spec.blend {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    } else {
        vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    };
    let blend_attachments = vec![blend_attachment; spec.color_count];
    let color_blend =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats = spec.color_formats();
    let mut rendering_info =
        vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);
    if spec.has_depth {
        rendering_info = rendering_info.depth_attachment_format(vk::Format::D32_SFLOAT);
    }

    let create_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipeline = unsafe {
        device
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
            .map_err(|(_, e)| RenderError::PipelineCreation(e.to_string()))?[0]
    };

    log::debug!(
        "built pipeline for pass {:?}: {} sets, {} vertex attributes",
        pass,
        set_layouts.len(),
        attributes.len()
    );

    Ok(CachedPipeline {
        pipeline,
        layout,
        set_layouts,
        set_plans,
        vertex_module,
        pixel_module,
        descriptor_sets: HashMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interner_is_stable_for_identical_content() {
        let mut interner = ShaderInterner::default();
        let a = interner.intern(&[1, 2, 3]);
        let b = interner.intern(&[1, 2, 3]);
        let c = interner.intern(&[1, 2, 4]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn same_content_different_blobs_share_a_key() {
        let mut cache = PipelineCache::new();
        let first = cache.key_for(&[7; 64], &[9; 64], PassName::GOpaque);
        let copy_v = [7u8; 64];
        let copy_p = [9u8; 64];
        let second = cache.key_for(&copy_v, &copy_p, PassName::GOpaque);
        assert_eq!(first, second);
        // Same shaders in another pass are a different pipeline.
        let other_pass = cache.key_for(&copy_v, &copy_p, PassName::ZOpaque);
        assert_ne!(first, other_pass);
    }

    #[test]
    fn equal_length_sums_do_not_collide() {
        // A length-sum key would alias these two pairs.
        let mut cache = PipelineCache::new();
        let a = cache.key_for(&[1; 10], &[2; 20], PassName::GOpaque);
        let b = cache.key_for(&[3; 20], &[4; 10], PassName::GOpaque);
        assert_ne!(a, b);
    }

    #[test]
    fn resize_invalidation_drops_sets_but_keeps_pipelines() {
        let mut cache = PipelineCache::new();
        let key = cache.key_for(&[1], &[2], PassName::LightingOpaque);
        let mut cached = CachedPipeline {
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            set_layouts: Vec::new(),
            set_plans: Vec::new(),
            vertex_module: vk::ShaderModule::null(),
            pixel_module: vk::ShaderModule::null(),
            descriptor_sets: HashMap::new(),
        };
        cached.insert_set(0, 42, vk::DescriptorSet::null());
        cache.pipelines.insert(key, cached);

        cache.invalidate_descriptor_sets();
        assert_eq!(cache.pipeline_count(), 1);
        assert!(cache.pipelines[&key].descriptor_sets.is_empty());
    }
}
