//! Legacy forward renderer with fixed shaders from disk.
//!
//! Kept for debugging asset ingestion: it ignores shader packages entirely
//! and draws every part position-only with a flat forward pipeline straight
//! into the swapchain image. Selected with `INSPECTOR_SIMPLE_RENDERER=1`.

use std::collections::HashMap;
use std::path::PathBuf;

use ash::vk;
use glam::Mat4;

use crate::device::{texture, Buffer, Device, Texture};
use crate::error::{RenderError, RenderResult};
use crate::model::draw_object::DrawList;
use crate::model::{VertexElement, VertexUsage};
use crate::renderer::{CameraState, Renderer};

const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Vertex fetch signature a pipeline is specialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FetchKey {
    stride: u32,
    offset: u32,
    format_raw: i32,
}

fn position_element(elements: &[VertexElement]) -> Option<&VertexElement> {
    elements
        .iter()
        .find(|e| e.usage == VertexUsage::Position && e.usage_index == 0)
}

pub struct SimpleRenderer {
    surface_format: vk::Format,
    shader_dir: PathBuf,
    depth: Option<Texture>,
    layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
    pipelines: HashMap<FetchKey, vk::Pipeline>,
    camera_buffer: Option<Buffer>,
    descriptor_set: Option<vk::DescriptorSet>,
    vertex_module: vk::ShaderModule,
    pixel_module: vk::ShaderModule,
    initialized: bool,
}

impl SimpleRenderer {
    pub fn new(surface_format: vk::Format) -> SimpleRenderer {
        let shader_dir = std::env::var("INSPECTOR_SHADER_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("shaders"));
        SimpleRenderer {
            surface_format,
            shader_dir,
            depth: None,
            layout: vk::PipelineLayout::null(),
            set_layout: vk::DescriptorSetLayout::null(),
            pipelines: HashMap::new(),
            camera_buffer: None,
            descriptor_set: None,
            vertex_module: vk::ShaderModule::null(),
            pixel_module: vk::ShaderModule::null(),
            initialized: false,
        }
    }

    /// Deferred until the first frame so construction stays infallible.
    /// Shader files missing on disk is a fatal init error here, unlike the
    /// degradable package path.
    fn ensure_initialized(&mut self, device: &Device, extent: vk::Extent2D) -> RenderResult<()> {
        if self.initialized {
            return Ok(());
        }
        self.vertex_module =
            device.load_shader_from_disk(&self.shader_dir.join("simple.vert.spv"))?;
        self.pixel_module =
            device.load_shader_from_disk(&self.shader_dir.join("simple.frag.spv"))?;

        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)];
        self.set_layout = unsafe {
            device
                .device
                .create_descriptor_set_layout(
                    &vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings),
                    None,
                )
                .map_err(|e| RenderError::PipelineCreation(format!("{e:?}")))?
        };

        let push_ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: std::mem::size_of::<Mat4>() as u32,
        }];
        let set_layouts = [self.set_layout];
        self.layout = unsafe {
            device
                .device
                .create_pipeline_layout(
                    &vk::PipelineLayoutCreateInfo::default()
                        .set_layouts(&set_layouts)
                        .push_constant_ranges(&push_ranges),
                    None,
                )
                .map_err(|e| RenderError::PipelineCreation(format!("{e:?}")))?
        };

        let mut camera_buffer = device.create_buffer(
            std::mem::size_of::<Mat4>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            "simple camera",
        )?;
        camera_buffer.write(0, bytemuck::bytes_of(&Mat4::IDENTITY));
        camera_buffer.flush(device)?;

        let set = device.allocate_descriptor_set(self.set_layout)?;
        let info = [vk::DescriptorBufferInfo {
            buffer: camera_buffer.buffer,
            offset: 0,
            range: camera_buffer.size,
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&info);
        unsafe { device.device.update_descriptor_sets(&[write], &[]) };

        self.camera_buffer = Some(camera_buffer);
        self.descriptor_set = Some(set);
        self.depth = Some(self.create_depth(device, extent)?);
        self.initialized = true;
        Ok(())
    }

    fn create_depth(&self, device: &Device, extent: vk::Extent2D) -> RenderResult<Texture> {
        device.create_texture(
            extent.width.max(1),
            extent.height.max(1),
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            "simple depth",
        )
    }

    fn pipeline_for(&mut self, device: &Device, key: FetchKey) -> RenderResult<vk::Pipeline> {
        if let Some(existing) = self.pipelines.get(&key) {
            return Ok(*existing);
        }

        let entry = c"main";
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(self.vertex_module)
                .name(entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(self.pixel_module)
                .name(entry),
        ];

        let binding_descriptions = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: key.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let attribute_descriptions = [vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::from_raw(key.format_raw),
            offset: key.offset,
        }];
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
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);
        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = [self.surface_format];
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(DEPTH_FORMAT);

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
            .layout(self.layout)
            .push_next(&mut rendering_info);

        let pipeline = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, e)| RenderError::PipelineCreation(e.to_string()))?[0]
        };
        self.pipelines.insert(key, pipeline);
        Ok(pipeline)
    }
}

impl Renderer for SimpleRenderer {
    fn record(
        &mut self,
        device: &Device,
        cmd: vk::CommandBuffer,
        swapchain_image: vk::Image,
        swapchain_view: vk::ImageView,
        swapchain_extent: vk::Extent2D,
        draw_list: &mut DrawList,
        camera: &CameraState,
    ) -> RenderResult<()> {
        self.ensure_initialized(device, swapchain_extent)?;

        if let Some(buffer) = &mut self.camera_buffer {
            let view_projection = camera.projection * camera.view;
            buffer.write(0, bytemuck::bytes_of(&view_projection));
            buffer.flush(device)?;
        }

        device.transition_image(
            cmd,
            swapchain_image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        let (depth_image, depth_view) = match &self.depth {
            Some(depth) => (depth.image, depth.view),
            None => return Ok(()),
        };
        let Some(descriptor_set) = self.descriptor_set else {
            return Ok(());
        };
        device.transition_image(
            cmd,
            depth_image,
            texture::aspect_for_format(DEPTH_FORMAT),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        );

        let color_attachments = [vk::RenderingAttachmentInfo::default()
            .image_view(swapchain_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.1, 0.1, 0.12, 1.0],
                },
            })];
        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(depth_view)
            .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: swapchain_extent,
        };
        let rendering = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&depth_attachment);

        unsafe {
            device.device.cmd_begin_rendering(cmd, &rendering);
            device.device.cmd_set_viewport(
                cmd,
                0,
                &[vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: swapchain_extent.width as f32,
                    height: swapchain_extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            device.device.cmd_set_scissor(cmd, 0, &[render_area]);
        }

        for instance in &draw_list.instances {
            let object = instance.object.lock();
            for part in &object.parts {
                let Some(position) = position_element(&part.elements) else {
                    continue;
                };
                let stream = position.stream as usize;
                let Some(vertex_buffer) = part.vertex_buffers.get(stream) else {
                    continue;
                };
                let key = FetchKey {
                    stride: part.stream_strides.get(stream).copied().unwrap_or(0),
                    offset: position.offset as u32,
                    format_raw: position.kind.vk_format().as_raw(),
                };
                let pipeline = self.pipeline_for(device, key)?;
                unsafe {
                    device.device.cmd_bind_pipeline(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        pipeline,
                    );
                    device.device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.layout,
                        0,
                        &[descriptor_set],
                        &[],
                    );
                    device.device.cmd_push_constants(
                        cmd,
                        self.layout,
                        vk::ShaderStageFlags::VERTEX,
                        0,
                        bytemuck::bytes_of(&instance.transform),
                    );
                    device
                        .device
                        .cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer.buffer], &[0]);
                    device.device.cmd_bind_index_buffer(
                        cmd,
                        part.index_buffer.buffer,
                        0,
                        vk::IndexType::UINT16,
                    );
                    device.device.cmd_draw_indexed(cmd, part.index_count, 1, 0, 0, 0);
                }
            }
        }

        unsafe {
            device.device.cmd_end_rendering(cmd);
        }
        device.transition_image(
            cmd,
            swapchain_image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        Ok(())
    }

    fn resize(&mut self, device: &Device, extent: vk::Extent2D) -> RenderResult<()> {
        if let Some(mut old) = self.depth.take() {
            old.destroy(device);
            self.depth = Some(self.create_depth(device, extent)?);
        }
        Ok(())
    }

    fn composite(&self) -> Option<&Texture> {
        None
    }

    fn destroy(&mut self, device: &Device) {
        unsafe {
            for (_, pipeline) in self.pipelines.drain() {
                device.device.destroy_pipeline(pipeline, None);
            }
            if self.layout != vk::PipelineLayout::null() {
                device.device.destroy_pipeline_layout(self.layout, None);
            }
            if self.set_layout != vk::DescriptorSetLayout::null() {
                device
                    .device
                    .destroy_descriptor_set_layout(self.set_layout, None);
            }
            if self.vertex_module != vk::ShaderModule::null() {
                device.device.destroy_shader_module(self.vertex_module, None);
            }
            if self.pixel_module != vk::ShaderModule::null() {
                device.device.destroy_shader_module(self.pixel_module, None);
            }
        }
        if let Some(mut buffer) = self.camera_buffer.take() {
            buffer.destroy(device);
        }
        if let Some(mut depth) = self.depth.take() {
            depth.destroy(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VertexKind;

    #[test]
    fn position_element_requires_usage_index_zero() {
        let elements = [
            VertexElement {
                stream: 1,
                offset: 4,
                kind: VertexKind::F32x3,
                usage: VertexUsage::Position,
                usage_index: 1,
            },
            VertexElement {
                stream: 0,
                offset: 0,
                kind: VertexKind::F32x3,
                usage: VertexUsage::Position,
                usage_index: 0,
            },
        ];
        let found = position_element(&elements).unwrap();
        assert_eq!(found.stream, 0);
        assert!(position_element(&[]).is_none());
    }
}
