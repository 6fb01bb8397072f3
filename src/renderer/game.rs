//! The game-shader renderer: reflects translated shader packages and runs
//! the deferred pass chain over the active draw list.
//!
//! Frame shape: Z-opaque and G-opaque rasterize geometry into depth and the
//! G-buffer, the lighting passes reconstruct view-space position and
//! accumulate light as full-screen draws over the G-buffer, and the
//! composite pass resolves final shading then blends semi-transparent
//! geometry on top. All attachments move between passes with explicit
//! layout transitions; the finished composite image is blitted to the
//! acquired swapchain image.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ash::vk;
use glam::Mat4;

use crate::device::{Buffer, Device, Texture};
use crate::error::RenderResult;
use crate::model::draw_object::{resolve_material_index, DrawList, RenderMaterial};
use crate::model::TextureSlot;
use crate::pipeline::bindings::{BindingSource, GlobalResource, PlannedBinding};
use crate::pipeline::cache::PipelineCache;
use crate::pipeline::PassName;
use crate::renderer::targets::{DummyResources, RenderTargets};
use crate::renderer::{
    AmbientParameter, CameraState, CommonParameter, InstanceParameter, LightParameter, Renderer,
};
use crate::shader::reflection::BindingKind;
use crate::shader::{
    combine_selector, resolve_material_keys, resolve_scene_keys, resolve_system_keys,
    ShaderPackage,
};

pub struct GameRenderer {
    targets: RenderTargets,
    dummies: DummyResources,
    cache: PipelineCache,
    camera_buffer: Buffer,
    common_buffer: Buffer,
    light_buffer: Buffer,
    ambient_buffer: Buffer,
    model_buffer: Buffer,
    /// One instance-parameter buffer per draw-list slot, grown on demand and
    /// rewritten every frame. Cached descriptor sets reference them by slot
    /// index, so the buffers live until the renderer is destroyed.
    instance_buffers: Vec<Buffer>,
    /// Package providing the full-screen lighting and composite shaders.
    /// Absent until the asset layer hands it over; the lighting passes are
    /// skipped meanwhile.
    lighting_package: Option<Arc<ShaderPackage>>,
    pub light: LightParameter,
    pub ambient: AmbientParameter,
}

/// Context value for descriptor-set caching: the set is only valid for the
/// draw-list slot and material it was written against.
fn descriptor_context(instance_slot: usize, material_hash: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    instance_slot.hash(&mut hasher);
    material_hash.hash(&mut hasher);
    hasher.finish()
}

/// Full-screen draws share one context per pipeline.
const FULLSCREEN_CONTEXT: u64 = u64::MAX;

/// What a binding plan entry resolved to for a concrete draw.
enum Resolved {
    Buf(vk::Buffer, vk::DeviceSize),
    Img(vk::ImageView),
    Smp(vk::Sampler),
}

/// Everything name resolution can draw from for one draw call. Full-screen
/// draws carry no instance, bone or material state.
struct ResolveCtx<'a> {
    targets: &'a RenderTargets,
    dummies: &'a DummyResources,
    camera: &'a Buffer,
    common: &'a Buffer,
    light: &'a Buffer,
    ambient: &'a Buffer,
    model: &'a Buffer,
    instance: Option<&'a Buffer>,
    bones: Option<&'a Buffer>,
    material: Option<&'a RenderMaterial>,
    /// Composite binds the material's transparency-variant constant block
    /// when it has one.
    composite: bool,
}

impl<'a> ResolveCtx<'a> {
    fn material_texture(&self, slot: TextureSlot) -> Resolved {
        match self.material.and_then(|m| m.textures.get(&slot)) {
            Some(texture) => Resolved::Img(texture.view),
            None => Resolved::Img(self.dummies.texture.view),
        }
    }

    fn resolve(&self, source: BindingSource) -> Resolved {
        let whole = |b: &Buffer| Resolved::Buf(b.buffer, b.size);
        match source {
            BindingSource::DummyBuffer => whole(&self.dummies.buffer),
            BindingSource::DummyImage => Resolved::Img(self.dummies.texture.view),
            BindingSource::DummySampler => Resolved::Smp(self.dummies.sampler),
            BindingSource::Resource(resource) => match resource {
                GlobalResource::CameraParameter => whole(self.camera),
                GlobalResource::CommonParameter => whole(self.common),
                GlobalResource::LightParameter => whole(self.light),
                GlobalResource::AmbientParameter => whole(self.ambient),
                GlobalResource::ModelParameter => whole(self.model),
                GlobalResource::InstanceParameter => {
                    whole(self.instance.unwrap_or(&self.dummies.buffer))
                }
                GlobalResource::JointMatrixArray => {
                    whole(self.bones.unwrap_or(&self.dummies.buffer))
                }
                GlobalResource::MaterialParameter => {
                    let block = self.material.and_then(|m| {
                        if self.composite {
                            m.transparency_constants.as_ref().or(m.constants.as_ref())
                        } else {
                            m.constants.as_ref()
                        }
                    });
                    match block {
                        Some(constants) => whole(constants),
                        None => whole(&self.dummies.buffer),
                    }
                }
                GlobalResource::GBufferImage => Resolved::Img(self.targets.gbuffer[0].view),
                GlobalResource::NormalImage => Resolved::Img(self.targets.gbuffer[1].view),
                GlobalResource::IndexImage => Resolved::Img(self.targets.gbuffer[4].view),
                GlobalResource::ViewPositionImage => Resolved::Img(self.targets.view_position.view),
                GlobalResource::LightDiffuseImage => Resolved::Img(self.targets.light_diffuse.view),
                GlobalResource::LightSpecularImage => {
                    Resolved::Img(self.targets.light_specular.view)
                }
                GlobalResource::DepthImage => Resolved::Img(self.targets.depth.view),
                GlobalResource::DiffuseTexture => self.material_texture(TextureSlot::Diffuse),
                GlobalResource::NormalTexture => self.material_texture(TextureSlot::Normal),
                GlobalResource::SpecularTexture => self.material_texture(TextureSlot::Specular),
                GlobalResource::MaskTexture => self.material_texture(TextureSlot::Mask),
                GlobalResource::TableTexture => self.material_texture(TextureSlot::Table),
                GlobalResource::TileDiffuseTexture => {
                    self.material_texture(TextureSlot::TileDiffuse)
                }
                GlobalResource::TileNormalTexture => {
                    self.material_texture(TextureSlot::TileNormal)
                }
                GlobalResource::CommonSampler => Resolved::Smp(self.dummies.sampler),
            },
        }
    }
}

/// Write one binding of a freshly allocated descriptor set. A resolution
/// whose shape does not match the declared descriptor type degrades to the
/// matching dummy.
fn write_binding(
    device: &Device,
    set: vk::DescriptorSet,
    planned: &PlannedBinding,
    ctx: &ResolveCtx,
) {
    let resolved = ctx.resolve(planned.source);
    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(planned.binding)
        .descriptor_type(planned.kind.descriptor_type());
    match planned.kind {
        BindingKind::UniformBuffer | BindingKind::StorageBuffer => {
            let (buffer, range) = match resolved {
                Resolved::Buf(b, r) => (b, r),
                _ => (ctx.dummies.buffer.buffer, ctx.dummies.buffer.size),
            };
            let info = [vk::DescriptorBufferInfo {
                buffer,
                offset: 0,
                range,
            }];
            unsafe {
                device
                    .device
                    .update_descriptor_sets(&[write.buffer_info(&info)], &[]);
            }
        }
        BindingKind::SampledImage => {
            let view = match resolved {
                Resolved::Img(v) => v,
                _ => ctx.dummies.texture.view,
            };
            let info = [vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];
            unsafe {
                device
                    .device
                    .update_descriptor_sets(&[write.image_info(&info)], &[]);
            }
        }
        BindingKind::Sampler => {
            let sampler = match resolved {
                Resolved::Smp(s) => s,
                _ => ctx.dummies.sampler,
            };
            let info = [vk::DescriptorImageInfo {
                sampler,
                image_view: vk::ImageView::null(),
                image_layout: vk::ImageLayout::UNDEFINED,
            }];
            unsafe {
                device
                    .device
                    .update_descriptor_sets(&[write.image_info(&info)], &[]);
            }
        }
        BindingKind::CombinedImageSampler => {
            let view = match resolved {
                Resolved::Img(v) => v,
                _ => ctx.dummies.texture.view,
            };
            let info = [vk::DescriptorImageInfo {
                sampler: ctx.dummies.sampler,
                image_view: view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];
            unsafe {
                device
                    .device
                    .update_descriptor_sets(&[write.image_info(&info)], &[]);
            }
        }
    }
}

/// Obtain every descriptor set of a cached pipeline for one draw context,
/// allocating and writing any that are missing.
fn bind_sets(
    device: &Device,
    cmd: vk::CommandBuffer,
    cache: &mut PipelineCache,
    key: crate::pipeline::cache::PipelineKey,
    context: u64,
    ctx: &ResolveCtx,
) -> RenderResult<()> {
    let cached = cache.get(&key).expect("pipeline was just created");
    let mut sets = Vec::with_capacity(cached.set_plans.len());
    for set_index in 0..cached.set_plans.len() {
        let set = match cached.cached_set(set_index as u32, context) {
            Some(existing) => existing,
            None => {
                let set = device.allocate_descriptor_set(cached.set_layouts[set_index])?;
                let plan = cached.set_plans[set_index].clone();
                for planned in &plan {
                    write_binding(device, set, planned, ctx);
                }
                cached.insert_set(set_index as u32, context, set);
                set
            }
        };
        sets.push(set);
    }
    if !sets.is_empty() {
        unsafe {
            device.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                cached.layout,
                0,
                &sets,
                &[],
            );
        }
    }
    Ok(())
}

fn begin_pass(
    device: &Device,
    cmd: vk::CommandBuffer,
    extent: vk::Extent2D,
    colors: &[&Texture],
    clear_colors: bool,
    depth: Option<(&Texture, bool)>,
) {
    let color_attachments: Vec<vk::RenderingAttachmentInfo> = colors
        .iter()
        .map(|texture| {
            vk::RenderingAttachmentInfo::default()
                .image_view(texture.view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(if clear_colors {
                    vk::AttachmentLoadOp::CLEAR
                } else {
                    vk::AttachmentLoadOp::LOAD
                })
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: [0.0, 0.0, 0.0, 0.0],
                    },
                })
        })
        .collect();

    let render_area = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    let mut rendering = vk::RenderingInfo::default()
        .render_area(render_area)
        .layer_count(1)
        .color_attachments(&color_attachments);

    let depth_attachment;
    if let Some((texture, clear)) = depth {
        depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(texture.view)
            .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .load_op(if clear {
                vk::AttachmentLoadOp::CLEAR
            } else {
                vk::AttachmentLoadOp::LOAD
            })
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        rendering = rendering.depth_attachment(&depth_attachment);
    }

    unsafe {
        device.device.cmd_begin_rendering(cmd, &rendering);
        device.device.cmd_set_viewport(
            cmd,
            0,
            &[vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            }],
        );
        device.device.cmd_set_scissor(cmd, 0, &[render_area]);
    }
}

fn end_pass(device: &Device, cmd: vk::CommandBuffer) {
    unsafe {
        device.device.cmd_end_rendering(cmd);
    }
}

impl GameRenderer {
    pub fn new(device: &Device, extent: vk::Extent2D) -> RenderResult<GameRenderer> {
        let targets = RenderTargets::new(device, extent)?;
        let dummies = DummyResources::new(device)?;
        let camera_buffer = device.create_buffer(
            std::mem::size_of::<crate::renderer::CameraParameter>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            "camera",
        )?;
        let common_buffer = device.create_buffer(
            std::mem::size_of::<CommonParameter>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            "common",
        )?;
        let light_buffer = device.create_buffer(
            std::mem::size_of::<LightParameter>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            "light",
        )?;
        let ambient_buffer = device.create_buffer(
            std::mem::size_of::<AmbientParameter>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            "ambient",
        )?;
        let mut model_buffer = device.create_buffer(
            std::mem::size_of::<InstanceParameter>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            "model",
        )?;
        model_buffer.write(0, bytemuck::bytes_of(&InstanceParameter { world: Mat4::IDENTITY }));
        model_buffer.flush(device)?;

        Ok(GameRenderer {
            targets,
            dummies,
            cache: PipelineCache::new(),
            camera_buffer,
            common_buffer,
            light_buffer,
            ambient_buffer,
            model_buffer,
            instance_buffers: Vec::new(),
            lighting_package: None,
            light: LightParameter {
                direction: glam::Vec4::new(-0.45, -0.8, -0.4, 0.0).normalize(),
                diffuse: glam::Vec4::splat(1.0),
                specular: glam::Vec4::splat(0.25),
            },
            ambient: AmbientParameter {
                color: glam::Vec4::new(0.2, 0.2, 0.25, 1.0),
            },
        })
    }

    fn upload_frame_parameters(
        &mut self,
        device: &Device,
        draw_list: &DrawList,
        camera: &CameraState,
    ) -> RenderResult<()> {
        self.camera_buffer
            .write(0, bytemuck::bytes_of(&camera.parameter()));
        self.camera_buffer.flush(device)?;

        let (w, h) = (
            self.targets.extent.width as f32,
            self.targets.extent.height as f32,
        );
        self.common_buffer.write(
            0,
            bytemuck::bytes_of(&CommonParameter {
                screen: glam::Vec4::new(w, h, 1.0 / w, 1.0 / h),
            }),
        );
        self.common_buffer.flush(device)?;

        self.light_buffer.write(0, bytemuck::bytes_of(&self.light));
        self.light_buffer.flush(device)?;
        self.ambient_buffer
            .write(0, bytemuck::bytes_of(&self.ambient));
        self.ambient_buffer.flush(device)?;

        // Bone buffers: rewritten in full for every tracked object.
        for object in draw_list.cache.iter() {
            object.lock().upload_bones(device)?;
        }

        // Per-slot instance parameters.
        while self.instance_buffers.len() < draw_list.instances.len() {
            let buffer = device.create_buffer(
                std::mem::size_of::<InstanceParameter>() as u64,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                "instance",
            )?;
            self.instance_buffers.push(buffer);
        }
        for (slot, instance) in draw_list.instances.iter().enumerate() {
            self.instance_buffers[slot].write(
                0,
                bytemuck::bytes_of(&InstanceParameter {
                    world: instance.transform,
                }),
            );
            self.instance_buffers[slot].flush(device)?;
        }
        Ok(())
    }

    /// Draw every participating part of every instance for one pass.
    fn draw_geometry(
        &mut self,
        device: &Device,
        cmd: vk::CommandBuffer,
        draw_list: &DrawList,
        pass: PassName,
    ) -> RenderResult<()> {
        for (slot, instance) in draw_list.instances.iter().enumerate() {
            let object = instance.object.lock();
            for part in &object.parts {
                let material_index =
                    resolve_material_index(part.material_index, object.materials.len());
                let material = object.materials[material_index].lock();
                let Some(package) = material.package.clone() else {
                    log::debug!(
                        "part of '{}' has no shader package, skipped",
                        object.name
                    );
                    continue;
                };

                let system = resolve_system_keys(&package, material.kind);
                let scene = resolve_scene_keys(&package, object.skinned);
                let mat_keys = resolve_material_keys(&package, &material.material_keys);
                let selector =
                    combine_selector(&system, &scene, &mat_keys, &package.subview_keys);
                let Some(node) = package.find_node(selector) else {
                    log::debug!(
                        "no routing node for selector {selector:#010x} in '{}'",
                        object.name
                    );
                    continue;
                };
                if node.passes.is_empty() {
                    continue;
                }
                let local = node.pass_indices[pass.slot()];
                if local < 0 {
                    continue;
                }
                let Some((vertex, pixel)) = package.node_pass_shaders(node, local) else {
                    log::warn!(
                        "node {:#010x} in '{}' routes outside its package, part skipped",
                        node.selector,
                        object.name
                    );
                    continue;
                };

                let key = {
                    let cached = self.cache.get_or_create(
                        device,
                        vertex,
                        pixel,
                        pass,
                        Some((&part.elements, &part.stream_strides)),
                    )?;
                    unsafe {
                        device.device.cmd_bind_pipeline(
                            cmd,
                            vk::PipelineBindPoint::GRAPHICS,
                            cached.pipeline,
                        );
                    }
                    self.cache.key_for(vertex, pixel, pass)
                };

                let ctx = ResolveCtx {
                    targets: &self.targets,
                    dummies: &self.dummies,
                    camera: &self.camera_buffer,
                    common: &self.common_buffer,
                    light: &self.light_buffer,
                    ambient: &self.ambient_buffer,
                    model: &self.model_buffer,
                    instance: self.instance_buffers.get(slot),
                    bones: Some(&object.bone_buffer),
                    material: Some(&*material),
                    composite: pass == PassName::CompositeSemiTransparency,
                };
                let context = descriptor_context(slot, material.structural_hash);
                bind_sets(device, cmd, &mut self.cache, key, context, &ctx)?;

                unsafe {
                    let handles: Vec<vk::Buffer> =
                        part.vertex_buffers.iter().map(|b| b.buffer).collect();
                    let offsets = vec![0u64; handles.len()];
                    if !handles.is_empty() {
                        device.device.cmd_bind_vertex_buffers(cmd, 0, &handles, &offsets);
                    }
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
        Ok(())
    }

    /// Full-screen draw for the lighting/composite resolve stages, routed
    /// through the lighting shader package. Skipped quietly when no package
    /// has been provided yet.
    fn draw_fullscreen(
        &mut self,
        device: &Device,
        cmd: vk::CommandBuffer,
        pass: PassName,
    ) -> RenderResult<()> {
        let Some(package) = self.lighting_package.clone() else {
            return Ok(());
        };
        let system = resolve_system_keys(&package, crate::shader::MaterialKind::Object);
        let scene = resolve_scene_keys(&package, false);
        let mat_keys = resolve_material_keys(&package, &[]);
        let selector = combine_selector(&system, &scene, &mat_keys, &package.subview_keys);
        let Some(node) = package.find_node(selector) else {
            return Ok(());
        };
        if node.passes.is_empty() {
            return Ok(());
        }
        let local = node.pass_indices[pass.slot()];
        if local < 0 {
            return Ok(());
        }
        let Some((vertex, pixel)) = package.node_pass_shaders(node, local) else {
            log::warn!("lighting node {:#010x} routes outside its package", node.selector);
            return Ok(());
        };

        let key = {
            let cached = self.cache.get_or_create(device, vertex, pixel, pass, None)?;
            unsafe {
                device.device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    cached.pipeline,
                );
            }
            self.cache.key_for(vertex, pixel, pass)
        };

        let ctx = ResolveCtx {
            targets: &self.targets,
            dummies: &self.dummies,
            camera: &self.camera_buffer,
            common: &self.common_buffer,
            light: &self.light_buffer,
            ambient: &self.ambient_buffer,
            model: &self.model_buffer,
            instance: None,
            bones: None,
            material: None,
            composite: false,
        };
        bind_sets(device, cmd, &mut self.cache, key, FULLSCREEN_CONTEXT, &ctx)?;

        unsafe {
            device.device.cmd_draw(cmd, 3, 1, 0, 0);
        }
        Ok(())
    }

    fn blit_to_swapchain(
        &self,
        device: &Device,
        cmd: vk::CommandBuffer,
        swapchain_image: vk::Image,
        swapchain_extent: vk::Extent2D,
    ) {
        device.transition_image(
            cmd,
            self.targets.composite.image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        device.transition_image(
            cmd,
            swapchain_image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );

        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let blit = vk::ImageBlit {
            src_subresource: subresource,
            src_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: self.targets.extent.width as i32,
                    y: self.targets.extent.height as i32,
                    z: 1,
                },
            ],
            dst_subresource: subresource,
            dst_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: swapchain_extent.width as i32,
                    y: swapchain_extent.height as i32,
                    z: 1,
                },
            ],
        };
        unsafe {
            device.device.cmd_blit_image(
                cmd,
                self.targets.composite.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                swapchain_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );
        }

        device.transition_image(
            cmd,
            swapchain_image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        // The GUI samples the composite target after the frame; leave it in
        // the layout its descriptor writes declare.
        device.transition_image(
            cmd,
            self.targets.composite.image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
    }
}

impl Renderer for GameRenderer {
    fn set_lighting_package(&mut self, package: Arc<ShaderPackage>) {
        self.lighting_package = Some(package);
    }

    fn record(
        &mut self,
        device: &Device,
        cmd: vk::CommandBuffer,
        swapchain_image: vk::Image,
        _swapchain_view: vk::ImageView,
        swapchain_extent: vk::Extent2D,
        draw_list: &mut DrawList,
        camera: &CameraState,
    ) -> RenderResult<()> {
        self.upload_frame_parameters(device, draw_list, camera)?;
        let extent = self.targets.extent;

        // Fresh layouts every frame; previous contents are never reused
        // across frames, so UNDEFINED is a valid source everywhere here.
        let color_targets: Vec<vk::Image> = std::iter::once(self.targets.z_color.image)
            .chain(self.targets.gbuffer.iter().map(|t| t.image))
            .chain([
                self.targets.view_position.image,
                self.targets.light_diffuse.image,
                self.targets.light_specular.image,
                self.targets.composite.image,
            ])
            .collect();
        for image in color_targets {
            device.transition_image(
                cmd,
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            );
        }
        device.transition_image(
            cmd,
            self.targets.depth.image,
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        );

        // Z-opaque: depth pre-pass.
        begin_pass(
            device,
            cmd,
            extent,
            &[&self.targets.z_color],
            true,
            Some((&self.targets.depth, true)),
        );
        self.draw_geometry(device, cmd, draw_list, PassName::ZOpaque)?;
        end_pass(device, cmd);

        // G-opaque: attribute fill, depth carried over from the Z pass.
        {
            let gbuffer: Vec<&Texture> = self.targets.gbuffer.iter().collect();
            begin_pass(
                device,
                cmd,
                extent,
                &gbuffer,
                true,
                Some((&self.targets.depth, false)),
            );
        }
        self.draw_geometry(device, cmd, draw_list, PassName::GOpaque)?;
        end_pass(device, cmd);

        // G-buffer and depth become shader inputs for the lighting chain.
        for texture in &self.targets.gbuffer {
            device.transition_image(
                cmd,
                texture.image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        }
        device.transition_image(
            cmd,
            self.targets.depth.image,
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );

        // View-space position reconstruction; no depth attachment at all.
        begin_pass(device, cmd, extent, &[&self.targets.view_position], true, None);
        self.draw_fullscreen(device, cmd, PassName::LightingOpaqueViewPosition)?;
        end_pass(device, cmd);
        device.transition_image(
            cmd,
            self.targets.view_position.image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );

        // Light accumulation into diffuse and specular targets.
        begin_pass(
            device,
            cmd,
            extent,
            &[&self.targets.light_diffuse, &self.targets.light_specular],
            true,
            None,
        );
        self.draw_fullscreen(device, cmd, PassName::LightingOpaque)?;
        end_pass(device, cmd);
        for texture in [&self.targets.light_diffuse, &self.targets.light_specular] {
            device.transition_image(
                cmd,
                texture.image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        }

        // Depth returns to attachment duty for the composite pass.
        device.transition_image(
            cmd,
            self.targets.depth.image,
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        );

        // Composite: full-screen resolve, then semi-transparent geometry
        // blended on top with depth testing but no depth writes.
        begin_pass(
            device,
            cmd,
            extent,
            &[&self.targets.composite],
            true,
            Some((&self.targets.depth, false)),
        );
        self.draw_fullscreen(device, cmd, PassName::CompositeSemiTransparency)?;
        self.draw_geometry(device, cmd, draw_list, PassName::CompositeSemiTransparency)?;
        end_pass(device, cmd);

        self.blit_to_swapchain(device, cmd, swapchain_image, swapchain_extent);
        Ok(())
    }

    fn resize(&mut self, device: &Device, extent: vk::Extent2D) -> RenderResult<()> {
        self.targets.destroy(device);
        self.targets = RenderTargets::new(device, extent)?;
        // The dropped sets referenced the old attachments.
        self.cache.invalidate_descriptor_sets();
        Ok(())
    }

    fn composite(&self) -> Option<&Texture> {
        Some(&self.targets.composite)
    }

    fn destroy(&mut self, device: &Device) {
        self.cache.destroy(device);
        self.targets.destroy(device);
        self.dummies.destroy(device);
        self.camera_buffer.destroy(device);
        self.common_buffer.destroy(device);
        self.light_buffer.destroy(device);
        self.ambient_buffer.destroy(device);
        self.model_buffer.destroy(device);
        for buffer in &mut self.instance_buffers {
            buffer.destroy(device);
        }
        self.instance_buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_context_separates_slots_and_materials() {
        let a = descriptor_context(0, 0xAB);
        let b = descriptor_context(1, 0xAB);
        let c = descriptor_context(0, 0xCD);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, descriptor_context(0, 0xAB));
        assert_ne!(a, FULLSCREEN_CONTEXT);
    }
}
