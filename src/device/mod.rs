//! Vulkan device and resource layer.
//!
//! Owns the instance, physical/logical device, queues, command pool and the
//! descriptor pools. Allocates buffers and images through `gpu-allocator`,
//! performs blocking transfer uploads through one-shot command buffers, and
//! records image layout transitions. One `Device` exists per application and
//! all GPU work is recorded on the thread that owns it.

pub mod buffer;
pub mod texture;

pub use buffer::Buffer;
pub use texture::Texture;

use std::ffi::{c_void, CStr};
use std::sync::Arc;

use ash::ext::debug_utils;
use ash::khr::{surface, swapchain};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::error::{RenderError, RenderResult};
use texture::aspect_for_format;

pub struct Device {
    _entry: ash::Entry,
    pub instance: ash::Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub surface_fn: surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    allocator: Option<Arc<Mutex<Allocator>>>,
    pub command_pool: vk::CommandPool,
    descriptor_pools: Mutex<Vec<vk::DescriptorPool>>,
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if data.is_null() || (*data).p_message.is_null() {
        "<no message>".into()
    } else {
        CStr::from_ptr((*data).p_message).to_string_lossy()
    };
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("vulkan: {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("vulkan: {message}");
    } else {
        log::debug!("vulkan: {message}");
    }
    vk::FALSE
}

impl Device {
    /// Create the instance, pick a graphics+present queue family, create the
    /// logical device (Vulkan 1.3, dynamic rendering) and the allocator.
    pub fn new(window: &winit::window::Window, enable_validation: bool) -> RenderResult<Self> {
        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| RenderError::Initialization(format!("vulkan loader: {e}")))?;

            let app_info = vk::ApplicationInfo::default()
                .application_name(c"Asset Inspector")
                .application_version(vk::make_api_version(0, 1, 0, 0))
                .engine_name(c"inspector-render")
                .engine_version(vk::make_api_version(0, 0, 1, 0))
                .api_version(vk::API_VERSION_1_3);

            let display_handle = window
                .display_handle()
                .map_err(|e| RenderError::Initialization(e.to_string()))?;
            let window_handle = window
                .window_handle()
                .map_err(|e| RenderError::Initialization(e.to_string()))?;

            let mut extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
                .map_err(|e| RenderError::Initialization(e.to_string()))?
                .to_vec();
            if enable_validation {
                extensions.push(debug_utils::NAME.as_ptr());
            }

            let layers = if enable_validation {
                vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
            } else {
                Vec::new()
            };

            let instance_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_layer_names(&layers)
                .enabled_extension_names(&extensions);

            let instance = entry
                .create_instance(&instance_info, None)
                .map_err(|e| RenderError::Initialization(format!("instance: {e:?}")))?;

            let debug = if enable_validation {
                let loader = debug_utils::Instance::new(&entry, &instance);
                let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                    .message_severity(
                        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                    )
                    .message_type(
                        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                    )
                    .pfn_user_callback(Some(debug_callback));
                let messenger = loader
                    .create_debug_utils_messenger(&info, None)
                    .map_err(|e| RenderError::Initialization(format!("debug messenger: {e:?}")))?;
                Some((loader, messenger))
            } else {
                None
            };

            let surface_fn = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| RenderError::SurfaceCreation(e.to_string()))?;

            let physical_devices = instance
                .enumerate_physical_devices()
                .map_err(|e| RenderError::Initialization(e.to_string()))?;

            let (physical_device, graphics_queue_family) = physical_devices
                .into_iter()
                .find_map(|pd| {
                    Self::find_queue_family(&instance, pd, &surface_fn, surface)
                        .map(|family| (pd, family))
                })
                .ok_or_else(|| {
                    RenderError::Initialization("no suitable physical device".into())
                })?;

            let properties = instance.get_physical_device_properties(physical_device);
            log::info!(
                "using GPU: {}",
                CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy()
            );

            let queue_priorities = [1.0_f32];
            let queue_info = vk::DeviceQueueCreateInfo::default()
                .queue_family_index(graphics_queue_family)
                .queue_priorities(&queue_priorities);
            let queue_infos = [queue_info];

            let device_extensions = [swapchain::NAME.as_ptr()];
            let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(true);
            let mut features13 =
                vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);

            let device_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_infos)
                .enabled_extension_names(&device_extensions)
                .enabled_features(&features)
                .push_next(&mut features13);

            let device = instance
                .create_device(physical_device, &device_info, None)
                .map_err(|e| RenderError::DeviceCreation(format!("{e:?}")))?;

            let graphics_queue = device.get_device_queue(graphics_queue_family, 0);

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .map_err(|e| RenderError::Initialization(format!("allocator: {e}")))?;

            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(graphics_queue_family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            let command_pool = device
                .create_command_pool(&pool_info, None)
                .map_err(|e| RenderError::DeviceCreation(format!("command pool: {e:?}")))?;

            let descriptor_pool = Self::create_descriptor_pool(&device)?;

            Ok(Self {
                _entry: entry,
                instance,
                debug,
                surface_fn,
                surface,
                physical_device,
                device,
                graphics_queue,
                graphics_queue_family,
                allocator: Some(Arc::new(Mutex::new(allocator))),
                command_pool,
                descriptor_pools: Mutex::new(vec![descriptor_pool]),
            })
        }
    }

    fn find_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<u32> {
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        families.iter().enumerate().find_map(|(index, family)| {
            let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let present = unsafe {
                surface_fn
                    .get_physical_device_surface_support(physical_device, index as u32, surface)
                    .unwrap_or(false)
            };
            (graphics && present).then_some(index as u32)
        })
    }

    fn create_descriptor_pool(device: &ash::Device) -> RenderResult<vk::DescriptorPool> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 2048,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 2048,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: 2048,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: 256,
            },
        ];
        let info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(1024);
        unsafe {
            device
                .create_descriptor_pool(&info, None)
                .map_err(|e| RenderError::Initialization(format!("descriptor pool: {e:?}")))
        }
    }

    pub(crate) fn allocator(&self) -> &Mutex<Allocator> {
        self.allocator.as_ref().expect("allocator already dropped")
    }

    /// Allocate a descriptor set, growing the pool list when the current
    /// pool is exhausted.
    pub fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> RenderResult<vk::DescriptorSet> {
        let layouts = [layout];
        let mut pools = self.descriptor_pools.lock();
        let current = *pools.last().expect("descriptor pool list is never empty");
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(current)
            .set_layouts(&layouts);
        match unsafe { self.device.allocate_descriptor_sets(&info) } {
            Ok(sets) => Ok(sets[0]),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                let new_pool = Self::create_descriptor_pool(&self.device)?;
                pools.push(new_pool);
                log::info!("descriptor pool exhausted, created pool #{}", pools.len());
                let retry = vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(new_pool)
                    .set_layouts(&layouts);
                unsafe {
                    self.device
                        .allocate_descriptor_sets(&retry)
                        .map(|sets| sets[0])
                        .map_err(|e| RenderError::DescriptorAllocation(format!("{e:?}")))
                }
            }
            Err(e) => Err(RenderError::DescriptorAllocation(format!("{e:?}"))),
        }
    }

    /// Allocate a host-visible buffer. Every dynamic buffer in the tool goes
    /// through this path; there is no device-local staging variant for
    /// buffers.
    pub fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        label: &str,
    ) -> RenderResult<Buffer> {
        let info = vk::BufferCreateInfo::default()
            .size(size.max(4))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe {
            self.device
                .create_buffer(&info, None)
                .map_err(|e| RenderError::BufferCreation(format!("{label}: {e:?}")))?
        };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation = self
            .allocator()
            .lock()
            .allocate(&AllocationCreateDesc {
                name: label,
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| RenderError::Allocation(format!("{label}: {e}")))?;
        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .map_err(|e| RenderError::BufferCreation(format!("{label}: bind: {e:?}")))?;
        }
        Ok(Buffer {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Allocate a device-local image plus a default view. Depth-usage
    /// formats select the depth aspect, everything else the color aspect.
    pub fn create_texture(
        &self,
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        label: &str,
    ) -> RenderResult<Texture> {
        let extent = vk::Extent2D { width, height };
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);
        let image = unsafe {
            self.device
                .create_image(&info, None)
                .map_err(|e| RenderError::TextureCreation(format!("{label}: {e:?}")))?
        };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = self
            .allocator()
            .lock()
            .allocate(&AllocationCreateDesc {
                name: label,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| RenderError::Allocation(format!("{label}: {e}")))?;
        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .map_err(|e| RenderError::TextureCreation(format!("{label}: bind: {e:?}")))?;
        }

        let aspect = aspect_for_format(format);
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe {
            self.device
                .create_image_view(&view_info, None)
                .map_err(|e| RenderError::TextureCreation(format!("{label}: view: {e:?}")))?
        };

        Ok(Texture {
            image,
            view,
            allocation: Some(allocation),
            format,
            extent,
            aspect,
        })
    }

    /// Full upload path for game pixel data: staging buffer, copy, layout
    /// transitions, blocking queue wait. Uploads happen at asset-load time,
    /// outside the per-frame critical path, so the synchronous wait is fine.
    pub fn upload_texture(
        &self,
        width: u32,
        height: u32,
        format: vk::Format,
        pixels: &[u8],
        label: &str,
    ) -> RenderResult<Texture> {
        let texture = self.create_texture(
            width,
            height,
            format,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            label,
        )?;
        let mut staging = self.create_buffer(
            pixels.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            "staging",
        )?;
        staging.write(0, pixels);

        let result = self.one_shot_commands(|cmd| {
            self.transition_image(
                cmd,
                texture.image,
                texture.aspect,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: texture.aspect,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                },
            };
            unsafe {
                self.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    texture.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            self.transition_image(
                cmd,
                texture.image,
                texture.aspect,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        });
        staging.destroy(self);
        result?;
        Ok(texture)
    }

    /// Wrap raw SPIR-V bytes into a shader module.
    pub fn create_shader_module(&self, bytes: &[u8]) -> RenderResult<vk::ShaderModule> {
        let words = spv_words(bytes)?;
        let info = vk::ShaderModuleCreateInfo::default().code(&words);
        unsafe {
            self.device
                .create_shader_module(&info, None)
                .map_err(|e| RenderError::ShaderCreation(format!("{e:?}")))
        }
    }

    pub fn load_shader_from_disk(&self, path: &std::path::Path) -> RenderResult<vk::ShaderModule> {
        let bytes = std::fs::read(path)
            .map_err(|e| RenderError::ShaderCreation(format!("{}: {e}", path.display())))?;
        self.create_shader_module(&bytes)
    }

    /// Record a layout transition. Stage masks stay at ALL_COMMANDS.
    pub fn transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .src_access_mask(access_mask_for_layout(old_layout))
            .dst_access_mask(access_mask_for_layout(new_layout));
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    /// Record and synchronously submit a single-use command buffer.
    pub fn one_shot_commands(&self, record: impl FnOnce(vk::CommandBuffer)) -> RenderResult<()> {
        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = self
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| RenderError::Submission(format!("{e:?}")))?[0];

            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(cmd, &begin)
                .map_err(|e| RenderError::Submission(format!("{e:?}")))?;

            record(cmd);

            self.device
                .end_command_buffer(cmd)
                .map_err(|e| RenderError::Submission(format!("{e:?}")))?;

            let cmds = [cmd];
            let submit = vk::SubmitInfo::default().command_buffers(&cmds);
            let result = self
                .device
                .queue_submit(self.graphics_queue, &[submit], vk::Fence::null())
                .and_then(|_| self.device.queue_wait_idle(self.graphics_queue))
                .map_err(|e| match e {
                    vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost,
                    other => RenderError::Submission(format!("{other:?}")),
                });
            self.device.free_command_buffers(self.command_pool, &cmds);
            result
        }
    }

    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            // Allocator must go before the device.
            drop(self.allocator.take());
            for pool in self.descriptor_pools.lock().drain(..) {
                self.device.destroy_descriptor_pool(pool, None);
            }
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn access_mask_for_layout(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        _ => vk::AccessFlags::empty(),
    }
}

/// Reinterpret a SPIR-V byte blob as 32-bit words, validating alignment and
/// the magic number.
pub fn spv_words(bytes: &[u8]) -> RenderResult<Vec<u32>> {
    if bytes.len() < 4 || bytes.len() % 4 != 0 {
        return Err(RenderError::ShaderCreation(format!(
            "bytecode length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if words[0] != 0x0723_0203 {
        return Err(RenderError::ShaderCreation("bad SPIR-V magic".into()));
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spv_words_rejects_misaligned_and_bad_magic() {
        assert!(spv_words(&[1, 2, 3]).is_err());
        assert!(spv_words(&[0, 0, 0, 0]).is_err());
        let magic = 0x0723_0203_u32.to_le_bytes();
        let mut blob = magic.to_vec();
        blob.extend_from_slice(&[0; 4]);
        let words = spv_words(&blob).unwrap();
        assert_eq!(words[0], 0x0723_0203);
        assert_eq!(words.len(), 2);
    }
}
