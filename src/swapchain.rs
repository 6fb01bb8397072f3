//! Presentation surface images and per-frame synchronization.
//!
//! The swapchain owns its images/views and three frames worth of sync
//! objects. On resize the owner destroys the current object and builds a new
//! one; a `Swapchain` is never resized in place.

use ash::khr::swapchain;
use ash::vk;

use crate::device::Device;
use crate::error::{RenderError, RenderResult};

pub const FRAMES_IN_FLIGHT: usize = 3;

/// Cycles the frame-in-flight slot 0,1,2,0,1,2,…
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameTracker {
    index: usize,
}

impl FrameTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> usize {
        self.index
    }

    pub fn advance(&mut self) {
        self.index = (self.index + 1) % FRAMES_IN_FLIGHT;
    }
}

/// Per-slot synchronization primitives.
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

pub struct Swapchain {
    swapchain_fn: swapchain::Device,
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    frames: Vec<FrameSync>,
    tracker: FrameTracker,
}

impl Swapchain {
    pub fn new(device: &Device, width: u32, height: u32, vsync: bool) -> RenderResult<Self> {
        unsafe {
            let capabilities = device
                .surface_fn
                .get_physical_device_surface_capabilities(device.physical_device, device.surface)
                .map_err(|e| RenderError::SwapchainCreation(format!("{e:?}")))?;
            let formats = device
                .surface_fn
                .get_physical_device_surface_formats(device.physical_device, device.surface)
                .map_err(|e| RenderError::SwapchainCreation(format!("{e:?}")))?;
            let present_modes = device
                .surface_fn
                .get_physical_device_surface_present_modes(device.physical_device, device.surface)
                .map_err(|e| RenderError::SwapchainCreation(format!("{e:?}")))?;

            let format = formats
                .iter()
                .find(|f| {
                    f.format == vk::Format::B8G8R8A8_SRGB
                        && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
                .unwrap_or(&formats[0]);

            let present_mode = if vsync {
                vk::PresentModeKHR::FIFO
            } else {
                present_modes
                    .iter()
                    .copied()
                    .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                    .unwrap_or(vk::PresentModeKHR::FIFO)
            };

            let extent = if capabilities.current_extent.width != u32::MAX {
                capabilities.current_extent
            } else {
                vk::Extent2D {
                    width: width.clamp(
                        capabilities.min_image_extent.width,
                        capabilities.max_image_extent.width,
                    ),
                    height: height.clamp(
                        capabilities.min_image_extent.height,
                        capabilities.max_image_extent.height,
                    ),
                }
            };

            let image_count = (capabilities.min_image_count + 1).min(
                if capabilities.max_image_count > 0 {
                    capabilities.max_image_count
                } else {
                    u32::MAX
                },
            );

            let info = vk::SwapchainCreateInfoKHR::default()
                .surface(device.surface)
                .min_image_count(image_count)
                .image_format(format.format)
                .image_color_space(format.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                // Composite is blitted into the swapchain image for
                // presentation, so TRANSFER_DST is required.
                .image_usage(
                    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
                )
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(capabilities.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(present_mode)
                .clipped(true);

            let swapchain_fn = swapchain::Device::new(&device.instance, &device.device);
            let handle = swapchain_fn
                .create_swapchain(&info, None)
                .map_err(|e| RenderError::SwapchainCreation(format!("{e:?}")))?;
            let images = swapchain_fn
                .get_swapchain_images(handle)
                .map_err(|e| RenderError::SwapchainCreation(format!("{e:?}")))?;

            let views = images
                .iter()
                .map(|&image| {
                    let view_info = vk::ImageViewCreateInfo::default()
                        .image(image)
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(format.format)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        });
                    device.device.create_image_view(&view_info, None)
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| RenderError::SwapchainCreation(format!("views: {e:?}")))?;

            let mut frames = Vec::with_capacity(FRAMES_IN_FLIGHT);
            let semaphore_info = vk::SemaphoreCreateInfo::default();
            let fence_info =
                vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            for _ in 0..FRAMES_IN_FLIGHT {
                frames.push(FrameSync {
                    image_available: device
                        .device
                        .create_semaphore(&semaphore_info, None)
                        .map_err(|e| RenderError::SwapchainCreation(format!("{e:?}")))?,
                    render_finished: device
                        .device
                        .create_semaphore(&semaphore_info, None)
                        .map_err(|e| RenderError::SwapchainCreation(format!("{e:?}")))?,
                    in_flight: device
                        .device
                        .create_fence(&fence_info, None)
                        .map_err(|e| RenderError::SwapchainCreation(format!("{e:?}")))?,
                });
            }

            Ok(Self {
                swapchain_fn,
                swapchain: handle,
                images,
                views,
                format: format.format,
                extent,
                frames,
                tracker: FrameTracker::new(),
            })
        }
    }

    pub fn frame_slot(&self) -> usize {
        self.tracker.current()
    }

    pub fn current_sync(&self) -> &FrameSync {
        &self.frames[self.tracker.current()]
    }

    /// Wait for the current slot's fence, then acquire the next image.
    /// `ERROR_OUT_OF_DATE_KHR` maps to [`RenderError::SurfaceOutOfDate`]; the
    /// caller skips the frame and retries next tick.
    ///
    /// The fence stays signaled here. [`Self::submit_and_present`] resets it
    /// once a submit is certain, so a frame abandoned between acquire and
    /// submit (a failed recording, say) leaves the slot immediately
    /// reusable instead of deadlocking the next wait on it.
    pub fn acquire(&mut self, device: &Device) -> RenderResult<u32> {
        let sync = &self.frames[self.tracker.current()];
        unsafe {
            device
                .device
                .wait_for_fences(&[sync.in_flight], true, u64::MAX)
                .map_err(|e| RenderError::AcquireImageFailed(format!("{e:?}")))?;

            let (image_index, _suboptimal) = self
                .swapchain_fn
                .acquire_next_image(
                    self.swapchain,
                    u64::MAX,
                    sync.image_available,
                    vk::Fence::null(),
                )
                .map_err(|e| match e {
                    vk::Result::ERROR_OUT_OF_DATE_KHR => RenderError::SurfaceOutOfDate,
                    other => RenderError::AcquireImageFailed(format!("{other:?}")),
                })?;

            Ok(image_index)
        }
    }

    /// Submit the recorded command buffer for this frame and present, then
    /// advance the frame slot.
    pub fn submit_and_present(
        &mut self,
        device: &Device,
        cmd: vk::CommandBuffer,
        image_index: u32,
    ) -> RenderResult<()> {
        let sync = &self.frames[self.tracker.current()];
        unsafe {
            let wait_semaphores = [sync.image_available];
            let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            let signal_semaphores = [sync.render_finished];
            let cmds = [cmd];

            let submit = vk::SubmitInfo::default()
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .command_buffers(&cmds)
                .signal_semaphores(&signal_semaphores);

            device
                .device
                .reset_fences(&[sync.in_flight])
                .map_err(|e| RenderError::Submission(format!("{e:?}")))?;
            device
                .device
                .queue_submit(device.graphics_queue, &[submit], sync.in_flight)
                .map_err(|e| match e {
                    vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost,
                    other => RenderError::Submission(format!("{other:?}")),
                })?;

            let swapchains = [self.swapchain];
            let indices = [image_index];
            let present = vk::PresentInfoKHR::default()
                .wait_semaphores(&signal_semaphores)
                .swapchains(&swapchains)
                .image_indices(&indices);

            match self
                .swapchain_fn
                .queue_present(device.graphics_queue, &present)
            {
                Ok(_) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {}
                Err(e) => return Err(RenderError::PresentFailed(format!("{e:?}"))),
            }
        }
        self.tracker.advance();
        Ok(())
    }

    pub fn destroy(&mut self, device: &Device) {
        unsafe {
            for frame in self.frames.drain(..) {
                device.device.destroy_semaphore(frame.image_available, None);
                device.device.destroy_semaphore(frame.render_finished, None);
                device.device.destroy_fence(frame.in_flight, None);
            }
            for view in self.views.drain(..) {
                device.device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_fn.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_tracker_cycles_modulo_three() {
        let mut tracker = FrameTracker::new();
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(tracker.current());
            tracker.advance();
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }
}
