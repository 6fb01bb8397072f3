//! Owning wrapper for a Vulkan image, its view and backing allocation.

use ash::vk;
use gpu_allocator::vulkan::Allocation;

use crate::device::Device;

/// A GPU image plus its default view and memory. Single, explicit ownership;
/// teardown order is view, then image, then allocation.
pub struct Texture {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub(crate) allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub aspect: vk::ImageAspectFlags,
}

impl Default for Texture {
    /// An unallocated placeholder; valid only as a slot to be replaced.
    fn default() -> Self {
        Self {
            image: vk::Image::null(),
            view: vk::ImageView::null(),
            allocation: None,
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D {
                width: 0,
                height: 0,
            },
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }
}

impl Texture {
    pub fn destroy(&mut self, device: &Device) {
        unsafe {
            if self.view != vk::ImageView::null() {
                device.device.destroy_image_view(self.view, None);
                self.view = vk::ImageView::null();
            }
            if self.image != vk::Image::null() {
                device.device.destroy_image(self.image, None);
                self.image = vk::Image::null();
            }
        }
        if let Some(allocation) = self.allocation.take() {
            let _ = device.allocator().lock().free(allocation);
        }
    }
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    if is_depth_format(format) {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats_select_depth_aspect() {
        assert_eq!(
            aspect_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_format(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
    }
}
