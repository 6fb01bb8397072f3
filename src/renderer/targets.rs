//! Intermediate render targets for the deferred pass chain, plus the shared
//! dummy resources unresolved bindings fall back to.

use ash::vk;

use crate::device::{Buffer, Device, Texture};
use crate::error::RenderResult;

pub const GBUFFER_LAYERS: usize = 5;
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
pub const GBUFFER_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
pub const LIGHT_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const COMPOSITE_FORMAT: vk::Format = vk::Format::B8G8R8A8_SRGB;

const COLOR_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw() | vk::ImageUsageFlags::SAMPLED.as_raw(),
);

/// All resize-sensitive attachments. Recreated wholesale on resize; the
/// pipeline cache's descriptor sets are invalidated at the same time since
/// they reference these images.
pub struct RenderTargets {
    pub extent: vk::Extent2D,
    pub depth: Texture,
    pub z_color: Texture,
    pub gbuffer: Vec<Texture>,
    pub view_position: Texture,
    pub light_diffuse: Texture,
    pub light_specular: Texture,
    pub composite: Texture,
}

impl RenderTargets {
    pub fn new(device: &Device, extent: vk::Extent2D) -> RenderResult<RenderTargets> {
        let (w, h) = (extent.width.max(1), extent.height.max(1));
        let mut gbuffer = Vec::with_capacity(GBUFFER_LAYERS);
        for layer in 0..GBUFFER_LAYERS {
            gbuffer.push(device.create_texture(
                w,
                h,
                GBUFFER_FORMAT,
                COLOR_USAGE,
                &format!("gbuffer{layer}"),
            )?);
        }
        Ok(RenderTargets {
            extent: vk::Extent2D { width: w, height: h },
            depth: device.create_texture(
                w,
                h,
                DEPTH_FORMAT,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                "depth",
            )?,
            z_color: device.create_texture(w, h, GBUFFER_FORMAT, COLOR_USAGE, "z_color")?,
            gbuffer,
            view_position: device.create_texture(w, h, LIGHT_FORMAT, COLOR_USAGE, "view_position")?,
            light_diffuse: device.create_texture(w, h, LIGHT_FORMAT, COLOR_USAGE, "light_diffuse")?,
            light_specular: device.create_texture(
                w,
                h,
                LIGHT_FORMAT,
                COLOR_USAGE,
                "light_specular",
            )?,
            composite: device.create_texture(
                w,
                h,
                COMPOSITE_FORMAT,
                COLOR_USAGE | vk::ImageUsageFlags::TRANSFER_SRC,
                "composite",
            )?,
        })
    }

    pub fn destroy(&mut self, device: &Device) {
        self.depth.destroy(device);
        self.z_color.destroy(device);
        for texture in &mut self.gbuffer {
            texture.destroy(device);
        }
        self.view_position.destroy(device);
        self.light_diffuse.destroy(device);
        self.light_specular.destroy(device);
        self.composite.destroy(device);
    }
}

/// Fallbacks bound wherever a shader asks for something the renderer cannot
/// resolve: a small zeroed uniform buffer, a 1x1 opaque grey texture and a
/// default sampler. Rendering degrades instead of failing.
pub struct DummyResources {
    pub buffer: Buffer,
    pub texture: Texture,
    pub sampler: vk::Sampler,
}

impl DummyResources {
    pub fn new(device: &Device) -> RenderResult<DummyResources> {
        let mut buffer =
            device.create_buffer(256, vk::BufferUsageFlags::UNIFORM_BUFFER, "dummy")?;
        buffer.write(0, &[0u8; 256]);
        buffer.flush(device)?;
        let texture = device.upload_texture(
            1,
            1,
            vk::Format::R8G8B8A8_UNORM,
            &[128, 128, 128, 255],
            "dummy",
        )?;
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe {
            device
                .device
                .create_sampler(&sampler_info, None)
                .map_err(|e| crate::error::RenderError::Initialization(format!("sampler: {e:?}")))?
        };
        Ok(DummyResources {
            buffer,
            texture,
            sampler,
        })
    }

    pub fn destroy(&mut self, device: &Device) {
        self.buffer.destroy(device);
        self.texture.destroy(device);
        unsafe {
            device.device.destroy_sampler(self.sampler, None);
        }
    }
}
