//! Renderer selection and the top-level render system facade.
//!
//! Two renderers exist behind one trait: the full game-shader path
//! ([`game::GameRenderer`]) that reflects translated shader packages and
//! runs the deferred pass chain, and the legacy simple path
//! ([`simple::SimpleRenderer`]) with fixed shaders, kept for debugging asset
//! ingestion without the package machinery. An environment variable picks
//! which one a [`RenderSystem`] instantiates.

pub mod game;
pub mod simple;
pub mod targets;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::device::{Device, Texture};
use crate::error::{RenderError, RenderResult};
use crate::model::draw_object::DrawList;
use crate::model::{ModelData, SkeletonData};
use crate::swapchain::{Swapchain, FRAMES_IN_FLIGHT};

/// Startup switches read from the environment. These select which renderer
/// variant runs and whether the driver's validation layer is loaded; they do
/// not change behavior after startup.
#[derive(Debug, Clone, Copy)]
pub struct RendererConfig {
    pub use_simple_renderer: bool,
    pub enable_validation: bool,
    pub vsync: bool,
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes")
    )
}

impl RendererConfig {
    pub fn from_env() -> RendererConfig {
        RendererConfig {
            use_simple_renderer: env_flag("INSPECTOR_SIMPLE_RENDERER"),
            enable_validation: env_flag("INSPECTOR_VK_VALIDATION"),
            vsync: !env_flag("INSPECTOR_NO_VSYNC"),
        }
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        RendererConfig {
            use_simple_renderer: false,
            enable_validation: false,
            vsync: true,
        }
    }
}

/// Camera block as the shaders declare it.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct CameraParameter {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    pub eye: Vec4,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct InstanceParameter {
    pub world: Mat4,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct CommonParameter {
    /// (width, height, 1/width, 1/height)
    pub screen: Vec4,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct LightParameter {
    pub direction: Vec4,
    pub diffuse: Vec4,
    pub specular: Vec4,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct AmbientParameter {
    pub color: Vec4,
}

/// CPU-side camera state; uploaded once per frame.
#[derive(Debug, Clone, Copy)]
pub struct CameraState {
    pub view: Mat4,
    pub projection: Mat4,
    pub eye: Vec3,
}

impl CameraState {
    pub fn look_at(eye: Vec3, target: Vec3, aspect: f32) -> CameraState {
        CameraState {
            view: Mat4::look_at_rh(eye, target, Vec3::Y),
            projection: Mat4::perspective_rh(45f32.to_radians(), aspect, 0.05, 1000.0),
            eye,
        }
    }

    pub fn parameter(&self) -> CameraParameter {
        CameraParameter {
            view: self.view,
            projection: self.projection,
            view_projection: self.projection * self.view,
            eye: self.eye.extend(1.0),
        }
    }
}

impl Default for CameraState {
    fn default() -> Self {
        CameraState::look_at(Vec3::new(0.0, 1.0, 3.0), Vec3::new(0.0, 1.0, 0.0), 16.0 / 9.0)
    }
}

/// What both renderer variants provide to the frame loop.
pub trait Renderer {
    /// Record one frame into `cmd`, ending with the presented image in
    /// `PRESENT_SRC` layout.
    fn record(
        &mut self,
        device: &Device,
        cmd: vk::CommandBuffer,
        swapchain_image: vk::Image,
        swapchain_view: vk::ImageView,
        swapchain_extent: vk::Extent2D,
        draw_list: &mut DrawList,
        camera: &CameraState,
    ) -> RenderResult<()>;

    fn resize(&mut self, device: &Device, extent: vk::Extent2D) -> RenderResult<()>;

    /// Install the package holding the full-screen lighting shaders. The
    /// simple renderer has no use for one and ignores it.
    fn set_lighting_package(&mut self, _package: std::sync::Arc<crate::shader::ShaderPackage>) {}

    /// Composite target for the GUI to sample into its own compositing pass.
    /// The simple renderer draws straight to the swapchain and has none.
    fn composite(&self) -> Option<&Texture>;

    fn destroy(&mut self, device: &Device);
}

/// Owns the device, swapchain, active renderer and scene; this is the
/// boundary the GUI layers talk to.
pub struct RenderSystem {
    pub device: Device,
    swapchain: Swapchain,
    renderer: Box<dyn Renderer>,
    draw_list: DrawList,
    pub camera: CameraState,
    command_buffers: Vec<vk::CommandBuffer>,
    vsync: bool,
}

impl RenderSystem {
    pub fn new(window: &winit::window::Window, config: RendererConfig) -> RenderResult<RenderSystem> {
        let size = window.inner_size();
        let device = Device::new(window, config.enable_validation)?;
        let swapchain = Swapchain::new(&device, size.width, size.height, config.vsync)?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(device.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(FRAMES_IN_FLIGHT as u32);
        let command_buffers = unsafe {
            device
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| RenderError::Initialization(format!("command buffers: {e:?}")))?
        };

        let renderer: Box<dyn Renderer> = if config.use_simple_renderer {
            log::info!("simple renderer selected");
            Box::new(simple::SimpleRenderer::new(swapchain.format))
        } else {
            log::info!("game-shader renderer selected");
            Box::new(game::GameRenderer::new(&device, swapchain.extent)?)
        };

        Ok(RenderSystem {
            device,
            swapchain,
            renderer,
            draw_list: DrawList {
                legacy_renderer: config.use_simple_renderer,
                ..DrawList::default()
            },
            camera: CameraState::default(),
            command_buffers,
            vsync: config.vsync,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_model(
        &mut self,
        name: &str,
        model: ModelData,
        skinned: bool,
        transform: Mat4,
        lod: usize,
        from_body: u16,
        to_body: u16,
    ) -> RenderResult<()> {
        self.draw_list
            .add_model(&self.device, name, model, skinned, transform, lod, from_body, to_body)
            .map(|_| ())
    }

    pub fn remove_model(&mut self, name: &str) {
        self.device.wait_idle();
        self.draw_list.remove_model(&self.device, name);
    }

    pub fn reload_model(&mut self, name: &str, lod: usize) -> RenderResult<()> {
        self.device.wait_idle();
        self.draw_list.reload_model(&self.device, name, lod)
    }

    pub fn clear(&mut self) {
        self.device.wait_idle();
        self.draw_list.clear(&self.device);
    }

    pub fn set_skeleton(&mut self, skeleton: SkeletonData) {
        self.draw_list.set_skeleton(skeleton);
    }

    pub fn composite_texture(&self) -> Option<&Texture> {
        self.renderer.composite()
    }

    pub fn set_lighting_package(&mut self, package: std::sync::Arc<crate::shader::ShaderPackage>) {
        self.renderer.set_lighting_package(package);
    }

    /// Render and present one frame. An out-of-date surface skips the frame
    /// without touching any state; the next tick retries.
    pub fn render_frame(&mut self) -> RenderResult<()> {
        let image_index = match self.swapchain.acquire(&self.device) {
            Ok(index) => index,
            Err(RenderError::SurfaceOutOfDate) => {
                log::debug!("surface out of date, skipping frame");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let cmd = self.command_buffers[self.swapchain.frame_slot()];
        unsafe {
            self.device
                .device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(|e| RenderError::Submission(format!("{e:?}")))?;
            self.device
                .device
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())
                .map_err(|e| RenderError::Submission(format!("{e:?}")))?;
        }

        self.renderer.record(
            &self.device,
            cmd,
            self.swapchain.images[image_index as usize],
            self.swapchain.views[image_index as usize],
            self.swapchain.extent,
            &mut self.draw_list,
            &self.camera,
        )?;

        unsafe {
            self.device
                .device
                .end_command_buffer(cmd)
                .map_err(|e| RenderError::Submission(format!("{e:?}")))?;
        }

        self.swapchain.submit_and_present(&self.device, cmd, image_index)
    }

    /// Recreate the swapchain and resize-sensitive targets.
    pub fn resize(&mut self, width: u32, height: u32) -> RenderResult<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.device.wait_idle();
        self.swapchain.destroy(&self.device);
        self.swapchain = Swapchain::new(&self.device, width, height, self.vsync)?;
        self.renderer.resize(&self.device, self.swapchain.extent)
    }
}

impl Drop for RenderSystem {
    fn drop(&mut self) {
        self.device.wait_idle();
        self.draw_list.clear(&self.device);
        self.renderer.destroy(&self.device);
        self.swapchain.destroy(&self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_parameter_combines_view_and_projection() {
        let camera = CameraState::default();
        let parameter = camera.parameter();
        assert_eq!(parameter.view_projection, camera.projection * camera.view);
        assert_eq!(parameter.eye.w, 1.0);
    }

    #[test]
    fn parameter_blocks_are_densely_packed() {
        assert_eq!(std::mem::size_of::<CameraParameter>(), 3 * 64 + 16);
        assert_eq!(std::mem::size_of::<InstanceParameter>(), 64);
        assert_eq!(std::mem::size_of::<LightParameter>(), 48);
    }
}
