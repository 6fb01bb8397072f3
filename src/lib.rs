//! Vulkan rendering core for a game asset inspection suite.
//!
//! The crate renders parsed game models with their original (translated)
//! shaders through a deferred pass chain: depth pre-pass, G-buffer fill,
//! view-position reconstruction, light accumulation and a final composite
//! with semi-transparent geometry blended on top. Shader packages are
//! reflected with SPIR-V reflection to derive descriptor layouts, and a
//! content-keyed pipeline cache reuses GPU objects across draw objects.
//!
//! Entry point is [`renderer::RenderSystem`]: it owns the device, the
//! swapchain and the active draw list, and exposes the draw-submission API
//! the GUI layers consume.

pub mod device;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod renderer;
pub mod shader;
pub mod swapchain;

pub use device::{Buffer, Device, Texture};
pub use error::{RenderError, RenderResult};
pub use model::draw_object::{DrawList, DrawObject, DrawObjectCache, DrawObjectInstance};
pub use model::{MaterialData, ModelData, SkeletonData};
pub use renderer::{CameraState, RenderSystem, Renderer, RendererConfig};
pub use shader::ShaderPackage;
