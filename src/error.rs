//! Render-core error type
//!
//! Every Vulkan call site maps its result into [`RenderError`] and propagates
//! it; there is no abort path. The GUI host decides whether a failed
//! initialization is fatal.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("failed to initialize renderer: {0}")]
    Initialization(String),
    #[error("failed to create surface: {0}")]
    SurfaceCreation(String),
    #[error("failed to create device: {0}")]
    DeviceCreation(String),
    #[error("failed to create swapchain: {0}")]
    SwapchainCreation(String),
    #[error("GPU memory allocation failed: {0}")]
    Allocation(String),
    #[error("failed to create buffer: {0}")]
    BufferCreation(String),
    #[error("failed to create texture: {0}")]
    TextureCreation(String),
    #[error("failed to create shader module: {0}")]
    ShaderCreation(String),
    #[error("shader reflection failed: {0}")]
    Reflection(String),
    #[error("failed to create pipeline: {0}")]
    PipelineCreation(String),
    #[error("failed to allocate descriptor set: {0}")]
    DescriptorAllocation(String),
    #[error("command submission failed: {0}")]
    Submission(String),
    #[error("failed to acquire swapchain image: {0}")]
    AcquireImageFailed(String),
    #[error("failed to present: {0}")]
    PresentFailed(String),
    /// The surface no longer matches the swapchain. The frame is skipped and
    /// the caller retries after recreating the swapchain on the next tick.
    #[error("surface out of date")]
    SurfaceOutOfDate,
    #[error("device lost")]
    DeviceLost,
}

pub type RenderResult<T> = Result<T, RenderError>;
