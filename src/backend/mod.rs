// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with paired ownership of every GPU object
// Performance: Zero-cost abstractions, explicit control

pub mod buffer;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod geometry;
pub mod image;
pub mod instance;
pub mod pipeline;
pub mod raytracing;
pub mod renderer;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod uniform;

pub use buffer::GpuBuffer;
pub use device::{DevicePolicy, DeviceRequest, GraphicsDevice};
pub use error::{ErrorCategory, Result, RhiError};
pub use geometry::{SceneGeometry, Vertex, Winding};
pub use image::{DecodedImage, GpuImage, Texture};
pub use instance::VulkanInstance;
pub use pipeline::PipelineVariant;
pub use renderer::{FrameOutcome, FrameStats, Renderer, RendererDesc};
pub use shader::ShaderSources;
pub use surface::{Surface, WindowSystem};
pub use swapchain::SwapchainManager;
