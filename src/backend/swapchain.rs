// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen,
// along with their views, the shared depth attachment and one framebuffer
// per image. Rebuilt as a unit when the window changes size.

use super::device::GraphicsDevice;
use super::error::{CreationContext, Result, RhiError};
use super::image::{color_subresource_range, GpuImage};
use super::pipeline::RenderPass;
use super::surface::{wait_for_drawable_extent, Surface, WindowSystem};
use ash::vk;
use std::sync::Arc;

/// BGRA8 sRGB with the sRGB colour space if offered, else whatever comes first
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// MAILBOX when available, FIFO otherwise (always supported).
///
/// `preferred` wins when the surface offers it.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: Option<vk::PresentModeKHR>,
) -> vk::PresentModeKHR {
    if let Some(preferred) = preferred.filter(|mode| modes.contains(mode)) {
        return preferred;
    }
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    framebuffer: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: framebuffer.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: framebuffer.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, clamped to the maximum (0 means unbounded)
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        wanted.min(capabilities.max_image_count)
    } else {
        wanted
    }
}

pub fn sharing_mode(graphics_family: u32, present_family: u32) -> vk::SharingMode {
    if graphics_family == present_family {
        vk::SharingMode::EXCLUSIVE
    } else {
        vk::SharingMode::CONCURRENT
    }
}

/// Out-of-date is the one swapchain failure the frame loop recovers from
pub fn swapchain_error(result: vk::Result) -> RhiError {
    match result {
        vk::Result::ERROR_OUT_OF_DATE_KHR => RhiError::SwapchainOutOfDate,
        other => RhiError::Vulkan(other),
    }
}

pub struct SwapchainManager {
    pub handle: vk::SwapchainKHR,
    pub loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    depth: Option<GpuImage>,

    pub surface_format: vk::SurfaceFormatKHR,
    pub depth_format: vk::Format,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,

    preferred_present_mode: Option<vk::PresentModeKHR>,
    render_pass: vk::RenderPass,
    surface: Arc<Surface>,
    device: Arc<GraphicsDevice>,
}

impl SwapchainManager {
    /// Colour format the render pass must be built for
    pub fn query_surface_format(
        device: &GraphicsDevice,
        surface: &Surface,
    ) -> Result<vk::SurfaceFormatKHR> {
        let support = surface.support(device.physical_device)?;
        choose_surface_format(&support.formats)
            .ok_or_else(|| RhiError::Configuration("surface reports no formats".into()))
    }

    pub fn new(
        device: Arc<GraphicsDevice>,
        surface: Arc<Surface>,
        window: &dyn WindowSystem,
        render_pass: &RenderPass,
        preferred_present_mode: Option<vk::PresentModeKHR>,
    ) -> Result<Self> {
        let loader = ash::extensions::khr::Swapchain::new(&device.instance().instance, &device.device);

        let mut manager = Self {
            handle: vk::SwapchainKHR::null(),
            loader,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            depth: None,
            surface_format: vk::SurfaceFormatKHR {
                format: render_pass.color_format,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            depth_format: render_pass.depth_format,
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            preferred_present_mode,
            render_pass: render_pass.handle,
            surface,
            device,
        };

        manager.surface_format = Self::query_surface_format(&manager.device, &manager.surface)?;
        if manager.surface_format.format != render_pass.color_format {
            return Err(RhiError::Configuration(format!(
                "render pass built for {:?} but surface prefers {:?}",
                render_pass.color_format, manager.surface_format.format
            )));
        }

        let extent = wait_for_drawable_extent(window);
        manager.build_chain(extent)?;
        Ok(manager)
    }

    /// Tear down and rebuild everything extent-dependent. Blocks while the
    /// window is minimized. The render pass and pipelines are untouched.
    pub fn recreate(&mut self, window: &dyn WindowSystem) -> Result<()> {
        let framebuffer = wait_for_drawable_extent(window);
        self.device.wait_idle()?;
        self.release_chain();
        self.build_chain(framebuffer)
    }

    fn build_chain(&mut self, framebuffer: vk::Extent2D) -> Result<()> {
        let support = self.surface.support(self.device.physical_device)?;
        let capabilities = support.capabilities;

        self.extent = choose_extent(&capabilities, framebuffer);
        self.present_mode = choose_present_mode(&support.present_modes, self.preferred_present_mode);
        let image_count = choose_image_count(&capabilities);

        let families = [self.device.graphics_family, self.device.present_family];
        let sharing = sharing_mode(families[0], families[1]);

        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface.handle)
            .min_image_count(image_count)
            .image_format(self.surface_format.format)
            .image_color_space(self.surface_format.color_space)
            .image_extent(self.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true);
        if sharing == vk::SharingMode::CONCURRENT {
            create_info = create_info.queue_family_indices(&families);
        }

        self.handle = unsafe { self.loader.create_swapchain(&create_info, None) }
            .creating("swapchain")?;
        self.images = unsafe { self.loader.get_swapchain_images(self.handle) }?;

        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.surface_format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(color_subresource_range());
            let view = unsafe { self.device.device.create_image_view(&view_info, None) }
                .creating("swapchain image view")?;
            self.image_views.push(view);
        }

        let depth = GpuImage::depth(&self.device, self.extent, self.depth_format)?;
        let depth_view = depth.view;
        self.depth = Some(depth);

        for &view in &self.image_views {
            let attachments = [view, depth_view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);
            let framebuffer = unsafe { self.device.device.create_framebuffer(&framebuffer_info, None) }
                .creating("framebuffer")?;
            self.framebuffers.push(framebuffer);
        }

        log::info!(
            "Swapchain ready: {}x{}, {:?}, {:?}, {} images",
            self.extent.width,
            self.extent.height,
            self.surface_format.format,
            self.present_mode,
            self.images.len()
        );
        Ok(())
    }

    /// Destroy framebuffers, views, depth and the chain itself
    fn release_chain(&mut self) {
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            for view in self.image_views.drain(..) {
                self.device.device.destroy_image_view(view, None);
            }
        }
        self.depth = None;
        self.images.clear();
        if self.handle != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.handle, None) };
            self.handle = vk::SwapchainKHR::null();
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire next image for rendering (no timeout)
    /// Next image index and whether the chain is suboptimal
    pub fn acquire_next_image(&self, signal: vk::Semaphore) -> Result<(u32, bool)> {
        unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, signal, vk::Fence::null())
        }
        .map_err(swapchain_error)
    }

    /// Present rendered image to screen. `Ok(true)` means suboptimal.
    pub fn present(&self, queue: vk::Queue, image_index: u32, wait: vk::Semaphore) -> Result<bool> {
        let wait_semaphores = [wait];
        let swapchains = [self.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.loader.queue_present(queue, &present_info) }.map_err(swapchain_error)
    }
}

impl Drop for SwapchainManager {
    fn drop(&mut self) {
        self.release_chain();
    }
}
