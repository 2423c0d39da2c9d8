// Window-system boundary and the presentation surface
//
// The RHI never talks to a windowing library directly. Whatever owns the
// window implements `WindowSystem`; we only need its raw handles, its
// framebuffer size and a way to block while it is minimized.

use super::error::{CreationContext, Result};
use super::instance::VulkanInstance;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;
use std::sync::Arc;

/// The window collaborator
pub trait WindowSystem {
    fn raw_display_handle(&self) -> RawDisplayHandle;

    fn raw_window_handle(&self) -> RawWindowHandle;

    /// Current drawable size in pixels. Zero in either axis means minimized.
    fn framebuffer_size(&self) -> vk::Extent2D;

    /// Block until the window system has something new to say.
    fn wait_events(&self);

    /// Instance extensions the platform needs for surface creation
    fn required_instance_extensions(&self) -> Result<Vec<&'static CStr>> {
        let names = ash_window::enumerate_required_extensions(self.raw_display_handle())?;
        // ash-window hands out pointers to static, NUL-terminated names
        Ok(names
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) })
            .collect())
    }
}

/// False for a minimized window; no swapchain can be built for it
pub fn has_drawable_area(extent: vk::Extent2D) -> bool {
    extent.width > 0 && extent.height > 0
}

/// Block while the framebuffer has zero area, then return its extent.
///
/// Returns only once `wait_events` lets the size change. Callers whose
/// `wait_events` cannot pump the window system must not call into the
/// frame loop while `has_drawable_area` is false.
pub fn wait_for_drawable_extent(window: &dyn WindowSystem) -> vk::Extent2D {
    let mut extent = window.framebuffer_size();
    while !has_drawable_area(extent) {
        log::debug!("Framebuffer is {}x{}, waiting", extent.width, extent.height);
        window.wait_events();
        extent = window.framebuffer_size();
    }
    extent
}

/// What a physical device can do with a surface
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

pub struct Surface {
    pub handle: vk::SurfaceKHR,
    pub loader: ash::extensions::khr::Surface,
    instance: Arc<VulkanInstance>,
}

impl Surface {
    pub fn new(instance: Arc<VulkanInstance>, window: &dyn WindowSystem) -> Result<Arc<Self>> {
        let loader = ash::extensions::khr::Surface::new(&instance.entry, &instance.instance);

        let handle = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .creating("window surface")?;

        log::debug!("Created window surface");

        Ok(Arc::new(Self {
            handle,
            loader,
            instance,
        }))
    }

    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, family: u32) -> Result<bool> {
        let supported = unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, family, self.handle)
        }?;
        Ok(supported)
    }

    pub fn support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .loader
                    .get_physical_device_surface_capabilities(physical_device, self.handle)?,
                formats: self
                    .loader
                    .get_physical_device_surface_formats(physical_device, self.handle)?,
                present_modes: self
                    .loader
                    .get_physical_device_surface_present_modes(physical_device, self.handle)?,
            })
        }
    }

    pub fn instance(&self) -> &Arc<VulkanInstance> {
        &self.instance
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
    }
}
