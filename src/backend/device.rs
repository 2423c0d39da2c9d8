// Graphics Device - Core GPU interface
//
// Responsibilities:
// - Physical device scoring and selection
// - Queue family assignment (graphics + present, may coincide)
// - Logical device + queue creation, optional ray-tracing feature chain
// - Resettable command pool and one-shot command execution

use super::error::{CreationContext, Result, RhiError};
use super::instance::VulkanInstance;
use super::raytracing;
use super::surface::{Surface, SurfaceSupport};
use ash::vk;
use std::ffi::{CStr, CString};
use std::sync::Arc;

/// Depth formats in order of preference
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyAssignment {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyAssignment {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Distinct family indices, one queue-create entry each
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families: Vec<u32> = self.graphics.into_iter().chain(self.present).collect();
        families.dedup();
        families
    }
}

/// Pick graphics and present families.
///
/// A family that can do both wins; otherwise the first graphics family and
/// the first present-capable family are used separately.
pub fn assign_queue_families(
    families: &[vk::QueueFamilyProperties],
    present_support: &[bool],
) -> QueueFamilyAssignment {
    let supports_present = |index: usize| present_support.get(index).copied().unwrap_or(false);
    let is_graphics = |props: &vk::QueueFamilyProperties| {
        props.queue_count > 0 && props.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    };

    if let Some(both) = families
        .iter()
        .enumerate()
        .position(|(i, props)| is_graphics(props) && supports_present(i))
    {
        return QueueFamilyAssignment {
            graphics: Some(both as u32),
            present: Some(both as u32),
        };
    }

    QueueFamilyAssignment {
        graphics: families.iter().position(is_graphics).map(|i| i as u32),
        present: (0..families.len()).find(|&i| supports_present(i)).map(|i| i as u32),
    }
}

/// Selection policy knobs
#[derive(Debug, Clone, Copy)]
pub struct DevicePolicy {
    pub prefer_discrete: bool,
    /// Optional exclusion of integrated GPUs. Not needed for correctness.
    pub reject_integrated: bool,
}

impl Default for DevicePolicy {
    fn default() -> Self {
        Self {
            prefer_discrete: true,
            reject_integrated: false,
        }
    }
}

/// Everything selection needs to know about one physical device
#[derive(Debug, Clone)]
pub struct PhysicalDeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: QueueFamilyAssignment,
    pub extensions: Vec<CString>,
    /// `None` for headless selection
    pub surface_support: Option<SurfaceSupport>,
}

impl PhysicalDeviceCandidate {
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    fn supports_extension(&self, name: &CStr) -> bool {
        self.extensions.iter().any(|ext| ext.as_c_str() == name)
    }
}

/// Score a candidate; `None` means unusable.
///
/// Discrete GPUs score 1000, integrated 100, virtual 10 and anything else 1.
/// Each optional feature present adds one point.
pub fn score_candidate(
    candidate: &PhysicalDeviceCandidate,
    required_extensions: &[&CStr],
    policy: &DevicePolicy,
) -> Option<u32> {
    if !candidate.queue_families.is_complete() {
        return None;
    }
    if let Some(missing) = required_extensions
        .iter()
        .find(|&&ext| !candidate.supports_extension(ext))
    {
        log::debug!("{}: missing extension {:?}", candidate.name(), missing);
        return None;
    }
    if let Some(support) = &candidate.surface_support {
        if !support.is_adequate() {
            return None;
        }
    }
    if candidate.features.sampler_anisotropy != vk::TRUE {
        return None;
    }

    let device_type = candidate.properties.device_type;
    if policy.reject_integrated && device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
        return None;
    }

    let mut score = match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU if policy.prefer_discrete => 1000,
        vk::PhysicalDeviceType::DISCRETE_GPU | vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
        _ => 1,
    };
    if candidate.features.fill_mode_non_solid == vk::TRUE {
        score += 1;
    }
    if candidate.features.wide_lines == vk::TRUE {
        score += 1;
    }
    Some(score)
}

/// Index of the best candidate. Ties keep enumeration order.
pub fn pick_best(
    candidates: &[PhysicalDeviceCandidate],
    required_extensions: &[&CStr],
    policy: &DevicePolicy,
) -> Option<usize> {
    let mut best: Option<(usize, u32)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        let Some(score) = score_candidate(candidate, required_extensions, policy) else {
            continue;
        };
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((index, score));
        }
    }
    best.map(|(index, _)| index)
}

/// First format whose properties for `tiling` contain `features`
pub fn first_supported_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    properties_of: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| {
        let props = properties_of(format);
        match tiling {
            vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
            vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
            _ => false,
        }
    })
}

/// What the caller needs from the device
pub struct DeviceRequest<'a> {
    /// Present target; `None` creates a headless device
    pub surface: Option<&'a Surface>,
    pub ray_tracing: bool,
    pub policy: DevicePolicy,
}

/// Logical device wrapper with automatic cleanup
pub struct GraphicsDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    pub graphics_family: u32,
    pub present_family: u32,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,

    pub command_pool: vk::CommandPool,
    pub ray_tracing_enabled: bool,

    instance: Arc<VulkanInstance>,
}

impl GraphicsDevice {
    pub fn new(instance: Arc<VulkanInstance>, request: &DeviceRequest) -> Result<Arc<Self>> {
        let required = Self::required_extensions(request);
        let candidates = Self::enumerate_candidates(&instance, request.surface)?;

        let index = pick_best(&candidates, &required, &request.policy)
            .ok_or(RhiError::NoSuitableDevice(candidates.len()))?;
        let chosen = &candidates[index];

        log::info!("Selected GPU: {}", chosen.name());
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(chosen.properties.api_version),
            vk::api_version_minor(chosen.properties.api_version),
            vk::api_version_patch(chosen.properties.api_version)
        );

        let (graphics_family, present_family) =
            match (chosen.queue_families.graphics, chosen.queue_families.present) {
                (Some(graphics), Some(present)) => (graphics, present),
                _ => return Err(RhiError::NoSuitableDevice(candidates.len())),
            };

        let device = Self::create_logical_device(
            &instance,
            chosen,
            &required,
            request.ray_tracing,
        )?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(graphics_family);
        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(result) => {
                unsafe { device.destroy_device(None) };
                return Err(RhiError::ResourceCreation {
                    what: "command pool",
                    result,
                });
            }
        };

        Ok(Arc::new(Self {
            device,
            physical_device: chosen.handle,
            properties: chosen.properties,
            memory_properties: chosen.memory_properties,
            graphics_family,
            present_family,
            graphics_queue,
            present_queue,
            command_pool,
            ray_tracing_enabled: request.ray_tracing,
            instance,
        }))
    }

    fn required_extensions(request: &DeviceRequest) -> Vec<&'static CStr> {
        let mut extensions = Vec::new();
        if request.surface.is_some() {
            extensions.push(ash::extensions::khr::Swapchain::name());
        }
        if request.ray_tracing {
            extensions.extend(raytracing::required_device_extensions());
        }
        extensions
    }

    fn enumerate_candidates(
        instance: &VulkanInstance,
        surface: Option<&Surface>,
    ) -> Result<Vec<PhysicalDeviceCandidate>> {
        let instance_fns = &instance.instance;
        let devices = unsafe { instance_fns.enumerate_physical_devices() }?;

        let mut candidates = Vec::with_capacity(devices.len());
        for handle in devices {
            let properties = unsafe { instance_fns.get_physical_device_properties(handle) };
            let features = unsafe { instance_fns.get_physical_device_features(handle) };
            let memory_properties =
                unsafe { instance_fns.get_physical_device_memory_properties(handle) };
            let families =
                unsafe { instance_fns.get_physical_device_queue_family_properties(handle) };

            let present_support = match surface {
                Some(surface) => (0..families.len() as u32)
                    .map(|family| surface.supports_present(handle, family))
                    .collect::<Result<Vec<bool>>>()?,
                // Headless: present work never happens, reuse the graphics family
                None => families
                    .iter()
                    .map(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                    .collect(),
            };

            let extensions = unsafe { instance_fns.enumerate_device_extension_properties(handle) }?
                .iter()
                .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }.to_owned())
                .collect();

            let surface_support = match surface {
                Some(surface) => Some(surface.support(handle)?),
                None => None,
            };

            let candidate = PhysicalDeviceCandidate {
                handle,
                properties,
                features,
                memory_properties,
                queue_families: assign_queue_families(&families, &present_support),
                extensions,
                surface_support,
            };
            log::debug!(
                "Found GPU: {} ({:?}), queues {:?}",
                candidate.name(),
                properties.device_type,
                candidate.queue_families
            );
            candidates.push(candidate);
        }

        Ok(candidates)
    }

    fn create_logical_device(
        instance: &VulkanInstance,
        chosen: &PhysicalDeviceCandidate,
        extensions: &[&CStr],
        ray_tracing: bool,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = chosen
            .queue_families
            .unique_families()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let enabled_features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: vk::TRUE,
            fill_mode_non_solid: chosen.features.fill_mode_non_solid,
            wide_lines: chosen.features.wide_lines,
            ..Default::default()
        };

        let extension_ptrs: Vec<*const std::ffi::c_char> =
            extensions.iter().map(|ext| ext.as_ptr()).collect();

        let mut rt_features = raytracing::RayTracingFeatures::enabled();

        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&enabled_features);
        if ray_tracing {
            create_info = rt_features.chain(create_info);
        }

        unsafe {
            instance
                .instance
                .create_device(chosen.handle, &create_info, None)
        }
        .creating("logical device")
    }

    pub fn instance(&self) -> &Arc<VulkanInstance> {
        &self.instance
    }

    pub fn max_sampler_anisotropy(&self) -> f32 {
        self.properties.limits.max_sampler_anisotropy
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    pub fn find_depth_format(&self) -> Result<vk::Format> {
        first_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |format| self.format_properties(format),
        )
        .ok_or_else(|| RhiError::Configuration("no supported depth attachment format".into()))
    }

    /// Record `work` into a one-shot command buffer, submit it and block until
    /// the GPU is done.
    pub fn immediate_submit<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .creating("one-shot command buffer")?[0];

        let result = self.record_and_wait(command_buffer, work);

        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &[command_buffer]);
        }
        result
    }

    fn record_and_wait<F>(&self, command_buffer: vk::CommandBuffer, work: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)?;
            work(&self.device, command_buffer);
            self.device.end_command_buffer(command_buffer)?;

            let fence = self
                .device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .creating("one-shot fence")?;

            let command_buffers = [command_buffer];
            let submit = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            let waited = self
                .device
                .queue_submit(self.graphics_queue, &[submit.build()], fence)
                .and_then(|_| self.device.wait_for_fences(&[fence], true, u64::MAX));

            self.device.destroy_fence(fence, None);
            waited?;
        }
        Ok(())
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for GraphicsDevice {
    fn drop(&mut self) {
        log::info!("Destroying logical device");

        if let Err(err) = self.wait_idle() {
            log::error!("wait_idle during device teardown failed: {}", err);
        }

        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn candidate(device_type: vk::PhysicalDeviceType) -> PhysicalDeviceCandidate {
        PhysicalDeviceCandidate {
            handle: vk::PhysicalDevice::null(),
            properties: vk::PhysicalDeviceProperties {
                device_type,
                ..Default::default()
            },
            features: vk::PhysicalDeviceFeatures {
                sampler_anisotropy: vk::TRUE,
                ..Default::default()
            },
            memory_properties: vk::PhysicalDeviceMemoryProperties::default(),
            queue_families: QueueFamilyAssignment {
                graphics: Some(0),
                present: Some(0),
            },
            extensions: vec![ash::extensions::khr::Swapchain::name().to_owned()],
            surface_support: Some(SurfaceSupport {
                capabilities: vk::SurfaceCapabilitiesKHR::default(),
                formats: vec![vk::SurfaceFormatKHR::default()],
                present_modes: vec![vk::PresentModeKHR::FIFO],
            }),
        }
    }

    #[test]
    fn shared_family_preferred() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
        ];
        let assignment = assign_queue_families(&families, &[false, true, true]);
        assert_eq!(assignment.graphics, Some(2));
        assert_eq!(assignment.present, Some(2));
        assert_eq!(assignment.unique_families(), vec![2]);
    }

    #[test]
    fn split_families_when_no_overlap() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let assignment = assign_queue_families(&families, &[false, true]);
        assert!(assignment.is_complete());
        assert_eq!(assignment.unique_families(), vec![0, 1]);
    }

    #[test]
    fn no_present_family_is_incomplete() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let assignment = assign_queue_families(&families, &[false]);
        assert!(!assignment.is_complete());
    }

    #[test]
    fn discrete_beats_integrated() {
        let required = [ash::extensions::khr::Swapchain::name()];
        let policy = DevicePolicy::default();
        let candidates = [
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        assert_eq!(pick_best(&candidates, &required, &policy), Some(1));
    }

    #[test]
    fn ties_keep_enumeration_order() {
        let policy = DevicePolicy::default();
        let candidates = [
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        assert_eq!(pick_best(&candidates, &[], &policy), Some(0));
    }

    #[test]
    fn optional_features_break_ties() {
        let policy = DevicePolicy::default();
        let mut richer = candidate(vk::PhysicalDeviceType::DISCRETE_GPU);
        richer.features.fill_mode_non_solid = vk::TRUE;
        let candidates = [candidate(vk::PhysicalDeviceType::DISCRETE_GPU), richer];
        assert_eq!(pick_best(&candidates, &[], &policy), Some(1));
    }

    #[test]
    fn unsuitable_candidates_are_skipped() {
        let policy = DevicePolicy::default();
        let required = [ash::extensions::khr::Swapchain::name()];

        let mut no_aniso = candidate(vk::PhysicalDeviceType::DISCRETE_GPU);
        no_aniso.features.sampler_anisotropy = vk::FALSE;
        assert_eq!(score_candidate(&no_aniso, &required, &policy), None);

        let mut no_ext = candidate(vk::PhysicalDeviceType::DISCRETE_GPU);
        no_ext.extensions.clear();
        assert_eq!(score_candidate(&no_ext, &required, &policy), None);

        let mut no_modes = candidate(vk::PhysicalDeviceType::DISCRETE_GPU);
        if let Some(support) = no_modes.surface_support.as_mut() {
            support.present_modes.clear();
        }
        assert_eq!(score_candidate(&no_modes, &required, &policy), None);

        assert_eq!(pick_best(&[no_aniso, no_ext, no_modes], &required, &policy), None);
    }

    #[test]
    fn integrated_rejection_is_opt_in() {
        let integrated = candidate(vk::PhysicalDeviceType::INTEGRATED_GPU);
        assert_eq!(
            score_candidate(&integrated, &[], &DevicePolicy::default()),
            Some(100)
        );
        let strict = DevicePolicy {
            reject_integrated: true,
            ..DevicePolicy::default()
        };
        assert_eq!(score_candidate(&integrated, &[], &strict), None);
    }

    #[test]
    fn headless_candidate_skips_surface_checks() {
        let mut headless = candidate(vk::PhysicalDeviceType::VIRTUAL_GPU);
        headless.surface_support = None;
        assert_eq!(score_candidate(&headless, &[], &DevicePolicy::default()), Some(10));
    }

    #[test]
    fn depth_format_falls_through_candidates() {
        let chosen = first_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |format| {
                if format == vk::Format::D24_UNORM_S8_UINT {
                    vk::FormatProperties {
                        optimal_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                        ..Default::default()
                    }
                } else {
                    vk::FormatProperties::default()
                }
            },
        );
        assert_eq!(chosen, Some(vk::Format::D24_UNORM_S8_UINT));

        let none = first_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |_| vk::FormatProperties::default(),
        );
        assert_eq!(none, None);
    }
}
