// Pipeline factory
//
// Render pass, descriptor-set layout and pipeline construction. The variant
// tag decides descriptor bindings and fixed-function state; one factory
// function builds every variant.

use super::device::GraphicsDevice;
use super::error::{CreationContext, Result, RhiError};
use super::geometry::{Vertex, Winding};
use super::raytracing;
use super::shader::{ShaderModule, ShaderSources};
use ash::vk;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineVariant {
    /// Built-in triangle straight to clip space, no uniforms
    TriangleTest,
    /// Indexed mesh with depth testing
    Mesh,
    /// Indexed mesh driven by the uniform buffer, no depth test
    Uniform,
    RayTracing,
}

impl PipelineVariant {
    pub fn name(self) -> &'static str {
        match self {
            PipelineVariant::TriangleTest => "triangle",
            PipelineVariant::Mesh => "mesh",
            PipelineVariant::Uniform => "uniform",
            PipelineVariant::RayTracing => "ray_tracing",
        }
    }

    pub fn requires_ray_tracing(self) -> bool {
        self == PipelineVariant::RayTracing
    }

    pub fn bind_point(self) -> vk::PipelineBindPoint {
        if self.requires_ray_tracing() {
            vk::PipelineBindPoint::RAY_TRACING_KHR
        } else {
            vk::PipelineBindPoint::GRAPHICS
        }
    }
}

impl fmt::Display for PipelineVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PipelineVariant {
    type Err = RhiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "triangle" | "triangle_test" => Ok(PipelineVariant::TriangleTest),
            "mesh" | "normal" => Ok(PipelineVariant::Mesh),
            "uniform" => Ok(PipelineVariant::Uniform),
            "ray_tracing" | "raytracing" => Ok(PipelineVariant::RayTracing),
            other => Err(RhiError::Configuration(format!(
                "unknown pipeline variant {:?}",
                other
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Render pass
// ---------------------------------------------------------------------------

/// One colour + one depth attachment, one subpass
pub struct RenderPass {
    pub handle: vk::RenderPass,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    device: Arc<GraphicsDevice>,
}

impl RenderPass {
    pub fn new(
        device: &Arc<GraphicsDevice>,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> Result<Self> {
        let color_attachment = vk::AttachmentDescription::builder()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build();

        let depth_attachment = vk::AttachmentDescription::builder()
            .format(depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build();

        let color_attachment_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let depth_attachment_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let color_attachments = [color_attachment_ref];
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_attachments)
            .depth_stencil_attachment(&depth_attachment_ref)
            .build();

        // Keeps the implicit layout transition from racing the previous frame
        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build();

        let attachments = [color_attachment, depth_attachment];
        let subpasses = [subpass];
        let dependencies = [dependency];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let handle = unsafe { device.device.create_render_pass(&render_pass_info, None) }
            .creating("render pass")?;

        Ok(Self {
            handle,
            color_format,
            depth_format,
            device: Arc::clone(device),
        })
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_render_pass(self.handle, None) };
    }
}

// ---------------------------------------------------------------------------
// Descriptor layout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingSpec {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Binding table for a variant
pub fn descriptor_bindings(variant: PipelineVariant) -> Vec<BindingSpec> {
    match variant {
        PipelineVariant::RayTracing => vec![
            BindingSpec {
                binding: 0,
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                count: 1,
                stages: vk::ShaderStageFlags::RAYGEN_KHR,
            },
            BindingSpec {
                binding: 1,
                ty: vk::DescriptorType::STORAGE_IMAGE,
                count: 1,
                stages: vk::ShaderStageFlags::RAYGEN_KHR,
            },
            BindingSpec {
                binding: 2,
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                count: 1,
                stages: vk::ShaderStageFlags::RAYGEN_KHR,
            },
        ],
        PipelineVariant::TriangleTest | PipelineVariant::Mesh | PipelineVariant::Uniform => vec![
            BindingSpec {
                binding: 0,
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                count: 1,
                stages: vk::ShaderStageFlags::VERTEX,
            },
            BindingSpec {
                binding: 1,
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                count: 1,
                stages: vk::ShaderStageFlags::FRAGMENT,
            },
        ],
    }
}

/// Pool sizes covering `sets` copies of the variant's bindings
pub fn pool_sizes(variant: PipelineVariant, sets: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for spec in descriptor_bindings(variant) {
        match sizes.iter_mut().find(|size| size.ty == spec.ty) {
            Some(size) => size.descriptor_count += spec.count * sets,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: spec.ty,
                descriptor_count: spec.count * sets,
            }),
        }
    }
    sizes
}

pub struct DescriptorSetLayout {
    pub handle: vk::DescriptorSetLayout,
    pub variant: PipelineVariant,
    device: Arc<GraphicsDevice>,
}

impl DescriptorSetLayout {
    pub fn new(device: &Arc<GraphicsDevice>, variant: PipelineVariant) -> Result<Self> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = descriptor_bindings(variant)
            .iter()
            .map(|spec| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(spec.binding)
                    .descriptor_type(spec.ty)
                    .descriptor_count(spec.count)
                    .stage_flags(spec.stages)
                    .build()
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let handle = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
            .creating("descriptor set layout")?;

        Ok(Self {
            handle,
            variant,
            device: Arc::clone(device),
        })
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .device
                .destroy_descriptor_set_layout(self.handle, None)
        };
    }
}

// ---------------------------------------------------------------------------
// Fixed-function state
// ---------------------------------------------------------------------------

/// Every raster variant reads `Vertex` at binding 0 and draws indexed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterState {
    pub depth_test: bool,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
}

/// Raster state for a variant. Front face comes from the geometry.
pub fn raster_state(variant: PipelineVariant, winding: Winding) -> RasterState {
    RasterState {
        depth_test: variant == PipelineVariant::Mesh,
        cull_mode: vk::CullModeFlags::BACK,
        front_face: winding.front_face(),
    }
}

pub struct PipelineDesc<'a> {
    pub render_pass: &'a RenderPass,
    pub set_layout: &'a DescriptorSetLayout,
    pub winding: Winding,
}

pub struct Pipeline {
    pub variant: PipelineVariant,
    pub handle: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    device: Arc<GraphicsDevice>,
}

impl Pipeline {
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.variant.bind_point()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.handle, None);
            self.device.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Build any variant. Shader modules are destroyed before this returns.
pub fn create_pipeline(
    device: &Arc<GraphicsDevice>,
    variant: PipelineVariant,
    desc: &PipelineDesc,
    shaders: &ShaderSources,
) -> Result<Pipeline> {
    if desc.set_layout.variant != variant {
        return Err(RhiError::Configuration(format!(
            "descriptor layout built for {} used with {}",
            desc.set_layout.variant, variant
        )));
    }

    let set_layouts = [desc.set_layout.handle];
    let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
    let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
        .creating("pipeline layout")?;

    let handle = match (variant, shaders) {
        (PipelineVariant::RayTracing, ShaderSources::RayTracing { .. }) => {
            raytracing::create_ray_tracing_pipeline(device, layout, shaders)
        }
        (PipelineVariant::RayTracing, _) | (_, ShaderSources::RayTracing { .. }) => {
            Err(RhiError::Configuration(format!(
                "shader stages do not match the {} pipeline",
                variant
            )))
        }
        (_, ShaderSources::Raster { vertex, fragment }) => create_graphics_pipeline(
            &device.device,
            layout,
            desc.render_pass.handle,
            raster_state(variant, desc.winding),
            vertex,
            fragment,
        ),
    };

    let handle = match handle {
        Ok(handle) => handle,
        Err(err) => {
            unsafe { device.device.destroy_pipeline_layout(layout, None) };
            return Err(err);
        }
    };

    log::info!("Built {} pipeline", variant);

    Ok(Pipeline {
        variant,
        handle,
        layout,
        device: Arc::clone(device),
    })
}

fn create_graphics_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
    state: RasterState,
    vertex_spv: &[u8],
    fragment_spv: &[u8],
) -> Result<vk::Pipeline> {
    let vertex_module = ShaderModule::new(device, vertex_spv)?;
    let fragment_module = ShaderModule::new(device, fragment_spv)?;

    let shader_stages = [
        vertex_module.stage(vk::ShaderStageFlags::VERTEX),
        fragment_module.stage(vk::ShaderStageFlags::FRAGMENT),
    ];

    let bindings = [Vertex::binding_description()];
    let attributes = Vertex::attribute_descriptions();
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Viewport and scissor are set per frame
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(state.cull_mode)
        .front_face(state.front_face)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(state.depth_test)
        .depth_write_enable(state.depth_test)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build();
    let color_blend_attachments = [color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, result)| RhiError::ResourceCreation {
        what: "graphics pipeline",
        result,
    })?;

    pipelines
        .into_iter()
        .next()
        .ok_or(RhiError::ResourceCreation {
            what: "graphics pipeline",
            result: vk::Result::ERROR_UNKNOWN,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_names_round_trip() {
        for variant in [
            PipelineVariant::TriangleTest,
            PipelineVariant::Mesh,
            PipelineVariant::Uniform,
            PipelineVariant::RayTracing,
        ] {
            assert_eq!(variant.name().parse::<PipelineVariant>().unwrap(), variant);
        }
        assert!("wireframe".parse::<PipelineVariant>().is_err());
        assert_eq!(" Mesh ".parse::<PipelineVariant>().unwrap(), PipelineVariant::Mesh);
    }

    #[test]
    fn bindings_are_a_pure_function_of_variant() {
        assert_eq!(
            descriptor_bindings(PipelineVariant::Mesh),
            descriptor_bindings(PipelineVariant::Mesh)
        );
        assert_eq!(
            descriptor_bindings(PipelineVariant::RayTracing),
            descriptor_bindings(PipelineVariant::RayTracing)
        );
    }

    #[test]
    fn standard_variants_share_two_bindings() {
        let mesh = descriptor_bindings(PipelineVariant::Mesh);
        assert_eq!(mesh.len(), 2);
        assert_eq!(mesh[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(mesh[0].stages, vk::ShaderStageFlags::VERTEX);
        assert_eq!(mesh[1].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(mesh[1].stages, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(descriptor_bindings(PipelineVariant::Uniform), mesh);
        assert_eq!(descriptor_bindings(PipelineVariant::TriangleTest), mesh);
    }

    #[test]
    fn ray_tracing_uses_three_bindings() {
        let types: Vec<_> = descriptor_bindings(PipelineVariant::RayTracing)
            .iter()
            .map(|spec| spec.ty)
            .collect();
        assert_eq!(
            types,
            vec![
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                vk::DescriptorType::STORAGE_IMAGE,
                vk::DescriptorType::UNIFORM_BUFFER,
            ]
        );
    }

    #[test]
    fn pool_sizes_scale_with_frames() {
        let sizes = pool_sizes(PipelineVariant::Mesh, 2);
        assert_eq!(sizes.len(), 2);
        assert!(sizes.iter().all(|size| size.descriptor_count == 2));

        let rt = pool_sizes(PipelineVariant::RayTracing, 3);
        assert_eq!(rt.len(), 3);
        assert!(rt.iter().all(|size| size.descriptor_count == 3));
    }

    #[test]
    fn only_mesh_variant_depth_tests() {
        let mesh = raster_state(PipelineVariant::Mesh, Winding::CounterClockwise);
        assert!(mesh.depth_test);
        assert_eq!(mesh.cull_mode, vk::CullModeFlags::BACK);

        let uniform = raster_state(PipelineVariant::Uniform, Winding::CounterClockwise);
        assert!(!uniform.depth_test);

        let triangle = raster_state(PipelineVariant::TriangleTest, Winding::Clockwise);
        assert!(!triangle.depth_test);
        assert_eq!(triangle.front_face, vk::FrontFace::CLOCKWISE);
    }

    #[test]
    fn winding_follows_geometry_not_variant() {
        for variant in [PipelineVariant::Mesh, PipelineVariant::TriangleTest] {
            assert_eq!(
                raster_state(variant, Winding::CounterClockwise).front_face,
                vk::FrontFace::COUNTER_CLOCKWISE
            );
            assert_eq!(
                raster_state(variant, Winding::Clockwise).front_face,
                vk::FrontFace::CLOCKWISE
            );
        }
    }
}
