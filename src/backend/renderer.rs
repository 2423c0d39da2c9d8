// Frame scheduler
//
// Owns every GPU object the render loop touches and drives one
// acquire -> record -> submit -> present iteration per draw_frame() call.
// Fields are declared children-first so they drop in a safe order after
// the device has gone idle.

use super::descriptor::FrameDescriptors;
use super::device::GraphicsDevice;
use super::error::Result;
use super::geometry::{MeshBuffers, SceneGeometry};
use super::image::{DecodedImage, Texture};
use super::pipeline::{
    create_pipeline, DescriptorSetLayout, Pipeline, PipelineDesc, PipelineVariant, RenderPass,
};
use super::raytracing::RayTracingScene;
use super::shader::ShaderSources;
use super::surface::{Surface, WindowSystem};
use super::swapchain::SwapchainManager;
use super::sync::{FrameRing, FrameSlot, MAX_FRAMES_IN_FLIGHT};
use super::uniform::{UniformBufferObject, UniformBuffers};
use ash::vk;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Renderer-level settings
#[derive(Debug, Clone)]
pub struct RendererDesc {
    pub variant: PipelineVariant,
    pub clear_color: [f32; 4],
    /// `None` waits on frame fences forever
    pub fence_timeout: Option<Duration>,
    pub present_mode: Option<vk::PresentModeKHR>,
}

impl Default for RendererDesc {
    fn default() -> Self {
        Self {
            variant: PipelineVariant::Mesh,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            fence_timeout: None,
            present_mode: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Image presented, swapchain still valid
    Presented,
    /// Image presented, then the swapchain was rebuilt
    Recreated,
    /// Acquire reported out-of-date; swapchain rebuilt, nothing submitted
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub submissions: u64,
    pub presented: u64,
    pub recreations: u64,
}

pub fn clear_values(color: [f32; 4]) -> [vk::ClearValue; 2] {
    [
        vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ]
}

pub struct Renderer {
    frames: Vec<FrameSlot>,
    ring: FrameRing,
    descriptors: FrameDescriptors,
    pipeline: Pipeline,
    set_layout: DescriptorSetLayout,
    uniforms: UniformBuffers,
    ray_tracing: Option<RayTracingScene>,
    mesh: MeshBuffers,
    texture: Texture,
    swapchain: SwapchainManager,
    render_pass: RenderPass,
    device: Arc<GraphicsDevice>,

    variant: PipelineVariant,
    clear_color: [f32; 4],
    fence_timeout: Option<Duration>,
    start: Instant,
    framebuffer_resized: bool,
    stats: FrameStats,
}

impl Renderer {
    pub fn new(
        device: Arc<GraphicsDevice>,
        surface: Arc<Surface>,
        window: &dyn WindowSystem,
        desc: &RendererDesc,
        geometry: &SceneGeometry,
        texture: Option<&DecodedImage>,
        shaders: &ShaderSources,
    ) -> Result<Self> {
        let variant = desc.variant;
        log::info!("Initializing renderer ({} pipeline)", variant);

        let surface_format = SwapchainManager::query_surface_format(&device, &surface)?;
        let depth_format = device.find_depth_format()?;
        let render_pass = RenderPass::new(&device, surface_format.format, depth_format)?;

        let swapchain = SwapchainManager::new(
            Arc::clone(&device),
            surface,
            window,
            &render_pass,
            desc.present_mode,
        )?;

        let set_layout = DescriptorSetLayout::new(&device, variant)?;
        let pipeline = create_pipeline(
            &device,
            variant,
            &PipelineDesc {
                render_pass: &render_pass,
                set_layout: &set_layout,
                winding: geometry.winding,
            },
            shaders,
        )?;

        let mesh = MeshBuffers::upload(&device, geometry, variant)?;
        let texture = match texture {
            Some(decoded) => Texture::upload(&device, decoded)?,
            None => Texture::white(&device)?,
        };
        let uniforms = UniformBuffers::new(&device, MAX_FRAMES_IN_FLIGHT)?;

        let ray_tracing = if variant.requires_ray_tracing() {
            Some(RayTracingScene::build(&device, &mesh, swapchain.extent)?)
        } else {
            None
        };

        let descriptors = FrameDescriptors::new(&device, &set_layout, MAX_FRAMES_IN_FLIGHT)?;

        let frames = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| FrameSlot::new(&device))
            .collect::<Result<Vec<_>>>()?;

        let renderer = Self {
            frames,
            ring: FrameRing::new(MAX_FRAMES_IN_FLIGHT),
            descriptors,
            pipeline,
            set_layout,
            uniforms,
            ray_tracing,
            mesh,
            texture,
            swapchain,
            render_pass,
            device,
            variant,
            clear_color: desc.clear_color,
            fence_timeout: desc.fence_timeout,
            start: Instant::now(),
            framebuffer_resized: false,
            stats: FrameStats::default(),
        };
        renderer.write_descriptors()?;

        log::info!(
            "Renderer ready: {} frames in flight, {} swapchain images",
            MAX_FRAMES_IN_FLIGHT,
            renderer.swapchain.image_count()
        );
        Ok(renderer)
    }

    fn write_descriptors(&self) -> Result<()> {
        for frame in 0..MAX_FRAMES_IN_FLIGHT {
            let ubo = self.uniforms.buffer(frame)?;
            match &self.ray_tracing {
                Some(scene) => self.descriptors.write_ray_tracing(
                    frame,
                    scene.tlas.handle,
                    scene.storage_image.view,
                    ubo,
                )?,
                None => self.descriptors.write_standard(frame, ubo, &self.texture)?,
            }
        }
        Ok(())
    }

    pub fn variant(&self) -> PipelineVariant {
        self.variant
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn swapchain(&self) -> &SwapchainManager {
        &self.swapchain
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn frames_in_flight(&self) -> usize {
        self.ring.in_flight()
    }

    /// The window changed size; rebuild after the next present
    pub fn request_resize(&mut self) {
        self.framebuffer_resized = true;
    }

    pub fn draw_frame(&mut self, window: &dyn WindowSystem) -> Result<FrameOutcome> {
        let slot = self.ring.current();

        // 1. Back-pressure: the slot's previous submission must be finished
        self.frames[slot].wait(slot, self.fence_timeout)?;
        self.ring.retire(slot);

        // 2. Acquire
        self.ring.begin_acquire();
        let acquired = self
            .swapchain
            .acquire_next_image(self.frames[slot].image_available);
        let (image_index, suboptimal) = match acquired {
            Ok(acquired) => acquired,
            Err(err) => {
                // Fence untouched, the slot stays usable
                self.ring.abort_acquire();
                if !err.is_transient() {
                    return Err(err);
                }
                log::debug!("Swapchain out of date on acquire");
                self.recreate_swapchain(window)?;
                return Ok(FrameOutcome::Skipped);
            }
        };
        if suboptimal {
            log::warn!("Swapchain suboptimal, rebuilding after present");
        }

        // 3. Uniforms for this slot
        let seconds = self.start.elapsed().as_secs_f32();
        let ubo = UniformBufferObject::animated(seconds, self.swapchain.extent);
        self.uniforms.update(slot, &ubo)?;

        // 4. Record
        self.frames[slot].reset_fence()?;
        self.ring.begin_recording();
        self.record(slot, image_index)?;

        // 5. Submit
        let frame = &self.frames[slot];
        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [frame.render_finished];
        let command_buffers = [frame.command_buffer];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                frame.in_flight,
            )
        }?;
        self.ring.submitted();
        self.stats.submissions += 1;

        // 6. Present
        let stale = match self.swapchain.present(
            self.device.present_queue,
            image_index,
            frame.render_finished,
        ) {
            Ok(present_suboptimal) => {
                self.stats.presented += 1;
                present_suboptimal
            }
            Err(err) if err.is_transient() => {
                log::debug!("Swapchain out of date on present");
                true
            }
            Err(err) => return Err(err),
        };

        let outcome = if suboptimal || stale || self.framebuffer_resized {
            self.recreate_swapchain(window)?;
            FrameOutcome::Recreated
        } else {
            FrameOutcome::Presented
        };

        // 7. Next slot
        self.ring.advance();
        Ok(outcome)
    }

    fn record(&self, slot: usize, image_index: u32) -> Result<()> {
        let device = &self.device.device;
        let cmd = self.frames[slot].command_buffer;
        let extent = self.swapchain.extent;
        let framebuffer = self.swapchain.framebuffers[image_index as usize];

        unsafe {
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())?;

            let clear = clear_values(self.clear_color);
            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(self.render_pass.handle)
                .framebuffer(framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                })
                .clear_values(&clear);
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);

            // Ray-tracing frames only clear for now
            if self.variant != PipelineVariant::RayTracing {
                self.record_draw(cmd, slot, extent)?;
            }

            device.cmd_end_render_pass(cmd);
            device.end_command_buffer(cmd)?;
        }
        Ok(())
    }

    unsafe fn record_draw(&self, cmd: vk::CommandBuffer, slot: usize, extent: vk::Extent2D) -> Result<()> {
        let device = &self.device.device;

        device.cmd_bind_pipeline(cmd, self.pipeline.bind_point(), self.pipeline.handle);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        device.cmd_set_viewport(cmd, 0, &[viewport]);
        device.cmd_set_scissor(cmd, 0, &[scissor]);

        let set = self.descriptors.set(slot)?;
        device.cmd_bind_descriptor_sets(
            cmd,
            self.pipeline.bind_point(),
            self.pipeline.layout,
            0,
            &[set],
            &[],
        );

        device.cmd_bind_vertex_buffers(cmd, 0, &[self.mesh.vertices.buffer], &[0]);
        device.cmd_bind_index_buffer(cmd, self.mesh.indices.buffer, 0, vk::IndexType::UINT32);
        device.cmd_draw_indexed(cmd, self.mesh.index_count, 1, 0, 0, 0);
        Ok(())
    }

    /// Rebuild the swapchain now. Also satisfies any pending resize request.
    pub fn recreate_swapchain(&mut self, window: &dyn WindowSystem) -> Result<()> {
        self.framebuffer_resized = false;
        self.swapchain.recreate(window)?;
        if let Some(scene) = self.ray_tracing.as_mut() {
            scene.resize_storage(self.swapchain.extent)?;
            self.write_descriptors()?;
        }
        self.stats.recreations += 1;
        Ok(())
    }

    /// Rebuild the pipeline from new shader bytecode. On failure the old
    /// pipeline stays in place.
    pub fn rebuild_pipeline(&mut self, shaders: &ShaderSources) -> Result<()> {
        self.device.wait_idle()?;
        let pipeline = create_pipeline(
            &self.device,
            self.variant,
            &PipelineDesc {
                render_pass: &self.render_pass,
                set_layout: &self.set_layout,
                winding: self.mesh.winding,
            },
            shaders,
        )?;
        self.pipeline = pipeline;
        Ok(())
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!(
            "Shutting down renderer after {} frames ({} swapchain rebuilds)",
            self.stats.presented,
            self.stats.recreations
        );
        if let Err(err) = self.device.wait_idle() {
            log::error!("wait_idle during renderer teardown failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clears_to_color_and_far_depth() {
        let values = clear_values([0.1, 0.2, 0.3, 1.0]);
        unsafe {
            assert_eq!(values[0].color.float32, [0.1, 0.2, 0.3, 1.0]);
            assert_eq!(values[1].depth_stencil.depth, 1.0);
            assert_eq!(values[1].depth_stencil.stencil, 0);
        }
    }

    #[test]
    fn default_desc_waits_forever_on_black() {
        let desc = RendererDesc::default();
        assert_eq!(desc.variant, PipelineVariant::Mesh);
        assert_eq!(desc.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert!(desc.fence_timeout.is_none());
    }
}
