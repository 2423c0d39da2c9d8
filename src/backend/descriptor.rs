// Descriptor pool and per-frame descriptor sets
//
// One set per frame in flight. Each points at that frame's own uniform
// buffer; the texture (or the ray-tracing scene) is shared.

use super::buffer::GpuBuffer;
use super::device::GraphicsDevice;
use super::error::{CreationContext, Result, RhiError};
use super::image::Texture;
use super::pipeline::{pool_sizes, DescriptorSetLayout, PipelineVariant};
use super::uniform::UniformBufferObject;
use ash::vk;
use std::sync::Arc;

pub struct FrameDescriptors {
    pub pool: vk::DescriptorPool,
    pub sets: Vec<vk::DescriptorSet>,
    pub variant: PipelineVariant,
    device: Arc<GraphicsDevice>,
}

impl FrameDescriptors {
    pub fn new(
        device: &Arc<GraphicsDevice>,
        layout: &DescriptorSetLayout,
        frames: usize,
    ) -> Result<Self> {
        let frames = frames as u32;
        let sizes = pool_sizes(layout.variant, frames);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(frames);
        let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .creating("descriptor pool")?;

        let mut descriptors = Self {
            pool,
            sets: Vec::new(),
            variant: layout.variant,
            device: Arc::clone(device),
        };

        let layouts = vec![layout.handle; frames as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        descriptors.sets = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .creating("descriptor sets")?;

        Ok(descriptors)
    }

    pub fn set(&self, frame: usize) -> Result<vk::DescriptorSet> {
        self.sets
            .get(frame)
            .copied()
            .ok_or_else(|| RhiError::Configuration(format!("no descriptor set for frame {}", frame)))
    }

    fn uniform_info(ubo: &GpuBuffer) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: ubo.buffer,
            offset: 0,
            range: std::mem::size_of::<UniformBufferObject>() as vk::DeviceSize,
        }
    }

    /// Uniform buffer at binding 0, texture at binding 1
    pub fn write_standard(&self, frame: usize, ubo: &GpuBuffer, texture: &Texture) -> Result<()> {
        let set = self.set(frame)?;

        let buffer_infos = [Self::uniform_info(ubo)];
        let image_infos = [vk::DescriptorImageInfo {
            sampler: texture.sampler,
            image_view: texture.image.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];

        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_infos)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&image_infos)
                .build(),
        ];

        unsafe { self.device.device.update_descriptor_sets(&writes, &[]) };
        Ok(())
    }

    /// TLAS at binding 0, storage image at 1, uniform buffer at 2
    pub fn write_ray_tracing(
        &self,
        frame: usize,
        tlas: vk::AccelerationStructureKHR,
        storage_view: vk::ImageView,
        ubo: &GpuBuffer,
    ) -> Result<()> {
        let set = self.set(frame)?;

        let structures = [tlas];
        let mut structure_info = vk::WriteDescriptorSetAccelerationStructureKHR::builder()
            .acceleration_structures(&structures);
        let mut structure_write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut structure_info)
            .build();
        // The count is not derived from any info array for this type
        structure_write.descriptor_count = 1;

        let image_infos = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: storage_view,
            image_layout: vk::ImageLayout::GENERAL,
        }];
        let buffer_infos = [Self::uniform_info(ubo)];

        let writes = [
            structure_write,
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&image_infos)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(2)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_infos)
                .build(),
        ];

        unsafe { self.device.device.update_descriptor_sets(&writes, &[]) };
        Ok(())
    }
}

impl Drop for FrameDescriptors {
    fn drop(&mut self) {
        // Sets are freed with the pool
        unsafe { self.device.device.destroy_descriptor_pool(self.pool, None) };
    }
}
