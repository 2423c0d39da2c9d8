// GPU images, layout transitions and textures
//
// GpuImage pairs one image with its allocation and its view. Textures add a
// sampler on top and are always uploaded through a staging buffer.

use super::buffer::find_memory_type;
use super::device::GraphicsDevice;
use super::error::{CreationContext, Result, RhiError};
use ash::vk;
use std::sync::Arc;

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Barrier masks for one supported layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier table. Anything outside it is a bug in the caller.
pub fn layout_transition(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<LayoutTransition> {
    match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => Ok(LayoutTransition {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            Ok(LayoutTransition {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            })
        }
        _ => Err(RhiError::UnsupportedLayoutTransition { old, new }),
    }
}

/// Tightly packed RGBA8 pixels
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl DecodedImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(RhiError::Configuration(format!(
                "image {}x{} needs {} RGBA8 bytes, got {}",
                width,
                height,
                expected,
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn white_pixel() -> Self {
        Self {
            width: 1,
            height: 1,
            pixels: vec![255; 4],
        }
    }
}

/// What to create
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub memory_flags: vk::MemoryPropertyFlags,
}

pub struct GpuImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    device: Arc<GraphicsDevice>,
}

impl GpuImage {
    /// Single-mip, single-layer, exclusively shared 2D image
    pub fn new(device: &Arc<GraphicsDevice>, desc: &ImageDesc) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let vk_device = &device.device;
        let image = unsafe { vk_device.create_image(&image_info, None) }.creating("image")?;

        let memory = match Self::allocate_and_bind(device, image, desc.memory_flags) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { vk_device.destroy_image(image, None) };
                return Err(err);
            }
        };

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = match unsafe { vk_device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(result) => {
                unsafe {
                    vk_device.destroy_image(image, None);
                    vk_device.free_memory(memory, None);
                }
                return Err(RhiError::ResourceCreation {
                    what: "image view",
                    result,
                });
            }
        };

        Ok(Self {
            image,
            memory,
            view,
            format: desc.format,
            extent: desc.extent,
            device: Arc::clone(device),
        })
    }

    /// Depth attachment matching the swapchain extent
    pub fn depth(
        device: &Arc<GraphicsDevice>,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> Result<Self> {
        Self::new(
            device,
            &ImageDesc {
                extent,
                format,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                aspect: vk::ImageAspectFlags::DEPTH,
                memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            },
        )
    }

    fn allocate_and_bind(
        device: &GraphicsDevice,
        image: vk::Image,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory> {
        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let memory_type_index = find_memory_type(
            &device.memory_properties,
            requirements.memory_type_bits,
            memory_flags,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let memory = unsafe { device.device.allocate_memory(&alloc_info, None) }
            .creating("image memory")?;

        if let Err(result) = unsafe { device.device.bind_image_memory(image, memory, 0) } {
            unsafe { device.device.free_memory(memory, None) };
            return Err(RhiError::ResourceCreation {
                what: "image memory binding",
                result,
            });
        }
        Ok(memory)
    }

    /// Record and submit a layout barrier for the colour aspect
    pub fn transition_layout(&self, old: vk::ImageLayout, new: vk::ImageLayout) -> Result<()> {
        let masks = layout_transition(old, new)?;

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old)
            .new_layout(new)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(color_subresource_range())
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access)
            .build();

        self.device.immediate_submit(|device, cmd| unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        })
    }

    /// Copy tightly packed pixels from `buffer`; the image must be in
    /// TRANSFER_DST_OPTIMAL.
    pub fn copy_from_buffer(&self, buffer: vk::Buffer) -> Result<()> {
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            })
            .build();

        self.device.immediate_submit(|device, cmd| unsafe {
            device.cmd_copy_buffer_to_image(
                cmd,
                buffer,
                self.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        })
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Sampled RGBA8 texture
pub struct Texture {
    pub sampler: vk::Sampler,
    pub image: GpuImage,
}

impl Texture {
    /// Staging buffer, image, two transitions, then the staging buffer goes
    /// away. The order matters.
    pub fn upload(device: &Arc<GraphicsDevice>, decoded: &DecodedImage) -> Result<Self> {
        let staging = device.allocate_buffer(
            decoded.pixels.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            Some(&decoded.pixels),
        )?;

        let image = GpuImage::new(
            device,
            &ImageDesc {
                extent: vk::Extent2D {
                    width: decoded.width,
                    height: decoded.height,
                },
                format: TEXTURE_FORMAT,
                usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
                aspect: vk::ImageAspectFlags::COLOR,
                memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            },
        )?;

        image.transition_layout(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        image.copy_from_buffer(staging.buffer)?;
        image.transition_layout(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;
        drop(staging);

        let sampler = create_sampler(device)?;

        log::debug!("Uploaded {}x{} texture", decoded.width, decoded.height);

        Ok(Self { sampler, image })
    }

    /// 1x1 white texture for meshes without one
    pub fn white(device: &Arc<GraphicsDevice>) -> Result<Self> {
        Self::upload(device, &DecodedImage::white_pixel())
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.image
                .device
                .device
                .destroy_sampler(self.sampler, None);
        }
    }
}

fn create_sampler(device: &GraphicsDevice) -> Result<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(true)
        .max_anisotropy(device.max_sampler_anisotropy())
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .mip_lod_bias(0.0)
        .min_lod(0.0)
        .max_lod(0.0);

    unsafe { device.device.create_sampler(&sampler_info, None) }.creating("texture sampler")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_two_transitions_supported() {
        let upload = layout_transition(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(upload.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(upload.dst_access, vk::AccessFlags::TRANSFER_WRITE);

        let sample = layout_transition(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(sample.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(sample.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);

        let reversed = layout_transition(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert!(matches!(
            reversed,
            Err(RhiError::UnsupportedLayoutTransition { .. })
        ));
    }

    #[test]
    fn decoded_image_checks_pixel_count() {
        assert!(DecodedImage::new(2, 2, vec![0; 16]).is_ok());
        assert!(DecodedImage::new(2, 2, vec![0; 12]).is_err());
        assert!(DecodedImage::new(0, 4, Vec::new()).is_err());

        let white = DecodedImage::white_pixel();
        assert_eq!(white.pixels, vec![255, 255, 255, 255]);
    }
}
