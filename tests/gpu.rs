// Tests against a real Vulkan driver on a headless device.
//
// Run with `cargo test -- --ignored` on a machine with a GPU (or lavapipe).

use ash::vk;
use std::sync::Arc;
use vk_rhi::backend::descriptor::FrameDescriptors;
use vk_rhi::backend::geometry::MeshBuffers;
use vk_rhi::backend::image::ImageDesc;
use vk_rhi::backend::pipeline::DescriptorSetLayout;
use vk_rhi::backend::sync::{FrameSlot, MAX_FRAMES_IN_FLIGHT};
use vk_rhi::backend::uniform::{UniformBufferObject, UniformBuffers};
use vk_rhi::backend::{
    DecodedImage, DevicePolicy, DeviceRequest, ErrorCategory, GpuBuffer, GpuImage, GraphicsDevice,
    PipelineVariant, RhiError, SceneGeometry, Texture, VulkanInstance,
};

fn headless_device() -> Arc<GraphicsDevice> {
    let instance = VulkanInstance::new("vk-rhi-tests", None, false).unwrap();
    GraphicsDevice::new(
        instance,
        &DeviceRequest {
            surface: None,
            ray_tracing: false,
            policy: DevicePolicy::default(),
        },
    )
    .unwrap()
}

fn host() -> vk::MemoryPropertyFlags {
    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn host_visible_buffer_round_trip() {
    let device = headless_device();
    let mut buffer = device
        .allocate_buffer(64, vk::BufferUsageFlags::TRANSFER_SRC, host(), None)
        .unwrap();

    buffer.map().unwrap();
    buffer.write(16, &[1, 2, 3, 4]).unwrap();
    assert_eq!(buffer.read(16, 4).unwrap(), vec![1, 2, 3, 4]);

    let err = buffer.write(62, &[0; 4]).unwrap_err();
    assert!(matches!(err, RhiError::BufferOverflow { .. }));
    assert_eq!(err.category(), ErrorCategory::Programming);
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn zero_sized_buffer_is_rejected() {
    let device = headless_device();
    let result = device.allocate_buffer(0, vk::BufferUsageFlags::VERTEX_BUFFER, host(), None);
    assert!(result.is_err());
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn staged_upload_reaches_device_local_memory() {
    let device = headless_device();
    let data: Vec<u32> = (0..256).collect();
    let bytes: &[u8] = bytemuck::cast_slice(&data);

    let uploaded = device
        .upload_via_staging(bytes, vk::BufferUsageFlags::TRANSFER_SRC)
        .unwrap();
    assert!(uploaded
        .memory_flags
        .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL));

    let mut readback = device
        .allocate_buffer(
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_DST,
            host(),
            None,
        )
        .unwrap();
    device
        .copy_buffer(&uploaded, &readback, bytes.len() as vk::DeviceSize)
        .unwrap();

    readback.map().unwrap();
    assert_eq!(readback.read(0, bytes.len()).unwrap(), bytes);
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn texture_upload_and_illegal_transition() {
    let device = headless_device();

    let pixels: Vec<u8> = (0..4 * 4 * 4).map(|i| i as u8).collect();
    let decoded = DecodedImage::new(4, 4, pixels).unwrap();
    let texture = Texture::upload(&device, &decoded).unwrap();
    assert_eq!(texture.image.extent.width, 4);
    assert_ne!(texture.sampler, vk::Sampler::null());

    let image = GpuImage::new(
        &device,
        &ImageDesc {
            extent: vk::Extent2D {
                width: 8,
                height: 8,
            },
            format: vk::Format::R8G8B8A8_SRGB,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            aspect: vk::ImageAspectFlags::COLOR,
            memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        },
    )
    .unwrap();
    let err = image
        .transition_layout(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap_err();
    assert!(matches!(err, RhiError::UnsupportedLayoutTransition { .. }));
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn descriptor_sets_for_every_frame() {
    let device = headless_device();
    let layout = DescriptorSetLayout::new(&device, PipelineVariant::Mesh).unwrap();
    let descriptors = FrameDescriptors::new(&device, &layout, MAX_FRAMES_IN_FLIGHT).unwrap();
    let uniforms = UniformBuffers::new(&device, MAX_FRAMES_IN_FLIGHT).unwrap();
    let texture = Texture::white(&device).unwrap();

    for frame in 0..MAX_FRAMES_IN_FLIGHT {
        descriptors
            .write_standard(frame, uniforms.buffer(frame).unwrap(), &texture)
            .unwrap();
    }
    assert!(descriptors.set(MAX_FRAMES_IN_FLIGHT).is_err());
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn uniform_buffers_stay_mapped() {
    let device = headless_device();
    let mut uniforms = UniformBuffers::new(&device, 2).unwrap();
    let ubo = UniformBufferObject::animated(
        0.5,
        vk::Extent2D {
            width: 640,
            height: 480,
        },
    );
    uniforms.update(1, &ubo).unwrap();

    let buffer: &GpuBuffer = uniforms.buffer(1).unwrap();
    assert!(buffer.is_mapped());
    let bytes = buffer
        .read(0, std::mem::size_of::<UniformBufferObject>())
        .unwrap();
    assert_eq!(bytes, bytemuck::bytes_of(&ubo));
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn triangle_uploads_for_raster_variants() {
    let device = headless_device();
    let mesh = MeshBuffers::upload(&device, &SceneGeometry::triangle(), PipelineVariant::Mesh).unwrap();
    assert_eq!(mesh.vertex_count, 3);
    assert_eq!(mesh.index_count, 3);

    let empty = SceneGeometry::default();
    let err = MeshBuffers::upload(&device, &empty, PipelineVariant::Mesh)
        .err()
        .unwrap();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn fresh_frame_slot_does_not_block() {
    let device = headless_device();
    let slot = FrameSlot::new(&device).unwrap();
    slot.wait(0, Some(std::time::Duration::from_millis(100)))
        .unwrap();
    slot.reset_fence().unwrap();
    let err = slot
        .wait(0, Some(std::time::Duration::from_millis(10)))
        .unwrap_err();
    assert!(matches!(err, RhiError::FenceTimeout { slot: 0, .. }));
}
