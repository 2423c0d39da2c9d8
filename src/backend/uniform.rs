// Per-frame uniform data
//
// One persistently mapped, host-coherent buffer per frame in flight. A
// slot's buffer is only written after that slot's fence has signaled.

use super::buffer::GpuBuffer;
use super::device::GraphicsDevice;
use super::error::{Result, RhiError};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use std::sync::Arc;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
    pub light_pos: Vec4,
}

impl UniformBufferObject {
    /// Model spinning 90 degrees per second about +Z, seen from (2, 2, 2)
    pub fn animated(seconds: f32, extent: vk::Extent2D) -> Self {
        let aspect = extent.width.max(1) as f32 / extent.height.max(1) as f32;

        let model = Mat4::from_rotation_z(seconds * 90f32.to_radians());
        let view = Mat4::look_at_rh(Vec3::new(2.0, 2.0, 2.0), Vec3::ZERO, Vec3::Z);
        let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        // Vulkan clip space has +Y pointing down
        proj.y_axis.y *= -1.0;

        Self {
            model,
            view,
            proj,
            light_pos: Vec4::new(2.0, 2.0, 4.0, 1.0),
        }
    }
}

pub struct UniformBuffers {
    buffers: Vec<GpuBuffer>,
}

impl UniformBuffers {
    pub fn new(device: &Arc<GraphicsDevice>, frames: usize) -> Result<Self> {
        let size = std::mem::size_of::<UniformBufferObject>() as vk::DeviceSize;
        let buffers = (0..frames)
            .map(|_| {
                let mut buffer = device.allocate_buffer(
                    size,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                    None,
                )?;
                buffer.map()?;
                Ok(buffer)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { buffers })
    }

    pub fn buffer(&self, frame: usize) -> Result<&GpuBuffer> {
        self.buffers
            .get(frame)
            .ok_or_else(|| RhiError::Configuration(format!("no uniform buffer for frame {}", frame)))
    }

    /// Coherent memory, so no flush
    pub fn update(&mut self, frame: usize, ubo: &UniformBufferObject) -> Result<()> {
        let buffer = self
            .buffers
            .get_mut(frame)
            .ok_or_else(|| RhiError::Configuration(format!("no uniform buffer for frame {}", frame)))?;
        buffer.write_pod(0, std::slice::from_ref(ubo))
    }
}
