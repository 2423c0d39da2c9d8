// Vertex layout and scene geometry upload
//
// Geometry arrives as flat vertex/index arrays. Once copied into GPU
// buffers the CPU copy can go.

use super::buffer::GpuBuffer;
use super::device::GraphicsDevice;
use super::error::{Result, RhiError};
use super::pipeline::PipelineVariant;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::mem::{offset_of, size_of};
use std::sync::Arc;

/// Interleaved position + color + texture coordinate
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, color) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Vertex, tex_coord) as u32,
            },
        ]
    }
}

/// Order of front-facing triangles, seen in model space with +Y up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Winding {
    Clockwise,
    #[default]
    CounterClockwise,
}

impl Winding {
    /// Front face after the projection's Y flip
    pub fn front_face(self) -> vk::FrontFace {
        match self {
            Winding::Clockwise => vk::FrontFace::CLOCKWISE,
            Winding::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SceneGeometry {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub winding: Winding,
}

impl SceneGeometry {
    /// Built-in RGB triangle, counter-clockwise
    pub fn triangle() -> Self {
        Self {
            vertices: vec![
                Vertex {
                    position: [0.0, -0.5, 0.0],
                    color: [1.0, 0.0, 0.0],
                    tex_coord: [0.5, 0.0],
                },
                Vertex {
                    position: [0.5, 0.5, 0.0],
                    color: [0.0, 1.0, 0.0],
                    tex_coord: [1.0, 1.0],
                },
                Vertex {
                    position: [-0.5, 0.5, 0.0],
                    color: [0.0, 0.0, 1.0],
                    tex_coord: [0.0, 1.0],
                },
            ],
            indices: vec![0, 1, 2],
            winding: Winding::CounterClockwise,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return Err(RhiError::Configuration(format!(
                "geometry needs vertices and indices (got {} and {})",
                self.vertices.len(),
                self.indices.len()
            )));
        }
        if self.indices.len() % 3 != 0 {
            return Err(RhiError::Configuration(format!(
                "index count {} is not a whole number of triangles",
                self.indices.len()
            )));
        }
        let vertex_count = self.vertices.len() as u32;
        if let Some(&bad) = self.indices.iter().find(|&&index| index >= vertex_count) {
            return Err(RhiError::Configuration(format!(
                "index {} out of range for {} vertices",
                bad, vertex_count
            )));
        }
        Ok(())
    }
}

/// Vertex and index buffers for one mesh
pub struct MeshBuffers {
    pub vertices: GpuBuffer,
    pub indices: GpuBuffer,
    pub vertex_count: u32,
    pub index_count: u32,
    pub winding: Winding,
}

impl MeshBuffers {
    pub fn upload(
        device: &Arc<GraphicsDevice>,
        geometry: &SceneGeometry,
        variant: PipelineVariant,
    ) -> Result<Self> {
        geometry.validate()?;

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&geometry.vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&geometry.indices);

        let (vertices, indices) = if variant.requires_ray_tracing() {
            // Acceleration-structure builds read these through device addresses
            let build_input = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
            (
                GpuBuffer::with_data(
                    device,
                    vk::BufferUsageFlags::VERTEX_BUFFER | build_input,
                    &geometry.vertices,
                )?,
                GpuBuffer::with_data(
                    device,
                    vk::BufferUsageFlags::INDEX_BUFFER | build_input,
                    &geometry.indices,
                )?,
            )
        } else {
            (
                device.upload_via_staging(vertex_bytes, vk::BufferUsageFlags::VERTEX_BUFFER)?,
                device.upload_via_staging(index_bytes, vk::BufferUsageFlags::INDEX_BUFFER)?,
            )
        };

        log::debug!(
            "Uploaded mesh: {} vertices, {} indices",
            geometry.vertices.len(),
            geometry.indices.len()
        );

        Ok(Self {
            vertices,
            indices,
            vertex_count: geometry.vertices.len() as u32,
            index_count: geometry.indices.len() as u32,
            winding: geometry.winding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_attributes() {
        assert_eq!(size_of::<Vertex>(), 32);
        assert_eq!(Vertex::binding_description().stride, 32);
        let offsets: Vec<u32> = Vertex::attribute_descriptions()
            .iter()
            .map(|attr| attr.offset)
            .collect();
        assert_eq!(offsets, vec![0, 12, 24]);
    }

    #[test]
    fn builtin_triangle_is_valid() {
        let triangle = SceneGeometry::triangle();
        assert!(triangle.validate().is_ok());
        assert_eq!(triangle.vertices.len(), 3);
        assert_eq!(triangle.indices, vec![0, 1, 2]);
    }

    #[test]
    fn empty_or_broken_geometry_rejected() {
        assert!(SceneGeometry::default().validate().is_err());

        let mut dangling = SceneGeometry::triangle();
        dangling.indices = vec![0, 1, 3];
        assert!(dangling.validate().is_err());

        let mut partial = SceneGeometry::triangle();
        partial.indices = vec![0, 1];
        assert!(partial.validate().is_err());
    }
}
