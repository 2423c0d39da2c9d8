// Ray tracing scaffolding
//
// Device extensions and feature chain, one BLAS over the uploaded mesh, one
// TLAS with a single instance, the output storage image and the ray-tracing
// pipeline. Frames using it currently clear and present without tracing.

use super::buffer::GpuBuffer;
use super::device::GraphicsDevice;
use super::error::{CreationContext, Result, RhiError};
use super::geometry::{MeshBuffers, Vertex};
use super::image::{GpuImage, ImageDesc};
use super::shader::{ShaderModule, ShaderSources};
use ash::extensions::khr;
use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;

/// Output image format for the raygen shader
pub const STORAGE_IMAGE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

const IDENTITY_TRANSFORM: [f32; 12] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0,
];

pub fn required_device_extensions() -> [&'static CStr; 7] {
    [
        khr::AccelerationStructure::name(),
        khr::RayTracingPipeline::name(),
        khr::BufferDeviceAddress::name(),
        khr::DeferredHostOperations::name(),
        vk::ExtDescriptorIndexingFn::name(),
        vk::KhrSpirv14Fn::name(),
        vk::KhrShaderFloatControlsFn::name(),
    ]
}

/// Feature structs chained into device creation
pub struct RayTracingFeatures {
    buffer_device_address: vk::PhysicalDeviceBufferDeviceAddressFeatures,
    pipeline: vk::PhysicalDeviceRayTracingPipelineFeaturesKHR,
    acceleration_structure: vk::PhysicalDeviceAccelerationStructureFeaturesKHR,
}

impl RayTracingFeatures {
    pub fn enabled() -> Self {
        Self {
            buffer_device_address: vk::PhysicalDeviceBufferDeviceAddressFeatures::builder()
                .buffer_device_address(true)
                .build(),
            pipeline: vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder()
                .ray_tracing_pipeline(true)
                .build(),
            acceleration_structure: vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
                .acceleration_structure(true)
                .build(),
        }
    }

    pub fn chain<'a>(
        &'a mut self,
        info: vk::DeviceCreateInfoBuilder<'a>,
    ) -> vk::DeviceCreateInfoBuilder<'a> {
        info.push_next(&mut self.buffer_device_address)
            .push_next(&mut self.pipeline)
            .push_next(&mut self.acceleration_structure)
    }
}

/// An acceleration structure and the buffer backing it
pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub address: vk::DeviceAddress,
    loader: khr::AccelerationStructure,
    _buffer: GpuBuffer,
}

impl AccelerationStructure {
    fn build(
        device: &Arc<GraphicsDevice>,
        loader: &khr::AccelerationStructure,
        ty: vk::AccelerationStructureTypeKHR,
        geometry: vk::AccelerationStructureGeometryKHR,
        primitive_count: u32,
    ) -> Result<Self> {
        let geometries = [geometry];
        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(ty)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries)
            .build();

        let sizes = unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[primitive_count],
            )
        };

        let buffer = device.allocate_buffer(
            sizes.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            None,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.buffer)
            .size(sizes.acceleration_structure_size)
            .ty(ty);
        let handle = unsafe { loader.create_acceleration_structure(&create_info, None) }
            .creating("acceleration structure")?;

        let mut structure = Self {
            handle,
            address: 0,
            loader: loader.clone(),
            _buffer: buffer,
        };

        let scratch = device.allocate_buffer(
            sizes.build_scratch_size.max(1),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            None,
        )?;

        build_info.dst_acceleration_structure = handle;
        build_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: scratch.device_address(),
        };

        let range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        };

        device.immediate_submit(|_, cmd| unsafe {
            loader.cmd_build_acceleration_structures(cmd, &[build_info], &[&[range]]);
        })?;
        drop(scratch);

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(handle);
        structure.address =
            unsafe { loader.get_acceleration_structure_device_address(&address_info) };

        Ok(structure)
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_acceleration_structure(self.handle, None) };
    }
}

/// Everything the ray-tracing descriptor sets point at
pub struct RayTracingScene {
    pub tlas: AccelerationStructure,
    pub blas: AccelerationStructure,
    pub storage_image: GpuImage,
    _instances: GpuBuffer,
    _transform: GpuBuffer,
    device: Arc<GraphicsDevice>,
}

impl RayTracingScene {
    pub fn build(
        device: &Arc<GraphicsDevice>,
        mesh: &MeshBuffers,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        if !device.ray_tracing_enabled {
            return Err(RhiError::Configuration(
                "device was created without ray-tracing support".into(),
            ));
        }
        let loader = khr::AccelerationStructure::new(&device.instance().instance, &device.device);

        let build_input = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;

        let transform = GpuBuffer::with_data(device, build_input, &IDENTITY_TRANSFORM)?;

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: mesh.vertices.device_address(),
            })
            .vertex_stride(std::mem::size_of::<Vertex>() as vk::DeviceSize)
            .max_vertex(mesh.vertex_count.saturating_sub(1))
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: mesh.indices.device_address(),
            })
            .transform_data(vk::DeviceOrHostAddressConstKHR {
                device_address: transform.device_address(),
            })
            .build();
        let blas_geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .build();

        let blas = AccelerationStructure::build(
            device,
            &loader,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            blas_geometry,
            mesh.index_count / 3,
        )?;

        let instance = vk::AccelerationStructureInstanceKHR {
            transform: vk::TransformMatrixKHR {
                matrix: IDENTITY_TRANSFORM,
            },
            instance_custom_index_and_mask: vk::Packed24_8::new(0, 0xFF),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                0,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: blas.address,
            },
        };
        // The instance record is plain data laid out for the GPU
        let instance_bytes = unsafe {
            std::slice::from_raw_parts(
                (&instance as *const vk::AccelerationStructureInstanceKHR).cast::<u8>(),
                std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(),
            )
        };
        let instances = device.allocate_buffer(
            instance_bytes.len() as vk::DeviceSize,
            build_input,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            Some(instance_bytes),
        )?;

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instances.device_address(),
            })
            .build();
        let tlas_geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            })
            .build();

        let tlas = AccelerationStructure::build(
            device,
            &loader,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            tlas_geometry,
            1,
        )?;

        let storage_image = Self::create_storage_image(device, extent)?;

        log::info!("Built acceleration structures ({} triangles)", mesh.index_count / 3);

        Ok(Self {
            tlas,
            blas,
            storage_image,
            _instances: instances,
            _transform: transform,
            device: Arc::clone(device),
        })
    }

    fn create_storage_image(device: &Arc<GraphicsDevice>, extent: vk::Extent2D) -> Result<GpuImage> {
        GpuImage::new(
            device,
            &ImageDesc {
                extent,
                format: STORAGE_IMAGE_FORMAT,
                usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
                aspect: vk::ImageAspectFlags::COLOR,
                memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            },
        )
    }

    /// Match the output image to a new swapchain extent
    pub fn resize_storage(&mut self, extent: vk::Extent2D) -> Result<()> {
        if self.storage_image.extent == extent {
            return Ok(());
        }
        self.storage_image = Self::create_storage_image(&self.device, extent)?;
        Ok(())
    }
}

/// Raygen, miss and closest-hit groups, recursion depth 1
pub fn create_ray_tracing_pipeline(
    device: &Arc<GraphicsDevice>,
    layout: vk::PipelineLayout,
    shaders: &ShaderSources,
) -> Result<vk::Pipeline> {
    let ShaderSources::RayTracing {
        raygen,
        miss,
        closest_hit,
    } = shaders
    else {
        return Err(RhiError::Configuration(
            "ray-tracing pipeline needs raygen, miss and closest-hit stages".into(),
        ));
    };

    let raygen_module = ShaderModule::new(&device.device, raygen)?;
    let miss_module = ShaderModule::new(&device.device, miss)?;
    let hit_module = ShaderModule::new(&device.device, closest_hit)?;

    let stages = [
        raygen_module.stage(vk::ShaderStageFlags::RAYGEN_KHR),
        miss_module.stage(vk::ShaderStageFlags::MISS_KHR),
        hit_module.stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR),
    ];

    let general = |shader: u32| {
        vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(shader)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
            .build()
    };
    let groups = [
        general(0),
        general(1),
        vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
            .general_shader(vk::SHADER_UNUSED_KHR)
            .closest_hit_shader(2)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
            .build(),
    ];

    let create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
        .stages(&stages)
        .groups(&groups)
        .max_pipeline_ray_recursion_depth(1)
        .layout(layout)
        .build();

    let loader = khr::RayTracingPipeline::new(&device.instance().instance, &device.device);
    let pipelines = unsafe {
        loader.create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            &[create_info],
            None,
        )
    }
    .creating("ray-tracing pipeline")?;

    pipelines
        .into_iter()
        .next()
        .ok_or(RhiError::ResourceCreation {
            what: "ray-tracing pipeline",
            result: vk::Result::ERROR_UNKNOWN,
        })
}
