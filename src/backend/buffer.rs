// GPU buffers
//
// A GpuBuffer owns exactly one vk::Buffer and the one allocation bound to
// it. Both halves are released together in Drop.

use super::device::GraphicsDevice;
use super::error::{CreationContext, Result, RhiError};
use ash::vk;
use bytemuck::Pod;
use std::ptr::NonNull;
use std::sync::Arc;

/// Index of the first memory type allowed by `type_bits` that has all of
/// `required` properties.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            let allowed = type_bits & (1 << i) != 0;
            allowed
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
        .ok_or(RhiError::NoCompatibleMemoryType {
            type_bits,
            properties: required,
        })
}

fn check_range(
    offset: vk::DeviceSize,
    len: usize,
    capacity: vk::DeviceSize,
) -> Result<()> {
    let requested = len as vk::DeviceSize;
    match offset.checked_add(requested) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(RhiError::BufferOverflow {
            offset,
            requested,
            capacity,
        }),
    }
}

pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory_flags: vk::MemoryPropertyFlags,
    mapped: Option<NonNull<u8>>,
    device: Arc<GraphicsDevice>,
}

impl GpuBuffer {
    /// Create, allocate and bind. `initial` is copied in through a temporary
    /// mapping when given, which requires host-visible memory.
    pub fn new(
        device: &Arc<GraphicsDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
        initial: Option<&[u8]>,
    ) -> Result<Self> {
        if size == 0 {
            return Err(RhiError::Configuration("buffer size must be non-zero".into()));
        }
        if let Some(bytes) = initial {
            check_range(0, bytes.len(), size)?;
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let vk_device = &device.device;
        let buffer = unsafe { vk_device.create_buffer(&buffer_info, None) }.creating("buffer")?;

        let memory = match Self::allocate_and_bind(device, buffer, usage, memory_flags) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { vk_device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let mut gpu_buffer = Self {
            buffer,
            memory,
            size,
            usage,
            memory_flags,
            mapped: None,
            device: Arc::clone(device),
        };

        if let Some(bytes) = initial {
            gpu_buffer.map()?;
            gpu_buffer.write(0, bytes)?;
            gpu_buffer.flush()?;
            gpu_buffer.unmap();
        }

        Ok(gpu_buffer)
    }

    /// Host-visible, host-coherent buffer holding `data`
    pub fn with_data<T: Pod>(
        device: &Arc<GraphicsDevice>,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        Self::new(
            device,
            bytes.len() as vk::DeviceSize,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            Some(bytes),
        )
    }

    fn allocate_and_bind(
        device: &GraphicsDevice,
        buffer: vk::Buffer,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory> {
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
        let memory_type_index = find_memory_type(
            &device.memory_properties,
            requirements.memory_type_bits,
            memory_flags,
        )?;

        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            alloc_info = alloc_info.push_next(&mut flags_info);
        }

        let memory = unsafe { device.device.allocate_memory(&alloc_info, None) }
            .creating("buffer memory")?;

        if let Err(result) = unsafe { device.device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe { device.device.free_memory(memory, None) };
            return Err(RhiError::ResourceCreation {
                what: "buffer memory binding",
                result,
            });
        }

        Ok(memory)
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Map the whole allocation. Mapping twice is a no-op.
    pub fn map(&mut self) -> Result<()> {
        if self.mapped.is_some() {
            return Ok(());
        }
        let ptr = unsafe {
            self.device.device.map_memory(
                self.memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )
        }?;
        self.mapped = NonNull::new(ptr.cast::<u8>());
        self.mapped.map(|_| ()).ok_or(RhiError::NotMapped)
    }

    pub fn unmap(&mut self) {
        if self.mapped.take().is_some() {
            unsafe { self.device.device.unmap_memory(self.memory) };
        }
    }

    pub fn write(&mut self, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()> {
        check_range(offset, bytes.len(), self.size)?;
        let base = self.mapped.ok_or(RhiError::NotMapped)?;
        unsafe {
            base.as_ptr()
                .add(offset as usize)
                .copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        }
        Ok(())
    }

    pub fn write_pod<T: Pod>(&mut self, offset: vk::DeviceSize, data: &[T]) -> Result<()> {
        self.write(offset, bytemuck::cast_slice(data))
    }

    pub fn read(&self, offset: vk::DeviceSize, len: usize) -> Result<Vec<u8>> {
        check_range(offset, len, self.size)?;
        let base = self.mapped.ok_or(RhiError::NotMapped)?;
        let mut out = vec![0u8; len];
        unsafe {
            out.as_mut_ptr()
                .copy_from_nonoverlapping(base.as_ptr().add(offset as usize), len);
        }
        Ok(out)
    }

    /// Make host writes visible to the device. Coherent memory needs nothing.
    pub fn flush(&self) -> Result<()> {
        if self
            .memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }
        let range = vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE);
        unsafe { self.device.device.flush_mapped_memory_ranges(&[range.build()]) }?;
        Ok(())
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device.buffer_device_address(self.buffer)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.unmap();
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

impl GraphicsDevice {
    /// Single creation path for every buffer in the renderer
    pub fn allocate_buffer(
        self: &Arc<Self>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
        initial: Option<&[u8]>,
    ) -> Result<GpuBuffer> {
        GpuBuffer::new(self, size, usage, memory_flags, initial)
    }

    /// Copy `bytes` into a new device-local buffer through a staging buffer.
    /// The staging buffer is gone by the time this returns.
    pub fn upload_via_staging(
        self: &Arc<Self>,
        bytes: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<GpuBuffer> {
        let size = bytes.len() as vk::DeviceSize;
        let staging = self.allocate_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            Some(bytes),
        )?;
        let target = self.allocate_buffer(
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            None,
        )?;

        self.copy_buffer(&staging, &target, size)?;
        Ok(target)
    }

    pub fn copy_buffer(&self, src: &GpuBuffer, dst: &GpuBuffer, size: vk::DeviceSize) -> Result<()> {
        check_range(0, size as usize, src.size.min(dst.size))?;
        self.immediate_submit(|device, cmd| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            };
            unsafe { device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]) };
        })
    }

    pub fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        props
    }

    #[test]
    fn memory_type_respects_type_bits() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL, host, host]);

        assert_eq!(find_memory_type(&props, 0b111, host).unwrap(), 1);
        // Type 1 masked out
        assert_eq!(find_memory_type(&props, 0b101, host).unwrap(), 2);
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn missing_memory_type_is_a_programming_error() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let err = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap_err();
        assert_eq!(err.category(), super::super::error::ErrorCategory::Programming);
    }

    #[test]
    fn range_checks() {
        assert!(check_range(0, 64, 64).is_ok());
        assert!(check_range(32, 32, 64).is_ok());
        assert!(matches!(
            check_range(33, 32, 64),
            Err(RhiError::BufferOverflow { offset: 33, requested: 32, capacity: 64 })
        ));
        assert!(check_range(u64::MAX, 1, 64).is_err());
    }
}
