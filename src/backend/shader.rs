// Shader module loading
//
// Vulkan uses SPIR-V bytecode for shaders. Modules only live as long as
// the pipeline build that consumes them.

use super::error::{CreationContext, Result, RhiError};
use ash::vk;
use std::ffi::CStr;
use std::io::Cursor;

pub const ENTRY_POINT: &CStr = c"main";

/// SPIR-V bytes for every stage of one pipeline variant
#[derive(Debug, Clone)]
pub enum ShaderSources {
    Raster {
        vertex: Vec<u8>,
        fragment: Vec<u8>,
    },
    RayTracing {
        raygen: Vec<u8>,
        miss: Vec<u8>,
        closest_hit: Vec<u8>,
    },
}

/// Decode SPIR-V bytes into words, checking size and magic number
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|err| RhiError::Configuration(format!("invalid SPIR-V: {}", err)))
}

/// Destroyed on drop
pub struct ShaderModule<'a> {
    pub handle: vk::ShaderModule,
    device: &'a ash::Device,
}

impl<'a> ShaderModule<'a> {
    pub fn new(device: &'a ash::Device, bytes: &[u8]) -> Result<Self> {
        let code = spirv_words(bytes)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let handle = unsafe { device.create_shader_module(&create_info, None) }
            .creating("shader module")?;
        Ok(Self { handle, device })
    }

    pub fn stage(&self, stage: vk::ShaderStageFlags) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(self.handle)
            .name(ENTRY_POINT)
            .build()
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_truncated_bytecode() {
        assert!(spirv_words(&[0x03, 0x02, 0x23]).is_err());
    }

    #[test]
    fn rejects_wrong_magic() {
        assert!(spirv_words(&[0u8; 8]).is_err());
    }

    #[test]
    fn accepts_spirv_header() {
        // Magic number followed by a version word
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00];
        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words, vec![0x0723_0203, 0x0001_0000]);
    }
}
