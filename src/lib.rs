// vk-rhi - Vulkan rendering hardware interface
//
// `backend` is the RHI proper. `config` and `assets` are the file-facing
// collaborators the demo binary wires into it.

pub mod assets;
pub mod backend;
pub mod config;
