// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use crate::backend::{DevicePolicy, PipelineVariant, RendererDesc};
use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub device: DeviceConfig,
    pub assets: AssetsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vk-rhi".to_string(),
            width: 800,
            height: 600,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// "triangle", "mesh", "uniform" or "ray_tracing"
    pub pipeline: String,
    /// "auto" picks mailbox when offered, else fifo
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// 0 waits forever
    pub fence_timeout_ms: u64,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            pipeline: "mesh".to_string(),
            present_mode: "auto".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            fence_timeout_ms: 0,
        }
    }
}

/// GPU selection policy
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub prefer_discrete: bool,
    pub reject_integrated: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let policy = DevicePolicy::default();
        Self {
            prefer_discrete: policy.prefer_discrete,
            reject_integrated: policy.reject_integrated,
        }
    }
}

/// Asset locations. Unset shader paths are derived from `shader_dir` and
/// the pipeline variant.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub shader_dir: PathBuf,
    pub vertex_shader: Option<PathBuf>,
    pub fragment_shader: Option<PathBuf>,
    pub raygen_shader: Option<PathBuf>,
    pub miss_shader: Option<PathBuf>,
    pub closest_hit_shader: Option<PathBuf>,
    pub texture: Option<PathBuf>,
    pub mesh: Option<PathBuf>,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            shader_dir: PathBuf::from("shaders"),
            vertex_shader: None,
            fragment_shader: None,
            raygen_shader: None,
            miss_shader: None,
            closest_hit_shader: None,
            texture: None,
            mesh: None,
        }
    }
}

impl AssetsConfig {
    fn resolve(&self, explicit: &Option<PathBuf>, file_name: String) -> PathBuf {
        explicit
            .clone()
            .unwrap_or_else(|| self.shader_dir.join(file_name))
    }

    pub fn vertex_shader_path(&self, variant: PipelineVariant) -> PathBuf {
        self.resolve(&self.vertex_shader, format!("{}.vert.spv", variant.name()))
    }

    pub fn fragment_shader_path(&self, variant: PipelineVariant) -> PathBuf {
        self.resolve(&self.fragment_shader, format!("{}.frag.spv", variant.name()))
    }

    pub fn raygen_shader_path(&self) -> PathBuf {
        self.resolve(&self.raygen_shader, "raytrace.rgen.spv".to_string())
    }

    pub fn miss_shader_path(&self) -> PathBuf {
        self.resolve(&self.miss_shader, "raytrace.rmiss.spv".to_string())
    }

    pub fn closest_hit_shader_path(&self) -> PathBuf {
        self.resolve(&self.closest_hit_shader, "raytrace.rchit.spv".to_string())
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub hot_reload_shaders: bool,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            hot_reload_shaders: false,
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn pipeline_variant(&self) -> Result<PipelineVariant> {
        self.graphics
            .pipeline
            .parse()
            .with_context(|| format!("Invalid graphics.pipeline {:?}", self.graphics.pipeline))
    }

    /// Present mode preference; `None` lets the swapchain choose
    pub fn present_mode(&self) -> Option<vk::PresentModeKHR> {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "auto" | "" => None,
            "immediate" => Some(vk::PresentModeKHR::IMMEDIATE),
            "mailbox" => Some(vk::PresentModeKHR::MAILBOX),
            "fifo" => Some(vk::PresentModeKHR::FIFO),
            "fifo_relaxed" => Some(vk::PresentModeKHR::FIFO_RELAXED),
            _ => {
                log::warn!(
                    "Unknown present mode '{}', letting the swapchain choose",
                    self.graphics.present_mode
                );
                None
            }
        }
    }

    pub fn fence_timeout(&self) -> Option<Duration> {
        match self.graphics.fence_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// `debug.log_level` as a filter; unknown names mean info
    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or_else(|_| {
            log::warn!("Unknown log level '{}', using info", self.debug.log_level);
            log::LevelFilter::Info
        })
    }

    pub fn device_policy(&self) -> DevicePolicy {
        DevicePolicy {
            prefer_discrete: self.device.prefer_discrete,
            reject_integrated: self.device.reject_integrated,
        }
    }

    pub fn renderer_desc(&self) -> Result<RendererDesc> {
        Ok(RendererDesc {
            variant: self.pipeline_variant()?,
            clear_color: self.graphics.clear_color,
            fence_timeout: self.fence_timeout(),
            present_mode: self.present_mode(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 600);
        assert_eq!(config.pipeline_variant().unwrap(), PipelineVariant::Mesh);
        assert_eq!(config.present_mode(), None);
        assert_eq!(config.fence_timeout(), None);
        assert!(config.device.prefer_discrete);
        assert!(!config.device.reject_integrated);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [graphics]
            pipeline = "ray_tracing"
            fence_timeout_ms = 2500

            [device]
            reject_integrated = true
            "#,
        )
        .unwrap();
        assert_eq!(config.pipeline_variant().unwrap(), PipelineVariant::RayTracing);
        assert_eq!(config.fence_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.graphics.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert!(config.device_policy().reject_integrated);
        assert_eq!(config.window.title, "vk-rhi");
    }

    #[test]
    fn present_mode_names() {
        let mut config = Config::default();
        config.graphics.present_mode = "Mailbox".into();
        assert_eq!(config.present_mode(), Some(vk::PresentModeKHR::MAILBOX));
        config.graphics.present_mode = "vsync-ish".into();
        assert_eq!(config.present_mode(), None);
    }

    #[test]
    fn unknown_pipeline_is_an_error() {
        let mut config = Config::default();
        config.graphics.pipeline = "wireframe".into();
        assert!(config.pipeline_variant().is_err());
        assert!(config.renderer_desc().is_err());
    }

    #[test]
    fn shader_paths_follow_variant_unless_overridden() {
        let mut assets = AssetsConfig::default();
        assert_eq!(
            assets.vertex_shader_path(PipelineVariant::Uniform),
            PathBuf::from("shaders/uniform.vert.spv")
        );
        assert_eq!(
            assets.fragment_shader_path(PipelineVariant::TriangleTest),
            PathBuf::from("shaders/triangle.frag.spv")
        );
        assets.vertex_shader = Some(PathBuf::from("custom/v.spv"));
        assert_eq!(
            assets.vertex_shader_path(PipelineVariant::Mesh),
            PathBuf::from("custom/v.spv")
        );
        assert_eq!(assets.raygen_shader_path(), PathBuf::from("shaders/raytrace.rgen.spv"));
    }

    #[test]
    fn log_level_names() {
        let mut config = Config::default();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
        config.debug.log_level = "TRACE".into();
        assert_eq!(config.log_level(), log::LevelFilter::Trace);
        config.debug.log_level = "off".into();
        assert_eq!(config.log_level(), log::LevelFilter::Off);
        config.debug.log_level = "chatty".into();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }

    #[test]
    fn malformed_toml_is_reported() {
        assert!(Config::from_toml("[window\nwidth = ").is_err());
    }
}
