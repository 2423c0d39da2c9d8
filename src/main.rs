// =============================================================================
// VK-RHI DEMO - Window shell around the rendering hardware interface
// =============================================================================
//
// The library never sees winit. This binary owns the window, implements the
// `WindowSystem` collaborator on top of it and calls `draw_frame()` whenever
// winit asks for a redraw.
//
// STARTUP:
// 1. config.toml -> Config
// 2. Shaders, texture and mesh from disk
// 3. Instance -> Surface -> Device -> Renderer
//
// PER FRAME:
// 1. Optional shader hot reload
// 2. Renderer::draw_frame (fence, acquire, record, submit, present)
// 3. FPS in the window title
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use log::LevelFilter;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;
use std::time::{Duration, Instant};
use vk_rhi::assets::{self, ShaderWatcher};
use vk_rhi::backend::surface::has_drawable_area;
use vk_rhi::backend::{
    DeviceRequest, FrameOutcome, GraphicsDevice, Renderer, Surface, VulkanInstance, WindowSystem,
};
use vk_rhi::config::Config;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();
    let config = Config::load();
    apply_log_level(&config);

    log::info!("Starting vk-rhi demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Pipeline: {}", config.graphics.pipeline);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Logger up before config.toml is read, at info until it says otherwise
fn init_logging() {
    use env_logger::Builder;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Trace);
    builder.parse_default_env();
    builder.init();

    if let Some(level) = max_level(rust_log_set(), LevelFilter::Info) {
        log::set_max_level(level);
    }
}

fn apply_log_level(config: &Config) {
    if let Some(level) = max_level(rust_log_set(), config.log_level()) {
        log::set_max_level(level);
    }
}

fn rust_log_set() -> bool {
    std::env::var_os("RUST_LOG").is_some()
}

/// RUST_LOG keeps the filter env_logger parsed from it
fn max_level(rust_log_set: bool, configured: LevelFilter) -> Option<LevelFilter> {
    if rust_log_set {
        None
    } else {
        Some(configured)
    }
}

// =============================================================================
// WINDOW-SYSTEM COLLABORATOR
// =============================================================================

struct WinitWindow(Arc<Window>);

impl WindowSystem for WinitWindow {
    fn raw_display_handle(&self) -> RawDisplayHandle {
        self.0.raw_display_handle()
    }

    fn raw_window_handle(&self) -> RawWindowHandle {
        self.0.raw_window_handle()
    }

    fn framebuffer_size(&self) -> vk::Extent2D {
        let size = self.0.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    fn wait_events(&self) {
        // Cannot pump winit from inside a redraw, so the size never changes
        // here. App::render keeps the frame loop away from zero-area windows.
        std::thread::sleep(Duration::from_millis(16));
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the renderer (and with it the surface)
/// must go before the window it was created from.
struct App {
    config: Config,

    renderer: Option<Renderer>,
    shader_watcher: Option<ShaderWatcher>,
    window: Option<WinitWindow>,

    is_fullscreen: bool,
    /// Window has zero area; skip rendering until it comes back
    is_minimized: bool,
    /// First error that stopped the event loop
    fatal: Option<anyhow::Error>,

    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            renderer: None,
            shader_watcher: None,
            window: None,
            is_fullscreen,
            is_minimized: false,
            fatal: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_renderer(&self, window: &WinitWindow) -> Result<Renderer> {
        let desc = self.config.renderer_desc()?;
        let variant = desc.variant;

        let shaders = assets::load_shader_sources(variant, &self.config.assets)?;
        let geometry = assets::load_geometry(&self.config.assets)?;
        let texture = self
            .config
            .assets
            .texture
            .as_deref()
            .map(assets::load_texture)
            .transpose()?;

        let instance = VulkanInstance::new(
            &self.config.window.title,
            Some(window),
            self.config.debug.validation_layers,
        )
        .context("Failed to create Vulkan instance")?;
        let surface = Surface::new(instance.clone(), window).context("Failed to create surface")?;
        let device = GraphicsDevice::new(
            instance,
            &DeviceRequest {
                surface: Some(surface.as_ref()),
                ray_tracing: variant.requires_ray_tracing(),
                policy: self.config.device_policy(),
            },
        )
        .context("Failed to create logical device")?;

        let renderer = Renderer::new(
            device,
            surface,
            window,
            &desc,
            &geometry,
            texture.as_ref(),
            &shaders,
        )
        .context("Failed to create renderer")?;

        Ok(renderer)
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        log::error!("{:#}", err);
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
        event_loop.exit();
    }

    // =========================================================================
    // FRAME
    // =========================================================================

    fn reload_shaders_if_changed(&mut self) {
        let changed = self
            .shader_watcher
            .as_ref()
            .is_some_and(|watcher| watcher.take_changed());
        if !changed {
            return;
        }
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        log::info!("Shaders changed, rebuilding {} pipeline", renderer.variant());
        let rebuilt = assets::load_shader_sources(renderer.variant(), &self.config.assets)
            .and_then(|shaders| Ok(renderer.rebuild_pipeline(&shaders)?));
        if let Err(err) = rebuilt {
            log::error!("Shader reload failed, keeping previous pipeline: {:#}", err);
        }
    }

    fn render(&mut self, event_loop: &ActiveEventLoop) {
        // Load-bearing: draw_frame on a zero-area window would spin in
        // wait_events forever
        let drawable = self
            .window
            .as_ref()
            .is_some_and(|window| has_drawable_area(window.framebuffer_size()));
        if self.is_minimized || !drawable {
            return;
        }
        self.reload_shaders_if_changed();

        let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_ref()) else {
            return;
        };

        match renderer.draw_frame(window) {
            Ok(FrameOutcome::Presented) | Ok(FrameOutcome::Recreated) => self.update_fps(),
            Ok(FrameOutcome::Skipped) => {}
            Err(err) => self.fail(event_loop, anyhow::Error::new(err).context("Render error")),
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.0.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.0.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            if let Some(renderer) = self.renderer.as_mut() {
                renderer.request_resize();
            }
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let (Some(window), Some(renderer)) = (&self.window, &self.renderer) {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.0.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}, {}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    renderer.variant(),
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => WinitWindow(Arc::new(w)),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match self.init_renderer(&window) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                self.fail(event_loop, e);
                return;
            }
        }

        if self.config.debug.hot_reload_shaders {
            match ShaderWatcher::new(&self.config.assets.shader_dir) {
                Ok(watcher) => self.shader_watcher = Some(watcher),
                Err(e) => log::warn!("Shader hot reload disabled: {:#}", e),
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref renderer) = self.renderer {
                    if let Err(e) = renderer.wait_idle() {
                        log::warn!("wait_idle on close failed: {}", e);
                    }
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    if let Some(renderer) = self.renderer.as_mut() {
                        renderer.request_resize();
                    }
                }
            }

            WindowEvent::RedrawRequested => self.render(event_loop),

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.0.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // GPU objects go while the window still exists
        self.shader_watcher = None;
        self.renderer = None;
        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_sets_level_without_rust_log() {
        assert_eq!(max_level(false, LevelFilter::Debug), Some(LevelFilter::Debug));
        assert_eq!(max_level(false, LevelFilter::Info), Some(LevelFilter::Info));
    }

    #[test]
    fn rust_log_overrides_config() {
        assert_eq!(max_level(true, LevelFilter::Error), None);
    }
}
