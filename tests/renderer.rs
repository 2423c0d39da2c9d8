// Frame-loop scenarios against a real driver and a hidden window.
//
// Needs a display and compiled shaders (glslc during the build). winit allows
// one event loop per process, so every scenario runs inside a single test.

use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use vk_rhi::assets;
use vk_rhi::backend::sync::MAX_FRAMES_IN_FLIGHT;
use vk_rhi::backend::{
    DevicePolicy, DeviceRequest, FrameOutcome, GraphicsDevice, PipelineVariant, Renderer,
    RendererDesc, SceneGeometry, Surface, VulkanInstance, WindowSystem,
};
use vk_rhi::config::AssetsConfig;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::window::{Window, WindowId};

/// Real window whose reported size can be overridden for a few queries
struct TestWindow {
    window: Window,
    sizes: RefCell<VecDeque<(u32, u32)>>,
    waits: Cell<usize>,
}

impl TestWindow {
    fn script(&self, sizes: &[(u32, u32)]) {
        self.sizes.borrow_mut().extend(sizes.iter().copied());
    }
}

impl WindowSystem for TestWindow {
    fn raw_display_handle(&self) -> RawDisplayHandle {
        self.window.raw_display_handle()
    }

    fn raw_window_handle(&self) -> RawWindowHandle {
        self.window.raw_window_handle()
    }

    fn framebuffer_size(&self) -> vk::Extent2D {
        let (width, height) = self.sizes.borrow_mut().pop_front().unwrap_or_else(|| {
            let size = self.window.inner_size();
            (size.width, size.height)
        });
        vk::Extent2D { width, height }
    }

    fn wait_events(&self) {
        self.waits.set(self.waits.get() + 1);
    }
}

fn build_renderer(window: &TestWindow) -> Renderer {
    let instance = VulkanInstance::new("vk-rhi-renderer-tests", Some(window), false).unwrap();
    let surface = Surface::new(instance.clone(), window).unwrap();
    let device = GraphicsDevice::new(
        instance,
        &DeviceRequest {
            surface: Some(surface.as_ref()),
            ray_tracing: false,
            policy: DevicePolicy::default(),
        },
    )
    .unwrap();

    let assets_config = AssetsConfig {
        shader_dir: Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders"),
        ..AssetsConfig::default()
    };
    let shaders = assets::load_shader_sources(PipelineVariant::TriangleTest, &assets_config).unwrap();
    let desc = RendererDesc {
        variant: PipelineVariant::TriangleTest,
        ..RendererDesc::default()
    };

    Renderer::new(
        device,
        surface,
        window,
        &desc,
        &SceneGeometry::triangle(),
        None,
        &shaders,
    )
    .unwrap()
}

fn run_scenarios(window: &TestWindow) {
    let mut renderer = build_renderer(window);
    assert_eq!(renderer.variant(), PipelineVariant::TriangleTest);

    // First frame: indexed triangle presented, no rebuild
    assert_eq!(renderer.draw_frame(window).unwrap(), FrameOutcome::Presented);
    let stats = renderer.stats();
    assert_eq!(stats.submissions, 1);
    assert_eq!(stats.presented, 1);
    assert_eq!(stats.recreations, 0);

    // Recreating twice with nothing changed yields the same chain
    let extent = renderer.extent();
    let format = renderer.swapchain().surface_format;
    renderer.recreate_swapchain(window).unwrap();
    renderer.recreate_swapchain(window).unwrap();
    assert_eq!(renderer.extent(), extent);
    let rebuilt = renderer.swapchain().surface_format;
    assert_eq!((rebuilt.format, rebuilt.color_space), (format.format, format.color_space));
    assert_eq!(renderer.stats().recreations, 2);

    // An explicit rebuild satisfies a pending resize request
    renderer.request_resize();
    renderer.recreate_swapchain(window).unwrap();
    assert_eq!(renderer.draw_frame(window).unwrap(), FrameOutcome::Presented);
    assert_eq!(renderer.stats().recreations, 3);

    // Minimized for two queries, then restored
    window.script(&[(0, 0), (0, 0)]);
    renderer.request_resize();
    assert_eq!(renderer.draw_frame(window).unwrap(), FrameOutcome::Recreated);
    assert_eq!(window.waits.get(), 2);
    assert_eq!(renderer.extent(), extent);
    assert_eq!(renderer.draw_frame(window).unwrap(), FrameOutcome::Presented);

    // Never more than MAX_FRAMES_IN_FLIGHT submissions outstanding
    let before = renderer.stats().submissions;
    for _ in 0..20 {
        renderer.draw_frame(window).unwrap();
        assert!(renderer.frames_in_flight() <= MAX_FRAMES_IN_FLIGHT);
    }
    assert_eq!(renderer.stats().submissions, before + 20);

    renderer.wait_idle().unwrap();
}

#[derive(Default)]
struct Harness {
    outcome: Option<std::thread::Result<()>>,
}

impl ApplicationHandler for Harness {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.outcome.is_some() {
            return;
        }

        let attributes = Window::default_attributes()
            .with_title("vk-rhi renderer tests")
            .with_inner_size(PhysicalSize::new(640, 480))
            .with_visible(false);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let window = TestWindow {
                window: event_loop.create_window(attributes).unwrap(),
                sizes: RefCell::new(VecDeque::new()),
                waits: Cell::new(0),
            };
            run_scenarios(&window);
        }));
        self.outcome = Some(outcome);
        event_loop.exit();
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, _event: WindowEvent) {}
}

#[test]
#[ignore = "needs a Vulkan driver, a display and compiled shaders"]
fn frame_loop_scenarios() {
    let mut builder = EventLoop::builder();
    // cargo runs tests off the main thread
    #[cfg(target_os = "linux")]
    winit::platform::x11::EventLoopBuilderExtX11::with_any_thread(&mut builder, true);
    let event_loop = builder.build().unwrap();

    let mut harness = Harness::default();
    event_loop.run_app(&mut harness).unwrap();

    match harness.outcome {
        Some(Err(payload)) => panic::resume_unwind(payload),
        Some(Ok(())) => {}
        None => panic!("event loop exited before the window was created"),
    }
}
