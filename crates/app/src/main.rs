//! kiln demo: a spinning textured cube.
//!
//! Runs against Vulkan in a window, or against the headless backend with
//! `--headless`.

mod cli;
mod scene;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::WindowId;

use kiln_core::{EngineConfig, FrameClock, fatal};
use kiln_platform::{Lifecycle, Window, lifecycle};
use kiln_renderer::{FrameDriver, FrameOutcome};
use kiln_rhi::headless::HeadlessBackend;
use kiln_rhi::vulkan::VulkanBackend;

use cli::Cli;
use scene::DemoScene;

/// Window, device and scene. Fields drop in declaration order: the driver
/// waits for the GPU before the scene's buffers go, and the window outlives
/// the surface.
struct App {
    driver: Option<FrameDriver>,
    scene: Option<DemoScene>,
    window: Option<Window>,
    config: EngineConfig,
    clock: FrameClock,
}

impl App {
    fn new(config: EngineConfig) -> Self {
        Self {
            driver: None,
            scene: None,
            window: None,
            config,
            clock: FrameClock::new(),
        }
    }

    fn start(&mut self, event_loop: &ActiveEventLoop) -> kiln_core::Result<()> {
        let window = Window::new(event_loop, &self.config.window)?;
        let (display, handle) = window.raw_handles()?;
        // SAFETY: the window is stored in `self` and dropped after the driver
        // and scene, which hold the last references to the backend.
        let backend = unsafe { VulkanBackend::new(display, handle, self.config.debug.validation)? };
        let mut driver = FrameDriver::new(backend, &self.config, window.width(), window.height())?;
        let scene = DemoScene::build(&mut driver)?;

        info!("Initialization complete, entering main loop");
        self.driver = Some(driver);
        self.scene = Some(scene);
        self.window = Some(window);
        Ok(())
    }

    fn redraw(&mut self) {
        let delta = self.clock.tick();
        let (Some(driver), Some(scene)) = (self.driver.as_mut(), self.scene.as_mut()) else {
            return;
        };
        scene.tick(driver, delta);
        match driver.draw_frame(&mut scene.drawables) {
            Ok(FrameOutcome::Presented) => {
                if self.clock.frames().is_multiple_of(600) {
                    info!("{:.1} fps", self.clock.fps());
                }
            }
            Ok(_) => {}
            Err(e) => fatal("draw_frame", e),
        }
    }

    fn shutdown(&mut self) {
        if let Some(driver) = &self.driver {
            info!("Shutting down: {:?}", driver.stats());
        }
        self.driver = None;
        self.scene = None;
        self.window = None;
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        match &mut self.driver {
            Some(driver) => driver.on_resume(),
            None => {
                if let Err(e) = self.start(event_loop) {
                    fatal("startup", e);
                }
            }
        }
    }

    fn suspended(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(driver) = &mut self.driver
            && let Err(e) = driver.on_pause()
        {
            fatal("on_pause", e);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let WindowEvent::KeyboardInput { event: key, .. } = &event
            && key.state.is_pressed()
            && key.physical_key == PhysicalKey::Code(KeyCode::Escape)
        {
            event_loop.exit();
            return;
        }

        match lifecycle(&event) {
            Some(Lifecycle::Close) => {
                info!("Close requested, shutting down");
                event_loop.exit();
            }
            Some(Lifecycle::Resize { width, height }) => {
                let changed = self.window.as_mut().is_some_and(|w| w.resize(width, height));
                if changed && let Some(driver) = &mut self.driver {
                    driver.on_resize(width, height);
                }
            }
            Some(Lifecycle::Pause) => {
                if let Some(driver) = &mut self.driver
                    && let Err(e) = driver.on_pause()
                {
                    fatal("on_pause", e);
                }
            }
            Some(Lifecycle::Resume) => {
                if let Some(driver) = &mut self.driver {
                    driver.on_resume();
                }
            }
            Some(Lifecycle::Redraw) => self.redraw(),
            None => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window
            && !window.is_minimized()
        {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}

/// Render `frames` frames on the headless backend and report what the
/// device saw.
fn run_headless(config: &EngineConfig, frames: u64) -> kiln_core::Result<()> {
    let backend = HeadlessBackend::new();
    let mut driver = FrameDriver::new(
        backend.clone(),
        config,
        config.window.width,
        config.window.height,
    )?;
    let mut scene = DemoScene::build(&mut driver)?;
    let mut clock = FrameClock::new();

    for _ in 0..frames {
        let delta = clock.tick();
        scene.tick(&mut driver, delta);
        driver.draw_frame(&mut scene.drawables)?;
    }

    let stats = driver.stats();
    let device = backend.stats();
    info!(
        "Headless run: {} presented, {} skipped, {} primary records, {} secondary records",
        stats.frames_presented, stats.frames_skipped, device.primary_records, device.secondary_records
    );
    if device.in_flight_rerecords > 0 {
        warn!("{} command buffer(s) re-recorded while in flight", device.in_flight_rerecords);
    }
    drop(driver);
    drop(scene);
    info!("Live device objects after shutdown: {}", backend.live_objects());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = EngineConfig::load_or_default(&cli.config)?;
    kiln_core::init_logging_with(&config.debug.log_filter);
    info!("Starting kiln");

    config.debug.validation |= cli.validation;
    config.frames.strict_command_reuse |= cli.strict;

    if cli.headless {
        run_headless(&config, cli.frames)?;
        return Ok(());
    }

    // Vulkan forbids re-recording a secondary that a recorded primary
    // still references.
    config.frames.strict_command_reuse = true;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    Ok(())
}
