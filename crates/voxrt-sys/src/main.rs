// Entry point: a winit application driving the voxel ray tracer.
//
// The renderer is created once the event loop resumes and a window exists.
// Every redraw renders one frame; mouse motion steers the camera, WASD moves
// it and Escape quits. Any renderer error is logged and ends the process with
// a failure exit code.

use std::process::ExitCode;
use std::time::Instant;

use tracing::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::{DeviceEvent, DeviceId, ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{CursorGrabMode, Window, WindowId};

use voxrt_renderer::{MoveInput, RenderError, RendererConfig, VoxelRenderer};

const WINDOW_TITLE: &str = "VoxRT";

/// Apply a movement key to `input`; returns false for keys that do not move the camera.
fn apply_move_key(input: &mut MoveInput, key: KeyCode, pressed: bool) -> bool {
    match key {
        KeyCode::KeyW => input.forward = pressed,
        KeyCode::KeyS => input.backward = pressed,
        KeyCode::KeyA => input.left = pressed,
        KeyCode::KeyD => input.right = pressed,
        _ => return false,
    }
    true
}

/// Application state for the winit event loop.
struct VoxApp {
    config: RendererConfig,
    // Declared before the window so it is dropped first
    renderer: Option<VoxelRenderer>,
    window: Option<Window>,
    last_frame: Instant,
    failed: bool,
}

impl VoxApp {
    fn new(config: RendererConfig) -> Self {
        Self {
            config,
            renderer: None,
            window: None,
            last_frame: Instant::now(),
            failed: false,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: RenderError) {
        error!("{err}");
        self.failed = true;
        self.renderer = None;
        event_loop.exit();
    }

    fn create_window(&self, event_loop: &ActiveEventLoop) -> Result<Window, RenderError> {
        let attributes = Window::default_attributes()
            .with_title(WINDOW_TITLE)
            .with_inner_size(LogicalSize::new(self.config.width, self.config.height));

        let window = event_loop
            .create_window(attributes)
            .map_err(|e| RenderError::Window(e.to_string()))?;

        // Relative mouse motion drives the camera
        if window
            .set_cursor_grab(CursorGrabMode::Locked)
            .or_else(|_| window.set_cursor_grab(CursorGrabMode::Confined))
            .is_err()
        {
            warn!("Cursor grab is not supported on this platform");
        }
        window.set_cursor_visible(false);

        Ok(window)
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let now = Instant::now();
        let delta_time = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;

        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        if let Err(err) = renderer.render_frame(delta_time) {
            self.fail(event_loop, err);
        }
    }
}

impl ApplicationHandler for VoxApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window = match self.create_window(event_loop) {
            Ok(window) => window,
            Err(err) => return self.fail(event_loop, err),
        };

        // SAFETY: the renderer is declared before the window and dropped first
        match unsafe { VoxelRenderer::new(&window, &self.config) } {
            Ok(renderer) => {
                self.renderer = Some(renderer);
                self.last_frame = Instant::now();
                window.request_redraw();
            }
            Err(err) => {
                self.window = Some(window);
                return self.fail(event_loop, err);
            }
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.resize(size.width, size.height);
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                let PhysicalKey::Code(key) = event.physical_key else {
                    return;
                };
                let pressed = event.state == ElementState::Pressed;

                if key == KeyCode::Escape && pressed {
                    event_loop.exit();
                    return;
                }

                if let Some(renderer) = self.renderer.as_mut() {
                    apply_move_key(&mut renderer.camera_mut().input, key, pressed);
                }
            }

            WindowEvent::RedrawRequested => {
                self.redraw(event_loop);
            }

            _ => {}
        }
    }

    fn device_event(&mut self, _event_loop: &ActiveEventLoop, _device_id: DeviceId, event: DeviceEvent) {
        if let DeviceEvent::MouseMotion { delta } = event {
            if let Some(renderer) = self.renderer.as_mut() {
                // Screen y grows downwards, pitch grows upwards
                renderer.camera_mut().rotate(delta.0, -delta.1);
            }
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(renderer) = self.renderer.take() {
            info!(frames = renderer.frame_number(), "Shutting down");
        }
    }
}

fn install_tracing_subscriber() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    install_tracing_subscriber();

    let config = match RendererConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };
    info!(?config, "Starting");

    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(err) => {
            error!("Failed to create event loop: {err}");
            return ExitCode::FAILURE;
        }
    };
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = VoxApp::new(config);
    if let Err(err) = event_loop.run_app(&mut app) {
        error!("Event loop error: {err}");
        return ExitCode::FAILURE;
    }

    if app.failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
