//! Mapping from window events to renderer lifecycle hooks.

use winit::event::WindowEvent;

/// What the frame driver must hear about a window event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// New drawable size; zero in either dimension means minimized.
    Resize { width: u32, height: u32 },
    /// The window can no longer be seen.
    Pause,
    Resume,
    Redraw,
    Close,
}

/// Translate `event`, or `None` if the renderer does not care about it.
pub fn lifecycle(event: &WindowEvent) -> Option<Lifecycle> {
    match event {
        WindowEvent::Resized(size) => Some(Lifecycle::Resize {
            width: size.width,
            height: size.height,
        }),
        WindowEvent::Occluded(true) => Some(Lifecycle::Pause),
        WindowEvent::Occluded(false) => Some(Lifecycle::Resume),
        WindowEvent::RedrawRequested => Some(Lifecycle::Redraw),
        WindowEvent::CloseRequested | WindowEvent::Destroyed => Some(Lifecycle::Close),
        _ => None,
    }
}
