//! Capture backend abstraction and the pipeline pieces the producers drive.
//!
//! Concrete screen grabbers are external collaborators; the relay consumes
//! only this interface and must not assume any particular one is available.

pub mod copy;
pub mod damage;
pub mod diff;
pub mod framebuffer;
pub mod pattern;
pub mod tracker;

use std::io;
use std::sync::Arc;

use crate::capture::diff::DiffMap;
use crate::capture::framebuffer::Framebuffer;

/// Outcome of a capture operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureResult {
    Ok,
    /// Nothing changed within the backend's wait window.
    Timeout,
    /// The capture surface went away (mode switch, session change); tear the
    /// backend down and re-create it, keeping the shared region.
    Reinit,
    /// Unrecoverable; the host exits.
    Error,
}

/// Pixel formats a backend may produce. Frame and cursor grabs share the
/// namespace; posting a cursor format as a frame (or vice versa) is how a
/// buggy backend gets its output dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureFormat {
    #[default]
    Bgra,
    Rgba,
    Rgba10,
    Yuv420,

    // cursor shapes
    Color,
    Mono,
    Masked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureRotation {
    #[default]
    Rot0,
    Rot90,
    Rot180,
    Rot270,
}

/// Description of a grabbed frame, filled by `wait_frame`.
#[derive(Debug, Clone, Default)]
pub struct CaptureFrame {
    /// Bumped by the backend whenever dimensions, stride or format change.
    pub format_ver: u32,

    pub width: u32,

    /// Rows that fit the frame buffer budget; `real_height` is the full
    /// capture height.
    pub height: u32,
    pub real_height: u32,

    /// Row length in pixels.
    pub stride: u32,

    /// Row length in bytes.
    pub pitch: u32,

    pub rotation: CaptureRotation,
    pub format: CaptureFormat,

    /// Dirty 128x128 blocks of this grab relative to the previous one.
    pub damage: DiffMap,
}

/// A cursor event, delivered through [`PointerSink::post_pointer_buffer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CapturePointer {
    pub position_update: bool,

    /// When set, the shape pixels have been written into the buffer obtained
    /// from [`PointerSink::get_pointer_buffer`].
    pub shape_update: bool,

    pub visible: bool,
    pub x: i32,
    pub y: i32,

    /// Hotspot offset within the shape.
    pub hx: i32,
    pub hy: i32,

    pub format: CaptureFormat,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
}

/// A writable span for cursor shape pixels, pointing into the shared region.
#[derive(Debug, Clone, Copy)]
pub struct PointerBuffer {
    pub data: *mut u8,
    pub size: u32,
}

unsafe impl Send for PointerBuffer {}

/// The callback pair the relay hands to a backend at creation. The backend
/// may drive it from its own cursor thread, as long as it serialises its
/// calls: obtain a buffer, write the shape, post.
pub trait PointerSink: Send + Sync {
    /// Obtain a writable region for cursor pixels. Blocks while the pointer
    /// queue is saturated; `None` means the host is shutting down.
    fn get_pointer_buffer(&self) -> Option<PointerBuffer>;

    /// Commit a cursor update.
    fn post_pointer_buffer(&self, pointer: CapturePointer);
}

/// Contract between the relay and a screen grabber.
///
/// Lifecycle: `create(sink)` once, then `init` / (`stop`, `deinit`) cycles
/// as the capture surface comes and goes; `deinit` must be idempotent.
/// Threading: `capture` is driven from the caller's main thread while
/// `wait_frame` / `get_frame` run on the frame thread; implementations
/// serialise internally. `stop` must make an in-flight `wait_frame` return
/// [`CaptureResult::Reinit`] or [`CaptureResult::Error`] promptly.
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hook for registering backend-specific options; called once before
    /// `create`. Most backends have none.
    fn init_options(&self) {}

    /// Bind the backend to the relay's pointer callbacks.
    fn create(&self, sink: Arc<dyn PointerSink>) -> io::Result<()>;

    fn init(&self) -> io::Result<()>;

    /// Wake any blocked capture call; part of shutdown and restart.
    fn stop(&self);

    fn deinit(&self) -> io::Result<()>;

    /// Largest frame payload this backend may produce, used to validate the
    /// shared-region budget at start.
    fn max_frame_size(&self) -> usize;

    /// Cursor scale in percent, for DPI-scaled guests.
    fn mouse_scale(&self) -> u32 {
        100
    }

    /// Non-blocking grab; the heartbeat of the caller's main loop.
    fn capture(&self) -> CaptureResult;

    /// Block until a grab is ready and fill `frame`, clamping `height` to
    /// what `max_size` bytes can hold.
    fn wait_frame(&self, frame: &mut CaptureFrame, max_size: usize) -> CaptureResult;

    /// Write the grabbed pixels into `fb`. `frame_index` identifies the
    /// producer's buffer slot so the backend's frame tracker can copy only
    /// the blocks that are stale in that particular buffer.
    fn get_frame(&self, fb: &Framebuffer, height: u32, frame_index: usize) -> CaptureResult;
}
