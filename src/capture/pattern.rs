//! Built-in procedural capture backend.
//!
//! Renders a moving test card instead of grabbing a real display, but
//! behaves like a vendor backend in every way the relay can observe: it
//! produces genuine diff maps, clamps to the frame budget, owns a cursor
//! thread that drives the pointer sink, and honours `stop()` promptly.

use log::info;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::capture::diff::{map_dim, DiffMap, BLOCK_SIZE};
use crate::capture::framebuffer::Framebuffer;
use crate::capture::tracker::FrameTracker;
use crate::capture::{
    CaptureBackend, CaptureFormat, CaptureFrame, CapturePointer, CaptureResult, CaptureRotation,
    PointerSink,
};
use crate::LGMP::Host::layout::LGMP_Q_FRAME_LEN;

const CURSOR_DIM: u32 = 32;
const FRAME_INTERVAL: Duration = Duration::from_millis(15);
const CURSOR_INTERVAL: Duration = Duration::from_millis(50);

/// Ticks between synthetic cursor shape changes.
const SHAPE_PERIOD: u64 = 64;

struct Inner {
    /// Set by `capture` when a new grab is ready, consumed by `wait_frame`.
    pending: bool,

    /// Diff of the latest grab against the one before it.
    diff: DiffMap,

    format_ver: u32,
    tick: u64,

    /// The rendered frame, BGRA, stride == width.
    pixels: Vec<u8>,
}

pub struct PatternBackend {
    width: u32,
    height: u32,

    inner: Mutex<Inner>,
    frame_event: Condvar,
    tracker: Mutex<FrameTracker>,

    sink: Mutex<Option<Arc<dyn PointerSink>>>,
    stopping: Arc<AtomicBool>,
    cursor_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PatternBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            inner: Mutex::new(Inner {
                pending: false,
                diff: DiffMap::for_resolution(width, height),
                format_ver: 0,
                tick: 0,
                pixels: vec![0; (width * height * 4) as usize],
            }),
            frame_event: Condvar::new(),
            tracker: Mutex::new(FrameTracker::new(LGMP_Q_FRAME_LEN)),
            sink: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
            cursor_thread: Mutex::new(None),
        }
    }

    /// Paint the moving block for `tick` and record its cells in `diff`.
    fn render(&self, inner: &mut Inner) {
        let cells_w = map_dim(self.width);
        let cells_h = map_dim(self.height);

        inner.diff.clear();

        // the block that moves away and the block it moves onto are both
        // dirty
        for t in [inner.tick, inner.tick + 1] {
            let cell = t % (cells_w as u64 * cells_h as u64);
            let cx = (cell % cells_w as u64) as u32;
            let cy = (cell / cells_w as u64) as u32;
            inner.diff.set(cx, cy);

            let shade: u8 = if t == inner.tick { 0x20 } else { 0xE0 };
            let x0 = cx * BLOCK_SIZE;
            let y0 = cy * BLOCK_SIZE;
            for y in y0..(y0 + BLOCK_SIZE).min(self.height) {
                let row = (y * self.width + x0) as usize * 4;
                let cols = (BLOCK_SIZE.min(self.width - x0)) as usize * 4;
                for b in inner.pixels[row..row + cols].chunks_exact_mut(4) {
                    b[0] = shade; // B
                    b[1] = (t & 0xFF) as u8; // G
                    b[2] = 0x80; // R
                    b[3] = 0xFF;
                }
            }
        }

        inner.tick += 1;
    }

    fn cursor_loop(sink: Arc<dyn PointerSink>, stopping: Arc<AtomicBool>, width: u32, height: u32) {
        let mut tick: u64 = 0;
        while !stopping.load(Ordering::Acquire) {
            thread::sleep(CURSOR_INTERVAL);
            if stopping.load(Ordering::Acquire) {
                break;
            }

            let shape_update = tick % SHAPE_PERIOD == 0;
            if shape_update {
                let Some(buf) = sink.get_pointer_buffer() else {
                    break; // shutting down
                };
                let len = (CURSOR_DIM * CURSOR_DIM * 4).min(buf.size) as usize;
                unsafe {
                    for i in 0..len {
                        // diagonal stripes so a shape change is visible
                        *buf.data.add(i) = ((i as u64 + tick) & 0xFF) as u8;
                    }
                }
            }

            let x = ((tick * 7) % width as u64) as i32;
            let y = ((tick * 3) % height as u64) as i32;
            sink.post_pointer_buffer(CapturePointer {
                position_update: true,
                shape_update,
                visible: true,
                x,
                y,
                hx: 0,
                hy: 0,
                format: CaptureFormat::Color,
                width: CURSOR_DIM,
                height: CURSOR_DIM,
                pitch: CURSOR_DIM * 4,
            });

            tick += 1;
        }
    }
}

impl CaptureBackend for PatternBackend {
    fn name(&self) -> &'static str {
        "Pattern (procedural test card)"
    }

    fn create(&self, sink: Arc<dyn PointerSink>) -> io::Result<()> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn init(&self) -> io::Result<()> {
        self.stopping.store(false, Ordering::Release);

        {
            let mut inner = self.inner.lock();
            inner.pending = false;
            inner.format_ver += 1;
        }
        self.tracker.lock().reset();

        let sink = self
            .sink
            .lock()
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "create() not called"))?;

        let stopping = self.stopping.clone();
        let (width, height) = (self.width, self.height);
        *self.cursor_thread.lock() = Some(
            thread::Builder::new()
                .name("PatternPointer".into())
                .spawn(move || Self::cursor_loop(sink, stopping, width, height))?,
        );

        info!("pattern backend: {}x{} BGRA", self.width, self.height);
        Ok(())
    }

    fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.frame_event.notify_all();

        if let Some(handle) = self.cursor_thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn deinit(&self) -> io::Result<()> {
        // idempotent: stop() may already have run
        self.stop();
        self.inner.lock().pending = false;
        Ok(())
    }

    fn max_frame_size(&self) -> usize {
        (self.width * self.height * 4) as usize
    }

    fn capture(&self) -> CaptureResult {
        thread::sleep(FRAME_INTERVAL);
        if self.stopping.load(Ordering::Acquire) {
            return CaptureResult::Timeout;
        }

        let mut inner = self.inner.lock();
        self.render(&mut inner);
        if !inner.diff.any() {
            return CaptureResult::Timeout;
        }

        inner.pending = true;
        drop(inner);
        self.frame_event.notify_all();
        CaptureResult::Ok
    }

    fn wait_frame(&self, frame: &mut CaptureFrame, max_size: usize) -> CaptureResult {
        let mut inner = self.inner.lock();
        while !inner.pending {
            if self.stopping.load(Ordering::Acquire) {
                return CaptureResult::Reinit;
            }
            if self
                .frame_event
                .wait_for(&mut inner, Duration::from_millis(1000))
                .timed_out()
            {
                return CaptureResult::Timeout;
            }
        }
        if self.stopping.load(Ordering::Acquire) {
            return CaptureResult::Reinit;
        }

        let max_height = (max_size / (self.width as usize * 4)) as u32;

        frame.format_ver = inner.format_ver;
        frame.width = self.width;
        frame.height = self.height.min(max_height);
        frame.real_height = self.height;
        frame.stride = self.width;
        frame.pitch = self.width * 4;
        frame.rotation = CaptureRotation::Rot0;
        frame.format = CaptureFormat::Bgra;
        frame.damage.copy_from(&inner.diff);

        inner.pending = false;
        CaptureResult::Ok
    }

    fn get_frame(&self, fb: &Framebuffer, height: u32, frame_index: usize) -> CaptureResult {
        let inner = self.inner.lock();
        let mut tracker = self.tracker.lock();
        unsafe {
            tracker.copy_frame(
                fb,
                inner.pixels.as_ptr(),
                &inner.diff,
                self.width,
                self.height,
                self.width,
                height,
                frame_index,
            );
        }
        CaptureResult::Ok
    }
}
