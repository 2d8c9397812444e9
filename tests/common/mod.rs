// Shared helpers for the integration tests: an aligned heap-backed region
// standing in for the shared-memory device, and a scriptable capture
// backend for driving the relay end to end.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kvmfr_host::capture::diff::DiffMap;
use kvmfr_host::capture::framebuffer::Framebuffer;
use kvmfr_host::capture::tracker::FrameTracker;
use kvmfr_host::capture::{
    CaptureBackend, CaptureFormat, CaptureFrame, CaptureResult, CaptureRotation, PointerSink,
};
use kvmfr_host::LGMP::Host::layout::LGMP_Q_FRAME_LEN;

/// A 128-byte aligned, zeroed arena standing in for the mapped device.
pub struct AlignedRegion {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for AlignedRegion {}
unsafe impl Sync for AlignedRegion {}

impl AlignedRegion {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, 128).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "failed to allocate test region");
        Self { ptr, layout }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for AlignedRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// Poll `cond` until it holds or the deadline passes.
pub fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// One step the scripted backend serves from `wait_frame`.
pub enum Step {
    /// Paint the listed 128x128 tiles with `fill` and deliver the frame.
    Frame { tiles: Vec<(u32, u32)>, fill: u8 },
    Timeout,
    Reinit,
    Error,
}

/// A capture backend driven entirely by a pre-loaded script, so tests
/// control exactly what the frame thread observes.
pub struct ScriptedBackend {
    pub width: u32,
    pub height: u32,

    script: Mutex<VecDeque<Step>>,
    pixels: Mutex<Vec<u8>>,
    last_diff: Mutex<DiffMap>,
    tracker: Mutex<FrameTracker>,
    sink: Mutex<Option<Arc<dyn PointerSink>>>,
    stopping: AtomicBool,

    pub init_calls: AtomicUsize,
    pub deinit_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            width,
            height,
            script: Mutex::new(VecDeque::new()),
            pixels: Mutex::new(vec![0; (width * height * 4) as usize]),
            last_diff: Mutex::new(DiffMap::for_resolution(width, height)),
            tracker: Mutex::new(FrameTracker::new(LGMP_Q_FRAME_LEN)),
            sink: Mutex::new(None),
            stopping: AtomicBool::new(false),
            init_calls: AtomicUsize::new(0),
            deinit_calls: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, step: Step) {
        self.script.lock().push_back(step);
    }

    /// The pointer sink the relay handed us, for tests that act as the
    /// backend's cursor thread.
    pub fn sink(&self) -> Arc<dyn PointerSink> {
        self.sink.lock().clone().expect("create() not called")
    }

    fn paint(&self, tiles: &[(u32, u32)], fill: u8) -> DiffMap {
        let mut diff = DiffMap::for_resolution(self.width, self.height);
        let mut pixels = self.pixels.lock();
        for &(cx, cy) in tiles {
            diff.set(cx, cy);
            let x0 = cx * 128;
            let y0 = cy * 128;
            for y in y0..(y0 + 128).min(self.height) {
                let row = (y * self.width + x0) as usize * 4;
                let cols = 128.min(self.width - x0) as usize * 4;
                pixels[row..row + cols].fill(fill);
            }
        }
        diff
    }
}

impl CaptureBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "Scripted (test)"
    }

    fn create(&self, sink: Arc<dyn PointerSink>) -> io::Result<()> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn init(&self) -> io::Result<()> {
        self.stopping.store(false, Ordering::Release);
        self.tracker.lock().reset();
        self.init_calls.fetch_add(1, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    fn deinit(&self) -> io::Result<()> {
        self.deinit_calls.fetch_add(1, Ordering::Release);
        Ok(())
    }

    fn max_frame_size(&self) -> usize {
        (self.width * self.height * 4) as usize
    }

    fn capture(&self) -> CaptureResult {
        thread::sleep(Duration::from_millis(1));
        CaptureResult::Timeout
    }

    fn wait_frame(&self, frame: &mut CaptureFrame, max_size: usize) -> CaptureResult {
        if self.stopping.load(Ordering::Acquire) {
            return CaptureResult::Reinit;
        }

        let step = self.script.lock().pop_front();
        match step {
            None | Some(Step::Timeout) => {
                thread::sleep(Duration::from_millis(2));
                CaptureResult::Timeout
            }
            Some(Step::Reinit) => CaptureResult::Reinit,
            Some(Step::Error) => CaptureResult::Error,
            Some(Step::Frame { tiles, fill }) => {
                let diff = self.paint(&tiles, fill);
                *self.last_diff.lock() = diff.clone();

                let max_height = (max_size / (self.width as usize * 4)) as u32;
                frame.format_ver = 1;
                frame.width = self.width;
                frame.height = self.height.min(max_height);
                frame.real_height = self.height;
                frame.stride = self.width;
                frame.pitch = self.width * 4;
                frame.rotation = CaptureRotation::Rot0;
                frame.format = CaptureFormat::Bgra;
                frame.damage = diff;
                CaptureResult::Ok
            }
        }
    }

    fn get_frame(&self, fb: &Framebuffer, height: u32, frame_index: usize) -> CaptureResult {
        let pixels = self.pixels.lock();
        let diff = self.last_diff.lock();
        let mut tracker = self.tracker.lock();
        unsafe {
            tracker.copy_frame(
                fb,
                pixels.as_ptr(),
                &diff,
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
