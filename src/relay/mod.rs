//! The relay host proper: owns the transport, the pooled buffers and the
//! producer threads, and drives a capture backend through its lifecycle.
//!
//! Thread layout: the housekeeping thread ticks the transport at ~1 kHz,
//! the frame thread blocks in `wait_frame` and posts frame buffers, the
//! backend's own cursor thread calls back into the pointer sink, and the
//! caller's thread drives the non-blocking `capture()` loop via [`Relay::run`].

use log::{error, info, warn};
use parking_lot::Mutex;
use std::io;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::capture::damage::DamageExtractor;
use crate::capture::framebuffer::{Framebuffer, FRAMEBUFFER_DATA_OFFSET};
use crate::capture::{
    CaptureBackend, CaptureFormat, CaptureFrame, CapturePointer, CaptureResult, CaptureRotation,
    PointerBuffer, PointerSink,
};
use crate::KVMFR::Structs::KVMFR_Structs::{
    KVMFRCursor, KVMFRFrame, CURSOR_TYPE_COLOR, CURSOR_TYPE_MASKED_COLOR, CURSOR_TYPE_MONOCHROME,
    FRAME_ROT_0, FRAME_ROT_180, FRAME_ROT_270, FRAME_ROT_90, FRAME_TYPE_BGRA, FRAME_TYPE_RGBA,
    FRAME_TYPE_RGBA10, FRAME_TYPE_YUV420, MAX_POINTER_SIZE,
};
use crate::LGMP::status::Error as LgmpError;
use crate::LGMP::Host::layout::{
    align_down, LGMP_Q_FRAME, LGMP_Q_FRAME_LEN, LGMP_Q_POINTER, LGMP_Q_POINTER_LEN,
};
use crate::LGMP::Host::{HostQueue, LgmpHost, Memory};

/// Bytes from the start of a frame buffer to its framebuffer header: the
/// frame descriptor rounded up so the pixel payload lands 64-byte aligned.
pub const FRAME_HEADER_SIZE: usize = (size_of::<KVMFRFrame>() + 63) & !63;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Transport(#[from] LgmpError),

    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    #[error("capture interface reported a fatal error")]
    CaptureFailed,

    #[error("failed to join the {0} thread")]
    ThreadJoin(&'static str),

    #[error("backend frame size of {need} bytes exceeds the {budget} bytes available")]
    FrameBudget { need: usize, budget: usize },
}

/// Cursor-side rotation state, touched only from the backend's cursor
/// thread (the backend serialises those calls; the lock makes the shared
/// context sound either way).
struct PointerState {
    memory: Vec<Memory>,

    /// Held out of rotation; always carries the last known cursor shape so
    /// a late subscriber can be resynchronised from it.
    shape: Memory,

    index: usize,
    shape_valid: bool,
}

/// The single owned context threaded through every producer.
pub struct HostState {
    host: LgmpHost,
    frame_queue: HostQueue,
    pointer_queue: HostQueue,
    frame_memory: Vec<Memory>,
    max_frame_size: usize,

    /// Current frame buffer slot. Advanced before filling, so a resend
    /// always targets the latest valid frame. Survives capture restarts.
    frame_index: AtomicUsize,

    pointer: Mutex<PointerState>,

    running: AtomicBool,
    reinit: AtomicBool,
    failed: AtomicBool,
}

impl HostState {
    #[inline]
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Request shutdown; threads notice within a tick.
    pub fn quit(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn host(&self) -> &LgmpHost {
        &self.host
    }

    pub fn frame_queue(&self) -> &HostQueue {
        &self.frame_queue
    }

    pub fn pointer_queue(&self) -> &HostQueue {
        &self.pointer_queue
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index.load(Ordering::Relaxed)
    }
}

impl PointerSink for HostState {
    fn get_pointer_buffer(&self) -> Option<PointerBuffer> {
        // spin until there is room
        while self.pointer_queue.pending() == LGMP_Q_POINTER_LEN as u32 {
            if !self.running() {
                return None;
            }
            thread::yield_now();
        }

        let ps = self.pointer.lock();
        let mem = ps.memory[ps.index];
        Some(PointerBuffer {
            data: unsafe { mem.as_ptr().add(size_of::<KVMFRCursor>()) },
            size: (MAX_POINTER_SIZE - size_of::<KVMFRCursor>()) as u32,
        })
    }

    fn post_pointer_buffer(&self, pointer: CapturePointer) {
        let new_client = self.pointer_queue.new_subs() > 0;
        let mut ps = self.pointer.lock();

        let mem = if pointer.shape_update || new_client {
            if pointer.shape_update {
                // swap the freshly written buffer out of rotation; it is the
                // new retained shape
                let idx = ps.index;
                let tmp = ps.shape;
                ps.shape = ps.memory[idx];
                ps.memory[idx] = tmp;
            }

            // use the last known shape buffer
            ps.shape
        } else {
            let mem = ps.memory[ps.index];
            ps.index = (ps.index + 1) % LGMP_Q_POINTER_LEN;
            mem
        };

        let cursor = mem.as_ptr() as *mut KVMFRCursor;
        unsafe {
            (*cursor).x = pointer.x;
            (*cursor).y = pointer.y;
            (*cursor).visible = pointer.visible as u8;
        }

        if pointer.shape_update {
            let ty = match pointer.format {
                CaptureFormat::Color => CURSOR_TYPE_COLOR,
                CaptureFormat::Mono => CURSOR_TYPE_MONOCHROME,
                CaptureFormat::Masked => CURSOR_TYPE_MASKED_COLOR,
                other => {
                    error!("invalid pointer format {other:?}, dropping update");
                    return;
                }
            };
            unsafe {
                (*cursor).ty = ty;
                (*cursor).width = pointer.width;
                (*cursor).height = pointer.height;
                (*cursor).pitch = pointer.pitch;
            }
            ps.shape_valid = true;
        }

        // udata flags whether shape pixels follow the cursor header
        let send_shape = ((pointer.shape_update || new_client) && ps.shape_valid) as u32;
        drop(ps);

        loop {
            match self.pointer_queue.post(send_shape, &mem) {
                Ok(()) => break,
                Err(LgmpError::QueueFull) => {
                    if !self.running() {
                        break;
                    }
                    thread::yield_now();
                }
                Err(e) => {
                    error!("pointer queue post failed: {e}");
                    break;
                }
            }
        }
    }
}

fn rotation_to_wire(rotation: CaptureRotation) -> u32 {
    match rotation {
        CaptureRotation::Rot0 => FRAME_ROT_0,
        CaptureRotation::Rot90 => FRAME_ROT_90,
        CaptureRotation::Rot180 => FRAME_ROT_180,
        CaptureRotation::Rot270 => FRAME_ROT_270,
    }
}

fn lgmp_thread(state: &HostState) {
    while state.running() {
        if let Err(e) = state.host.process() {
            error!("transport maintenance failed: {e}");
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    // take the rest of the host down with us
    state.running.store(false, Ordering::Release);
}

fn frame_thread(state: &HostState, backend: &dyn CaptureBackend) {
    info!("frame thread started");

    let mut frame = CaptureFrame::default();
    let mut frame_valid = false;
    let mut repeat_frame = false;
    let mut extractor = DamageExtractor::new();

    while state.running() {
        match backend.wait_frame(&mut frame, state.max_frame_size) {
            CaptureResult::Ok => repeat_frame = false,

            CaptureResult::Reinit => {
                state.reinit.store(true, Ordering::Release);
                info!("frame thread reinit");
                return;
            }

            CaptureResult::Error => {
                error!("failed to get the frame");
                state.failed.store(true, Ordering::Release);
                state.quit();
                return;
            }

            CaptureResult::Timeout => {
                if frame_valid && state.frame_queue.new_subs() > 0 {
                    // resend the last frame for the late joiner
                    repeat_frame = true;
                } else {
                    continue;
                }
            }
        }

        // wait until there is room in the queue
        while state.frame_queue.pending() == LGMP_Q_FRAME_LEN as u32 {
            if !state.running() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }

        if repeat_frame {
            let idx = state.frame_index.load(Ordering::Relaxed);
            if let Err(e) = state.frame_queue.post(0, &state.frame_memory[idx]) {
                warn!("frame resend failed: {e}");
            }
            continue;
        }

        // increment the index first so that if we need to repeat a frame
        // the index still points at the latest valid one
        let idx = (state.frame_index.load(Ordering::Relaxed) + 1) % LGMP_Q_FRAME_LEN;
        state.frame_index.store(idx, Ordering::Relaxed);

        let ty = match frame.format {
            CaptureFormat::Bgra => FRAME_TYPE_BGRA,
            CaptureFormat::Rgba => FRAME_TYPE_RGBA,
            CaptureFormat::Rgba10 => FRAME_TYPE_RGBA10,
            CaptureFormat::Yuv420 => FRAME_TYPE_YUV420,
            other => {
                error!("unsupported frame format {other:?}, skipping frame");
                continue;
            }
        };

        let mem = state.frame_memory[idx];
        let fi = mem.as_ptr() as *mut KVMFRFrame;
        unsafe {
            (*fi).ty = ty;
            (*fi).format_ver = frame.format_ver;
            (*fi).width = frame.width;
            (*fi).height = frame.height;
            (*fi).real_height = frame.real_height;
            (*fi).stride = frame.stride;
            (*fi).pitch = frame.pitch;
            (*fi).rotation = rotation_to_wire(frame.rotation);
            (*fi).damage_rects_count =
                extractor.extract(&frame.damage, &mut (*fi).damage_rects) as u32;
        }
        frame_valid = true;

        let fb = unsafe {
            Framebuffer::from_raw(
                mem.as_ptr().add(FRAME_HEADER_SIZE),
                mem.size - FRAME_HEADER_SIZE - FRAMEBUFFER_DATA_OFFSET,
            )
        };
        fb.prepare();

        // we post and then fill, this is intentional: the client follows the
        // framebuffer write pointer into the payload
        if let Err(e) = state.frame_queue.post(0, &mem) {
            warn!("frame post failed: {e}");
            continue;
        }

        if backend.get_frame(&fb, frame.height, idx) != CaptureResult::Ok {
            warn!("backend failed to fill the frame");
        }
    }

    info!("frame thread stopped");
}

/// The assembled host. Create with [`Relay::new`], drive with [`Relay::run`].
pub struct Relay {
    state: Arc<HostState>,
    backend: Arc<dyn CaptureBackend>,
    lgmp_thread: Option<thread::JoinHandle<()>>,
    frame_thread: Option<thread::JoinHandle<()>>,
}

impl Relay {
    /// Lay out the shared region at `base`, allocate both queues and every
    /// pooled buffer, publish the region, and bind `backend` to the pointer
    /// callbacks.
    ///
    /// # Safety
    /// `[base, base + size)` must be a mapped, 128-byte aligned writable
    /// region owned exclusively by this relay for its lifetime.
    pub unsafe fn new(
        base: *mut u8,
        size: usize,
        backend: Arc<dyn CaptureBackend>,
    ) -> Result<Self, RelayError> {
        let host = LgmpHost::init(base, size)?;

        let frame_queue = host.queue_new(LGMP_Q_FRAME, LGMP_Q_FRAME_LEN as u32)?;
        let pointer_queue = host.queue_new(LGMP_Q_POINTER, LGMP_Q_POINTER_LEN as u32)?;

        let mut pointer_memory = Vec::with_capacity(LGMP_Q_POINTER_LEN);
        for _ in 0..LGMP_Q_POINTER_LEN {
            pointer_memory.push(host.mem_alloc(MAX_POINTER_SIZE)?);
        }
        let shape = host.mem_alloc(MAX_POINTER_SIZE)?;

        let max_frame_size = align_down(host.mem_avail() / LGMP_Q_FRAME_LEN);
        let mut frame_memory = Vec::with_capacity(LGMP_Q_FRAME_LEN);
        for _ in 0..LGMP_Q_FRAME_LEN {
            frame_memory.push(host.mem_alloc(max_frame_size)?);
        }

        info!("max pointer size : {} KiB", MAX_POINTER_SIZE / 1024);
        info!("max frame size   : {} MiB", max_frame_size / 1048576);

        host.publish();

        let state = Arc::new(HostState {
            host,
            frame_queue,
            pointer_queue,
            frame_memory,
            max_frame_size,
            frame_index: AtomicUsize::new(0),
            pointer: Mutex::new(PointerState {
                memory: pointer_memory,
                shape,
                index: 0,
                shape_valid: false,
            }),
            running: AtomicBool::new(false),
            reinit: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        });

        backend.init_options();
        backend.create(state.clone() as Arc<dyn PointerSink>)?;
        backend.init()?;

        Ok(Self {
            state,
            backend,
            lgmp_thread: None,
            frame_thread: None,
        })
    }

    pub fn state(&self) -> &Arc<HostState> {
        &self.state
    }

    /// Validate the backend budget and start the worker threads.
    pub fn capture_start(&mut self) -> Result<(), RelayError> {
        info!("using            : {}", self.backend.name());

        let need = self.backend.max_frame_size();
        if need > self.state.max_frame_size {
            return Err(RelayError::FrameBudget {
                need,
                budget: self.state.max_frame_size,
            });
        }
        info!("capture size     : {} MiB ({})", need / 1048576, need);
        info!("mouse scale      : {}%", self.backend.mouse_scale());

        info!("==== [ capture start ] ====");
        self.start_threads()
    }

    fn start_threads(&mut self) -> Result<(), RelayError> {
        self.state.running.store(true, Ordering::Release);

        let state = self.state.clone();
        self.lgmp_thread = Some(
            thread::Builder::new()
                .name("LGMPThread".into())
                .spawn(move || lgmp_thread(&state))?,
        );

        let state = self.state.clone();
        let backend = self.backend.clone();
        self.frame_thread = Some(
            thread::Builder::new()
                .name("FrameThread".into())
                .spawn(move || frame_thread(&state, backend.as_ref()))?,
        );

        Ok(())
    }

    /// Stop and join the worker threads, reverse creation order.
    pub fn stop_threads(&mut self) -> bool {
        let mut ok = true;

        self.state.quit();
        self.backend.stop();

        if let Some(handle) = self.frame_thread.take() {
            if handle.join().is_err() {
                warn!("failed to join the frame thread");
                ok = false;
            }
        }
        if let Some(handle) = self.lgmp_thread.take() {
            if handle.join().is_err() {
                warn!("failed to join the LGMP thread");
                ok = false;
            }
        }

        ok
    }

    /// Tear the backend down and bring it back, keeping the shared region,
    /// the session id and every subscriber.
    pub fn capture_restart(&mut self) -> Result<(), RelayError> {
        info!("==== [ capture restart ] ====");
        if !self.stop_threads() {
            return Err(RelayError::ThreadJoin("capture"));
        }

        self.backend.deinit()?;
        self.backend.init()?;

        self.capture_start()
    }

    /// Drive the backend's non-blocking capture until shutdown or a fatal
    /// error. Restarts the capture on backend request.
    pub fn run(&mut self) -> Result<(), RelayError> {
        self.capture_start()?;

        let mut result = Ok(());
        while self.state.running() {
            if self.state.reinit.swap(false, Ordering::AcqRel) {
                if let Err(e) = self.capture_restart() {
                    result = Err(e);
                    break;
                }
            }

            match self.backend.capture() {
                CaptureResult::Ok => {}
                CaptureResult::Timeout => continue,
                CaptureResult::Reinit => {
                    if let Err(e) = self.capture_restart() {
                        result = Err(e);
                        break;
                    }
                }
                CaptureResult::Error => {
                    error!("capture interface reported a fatal error");
                    result = Err(RelayError::CaptureFailed);
                    break;
                }
            }
        }

        self.stop_threads();
        if let Err(e) = self.backend.deinit() {
            warn!("backend deinit failed: {e}");
        }

        if result.is_ok() && self.state.failed.load(Ordering::Acquire) {
            result = Err(RelayError::CaptureFailed);
        }
        result
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if self.frame_thread.is_some() || self.lgmp_thread.is_some() {
            self.stop_threads();
        }
    }
}
