//! Write-pointer guarded framebuffer inside a pooled frame buffer.
//!
//! The frame slot is posted *before* its pixels are copied; the client
//! polls the write pointer and renders rows as they land, which is what
//! lets copy and render overlap. The Release store on the write pointer is
//! the only ordering the scheme needs: rows below the published value are
//! fully written.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// Header preceding the pixel payload. Aligned so the payload that follows
/// starts on a 64-byte boundary, which keeps the tile copy kernel on its
/// aligned fast path.
#[repr(C, align(64))]
pub struct FramebufferHeader {
    wp: AtomicU32,
}

/// Bytes from the framebuffer base to the pixel payload.
pub const FRAMEBUFFER_DATA_OFFSET: usize = std::mem::size_of::<FramebufferHeader>();

/// A view over a framebuffer in the shared region.
pub struct Framebuffer {
    base: NonNull<u8>,

    /// Payload capacity in bytes, excluding the header.
    capacity: usize,
}

unsafe impl Send for Framebuffer {}
unsafe impl Sync for Framebuffer {}

impl Framebuffer {
    /// View the framebuffer at `base`, with `capacity` payload bytes behind
    /// the header.
    ///
    /// # Safety
    /// `base` must be 64-byte aligned and point at
    /// `FRAMEBUFFER_DATA_OFFSET + capacity` valid bytes.
    pub unsafe fn from_raw(base: *mut u8, capacity: usize) -> Self {
        debug_assert!(!base.is_null() && (base as usize) % 64 == 0);
        Self {
            base: NonNull::new_unchecked(base),
            capacity,
        }
    }

    #[inline]
    fn header(&self) -> &FramebufferHeader {
        unsafe { &*(self.base.as_ptr() as *const FramebufferHeader) }
    }

    /// Reset the write pointer ahead of a new frame.
    pub fn prepare(&self) {
        self.header().wp.store(0, Ordering::Release);
    }

    /// Publish that the first `wp` payload bytes are valid.
    #[inline]
    pub fn set_write_ptr(&self, wp: u32) {
        self.header().wp.store(wp, Ordering::Release);
    }

    /// Bytes published so far (the client-side read).
    pub fn write_ptr(&self) -> u32 {
        self.header().wp.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Writable pointer to the pixel payload.
    #[inline]
    pub fn data(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(FRAMEBUFFER_DATA_OFFSET) }
    }

    /// Copy `len` bytes from `src` into the payload and publish them in one
    /// go: the whole-frame path for backends without a usable diff.
    ///
    /// # Safety
    /// `src` must be valid for `len` bytes and `len <= capacity`.
    pub unsafe fn write(&self, src: *const u8, len: usize) {
        debug_assert!(len <= self.capacity);
        std::ptr::copy_nonoverlapping(src, self.data(), len);
        self.set_write_ptr(len as u32);
    }
}
