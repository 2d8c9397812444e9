//! Per-buffer frame state and the selective copy it drives.
//!
//! The producer rotates through a small pool of frame buffers, so any given
//! buffer is several frames stale when its turn comes around again. Rather
//! than recopy the whole capture, the tracker remembers what each buffer
//! last held and copies only the 128x128 blocks that differ: the blocks the
//! current grab dirtied, plus every block the buffer missed while other
//! buffers were being written.

use crate::capture::copy;
use crate::capture::diff::{DiffMap, BLOCK_SIZE};
use crate::capture::framebuffer::Framebuffer;

/// What one pooled frame buffer currently holds.
///
/// `was_fresh` means the buffer holds the most recently captured pixels for
/// its dimensions; otherwise `diff` is the union of every diff observed
/// since the buffer was last written.
#[derive(Debug, Clone, Default)]
struct FrameInfo {
    width: u32,
    height: u32,
    was_fresh: bool,
    diff: DiffMap,
}

/// Tracks one [`FrameInfo`] per producer buffer slot.
pub struct FrameTracker {
    info: Vec<FrameInfo>,
}

impl FrameTracker {
    pub fn new(slots: usize) -> Self {
        Self {
            info: vec![FrameInfo::default(); slots],
        }
    }

    /// Forget everything; every buffer's next touch becomes a full copy.
    /// Called when the capture surface is torn down and re-created.
    pub fn reset(&mut self) {
        for info in &mut self.info {
            *info = FrameInfo::default();
        }
    }

    /// Copy the grab at `src` into `fb` for buffer slot `frame_index`,
    /// then fold the current diff into every other slot's accumulated state.
    ///
    /// `cur` is the diff of this grab against the previous one, `stride` the
    /// source row length in pixels (4-byte pixels), `height` the row count
    /// to publish. The write pointer is advanced per copied row band so the
    /// client can start rendering mid-copy.
    ///
    /// # Safety
    /// `src` must be valid for `height * stride * 4` bytes and `fb` must
    /// have at least that capacity.
    pub unsafe fn copy_frame(
        &mut self,
        fb: &Framebuffer,
        src: *const u8,
        cur: &DiffMap,
        grab_width: u32,
        grab_height: u32,
        stride: u32,
        height: u32,
        frame_index: usize,
    ) {
        let stride_bytes = stride as usize * 4;
        let info = &self.info[frame_index];

        if info.width == grab_width && info.height == grab_height {
            let was_fresh = info.was_fresh;
            let w = cur.width();
            let h = cur.height();
            let dst = fb.data();

            for y in 0..h {
                let y_start = (y * BLOCK_SIZE) as usize;
                let y_end = height.min((y + 1) * BLOCK_SIZE) as usize;

                let mut x = 0;
                while x < w {
                    // clean in this buffer and unchanged in the grab: skip
                    let stale = !was_fresh && info.diff.dirty(x, y);
                    if !stale && !cur.dirty(x, y) {
                        x += 1;
                        continue;
                    }

                    // extend the run over every block needing pixels
                    let mut x2 = x;
                    while x2 < w
                        && ((!was_fresh && info.diff.dirty(x2, y)) || cur.dirty(x2, y))
                    {
                        x2 += 1;
                    }

                    let width_bytes =
                        ((x2 * BLOCK_SIZE).min(stride) - x * BLOCK_SIZE) as usize * 4;
                    let dx = (x * BLOCK_SIZE) as usize * 4;

                    copy::rect_copy(dst, src, y_start, y_end & !0xF, dx, stride_bytes, width_bytes);
                    if y_end & 0xF != 0 {
                        copy::rect_copy_unaligned(
                            dst,
                            src,
                            y_end & !0xF,
                            y_end,
                            dx,
                            stride_bytes,
                            width_bytes,
                        );
                    }

                    x = x2;
                }

                fb.set_write_ptr((y_end * stride_bytes) as u32);
            }
        } else {
            // dimensions changed under this buffer; everything it holds is
            // garbage
            fb.write(src, height as usize * stride_bytes);
        }

        for (i, info) in self.info.iter_mut().enumerate() {
            if i == frame_index {
                info.width = grab_width;
                info.height = grab_height;
                info.was_fresh = true;
            } else if info.width == grab_width && info.height == grab_height {
                if info.was_fresh {
                    info.diff.copy_from(cur);
                    info.was_fresh = false;
                } else {
                    info.diff.or_assign(cur);
                }
            } else {
                info.width = 0;
                info.height = 0;
            }
        }
    }
}
