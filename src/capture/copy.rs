//! Row-span copy kernels for the selective frame copy.
//!
//! The fast path moves 16-row x 16-pixel tiles with non-temporal loads and
//! aligned stores; the source is write-combined capture memory that should
//! not pollute the cache on its way through. The scalar fallback handles
//! tail rows and anything unaligned. Which kernel runs never changes what
//! ends up in the buffer, only how fast it gets there.

use std::ptr;

/// Rows per tile on the aligned path.
pub const TILE_ROWS: usize = 16;

/// Copy rows `[y_start, y_end)` of a horizontal span.
///
/// `dx` is the span's byte offset within a row, `stride` the row pitch in
/// bytes and `width` the span width in bytes; source and destination share
/// the same geometry.
///
/// # Safety
/// `src` and `dst` must both be valid for every byte the span geometry
/// addresses, and must not overlap.
pub unsafe fn rect_copy(
    dst: *mut u8,
    src: *const u8,
    y_start: usize,
    y_end: usize,
    dx: usize,
    stride: usize,
    width: usize,
) {
    #[cfg(target_arch = "x86_64")]
    {
        let rows = y_end.saturating_sub(y_start);
        let aligned = (dst as usize) % 16 == 0
            && (src as usize) % 16 == 0
            && dx % 16 == 0
            && stride % 16 == 0
            && width % 16 == 0
            && width > 0;
        if aligned && rows >= TILE_ROWS && is_x86_feature_detected!("sse4.1") {
            let tiled_end = y_start + (rows & !(TILE_ROWS - 1));
            sse::rect_copy_aligned(dst, src, y_start, tiled_end, dx, stride, width);
            rect_copy_unaligned(dst, src, tiled_end, y_end, dx, stride, width);
            return;
        }
    }

    rect_copy_unaligned(dst, src, y_start, y_end, dx, stride, width);
}

/// Scalar row-by-row copy; the tail and fallback path.
///
/// # Safety
/// Same contract as [`rect_copy`].
pub unsafe fn rect_copy_unaligned(
    dst: *mut u8,
    src: *const u8,
    y_start: usize,
    y_end: usize,
    dx: usize,
    stride: usize,
    width: usize,
) {
    for y in y_start..y_end {
        let offset = y * stride + dx;
        ptr::copy_nonoverlapping(src.add(offset), dst.add(offset), width);
    }
}

#[cfg(target_arch = "x86_64")]
mod sse {
    use super::TILE_ROWS;
    use std::arch::x86_64::{_mm_store_si128, _mm_stream_load_si128, __m128i};

    /// # Safety
    /// All pointers and offsets 16-byte aligned, `width % 16 == 0`,
    /// `(y_end - y_start) % TILE_ROWS == 0`, SSE4.1 present.
    #[target_feature(enable = "sse4.1")]
    pub unsafe fn rect_copy_aligned(
        dst: *mut u8,
        src: *const u8,
        y_start: usize,
        y_end: usize,
        dx: usize,
        stride: usize,
        width: usize,
    ) {
        let cols = width / 16;
        for tile in (y_start..y_end).step_by(TILE_ROWS) {
            for col in 0..cols {
                for row in 0..TILE_ROWS {
                    let offset = (tile + row) * stride + dx + col * 16;
                    // the intrinsic takes *mut even though it only loads
                    let v = _mm_stream_load_si128(src.add(offset) as *mut __m128i);
                    _mm_store_si128(dst.add(offset) as *mut __m128i, v);
                }
            }
        }
    }
}
