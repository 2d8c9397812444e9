// Payload structs carried over the transport queues

// no atomics here; plain integral types only, the client parses these
// straight out of the shared region

/// Upper bound on damage rectangles per frame. A frame whose damage would
/// not fit reports zero rectangles, which the client reads as "assume the
/// entire frame changed".
pub const KVMFR_MAX_DAMAGE_RECTS: usize = 64;

/// Frame pixel formats on the wire.
pub const FRAME_TYPE_INVALID: u32 = 0;
pub const FRAME_TYPE_BGRA: u32 = 1;
pub const FRAME_TYPE_RGBA: u32 = 2;
pub const FRAME_TYPE_RGBA10: u32 = 3;
pub const FRAME_TYPE_YUV420: u32 = 4;

/// Cursor pixel formats on the wire. A monochrome shape is twice as tall as
/// its nominal height: the AND mask stacked on top of the XOR mask.
pub const CURSOR_TYPE_COLOR: u32 = 0;
pub const CURSOR_TYPE_MONOCHROME: u32 = 1;
pub const CURSOR_TYPE_MASKED_COLOR: u32 = 2;

/// Frame rotations on the wire.
pub const FRAME_ROT_0: u32 = 0;
pub const FRAME_ROT_90: u32 = 1;
pub const FRAME_ROT_180: u32 = 2;
pub const FRAME_ROT_270: u32 = 3;

/// An axis-aligned region of changed pixels, in pixel units.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameDamageRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Frame descriptor at the start of every frame buffer, followed by the
/// write-pointer guarded pixel payload.
///
/// `height` may be clamped below `real_height` when the capture exceeds the
/// buffer budget; the client letterboxes the remainder.
#[repr(C)]
#[derive(Debug)]
pub struct KVMFRFrame {
    /// One of the `FRAME_TYPE_*` constants.
    pub ty: u32,

    /// Bumped whenever the capture geometry changes; the client drops its
    /// cached textures on a mismatch.
    pub format_ver: u32,

    pub width: u32,
    pub height: u32,
    pub real_height: u32,

    /// Row length in pixels.
    pub stride: u32,

    /// Row length in bytes.
    pub pitch: u32,

    /// One of the `FRAME_ROT_*` constants.
    pub rotation: u32,

    /// Number of valid entries in `damage_rects`; zero means full-frame.
    pub damage_rects_count: u32,

    pub damage_rects: [FrameDamageRect; KVMFR_MAX_DAMAGE_RECTS],
}

/// Cursor descriptor at the start of every pointer buffer. Shape pixels
/// follow only when the carrying slot's `udata` is 1.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct KVMFRCursor {
    pub x: i32,
    pub y: i32,
    pub visible: u8,
    pub _pad: [u8; 3],

    /// One of the `CURSOR_TYPE_*` constants.
    pub ty: u32,

    pub width: u32,
    pub height: u32,

    /// Shape row length in bytes.
    pub pitch: u32,
}

/// Pooled pointer buffers are sized for the cursor descriptor plus a
/// 128x128 32-bit shape, the largest any capture backend produces.
pub const MAX_POINTER_SIZE: usize = std::mem::size_of::<KVMFRCursor>() + 128 * 128 * 4;
