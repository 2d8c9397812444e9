// Host side of the shared-memory transport: the single producer that owns
// the region layout, the queues, and the pooled buffers

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64};

use super::layout::{QueueDesc, RegionHeader, SlotRecord};

/// The transport host. Owns the shared region for the lifetime of the
/// process: it zeroes and lays the region out at creation, hands out queues
/// and pooled buffers by bumping an allocator over the arena, and performs
/// the periodic maintenance (`process`) that reclaims slots and evicts dead
/// subscribers.
///
/// All shared state lives behind atomics inside the region itself, so the
/// host is driven through `&self` from several threads at once: the frame
/// producer, the cursor producer, and the housekeeping loop.
pub struct LgmpHost {
    /// Base of the mapped region. Exclusive writable arena of this process.
    pub(crate) base: *mut u8,

    /// Region size in bytes.
    pub(crate) size: usize,

    pub(crate) header: *mut RegionHeader,

    /// This session's id, as published in the header.
    pub(crate) session_id: u32,

    /// Host-local policy: silence before a subscriber is evicted.
    /// Defaults to [`super::layout::LGMP_SUB_TIMEOUT_MS`].
    pub(crate) sub_timeout_ms: AtomicU64,

    /// Bump allocator over the arena: next free byte offset. The lock also
    /// serialises queue creation.
    pub(crate) alloc_next: Mutex<usize>,
}

// The region is only ever mutated through atomics or by the single producer
// of each queue; the host hands out raw views and manages the discipline.
unsafe impl Send for LgmpHost {}
unsafe impl Sync for LgmpHost {}

/// Producer view over one queue in the region.
///
/// `post` may only be called from one thread at a time per queue (single
/// producer); `pending` and `new_subs` are safe from anywhere.
pub struct HostQueue {
    pub(crate) base: *mut u8,
    pub(crate) desc: *mut QueueDesc,
    pub(crate) ring: *mut SlotRecord,
    pub(crate) capacity: u32,

    /// Host-local snapshot of the descriptor's `new_sub_count`; the delta is
    /// what `new_subs` reports.
    pub(crate) last_sub_count: AtomicU32,
}

unsafe impl Send for HostQueue {}
unsafe impl Sync for HostQueue {}

/// A pooled, 128-byte aligned buffer inside the region.
///
/// Buffers are created once at startup and recycled round-robin by the
/// producers; the queue capacity equals the pool size, which enforces
/// at-most-one in-flight use per buffer.
#[derive(Clone, Copy, Debug)]
pub struct Memory {
    /// Byte offset from the region base; this is what goes on the wire.
    pub offset: u32,

    /// Usable size in bytes.
    pub size: usize,

    pub(crate) ptr: *mut u8,
}

unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

impl Memory {
    /// Writable pointer to the buffer payload.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }
}
