// Control plane of the shared region: everything here is mapped by both the
// host (guest VM) and the client (hypervisor side)

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Wire magic, little-endian bytes of `"LGMP____"`.
///
/// The magic is the initialisation barrier: the host zeroes the region, lays
/// out every queue and buffer, and only then stores the magic with Release.
/// A client that acquires a valid magic therefore sees a fully formed region.
pub const LGMP_MAGIC: u64 = u64::from_le_bytes(*b"LGMP____");

/// Layout version; any change to the structs in this file must bump it.
pub const LGMP_VERSION: u32 = 1;

/// Fixed queue id namespace shared with the client.
pub const LGMP_Q_FRAME: u32 = 0;
pub const LGMP_Q_POINTER: u32 = 1;

/// Ring capacities. The producer owns exactly this many pooled buffers per
/// queue, which is what makes buffer rotation race-free: a slot index can
/// never alias a buffer a subscriber still has pending.
pub const LGMP_Q_FRAME_LEN: usize = 2;
pub const LGMP_Q_POINTER_LEN: usize = 10;

/// How many queues a region header can describe.
pub const LGMP_MAX_QUEUES: usize = 4;

/// Width of the subscriber bitmap and pending-readers masks.
pub const LGMP_MAX_SUBS: usize = 32;

/// A subscriber whose heartbeat is older than this is considered dead and
/// evicted, releasing every slot it still held.
pub const LGMP_SUB_TIMEOUT_MS: u64 = 5000;

/// Everything in the region is carved out on 128-byte boundaries.
pub const LGMP_ALIGNMENT: usize = 128;

#[inline]
pub const fn align_up(v: usize) -> usize {
    (v + (LGMP_ALIGNMENT - 1)) & !(LGMP_ALIGNMENT - 1)
}

#[inline]
pub const fn align_down(v: usize) -> usize {
    v & !(LGMP_ALIGNMENT - 1)
}

/// One entry of a queue's slot ring.
///
/// The plain fields are written by the producer only while the slot has an
/// empty pending mask (no reader can observe a torn write), then published
/// by the Release store of `pending` followed by the Release bump of the
/// queue's `position`.
#[repr(C)]
pub struct SlotRecord {
    /// Byte offset of the payload buffer from the start of the region.
    pub offset: u32,

    /// Payload length in bytes.
    pub length: u32,

    /// Message user data, opaque to the transport. The relay uses it to flag
    /// cursor posts that carry a shape.
    pub udata: u32,

    /// Free-running serial of this post (the producer position at post time).
    pub serial: u32,

    /// Pending-readers mask: the subscriber bitmap captured at post time.
    /// Each subscriber clears its own bit once it has consumed the slot; the
    /// slot is reclaimable when the mask (masked by the live bitmap) is zero.
    pub pending: AtomicU32,

    pub _pad: [u32; 3],
}

/// Per-queue descriptor, embedded in the region header.
///
/// The cursors are free-running `u32` counters (slot index = cursor mod
/// capacity) so that a full ring and an empty ring are never ambiguous, the
/// same trick the rest of the transport uses for its rings. They are
/// `CachePadded`: the producer hammers `position` while subscribers poll it,
/// and false sharing between the two cursors costs real latency on the
/// frame path.
#[repr(C)]
pub struct QueueDesc {
    pub queue_id: u32,

    /// Ring capacity in slots.
    pub capacity: u32,

    /// Byte offset of the slot ring from the start of the region.
    pub ring_offset: u64,

    /// Producer cursor: next slot to be written.
    pub position: CachePadded<AtomicU32>,

    /// Reclaim cursor: oldest slot not yet released by all its readers.
    pub head: CachePadded<AtomicU32>,

    /// Subscriber bitmap. Subscribers CAS their bit in; the host clears bits
    /// on eviction.
    pub subs: AtomicU32,

    /// Incremented by each successful subscribe. The host-side delta of this
    /// counter is what `new_subs()` reports, which is the trigger for
    /// one-shot resends to late joiners.
    pub new_sub_count: AtomicU32,

    /// Per-subscriber heartbeat, written by subscribers as a copy of
    /// `RegionHeader::timestamp`. Only host-clock values are ever stored
    /// here; guest and hypervisor clocks are not comparable.
    pub timeouts: [AtomicU64; LGMP_MAX_SUBS],
}

/// The header at offset zero of the shared region.
#[repr(C)]
pub struct RegionHeader {
    /// Zero while the region is being laid out; [`LGMP_MAGIC`] once live.
    pub magic: AtomicU64,

    pub version: u32,

    /// Monotone across host restarts. A subscriber that observes a change
    /// must drop its cursors and re-attach.
    pub session_id: u32,

    /// Number of valid entries in `queues`.
    pub queue_count: AtomicU32,

    pub _pad: u32,

    /// Host monotonic milliseconds, refreshed every housekeeping tick.
    /// Subscribers copy this value into their heartbeat slot.
    pub timestamp: AtomicU64,

    pub queues: [QueueDesc; LGMP_MAX_QUEUES],
}
