use log::{debug, warn};
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use super::layout::{
    align_up, QueueDesc, RegionHeader, SlotRecord, LGMP_ALIGNMENT, LGMP_MAGIC, LGMP_MAX_QUEUES,
    LGMP_MAX_SUBS, LGMP_SUB_TIMEOUT_MS, LGMP_VERSION,
};
use super::Host::{HostQueue, LgmpHost, Memory};
use crate::Core::clock;
use crate::LGMP::status::{Error, Result};

impl LgmpHost {
    /// Take ownership of the region at `base` and lay it out from scratch.
    ///
    /// A previously valid header's session id is read back first so the new
    /// session id stays monotone across host restarts; clients detect the
    /// change and rebind. The magic is NOT published here: the caller
    /// creates its queues and buffers first, then calls [`publish`].
    ///
    /// # Safety
    /// Caller must guarantee `[base, base + size)` is a mapped, writable
    /// region that no other code in this process touches for the lifetime
    /// of the host.
    ///
    /// [`publish`]: LgmpHost::publish
    pub unsafe fn init(base: *mut u8, size: usize) -> Result<Self> {
        if base.is_null() {
            return Err(Error::InvalidArgument("region base is null"));
        }
        if (base as usize) % LGMP_ALIGNMENT != 0 {
            return Err(Error::InvalidRegion("region base is not 128-byte aligned"));
        }

        let header_size = align_up(size_of::<RegionHeader>());
        if size < header_size + LGMP_ALIGNMENT {
            return Err(Error::OutOfMemory {
                requested: header_size + LGMP_ALIGNMENT,
                available: size,
            });
        }

        let header = base as *mut RegionHeader;

        // A region that still carries a live header is a restart; bump its
        // session id so subscribers notice. Zero otherwise (fresh mappings
        // read as zero, which never matches the magic).
        let prev_session = if (*header).magic.load(Relaxed) == LGMP_MAGIC {
            Some((*header).session_id)
        } else {
            None
        };
        let session_id = match prev_session {
            Some(prev) => {
                let next = prev.wrapping_add(1);
                if next == 0 {
                    1
                } else {
                    next
                }
            }
            None => 1,
        };

        ptr::write_bytes(base, 0, size);

        (*header).version = LGMP_VERSION;
        (*header).session_id = session_id;
        (*header)
            .timestamp
            .store(clock::monotonic_ms(), Relaxed);

        debug!("region initialised: {} bytes, session {}", size, session_id);

        Ok(Self {
            base,
            size,
            header,
            session_id,
            sub_timeout_ms: std::sync::atomic::AtomicU64::new(LGMP_SUB_TIMEOUT_MS),
            alloc_next: parking_lot::Mutex::new(header_size),
        })
    }

    /// Override the subscriber silence budget (host-local policy, not part
    /// of the wire layout).
    pub fn set_sub_timeout(&self, ms: u64) {
        self.sub_timeout_ms.store(ms, Relaxed);
    }

    /// Publish the magic, making the region visible to clients.
    ///
    /// Must be called after every queue and pooled buffer has been laid out;
    /// the Release store is the initialisation barrier of the whole region.
    pub fn publish(&self) {
        let hdr = unsafe { &*self.header };
        hdr.timestamp.store(clock::monotonic_ms(), Release);
        hdr.magic.store(LGMP_MAGIC, Release);
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Bytes still available to `mem_alloc` / `queue_new`.
    pub fn mem_avail(&self) -> usize {
        self.size - *self.alloc_next.lock()
    }

    /// Allocate a 128-byte aligned pooled buffer from the arena.
    pub fn mem_alloc(&self, size: usize) -> Result<Memory> {
        if size == 0 || size > u32::MAX as usize {
            return Err(Error::InvalidArgument("invalid buffer size"));
        }

        let mut next = self.alloc_next.lock();
        let offset = self.bump(&mut next, size)?;

        Ok(Memory {
            offset: offset as u32,
            size,
            ptr: unsafe { self.base.add(offset) },
        })
    }

    /// Create a queue with the given wire id and ring capacity.
    pub fn queue_new(&self, queue_id: u32, capacity: u32) -> Result<HostQueue> {
        if capacity == 0 || capacity as usize > LGMP_MAX_SUBS {
            // capacity also bounds in-flight buffers; a ring deeper than the
            // bitmap width serves nothing
            return Err(Error::InvalidArgument("invalid queue capacity"));
        }

        let mut next = self.alloc_next.lock();

        let count = unsafe { (*self.header).queue_count.load(Acquire) } as usize;
        if count >= LGMP_MAX_QUEUES {
            return Err(Error::InvalidArgument("queue descriptor table is full"));
        }
        for q in 0..count {
            if unsafe { (*self.header).queues[q].queue_id } == queue_id {
                return Err(Error::InvalidArgument("queue id already in use"));
            }
        }

        let ring_offset = self.bump(&mut next, capacity as usize * size_of::<SlotRecord>())?;

        // The ring itself is already zeroed; only the descriptor needs
        // filling. Plain stores are fine: the region is not published yet,
        // or (after a restart) no client holds this descriptor.
        let desc = unsafe { ptr::addr_of_mut!((*self.header).queues[count]) };
        unsafe {
            (*desc).queue_id = queue_id;
            (*desc).capacity = capacity;
            (*desc).ring_offset = ring_offset as u64;

            (*self.header).queue_count.store(count as u32 + 1, Release);
        }

        Ok(HostQueue {
            base: self.base,
            desc,
            ring: unsafe { self.base.add(ring_offset) as *mut SlotRecord },
            capacity,
            last_sub_count: std::sync::atomic::AtomicU32::new(0),
        })
    }

    /// Periodic maintenance: refresh the published host clock, evict
    /// subscribers past their heartbeat timeout, and advance queue heads
    /// past fully-consumed slots.
    ///
    /// The housekeeping loop drives this at roughly 1 kHz.
    pub fn process(&self) -> Result<()> {
        let hdr = unsafe { &*self.header };
        let now = clock::monotonic_ms();
        hdr.timestamp.store(now, Release);

        let count = hdr.queue_count.load(Acquire) as usize;
        for q in 0..count.min(LGMP_MAX_QUEUES) {
            let desc = &hdr.queues[q];
            unsafe { self.process_queue(desc, now) };
        }
        Ok(())
    }

    unsafe fn process_queue(&self, desc: &QueueDesc, now: u64) {
        let ring = self.base.add(desc.ring_offset as usize) as *mut SlotRecord;
        let capacity = desc.capacity;
        let timeout = self.sub_timeout_ms.load(Relaxed);

        // Eviction: a silent subscriber loses its bit and every pending
        // reference it still holds.
        let subs = desc.subs.load(Acquire);
        for id in 0..LGMP_MAX_SUBS {
            let bit = 1u32 << id;
            if subs & bit == 0 {
                continue;
            }
            let seen = desc.timeouts[id].load(Acquire);
            if now.saturating_sub(seen) <= timeout {
                continue;
            }

            warn!(
                "queue {}: evicting subscriber {} ({}ms since last contact)",
                desc.queue_id,
                id,
                now.saturating_sub(seen)
            );
            desc.subs.fetch_and(!bit, AcqRel);

            let pos = desc.position.load(Acquire);
            let mut i = desc.head.load(Acquire);
            while i != pos {
                (*ring.add((i % capacity) as usize))
                    .pending
                    .fetch_and(!bit, AcqRel);
                i = i.wrapping_add(1);
            }
        }

        // Reclaim. While nobody is subscribed the backlog is retained so the
        // first subscriber can resynchronise from it; an idle full ring is
        // unwedged by the producer itself at post time.
        let subs = desc.subs.load(Acquire);
        if subs == 0 {
            return;
        }

        let pos = desc.position.load(Acquire);
        let mut head = desc.head.load(Acquire);
        while head != pos {
            let slot = &*ring.add((head % capacity) as usize);
            if slot.pending.load(Acquire) & subs != 0 {
                break;
            }
            // CAS: the producer may advance the head itself on a full ring
            match desc
                .head
                .compare_exchange(head, head.wrapping_add(1), AcqRel, Acquire)
            {
                Ok(_) => head = head.wrapping_add(1),
                Err(current) => head = current,
            }
        }
    }

    fn bump(&self, next: &mut usize, size: usize) -> Result<usize> {
        let aligned = align_up(size);
        if *next + aligned > self.size {
            return Err(Error::OutOfMemory {
                requested: aligned,
                available: self.size - *next,
            });
        }
        let offset = *next;
        *next += aligned;
        Ok(offset)
    }
}

impl HostQueue {
    #[inline]
    fn desc(&self) -> &QueueDesc {
        unsafe { &*self.desc }
    }

    #[inline]
    unsafe fn slot(&self, cursor: u32) -> *mut SlotRecord {
        self.ring.add((cursor % self.capacity) as usize)
    }

    pub fn queue_id(&self) -> u32 {
        self.desc().queue_id
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of posted slots not yet reclaimed: `position - head`, always
    /// in `0..=capacity`.
    pub fn pending(&self) -> u32 {
        let desc = self.desc();
        desc.position
            .load(Acquire)
            .wrapping_sub(desc.head.load(Acquire))
    }

    /// Current subscriber bitmap.
    pub fn subs(&self) -> u32 {
        self.desc().subs.load(Acquire)
    }

    /// Count of subscribers that joined since the last call. Producers use
    /// a non-zero return to trigger a one-shot resend of the last message.
    pub fn new_subs(&self) -> u32 {
        let cur = self.desc().new_sub_count.load(Acquire);
        cur.wrapping_sub(self.last_sub_count.swap(cur, AcqRel))
    }

    /// Post `mem` to the next slot.
    ///
    /// Fails with [`Error::QueueFull`] when the ring is full and the oldest
    /// slot still has live pending readers; a failed post mutates nothing.
    /// On success the slot captures the current subscriber bitmap as its
    /// pending-readers mask and the producer cursor advances.
    pub fn post(&self, udata: u32, mem: &Memory) -> Result<()> {
        let desc = self.desc();

        // Single producer: position is only ever stored by us.
        let pos = desc.position.load(Relaxed);
        let head = desc.head.load(Acquire);

        if pos.wrapping_sub(head) == self.capacity {
            // Ring full. Reclaim the oldest slot in place if every reader is
            // done with it (or nobody is subscribed at all); otherwise the
            // caller must retry after the housekeeping tick frees capacity.
            let oldest = unsafe { &*self.slot(head) };
            let live = oldest.pending.load(Acquire) & desc.subs.load(Acquire);
            if live != 0 {
                return Err(Error::QueueFull);
            }
            // CAS: housekeeping may have advanced the head already; either
            // way there is room now
            let _ = desc
                .head
                .compare_exchange(head, head.wrapping_add(1), AcqRel, Acquire);
        }

        unsafe {
            let slot = self.slot(pos);
            // Plain stores: the slot's mask is empty, so no reader may look
            // at it until the Release publication below.
            (*slot).offset = mem.offset;
            (*slot).length = mem.size as u32;
            (*slot).udata = udata;
            (*slot).serial = pos;
            (*slot).pending.store(desc.subs.load(Acquire), Release);
        }

        desc.position.store(pos.wrapping_add(1), Release);
        Ok(())
    }
}
