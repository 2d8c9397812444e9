// Subscriber side of the transport. The real compositor lives in another
// process on the hypervisor; this reference client exists so the wire
// contract is exercised from the reading side by the tests and the demo.

use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crate::LGMP::status::{Error, Result};
use crate::LGMP::Host::layout::{
    QueueDesc, RegionHeader, SlotRecord, LGMP_MAGIC, LGMP_MAX_QUEUES, LGMP_MAX_SUBS, LGMP_VERSION,
};

/// A client attached to a published region.
pub struct LgmpClient {
    base: *const u8,
    header: *const RegionHeader,
    session_id: u32,
}

unsafe impl Send for LgmpClient {}

/// One message as observed by a subscriber.
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    pub udata: u32,
    pub serial: u32,
    pub payload: &'a [u8],
}

/// A subscription to one queue: a claimed bitmap bit plus a local cursor.
pub struct ClientQueue {
    base: *const u8,
    header: *const RegionHeader,
    desc: *const QueueDesc,
    ring: *const SlotRecord,
    capacity: u32,
    session_id: u32,

    /// Claimed bit index in the subscriber bitmap.
    id: u32,

    /// Next slot to read (free-running, same domain as the queue cursors).
    cursor: u32,
}

unsafe impl Send for ClientQueue {}

impl LgmpClient {
    /// Attach to the region at `base`, validating magic and version.
    ///
    /// # Safety
    /// Caller must guarantee `[base, base + size)` is a mapped region that
    /// stays mapped for the lifetime of the client.
    pub unsafe fn attach(base: *const u8, size: usize) -> Result<Self> {
        if base.is_null() {
            return Err(Error::InvalidArgument("region base is null"));
        }
        if size < std::mem::size_of::<RegionHeader>() {
            return Err(Error::InvalidRegion("region smaller than its header"));
        }

        let header = base as *const RegionHeader;
        // Acquire pairs with the host's publishing Release: a valid magic
        // means the whole layout is visible.
        if (*header).magic.load(Acquire) != LGMP_MAGIC {
            return Err(Error::InvalidRegion("magic not present"));
        }
        if (*header).version != LGMP_VERSION {
            return Err(Error::InvalidRegion("layout version mismatch"));
        }

        Ok(Self {
            base,
            header,
            session_id: (*header).session_id,
        })
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Subscribe to the queue with the given wire id, claiming a bitmap bit.
    pub fn subscribe(&self, queue_id: u32) -> Result<ClientQueue> {
        let hdr = unsafe { &*self.header };
        let count = hdr.queue_count.load(Acquire) as usize;

        let mut found = None;
        for q in 0..count.min(LGMP_MAX_QUEUES) {
            if hdr.queues[q].queue_id == queue_id {
                found = Some(&hdr.queues[q]);
                break;
            }
        }
        let desc = found.ok_or(Error::InvalidArgument("no such queue"))?;

        // Claim a free bit. The heartbeat slot is seeded before the CAS so
        // the host cannot observe a set bit with a stale timestamp.
        let id = loop {
            let subs = desc.subs.load(Acquire);
            let free = (!subs).trailing_zeros();
            if free as usize >= LGMP_MAX_SUBS {
                return Err(Error::OutOfMemory {
                    requested: 1,
                    available: 0,
                });
            }
            desc.timeouts[free as usize].store(hdr.timestamp.load(Relaxed), Release);
            if desc
                .subs
                .compare_exchange(subs, subs | (1 << free), AcqRel, Relaxed)
                .is_ok()
            {
                break free;
            }
        };

        desc.new_sub_count.fetch_add(1, Release);

        Ok(ClientQueue {
            base: self.base,
            header: self.header,
            desc,
            ring: unsafe { self.base.add(desc.ring_offset as usize) as *const SlotRecord },
            capacity: desc.capacity,
            session_id: self.session_id,
            id,
            cursor: desc.head.load(Acquire),
        })
    }
}

impl ClientQueue {
    #[inline]
    fn desc(&self) -> &QueueDesc {
        unsafe { &*self.desc }
    }

    pub fn subscriber_id(&self) -> u32 {
        self.id
    }

    /// Refresh this subscriber's heartbeat from the host-published clock.
    pub fn heartbeat(&self) {
        let hdr = unsafe { &*self.header };
        self.desc().timeouts[self.id as usize].store(hdr.timestamp.load(Relaxed), Release);
    }

    fn check_bound(&self) -> Result<()> {
        let hdr = unsafe { &*self.header };
        if hdr.session_id != self.session_id || hdr.magic.load(Acquire) != LGMP_MAGIC {
            return Err(Error::SessionMismatch);
        }
        if self.desc().subs.load(Acquire) & (1 << self.id) == 0 {
            return Err(Error::Unsubscribed);
        }
        Ok(())
    }

    /// Read the next message, releasing our pending reference to its slot.
    ///
    /// Returns `Ok(None)` when caught up with the producer. Every call,
    /// successful or empty, counts as contact and refreshes the heartbeat.
    pub fn advance(&mut self) -> Result<Option<Message<'_>>> {
        self.check_bound()?;
        self.heartbeat();

        let pos = self.desc().position.load(Acquire);
        if self.cursor == pos {
            return Ok(None);
        }

        // If the head moved past us (only possible around eviction and
        // rebind) resynchronise at the oldest retained slot.
        let head = self.desc().head.load(Acquire);
        if pos.wrapping_sub(self.cursor) > pos.wrapping_sub(head) {
            self.cursor = head;
        }

        let slot = unsafe { &*self.ring.add((self.cursor % self.capacity) as usize) };
        let udata = slot.udata;
        let serial = slot.serial;

        // A backlog slot (posted before we subscribed) carries no pending
        // bit of ours and may be reclaimed under us; the serial doubles as
        // an overwrite detector since it always equals the post cursor.
        if serial != self.cursor {
            self.cursor = self.desc().head.load(Acquire);
            return Ok(None);
        }

        let payload = unsafe {
            std::slice::from_raw_parts(self.base.add(slot.offset as usize), slot.length as usize)
        };

        slot.pending.fetch_and(!(1 << self.id), AcqRel);
        self.cursor = self.cursor.wrapping_add(1);

        Ok(Some(Message {
            udata,
            serial,
            payload,
        }))
    }

    /// Drop the subscription, releasing every slot we still held.
    pub fn unsubscribe(&mut self) {
        let desc = self.desc();
        let bit = 1u32 << self.id;
        if desc.subs.fetch_and(!bit, AcqRel) & bit == 0 {
            return; // already evicted
        }

        let pos = desc.position.load(Acquire);
        let mut i = desc.head.load(Acquire);
        while i != pos {
            unsafe {
                (*self.ring.add((i % self.capacity) as usize))
                    .pending
                    .fetch_and(!bit, AcqRel);
            }
            i = i.wrapping_add(1);
        }
    }
}

impl Drop for ClientQueue {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
