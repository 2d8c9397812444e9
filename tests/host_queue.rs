// Host queue invariants: pending bounds, failed posts, backlog retention,
// subscriber eviction, new_subs decay, and FIFO delivery under threads.

mod common;

use common::{wait_for, AlignedRegion};
use kvmfr_host::LGMP::status::Error;
use kvmfr_host::LGMP::Client::LgmpClient;
use kvmfr_host::LGMP::Host::{HostQueue, LgmpHost, Memory};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const REGION_SIZE: usize = 1024 * 1024;

struct Rig {
    // the host and queue views point into this arena; none of them touch
    // it on drop
    _region: AlignedRegion,
    host: LgmpHost,
    queue: HostQueue,
    mems: Vec<Memory>,
}

fn make_rig(capacity: u32, buffers: usize, buf_size: usize) -> Rig {
    let region = AlignedRegion::new(REGION_SIZE);
    let host = unsafe { LgmpHost::init(region.as_ptr(), region.size()) }.unwrap();
    let queue = host.queue_new(0, capacity).unwrap();
    let mems = (0..buffers)
        .map(|_| host.mem_alloc(buf_size).unwrap())
        .collect();
    host.publish();
    Rig {
        _region: region,
        host,
        queue,
        mems,
    }
}

fn attach(rig: &Rig) -> LgmpClient {
    unsafe { LgmpClient::attach(rig._region.as_ptr(), rig._region.size()) }.unwrap()
}

#[test]
fn pending_bounds_and_failed_post_changes_nothing() {
    let rig = make_rig(2, 3, 4096);
    let client = attach(&rig);
    let mut sub = client.subscribe(0).unwrap();

    assert_eq!(rig.queue.pending(), 0);
    rig.queue.post(7, &rig.mems[0]).unwrap();
    rig.queue.post(8, &rig.mems[1]).unwrap();
    assert_eq!(rig.queue.pending(), 2);

    // full with a live reader on the oldest slot: post must fail and leave
    // the queue untouched
    assert_eq!(rig.queue.post(9, &rig.mems[2]).unwrap_err(), Error::QueueFull);
    assert_eq!(rig.queue.pending(), 2);

    // the reader still sees the original posts, in order
    let m0 = sub.advance().unwrap().unwrap();
    assert_eq!((m0.udata, m0.serial), (7, 0));
    assert_eq!(m0.payload.len(), 4096);
    let m1 = sub.advance().unwrap().unwrap();
    assert_eq!((m1.udata, m1.serial), (8, 1));
    assert!(sub.advance().unwrap().is_none());

    // both masks clear now; the producer reclaims in place and the retry
    // succeeds
    rig.queue.post(9, &rig.mems[2]).unwrap();
    assert_eq!(rig.queue.pending(), 2);
    let m2 = sub.advance().unwrap().unwrap();
    assert_eq!((m2.udata, m2.serial), (9, 2));
}

#[test]
fn backlog_retained_without_subscribers() {
    let rig = make_rig(2, 1, 1024);

    rig.queue.post(1, &rig.mems[0]).unwrap();
    assert_eq!(rig.queue.pending(), 1);

    // housekeeping holds the slot while nobody is subscribed
    for _ in 0..5 {
        rig.host.process().unwrap();
    }
    assert_eq!(rig.queue.pending(), 1);

    // but the producer never wedges: a full idle ring reclaims at post time
    for i in 2..12 {
        rig.queue.post(i, &rig.mems[0]).unwrap();
    }
    assert_eq!(rig.queue.pending(), 2);

    rig.host.process().unwrap();
    assert_eq!(rig.queue.pending(), 2);
}

#[test]
fn new_subs_counts_joiners_then_decays() {
    let rig = make_rig(2, 1, 1024);
    assert_eq!(rig.queue.new_subs(), 0);

    let client = attach(&rig);
    let _a = client.subscribe(0).unwrap();
    let _b = client.subscribe(0).unwrap();

    assert_eq!(rig.queue.new_subs(), 2);
    assert_eq!(rig.queue.new_subs(), 0);
    rig.host.process().unwrap();
    assert_eq!(rig.queue.new_subs(), 0);
}

#[test]
fn silent_subscriber_is_evicted() {
    let rig = make_rig(2, 2, 1024);
    rig.host.set_sub_timeout(50);

    let client = attach(&rig);
    let mut sub = client.subscribe(0).unwrap();
    rig.queue.post(1, &rig.mems[0]).unwrap();
    rig.queue.post(2, &rig.mems[1]).unwrap();
    assert_eq!(rig.queue.subs().count_ones(), 1);

    // no heartbeat past the budget
    thread::sleep(Duration::from_millis(120));
    rig.host.process().unwrap();

    assert_eq!(rig.queue.subs(), 0);
    assert_eq!(sub.advance().unwrap_err(), Error::Unsubscribed);

    // the slots it held are free again: a full ring accepts posts
    rig.queue.post(3, &rig.mems[0]).unwrap();
    rig.queue.post(4, &rig.mems[1]).unwrap();
}

#[test]
fn heartbeat_keeps_subscriber_alive() {
    let rig = make_rig(2, 1, 1024);
    rig.host.set_sub_timeout(50);

    let client = attach(&rig);
    let mut sub = client.subscribe(0).unwrap();

    for _ in 0..6 {
        thread::sleep(Duration::from_millis(25));
        rig.host.process().unwrap();
        // an empty poll counts as contact
        assert!(sub.advance().unwrap().is_none());
    }
    assert_eq!(rig.queue.subs().count_ones(), 1);
}

#[test]
fn host_restart_bumps_session_and_unbinds_subscribers() {
    let region = AlignedRegion::new(REGION_SIZE);

    let host1 = unsafe { LgmpHost::init(region.as_ptr(), region.size()) }.unwrap();
    let _q1 = host1.queue_new(0, 2).unwrap();
    host1.publish();
    let s1 = host1.session_id();

    let client = unsafe { LgmpClient::attach(region.as_ptr(), region.size()) }.unwrap();
    let mut sub = client.subscribe(0).unwrap();

    // host restart over the same arena
    let host2 = unsafe { LgmpHost::init(region.as_ptr(), region.size()) }.unwrap();
    let _q2 = host2.queue_new(0, 2).unwrap();
    host2.publish();

    assert_eq!(host2.session_id(), s1.wrapping_add(1));
    assert_eq!(sub.advance().unwrap_err(), Error::SessionMismatch);
}

#[test]
fn fifo_delivery_under_threads() {
    const COUNT: u32 = 200;
    const CAP: u32 = 4;

    let rig = Arc::new(make_rig(CAP, CAP as usize, 64));
    let client = attach(&rig);
    let mut sub = client.subscribe(0).unwrap();

    let producer = {
        let rig = rig.clone();
        thread::spawn(move || {
            for i in 0..COUNT {
                // wait for the slot's buffer to come back around
                while rig.queue.pending() == CAP {
                    thread::yield_now();
                }
                let mem = &rig.mems[(i % CAP) as usize];
                unsafe {
                    (mem.as_ptr() as *mut u64).write_unaligned(i as u64);
                }
                rig.queue.post(i, mem).unwrap();
            }
        })
    };

    let mut expect: u32 = 0;
    assert!(
        wait_for(
            || {
                while let Ok(Some(msg)) = sub.advance() {
                    assert_eq!(msg.serial, expect);
                    assert_eq!(msg.udata, expect);
                    let value = u64::from_le_bytes(msg.payload[..8].try_into().unwrap());
                    assert_eq!(value, expect as u64);
                    expect += 1;
                }
                expect == COUNT
            },
            Duration::from_secs(10),
        ),
        "consumer stalled at {expect}"
    );

    producer.join().unwrap();
}
