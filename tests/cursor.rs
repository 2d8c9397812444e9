// Cursor producer behaviour: buffer rotation, shape retention, and shape
// re-delivery for late subscribers.

mod common;

use common::{AlignedRegion, ScriptedBackend};
use kvmfr_host::capture::{CaptureFormat, CapturePointer, PointerSink};
use kvmfr_host::relay::Relay;
use kvmfr_host::KVMFR::Structs::KVMFR_Structs::KVMFRCursor;
use kvmfr_host::LGMP::Client::LgmpClient;
use kvmfr_host::LGMP::Host::layout::{LGMP_Q_POINTER, LGMP_Q_POINTER_LEN};
use std::mem::size_of;

const REGION_SIZE: usize = 8 * 1024 * 1024;

fn position_update(x: i32, y: i32) -> CapturePointer {
    CapturePointer {
        position_update: true,
        visible: true,
        x,
        y,
        ..Default::default()
    }
}

fn shape_update(seed: u8) -> (CapturePointer, Vec<u8>) {
    let pixels: Vec<u8> = (0..32u32 * 32 * 4)
        .map(|i| (i as u8).wrapping_add(seed))
        .collect();
    (
        CapturePointer {
            position_update: true,
            shape_update: true,
            visible: true,
            x: 10,
            y: 20,
            format: CaptureFormat::Color,
            width: 32,
            height: 32,
            pitch: 32 * 4,
            ..Default::default()
        },
        pixels,
    )
}

/// Write shape pixels the way a backend's cursor thread would, then post.
fn post_shape(sink: &dyn PointerSink, seed: u8) -> Vec<u8> {
    let (pointer, pixels) = shape_update(seed);
    let buf = sink.get_pointer_buffer().expect("pointer buffer");
    assert!(buf.size as usize >= pixels.len());
    unsafe { std::ptr::copy_nonoverlapping(pixels.as_ptr(), buf.data, pixels.len()) };
    sink.post_pointer_buffer(pointer);
    pixels
}

#[test]
fn position_stream_rotates_ten_buffers_with_one_swap() {
    let region = AlignedRegion::new(REGION_SIZE);
    let backend = ScriptedBackend::new(256, 256);
    let relay = unsafe { Relay::new(region.as_ptr(), region.size(), backend.clone()) }.unwrap();
    let state = relay.state().clone();

    let client = unsafe { LgmpClient::attach(region.as_ptr(), region.size()) }.unwrap();
    let mut sub = client.subscribe(LGMP_Q_POINTER).unwrap();

    // one real shape first; it consumes the new-subscriber flag and swaps
    // the retained buffer exactly once
    post_shape(backend.sink().as_ref(), 0x11);
    let shape_msg = sub.advance().unwrap().unwrap();
    assert_eq!(shape_msg.udata, 1);
    let retained_offset = shape_msg.payload.as_ptr() as usize;

    // a long position-only stream: every update rotates, none swaps
    let mut offsets = Vec::new();
    for i in 0..1000 {
        state.post_pointer_buffer(position_update(i, i * 2));
        assert!(state.pointer_queue().pending() <= LGMP_Q_POINTER_LEN as u32);

        let msg = sub.advance().unwrap().expect("one update per post");
        assert_eq!(msg.udata, 0);

        let cursor = unsafe { (msg.payload.as_ptr() as *const KVMFRCursor).read() };
        assert_eq!((cursor.x, cursor.y, cursor.visible), (i, i * 2, 1));

        offsets.push(msg.payload.as_ptr() as usize);
    }

    // strict round-robin over exactly ten buffers, never the retained shape
    let distinct: std::collections::BTreeSet<usize> = offsets.iter().copied().collect();
    assert_eq!(distinct.len(), LGMP_Q_POINTER_LEN);
    assert!(!distinct.contains(&retained_offset));
    for (i, offset) in offsets.iter().enumerate() {
        assert_eq!(*offset, offsets[i % LGMP_Q_POINTER_LEN]);
    }
}

#[test]
fn shape_redelivered_to_late_subscriber() {
    let region = AlignedRegion::new(REGION_SIZE);
    let backend = ScriptedBackend::new(256, 256);
    let relay = unsafe { Relay::new(region.as_ptr(), region.size(), backend.clone()) }.unwrap();
    let state = relay.state().clone();
    let sink = backend.sink();

    // shape established before anyone is listening
    let pixels = post_shape(sink.as_ref(), 0x42);

    // a couple of position updates pass by
    state.post_pointer_buffer(position_update(1, 1));
    state.post_pointer_buffer(position_update(2, 2));

    // late joiner: the very next position-only update must carry the shape
    let client = unsafe { LgmpClient::attach(region.as_ptr(), region.size()) }.unwrap();
    let mut sub = client.subscribe(LGMP_Q_POINTER).unwrap();
    state.post_pointer_buffer(position_update(3, 3));

    let mut last = None;
    while let Some(msg) = sub.advance().unwrap() {
        last = Some((msg.udata, msg.payload.to_vec()));
    }
    let (udata, payload) = last.expect("no cursor update seen");
    assert_eq!(udata, 1);

    let cursor = unsafe { (payload.as_ptr() as *const KVMFRCursor).read() };
    assert_eq!((cursor.x, cursor.y), (3, 3));
    assert_eq!((cursor.width, cursor.height), (32, 32));

    // the retained buffer still holds the exact shape bytes
    let shape = &payload[size_of::<KVMFRCursor>()..size_of::<KVMFRCursor>() + pixels.len()];
    assert_eq!(shape, &pixels[..]);

    // with the flag consumed, the following update rotates again
    state.post_pointer_buffer(position_update(4, 4));
    let msg = sub.advance().unwrap().unwrap();
    assert_eq!(msg.udata, 0);
}

#[test]
fn invalid_shape_format_drops_update() {
    let region = AlignedRegion::new(REGION_SIZE);
    let backend = ScriptedBackend::new(256, 256);
    let relay = unsafe { Relay::new(region.as_ptr(), region.size(), backend.clone()) }.unwrap();
    let state = relay.state().clone();

    let client = unsafe { LgmpClient::attach(region.as_ptr(), region.size()) }.unwrap();
    let mut sub = client.subscribe(LGMP_Q_POINTER).unwrap();

    // a frame pixel format is not a cursor format
    state.post_pointer_buffer(CapturePointer {
        shape_update: true,
        format: CaptureFormat::Bgra,
        width: 32,
        height: 32,
        pitch: 128,
        ..Default::default()
    });
    assert!(sub.advance().unwrap().is_none());

    // the stream continues afterwards
    state.post_pointer_buffer(position_update(9, 9));
    // shape_valid never became true, so no shape is attached despite the
    // new-subscriber flag having been consumed by the dropped update
    let msg = sub.advance().unwrap().unwrap();
    assert_eq!(msg.udata, 0);
}
