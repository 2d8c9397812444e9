use lazy_static::lazy_static;
use std::time::Instant;

lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// Milliseconds of monotonic time since the host process started.
///
/// This is the only clock that ever enters the shared region: the host
/// publishes it in the region header each housekeeping tick and subscribers
/// copy it back as their heartbeat, so guest and hypervisor wall clocks are
/// never compared against each other.
pub fn monotonic_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}
