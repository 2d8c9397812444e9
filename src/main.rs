use log::{error, info};
use std::process::ExitCode;
use std::sync::Arc;

use kvmfr_host::capture::pattern::PatternBackend;
use kvmfr_host::relay::Relay;
use kvmfr_host::Core::create_shared_memory;

/// Default arena size when the environment does not say otherwise, matching
/// the common 32 MiB ivshmem device.
const DEFAULT_REGION_MIB: usize = 32;

fn run_host() -> i32 {
    let mib = std::env::var("KVMFR_REGION_MIB")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_REGION_MIB);
    let size = mib * 1048576;

    // Stand-in for the inter-VM shared-memory device; its discovery is the
    // platform's job, the relay only ever sees (ptr, size).
    let shm = match create_shared_memory(size, Some("kvmfr")) {
        Ok(shm) => shm,
        Err(e) => {
            error!("failed to open the shared memory region: {e}");
            return -1;
        }
    };
    info!("shared region    : {} MiB", mib);
    info!("region address   : {:p}", shm.as_ptr());

    let backend = Arc::new(PatternBackend::new(1280, 800));
    let mut relay = match unsafe { Relay::new(shm.as_ptr(), shm.size(), backend) } {
        Ok(relay) => relay,
        Err(e) => {
            error!("relay initialisation failed: {e}");
            return -1;
        }
    };

    let quit = relay.state().clone();
    if let Err(e) = ctrlc::set_handler(move || quit.quit()) {
        error!("failed to install the shutdown handler: {e}");
        return -1;
    }

    match relay.run() {
        Ok(()) => {
            info!("shutdown complete");
            0
        }
        Err(e) => {
            error!("fatal: {e}");
            -1
        }
    }
}

fn main() -> ExitCode {
    let _logger = flexi_logger::Logger::try_with_env_or_str("info")
        .and_then(|l| l.start())
        .expect("logger init");

    // -1 on any fatal path, 0 on a clean shutdown
    ExitCode::from(run_host() as u8)
}
