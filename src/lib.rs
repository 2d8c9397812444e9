// Module naming follows project convention (LGMP = the shared-memory message
// transport; KVMFR = KVM FrameRelay, the payload format carried over it)
#[allow(non_snake_case)]
pub mod LGMP {
    pub mod Host {
        pub mod Host;
        pub mod Host_impl;
        pub mod layout;
        pub use Host::{HostQueue, LgmpHost, Memory}; // re-export for stable path
    }
    pub mod Client {
        pub mod client;
        pub use client::{ClientQueue, LgmpClient, Message}; // re-export for stable path
    }
    pub mod status;
    pub use status::Error;
}

#[allow(non_snake_case)]
pub mod KVMFR {
    pub mod Structs {
        pub mod KVMFR_Structs;
        pub use KVMFR_Structs::{FrameDamageRect, KVMFRCursor, KVMFRFrame}; // re-export for stable path
    }
}

#[allow(non_snake_case)]
pub mod Core {
    pub mod SharedMemory;
    pub use SharedMemory::{create_shared_memory, RawHandle, SharedMemoryBackend};
    pub mod clock;
}

pub mod capture;
pub mod relay;
