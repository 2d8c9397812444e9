// Shared memory backing for the relay region on Linux
// Uses memfd_create + mmap; stands in for the inter-VM shared-memory device,
// whose discovery is outside the library (the core only consumes (ptr, size))

use std::io;
use std::ptr::NonNull;

/// Backing region abstraction so the binary and the tests can source the
/// relay arena from anywhere that yields a mapped `(ptr, size)` pair.
pub trait SharedMemoryBackend: Send + Sync {
    /// Get a pointer to the mapped memory region
    fn as_ptr(&self) -> *mut u8;

    /// Get the size of the mapped region in bytes
    fn size(&self) -> usize;

    /// Get the underlying file descriptor
    fn raw_handle(&self) -> RawHandle;
}

/// Platform-specific handle type
#[derive(Debug, Clone, Copy)]
pub enum RawHandle {
    /// Unix file descriptor (Linux)
    Fd(i32),
}

/// Create a new shared memory region with the specified size.
///
/// The mapping is zero-initialised, which the region initialisation relies
/// on for reading back a previous session id (a fresh mapping reads as an
/// invalid header).
#[cfg(target_os = "linux")]
pub fn create_shared_memory(
    size: usize,
    name: Option<&str>,
) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::create(size, name)?))
}

#[cfg(not(target_os = "linux"))]
pub fn create_shared_memory(
    _size: usize,
    _name: Option<&str>,
) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(target_os = "linux")]
use libc::{c_void, syscall, SYS_memfd_create};
#[cfg(target_os = "linux")]
use std::ffi::CString;
#[cfg(target_os = "linux")]
use std::os::unix::io::RawFd;

#[cfg(target_os = "linux")]
pub struct LinuxSharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    fd: RawFd,
}

#[cfg(target_os = "linux")]
unsafe impl Send for LinuxSharedMemory {}
#[cfg(target_os = "linux")]
unsafe impl Sync for LinuxSharedMemory {}

#[cfg(target_os = "linux")]
impl LinuxSharedMemory {
    /// Create a new shared memory region using memfd_create
    pub fn create(size: usize, name: Option<&str>) -> io::Result<Self> {
        let c_name = CString::new(name.unwrap_or("kvmfr_shm")).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "region name contains NUL")
        })?;

        let fd = unsafe { syscall(SYS_memfd_create, c_name.as_ptr(), 1u64 /* MFD_CLOEXEC */) as RawFd };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(Self {
            ptr: NonNull::new(ptr as *mut u8).ok_or_else(|| {
                io::Error::new(io::ErrorKind::Other, "mmap returned a null mapping")
            })?,
            size,
            fd,
        })
    }
}

#[cfg(target_os = "linux")]
impl Drop for LinuxSharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut c_void, self.size);
            libc::close(self.fd);
        }
    }
}

#[cfg(target_os = "linux")]
impl SharedMemoryBackend for LinuxSharedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn raw_handle(&self) -> RawHandle {
        RawHandle::Fd(self.fd)
    }
}
