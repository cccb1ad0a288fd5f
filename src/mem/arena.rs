use std::io::{Error, Result};
use std::ptr::{null_mut, NonNull};

/// Anonymous shared mapping for pinned host memory: signal cells, staging
/// buffers and kernargs pages that both the host and device engines
/// address directly.
///
/// The mapping lives until drop, which is what lets [`Signal`] hand out
/// raw cell addresses with a lifetime contract instead of borrows.
///
/// [`Signal`]: crate::signal::Signal
pub struct HostArena {
    ptr: NonNull<u8>,
    len: usize,
}

impl HostArena {
    pub fn new(len: usize) -> Result<Self> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_SHARED | libc::MAP_ANONYMOUS;
        let ptr = unsafe { libc::mmap(null_mut(), len, prot, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(Self {
            ptr: unsafe { NonNull::new_unchecked(ptr.cast()) },
            len,
        })
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for HostArena {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if result == -1 {
            panic!("Failed to unmap arena: {}", Error::last_os_error());
        }
    }
}
