/// Reads machine words from memory that may not be mapped.
///
/// Implementations must never fault: an unreadable address is reported as
/// `None`, not as a hardware exception.
pub trait MemoryReader {
    fn read_word(&self, address: u64) -> Option<u64>;
}

impl<M: MemoryReader + ?Sized> MemoryReader for &M {
    #[inline]
    fn read_word(&self, address: u64) -> Option<u64> {
        (**self).read_word(address)
    }
}

/// Reads the current process's memory through the kernel, so that bad
/// addresses come back as `EFAULT` rather than `SIGSEGV`.
///
/// `process_vm_readv` and `getpid` are plain system calls, which keeps this
/// usable from a signal handler.
#[derive(Debug, Default, Copy, Clone)]
pub struct LocalMemory;

#[cfg(target_os = "linux")]
impl MemoryReader for LocalMemory {
    #[inline]
    fn read_word(&self, address: u64) -> Option<u64> {
        read_process_word(unsafe { libc::getpid() }, address)
    }
}

/// Reads the memory of another process, e.g. a ptrace-stopped tracee.
#[cfg(target_os = "linux")]
#[derive(Debug, Copy, Clone)]
pub struct ProcessMemory(pub libc::pid_t);

#[cfg(target_os = "linux")]
impl MemoryReader for ProcessMemory {
    #[inline]
    fn read_word(&self, address: u64) -> Option<u64> {
        read_process_word(self.0, address)
    }
}

#[cfg(target_os = "linux")]
fn read_process_word(pid: libc::pid_t, address: u64) -> Option<u64> {
    let mut word = 0u64;
    let local = libc::iovec {
        iov_base: &mut word as *mut u64 as *mut libc::c_void,
        iov_len: std::mem::size_of::<u64>(),
    };
    let remote = libc::iovec {
        iov_base: address as *mut libc::c_void,
        iov_len: std::mem::size_of::<u64>(),
    };
    let size = unsafe { libc::process_vm_readv(pid, &local, 1, &remote, 1, 0) };
    if size == std::mem::size_of::<u64>() as isize {
        Some(word)
    } else {
        None
    }
}
