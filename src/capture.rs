use crate::registers::{Context, ExceptionState, FloatState, GeneralState};
use crate::{Error, Result};
use std::fmt;

/// Which register set of a thread is being fetched.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StateKind {
    General,
    Float,
    Exception,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StateKind::General => "general purpose",
            StateKind::Float => "floating point",
            StateKind::Exception => "exception",
        })
    }
}

/// Fetches the register sets of a suspended thread through an OS primitive.
///
/// Each method fills one set or returns the OS error code.
pub trait ThreadStateProvider {
    type Thread: Copy;

    fn general_state(&self, thread: Self::Thread, state: &mut GeneralState) -> std::result::Result<(), i32>;

    fn float_state(&self, thread: Self::Thread, state: &mut FloatState) -> std::result::Result<(), i32>;

    fn exception_state(&self, thread: Self::Thread, state: &mut ExceptionState) -> std::result::Result<(), i32>;
}

impl Context {
    /// Capture the register sets of a suspended thread.
    ///
    /// The sets are fetched one at a time and capture stops at the first one
    /// that cannot be read. The signal mask of the snapshot is left empty.
    pub fn from_thread<P>(provider: &P, thread: P::Thread) -> Result<Self>
    where
        P: ThreadStateProvider + ?Sized,
    {
        let mut context = Context::default();
        provider
            .general_state(thread, &mut context.general)
            .map_err(|code| Error::ThreadState {
                state: StateKind::General,
                code,
            })?;
        provider
            .float_state(thread, &mut context.float)
            .map_err(|code| Error::ThreadState {
                state: StateKind::Float,
                code,
            })?;
        provider
            .exception_state(thread, &mut context.exception)
            .map_err(|code| Error::ThreadState {
                state: StateKind::Exception,
                code,
            })?;
        context.sigmask = 0;
        Ok(context)
    }
}

/// Reads the registers of a thread that is ptrace-stopped by the caller.
///
/// The thread is identified by its tid. The exception state is derived from
/// the pending signal: `trapno` holds the signal number, `err` the signal
/// code and `fault_address` the faulting address.
///
/// For a tracee in another process, scan its stack with
/// [crate::memory::ProcessMemory] through [crate::Cursor::with_memory].
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[derive(Debug, Default, Copy, Clone)]
pub struct PtraceProvider;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl PtraceProvider {
    unsafe fn ptrace<T>(request: libc::c_uint, tid: libc::pid_t, data: *mut T) -> std::result::Result<(), i32> {
        if libc::ptrace(request, tid, std::ptr::null_mut::<libc::c_void>(), data as *mut libc::c_void) == -1 {
            let errno = *libc::__errno_location();
            log::debug!("ptrace request {} on {} failed: errno {}", request, tid, errno);
            return Err(errno);
        }
        Ok(())
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl ThreadStateProvider for PtraceProvider {
    type Thread = libc::pid_t;

    fn general_state(&self, tid: libc::pid_t, state: &mut GeneralState) -> std::result::Result<(), i32> {
        use crate::registers::Register;

        let mut regs = unsafe { std::mem::zeroed::<libc::user_regs_struct>() };
        unsafe { Self::ptrace(libc::PTRACE_GETREGS, tid, &mut regs)? };
        state[Register::Rax] = regs.rax;
        state[Register::Rbx] = regs.rbx;
        state[Register::Rcx] = regs.rcx;
        state[Register::Rdx] = regs.rdx;
        state[Register::Rdi] = regs.rdi;
        state[Register::Rsi] = regs.rsi;
        state[Register::Rbp] = regs.rbp;
        state[Register::Rsp] = regs.rsp;
        state[Register::R8] = regs.r8;
        state[Register::R9] = regs.r9;
        state[Register::R10] = regs.r10;
        state[Register::R11] = regs.r11;
        state[Register::R12] = regs.r12;
        state[Register::R13] = regs.r13;
        state[Register::R14] = regs.r14;
        state[Register::R15] = regs.r15;
        state[Register::Rip] = regs.rip;
        state[Register::Rflags] = regs.eflags;
        state[Register::Cs] = regs.cs;
        state[Register::Fs] = regs.fs;
        state[Register::Gs] = regs.gs;
        Ok(())
    }

    fn float_state(&self, tid: libc::pid_t, state: &mut FloatState) -> std::result::Result<(), i32> {
        // `user_fpregs_struct` is the FXSAVE layout.
        let mut fpregs = unsafe { std::mem::zeroed::<libc::user_fpregs_struct>() };
        unsafe { Self::ptrace(libc::PTRACE_GETFPREGS, tid, &mut fpregs)? };
        let size = std::mem::size_of::<libc::user_fpregs_struct>().min(crate::registers::FXSAVE_SIZE);
        unsafe {
            std::ptr::copy_nonoverlapping(
                &fpregs as *const libc::user_fpregs_struct as *const u8,
                state.as_bytes_mut().as_mut_ptr(),
                size,
            );
        }
        Ok(())
    }

    fn exception_state(&self, tid: libc::pid_t, state: &mut ExceptionState) -> std::result::Result<(), i32> {
        let mut info = unsafe { std::mem::zeroed::<libc::siginfo_t>() };
        unsafe { Self::ptrace(libc::PTRACE_GETSIGINFO, tid, &mut info)? };
        state.trapno = info.si_signo as u16;
        state.err = info.si_code as u32;
        state.fault_address = unsafe { info.si_addr() } as u64;
        Ok(())
    }
}
