use super::{RegisterContext, RegisterSet};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::ops::{Index, IndexMut};

/// Number of slots in [GeneralState].
pub const GENERAL_REGISTER_COUNT: usize = 21;

/// Size of the FXSAVE area held by [FloatState].
pub const FXSAVE_SIZE: usize = 512;

/// x86_64 registers that can be queried from a cursor.
///
/// Besides the general purpose registers this includes the flags and segment
/// registers, which only the captured context knows about.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Register {
    Rax = 0,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,
    Cs,
    Fs,
    Gs,
}

impl Register {
    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            Register::Rax => "rax",
            Register::Rbx => "rbx",
            Register::Rcx => "rcx",
            Register::Rdx => "rdx",
            Register::Rdi => "rdi",
            Register::Rsi => "rsi",
            Register::Rbp => "rbp",
            Register::Rsp => "rsp",
            Register::R8 => "r8",
            Register::R9 => "r9",
            Register::R10 => "r10",
            Register::R11 => "r11",
            Register::R12 => "r12",
            Register::R13 => "r13",
            Register::R14 => "r14",
            Register::R15 => "r15",
            Register::Rip => "rip",
            Register::Rflags => "rflags",
            Register::Cs => "cs",
            Register::Fs => "fs",
            Register::Gs => "gs",
        }
    }
}

impl RegisterSet for Register {
    const ALL: &'static [Self] = &[
        Register::Rax,
        Register::Rbx,
        Register::Rcx,
        Register::Rdx,
        Register::Rdi,
        Register::Rsi,
        Register::Rbp,
        Register::Rsp,
        Register::R8,
        Register::R9,
        Register::R10,
        Register::R11,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
        Register::Rip,
        Register::Rflags,
        Register::Cs,
        Register::Fs,
        Register::Gs,
    ];
    const PC: Self = Register::Rip;
    const SP: Self = Register::Rsp;

    #[inline]
    fn id(self) -> u16 {
        self as u16
    }

    #[inline]
    fn from_id(id: u16) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    #[inline]
    fn name(self) -> &'static str {
        Register::name(self)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// SSE registers. Part of the query surface, but never recoverable from a
/// cursor on this architecture.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FloatRegister {
    Xmm0 = 0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
    Xmm8,
    Xmm9,
    Xmm10,
    Xmm11,
    Xmm12,
    Xmm13,
    Xmm14,
    Xmm15,
}

impl FloatRegister {
    pub const ALL: [FloatRegister; 16] = [
        FloatRegister::Xmm0,
        FloatRegister::Xmm1,
        FloatRegister::Xmm2,
        FloatRegister::Xmm3,
        FloatRegister::Xmm4,
        FloatRegister::Xmm5,
        FloatRegister::Xmm6,
        FloatRegister::Xmm7,
        FloatRegister::Xmm8,
        FloatRegister::Xmm9,
        FloatRegister::Xmm10,
        FloatRegister::Xmm11,
        FloatRegister::Xmm12,
        FloatRegister::Xmm13,
        FloatRegister::Xmm14,
        FloatRegister::Xmm15,
    ];

    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            FloatRegister::Xmm0 => "xmm0",
            FloatRegister::Xmm1 => "xmm1",
            FloatRegister::Xmm2 => "xmm2",
            FloatRegister::Xmm3 => "xmm3",
            FloatRegister::Xmm4 => "xmm4",
            FloatRegister::Xmm5 => "xmm5",
            FloatRegister::Xmm6 => "xmm6",
            FloatRegister::Xmm7 => "xmm7",
            FloatRegister::Xmm8 => "xmm8",
            FloatRegister::Xmm9 => "xmm9",
            FloatRegister::Xmm10 => "xmm10",
            FloatRegister::Xmm11 => "xmm11",
            FloatRegister::Xmm12 => "xmm12",
            FloatRegister::Xmm13 => "xmm13",
            FloatRegister::Xmm14 => "xmm14",
            FloatRegister::Xmm15 => "xmm15",
        }
    }
}

/// General purpose, flags and segment registers, one 64-bit slot each, in
/// [Register] order.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct GeneralState {
    v: [u64; GENERAL_REGISTER_COUNT],
}

impl Index<Register> for GeneralState {
    type Output = u64;

    fn index(&self, index: Register) -> &u64 {
        &self.v[index as usize]
    }
}

impl IndexMut<Register> for GeneralState {
    fn index_mut(&mut self, index: Register) -> &mut u64 {
        &mut self.v[index as usize]
    }
}

/// The legacy FXSAVE area: x87 control words, MXCSR and the XMM registers.
#[repr(C, align(16))]
#[derive(Copy, Clone)]
pub struct FloatState {
    fxsave: [u8; FXSAVE_SIZE],
}

impl Default for FloatState {
    fn default() -> Self {
        Self { fxsave: [0; FXSAVE_SIZE] }
    }
}

impl FloatState {
    #[inline]
    pub fn as_bytes(&self) -> &[u8; FXSAVE_SIZE] {
        &self.fxsave
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8; FXSAVE_SIZE] {
        &mut self.fxsave
    }

    /// x87 control word.
    #[inline]
    pub fn fcw(&self) -> u16 {
        LittleEndian::read_u16(&self.fxsave[0..2])
    }

    /// x87 status word.
    #[inline]
    pub fn fsw(&self) -> u16 {
        LittleEndian::read_u16(&self.fxsave[2..4])
    }

    #[inline]
    pub fn mxcsr(&self) -> u32 {
        LittleEndian::read_u32(&self.fxsave[24..28])
    }

    /// Raw contents of an XMM register.
    #[inline]
    pub fn xmm(&self, reg: FloatRegister) -> u128 {
        let offset = 160 + 16 * reg as usize;
        LittleEndian::read_u128(&self.fxsave[offset..offset + 16])
    }
}

impl fmt::Debug for FloatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FloatState")
            .field("fcw", &self.fcw())
            .field("fsw", &self.fsw())
            .field("mxcsr", &self.mxcsr())
            .finish()
    }
}

/// Exception information of the last trap taken by the thread.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ExceptionState {
    pub trapno: u16,
    pub cpu: u16,
    pub err: u32,
    pub fault_address: u64,
}

/// `Context` holds the register snapshot of one thread.
///
/// It is usually built from the `ucontext` the kernel passes to a signal
/// handler:
/// ```ignore
/// extern "C" fn signal_handler(_: libc::c_int, _: *mut libc::siginfo_t, ucontext: *mut libc::c_void) {
///     let context = Context::from_ucontext(ucontext).unwrap();
///     assert_ne!(context.pc(), 0);
/// }
/// ```
///
/// A suspended thread can be captured with [Context::from_thread], and the
/// calling thread with [Context::current].
///
/// [Context::from_thread]: crate::Context::from_thread
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct Context {
    pub general: GeneralState,
    pub float: FloatState,
    pub exception: ExceptionState,
    /// Blocked signals 1-64 at capture time.
    pub sigmask: u64,
}

impl RegisterContext for Context {
    type Register = Register;

    #[inline]
    fn register(&self, reg: Register) -> u64 {
        self.general[reg]
    }

    #[inline]
    fn with_pc(&self, pc: u64) -> Self {
        let mut context = *self;
        context.general[Register::Rip] = pc;
        context
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl Context {
    /// Initialize `Context` with value from `ucontext`.
    pub fn from_ucontext(ucontext: *mut libc::c_void) -> Option<Self> {
        let ucontext = ucontext as *const libc::ucontext_t;
        if ucontext.is_null() {
            return None;
        }
        let mut context = Self::default();
        unsafe {
            let mcontext = &(*ucontext).uc_mcontext;
            let gregs = &mcontext.gregs;
            let general = &mut context.general;
            general[Register::Rax] = gregs[libc::REG_RAX as usize] as _;
            general[Register::Rbx] = gregs[libc::REG_RBX as usize] as _;
            general[Register::Rcx] = gregs[libc::REG_RCX as usize] as _;
            general[Register::Rdx] = gregs[libc::REG_RDX as usize] as _;
            general[Register::Rdi] = gregs[libc::REG_RDI as usize] as _;
            general[Register::Rsi] = gregs[libc::REG_RSI as usize] as _;
            general[Register::Rbp] = gregs[libc::REG_RBP as usize] as _;
            general[Register::Rsp] = gregs[libc::REG_RSP as usize] as _;
            general[Register::R8] = gregs[libc::REG_R8 as usize] as _;
            general[Register::R9] = gregs[libc::REG_R9 as usize] as _;
            general[Register::R10] = gregs[libc::REG_R10 as usize] as _;
            general[Register::R11] = gregs[libc::REG_R11 as usize] as _;
            general[Register::R12] = gregs[libc::REG_R12 as usize] as _;
            general[Register::R13] = gregs[libc::REG_R13 as usize] as _;
            general[Register::R14] = gregs[libc::REG_R14 as usize] as _;
            general[Register::R15] = gregs[libc::REG_R15 as usize] as _;
            general[Register::Rip] = gregs[libc::REG_RIP as usize] as _;
            general[Register::Rflags] = gregs[libc::REG_EFL as usize] as _;
            // cs, gs and fs share one slot: cs in bits 0-15, gs in 16-31, fs in 32-47.
            let csgsfs = gregs[libc::REG_CSGSFS as usize] as u64;
            general[Register::Cs] = csgsfs & 0xffff;
            general[Register::Gs] = (csgsfs >> 16) & 0xffff;
            general[Register::Fs] = (csgsfs >> 32) & 0xffff;

            context.exception.trapno = gregs[libc::REG_TRAPNO as usize] as _;
            context.exception.err = gregs[libc::REG_ERR as usize] as _;
            context.exception.fault_address = gregs[libc::REG_CR2 as usize] as _;

            if !mcontext.fpregs.is_null() {
                std::ptr::copy_nonoverlapping(
                    mcontext.fpregs as *const u8,
                    context.float.fxsave.as_mut_ptr(),
                    FXSAVE_SIZE,
                );
            }
            context.sigmask = std::ptr::read_unaligned(&(*ucontext).uc_sigmask as *const libc::sigset_t as *const u64);
        }
        Some(context)
    }

    /// Capture the general purpose registers of the calling function.
    ///
    /// The snapshot refers to the caller's own stack frame, so it must be
    /// walked before the caller returns.
    #[inline(always)]
    pub fn current() -> Self {
        let mut context = Self::default();
        unsafe {
            super::framewalk_capture_general_state(&mut context.general as _);
        }
        context
    }
}
