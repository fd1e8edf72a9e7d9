use crate::registers::RegisterContext;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod dwarf;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use dwarf::DwarfEngine;

/// Registers every unwinding engine can report, independent of the ISA.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GenericRegister {
    Ip,
    Sp,
}

/// Outcome of a successful [UnwindEngine::step].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Step {
    /// The engine moved to the caller's frame.
    Frame,
    /// The engine will not go further. This may be the real bottom of the
    /// stack, or simply a frame it has no unwind info for.
    End,
}

impl Step {
    /// Interpret a libunwind-style step result: positive for a new frame,
    /// zero at the end, negative error codes otherwise.
    #[inline]
    pub fn from_code(code: i32) -> Result<Step, EngineError> {
        match code {
            c if c > 0 => Ok(Step::Frame),
            0 => Ok(Step::End),
            c => Err(EngineError::from_code(c)),
        }
    }
}

/// Errors reported by an unwinding engine. These never leave the cursor;
/// they are translated into [crate::Error] first.
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("unspecified engine error")]
    Unspecified,

    #[error("out of memory")]
    NoMemory,

    #[error("bad register number")]
    BadRegister,

    #[error("invalid instruction pointer")]
    InvalidIp,

    #[error("bad frame")]
    BadFrame,

    #[error("unsupported operation or bad value")]
    Invalid,

    #[error("no unwind info available")]
    NoInfo,

    #[error("unknown engine error code: {0}")]
    Unknown(i32),
}

impl EngineError {
    /// Map a libunwind error code (`UNW_E*`) onto an [EngineError].
    pub fn from_code(code: i32) -> Self {
        match code {
            -6540 => EngineError::Unspecified,
            -6541 => EngineError::NoMemory,
            -6542 => EngineError::BadRegister,
            -6545 => EngineError::InvalidIp,
            -6546 => EngineError::BadFrame,
            -6547 => EngineError::Invalid,
            -6549 => EngineError::NoInfo,
            c => EngineError::Unknown(c),
        }
    }
}

/// A reusable, debug-info-based stack stepper.
///
/// The cursor owns exactly one engine and drives it through `init`, `step`
/// and `register`. `init` may be called again at any time to restart the
/// engine from a different context.
///
/// Implementations are called from signal handlers and must neither
/// allocate nor lock.
pub trait UnwindEngine {
    type Context: RegisterContext;

    /// Seed the engine with a register context; the context's own frame
    /// becomes the current frame.
    fn init(&mut self, context: &Self::Context) -> Result<(), EngineError>;

    /// Like [UnwindEngine::init], but the context's program counter is a
    /// return address found on the stack rather than an interrupted
    /// instruction.
    #[inline]
    fn reseed(&mut self, context: &Self::Context) -> Result<(), EngineError> {
        self.init(context)
    }

    /// Move to the caller of the current frame.
    ///
    /// On [Step::End] the current frame is left as the engine sees it; a
    /// program counter that did not change tells the caller that the engine
    /// gave up rather than reaching the real end.
    fn step(&mut self) -> Result<Step, EngineError>;

    /// Read a register of the current frame.
    fn register(&self, reg: GenericRegister) -> Result<u64, EngineError>;
}
