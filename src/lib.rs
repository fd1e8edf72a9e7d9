//! This crate provides a stack walker that keeps going when debug info runs
//! out. Its main purpose is to trace the stack of a thread from inside a
//! signal handler, e.g. when writing a crash report.
//!
//! A [Cursor] drives an [UnwindEngine] over a captured register [Context].
//! Whenever the engine gives up without moving, the cursor searches the stack
//! for a word that points into a loaded image and restarts the engine there.
//!
//! Simple usage:
//! ```
//! fn main() {
//!     // Do stack backtrace.
//!     let mut pcs = vec![];
//!     framewalk::trace(|frame| {
//!         pcs.push(frame.pc);
//!         true
//!     }).unwrap();
//!
//!     // Resolve addresses into symbols and display.
//!     for pc in pcs {
//!         println!("{:#x}:", pc);
//!         backtrace::resolve(pc as _, |s| {
//!             println!("    {:?}", s.name());
//!         });
//!     }
//! }
//! ```
//!
//! Walking a thread stopped with `ptrace`:
//! ```ignore
//! let images = framewalk::loaded_images();
//! let mut cursor = Cursor::from_thread(&PtraceProvider, tid, DwarfEngine::new(), images)?
//!     .with_observer(&LogObserver);
//! while cursor.step()? {
//!     println!("#{} {:#x}", cursor.frame_index(), cursor.get_register(Register::Rip)?);
//! }
//! ```
//!
//! For more examples, please refer to ../demos/.

pub mod capture;
mod cursor;
pub mod engine;
pub mod events;
pub mod images;
pub mod memory;
pub mod registers;
pub mod scan;
pub mod validate;

pub use capture::{StateKind, ThreadStateProvider};
pub use cursor::Cursor;
pub use engine::{EngineError, Step, UnwindEngine};
pub use events::{LogObserver, StepEvent, StepObserver};
pub use images::{AsyncImageList, ImageRange, ImageRegistry};
pub use memory::{LocalMemory, MemoryReader};
pub use registers::{register_name_by_id, Context, FloatRegister, Register, RegisterContext, RegisterSet};
pub use scan::ScanConfig;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use capture::PtraceProvider;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use engine::DwarfEngine;
#[cfg(target_os = "linux")]
pub use images::{loaded_images, loaded_objects};
#[cfg(target_os = "linux")]
pub use memory::ProcessMemory;

/// A result type that wraps [Error].
pub type Result<T> = std::result::Result<T, Error>;

/// Error definition.
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("operation not supported")]
    Unsupported,

    #[error("bad frame")]
    BadFrame,

    #[error("unwinding engine failure")]
    EngineFailure,

    #[error("failed to fetch {state} state: error {code}")]
    ThreadState { state: StateKind, code: i32 },

    #[error("invalid argument")]
    InvalidArgument,

    #[error("invalid ucontext")]
    InvalidUcontext,
}

/// Coarse classification of an [Error].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Unsupported,
    BadFrame,
    Internal,
    InvalidArgument,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Unsupported => ErrorKind::Unsupported,
            Error::BadFrame => ErrorKind::BadFrame,
            Error::EngineFailure | Error::ThreadState { .. } => ErrorKind::Internal,
            Error::InvalidArgument | Error::InvalidUcontext => ErrorKind::InvalidArgument,
        }
    }
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::BadFrame | EngineError::InvalidIp => Error::BadFrame,
            EngineError::BadRegister | EngineError::Invalid => Error::InvalidArgument,
            EngineError::Unspecified | EngineError::NoMemory | EngineError::NoInfo | EngineError::Unknown(_) => {
                Error::EngineFailure
            }
        }
    }
}

/// One frame as seen by [trace] and [trace_from_ucontext].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Frame {
    pub index: usize,
    pub pc: u64,
}

/// Inspects the current call-stack, passing all active frames into the closure
/// provided to calculate a stack trace.
///
/// The closure's return value is an indication of whether the backtrace should
/// continue. A return value of `false` will terminate the backtrace and return
/// immediately.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[inline(never)]
pub fn trace<F>(f: F) -> Result<bool>
where
    F: FnMut(&Frame) -> bool,
{
    let context = Context::current();
    let mut cursor = Cursor::new(context, DwarfEngine::new(), loaded_images())?;
    // Skip the current function (`framewalk::trace`).
    cursor.step()?;
    walk(&mut cursor, f)
}

/// Inspects the call-stack from `ucontext`, passing all active frames into the closure
/// provided to calculate a stack trace.
///
/// The first frame is the interrupted instruction itself.
///
/// The closure's return value is an indication of whether the backtrace should
/// continue. A return value of `false` will terminate the backtrace and return
/// immediately.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub fn trace_from_ucontext<F>(ucontext: *mut libc::c_void, f: F) -> Result<bool>
where
    F: FnMut(&Frame) -> bool,
{
    let context = Context::from_ucontext(ucontext).ok_or(Error::InvalidUcontext)?;
    let mut cursor = Cursor::new(context, DwarfEngine::new(), loaded_images())?;
    walk(&mut cursor, f)
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn walk<I, F>(cursor: &mut Cursor<'_, DwarfEngine, I>, mut f: F) -> Result<bool>
where
    I: ImageRegistry + ?Sized,
    F: FnMut(&Frame) -> bool,
{
    let mut index = 0;
    while cursor.step()? {
        let frame = Frame {
            index,
            pc: cursor.get_register(Register::Rip)?,
        };
        if !f(&frame) {
            return Ok(false);
        }
        index += 1;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        assert_eq!(Error::Unsupported.kind(), ErrorKind::Unsupported);
        assert_eq!(Error::BadFrame.kind(), ErrorKind::BadFrame);
        assert_eq!(Error::EngineFailure.kind(), ErrorKind::Internal);
        let err = Error::ThreadState {
            state: StateKind::Float,
            code: 3,
        };
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.to_string(), "failed to fetch floating point state: error 3");
        assert_eq!(Error::InvalidArgument.kind(), ErrorKind::InvalidArgument);
        assert_eq!(Error::InvalidUcontext.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_engine_error_translation() {
        assert_eq!(Error::from(EngineError::from_code(-6546)), Error::BadFrame);
        assert_eq!(Error::from(EngineError::from_code(-6545)), Error::BadFrame);
        assert_eq!(Error::from(EngineError::from_code(-6542)), Error::InvalidArgument);
        assert_eq!(Error::from(EngineError::from_code(-6547)), Error::InvalidArgument);
        assert_eq!(Error::from(EngineError::from_code(-6540)), Error::EngineFailure);
        assert_eq!(Error::from(EngineError::from_code(-6541)), Error::EngineFailure);
        assert_eq!(Error::from(EngineError::from_code(-6549)), Error::EngineFailure);
        assert_eq!(Error::from(EngineError::from_code(-1)), Error::EngineFailure);
    }

    #[test]
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn test_trace_from_null_ucontext() {
        let r = trace_from_ucontext(std::ptr::null_mut(), |_| true);
        assert_eq!(r, Err(Error::InvalidUcontext));
    }

    #[test]
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn test_trace_stops_when_asked() {
        let mut frames = vec![];
        let r = trace(|frame| {
            frames.push(*frame);
            frames.len() < 2
        });
        assert_eq!(r, Ok(false));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].index, 0);
        assert_eq!(frames[1].index, 1);
        assert_ne!(frames[0].pc, 0);
    }
}
