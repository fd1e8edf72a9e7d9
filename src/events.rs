use crate::engine::EngineError;
use std::fmt;

/// Something the cursor did while stepping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StepEvent {
    /// The captured context was reported as frame 0.
    FirstFrame { pc: u64 },
    /// The engine moved to a new frame.
    Stepped { pc: u64 },
    /// The engine stopped without moving; a stack scan follows.
    AmbiguousEnd { pc: u64 },
    /// The stack scan accepted `pc`, read from just below `sp`.
    ScanMatched { pc: u64, sp: u64 },
    /// The stack scan found nothing.
    ScanExhausted { sp: u64 },
    /// The engine reached the bottom of the stack.
    StackEnd { pc: u64 },
    /// The engine failed.
    EngineError(EngineError),
}

impl fmt::Display for StepEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            StepEvent::FirstFrame { pc } => write!(f, "first frame at {:#x}", pc),
            StepEvent::Stepped { pc } => write!(f, "stepped to {:#x}", pc),
            StepEvent::AmbiguousEnd { pc } => write!(f, "engine stopped at {:#x} without moving, scanning", pc),
            StepEvent::ScanMatched { pc, sp } => write!(f, "stack scan found {:#x}, resuming at {:#x}", pc, sp),
            StepEvent::ScanExhausted { sp } => write!(f, "stack scan from {:#x} found nothing", sp),
            StepEvent::StackEnd { pc } => write!(f, "end of stack at {:#x}", pc),
            StepEvent::EngineError(err) => write!(f, "engine error: {}", err),
        }
    }
}

/// Receives [StepEvent]s from one cursor.
///
/// Observers run on the unwinding thread, possibly inside a signal handler,
/// and must be async-signal-safe if the cursor is.
pub trait StepObserver {
    fn on_event(&self, event: StepEvent);
}

impl<F: Fn(StepEvent)> StepObserver for F {
    #[inline]
    fn on_event(&self, event: StepEvent) {
        self(event)
    }
}

/// Forwards events to the `log` crate.
///
/// Loggers format and lock, so this is only for cursors driven outside
/// signal handlers, e.g. when walking a suspended thread.
#[derive(Debug, Default, Copy, Clone)]
pub struct LogObserver;

impl StepObserver for LogObserver {
    fn on_event(&self, event: StepEvent) {
        match event {
            StepEvent::EngineError(_) | StepEvent::AmbiguousEnd { .. } => log::debug!("{}", event),
            _ => log::trace!("{}", event),
        }
    }
}
