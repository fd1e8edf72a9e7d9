use crate::capture::ThreadStateProvider;
use crate::engine::{EngineError, GenericRegister, Step, UnwindEngine};
use crate::events::{StepEvent, StepObserver};
use crate::images::ImageRegistry;
use crate::memory::{LocalMemory, MemoryReader};
use crate::registers::{Context, FloatRegister, RegisterContext, RegisterSet};
use crate::scan::{scan_stack, ScanConfig};
use crate::{Error, Result};

type RegisterOf<E> = <<E as UnwindEngine>::Context as RegisterContext>::Register;

/// `Cursor` walks the call stack of one thread, frame by frame.
///
/// The cursor drives an [UnwindEngine] and, whenever the engine stops without
/// moving, searches the stack for something that looks like a return address
/// and restarts the engine from there.
///
/// Stepping never allocates and never locks, so a cursor can be used from a
/// signal handler as long as its engine, image registry, memory reader and
/// observer can.
///
/// ```ignore
/// let images = framewalk::loaded_images();
/// let mut cursor = Cursor::new(Context::current(), DwarfEngine::new(), images)?;
/// while cursor.step()? {
///     println!("{:#x}", cursor.get_register(Register::Rip)?);
/// }
/// ```
pub struct Cursor<'a, E, I, M = LocalMemory>
where
    E: UnwindEngine,
    I: ImageRegistry + ?Sized,
{
    // -1 until the first step.
    frame_index: isize,
    context: E::Context,
    engine: E,
    end_of_stack: bool,
    last_unwind_pc: u64,
    last_valid_frame: u64,
    last_stack_pointer: u64,
    images: &'a I,
    memory: M,
    config: ScanConfig,
    observer: Option<&'a dyn StepObserver>,
}

impl<'a, E, I> Cursor<'a, E, I>
where
    E: UnwindEngine,
    I: ImageRegistry + ?Sized,
{
    /// Creates a cursor positioned before the frame captured in `context`.
    ///
    /// The engine is seeded right away; a seeding failure is returned as is.
    pub fn new(context: E::Context, mut engine: E, images: &'a I) -> Result<Self> {
        engine.init(&context)?;
        Ok(Self {
            frame_index: -1,
            context,
            engine,
            end_of_stack: false,
            last_unwind_pc: 0,
            last_valid_frame: context.pc(),
            last_stack_pointer: context.sp(),
            images,
            memory: LocalMemory,
            config: ScanConfig::default(),
            observer: None,
        })
    }
}

impl<'a, E, I> Cursor<'a, E, I>
where
    E: UnwindEngine<Context = Context>,
    I: ImageRegistry + ?Sized,
{
    /// Creates a cursor for a suspended thread, reading its registers
    /// through `provider`.
    pub fn from_thread<P>(provider: &P, thread: P::Thread, engine: E, images: &'a I) -> Result<Self>
    where
        P: ThreadStateProvider + ?Sized,
    {
        let context = Context::from_thread(provider, thread)?;
        Self::new(context, engine, images)
    }
}

impl<'a, E, I, M> Cursor<'a, E, I, M>
where
    E: UnwindEngine,
    I: ImageRegistry + ?Sized,
    M: MemoryReader,
{
    /// Replace the stack scan tuning.
    #[inline]
    pub fn with_config(mut self, config: ScanConfig) -> Self {
        self.config = config;
        self
    }

    /// Report every step to `observer`.
    #[inline]
    pub fn with_observer(mut self, observer: &'a dyn StepObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Read the stack through `memory` when scanning.
    pub fn with_memory<N: MemoryReader>(self, memory: N) -> Cursor<'a, E, I, N> {
        Cursor {
            frame_index: self.frame_index,
            context: self.context,
            engine: self.engine,
            end_of_stack: self.end_of_stack,
            last_unwind_pc: self.last_unwind_pc,
            last_valid_frame: self.last_valid_frame,
            last_stack_pointer: self.last_stack_pointer,
            images: self.images,
            memory,
            config: self.config,
            observer: self.observer,
        }
    }

    /// Move to the next frame.
    ///
    /// The first call reports the captured frame itself. Returns `Ok(false)`
    /// once there are no more frames, and keeps returning it afterwards. Any
    /// error also ends the walk.
    pub fn step(&mut self) -> Result<bool> {
        if self.end_of_stack {
            return Ok(false);
        }
        if self.frame_index < 0 {
            self.frame_index = 0;
            self.emit(StepEvent::FirstFrame { pc: self.context.pc() });
            return Ok(true);
        }

        self.last_unwind_pc = self.engine_pc()?;
        let step = match self.engine.step() {
            Ok(v) => v,
            Err(err) => return Err(self.fail(err)),
        };
        let pc = self.engine_pc()?;
        match step {
            Step::Frame => {
                self.last_valid_frame = pc;
                self.frame_index += 1;
                self.emit(StepEvent::Stepped { pc });
                Ok(true)
            }
            // The engine did not move at all, so it gave up rather than
            // reaching the outermost frame.
            Step::End if pc == self.last_unwind_pc => {
                self.emit(StepEvent::AmbiguousEnd { pc });
                self.resume_from_scan()
            }
            Step::End => {
                self.end_of_stack = true;
                self.emit(StepEvent::StackEnd { pc });
                Ok(false)
            }
        }
    }

    fn resume_from_scan(&mut self) -> Result<bool> {
        let sp = self.last_stack_pointer;
        let found = match scan_stack(&self.memory, self.images, &self.config, sp) {
            Some(v) => v,
            None => {
                self.end_of_stack = true;
                self.emit(StepEvent::ScanExhausted { sp });
                return Ok(false);
            }
        };
        self.last_stack_pointer = found.next_sp;
        self.last_valid_frame = found.pc;
        self.emit(StepEvent::ScanMatched {
            pc: found.pc,
            sp: found.next_sp,
        });
        let context = self.context.with_pc(found.pc);
        if let Err(err) = self.engine.reseed(&context) {
            return Err(self.fail(err));
        }
        self.frame_index += 1;
        Ok(true)
    }

    /// Get the value of a register in the current frame.
    ///
    /// Every register is known for the captured frame. Deeper frames only
    /// know their program counter; anything else is [Error::Unsupported].
    pub fn get_register(&self, reg: RegisterOf<E>) -> Result<u64> {
        if self.frame_index <= 0 {
            return Ok(self.context.register(reg));
        }
        if reg == <RegisterOf<E> as RegisterSet>::PC {
            return Ok(self.engine.register(GenericRegister::Ip)?);
        }
        Err(Error::Unsupported)
    }

    /// Floating point registers are never reconstructed.
    #[inline]
    pub fn get_float_register(&self, _reg: FloatRegister) -> Result<f64> {
        Err(Error::Unsupported)
    }

    /// Index of the current frame; `-1` before the first step.
    #[inline]
    pub fn frame_index(&self) -> isize {
        self.frame_index
    }

    /// The last program counter that came from the engine or the stack scan.
    #[inline]
    pub fn last_valid_frame(&self) -> u64 {
        self.last_valid_frame
    }

    /// Where the next stack scan starts.
    #[inline]
    pub fn last_stack_pointer(&self) -> u64 {
        self.last_stack_pointer
    }

    #[inline]
    pub fn is_end_of_stack(&self) -> bool {
        self.end_of_stack
    }

    #[inline]
    pub fn context(&self) -> &E::Context {
        &self.context
    }

    fn engine_pc(&mut self) -> Result<u64> {
        match self.engine.register(GenericRegister::Ip) {
            Ok(v) => Ok(v),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn fail(&mut self, err: EngineError) -> Error {
        self.end_of_stack = true;
        self.emit(StepEvent::EngineError(err));
        err.into()
    }

    #[inline]
    fn emit(&self, event: StepEvent) {
        if let Some(observer) = self.observer {
            observer.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::ImageRange;
    use crate::registers::Register;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    const CODE_BASE: u64 = 0x5555_0000_0000;
    const STACK_BASE: u64 = 0x7ffd_0000_0000;
    const IMAGES: [ImageRange; 1] = [ImageRange::new(CODE_BASE, 0x10000)];

    /// Replays a fixed list of step results. An empty script ends without
    /// moving.
    #[derive(Default)]
    struct FakeEngine {
        script: VecDeque<std::result::Result<(Step, u64), EngineError>>,
        pc: u64,
        steps: usize,
        seeded: Vec<u64>,
        init_error: Option<(usize, EngineError)>,
    }

    impl FakeEngine {
        fn new(script: Vec<std::result::Result<(Step, u64), EngineError>>) -> Self {
            Self {
                script: script.into(),
                ..Default::default()
            }
        }

        fn fail_init(mut self, call: usize, err: EngineError) -> Self {
            self.init_error = Some((call, err));
            self
        }
    }

    impl UnwindEngine for FakeEngine {
        type Context = Context;

        fn init(&mut self, context: &Context) -> std::result::Result<(), EngineError> {
            if let Some((call, err)) = self.init_error {
                if call == self.seeded.len() {
                    return Err(err);
                }
            }
            self.seeded.push(context.pc());
            self.pc = context.pc();
            Ok(())
        }

        fn step(&mut self) -> std::result::Result<Step, EngineError> {
            self.steps += 1;
            match self.script.pop_front() {
                Some(Ok((step, pc))) => {
                    self.pc = pc;
                    Ok(step)
                }
                Some(Err(err)) => Err(err),
                None => Ok(Step::End),
            }
        }

        fn register(&self, reg: GenericRegister) -> std::result::Result<u64, EngineError> {
            match reg {
                GenericRegister::Ip => Ok(self.pc),
                GenericRegister::Sp => Err(EngineError::BadRegister),
            }
        }
    }

    struct FakeStack {
        base: u64,
        words: Vec<u64>,
        reads: Cell<usize>,
    }

    impl FakeStack {
        fn new(words: Vec<u64>) -> Self {
            Self::at(STACK_BASE, words)
        }

        fn at(base: u64, words: Vec<u64>) -> Self {
            Self {
                base,
                words,
                reads: Cell::new(0),
            }
        }
    }

    impl MemoryReader for FakeStack {
        fn read_word(&self, address: u64) -> Option<u64> {
            self.reads.set(self.reads.get() + 1);
            let n = address.checked_sub(self.base)? / 8;
            self.words.get(n as usize).copied()
        }
    }

    fn context(pc: u64) -> Context {
        let mut context = Context::default();
        context.general[Register::Rip] = pc;
        context.general[Register::Rsp] = STACK_BASE;
        context.general[Register::Rbx] = 0xb;
        context
    }

    #[test]
    fn test_first_step_reports_captured_frame() {
        let mut cursor = Cursor::new(context(CODE_BASE + 0x10), FakeEngine::new(vec![]), &IMAGES[..]).unwrap();
        assert_eq!(cursor.frame_index(), -1);
        assert_eq!(cursor.last_valid_frame(), CODE_BASE + 0x10);
        assert_eq!(cursor.last_stack_pointer(), STACK_BASE);
        assert_eq!(cursor.get_register(Register::Rbx), Ok(0xb));

        assert_eq!(cursor.step(), Ok(true));
        assert_eq!(cursor.frame_index(), 0);
        assert_eq!(cursor.engine.steps, 0);
        assert_eq!(cursor.get_register(Register::Rip), Ok(CODE_BASE + 0x10));
        assert_eq!(cursor.get_register(Register::Rsp), Ok(STACK_BASE));
        let captured = *cursor.context();
        for reg in Register::ALL {
            assert_eq!(cursor.get_register(*reg), Ok(captured.register(*reg)), "{}", reg);
        }
    }

    #[test]
    fn test_engine_frames() {
        let engine = FakeEngine::new(vec![Ok((Step::Frame, CODE_BASE + 0x20)), Ok((Step::Frame, CODE_BASE + 0x30))]);
        let mut cursor = Cursor::new(context(CODE_BASE + 0x10), engine, &IMAGES[..]).unwrap();
        let mut pcs = vec![];
        for _ in 0..3 {
            assert_eq!(cursor.step(), Ok(true));
            pcs.push(cursor.get_register(Register::Rip).unwrap());
        }
        assert_eq!(pcs, [CODE_BASE + 0x10, CODE_BASE + 0x20, CODE_BASE + 0x30]);
        assert_eq!(cursor.frame_index(), 2);
        assert_eq!(cursor.last_valid_frame(), CODE_BASE + 0x30);
        for reg in Register::ALL {
            let expected = if *reg == Register::Rip {
                Ok(CODE_BASE + 0x30)
            } else {
                Err(Error::Unsupported)
            };
            assert_eq!(cursor.get_register(*reg), expected, "{}", reg);
        }
        for reg in FloatRegister::ALL {
            assert_eq!(cursor.get_float_register(reg), Err(Error::Unsupported));
        }
    }

    #[test]
    fn test_genuine_end_does_not_scan() {
        let stack = FakeStack::new(vec![CODE_BASE + 0x40; 4]);
        let engine = FakeEngine::new(vec![Ok((Step::End, 0))]);
        let mut cursor = Cursor::new(context(CODE_BASE + 0x10), engine, &IMAGES[..])
            .unwrap()
            .with_memory(&stack);
        assert_eq!(cursor.step(), Ok(true));
        assert_eq!(cursor.step(), Ok(false));
        assert!(cursor.is_end_of_stack());
        assert_eq!(stack.reads.get(), 0);
        assert_eq!(cursor.frame_index(), 0);

        // Terminal is sticky and never touches the engine again.
        assert_eq!(cursor.step(), Ok(false));
        assert_eq!(cursor.step(), Ok(false));
        assert_eq!(cursor.engine.steps, 1);
        assert_eq!(cursor.frame_index(), 0);
    }

    #[test]
    fn test_ambiguous_end_resumes_from_scan() {
        let mut words = vec![0x1, 0x0, STACK_BASE + 0x100];
        words.push(CODE_BASE + 0x50);
        words.push(CODE_BASE + 0x60);
        let stack = FakeStack::new(words);
        let engine = FakeEngine::new(vec![Ok((Step::End, CODE_BASE + 0x10)), Ok((Step::Frame, CODE_BASE + 0x70))]);
        let mut cursor = Cursor::new(context(CODE_BASE + 0x10), engine, &IMAGES[..])
            .unwrap()
            .with_memory(&stack);

        assert_eq!(cursor.step(), Ok(true));
        assert_eq!(cursor.step(), Ok(true));
        assert_eq!(cursor.frame_index(), 1);
        assert_eq!(stack.reads.get(), 4);
        assert_eq!(cursor.last_valid_frame(), CODE_BASE + 0x50);
        assert_eq!(cursor.last_stack_pointer(), STACK_BASE + 4 * 8);
        assert_eq!(cursor.engine.seeded, [CODE_BASE + 0x10, CODE_BASE + 0x50]);
        assert_eq!(cursor.get_register(Register::Rip), Ok(CODE_BASE + 0x50));
        // Only the pc of the captured context is replaced.
        assert_eq!(cursor.context().register(Register::Rip), CODE_BASE + 0x10);

        assert_eq!(cursor.step(), Ok(true));
        assert_eq!(cursor.frame_index(), 2);
        assert_eq!(cursor.last_valid_frame(), CODE_BASE + 0x70);
    }

    #[test]
    fn test_scan_continues_after_previous_match() {
        let stack = FakeStack::new(vec![CODE_BASE + 0x50, 0x0, CODE_BASE + 0x60]);
        let mut cursor = Cursor::new(context(CODE_BASE + 0x10), FakeEngine::new(vec![]), &IMAGES[..])
            .unwrap()
            .with_memory(&stack);
        let mut pcs = vec![];
        while cursor.step().unwrap() {
            pcs.push(cursor.last_valid_frame());
        }
        assert_eq!(pcs, [CODE_BASE + 0x10, CODE_BASE + 0x50, CODE_BASE + 0x60]);
        assert_eq!(cursor.frame_index(), 2);
        // The last scan stops at the first unreadable word.
        assert_eq!(stack.reads.get(), 4);
    }

    #[test]
    fn test_scan_exhausted() {
        let stack = FakeStack::new(vec![0x7; 64]);
        let config = ScanConfig {
            window: 16,
            ..Default::default()
        };
        let mut cursor = Cursor::new(context(CODE_BASE + 0x10), FakeEngine::new(vec![]), &IMAGES[..])
            .unwrap()
            .with_config(config)
            .with_memory(&stack);
        assert_eq!(cursor.step(), Ok(true));
        assert_eq!(cursor.step(), Ok(false));
        assert_eq!(stack.reads.get(), 16);
        assert_eq!(cursor.last_stack_pointer(), STACK_BASE);
        assert_eq!(cursor.engine.seeded.len(), 1);
        assert_eq!(cursor.step(), Ok(false));
        assert_eq!(stack.reads.get(), 16);
    }

    #[test]
    fn test_engine_errors_are_translated() {
        let cases = [
            (EngineError::BadFrame, Error::BadFrame),
            (EngineError::InvalidIp, Error::BadFrame),
            (EngineError::BadRegister, Error::InvalidArgument),
            (EngineError::Invalid, Error::InvalidArgument),
            (EngineError::NoInfo, Error::EngineFailure),
            (EngineError::NoMemory, Error::EngineFailure),
            (EngineError::Unknown(-1), Error::EngineFailure),
        ];
        for (engine_err, err) in cases {
            let engine = FakeEngine::new(vec![Ok((Step::Frame, CODE_BASE + 0x20)), Err(engine_err)]);
            let mut cursor = Cursor::new(context(CODE_BASE + 0x10), engine, &IMAGES[..]).unwrap();
            assert_eq!(cursor.step(), Ok(true));
            assert_eq!(cursor.step(), Ok(true));
            assert_eq!(cursor.step(), Err(err));
            assert_eq!(cursor.frame_index(), 1);
            assert!(cursor.is_end_of_stack());
            assert_eq!(cursor.step(), Ok(false));
        }
    }

    #[test]
    fn test_init_failure() {
        let engine = FakeEngine::default().fail_init(0, EngineError::InvalidIp);
        assert!(matches!(
            Cursor::new(context(CODE_BASE), engine, &IMAGES[..]),
            Err(Error::BadFrame)
        ));
    }

    #[test]
    fn test_reseed_failure_ends_walk() {
        let stack = FakeStack::new(vec![CODE_BASE + 0x50]);
        let engine = FakeEngine::new(vec![]).fail_init(1, EngineError::Unspecified);
        let mut cursor = Cursor::new(context(CODE_BASE + 0x10), engine, &IMAGES[..])
            .unwrap()
            .with_memory(&stack);
        assert_eq!(cursor.step(), Ok(true));
        assert_eq!(cursor.step(), Err(Error::EngineFailure));
        assert_eq!(cursor.frame_index(), 0);
        assert_eq!(cursor.step(), Ok(false));
    }

    #[test]
    fn test_observer_sees_every_step() {
        let events = RefCell::new(vec![]);
        let observer = |event: StepEvent| events.borrow_mut().push(event);
        let stack = FakeStack::new(vec![0x0, CODE_BASE + 0x50]);
        let engine = FakeEngine::new(vec![
            Ok((Step::Frame, CODE_BASE + 0x20)),
            Ok((Step::End, CODE_BASE + 0x20)),
            Ok((Step::End, 0)),
        ]);
        let mut cursor = Cursor::new(context(CODE_BASE + 0x10), engine, &IMAGES[..])
            .unwrap()
            .with_observer(&observer)
            .with_memory(&stack);
        while cursor.step().unwrap() {}
        assert_eq!(
            *events.borrow(),
            [
                StepEvent::FirstFrame { pc: CODE_BASE + 0x10 },
                StepEvent::Stepped { pc: CODE_BASE + 0x20 },
                StepEvent::AmbiguousEnd { pc: CODE_BASE + 0x20 },
                StepEvent::ScanMatched {
                    pc: CODE_BASE + 0x50,
                    sp: STACK_BASE + 16,
                },
                StepEvent::StackEnd { pc: 0 },
            ]
        );
    }

    #[inline(never)]
    #[cfg(all(target_os = "linux", target_arch = "x86_64", feature = "mem-protect"))]
    fn leaf() -> u64 {
        std::hint::black_box(7)
    }

    #[test]
    #[cfg(all(target_os = "linux", target_arch = "x86_64", feature = "mem-protect"))]
    fn test_reseeded_engine_falls_back_to_scan() {
        use crate::engine::DwarfEngine;

        // The captured stack pointer is stale for the scanned frame: the
        // engine cannot read the return address slot there.
        let sp = 0x8000_0000_0000_0000;
        let found = leaf as usize as u64 + 1;
        let images = [ImageRange::new(leaf as usize as u64, 0x10)];
        let stack = FakeStack::at(sp, vec![0x0, found]);
        let mut context = Context::default();
        context.general[Register::Rip] = 0x10;
        context.general[Register::Rsp] = sp;

        let events = RefCell::new(vec![]);
        let observer = |event: StepEvent| events.borrow_mut().push(event);
        let mut cursor = Cursor::new(context, DwarfEngine::new(), &images[..])
            .unwrap()
            .with_observer(&observer)
            .with_memory(&stack);
        assert_eq!(cursor.step(), Ok(true));
        assert_eq!(cursor.step(), Ok(true));
        assert_eq!(cursor.get_register(Register::Rip), Ok(found));
        assert_eq!(cursor.step(), Ok(false));
        assert_eq!(cursor.frame_index(), 1);
        assert_eq!(
            events.borrow()[3..],
            [
                StepEvent::AmbiguousEnd { pc: found },
                StepEvent::ScanExhausted { sp: sp + 16 },
            ]
        );
        assert_eq!(leaf(), 7);
    }
}
