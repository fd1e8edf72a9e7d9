use super::{EngineError, GenericRegister, Step, UnwindEngine};
use crate::images::{loaded_objects, MAX_OBJECTS_LEN};
use crate::registers::{Context, Register, RegisterContext};
use gimli::{
    BaseAddresses, CfaRule, EhFrame, EhFrameHdr, EndianSlice, NativeEndian, ParsedEhFrameHdr, Pointer, RegisterRule,
    UnwindContext, UnwindContextStorage, UnwindSection, UnwindTableRow,
};
use lazy_static::lazy_static;
use smallvec::SmallVec;
use std::slice;

type Slice = EndianSlice<'static, NativeEndian>;

// rax, rdx, rcx, rbx, rsi, rdi, rbp, rsp, r8~r15, return address.
const DWARF_REGISTER_COUNT: usize = 17;
const DWARF_REGISTERS: [Register; DWARF_REGISTER_COUNT] = [
    Register::Rax,
    Register::Rdx,
    Register::Rcx,
    Register::Rbx,
    Register::Rsi,
    Register::Rdi,
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
];
const SP: usize = 7;
const RA: usize = 16;

lazy_static! {
    static ref SECTIONS: SmallVec<[UnwindSections; MAX_OBJECTS_LEN]> = find_sections();
}

/// Keeps gimli's unwind rule tables on the stack, so that stepping never
/// allocates.
struct StoreOnStack;

impl<T: gimli::ReaderOffset> UnwindContextStorage<T> for StoreOnStack {
    type Rules = [(gimli::Register, RegisterRule<T>); 32];
    type Stack = [UnwindTableRow<T, Self>; 2];
}

type Row = UnwindTableRow<usize, StoreOnStack>;

/// `DwarfEngine` steps through frames using the `.eh_frame` unwind tables of
/// the loaded objects.
///
/// Without the `trace-shared-libs` feature only the main executable's tables
/// are used; frames in shared libraries then end the walk the same way a
/// frame without unwind info does.
///
/// The tables are located on first use, which is not async-signal-safe.
/// Create one engine before installing a signal handler that unwinds.
pub struct DwarfEngine {
    sections: &'static [UnwindSections],
    ctx: UnwindContext<usize, StoreOnStack>,
    regs: [u64; DWARF_REGISTER_COUNT],
    // The topmost frame's pc is the interrupted instruction itself, every
    // other pc is a return address.
    first_step: bool,
}

impl Default for DwarfEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DwarfEngine {
    /// Creates a new `DwarfEngine`.
    #[inline]
    pub fn new() -> Self {
        Self {
            sections: &SECTIONS,
            ctx: UnwindContext::new_in(),
            regs: [0; DWARF_REGISTER_COUNT],
            first_step: true,
        }
    }
}

impl UnwindEngine for DwarfEngine {
    type Context = Context;

    fn init(&mut self, context: &Context) -> Result<(), EngineError> {
        for (n, reg) in DWARF_REGISTERS.iter().enumerate() {
            self.regs[n] = context.register(*reg);
        }
        self.first_step = true;
        Ok(())
    }

    fn reseed(&mut self, context: &Context) -> Result<(), EngineError> {
        self.init(context)?;
        self.first_step = false;
        Ok(())
    }

    fn step(&mut self) -> Result<Step, EngineError> {
        let Self {
            sections,
            ctx,
            regs,
            first_step,
        } = self;
        let mut pc = regs[RA];
        if pc == 0 {
            return Ok(Step::End);
        }
        if !*first_step {
            // Look up the call instruction, not the one after it.
            pc -= 1;
        }
        let row = match sections.iter().find(|s| s.contains(pc)) {
            Some(s) => match s.find_row(ctx, pc) {
                Some(row) => row,
                None => return Ok(Step::End),
            },
            None => return Ok(Step::End),
        };
        match unwind_row(regs, row) {
            Some(new_regs) => {
                *regs = new_regs;
                *first_step = false;
                if regs[RA] == 0 {
                    Ok(Step::End)
                } else {
                    Ok(Step::Frame)
                }
            }
            None => Ok(Step::End),
        }
    }

    #[inline]
    fn register(&self, reg: GenericRegister) -> Result<u64, EngineError> {
        match reg {
            GenericRegister::Ip => Ok(self.regs[RA]),
            GenericRegister::Sp => Ok(self.regs[SP]),
        }
    }
}

/// Applies one unwind table row, producing the caller's registers.
///
/// `None` means the row cannot be applied (expressions, untracked
/// registers, unreadable saved registers, or no progress) and the current
/// frame stays as it is.
fn unwind_row(regs: &[u64; DWARF_REGISTER_COUNT], row: &Row) -> Option<[u64; DWARF_REGISTER_COUNT]> {
    let cfa = match *row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => regs.get(register.0 as usize)?.wrapping_add(offset as u64),
        CfaRule::Expression(_) => return None,
    };
    let mut new_regs = *regs;

    // Typically, the CFA is the stack pointer at the call site in the
    // previous frame. A CFI directive below may still override it.
    new_regs[SP] = cfa;

    for &(register, ref rule) in row.registers() {
        let n = register.0 as usize;
        if n >= DWARF_REGISTER_COUNT {
            continue;
        }
        new_regs[n] = match *rule {
            // An undefined return address marks the outermost frame.
            RegisterRule::Undefined => 0,
            RegisterRule::SameValue => regs[n],
            RegisterRule::Offset(offset) => load(cfa.wrapping_add(offset as u64))?,
            RegisterRule::ValOffset(offset) => cfa.wrapping_add(offset as u64),
            RegisterRule::Register(r) => *regs.get(r.0 as usize)?,
            RegisterRule::Constant(v) => v,
            _ => return None,
        };
    }
    if new_regs[RA] == regs[RA] && new_regs[SP] == regs[SP] {
        return None;
    }
    Some(new_regs)
}

// An unreadable slot leaves the frame as it is, so the cursor falls back to
// a stack scan.
#[cfg(feature = "mem-protect")]
#[inline]
fn load(address: u64) -> Option<u64> {
    use crate::memory::{LocalMemory, MemoryReader};
    LocalMemory.read_word(address)
}

#[cfg(not(feature = "mem-protect"))]
#[inline]
fn load(address: u64) -> Option<u64> {
    Some(unsafe { *(address as *const u64) })
}

struct UnwindSections {
    text: u64,
    text_len: u64,
    eh_frame_hdr: ParsedEhFrameHdr<Slice>,
    eh_frame: EhFrame<Slice>,
    bases: BaseAddresses,
}

impl UnwindSections {
    #[inline]
    fn contains(&self, target: u64) -> bool {
        target >= self.text && target - self.text < self.text_len
    }

    fn find_row<'ctx>(&self, ctx: &'ctx mut UnwindContext<usize, StoreOnStack>, target: u64) -> Option<&'ctx Row> {
        let table = self.eh_frame_hdr.table()?;
        let fde = table
            .fde_for_address(&self.eh_frame, &self.bases, target, EhFrame::cie_from_offset)
            .ok()?;
        fde.unwind_info_for_address(&self.eh_frame, &self.bases, ctx, target).ok()
    }
}

fn find_sections() -> SmallVec<[UnwindSections; MAX_OBJECTS_LEN]> {
    let mut sections = SmallVec::new();
    for object in loaded_objects() {
        if !object.has_unwind_info() || object.is_vdso {
            continue;
        }
        #[cfg(not(feature = "trace-shared-libs"))]
        if !object.is_main {
            continue;
        }
        unsafe {
            let data = slice::from_raw_parts(object.eh_frame_hdr as *const u8, object.eh_frame_hdr_len as _);
            let bases = BaseAddresses::default()
                .set_eh_frame_hdr(object.eh_frame_hdr)
                .set_text(object.text);
            let eh_frame_hdr = match EhFrameHdr::new(data, NativeEndian).parse(&bases, 8) {
                Ok(v) => v,
                Err(err) => {
                    log::warn!("skipping .eh_frame_hdr at {:#x}: {}", object.eh_frame_hdr, err);
                    continue;
                }
            };
            let eh_frame_ptr = match eh_frame_hdr.eh_frame_ptr() {
                Pointer::Direct(v) => v,
                Pointer::Indirect(p) => *(p as *const u64),
            };
            if eh_frame_ptr >= object.max_addr {
                continue;
            }
            let bases = bases.set_eh_frame(eh_frame_ptr);
            let data = slice::from_raw_parts(eh_frame_ptr as *const u8, (object.max_addr - eh_frame_ptr) as _);
            sections.push(UnwindSections {
                text: object.text,
                text_len: object.text_len,
                eh_frame_hdr,
                eh_frame: EhFrame::new(data, NativeEndian),
                bases,
            });
        }
    }
    log::debug!("loaded unwind tables of {} objects", sections.len());
    sections
}
