use std::fmt;

mod x64;
pub use x64::*;

/// A closed set of machine registers for one architecture.
///
/// Adding an architecture means supplying a new enumeration and its mapping
/// onto a [RegisterContext]; the cursor itself never branches on the ISA.
pub trait RegisterSet: Copy + Eq + fmt::Debug + 'static {
    /// Every register of the set, ordered by [RegisterSet::id].
    const ALL: &'static [Self];

    /// The program counter.
    const PC: Self;

    /// The stack pointer.
    const SP: Self;

    fn id(self) -> u16;

    fn from_id(id: u16) -> Option<Self>;

    /// Human-readable register name. Distinct registers never share a name.
    fn name(self) -> &'static str;
}

/// An owned snapshot of one thread's register file.
pub trait RegisterContext: Copy {
    type Register: RegisterSet;

    /// Get the value of a register as it was captured.
    fn register(&self, reg: Self::Register) -> u64;

    /// Returns a copy of this snapshot with the program counter replaced.
    fn with_pc(&self, pc: u64) -> Self;

    /// Get the value of the PC (Program Counter) register.
    #[inline]
    fn pc(&self) -> u64 {
        self.register(Self::Register::PC)
    }

    /// Get the value of the SP (Stack Pointer) register.
    #[inline]
    fn sp(&self) -> u64 {
        self.register(Self::Register::SP)
    }
}

/// Look up a register name by its raw identifier.
///
/// An identifier outside the enumeration can only come from a mismatched
/// register mapping, so this aborts the process instead of returning.
pub fn register_name_by_id<R: RegisterSet>(id: u16) -> &'static str {
    match R::from_id(id) {
        Some(reg) => reg.name(),
        None => std::process::abort(),
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
extern "C" {
    /// Store the caller's general purpose registers into `state`.
    ///
    /// The implementation of this function is linked to the assembly code in
    /// `src/registers/x64.S`.
    pub fn framewalk_capture_general_state(state: *mut GeneralState);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_register_names_are_distinct() {
        let names: HashSet<_> = Register::ALL.iter().map(|r| r.name()).collect();
        assert_eq!(names.len(), Register::ALL.len());
        let names: HashSet<_> = FloatRegister::ALL.iter().map(|r| r.name()).collect();
        assert_eq!(names.len(), FloatRegister::ALL.len());
    }

    #[test]
    fn test_register_ids_round_trip() {
        for (n, reg) in Register::ALL.iter().enumerate() {
            assert_eq!(reg.id() as usize, n);
            assert_eq!(Register::from_id(reg.id()), Some(*reg));
            assert_eq!(register_name_by_id::<Register>(reg.id()), reg.name());
        }
        assert_eq!(Register::from_id(Register::ALL.len() as u16), None);
    }

    #[test]
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn test_capture_general_state() {
        let context = Context::current();
        assert!(context.pc() > 0);
        assert!(context.sp() > 0);
        assert_ne!(context.register(Register::Cs), 0);
    }
}
