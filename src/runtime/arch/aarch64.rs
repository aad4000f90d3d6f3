//! aarch64 (AAPCS64) implementation of the context primitive.
//!
//! The snapshot covers the callee-saved general purpose registers, the
//! callee-saved low halves of the SIMD registers (d8-d15), the frame and
//! link registers, and dedicated stack pointer and program counter slots.
//! x9 is the designated scratch register carrying the jump target across a
//! restore; it is a caller-saved temporary, so nothing resumed by these
//! primitives can depend on it.

use std::arch::naked_asm;

/// Closed enumeration of the saved registers.
///
/// The discriminant is the slot index inside [`RegisterFile`]; the byte
/// offsets baked into the assembly below are derived from it.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reg {
    /// First argument register, seeded for a fresh entry.
    X0 = 0,
    X19,
    X20,
    X21,
    X22,
    X23,
    X24,
    X25,
    X26,
    X27,
    X28,
    Fp,
    Lr,
    Sp,
    Pc,
    D8,
    D9,
    D10,
    D11,
    D12,
    D13,
    D14,
    D15,
}

pub(crate) const REGISTER_COUNT: usize = 23;

impl Reg {
    /// Byte offset of this register's slot from the start of the file.
    const fn offset(self) -> usize {
        self as usize * 8
    }
}

/// A full register snapshot: a passive, fixed-layout value type.
#[repr(C)]
#[derive(Debug, Clone)]
pub(crate) struct RegisterFile {
    regs: [usize; REGISTER_COUNT],
}

impl RegisterFile {
    pub(crate) const fn new() -> Self {
        RegisterFile {
            regs: [0; REGISTER_COUNT],
        }
    }

    pub(crate) fn get(&self, reg: Reg) -> usize {
        self.regs[reg as usize]
    }

    pub(crate) fn set(&mut self, reg: Reg, value: usize) {
        self.regs[reg as usize] = value;
    }

    pub(crate) fn stack_pointer(&self) -> usize {
        self.get(Reg::Sp)
    }

    pub(crate) fn instruction_pointer(&self) -> usize {
        self.get(Reg::Pc)
    }
}

/// Records the full current register snapshot into `into`.
///
/// Pure side-effecting write; control flow is unchanged. Installing the
/// captured snapshot later continues immediately after this call.
///
/// # Safety
/// `into` must be valid for writes of a whole [`RegisterFile`].
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn capture(_into: *mut RegisterFile) {
    naked_asm!(
        "str x0, [x0, {x0}]",
        "str x19, [x0, {x19}]",
        "str x20, [x0, {x20}]",
        "str x21, [x0, {x21}]",
        "str x22, [x0, {x22}]",
        "str x23, [x0, {x23}]",
        "str x24, [x0, {x24}]",
        "str x25, [x0, {x25}]",
        "str x26, [x0, {x26}]",
        "str x27, [x0, {x27}]",
        "str x28, [x0, {x28}]",
        "str fp, [x0, {fp}]",
        "mov x9, sp",
        "str x9, [x0, {sp}]",
        // the return address doubles as the resumption point
        "str lr, [x0, {lr}]",
        "str lr, [x0, {pc}]",
        "str d8, [x0, {d8}]",
        "str d9, [x0, {d9}]",
        "str d10, [x0, {d10}]",
        "str d11, [x0, {d11}]",
        "str d12, [x0, {d12}]",
        "str d13, [x0, {d13}]",
        "str d14, [x0, {d14}]",
        "str d15, [x0, {d15}]",
        "ret",
        x0 = const Reg::X0.offset(),
        x19 = const Reg::X19.offset(),
        x20 = const Reg::X20.offset(),
        x21 = const Reg::X21.offset(),
        x22 = const Reg::X22.offset(),
        x23 = const Reg::X23.offset(),
        x24 = const Reg::X24.offset(),
        x25 = const Reg::X25.offset(),
        x26 = const Reg::X26.offset(),
        x27 = const Reg::X27.offset(),
        x28 = const Reg::X28.offset(),
        fp = const Reg::Fp.offset(),
        lr = const Reg::Lr.offset(),
        sp = const Reg::Sp.offset(),
        pc = const Reg::Pc.offset(),
        d8 = const Reg::D8.offset(),
        d9 = const Reg::D9.offset(),
        d10 = const Reg::D10.offset(),
        d11 = const Reg::D11.offset(),
        d12 = const Reg::D12.offset(),
        d13 = const Reg::D13.offset(),
        d14 = const Reg::D14.offset(),
        d15 = const Reg::D15.offset(),
    )
}

/// Overwrites the machine registers from `from` and jumps to its stored
/// program counter. Never returns to the immediate caller.
///
/// # Safety
/// `from` must hold a snapshot produced by [`capture`], [`swap`] or
/// [`initialize`] whose stack is still alive, and that snapshot must not be
/// the one currently executing.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn install(_from: *const RegisterFile) -> ! {
    naked_asm!(
        "ldr x19, [x0, {x19}]",
        "ldr x20, [x0, {x20}]",
        "ldr x21, [x0, {x21}]",
        "ldr x22, [x0, {x22}]",
        "ldr x23, [x0, {x23}]",
        "ldr x24, [x0, {x24}]",
        "ldr x25, [x0, {x25}]",
        "ldr x26, [x0, {x26}]",
        "ldr x27, [x0, {x27}]",
        "ldr x28, [x0, {x28}]",
        "ldr fp, [x0, {fp}]",
        "ldr lr, [x0, {lr}]",
        "ldr x9, [x0, {sp}]",
        "mov sp, x9",
        "ldr d8, [x0, {d8}]",
        "ldr d9, [x0, {d9}]",
        "ldr d10, [x0, {d10}]",
        "ldr d11, [x0, {d11}]",
        "ldr d12, [x0, {d12}]",
        "ldr d13, [x0, {d13}]",
        "ldr d14, [x0, {d14}]",
        "ldr d15, [x0, {d15}]",
        // x9 is the scratch carrying the jump target; x0 is restored last
        // because it is still the base pointer
        "ldr x9, [x0, {pc}]",
        "ldr x0, [x0, {x0}]",
        "br x9",
        x0 = const Reg::X0.offset(),
        x19 = const Reg::X19.offset(),
        x20 = const Reg::X20.offset(),
        x21 = const Reg::X21.offset(),
        x22 = const Reg::X22.offset(),
        x23 = const Reg::X23.offset(),
        x24 = const Reg::X24.offset(),
        x25 = const Reg::X25.offset(),
        x26 = const Reg::X26.offset(),
        x27 = const Reg::X27.offset(),
        x28 = const Reg::X28.offset(),
        fp = const Reg::Fp.offset(),
        lr = const Reg::Lr.offset(),
        sp = const Reg::Sp.offset(),
        pc = const Reg::Pc.offset(),
        d8 = const Reg::D8.offset(),
        d9 = const Reg::D9.offset(),
        d10 = const Reg::D10.offset(),
        d11 = const Reg::D11.offset(),
        d12 = const Reg::D12.offset(),
        d13 = const Reg::D13.offset(),
        d14 = const Reg::D14.offset(),
        d15 = const Reg::D15.offset(),
    )
}

/// Captures the caller's state into `from`, then installs `to`.
///
/// When a later swap targets `from` again, execution resumes immediately
/// after this call, as if it were an ordinary return. The resumption address
/// is staged before any of `to`'s values land.
///
/// # Safety
/// Same as [`install`] for `to`; `from` must be valid for writes and must
/// not alias `to`.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn swap(_from: *mut RegisterFile, _to: *const RegisterFile) {
    naked_asm!(
        // capture the caller into x0
        "str x0, [x0, {x0}]",
        "str x19, [x0, {x19}]",
        "str x20, [x0, {x20}]",
        "str x21, [x0, {x21}]",
        "str x22, [x0, {x22}]",
        "str x23, [x0, {x23}]",
        "str x24, [x0, {x24}]",
        "str x25, [x0, {x25}]",
        "str x26, [x0, {x26}]",
        "str x27, [x0, {x27}]",
        "str x28, [x0, {x28}]",
        "str fp, [x0, {fp}]",
        "mov x9, sp",
        "str x9, [x0, {sp}]",
        "str lr, [x0, {lr}]",
        "str lr, [x0, {pc}]",
        "str d8, [x0, {d8}]",
        "str d9, [x0, {d9}]",
        "str d10, [x0, {d10}]",
        "str d11, [x0, {d11}]",
        "str d12, [x0, {d12}]",
        "str d13, [x0, {d13}]",
        "str d14, [x0, {d14}]",
        "str d15, [x0, {d15}]",
        // install x1
        "ldr x19, [x1, {x19}]",
        "ldr x20, [x1, {x20}]",
        "ldr x21, [x1, {x21}]",
        "ldr x22, [x1, {x22}]",
        "ldr x23, [x1, {x23}]",
        "ldr x24, [x1, {x24}]",
        "ldr x25, [x1, {x25}]",
        "ldr x26, [x1, {x26}]",
        "ldr x27, [x1, {x27}]",
        "ldr x28, [x1, {x28}]",
        "ldr fp, [x1, {fp}]",
        "ldr lr, [x1, {lr}]",
        "ldr x9, [x1, {sp}]",
        "mov sp, x9",
        "ldr d8, [x1, {d8}]",
        "ldr d9, [x1, {d9}]",
        "ldr d10, [x1, {d10}]",
        "ldr d11, [x1, {d11}]",
        "ldr d12, [x1, {d12}]",
        "ldr d13, [x1, {d13}]",
        "ldr d14, [x1, {d14}]",
        "ldr d15, [x1, {d15}]",
        "ldr x0, [x1, {x0}]",
        // x9 is the scratch carrying the jump target
        "ldr x9, [x1, {pc}]",
        "br x9",
        x0 = const Reg::X0.offset(),
        x19 = const Reg::X19.offset(),
        x20 = const Reg::X20.offset(),
        x21 = const Reg::X21.offset(),
        x22 = const Reg::X22.offset(),
        x23 = const Reg::X23.offset(),
        x24 = const Reg::X24.offset(),
        x25 = const Reg::X25.offset(),
        x26 = const Reg::X26.offset(),
        x27 = const Reg::X27.offset(),
        x28 = const Reg::X28.offset(),
        fp = const Reg::Fp.offset(),
        lr = const Reg::Lr.offset(),
        sp = const Reg::Sp.offset(),
        pc = const Reg::Pc.offset(),
        d8 = const Reg::D8.offset(),
        d9 = const Reg::D9.offset(),
        d10 = const Reg::D10.offset(),
        d11 = const Reg::D11.offset(),
        d12 = const Reg::D12.offset(),
        d13 = const Reg::D13.offset(),
        d14 = const Reg::D14.offset(),
        d15 = const Reg::D15.offset(),
    )
}

/// Prepares a fresh context that runs `entry(arg)` once installed.
///
/// The stack pointer is the top of the stack aligned down to 16 bytes, as
/// AAPCS64 requires at all times. The synthetic return address lives in the
/// link register rather than on the stack, so entry falling through lands in
/// the trap. The frame pointer is zero by convention, marking the root of
/// the new stack.
///
/// # Safety
/// `stack_top` must be the upper end of a live stack region, and `entry`
/// must be the address of an `extern "C" fn(usize)`.
pub(crate) unsafe fn initialize(
    file: &mut RegisterFile,
    stack_top: *mut u8,
    entry: usize,
    arg: usize,
) {
    let sp = (stack_top as usize) & !15;

    file.set(Reg::Pc, entry);
    file.set(Reg::Sp, sp);
    file.set(Reg::Lr, fallthrough_trap as usize);
    file.set(Reg::Fp, 0);
    file.set(Reg::X0, arg);
}

/// Landing pad for an entry function that returns instead of exiting.
///
/// The lifecycle trampoline always terminates the coroutine, so this runs
/// only if a return path was corrupted. The stack pointer is already
/// 16-byte aligned when a `ret` lands here; nothing to fix up.
#[unsafe(naked)]
extern "C" fn fallthrough_trap() -> ! {
    naked_asm!("b {handler}", handler = sym crate::runtime::entry_fallthrough)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_stable() {
        assert_eq!(std::mem::size_of::<RegisterFile>(), REGISTER_COUNT * 8);
        assert_eq!(std::mem::align_of::<RegisterFile>(), 8);
        assert_eq!(Reg::Sp.offset(), 104);
        assert_eq!(Reg::Pc.offset(), 112);
        assert_eq!(Reg::D15.offset(), 176);
    }

    #[test]
    fn get_and_set_are_slot_accurate() {
        let mut file = RegisterFile::new();

        file.set(Reg::X19, 0xdead);
        file.set(Reg::D8, 0xbeef);

        assert_eq!(file.get(Reg::X19), 0xdead);
        assert_eq!(file.get(Reg::D8), 0xbeef);
        assert_eq!(file.get(Reg::X28), 0);
    }

    extern "C" fn nop_entry(_arg: usize) {}

    #[test]
    fn initialize_builds_an_aligned_frame() {
        let mut memory = vec![0u8; 256];
        let top = unsafe { memory.as_mut_ptr().add(memory.len()) };
        let mut file = RegisterFile::new();

        unsafe { initialize(&mut file, top, nop_entry as usize, 42) };

        assert_eq!(file.stack_pointer() % 16, 0);
        assert_eq!(file.instruction_pointer(), nop_entry as usize);
        assert_eq!(file.get(Reg::X0), 42);
        assert_eq!(file.get(Reg::Fp), 0);
        assert_eq!(file.get(Reg::Lr), fallthrough_trap as usize);
    }
}
