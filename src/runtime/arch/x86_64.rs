//! x86_64 (System V) implementation of the context primitive.
//!
//! The register snapshot follows the System V register file: every general
//! purpose register gets a slot, plus a dedicated instruction pointer slot.
//! RSI is the designated scratch register: both [`install`] and [`swap`] use
//! it to carry the jump target across the restore, so its captured payload is
//! never reinstated. That is safe because RSI is caller-saved — no code
//! resumed by these primitives can depend on it.

use std::arch::naked_asm;

/// Closed enumeration of the saved registers.
///
/// The discriminant is the slot index inside [`RegisterFile`]; the byte
/// offsets baked into the assembly below are derived from it, so the layout
/// cannot drift from the enumeration.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reg {
    R8 = 0,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rdi,
    /// Scratch slot: captured, never reinstated.
    Rsi,
    Rbp,
    Rsp,
    Rbx,
    Rdx,
    Rcx,
    Rax,
    Rip,
}

pub(crate) const REGISTER_COUNT: usize = 17;

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
        self.get(Reg::Rsp)
    }

    pub(crate) fn instruction_pointer(&self) -> usize {
        self.get(Reg::Rip)
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
        "mov [rdi + {r8}], r8",
        "mov [rdi + {r9}], r9",
        "mov [rdi + {r10}], r10",
        "mov [rdi + {r11}], r11",
        "mov [rdi + {r12}], r12",
        "mov [rdi + {r13}], r13",
        "mov [rdi + {r14}], r14",
        "mov [rdi + {r15}], r15",
        "mov [rdi + {rdi}], rdi",
        "mov [rdi + {rsi}], rsi",
        "mov [rdi + {rbp}], rbp",
        "mov [rdi + {rbx}], rbx",
        "mov [rdi + {rdx}], rdx",
        "mov [rdi + {rcx}], rcx",
        "mov [rdi + {rax}], rax",
        // rax is saved, reuse it to record the resumption point: the return
        // address, and the stack pointer as it will be after returning
        "mov rax, [rsp]",
        "mov [rdi + {rip}], rax",
        "lea rax, [rsp + 8]",
        "mov [rdi + {rsp}], rax",
        "ret",
        r8 = const Reg::R8.offset(),
        r9 = const Reg::R9.offset(),
        r10 = const Reg::R10.offset(),
        r11 = const Reg::R11.offset(),
        r12 = const Reg::R12.offset(),
        r13 = const Reg::R13.offset(),
        r14 = const Reg::R14.offset(),
        r15 = const Reg::R15.offset(),
        rdi = const Reg::Rdi.offset(),
        rsi = const Reg::Rsi.offset(),
        rbp = const Reg::Rbp.offset(),
        rsp = const Reg::Rsp.offset(),
        rbx = const Reg::Rbx.offset(),
        rdx = const Reg::Rdx.offset(),
        rcx = const Reg::Rcx.offset(),
        rax = const Reg::Rax.offset(),
        rip = const Reg::Rip.offset(),
    )
}

/// Overwrites the machine registers from `from` and jumps to its stored
/// instruction pointer. Never returns to the immediate caller.
///
/// # Safety
/// `from` must hold a snapshot produced by [`capture`], [`swap`] or
/// [`initialize`] whose stack is still alive, and that snapshot must not be
/// the one currently executing.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn install(_from: *const RegisterFile) -> ! {
    naked_asm!(
        "mov r8, [rdi + {r8}]",
        "mov r9, [rdi + {r9}]",
        "mov r10, [rdi + {r10}]",
        "mov r11, [rdi + {r11}]",
        "mov r12, [rdi + {r12}]",
        "mov r13, [rdi + {r13}]",
        "mov r14, [rdi + {r14}]",
        "mov r15, [rdi + {r15}]",
        "mov rbp, [rdi + {rbp}]",
        "mov rsp, [rdi + {rsp}]",
        "mov rbx, [rdi + {rbx}]",
        "mov rdx, [rdi + {rdx}]",
        "mov rcx, [rdi + {rcx}]",
        "mov rax, [rdi + {rax}]",
        // rsi is the scratch slot carrying the jump target; rdi is restored
        // last because it is still the base pointer
        "mov rsi, [rdi + {rip}]",
        "mov rdi, [rdi + {rdi}]",
        "jmp rsi",
        r8 = const Reg::R8.offset(),
        r9 = const Reg::R9.offset(),
        r10 = const Reg::R10.offset(),
        r11 = const Reg::R11.offset(),
        r12 = const Reg::R12.offset(),
        r13 = const Reg::R13.offset(),
        r14 = const Reg::R14.offset(),
        r15 = const Reg::R15.offset(),
        rdi = const Reg::Rdi.offset(),
        rbp = const Reg::Rbp.offset(),
        rsp = const Reg::Rsp.offset(),
        rbx = const Reg::Rbx.offset(),
        rdx = const Reg::Rdx.offset(),
        rcx = const Reg::Rcx.offset(),
        rax = const Reg::Rax.offset(),
        rip = const Reg::Rip.offset(),
    )
}

/// Captures the caller's state into `from`, then installs `to`.
///
/// When a later swap targets `from` again, execution resumes immediately
/// after this call, as if it were an ordinary return, with all of the
/// caller's local state intact. The resumption address is staged before any
/// of `to`'s values land; after that point the original values are gone.
///
/// # Safety
/// Same as [`install`] for `to`; `from` must be valid for writes and must
/// not alias `to`.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn swap(_from: *mut RegisterFile, _to: *const RegisterFile) {
    naked_asm!(
        // capture the caller into rdi
        "mov [rdi + {r8}], r8",
        "mov [rdi + {r9}], r9",
        "mov [rdi + {r10}], r10",
        "mov [rdi + {r11}], r11",
        "mov [rdi + {r12}], r12",
        "mov [rdi + {r13}], r13",
        "mov [rdi + {r14}], r14",
        "mov [rdi + {r15}], r15",
        "mov [rdi + {rdi}], rdi",
        "mov [rdi + {rsi}], rsi",
        "mov [rdi + {rbp}], rbp",
        "mov [rdi + {rbx}], rbx",
        "mov [rdi + {rdx}], rdx",
        "mov [rdi + {rcx}], rcx",
        "mov [rdi + {rax}], rax",
        "mov rax, [rsp]",
        "mov [rdi + {rip}], rax",
        "lea rax, [rsp + 8]",
        "mov [rdi + {rsp}], rax",
        // install rsi
        "mov r8, [rsi + {r8}]",
        "mov r9, [rsi + {r9}]",
        "mov r10, [rsi + {r10}]",
        "mov r11, [rsi + {r11}]",
        "mov r12, [rsi + {r12}]",
        "mov r13, [rsi + {r13}]",
        "mov r14, [rsi + {r14}]",
        "mov r15, [rsi + {r15}]",
        "mov rbp, [rsi + {rbp}]",
        "mov rsp, [rsi + {rsp}]",
        "mov rbx, [rsi + {rbx}]",
        "mov rdx, [rsi + {rdx}]",
        "mov rcx, [rsi + {rcx}]",
        "mov rax, [rsi + {rax}]",
        "mov rdi, [rsi + {rdi}]",
        // rsi is the scratch slot carrying the jump target
        "mov rsi, [rsi + {rip}]",
        "jmp rsi",
        r8 = const Reg::R8.offset(),
        r9 = const Reg::R9.offset(),
        r10 = const Reg::R10.offset(),
        r11 = const Reg::R11.offset(),
        r12 = const Reg::R12.offset(),
        r13 = const Reg::R13.offset(),
        r14 = const Reg::R14.offset(),
        r15 = const Reg::R15.offset(),
        rdi = const Reg::Rdi.offset(),
        rsi = const Reg::Rsi.offset(),
        rbp = const Reg::Rbp.offset(),
        rsp = const Reg::Rsp.offset(),
        rbx = const Reg::Rbx.offset(),
        rdx = const Reg::Rdx.offset(),
        rcx = const Reg::Rcx.offset(),
        rax = const Reg::Rax.offset(),
        rip = const Reg::Rip.offset(),
    )
}

/// Prepares a fresh context that runs `entry(arg)` once installed.
///
/// Carves the activation region from the top of the stack so that entry
/// begins with `rsp % 16 == 8`, exactly the state a `call` instruction would
/// leave. The synthetic return slot points at the fallthrough trap, and the
/// frame pointer is zero by convention, marking the root of the new stack.
///
/// # Safety
/// `stack_top` must be the upper end of a writable region with at least 32
/// bytes below it, and `entry` must be the address of an
/// `extern "C" fn(usize)`.
pub(crate) unsafe fn initialize(
    file: &mut RegisterFile,
    stack_top: *mut u8,
    entry: usize,
    arg: usize,
) {
    // link slot below the top, then align for the synthetic call frame
    let mut sp = (stack_top as usize) - 8;
    sp &= !15;
    sp -= 8;

    // synthetic return slot: entry falling through lands in the trap
    unsafe { (sp as *mut usize).write(fallthrough_trap as usize) };

    file.set(Reg::Rip, entry);
    file.set(Reg::Rsp, sp);
    file.set(Reg::Rbp, 0);
    file.set(Reg::Rdi, arg);
}

/// Landing pad for an entry function that returns instead of exiting.
///
/// The lifecycle trampoline always terminates the coroutine, so this runs
/// only if a return address was corrupted. The `ret` that brought us here
/// consumed the synthetic slot and left `rsp` off the calling convention;
/// realign before entering Rust.
#[unsafe(naked)]
extern "C" fn fallthrough_trap() -> ! {
    naked_asm!(
        "and rsp, -16",
        "sub rsp, 8",
        "jmp {handler}",
        handler = sym crate::runtime::entry_fallthrough,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_stable() {
        assert_eq!(std::mem::size_of::<RegisterFile>(), REGISTER_COUNT * 8);
        assert_eq!(std::mem::align_of::<RegisterFile>(), 8);
        assert_eq!(Reg::Rsp.offset(), 88);
        assert_eq!(Reg::Rip.offset(), 128);
    }

    #[test]
    fn get_and_set_are_slot_accurate() {
        let mut file = RegisterFile::new();

        file.set(Reg::Rbx, 0xdead);
        file.set(Reg::R12, 0xbeef);

        assert_eq!(file.get(Reg::Rbx), 0xdead);
        assert_eq!(file.get(Reg::R12), 0xbeef);
        assert_eq!(file.get(Reg::Rax), 0);
    }

    extern "C" fn nop_entry(_arg: usize) {}

    #[test]
    fn initialize_builds_an_aligned_call_frame() {
        let mut memory = vec![0u8; 256];
        let top = unsafe { memory.as_mut_ptr().add(memory.len()) };
        let mut file = RegisterFile::new();

        unsafe { initialize(&mut file, top, nop_entry as usize, 42) };

        let sp = file.stack_pointer();
        assert_eq!(sp % 16, 8);
        assert!(sp < top as usize && sp >= memory.as_ptr() as usize);
        assert_eq!(file.instruction_pointer(), nop_entry as usize);
        assert_eq!(file.get(Reg::Rdi), 42);
        assert_eq!(file.get(Reg::Rbp), 0);

        // the synthetic return slot holds the trap
        let slot = unsafe { (sp as *const usize).read() };
        assert_eq!(slot, fallthrough_trap as usize);
    }
}
