//! x86_64 voluntary context switching.
//!
//! Only the System V callee-saved register set crosses a voluntary
//! switch point; everything else is dead by the calling convention.

use std::arch::naked_asm;

/// Callee-saved register set captured at a voluntary switch.
#[repr(C)]
#[derive(Default)]
pub(crate) struct SavedRegs {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Prepare a fresh context so the first switch into it enters
/// `entry(arg)` on the given stack.
///
/// # Safety
///
/// `regs` must point to writable `SavedRegs`; `stack_top` must be the
/// top of a live allocation large enough for the thread.
pub(crate) unsafe fn init_context(
    regs: *mut SavedRegs,
    stack_top: *mut u8,
    entry: usize,
    arg: usize,
) {
    // 16-byte alignment per the System V AMD64 ABI, minus the slot a
    // call would have pushed.
    let sp = (stack_top as usize & !0xF) - 8;
    let regs = unsafe { &mut *regs };
    regs.rsp = sp as u64;
    regs.rip = entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry as u64;
    regs.r13 = arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// First-entry shim: moves the argument into place and calls the entry
/// function. The entry function never returns (it switches away for the
/// last time instead), so falling through is a hard fault by design.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2");
}

/// Save the callee-saved set into `_save`, load `_load`, and continue
/// there. Returns (to the saved resume point) when something later
/// switches back.
///
/// # Safety
///
/// Both pointers must reference valid `SavedRegs`; `_load` must have
/// been filled by `init_context` or a previous save.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_context(_save: *mut SavedRegs, _load: *const SavedRegs) {
    naked_asm!(
        // Save into _save (rdi).
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from _load (rsi).
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved context.
        "2:",
        "ret",
    );
}
