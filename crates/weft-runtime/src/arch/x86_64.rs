//! x86_64 context switching
//!
//! Voluntary switches happen at call boundaries, so only the System V
//! callee-saved registers (plus rsp/rip) need to be preserved.

use std::arch::naked_asm;

/// Callee-saved register block for a suspended context.
///
/// Field order is fixed: the naked routines below address these by offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedContext {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

/// Prepare a fresh context so that the first switch into it runs
/// `entry(arg)` on the given stack.
///
/// # Safety
///
/// `ctx` must point to valid `SavedContext` memory and `stack_top` must be
/// the one-past-the-end address of a live stack allocation.
pub unsafe fn init_context(
    ctx: *mut SavedContext,
    stack_top: *mut u8,
    entry: extern "C" fn(usize),
    arg: usize,
) {
    // 16-byte aligned at the trampoline: the `call` below then enters
    // `entry` at the ABI-mandated rsp % 16 == 8.
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = sp as u64;
    ctx.rip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry as usize as u64;
    ctx.r13 = arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First frame of every fiber: calls the entry function left in r12 with
/// the argument left in r13. The entry function terminates its fiber and
/// never returns here.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Save callee-saved registers into `save` and load from `load`.
///
/// Control continues at `load`'s rip; it returns here only when some later
/// switch loads `save` again.
///
/// # Safety
///
/// Both pointers must reference valid `SavedContext` blocks; `load` must
/// hold a context produced by `init_context` or a previous save.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_save: *mut SavedContext, _load: *const SavedContext) {
    naked_asm!(
        // Save callee-saved registers into save (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from load (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the loaded rip
        "jmp rax",
        // Return point for the saved context
        "2:",
        "ret",
    );
}
