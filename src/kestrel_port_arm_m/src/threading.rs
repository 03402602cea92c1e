//! The ARMv7-M implementation of the port seam.
use core::sync::atomic::{compiler_fence, Ordering};

use cortex_m::peripheral::{scb::SystemHandler, syst::SystClkSource};
use cortex_m::register::primask;
use kestrel_kernel::{PortToKernel, System, TaskEntry};

use crate::ThreadingOptions;

/// Implemented on a kernel trait type by [`use_port!`](crate::use_port).
///
/// # Safety
///
/// Only meant to be implemented by `use_port!`.
pub unsafe trait PortInstance: kestrel_kernel::Port + ThreadingOptions {}

#[inline]
pub fn enter_cpu_lock() {
    cortex_m::interrupt::disable();
}

/// # Safety
///
/// Kernel use only.
#[inline]
pub unsafe fn try_enter_cpu_lock() -> bool {
    if primask::read().is_inactive() {
        return false;
    }
    cortex_m::interrupt::disable();
    true
}

/// # Safety
///
/// The CPU Lock must be active, and the kernel must not be relying on it
/// anymore.
#[inline]
pub unsafe fn leave_cpu_lock() {
    // Safety: forwarded to the caller
    unsafe { cortex_m::interrupt::enable() };
}

#[inline]
pub fn is_cpu_lock_active() -> bool {
    primask::read().is_inactive()
}

/// Pend PendSV. The switch happens as soon as no higher-priority exception
/// is active and PRIMASK is clear.
#[inline]
pub fn yield_cpu() {
    // Ensure preceding memory operations are visible to the PendSV handler
    compiler_fence(Ordering::Release);

    cortex_m::peripheral::SCB::set_pendsv();
    cortex_m::asm::dsb();
    cortex_m::asm::isb();

    // Ensure the PendSV handler's memory operations are visible to us
    compiler_fence(Ordering::Acquire);
}

/// Called by the PendSV handler with the outgoing task's PSP (pointing at
/// its saved `r4`). Returns the incoming task's saved PSP.
pub unsafe extern "C" fn pendsv_switch<Traits: PortInstance>(old_sp: usize) -> usize {
    // Safety: context-switch trampoline context
    unsafe { <Traits as PortToKernel>::switch_context(old_sp) }
}

/// Runs a task's entry function in thread mode, and turns a return from it
/// into self-deletion.
pub unsafe extern "C" fn task_entry_trampoline<Traits: PortInstance>(
    param: usize,
    entry_raw: usize,
) {
    // Safety: `entry_raw` was produced from a `TaskEntry` by
    // `initialize_task_state`
    let entry: TaskEntry = unsafe { core::mem::transmute(entry_raw) };
    entry(param);

    if let Some(me) = System::<Traits>::task_current() {
        let _ = System::<Traits>::task_delete(me);
    }
    // Not reached: the deletion dispatched away for good.
    loop {
        cortex_m::asm::wfi();
    }
}

/// Pre-fill a fresh task's stack with the frame the context-switch path
/// restores: the hardware exception frame (xPSR with the Thumb bit, PC, LR,
/// R12, R3-R0) on top of the software-saved R11-R4. The first dispatch then
/// "returns" straight into the task.
///
/// # Safety
///
/// `stack` must point to `stack_len` writable bytes that nothing else is
/// using.
pub unsafe fn initialize_task_state<Traits: PortInstance>(
    stack: *mut u8,
    stack_len: usize,
    entry: TaskEntry,
    param: usize,
) -> usize {
    let trampoline: unsafe extern "C" fn(usize, usize) = task_entry_trampoline::<Traits>;
    let entry: fn(usize) = entry;

    // AAPCS requires 8-byte stack alignment at the exception boundary.
    let top = (stack as usize + stack_len) & !7;
    let mut sp = top as *mut u32;
    // Safety: all writes stay within `stack..stack + stack_len`
    unsafe {
        sp = sp.sub(1);
        sp.write(0x0100_0000); // xPSR: Thumb state
        sp = sp.sub(1);
        sp.write(trampoline as usize as u32); // PC
        sp = sp.sub(1);
        sp.write(0); // LR
        sp = sp.sub(1);
        sp.write(0); // R12
        sp = sp.sub(1);
        sp.write(0); // R3
        sp = sp.sub(1);
        sp.write(0); // R2
        sp = sp.sub(1);
        sp.write(entry as usize as u32); // R1
        sp = sp.sub(1);
        sp.write(param as u32); // R0
        for _ in 0..8 {
            sp = sp.sub(1);
            sp.write(0); // R11..R4
        }
    }
    sp as usize
}

/// Launch the first task from its prepared frame: restore the callee-saved
/// block, point PSP at the hardware frame, switch thread mode to PSP, and
/// branch into the entry trampoline.
///
/// # Safety
///
/// Thread mode on MSP, called exactly once.
pub unsafe fn dispatch_first_task(stack_pointer: usize) -> ! {
    // Safety: the frame at `stack_pointer` was built by
    // `initialize_task_state`
    unsafe {
        core::arch::asm!(
            "ldmia r0!, {{r4-r11}}",
            "msr psp, r0",
            "movs r0, #2",
            "msr control, r0",
            "isb",
            "pop {{r0-r3, r12, lr}}",
            "pop {{r2, r3}}",
            "cpsie i",
            "bx r2",
            in("r0") stack_pointer,
            options(noreturn),
        )
    }
}

/// Leave the calling (already dead) task: request a dispatch and wait for it
/// to take effect. The task is never scheduled again, so the saved context
/// this produces is simply abandoned.
///
/// # Safety
///
/// Task context; the calling task has been removed from scheduling.
pub unsafe fn exit_and_dispatch<Traits: PortInstance>() -> ! {
    yield_cpu();
    loop {
        cortex_m::asm::wfi();
    }
}

/// Program SysTick for the kernel tick and demote the dispatch exception to
/// the lowest priority so it never preempts other interrupt handlers.
///
/// # Safety
///
/// Boot path, called exactly once.
pub unsafe fn tick_init<Traits: PortInstance>(tick_hz: u32) {
    // Safety: the port owns these peripherals for good
    let mut peripherals = unsafe { cortex_m::Peripherals::steal() };

    // Safety: we don't make priority-based critical sections
    unsafe {
        peripherals.SCB.set_priority(SystemHandler::PendSV, 0xff);
        peripherals.SCB.set_priority(SystemHandler::SysTick, 0xf0);
    }

    let reload = (Traits::CPU_CLOCK_HZ / tick_hz).saturating_sub(1);
    peripherals.SYST.set_clock_source(SystClkSource::Core);
    peripherals.SYST.set_reload(reload);
    peripherals.SYST.clear_current();
    peripherals.SYST.enable_interrupt();
    peripherals.SYST.enable_counter();
}
