//! ARMv7-M port for the kestrel kernel.
//!
//! The port maps the kernel's context-switch seam onto the standard Cortex-M
//! scheme: PendSV, configured to the lowest exception priority, performs the
//! deferred register save/restore over the process stack (PSP); SysTick is
//! the tick source; the CPU Lock is PRIMASK. Task stacks are pre-filled with
//! the frame the PendSV handler expects, so dispatching a fresh task is
//! indistinguishable from resuming a preempted one.
//!
//! Bind a kernel instance with `use_port!` and provide the target clock via
//! [`ThreadingOptions`]:
//!
//! ```ignore
//! kestrel_port_arm_m::use_port!(unsafe struct SystemTraits);
//!
//! impl kestrel_port_arm_m::ThreadingOptions for SystemTraits {
//!     const CPU_CLOCK_HZ: u32 = 16_000_000;
//! }
//! ```
//!
//! The crate builds to an empty shell on hosted targets so that workspace-wide
//! builds and tests work; everything real is gated to `target_os = "none"`.
#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

/// Port configuration supplied by the application.
pub trait ThreadingOptions {
    /// The clock feeding SysTick.
    const CPU_CLOCK_HZ: u32;

    /// Whether the idle task may execute the `wfi` instruction. Disable when
    /// the target's sleep state interferes with debugging.
    const USE_WFI: bool = true;
}

#[cfg(target_os = "none")]
pub mod threading;

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate kestrel_kernel;
#[cfg(target_os = "none")]
#[doc(hidden)]
pub extern crate cortex_m;
#[cfg(target_os = "none")]
#[doc(hidden)]
pub extern crate cortex_m_rt;

/// Instantiate the port: implements [`kestrel_kernel::Port`] for the named
/// type, provides the kernel static, and installs the PendSV and SysTick
/// handlers.
///
/// The application must also implement [`ThreadingOptions`] for the type.
#[cfg(target_os = "none")]
#[macro_export]
macro_rules! use_port {
    (unsafe struct $SystemTraits:ident) => {
        pub(crate) struct $SystemTraits;

        mod port_arm_m_impl {
            use super::$SystemTraits;
            use $crate::kestrel_kernel::{Kernel, TaskEntry};
            use $crate::threading;

            pub(super) static KERNEL: Kernel<$SystemTraits> = Kernel::new();

            unsafe impl $crate::threading::PortInstance for $SystemTraits {}

            unsafe impl $crate::kestrel_kernel::Port for $SystemTraits {
                fn state() -> &'static Kernel<Self> {
                    &KERNEL
                }

                unsafe fn enter_cpu_lock() {
                    threading::enter_cpu_lock()
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { threading::try_enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { threading::leave_cpu_lock() }
                }

                fn is_cpu_lock_active() -> bool {
                    threading::is_cpu_lock_active()
                }

                unsafe fn yield_cpu() {
                    threading::yield_cpu()
                }

                unsafe fn dispatch_first_task(stack_pointer: usize) -> ! {
                    unsafe { threading::dispatch_first_task(stack_pointer) }
                }

                unsafe fn exit_and_dispatch() -> ! {
                    unsafe { threading::exit_and_dispatch::<Self>() }
                }

                unsafe fn initialize_task_state(
                    _slot: usize,
                    stack: *mut u8,
                    stack_len: usize,
                    entry: TaskEntry,
                    param: usize,
                ) -> usize {
                    unsafe {
                        threading::initialize_task_state::<Self>(stack, stack_len, entry, param)
                    }
                }

                unsafe fn tick_init(tick_hz: u32) {
                    unsafe { threading::tick_init::<Self>(tick_hz) }
                }

                unsafe fn wait_for_interrupt() {
                    if <Self as $crate::ThreadingOptions>::USE_WFI {
                        $crate::cortex_m::asm::wfi();
                    }
                }
            }

            /// The deferred context-switch handler. Saves the outgoing task's
            /// callee-saved registers over PSP, asks the kernel for the next
            /// task, and restores its frame.
            ::core::arch::global_asm!(
                ".syntax unified",
                ".cfi_sections .debug_frame",
                ".thumb_func",
                ".global PendSV",
                "PendSV:",
                "    mrs r0, psp",
                "    stmdb r0!, {{r4-r11}}",
                "    bl {switch}",
                "    ldmia r0!, {{r4-r11}}",
                "    msr psp, r0",
                "    isb",
                // EXC_RETURN: thread mode, PSP, no FP state
                "    mvn lr, #2",
                "    bx lr",
                switch = sym threading::pendsv_switch::<$SystemTraits>,
            );

            #[$crate::cortex_m_rt::exception]
            fn SysTick() {
                // Safety: tick interrupt context
                unsafe {
                    <$SystemTraits as $crate::kestrel_kernel::PortToKernel>::timer_tick();
                }
            }
        }
    };
}
