//! A preemptive, fixed-priority real-time kernel for single-core
//! microcontrollers.
//!
//! The kernel provides tasks with round-robin scheduling inside each priority
//! band, counting/binary semaphores, mutexes with basic priority inheritance,
//! bounded message queues, wrap-safe tick-based waits, and fixed pool
//! allocators backing every kernel object. No heap is used; pool capacity,
//! configured in [`cfg`], is the only capacity.
//!
//! # Ports
//!
//! The kernel is generic over a [`Port`], the seam hiding everything
//! target-specific: interrupt masking, the context-switch trampoline, the
//! first-task launch, initial stack frame construction, and the tick source.
//! A port supplies one static [`Kernel`] instance and an implementation of
//! the trait; see `kestrel_port_arm_m` for the ARMv7-M port and
//! `kestrel_port_std` for the hosted simulator the test suite runs on.
//!
//! # Contexts
//!
//! Exactly one task runs at a time. Kernel entry points are called from task
//! context; the tick handler is the only interrupt-context entry. Mutual
//! exclusion between the two is interrupt masking (the *CPU Lock*), never
//! spinning.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

use core::marker::PhantomData;
use core::num::NonZeroUsize;

pub mod cfg;
mod error;
mod klock;
mod mutex;
mod pool;
mod queue;
mod ringbuf;
mod semaphore;
mod state;
mod task;
mod time;
mod timeout;
mod utils;
mod wait;

pub use error::*;
pub use pool::{PoolId, PoolStats};
pub use state::Kernel;
pub use task::{TaskEntry, TaskSt, TaskStats};

use state::Lifecycle;
use utils::intrusive_list::Index;

/// The interface a port supplies to the kernel.
///
/// # Safety
///
/// Implementations must uphold each method's contract; the kernel's memory
/// safety rests on the CPU Lock methods really establishing mutual exclusion
/// with interrupt handlers on the single core.
pub unsafe trait Port: Sized + 'static {
    /// The kernel instance this port drives.
    fn state() -> &'static Kernel<Self>;

    /// Enter the CPU Lock state (mask interrupts).
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel. The CPU Lock must be inactive.
    unsafe fn enter_cpu_lock();

    /// Enter the CPU Lock state, failing (returning `false`) when it is
    /// already active.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Leave the CPU Lock state (restore interrupts).
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel while the CPU Lock is active.
    unsafe fn leave_cpu_lock();

    fn is_cpu_lock_active() -> bool;

    /// Request a context switch: the dispatch exception runs at the next
    /// opportunity and resumes the task chosen by
    /// [`PortToKernel::choose_running_task`].
    ///
    /// # Safety
    ///
    /// CPU Lock inactive.
    unsafe fn yield_cpu();

    /// Hand the processor to the first task using its prepared stack frame.
    ///
    /// # Safety
    ///
    /// CPU Lock inactive; called exactly once, by [`System::start`].
    unsafe fn dispatch_first_task(stack_pointer: usize) -> !;

    /// Dispatch away from the calling task forever. The caller has already
    /// been marked dead and unlinked from the scheduler.
    ///
    /// # Safety
    ///
    /// CPU Lock inactive; task context.
    unsafe fn exit_and_dispatch() -> !;

    /// Prepare a fresh task's stack so that the first dispatch resumes
    /// execution at `entry(param)`, and return the initial stack pointer
    /// value. `slot` identifies the task's pool slot.
    ///
    /// # Safety
    ///
    /// CPU Lock active; `stack` points to `stack_len` writable bytes that
    /// nothing else aliases.
    unsafe fn initialize_task_state(
        slot: usize,
        stack: *mut u8,
        stack_len: usize,
        entry: TaskEntry,
        param: usize,
    ) -> usize;

    /// Program the tick source to call [`PortToKernel::timer_tick`] at
    /// `tick_hz` Hz.
    ///
    /// # Safety
    ///
    /// Called exactly once, by [`System::start`].
    unsafe fn tick_init(tick_hz: u32);

    /// Idle until something happens. A low-power hint; spurious returns are
    /// fine.
    ///
    /// # Safety
    ///
    /// CPU Lock inactive; idle task context.
    unsafe fn wait_for_interrupt();
}

/// Entry points the port's trampolines and interrupt handlers call back into
/// the kernel. Implemented for every [`Port`].
pub trait PortToKernel {
    /// Make the scheduling decision: update the current task and the task
    /// states. Called from the dispatch path.
    ///
    /// # Safety
    ///
    /// CPU Lock inactive; single dispatch context.
    unsafe fn choose_running_task();

    /// [`choose_running_task`](Self::choose_running_task), exchanging saved
    /// stack pointers: stores `old_stack_pointer` into the outgoing task and
    /// returns the incoming task's saved stack pointer.
    ///
    /// # Safety
    ///
    /// CPU Lock inactive; called from the context-switch trampoline only.
    unsafe fn switch_context(old_stack_pointer: usize) -> usize;

    /// The tick interrupt entry: advance time, release expired waits, and
    /// request preemption when a released task outranks the current one.
    ///
    /// # Safety
    ///
    /// CPU Lock inactive; tick interrupt context.
    unsafe fn timer_tick();
}

impl<Traits: Port> PortToKernel for Traits {
    unsafe fn choose_running_task() {
        let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
            return;
        };
        let state = Traits::state().body.write(&mut *lock);
        task::choose_running_task_core(state);
    }

    unsafe fn switch_context(old_stack_pointer: usize) -> usize {
        let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
            return old_stack_pointer;
        };
        let state = Traits::state().body.write(&mut *lock);
        if let Some(cur) = state.current_task {
            state.tasks.slots_mut()[usize::from(cur)].stack_pointer = old_stack_pointer;
        }
        task::choose_running_task_core(state);
        state
            .current_task
            .map(|i| state.tasks.slots()[usize::from(i)].stack_pointer)
            .unwrap_or(old_stack_pointer)
    }

    unsafe fn timer_tick() {
        let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
            return;
        };
        let state = Traits::state().body.write(&mut *lock);
        if state.lifecycle != Lifecycle::Running {
            return;
        }
        timeout::handle_tick(state);
        task::unlock_and_check_preemption(lock);
    }
}

macro_rules! define_object_id {
    (
        $( #[doc $( $doc:tt )*] )*
        $Name:ident
    ) => {
        $( #[doc $( $doc )*] )*
        ///
        /// Handles are opaque. Using a handle after the object was deleted is
        /// detected on a best-effort basis only (the slot may have been
        /// reused).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $Name(NonZeroUsize);

        impl $Name {
            fn from_index(index: Index) -> Self {
                Self(NonZeroUsize::new(usize::from(index) + 1).unwrap())
            }

            fn index(self) -> Index {
                (self.0.get() - 1) as Index
            }
        }
    };
}

define_object_id! {
    /// A task handle.
    TaskId
}
define_object_id! {
    /// A message queue handle.
    QueueId
}
define_object_id! {
    /// A semaphore handle.
    SemaphoreId
}
define_object_id! {
    /// A mutex handle.
    MutexId
}

/// The public kernel API, instantiated for one [`Port`].
pub struct System<Traits>(PhantomData<Traits>);

impl<Traits: Port> System<Traits> {
    /// Initialize the kernel: empty every pool and scheduler structure and
    /// create the idle task. Idempotent; later calls are no-ops.
    pub fn init() {
        let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
            return;
        };
        let state = Traits::state().body.write(&mut *lock);
        if state.lifecycle != Lifecycle::Uninit {
            return;
        }
        *state = utils::Init::INIT;
        task::create_idle_task::<Traits>(state);
        state.lifecycle = Lifecycle::Initialized;
    }

    /// Start scheduling. Programs the tick source, dispatches the
    /// highest-priority Ready task, and never returns.
    ///
    /// Calling this without a prior [`init`](Self::init) halts.
    pub fn start() -> ! {
        let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
            halt();
        };
        let state = Traits::state().body.write(&mut *lock);
        if state.lifecycle != Lifecycle::Initialized {
            halt();
        }
        state.lifecycle = Lifecycle::Running;
        task::choose_running_task_core(state);
        let Some(first) = state.current_task else {
            halt();
        };
        let sp = state.tasks.slots()[usize::from(first)].stack_pointer;
        drop(lock);

        // Safety: we are the kernel boot path; both are called exactly once
        unsafe {
            Traits::tick_init(cfg::TICK_HZ);
            Traits::dispatch_first_task(sp)
        }
    }

    /// The current value of the free-running tick counter.
    pub fn tick_count() -> Result<u32, QueryKernelError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(Traits::state().body.read(&*lock).tick_now)
    }

    /// Overwrite the tick counter.
    ///
    /// # Safety
    ///
    /// No armed delay or wait deadline may be outstanding; their epoch
    /// bookkeeping is relative to the counter value at arm time.
    pub unsafe fn set_tick_count(tick: u32) -> Result<(), QueryKernelError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Traits::state().body.write(&mut *lock).tick_now = tick;
        Ok(())
    }

    /// Usage counters of one object pool.
    pub fn pool_stats(id: PoolId) -> Result<PoolStats, QueryKernelError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(Traits::state().body.read(&*lock).pool_stats(id))
    }

    /// The pool slot of the current task. Port interface.
    #[doc(hidden)]
    pub fn current_task_slot() -> Option<usize> {
        let lock = klock::lock_cpu::<Traits>().ok()?;
        Traits::state()
            .body
            .read(&*lock)
            .current_task
            .map(usize::from)
    }

    /// The pool slot of the task the pending context switch will resume, as
    /// computed by the last scheduling decision. Port interface.
    #[doc(hidden)]
    pub fn next_task_slot() -> Option<usize> {
        let lock = klock::lock_cpu::<Traits>().ok()?;
        Traits::state()
            .body
            .read(&*lock)
            .next_task
            .map(usize::from)
    }

    /// The pool slot of the idle task. Port interface.
    #[doc(hidden)]
    pub fn idle_task_slot() -> Option<usize> {
        let lock = klock::lock_cpu::<Traits>().ok()?;
        Traits::state()
            .body
            .read(&*lock)
            .idle_task
            .map(usize::from)
    }

    /// The entry point and parameter of the task in `slot`. Port interface.
    #[doc(hidden)]
    pub fn task_entry_info(slot: usize) -> Option<(TaskEntry, usize)> {
        let lock = klock::lock_cpu::<Traits>().ok()?;
        let state = Traits::state().body.read(&*lock);
        let tcb = state.tasks.get(slot)?;
        Some((tcb.entry?, tcb.entry_param))
    }
}

/// Unrecoverable kernel fault: park the processor.
pub(crate) fn halt() -> ! {
    loop {
        core::hint::spin_loop();
    }
}
