//! Simulation environment for running the kestrel kernel on a hosted target.
//!
//! Every kernel task is backed by an OS thread, but only one thread runs at a
//! time: a scheduler gate (a mutex/condvar pair) models the single simulated
//! processor, and a context switch is a gate handoff between two threads. The
//! result is a cooperative rendition of the kernel: context switches happen
//! at the kernel's own dispatch requests, which is exactly the set of
//! suspension points the kernel semantics define.
//!
//! Time is virtual. The tick counter only advances when the idle task invokes
//! its wait-for-interrupt hook, i.e. when every other task is blocked. Each
//! hook invocation delivers one tick interrupt, so simulated timeouts run at
//! full host speed and deterministically.
//!
//! Use [`use_port!`] to mint a kernel instance bound to this port, [`run`] to
//! boot it, and [`shutdown`] (from a task) to end the simulation.
use std::any::Any;
use std::cell::Cell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;

use kestrel_kernel::{PortToKernel, System, TaskEntry};
use once_cell::sync::Lazy;
use slab::Slab;
use spin::Mutex as SpinMutex;

/// Ticks the idle task may deliver with no other task ever becoming
/// runnable before the simulation is declared stalled.
const IDLE_SPIN_LIMIT: u32 = 5_000_000;

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance: kestrel_kernel::Port {
    fn port_state() -> &'static State;
}

/// Identifies a simulated-processor thread.
type ThreadId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    /// Runs the boot phase (`init`, setup, `start`).
    Boot,
    /// The backing thread for a task.
    Task,
}

/// The task's backing-thread state machine.
///
/// These don't exactly align with the task states defined in the kernel: the
/// thread is spawned lazily on the first dispatch and outlives task deletion
/// until it can unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tsm {
    /// No backing thread; the task slot is not initialized.
    Uninit,
    /// Initialized but never dispatched; no thread exists yet.
    Dormant,
    /// The task is backed by the given thread.
    Running(ThreadId),
}

struct Sched {
    /// The one thread allowed to make progress.
    running_thread: Option<ThreadId>,
    boot_thread: Option<ThreadId>,
    threads: Slab<ThreadRole>,
    /// Advisory interrupt-mask flag. The scheduler gate provides the real
    /// mutual exclusion; this only tracks the kernel's lock nesting.
    cpu_lock: bool,
    shutdown: bool,
    booted: bool,
}

impl Sched {
    fn new() -> Self {
        Self {
            running_thread: None,
            boot_thread: None,
            threads: Slab::new(),
            cpu_lock: false,
            shutdown: false,
            booted: false,
        }
    }
}

/// Unwind payload ending a thread on simulation shutdown.
struct ShutdownToken;

/// Unwind payload ending the backing thread of an exited task.
struct TaskExitToken;

thread_local! {
    /// The simulated-thread id of the current OS thread, if it belongs to a
    /// simulation.
    static CURRENT_THREAD: Cell<Option<ThreadId>> = Cell::new(None);
}

/// The internal state of the port. One static instance per [`use_port!`]
/// invocation.
pub struct State {
    sched: Lazy<Mutex<Sched>>,
    wakeup: Condvar,
    join_handles: Mutex<Vec<thread::JoinHandle<()>>>,
    task_threads: [SpinMutex<Tsm>; kestrel_kernel::cfg::MAX_TASKS],
    idle_spins: AtomicU32,
}

fn sched_init() -> Mutex<Sched> {
    Mutex::new(Sched::new())
}

#[allow(clippy::new_without_default)]
impl State {
    pub const fn new() -> Self {
        Self {
            sched: Lazy::new(sched_init as fn() -> Mutex<Sched>),
            wakeup: Condvar::new(),
            join_handles: Mutex::new(Vec::new()),
            task_threads: [const { SpinMutex::new(Tsm::Uninit) };
                kestrel_kernel::cfg::MAX_TASKS],
            idle_spins: AtomicU32::new(0),
        }
    }

    fn request_shutdown(&self) {
        let mut sched = self.sched.lock().unwrap();
        sched.shutdown = true;
        log::trace!(
            "shutting down {} simulation threads (boot thread {:?})",
            sched.threads.len(),
            sched.boot_thread
        );
        drop(sched);
        self.wakeup.notify_all();
    }

    /// Block until the scheduler gate selects `me`. Unwinds with
    /// [`ShutdownToken`] when the simulation is shutting down.
    fn gate_wait(&self, me: ThreadId) {
        let mut sched = self.sched.lock().unwrap();
        loop {
            if sched.shutdown {
                drop(sched);
                std::panic::panic_any(ShutdownToken);
            }
            if sched.running_thread == Some(me) {
                return;
            }
            sched = self.wakeup.wait(sched).unwrap();
        }
    }

    /// The backing thread for the task in `slot`, spawning it on first
    /// dispatch.
    fn ensure_thread_for_slot<Traits: PortInstance>(&'static self, slot: usize) -> ThreadId {
        let mut tsm = self.task_threads[slot].lock();
        match *tsm {
            Tsm::Running(id) => id,
            Tsm::Uninit | Tsm::Dormant => {
                let id = self.spawn_task_thread::<Traits>(slot);
                *tsm = Tsm::Running(id);
                id
            }
        }
    }

    fn spawn_task_thread<Traits: PortInstance>(&'static self, slot: usize) -> ThreadId {
        let (entry, param): (TaskEntry, usize) = System::<Traits>::task_entry_info(slot)
            .expect("dispatched a task with no entry point");

        let id = {
            let mut sched = self.sched.lock().unwrap();
            sched.threads.insert(ThreadRole::Task)
        };
        log::trace!("spawning thread {id} for task slot {slot}");

        let handle = thread::Builder::new()
            .name(format!("task-{slot}"))
            .spawn(move || {
                CURRENT_THREAD.with(|c| c.set(Some(id)));
                let result = catch_unwind(AssertUnwindSafe(|| {
                    Traits::port_state().gate_wait(id);
                    log::debug!("task slot {slot} is now running");
                    entry(param);
                    // The task function returned: remove the task as if it
                    // had deleted itself.
                    if let Some(me) = System::<Traits>::task_current() {
                        let _ = System::<Traits>::task_delete(me);
                    }
                }));
                finish_sim_thread::<Traits>(result);
            })
            .expect("failed to spawn a task thread");
        self.join_handles.lock().unwrap().push(handle);
        id
    }

    /// Run the dispatcher: ask the kernel for a scheduling decision and hand
    /// the gate to the chosen task's thread. Called on the currently running
    /// thread with the CPU Lock inactive.
    fn dispatch<Traits: PortInstance>(&'static self) {
        // Safety: CPU Lock inactive, we are the dispatch context
        unsafe { Traits::choose_running_task() };

        let Some(slot) = System::<Traits>::current_task_slot() else {
            return;
        };
        let target = self.ensure_thread_for_slot::<Traits>(slot);
        let me = CURRENT_THREAD
            .with(|c| c.get())
            .expect("dispatch outside a simulation thread");

        let switched = {
            let mut sched = self.sched.lock().unwrap();
            let prev = sched.running_thread.replace(target);
            prev != Some(target)
        };
        if !switched {
            return;
        }

        if System::<Traits>::idle_task_slot() != Some(slot) {
            self.idle_spins.store(0, Ordering::Relaxed);
        }
        log::trace!("dispatching task slot {slot} (thread {target})");
        self.wakeup.notify_all();
        if me != target {
            self.gate_wait(me);
        }
    }

    pub fn enter_cpu_lock(&self) {
        let mut sched = self.sched.lock().unwrap();
        sched.cpu_lock = true;
    }

    pub fn try_enter_cpu_lock(&self) -> bool {
        let mut sched = self.sched.lock().unwrap();
        if sched.cpu_lock {
            false
        } else {
            sched.cpu_lock = true;
            true
        }
    }

    pub fn leave_cpu_lock(&self) {
        let mut sched = self.sched.lock().unwrap();
        sched.cpu_lock = false;
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        self.sched.lock().unwrap().cpu_lock
    }

    pub fn yield_cpu<Traits: PortInstance>(&'static self) {
        self.dispatch::<Traits>();
    }

    pub fn dispatch_first_task<Traits: PortInstance>(&'static self) -> ! {
        log::trace!("dispatch_first_task");
        let slot = System::<Traits>::current_task_slot().expect("no task to dispatch");
        let target = self.ensure_thread_for_slot::<Traits>(slot);
        let me = CURRENT_THREAD.with(|c| c.get()).expect("not a boot thread");
        {
            let mut sched = self.sched.lock().unwrap();
            debug_assert_eq!(sched.boot_thread, Some(me));
            sched.running_thread = Some(target);
        }
        self.wakeup.notify_all();

        // The boot context is never scheduled again; park until shutdown.
        self.gate_wait(me);
        unreachable!("the boot thread was rescheduled");
    }

    pub fn exit_and_dispatch<Traits: PortInstance>(&'static self) -> ! {
        let dying = System::<Traits>::current_task_slot();
        log::trace!("exit_and_dispatch({dying:?})");
        if let Some(slot) = dying {
            *self.task_threads[slot].lock() = Tsm::Uninit;
        }

        // Safety: CPU Lock inactive, we are the dispatch context
        unsafe { Traits::choose_running_task() };
        let slot = System::<Traits>::current_task_slot().expect("no runnable task left");
        let target = self.ensure_thread_for_slot::<Traits>(slot);
        let me = CURRENT_THREAD.with(|c| c.get()).expect("not a simulation thread");
        {
            let mut sched = self.sched.lock().unwrap();
            sched.threads.remove(me);
            sched.running_thread = Some(target);
        }
        self.wakeup.notify_all();
        std::panic::panic_any(TaskExitToken)
    }

    pub fn initialize_task_state(&self, slot: usize, stack_len: usize) -> usize {
        *self.task_threads[slot].lock() = Tsm::Dormant;
        // The simulated context lives on an OS thread; the saved stack
        // pointer is bookkeeping only.
        stack_len
    }

    /// The idle task went to sleep: deliver one virtual tick.
    pub fn wait_for_interrupt<Traits: PortInstance>(&'static self) {
        let spins = self.idle_spins.fetch_add(1, Ordering::Relaxed);
        assert!(
            spins < IDLE_SPIN_LIMIT,
            "every task has been blocked for {IDLE_SPIN_LIMIT} virtual ticks; \
             the simulated system is stalled"
        );
        // Safety: tick interrupt context, CPU Lock inactive
        unsafe { Traits::timer_tick() };
    }
}

/// Keep the default panic hook from printing a backtrace for the unwind
/// tokens, which are ordinary control flow here.
fn install_panic_hook() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let payload = info.payload();
            if payload.is::<ShutdownToken>() || payload.is::<TaskExitToken>() {
                return;
            }
            default_hook(info);
        }));
    });
}

fn finish_sim_thread<Traits: PortInstance>(result: Result<(), Box<dyn Any + Send>>) {
    match result {
        Ok(()) => {}
        Err(p) if p.is::<ShutdownToken>() || p.is::<TaskExitToken>() => {}
        Err(p) => {
            // A real panic (e.g. a failed assertion in a task). Tear the
            // simulation down and let `run` re-raise it.
            Traits::port_state().request_shutdown();
            resume_unwind(p);
        }
    }
}

/// Boot a simulated kernel and run it to completion.
///
/// `setup` runs in the boot context after `System::init` and before
/// `System::start`; it typically creates the initial tasks and objects.
/// Returns when [`shutdown`] is called from a task. A panic on any simulated
/// thread (a failed test assertion, say) tears the simulation down and is
/// re-raised here.
pub fn run<Traits: PortInstance>(setup: impl FnOnce() + Send + 'static) {
    let _ = env_logger::builder().is_test(true).try_init();
    install_panic_hook();
    let state = Traits::port_state();

    let boot_id = {
        let mut sched = state.sched.lock().unwrap();
        assert!(!sched.booted, "a simulated kernel instance can only run once");
        sched.booted = true;
        let id = sched.threads.insert(ThreadRole::Boot);
        sched.boot_thread = Some(id);
        sched.running_thread = Some(id);
        id
    };

    let handle = thread::Builder::new()
        .name("boot".into())
        .spawn(move || {
            CURRENT_THREAD.with(|c| c.set(Some(boot_id)));
            let result = catch_unwind(AssertUnwindSafe(|| {
                System::<Traits>::init();
                setup();
                System::<Traits>::start();
            }));
            finish_sim_thread::<Traits>(result);
        })
        .expect("failed to spawn the boot thread");
    state.join_handles.lock().unwrap().push(handle);

    // Join every simulation thread; all of them unwind once shutdown is
    // requested. Keep the first non-token panic and re-raise it.
    let mut first_panic: Option<Box<dyn Any + Send>> = None;
    loop {
        let handle = state.join_handles.lock().unwrap().pop();
        let Some(handle) = handle else { break };
        if let Err(p) = handle.join() {
            first_panic.get_or_insert(p);
        }
    }
    if let Some(p) = first_panic {
        resume_unwind(p);
    }
}

/// End the simulation. Callable from any simulated task; does not return.
pub fn shutdown<Traits: PortInstance>() -> ! {
    log::trace!("shutdown requested");
    Traits::port_state().request_shutdown();
    std::panic::panic_any(ShutdownToken)
}

/// Bind a kernel instance to this port:
///
/// ```ignore
/// kestrel_port_std::use_port!(unsafe struct SystemTraits);
/// type System = kestrel_kernel::System<SystemTraits>;
/// ```
#[macro_export]
macro_rules! use_port {
    (unsafe struct $SystemTraits:ident) => {
        pub(crate) struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::kestrel_kernel::{Kernel, TaskEntry};
            use $crate::{PortInstance, State};

            pub(super) static PORT_STATE: State = State::new();
            pub(super) static KERNEL: Kernel<$SystemTraits> = Kernel::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            unsafe impl $crate::kestrel_kernel::Port for $SystemTraits {
                fn state() -> &'static Kernel<Self> {
                    &KERNEL
                }

                unsafe fn enter_cpu_lock() {
                    PORT_STATE.enter_cpu_lock()
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    PORT_STATE.try_enter_cpu_lock()
                }

                unsafe fn leave_cpu_lock() {
                    PORT_STATE.leave_cpu_lock()
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                unsafe fn yield_cpu() {
                    PORT_STATE.yield_cpu::<Self>()
                }

                unsafe fn dispatch_first_task(_stack_pointer: usize) -> ! {
                    PORT_STATE.dispatch_first_task::<Self>()
                }

                unsafe fn exit_and_dispatch() -> ! {
                    PORT_STATE.exit_and_dispatch::<Self>()
                }

                unsafe fn initialize_task_state(
                    slot: usize,
                    _stack: *mut u8,
                    stack_len: usize,
                    _entry: TaskEntry,
                    _param: usize,
                ) -> usize {
                    PORT_STATE.initialize_task_state(slot, stack_len)
                }

                unsafe fn tick_init(_tick_hz: u32) {
                    // Time is virtual; nothing to program.
                }

                unsafe fn wait_for_interrupt() {
                    PORT_STATE.wait_for_interrupt::<Self>()
                }
            }
        }
    };
}

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate kestrel_kernel;
