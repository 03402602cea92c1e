//! Tasks and the scheduler core.
use arrayvec::ArrayString;

use crate::cfg;
use crate::error::{
    CreateTaskError, DelayError, DeleteTaskError, QueryTaskError, SuspendTaskError,
};
use crate::klock::{self, CpuLockGuard};
use crate::pool::{stack_class_for, SizeClass};
use crate::state::{KernelState, Lifecycle};
use crate::timeout;
use crate::utils::intrusive_list::{Index, Link};
use crate::utils::Init;
use crate::{halt, Port, System, TaskId};

pub(crate) mod readyqueue;

/// A task entry point. The argument is the `param` value given at creation.
pub type TaskEntry = fn(usize);

/// Task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    /// On a ready queue, runnable.
    Ready,
    /// Owns the processor. At most one task is in this state.
    Running,
    /// Waiting on a synchronization object, a wake tick, or both.
    Blocked,
    /// Withheld from scheduling until resumed.
    Suspended,
    /// Dead; its slots are reclaimed, or pending reclamation by the idle
    /// task after a self-delete.
    Deleted,
}

impl Init for TaskSt {
    const INIT: Self = Self::Deleted;
}

/// Why a blocked task was made Ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeReason {
    None,
    /// A peer operation completed the wait (data arrived, a slot or token or
    /// the mutex became available).
    DataAvailable,
    /// The wake tick was reached.
    Timeout,
    /// The waited-on object was deleted.
    Signal,
}

impl Init for WakeReason {
    const INIT: Self = Self::None;
}

/// What a blocked task is waiting on. The index names a slot in the
/// respective object pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitSource {
    QueueSend(Index),
    QueueReceive(Index),
    Semaphore(Index),
    Mutex(Index),
}

/// The task's stack allocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StackRef {
    pub(crate) class: SizeClass,
    pub(crate) index: Index,
    /// Usable byte size (the backing slot's capacity).
    pub(crate) size: usize,
}

/// Scheduling statistics, informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStats {
    /// Number of times the task has been given the processor.
    pub run_count: u32,
    /// Ticks elapsed while the task owned the processor.
    pub total_runtime: u32,
}

/// *Task control block* - the state data of a task.
pub(crate) struct TaskCb {
    pub(crate) name: ArrayString<{ cfg::TASK_NAME_LEN }>,
    pub(crate) entry: Option<TaskEntry>,
    pub(crate) entry_param: usize,

    /// Saved top-of-stack while the task is switched out. Read and written by
    /// the context-switch path only.
    pub(crate) stack_pointer: usize,
    pub(crate) stack: Option<StackRef>,

    pub(crate) base_priority: u8,
    /// May be temporarily raised above `base_priority` by priority
    /// inheritance.
    pub(crate) effective_priority: u8,

    pub(crate) st: TaskSt,

    /// Absolute tick at which a pending delay or wait times out. Meaningful
    /// only while `delay_link` is linked.
    pub(crate) wake_tick: u32,
    pub(crate) wake_reason: WakeReason,
    pub(crate) waiting_on: Option<WaitSource>,

    /// Membership in a ready queue band.
    pub(crate) ready_link: Option<Link>,
    /// Membership in one of the delayed lists.
    pub(crate) delay_link: Option<Link>,
    /// Membership in a synchronization object's wait list.
    pub(crate) wait_link: Option<Link>,

    pub(crate) run_count: u32,
    pub(crate) total_runtime: u32,
}

impl Init for TaskCb {
    const INIT: Self = Self {
        name: Init::INIT,
        entry: None,
        entry_param: 0,
        stack_pointer: 0,
        stack: None,
        base_priority: 0,
        effective_priority: 0,
        st: TaskSt::Deleted,
        wake_tick: 0,
        wake_reason: WakeReason::None,
        waiting_on: None,
        ready_link: None,
        delay_link: None,
        wait_link: None,
        run_count: 0,
        total_runtime: 0,
    };
}

impl<Traits: Port> System<Traits> {
    /// Create a task and make it Ready.
    ///
    /// `stack_size == 0` selects the default stack size. The name is
    /// truncated to [`cfg::TASK_NAME_LEN`] bytes.
    pub fn task_create(
        entry: TaskEntry,
        name: &str,
        stack_size: usize,
        param: usize,
        priority: u8,
    ) -> Result<TaskId, CreateTaskError> {
        if name.is_empty() || !name.is_ascii() || priority > cfg::MAX_PRIORITY {
            return Err(CreateTaskError::BadParam);
        }
        let stack_size = if stack_size == 0 {
            cfg::DEFAULT_STACK_SIZE
        } else {
            stack_size
        };
        let class = stack_class_for(stack_size).ok_or(CreateTaskError::AllocationFailed)?;

        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.write(&mut *lock);
        if state.lifecycle == Lifecycle::Uninit {
            return Err(CreateTaskError::BadState);
        }

        let task = create_task_inner::<Traits>(state, entry, name, class, param, priority)?;

        if state.lifecycle == Lifecycle::Running {
            unlock_and_check_preemption(lock);
        }
        Ok(TaskId::from_index(task))
    }

    /// Delete a task and return its slots to their pools.
    ///
    /// Deleting the idle task is a no-op; deleting the calling task does not
    /// return. A task blocked on a synchronization object must be released
    /// (or its object deleted) before it can be deleted.
    pub fn task_delete(task: TaskId) -> Result<(), DeleteTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.write(&mut *lock);
        let idx = task.index();
        if !state.tasks.is_live(usize::from(idx)) {
            return Err(DeleteTaskError::Null);
        }
        if state.idle_task == Some(idx) {
            return Ok(());
        }

        if state.current_task == Some(idx) {
            // Self-delete. The stack being executed on cannot be freed here;
            // mark the task dead and let the idle task reclaim the slots.
            state.tasks.slots_mut()[usize::from(idx)].st = TaskSt::Deleted;
            timeout::cancel(state, idx);
            drop(lock);
            // Safety: CPU Lock inactive; the calling task is Deleted and
            // removed from all scheduler lists
            unsafe { Traits::exit_and_dispatch() }
        }

        match state.tasks.slots()[usize::from(idx)].st {
            TaskSt::Blocked => return Err(DeleteTaskError::BadState),
            TaskSt::Ready => {
                state.ready.remove(state.tasks.slots_mut(), idx);
            }
            TaskSt::Suspended => {}
            // Self-deleted earlier, pending reclamation
            TaskSt::Deleted => return Err(DeleteTaskError::Null),
            // `Running` implies `current_task`, handled above
            TaskSt::Running => return Err(DeleteTaskError::BadState),
        }
        timeout::cancel(state, idx);

        let tcb = &mut state.tasks.slots_mut()[usize::from(idx)];
        tcb.st = TaskSt::Deleted;
        let stack = tcb.stack.take();
        if let Some(stack) = stack {
            state.free_stack(stack.class, stack.index);
        }
        state.tasks.free(usize::from(idx));
        Ok(())
    }

    /// Block the calling task for `ticks` tick periods.
    ///
    /// `ticks` must be non-zero and no greater than half the tick counter
    /// range.
    pub fn task_delay(ticks: u32) -> Result<(), DelayError> {
        if ticks == 0 || ticks > i32::MAX as u32 {
            return Err(DelayError::BadParam);
        }
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.write(&mut *lock);
        let me = state.current_task.ok_or(DelayError::BadState)?;

        let wake = state.tick_now.wrapping_add(ticks);
        {
            let tcb = &mut state.tasks.slots_mut()[usize::from(me)];
            tcb.wake_reason = WakeReason::None;
            tcb.st = TaskSt::Blocked;
        }
        timeout::arm(state, me, wake);
        wait_until_woken_up(&mut lock, me);
        Ok(())
    }

    /// Relinquish the processor, rotating to the next task of the same
    /// priority band.
    pub fn task_yield() {
        let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
            return;
        };
        let state = Traits::state().body.write(&mut *lock);
        if state.lifecycle != Lifecycle::Running {
            return;
        }
        let Some(me) = state.current_task else {
            return;
        };
        if state.tasks.slots()[usize::from(me)].st == TaskSt::Running {
            state.tasks.slots_mut()[usize::from(me)].st = TaskSt::Ready;
            state.ready.push_back(state.tasks.slots_mut(), me);
        }
        state.next_task = state.ready.front();
        drop(lock);
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() }
    }

    /// Withhold a task from scheduling until [`task_resume`](Self::task_resume).
    ///
    /// Blocked tasks and the idle task cannot be suspended.
    pub fn task_suspend(task: TaskId) -> Result<(), SuspendTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.write(&mut *lock);
        let idx = task.index();
        if !state.tasks.is_live(usize::from(idx)) {
            return Err(SuspendTaskError::Null);
        }
        if state.idle_task == Some(idx) {
            return Err(SuspendTaskError::BadState);
        }
        match state.tasks.slots()[usize::from(idx)].st {
            TaskSt::Suspended => Ok(()),
            TaskSt::Ready => {
                state.ready.remove(state.tasks.slots_mut(), idx);
                state.tasks.slots_mut()[usize::from(idx)].st = TaskSt::Suspended;
                Ok(())
            }
            TaskSt::Running => {
                // Only the current task can be Running.
                state.tasks.slots_mut()[usize::from(idx)].st = TaskSt::Suspended;
                wait_until_woken_up(&mut lock, idx);
                Ok(())
            }
            TaskSt::Blocked => Err(SuspendTaskError::BadState),
            TaskSt::Deleted => Err(SuspendTaskError::Null),
        }
    }

    /// Return a suspended task to the Ready state.
    pub fn task_resume(task: TaskId) -> Result<(), SuspendTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.write(&mut *lock);
        let idx = task.index();
        if !state.tasks.is_live(usize::from(idx)) {
            return Err(SuspendTaskError::Null);
        }
        if state.tasks.slots()[usize::from(idx)].st != TaskSt::Suspended {
            return Err(SuspendTaskError::BadState);
        }
        make_ready(state, idx, WakeReason::None);
        unlock_and_check_preemption(lock);
        Ok(())
    }

    /// The calling task's handle.
    pub fn task_current() -> Option<TaskId> {
        let lock = klock::lock_cpu::<Traits>().ok()?;
        let state = Traits::state().body.read(&*lock);
        state.current_task.map(TaskId::from_index)
    }

    pub fn task_base_priority(task: TaskId) -> Result<u8, QueryTaskError> {
        Self::query_task(task, |t| t.base_priority)
    }

    pub fn task_effective_priority(task: TaskId) -> Result<u8, QueryTaskError> {
        Self::query_task(task, |t| t.effective_priority)
    }

    pub fn task_state(task: TaskId) -> Result<TaskSt, QueryTaskError> {
        Self::query_task(task, |t| t.st)
    }

    pub fn task_name(task: TaskId) -> Result<ArrayString<{ cfg::TASK_NAME_LEN }>, QueryTaskError> {
        Self::query_task(task, |t| t.name)
    }

    /// The usable size of the task's stack (its backing slot's capacity).
    pub fn task_stack_size(task: TaskId) -> Result<usize, QueryTaskError> {
        Self::query_task(task, |t| t.stack.map_or(0, |s| s.size))
    }

    pub fn task_stats(task: TaskId) -> Result<TaskStats, QueryTaskError> {
        Self::query_task(task, |t| TaskStats {
            run_count: t.run_count,
            total_runtime: t.total_runtime,
        })
    }

    fn query_task<R>(task: TaskId, f: impl FnOnce(&TaskCb) -> R) -> Result<R, QueryTaskError> {
        let lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.read(&*lock);
        state
            .tasks
            .get(usize::from(task.index()))
            .map(f)
            .ok_or(QueryTaskError::Null)
    }
}

/// Allocate and initialize a TCB and stack, and enqueue the new task.
/// The caller is responsible for the preemption check.
pub(crate) fn create_task_inner<Traits: Port>(
    state: &mut KernelState,
    entry: TaskEntry,
    name: &str,
    class: SizeClass,
    param: usize,
    priority: u8,
) -> Result<Index, CreateTaskError> {
    let task = state
        .tasks
        .alloc()
        .ok_or(CreateTaskError::AllocationFailed)?;
    let Some(stack) = state.alloc_stack(class) else {
        state.tasks.free(usize::from(task));
        return Err(CreateTaskError::AllocationFailed);
    };
    let Some((stack_ptr, stack_len)) = state.stack_storage(class, stack) else {
        state.free_stack(class, stack);
        state.tasks.free(usize::from(task));
        return Err(CreateTaskError::AllocationFailed);
    };

    // Pre-fill the stack as if the task had just been switched out, so the
    // first dispatch resumes straight into `entry(param)`.
    //
    // Safety: CPU Lock active, the stack slot was just allocated and nothing
    // else aliases it
    let initial_sp =
        unsafe { Traits::initialize_task_state(usize::from(task), stack_ptr, stack_len, entry, param) };

    let mut truncated = name;
    if truncated.len() > cfg::TASK_NAME_LEN {
        truncated = &truncated[..cfg::TASK_NAME_LEN];
    }

    let tcb = &mut state.tasks.slots_mut()[usize::from(task)];
    *tcb = TaskCb::INIT;
    let _ = tcb.name.try_push_str(truncated);
    tcb.entry = Some(entry);
    tcb.entry_param = param;
    tcb.stack_pointer = initial_sp;
    tcb.stack = Some(StackRef {
        class,
        index: stack,
        size: stack_len,
    });
    tcb.base_priority = priority;
    tcb.effective_priority = priority;
    tcb.st = TaskSt::Ready;
    state.ready.push_back(state.tasks.slots_mut(), task);

    Ok(task)
}

/// Transition a task into the Ready state and enqueue it.
pub(crate) fn make_ready(state: &mut KernelState, task: Index, reason: WakeReason) {
    let tcb = &mut state.tasks.slots_mut()[usize::from(task)];
    tcb.wake_reason = reason;
    tcb.st = TaskSt::Ready;
    state.ready.push_back(state.tasks.slots_mut(), task);
}

/// Raise `task`'s effective priority to `new` (numerically lower), relinking
/// it within the ready queues if needed.
pub(crate) fn boost_priority(state: &mut KernelState, task: Index, new: u8) {
    let st = state.tasks.slots()[usize::from(task)].st;
    if st == TaskSt::Ready {
        state.ready.remove(state.tasks.slots_mut(), task);
        state.tasks.slots_mut()[usize::from(task)].effective_priority = new;
        state.ready.push_back(state.tasks.slots_mut(), task);
    } else {
        state.tasks.slots_mut()[usize::from(task)].effective_priority = new;
    }
}

/// Revert `task`'s effective priority to `original` after inheritance ends.
pub(crate) fn restore_priority(state: &mut KernelState, task: Index, original: u8) {
    boost_priority(state, task, original);
}

/// The scheduling decision. Called from the dispatch path with the CPU Lock
/// held; updates `current_task`/`next_task` and the affected task states.
pub(crate) fn choose_running_task_core(state: &mut KernelState) {
    if let Some(cur) = state.current_task {
        if state.tasks.slots()[usize::from(cur)].st == TaskSt::Running {
            let cur_pri = usize::from(state.tasks.slots()[usize::from(cur)].effective_priority);
            match state.ready.front_priority() {
                Some(p) if p < cur_pri => {
                    // Preempted: the task keeps its turn, so it goes back to
                    // the head of its band rather than the tail.
                    state.tasks.slots_mut()[usize::from(cur)].st = TaskSt::Ready;
                    state.ready.push_front(state.tasks.slots_mut(), cur);
                }
                _ => {
                    state.next_task = state.current_task;
                    return;
                }
            }
        }
    }

    match state.ready.pop_front(state.tasks.slots_mut()) {
        Some(next) => {
            let tcb = &mut state.tasks.slots_mut()[usize::from(next)];
            tcb.st = TaskSt::Running;
            tcb.run_count = tcb.run_count.wrapping_add(1);
            state.current_task = Some(next);
            state.next_task = Some(next);
        }
        None => {
            // Nothing runnable. Once the idle task exists this is unreachable;
            // leave `current_task` as is.
            state.next_task = state.current_task;
        }
    }
}

/// Whether a Ready task outranks the current task (numerically lower
/// effective priority). Updates `next_task` when it does.
fn preemption_needed(state: &mut KernelState) -> bool {
    let Some(cur) = state.current_task else {
        return false;
    };
    if state.tasks.slots()[usize::from(cur)].st != TaskSt::Running {
        return true;
    }
    let cur_pri = usize::from(state.tasks.slots()[usize::from(cur)].effective_priority);
    match state.ready.front_priority() {
        Some(p) if p < cur_pri => {
            state.next_task = state.ready.front();
            true
        }
        _ => false,
    }
}

/// Relinquish CPU Lock. After that, if there's a higher-priority Ready task
/// than the current one, request a context switch.
///
/// Operations that transition a task into the Ready state call this before
/// returning to the caller.
pub(crate) fn unlock_and_check_preemption<Traits: Port>(mut lock: CpuLockGuard<Traits>) {
    let state = Traits::state().body.write(&mut *lock);
    if state.lifecycle != Lifecycle::Running {
        return;
    }
    let should_yield = preemption_needed(state);
    drop(lock);
    if should_yield {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() }
    }
}

/// Park the current task until the dispatcher hands the processor back.
///
/// The caller has already moved the task out of the Running state (Blocked or
/// Suspended) and linked it wherever it is to be found again. Returns with
/// the CPU Lock guard re-held once the task is Running again.
pub(crate) fn wait_until_woken_up<Traits: Port>(lock: &mut CpuLockGuard<Traits>, me: Index) {
    loop {
        // Temporarily release the CPU Lock before requesting the dispatch.
        // Safety: we re-enter the CPU Lock state below, before touching any
        // protected state again.
        unsafe { Traits::leave_cpu_lock() };
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
        unsafe { Traits::enter_cpu_lock() };

        let state = Traits::state().body.write(&mut **lock);
        if state.current_task == Some(me)
            && state.tasks.slots()[usize::from(me)].st == TaskSt::Running
        {
            break;
        }
    }
}

/// Return the slots of self-deleted tasks to their pools. Runs in the idle
/// task, which is the only context where the dead task's stack is guaranteed
/// not to be in use.
pub(crate) fn reclaim_deleted_tasks(state: &mut KernelState) {
    for i in 0..cfg::MAX_TASKS {
        if !state.tasks.is_live(i) {
            continue;
        }
        if state.current_task == Some(i as Index) {
            continue;
        }
        if state.tasks.slots()[i].st != TaskSt::Deleted {
            continue;
        }
        let stack = state.tasks.slots_mut()[i].stack.take();
        if let Some(stack) = stack {
            state.free_stack(stack.class, stack.index);
        }
        state.tasks.free(i);
    }
}

/// The idle task. Always Ready, never blocks, never deleted. Reclaims
/// self-deleted tasks and sleeps the processor when no other task can run.
pub(crate) fn idle_task_body<Traits: Port>(_param: usize) {
    loop {
        if let Ok(mut lock) = klock::lock_cpu::<Traits>() {
            let state = Traits::state().body.write(&mut *lock);
            reclaim_deleted_tasks(state);
            let runnable = state.ready.front_priority().is_some();
            drop(lock);
            if !runnable {
                // Safety: CPU Lock inactive, idle task context
                unsafe { Traits::wait_for_interrupt() };
            }
        }
        System::<Traits>::task_yield();
    }
}

/// Boot-time idle task creation. Failure leaves the kernel unable to
/// schedule, which is fatal.
pub(crate) fn create_idle_task<Traits: Port>(state: &mut KernelState) {
    match create_task_inner::<Traits>(
        state,
        idle_task_body::<Traits>,
        "idle",
        SizeClass::Small,
        0,
        cfg::MAX_PRIORITY,
    ) {
        Ok(idx) => state.idle_task = Some(idx),
        Err(_) => halt(),
    }
}
