//! The blocking protocol shared by queues, semaphores and mutexes.
//!
//! Every blocking operation follows the same shape: evaluate the fast path
//! under the CPU Lock; if it cannot complete, join the object's FIFO wait
//! list (optionally arming a deadline) and give up the processor. The waker
//! (a peer operation, the tick handler, or object deletion) unlinks the
//! task, records the wake reason, and makes it Ready. The woken task maps
//! the reason to its own return value and, for a `Woken` outcome, re-runs
//! its fast path.
use crate::klock::CpuLockGuard;
use crate::state::KernelState;
use crate::task::{self, TaskSt, WaitSource, WakeReason};
use crate::timeout;
use crate::utils::intrusive_list::Index;
use crate::Port;

/// How a wait ended, from the waiting task's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// Released by a peer operation. The caller re-evaluates its fast path
    /// (or, where the release hands over the resource directly, completes).
    Woken,
    /// The deadline passed.
    TimedOut,
    /// The object was deleted while the task was waiting.
    Deleted,
}

/// Join `source`'s wait list and block the calling task, waking at
/// `deadline` if one is given. Returns with the CPU Lock guard re-held.
pub(crate) fn wait_current<Traits: Port>(
    lock: &mut CpuLockGuard<Traits>,
    source: WaitSource,
    deadline: Option<u32>,
) -> WaitOutcome {
    let state = Traits::state().body.write(&mut **lock);
    let Some(me) = state.current_task else {
        // No task context to block; treat as an elapsed deadline.
        return WaitOutcome::TimedOut;
    };

    {
        let tcb = &mut state.tasks.slots_mut()[usize::from(me)];
        debug_assert_eq!(tcb.st, TaskSt::Running);
        tcb.wake_reason = WakeReason::None;
        tcb.waiting_on = Some(source);
    }
    let pushed = state.wait_list_push(source, me);
    debug_assert!(pushed);
    if let Some(deadline) = deadline {
        timeout::arm(state, me, deadline);
    }
    state.tasks.slots_mut()[usize::from(me)].st = TaskSt::Blocked;

    task::wait_until_woken_up(lock, me);

    let state = Traits::state().body.write(&mut **lock);
    let tcb = &state.tasks.slots()[usize::from(me)];
    // Whoever woke the task is responsible for unlinking it everywhere.
    debug_assert!(tcb.wait_link.is_none());
    debug_assert!(tcb.delay_link.is_none());
    debug_assert!(tcb.waiting_on.is_none());
    match tcb.wake_reason {
        WakeReason::Timeout => WaitOutcome::TimedOut,
        WakeReason::Signal => WaitOutcome::Deleted,
        WakeReason::DataAvailable | WakeReason::None => WaitOutcome::Woken,
    }
}

/// Release the longest-waiting task of `source`, if any: unlink it, cancel
/// its deadline, record `DataAvailable`, and make it Ready.
///
/// This may make a task Ready but does not yield the processor; the caller
/// ends with `unlock_and_check_preemption`.
pub(crate) fn wake_one(state: &mut KernelState, source: WaitSource) -> Option<Index> {
    let task = state.wait_list_pop(source)?;
    finish_wake(state, task, WakeReason::DataAvailable);
    Some(task)
}

/// Release every waiter of `source` with `WakeReason::Signal`. Used when the
/// object is deleted; each waiter's blocked call reports `ObjectDeleted`.
pub(crate) fn wake_all_signal(state: &mut KernelState, source: WaitSource) {
    while let Some(task) = state.wait_list_pop(source) {
        finish_wake(state, task, WakeReason::Signal);
    }
}

fn finish_wake(state: &mut KernelState, task: Index, reason: WakeReason) {
    timeout::cancel(state, task);
    state.tasks.slots_mut()[usize::from(task)].waiting_on = None;
    debug_assert_eq!(state.tasks.slots()[usize::from(task)].st, TaskSt::Blocked);
    task::make_ready(state, task, reason);
}
