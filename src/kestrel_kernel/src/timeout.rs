//! Tick processing and the delayed lists.
//!
//! Tasks with a pending wake tick sit on one of two lists sorted by ascending
//! wake tick. `delayed_current` holds wake ticks in the current epoch of the
//! 32-bit tick counter; `delayed_overflow` holds wake ticks past the next
//! counter wrap. When the counter wraps to zero the two list heads are
//! swapped, which retires the old (empty) epoch and promotes the overflow
//! entries in O(1) instead of re-sorting anything.
//!
//! A task can be on a delayed list and a wait list at the same time (a
//! blocking operation with a deadline); whichever event fires first unlinks
//! the task from the other list.
use crate::state::KernelState;
use crate::task::{self, TaskSt, WakeReason};
use crate::time;
use crate::utils::intrusive_list::{Index, Link, ListAccessor};

fn delay_link(t: &mut task::TaskCb) -> &mut Option<Link> {
    &mut t.delay_link
}

/// Arm a wake tick for `task`: store it and insert the task into the delayed
/// list for the wake tick's epoch, keeping the list sorted.
pub(crate) fn arm(state: &mut KernelState, task: Index, wake_tick: u32) {
    state.tasks.slots_mut()[usize::from(task)].wake_tick = wake_tick;

    // A wake tick numerically below the current tick lies beyond the wrap.
    let now = state.tick_now;
    let head = if wake_tick < now {
        &mut state.delayed_overflow
    } else {
        &mut state.delayed_current
    };

    let tasks = state.tasks.slots_mut();
    // Sorted insert: before the first entry waking strictly later, so equal
    // wake ticks stay in arrival order. Linear scan; the task count is small.
    let mut insert_at = None;
    let mut cur = head.first;
    while let Some(i) = cur {
        let t = &tasks[usize::from(i)];
        if time::lt(wake_tick, t.wake_tick) {
            insert_at = Some(i);
            break;
        }
        cur = t.delay_link.and_then(|l| l.next);
    }
    let r = ListAccessor::new(head, tasks, delay_link).insert(task, insert_at);
    debug_assert!(r.is_ok());
}

/// Disarm `task`'s wake tick, if armed.
pub(crate) fn cancel(state: &mut KernelState, task: Index) {
    if state.tasks.slots_mut()[usize::from(task)].delay_link.is_none() {
        return;
    }
    let wake_tick = state.tasks.slots()[usize::from(task)].wake_tick;
    let now = state.tick_now;
    let (first, second) = if wake_tick < now {
        (&mut state.delayed_overflow, &mut state.delayed_current)
    } else {
        (&mut state.delayed_current, &mut state.delayed_overflow)
    };
    let tasks = state.tasks.slots_mut();
    if ListAccessor::new(first, tasks, delay_link).remove(task).is_err() {
        // The entry predates a tick counter adjustment; it can only be on
        // the other list.
        let r = ListAccessor::new(second, tasks, delay_link).remove(task);
        debug_assert!(r.is_ok());
    }
}

/// Wake `task` because its wake tick was reached: leave any wait list it is
/// on with `WakeReason::Timeout` and make it Ready. The delayed-list link has
/// already been removed by the caller.
fn expire(state: &mut KernelState, task: Index) {
    if let Some(source) = state.tasks.slots_mut()[usize::from(task)].waiting_on.take() {
        state.wait_list_remove(source, task);
    }
    debug_assert_eq!(state.tasks.slots()[usize::from(task)].st, TaskSt::Blocked);
    task::make_ready(state, task, WakeReason::Timeout);
}

/// Release every task on `delayed_current` whose wake tick has been reached.
fn drain_expired(state: &mut KernelState) {
    let now = state.tick_now;
    loop {
        let Some(head) = state.delayed_current.first else {
            break;
        };
        if !time::lte(state.tasks.slots()[usize::from(head)].wake_tick, now) {
            break;
        }
        let r = ListAccessor::new(
            &mut state.delayed_current,
            state.tasks.slots_mut(),
            delay_link,
        )
        .remove(head);
        debug_assert!(r.is_ok());
        expire(state, head);
    }
}

/// The tick entry point body: advance the counter, account runtime, release
/// expired waits, and swap the delayed lists at counter wrap.
pub(crate) fn handle_tick(state: &mut KernelState) {
    state.tick_now = state.tick_now.wrapping_add(1);

    if let Some(cur) = state.current_task {
        let t = &mut state.tasks.slots_mut()[usize::from(cur)];
        t.total_runtime = t.total_runtime.wrapping_add(1);
    }

    drain_expired(state);

    if state.tick_now == 0 {
        // New epoch: the retiring list is fully drained, so a head swap
        // promotes every overflow entry at once.
        core::mem::swap(&mut state.delayed_current, &mut state.delayed_overflow);
        drain_expired(state);
    }
}
