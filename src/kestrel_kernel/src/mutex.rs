//! Mutexes with basic priority inheritance.
//!
//! While a task waits on a locked mutex, the owner's effective priority is
//! raised to the highest (numerically lowest) priority among the waiters, so
//! a medium-priority task cannot starve the owner out from under a
//! high-priority waiter. The boost is a single step: a boosted owner that is
//! itself blocked on another mutex does not propagate the boost further.
//!
//! Unlocking does not transfer ownership. The first waiter is released and
//! re-enters `lock`, acquiring through the ordinary free fast path; this
//! keeps every blocking path a single uniform wait loop.
//!
//! Recursive locking by the owner is rejected.
use arrayvec::ArrayString;

use crate::cfg;
use crate::error::{
    CreateMutexError, DeleteMutexError, LockMutexError, QueryMutexError, UnlockMutexError,
};
use crate::klock;
use crate::task::{self, WaitSource};
use crate::time;
use crate::utils::intrusive_list::{Index, ListHead};
use crate::utils::Init;
use crate::wait::{self, WaitOutcome};
use crate::{MutexId, Port, System, TaskId};

/// *Mutex control block* - the state data of a mutex.
pub(crate) struct MutexCb {
    pub(crate) owner: Option<Index>,
    /// The owner's base priority snapshot taken when inheritance was first
    /// applied. `None` means no inheritance is in effect.
    pub(crate) saved_priority: Option<u8>,
    pub(crate) name: ArrayString<{ cfg::TASK_NAME_LEN }>,
    pub(crate) waiters: ListHead,
}

impl Init for MutexCb {
    const INIT: Self = Self {
        owner: None,
        saved_priority: None,
        name: Init::INIT,
        waiters: Init::INIT,
    };
}

impl<Traits: Port> System<Traits> {
    pub fn mutex_create(name: &str) -> Result<MutexId, CreateMutexError> {
        if !name.is_ascii() {
            return Err(CreateMutexError::BadParam);
        }
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.write(&mut *lock);
        let mutex = state
            .mutexes
            .alloc()
            .ok_or(CreateMutexError::AllocationFailed)?;
        let mcb = &mut state.mutexes.slots_mut()[usize::from(mutex)];
        let mut truncated = name;
        if truncated.len() > cfg::TASK_NAME_LEN {
            truncated = &truncated[..cfg::TASK_NAME_LEN];
        }
        let _ = mcb.name.try_push_str(truncated);
        Ok(MutexId::from_index(mutex))
    }

    /// Delete a mutex. The owner's inherited priority is reverted and every
    /// waiter is released with `ObjectDeleted`.
    pub fn mutex_delete(mutex: MutexId) -> Result<(), DeleteMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.write(&mut *lock);
        let mi = mutex.index();
        if !state.mutexes.is_live(usize::from(mi)) {
            return Err(DeleteMutexError::Null);
        }

        let mcb = &mut state.mutexes.slots_mut()[usize::from(mi)];
        let owner = mcb.owner.take();
        let saved = mcb.saved_priority.take();
        if let (Some(owner), Some(original)) = (owner, saved) {
            task::restore_priority(state, owner, original);
        }

        wait::wake_all_signal(state, WaitSource::Mutex(mi));
        state.mutexes.free(usize::from(mi));
        task::unlock_and_check_preemption(lock);
        Ok(())
    }

    /// Acquire the mutex, blocking for up to `timeout` ticks while another
    /// task owns it. Locking a mutex the caller already owns fails with
    /// `Recursive`.
    pub fn mutex_lock(mutex: MutexId, timeout: u32) -> Result<(), LockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let mi = mutex.index();

        let deadline = {
            let state = Traits::state().body.write(&mut *lock);
            if !state.mutexes.is_live(usize::from(mi)) {
                return Err(LockMutexError::Null);
            }
            if timeout == cfg::WAIT_FOREVER {
                None
            } else {
                Some(state.tick_now.wrapping_add(timeout))
            }
        };

        loop {
            let state = Traits::state().body.write(&mut *lock);
            let me = state.current_task.ok_or(LockMutexError::BadState)?;
            let Some(mcb) = state.mutexes.get_mut(usize::from(mi)) else {
                return Err(LockMutexError::Null);
            };
            match mcb.owner {
                None => {
                    mcb.owner = Some(me);
                    return Ok(());
                }
                Some(owner) if owner == me => return Err(LockMutexError::Recursive),
                Some(owner) => {
                    if timeout == cfg::NO_WAIT {
                        return Err(LockMutexError::Timeout);
                    }
                    if let Some(deadline) = deadline {
                        if time::ticks_until(deadline, state.tick_now) == 0 {
                            return Err(LockMutexError::Timeout);
                        }
                    }

                    // Priority inheritance: the owner runs at the highest
                    // priority of any waiter, this task included.
                    let me_pri = state.tasks.slots()[usize::from(me)].effective_priority;
                    let top = state
                        .wait_list_top_priority(WaitSource::Mutex(mi))
                        .map_or(me_pri, |t| t.min(me_pri));
                    let owner_pri = state.tasks.slots()[usize::from(owner)].effective_priority;
                    if top < owner_pri {
                        let mcb = &mut state.mutexes.slots_mut()[usize::from(mi)];
                        if mcb.saved_priority.is_none() {
                            mcb.saved_priority =
                                Some(state.tasks.slots()[usize::from(owner)].base_priority);
                        }
                        task::boost_priority(state, owner, top);
                    }

                    match wait::wait_current(&mut lock, WaitSource::Mutex(mi), deadline) {
                        // The mutex was released; retry the acquisition.
                        WaitOutcome::Woken => continue,
                        WaitOutcome::TimedOut => return Err(LockMutexError::Timeout),
                        WaitOutcome::Deleted => return Err(LockMutexError::ObjectDeleted),
                    }
                }
            }
        }
    }

    /// [`mutex_lock`](Self::mutex_lock) that never blocks.
    pub fn mutex_try_lock(mutex: MutexId) -> Result<(), LockMutexError> {
        Self::mutex_lock(mutex, cfg::NO_WAIT)
    }

    /// Release the mutex. Fails with `NotOwner` when the caller does not own
    /// it. Any priority inheritance is reverted before the next waiter is
    /// released.
    pub fn mutex_unlock(mutex: MutexId) -> Result<(), UnlockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.write(&mut *lock);
        let mi = mutex.index();
        let me = state.current_task.ok_or(UnlockMutexError::BadState)?;
        let Some(mcb) = state.mutexes.get_mut(usize::from(mi)) else {
            return Err(UnlockMutexError::Null);
        };
        if mcb.owner != Some(me) {
            return Err(UnlockMutexError::NotOwner);
        }

        mcb.owner = None;
        let saved = mcb.saved_priority.take();
        if let Some(original) = saved {
            task::restore_priority(state, me, original);
        }

        // The released waiter re-enters `mutex_lock` and takes the free fast
        // path; ownership is not assigned here.
        wait::wake_one(state, WaitSource::Mutex(mi));
        task::unlock_and_check_preemption(lock);
        Ok(())
    }

    pub fn mutex_get_owner(mutex: MutexId) -> Result<Option<TaskId>, QueryMutexError> {
        Self::query_mutex(mutex, |m| m.owner.map(TaskId::from_index))
    }

    pub fn mutex_is_locked(mutex: MutexId) -> Result<bool, QueryMutexError> {
        Self::query_mutex(mutex, |m| m.owner.is_some())
    }

    pub fn mutex_has_waiting_tasks(mutex: MutexId) -> Result<bool, QueryMutexError> {
        Self::query_mutex(mutex, |m| !m.waiters.is_empty())
    }

    pub fn mutex_name(
        mutex: MutexId,
    ) -> Result<ArrayString<{ cfg::TASK_NAME_LEN }>, QueryMutexError> {
        Self::query_mutex(mutex, |m| m.name)
    }

    fn query_mutex<R>(mutex: MutexId, f: impl FnOnce(&MutexCb) -> R) -> Result<R, QueryMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.read(&*lock);
        state
            .mutexes
            .get(usize::from(mutex.index()))
            .map(f)
            .ok_or(QueryMutexError::Null)
    }
}
