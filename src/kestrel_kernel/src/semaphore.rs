//! Counting and binary semaphores.
//!
//! A post with waiters hands the token directly to the longest-waiting task
//! instead of incrementing the count; the released task completes its wait
//! without re-examining the count. This keeps `count + waiters ≤ max` at all
//! times and prevents a stale count from shadowing a live waiter.
use arrayvec::ArrayString;

use crate::cfg;
use crate::error::{
    CreateSemaphoreError, DeleteSemaphoreError, PostSemaphoreError, QuerySemaphoreError,
    WaitSemaphoreError,
};
use crate::klock;
use crate::task::{self, WaitSource};
use crate::time;
use crate::utils::intrusive_list::ListHead;
use crate::utils::Init;
use crate::wait::{self, WaitOutcome};
use crate::{Port, SemaphoreId, System};

/// *Semaphore control block* - the state data of a semaphore.
pub(crate) struct SemaphoreCb {
    pub(crate) count: u32,
    pub(crate) max_count: u32,
    pub(crate) name: ArrayString<{ cfg::TASK_NAME_LEN }>,
    pub(crate) waiters: ListHead,
}

impl Init for SemaphoreCb {
    const INIT: Self = Self {
        count: 0,
        max_count: 0,
        name: Init::INIT,
        waiters: Init::INIT,
    };
}

impl<Traits: Port> System<Traits> {
    /// Create a semaphore with the given initial and maximum count.
    pub fn sem_create(
        initial: u32,
        max: u32,
        name: &str,
    ) -> Result<SemaphoreId, CreateSemaphoreError> {
        if max == 0 || initial > max || !name.is_ascii() {
            return Err(CreateSemaphoreError::BadParam);
        }
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.write(&mut *lock);
        let sem = state
            .semaphores
            .alloc()
            .ok_or(CreateSemaphoreError::AllocationFailed)?;
        let scb = &mut state.semaphores.slots_mut()[usize::from(sem)];
        scb.count = initial;
        scb.max_count = max;
        let mut truncated = name;
        if truncated.len() > cfg::TASK_NAME_LEN {
            truncated = &truncated[..cfg::TASK_NAME_LEN];
        }
        let _ = scb.name.try_push_str(truncated);
        Ok(SemaphoreId::from_index(sem))
    }

    /// A binary semaphore: one token, initially available.
    pub fn sem_binary(name: &str) -> Result<SemaphoreId, CreateSemaphoreError> {
        Self::sem_create(1, 1, name)
    }

    /// A counting semaphore with no tokens initially available.
    pub fn sem_counting(max: u32, name: &str) -> Result<SemaphoreId, CreateSemaphoreError> {
        Self::sem_create(0, max, name)
    }

    /// Delete a semaphore, releasing every waiter with `ObjectDeleted`.
    pub fn sem_delete(sem: SemaphoreId) -> Result<(), DeleteSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.write(&mut *lock);
        let si = sem.index();
        if !state.semaphores.is_live(usize::from(si)) {
            return Err(DeleteSemaphoreError::Null);
        }
        wait::wake_all_signal(state, WaitSource::Semaphore(si));
        state.semaphores.free(usize::from(si));
        task::unlock_and_check_preemption(lock);
        Ok(())
    }

    /// Take one token, blocking for up to `timeout` ticks while none is
    /// available.
    pub fn sem_wait(sem: SemaphoreId, timeout: u32) -> Result<(), WaitSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let si = sem.index();

        let deadline = {
            let state = Traits::state().body.write(&mut *lock);
            if !state.semaphores.is_live(usize::from(si)) {
                return Err(WaitSemaphoreError::Null);
            }
            if timeout == cfg::WAIT_FOREVER {
                None
            } else {
                Some(state.tick_now.wrapping_add(timeout))
            }
        };

        loop {
            let state = Traits::state().body.write(&mut *lock);
            let Some(scb) = state.semaphores.get_mut(usize::from(si)) else {
                return Err(WaitSemaphoreError::Null);
            };
            if scb.count > 0 {
                scb.count -= 1;
                return Ok(());
            }
            if timeout == cfg::NO_WAIT {
                return Err(WaitSemaphoreError::Timeout);
            }
            if let Some(deadline) = deadline {
                if time::ticks_until(deadline, state.tick_now) == 0 {
                    return Err(WaitSemaphoreError::Timeout);
                }
            }
            match wait::wait_current(&mut lock, WaitSource::Semaphore(si), deadline) {
                // A post handed the token over directly; the wait is complete.
                WaitOutcome::Woken => return Ok(()),
                WaitOutcome::TimedOut => return Err(WaitSemaphoreError::Timeout),
                WaitOutcome::Deleted => return Err(WaitSemaphoreError::ObjectDeleted),
            }
        }
    }

    /// [`sem_wait`](Self::sem_wait) that never blocks.
    pub fn sem_try_wait(sem: SemaphoreId) -> Result<(), WaitSemaphoreError> {
        Self::sem_wait(sem, cfg::NO_WAIT)
    }

    /// Return one token. With waiters present the token is handed to the
    /// first waiter; otherwise the count is incremented, failing with
    /// `Overflow` at the maximum.
    pub fn sem_post(sem: SemaphoreId) -> Result<(), PostSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.write(&mut *lock);
        let si = sem.index();
        if !state.semaphores.is_live(usize::from(si)) {
            return Err(PostSemaphoreError::Null);
        }
        if wait::wake_one(state, WaitSource::Semaphore(si)).is_some() {
            task::unlock_and_check_preemption(lock);
            return Ok(());
        }
        let scb = &mut state.semaphores.slots_mut()[usize::from(si)];
        if scb.count < scb.max_count {
            scb.count += 1;
            Ok(())
        } else {
            Err(PostSemaphoreError::Overflow)
        }
    }

    pub fn sem_get_count(sem: SemaphoreId) -> Result<u32, QuerySemaphoreError> {
        let lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.read(&*lock);
        state
            .semaphores
            .get(usize::from(sem.index()))
            .map(|s| s.count)
            .ok_or(QuerySemaphoreError::Null)
    }

    pub fn sem_has_waiting_tasks(sem: SemaphoreId) -> Result<bool, QuerySemaphoreError> {
        let lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.read(&*lock);
        state
            .semaphores
            .get(usize::from(sem.index()))
            .map(|s| !s.waiters.is_empty())
            .ok_or(QuerySemaphoreError::Null)
    }

    pub fn sem_name(
        sem: SemaphoreId,
    ) -> Result<ArrayString<{ cfg::TASK_NAME_LEN }>, QuerySemaphoreError> {
        let lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.read(&*lock);
        state
            .semaphores
            .get(usize::from(sem.index()))
            .map(|s| s.name)
            .ok_or(QuerySemaphoreError::Null)
    }
}
