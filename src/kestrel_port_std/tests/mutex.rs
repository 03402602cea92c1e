//! Mutex semantics: ownership, priority inheritance, deletion.
use std::sync::{Mutex, OnceLock};

use kestrel_kernel::cfg;
use kestrel_kernel::{LockMutexError, MutexId, PoolId, TaskId, UnlockMutexError};

mod ownership {
    use super::*;

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    type System = kestrel_kernel::System<SystemTraits>;

    static MUTEX: OnceLock<MutexId> = OnceLock::new();
    static OWNER: OnceLock<TaskId> = OnceLock::new();

    fn holder(_: usize) {
        let m = *MUTEX.get().unwrap();
        let me = System::task_current().unwrap();
        OWNER.set(me).unwrap();

        System::mutex_lock(m, cfg::WAIT_FOREVER).unwrap();
        assert!(System::mutex_is_locked(m).unwrap());
        assert_eq!(System::mutex_name(m).unwrap().as_str(), "m");
        assert_eq!(System::mutex_get_owner(m).unwrap(), Some(me));

        // Recursive locking is rejected and leaves ownership untouched.
        assert_eq!(
            System::mutex_lock(m, cfg::WAIT_FOREVER),
            Err(LockMutexError::Recursive)
        );
        assert_eq!(System::mutex_try_lock(m), Err(LockMutexError::Recursive));
        assert_eq!(System::mutex_get_owner(m).unwrap(), Some(me));

        System::task_delay(2).unwrap();

        System::mutex_unlock(m).unwrap();
        assert!(!System::mutex_is_locked(m).unwrap());
        assert_eq!(
            System::mutex_unlock(m),
            Err(UnlockMutexError::NotOwner)
        );
        kestrel_port_std::shutdown::<SystemTraits>();
    }

    fn outsider(_: usize) {
        let m = *MUTEX.get().unwrap();
        System::task_delay(1).unwrap();
        // By now the holder owns the mutex.
        assert_eq!(System::mutex_unlock(m), Err(UnlockMutexError::NotOwner));
        assert_eq!(System::mutex_try_lock(m), Err(LockMutexError::Timeout));
        assert_eq!(
            System::mutex_get_owner(m).unwrap(),
            Some(*OWNER.get().unwrap())
        );
    }

    #[test]
    fn only_the_owner_may_unlock() {
        kestrel_port_std::run::<SystemTraits>(|| {
            MUTEX.set(System::mutex_create("m").unwrap()).unwrap();
            System::task_create(holder, "holder", 512, 0, 2).unwrap();
            System::task_create(outsider, "outsider", 512, 0, 3).unwrap();
        });
    }
}

mod lock_timeout {
    use super::*;

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    type System = kestrel_kernel::System<SystemTraits>;

    static MUTEX: OnceLock<MutexId> = OnceLock::new();

    fn holder(_: usize) {
        let m = *MUTEX.get().unwrap();
        System::mutex_lock(m, cfg::WAIT_FOREVER).unwrap();
        System::task_delay(10).unwrap();
        System::mutex_unlock(m).unwrap();
    }

    fn contender(_: usize) {
        let m = *MUTEX.get().unwrap();
        System::task_delay(1).unwrap();
        let start = System::tick_count().unwrap();
        assert_eq!(
            System::mutex_lock(m, 4),
            Err(LockMutexError::Timeout)
        );
        assert_eq!(System::tick_count().unwrap().wrapping_sub(start), 4);

        // The second attempt outlives the holder's critical section.
        System::mutex_lock(m, cfg::WAIT_FOREVER).unwrap();
        System::mutex_unlock(m).unwrap();
        kestrel_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn a_contended_lock_times_out_on_the_deadline() {
        kestrel_port_std::run::<SystemTraits>(|| {
            MUTEX.set(System::mutex_create("m").unwrap()).unwrap();
            System::task_create(holder, "holder", 512, 0, 2).unwrap();
            System::task_create(contender, "contender", 512, 0, 3).unwrap();
        });
    }
}

mod priority_inheritance {
    use super::*;

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    type System = kestrel_kernel::System<SystemTraits>;

    static MUTEX: OnceLock<MutexId> = OnceLock::new();
    static LOW: OnceLock<TaskId> = OnceLock::new();
    static ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    // Base priority 5. Holds the mutex across a delay so the high-priority
    // task blocks on it.
    fn low(_: usize) {
        let m = *MUTEX.get().unwrap();
        System::mutex_lock(m, cfg::WAIT_FOREVER).unwrap();
        ORDER.lock().unwrap().push("low:locked");
        System::task_delay(3).unwrap();

        // The high-priority waiter arrived while we slept; its priority has
        // been inherited.
        let me = System::task_current().unwrap();
        assert_eq!(System::task_effective_priority(me).unwrap(), 1);
        assert_eq!(System::task_base_priority(me).unwrap(), 5);
        ORDER.lock().unwrap().push("low:resumed");

        System::mutex_unlock(m).unwrap();
        ORDER.lock().unwrap().push("low:done");
    }

    // Base priority 1. Blocks on the mutex one tick in.
    fn high(_: usize) {
        let m = *MUTEX.get().unwrap();
        System::task_delay(1).unwrap();
        System::mutex_lock(m, cfg::WAIT_FOREVER).unwrap();
        ORDER.lock().unwrap().push("high:acquired");

        // Inheritance ended with the unlock.
        let low = *LOW.get().unwrap();
        assert_eq!(System::task_effective_priority(low).unwrap(), 5);
        System::mutex_unlock(m).unwrap();

        // Let the lower-priority tasks finish before ending the run.
        System::task_delay(5).unwrap();
        kestrel_port_std::shutdown::<SystemTraits>();
    }

    // Base priority 3. Wakes on the same tick as `low`; without inheritance
    // it would run first.
    fn middle(_: usize) {
        System::task_delay(3).unwrap();
        ORDER.lock().unwrap().push("middle:ran");
    }

    #[test]
    fn the_holder_inherits_its_waiters_priority() {
        kestrel_port_std::run::<SystemTraits>(|| {
            MUTEX.set(System::mutex_create("m").unwrap()).unwrap();
            System::task_create(high, "high", 512, 0, 1).unwrap();
            System::task_create(middle, "middle", 512, 0, 3).unwrap();
            LOW.set(System::task_create(low, "low", 512, 0, 5).unwrap())
                .unwrap();
        });
        assert_eq!(
            *ORDER.lock().unwrap(),
            [
                "low:locked",
                "low:resumed",
                "high:acquired",
                "middle:ran",
                "low:done",
            ]
        );
    }
}

mod deletion {
    use super::*;

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    type System = kestrel_kernel::System<SystemTraits>;

    static MUTEX: OnceLock<MutexId> = OnceLock::new();
    static HOLDER: OnceLock<TaskId> = OnceLock::new();

    // Base priority 4: takes the mutex, then sleeps through the deletion.
    fn holder(_: usize) {
        let m = *MUTEX.get().unwrap();
        System::mutex_lock(m, cfg::WAIT_FOREVER).unwrap();
        System::task_delay(5).unwrap();
    }

    // Base priority 1: blocks on the held mutex, boosting the holder.
    fn waiter(_: usize) {
        let m = *MUTEX.get().unwrap();
        System::task_delay(1).unwrap();
        assert_eq!(
            System::mutex_lock(m, cfg::WAIT_FOREVER),
            Err(LockMutexError::ObjectDeleted)
        );

        // The holder's inherited priority was reverted by the deletion, and
        // the control block went back to its pool.
        let holder = *HOLDER.get().unwrap();
        assert_eq!(System::task_effective_priority(holder).unwrap(), 4);
        assert_eq!(System::pool_stats(PoolId::Mutexes).unwrap().used, 0);
        kestrel_port_std::shutdown::<SystemTraits>();
    }

    // Base priority 2: deletes the mutex out from under the waiter.
    fn deleter(_: usize) {
        let m = *MUTEX.get().unwrap();
        System::task_delay(2).unwrap();
        let holder = *HOLDER.get().unwrap();
        assert_eq!(System::task_effective_priority(holder).unwrap(), 1);
        System::mutex_delete(m).unwrap();
    }

    #[test]
    fn deleting_a_mutex_wakes_waiters_and_reverts_inheritance() {
        kestrel_port_std::run::<SystemTraits>(|| {
            MUTEX.set(System::mutex_create("m").unwrap()).unwrap();
            System::task_create(waiter, "waiter", 512, 0, 1).unwrap();
            System::task_create(deleter, "deleter", 512, 0, 2).unwrap();
            HOLDER
                .set(System::task_create(holder, "holder", 512, 0, 4).unwrap())
                .unwrap();
        });
    }
}
