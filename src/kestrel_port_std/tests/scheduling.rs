//! Scheduler behavior: band rotation, preemption, suspension, lifecycle.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};

use kestrel_kernel::cfg;
use kestrel_kernel::{CreateTaskError, PoolId, SuspendTaskError, TaskId, TaskSt};

mod round_robin {
    use super::*;

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    type System = kestrel_kernel::System<SystemTraits>;

    static ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn chatty(tag: usize) {
        let tag = if tag == 0 { "a" } else { "b" };
        for _ in 0..3 {
            ORDER.lock().unwrap().push(tag);
            System::task_yield();
        }
        let me = System::task_current().unwrap();
        assert!(System::task_stats(me).unwrap().run_count >= 3);
        if ORDER.lock().unwrap().len() == 6 {
            kestrel_port_std::shutdown::<SystemTraits>();
        }
    }

    #[test]
    fn equal_priority_tasks_alternate() {
        kestrel_port_std::run::<SystemTraits>(|| {
            System::task_create(chatty, "a", 512, 0, 2).unwrap();
            System::task_create(chatty, "b", 512, 1, 2).unwrap();
        });
        assert_eq!(*ORDER.lock().unwrap(), ["a", "b", "a", "b", "a", "b"]);
    }
}

mod priority_preemption {
    use super::*;

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    type System = kestrel_kernel::System<SystemTraits>;

    static ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn low(_: usize) {
        ORDER.lock().unwrap().push("low:start");
        // Creating a higher-priority task preempts immediately.
        System::task_create(high, "high", 512, 0, 1).unwrap();
        ORDER.lock().unwrap().push("low:resumed");
        kestrel_port_std::shutdown::<SystemTraits>();
    }

    fn high(_: usize) {
        ORDER.lock().unwrap().push("high:ran");
    }

    #[test]
    fn higher_priority_task_preempts_creator() {
        kestrel_port_std::run::<SystemTraits>(|| {
            System::task_create(low, "low", 512, 0, 4).unwrap();
        });
        assert_eq!(
            *ORDER.lock().unwrap(),
            ["low:start", "high:ran", "low:resumed"]
        );
    }
}

mod periodic_vs_idle {
    use super::*;

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    type System = kestrel_kernel::System<SystemTraits>;

    static WAKE_TICKS: Mutex<Vec<u32>> = Mutex::new(Vec::new());

    fn periodic(_: usize) {
        for _ in 0..3 {
            System::task_delay(10).unwrap();
            WAKE_TICKS.lock().unwrap().push(System::tick_count().unwrap());
        }
        kestrel_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn periodic_task_wakes_on_schedule() {
        kestrel_port_std::run::<SystemTraits>(|| {
            System::task_create(periodic, "periodic", 512, 0, 3).unwrap();
        });
        // Idle only runs inside the delay windows; the periodic task regains
        // the processor on the expiry tick itself.
        assert_eq!(*WAKE_TICKS.lock().unwrap(), [10, 20, 30]);
    }
}

mod suspend_resume {
    use super::*;

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    type System = kestrel_kernel::System<SystemTraits>;

    static WORKER: OnceLock<TaskId> = OnceLock::new();
    static SLEEPER: OnceLock<TaskId> = OnceLock::new();
    static PULSES: AtomicU32 = AtomicU32::new(0);

    fn worker(_: usize) {
        loop {
            PULSES.fetch_add(1, Ordering::Relaxed);
            System::task_suspend(*WORKER.get().unwrap()).unwrap();
        }
    }

    fn sleeper(_: usize) {
        System::task_delay(1_000_000).unwrap();
    }

    fn control(_: usize) {
        let worker = *WORKER.get().unwrap();
        // The worker (higher priority) already ran once and suspended itself.
        assert_eq!(PULSES.load(Ordering::Relaxed), 1);
        assert_eq!(System::task_state(worker).unwrap(), TaskSt::Suspended);

        for expected in 2..=3 {
            System::task_resume(worker).unwrap();
            assert_eq!(PULSES.load(Ordering::Relaxed), expected);
        }

        // Resuming a task that isn't suspended is refused.
        assert_eq!(
            System::task_resume(*SLEEPER.get().unwrap()),
            Err(SuspendTaskError::BadState)
        );
        // So is suspending a blocked task.
        assert_eq!(
            System::task_suspend(*SLEEPER.get().unwrap()),
            Err(SuspendTaskError::BadState)
        );

        kestrel_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn suspension_withholds_a_task_until_resume() {
        kestrel_port_std::run::<SystemTraits>(|| {
            WORKER
                .set(System::task_create(worker, "worker", 512, 0, 2).unwrap())
                .unwrap();
            SLEEPER
                .set(System::task_create(sleeper, "sleeper", 512, 0, 3).unwrap())
                .unwrap();
            System::task_create(control, "control", 512, 0, 4).unwrap();
        });
        assert_eq!(PULSES.load(Ordering::Relaxed), 3);
    }
}

mod lifecycle_and_pools {
    use super::*;

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    type System = kestrel_kernel::System<SystemTraits>;

    fn nop(_: usize) {}

    fn checker(_: usize) {
        kestrel_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn creation_validates_and_pools_bound_task_count() {
        kestrel_port_std::run::<SystemTraits>(|| {
            // Parameter validation
            assert_eq!(
                System::task_create(nop, "", 512, 0, 2),
                Err(CreateTaskError::BadParam)
            );
            assert_eq!(
                System::task_create(nop, "x", 512, 0, cfg::MAX_PRIORITY + 1),
                Err(CreateTaskError::BadParam)
            );
            assert_eq!(
                System::task_create(nop, "x", cfg::STACK_SIZE_LARGE + 1, 0, 2),
                Err(CreateTaskError::AllocationFailed)
            );

            // A long name is truncated, not rejected.
            let t = System::task_create(nop, "a-very-long-task-name", 1024, 0, 7).unwrap();
            assert_eq!(
                System::task_name(t).unwrap().as_str(),
                "a-very-long-tas"
            );
            assert_eq!(System::task_base_priority(t).unwrap(), 7);
            assert_eq!(
                System::task_stack_size(t).unwrap(),
                cfg::STACK_SIZE_MEDIUM
            );
            System::task_delete(t).unwrap();

            // The idle task occupies one TCB; fill the remaining slots.
            let mut tasks = Vec::new();
            tasks.push(System::task_create(checker, "checker", 512, 0, 0).unwrap());
            for i in 1..cfg::MAX_TASKS - 1 {
                tasks.push(System::task_create(nop, "filler", 1024, i, 7).unwrap());
            }
            assert_eq!(
                System::task_create(nop, "overflow", 1024, 0, 7),
                Err(CreateTaskError::AllocationFailed)
            );
            let stats = System::pool_stats(PoolId::Tasks).unwrap();
            assert_eq!(stats.used, stats.total);
            assert_eq!(stats.free, 0);

            // Deleting a Ready task frees its slots for reuse.
            let victim = tasks.pop().unwrap();
            System::task_delete(victim).unwrap();
            assert_eq!(
                System::pool_stats(PoolId::Tasks).unwrap().used,
                cfg::MAX_TASKS - 1
            );
            // The freed slot no longer resolves.
            assert!(System::task_state(victim).is_err());
            System::task_create(nop, "again", 1024, 0, 7).unwrap();
        });
    }

    #[test]
    fn stack_pool_exhaustion_is_per_size_class() {
        // Runs in the same kernel instance family but its own test body; use
        // a fresh module-level kernel to keep it independent.
        mod inner {
            kestrel_port_std::use_port!(unsafe struct SystemTraits);
        }
        use kestrel_kernel::System as Sys;
        fn nop(_: usize) {}
        fn done(_: usize) {
            kestrel_port_std::shutdown::<inner::SystemTraits>();
        }
        type System = Sys<inner::SystemTraits>;

        kestrel_port_std::run::<inner::SystemTraits>(|| {
            // The idle task holds one small stack; three more fit.
            for i in 0..cfg::STACK_COUNT_SMALL - 1 {
                System::task_create(nop, "small", cfg::STACK_SIZE_SMALL, i, 7).unwrap();
            }
            assert_eq!(
                System::task_create(nop, "small-overflow", cfg::STACK_SIZE_SMALL, 0, 7),
                Err(CreateTaskError::AllocationFailed)
            );
            // A different size class still has room.
            System::task_create(done, "medium", cfg::STACK_SIZE_MEDIUM, 0, 0).unwrap();
            let small = System::pool_stats(PoolId::StacksSmall).unwrap();
            assert_eq!(small.free, 0);
            assert_eq!(small.peak, small.total);
        });
    }
}
