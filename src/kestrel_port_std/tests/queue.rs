//! Message queue semantics: FIFO order, back pressure, timeouts, deletion.
use std::sync::{Mutex, OnceLock};

use kestrel_kernel::cfg;
use kestrel_kernel::{CreateQueueError, PoolId, QueueId, ReceiveQueueError, SendQueueError};

mod producer_consumer {
    use super::*;

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    type System = kestrel_kernel::System<SystemTraits>;

    static QUEUE: OnceLock<QueueId> = OnceLock::new();
    static RECEIVED: Mutex<Vec<u32>> = Mutex::new(Vec::new());

    fn producer(_: usize) {
        let q = *QUEUE.get().unwrap();
        for v in [10u32, 20, 30, 40] {
            System::queue_send(q, &v.to_ne_bytes(), cfg::WAIT_FOREVER).unwrap();
        }
    }

    fn consumer(_: usize) {
        let q = *QUEUE.get().unwrap();
        for _ in 0..4 {
            let mut buf = [0u8; 4];
            System::queue_receive(q, &mut buf, cfg::WAIT_FOREVER).unwrap();
            RECEIVED.lock().unwrap().push(u32::from_ne_bytes(buf));
        }
        assert_eq!(System::queue_messages_waiting(q).unwrap(), 0);
        assert!(System::queue_is_empty(q).unwrap());
        kestrel_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn items_are_received_in_send_order() {
        kestrel_port_std::run::<SystemTraits>(|| {
            QUEUE.set(System::queue_create(4, 4).unwrap()).unwrap();
            System::task_create(producer, "producer", 512, 0, 2).unwrap();
            System::task_create(consumer, "consumer", 512, 0, 3).unwrap();
        });
        assert_eq!(*RECEIVED.lock().unwrap(), [10, 20, 30, 40]);
    }
}

mod blocking_receiver {
    use super::*;

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    type System = kestrel_kernel::System<SystemTraits>;

    static QUEUE: OnceLock<QueueId> = OnceLock::new();
    static RECEIVED: Mutex<Vec<u32>> = Mutex::new(Vec::new());

    fn consumer(_: usize) {
        let q = *QUEUE.get().unwrap();
        for _ in 0..3 {
            let mut buf = [0u8; 4];
            System::queue_receive(q, &mut buf, cfg::WAIT_FOREVER).unwrap();
            RECEIVED.lock().unwrap().push(u32::from_ne_bytes(buf));
        }
        kestrel_port_std::shutdown::<SystemTraits>();
    }

    fn producer(_: usize) {
        let q = *QUEUE.get().unwrap();
        for v in [1u32, 2, 3] {
            System::queue_send(q, &v.to_ne_bytes(), cfg::WAIT_FOREVER).unwrap();
        }
    }

    #[test]
    fn a_waiting_receiver_is_woken_per_item() {
        kestrel_port_std::run::<SystemTraits>(|| {
            QUEUE.set(System::queue_create(4, 4).unwrap()).unwrap();
            // The consumer outranks the producer, so it blocks first and is
            // woken once per send.
            System::task_create(consumer, "consumer", 512, 0, 1).unwrap();
            System::task_create(producer, "producer", 512, 0, 2).unwrap();
        });
        assert_eq!(*RECEIVED.lock().unwrap(), [1, 2, 3]);
    }
}

mod blocked_senders {
    use super::*;

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    type System = kestrel_kernel::System<SystemTraits>;

    static QUEUE: OnceLock<QueueId> = OnceLock::new();
    static RECEIVED: Mutex<Vec<u8>> = Mutex::new(Vec::new());

    fn filler(_: usize) {
        let q = *QUEUE.get().unwrap();
        System::queue_send(q, b"x", cfg::NO_WAIT).unwrap();
        assert!(System::queue_is_full(q).unwrap());
        // A full queue refuses a non-blocking send outright.
        assert_eq!(
            System::queue_send(q, b"y", cfg::NO_WAIT),
            Err(SendQueueError::Full)
        );
    }

    fn sender(item: usize) {
        let q = *QUEUE.get().unwrap();
        System::queue_send(q, &[item as u8], cfg::WAIT_FOREVER).unwrap();
    }

    fn receiver(_: usize) {
        let q = *QUEUE.get().unwrap();
        for _ in 0..3 {
            let mut buf = [0u8; 1];
            System::queue_receive(q, &mut buf, cfg::WAIT_FOREVER).unwrap();
            RECEIVED.lock().unwrap().push(buf[0]);
        }
        kestrel_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn senders_drain_in_arrival_order() {
        kestrel_port_std::run::<SystemTraits>(|| {
            QUEUE.set(System::queue_create(1, 1).unwrap()).unwrap();
            System::task_create(filler, "filler", 1024, 0, 1).unwrap();
            System::task_create(sender, "sender-a", 512, b'a' as usize, 2).unwrap();
            System::task_create(sender, "sender-b", 512, b'b' as usize, 2).unwrap();
            System::task_create(receiver, "receiver", 1024, 0, 3).unwrap();
        });
        // The first blocked sender is released first.
        assert_eq!(*RECEIVED.lock().unwrap(), [b'x', b'a', b'b']);
    }
}

mod receive_timeout {
    use super::*;

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    type System = kestrel_kernel::System<SystemTraits>;

    static QUEUE: OnceLock<QueueId> = OnceLock::new();

    fn waiter(_: usize) {
        let q = *QUEUE.get().unwrap();
        let start = System::tick_count().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            System::queue_receive(q, &mut buf, 5),
            Err(ReceiveQueueError::Timeout)
        );
        let elapsed = System::tick_count().unwrap().wrapping_sub(start);
        assert_eq!(elapsed, 5);

        // Zero timeout reports `Empty` instead.
        assert_eq!(
            System::queue_receive_immediate(q, &mut buf),
            Err(ReceiveQueueError::Empty)
        );
        kestrel_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn an_empty_queue_times_out_after_exactly_the_deadline() {
        kestrel_port_std::run::<SystemTraits>(|| {
            QUEUE.set(System::queue_create(4, 4).unwrap()).unwrap();
            System::task_create(waiter, "waiter", 512, 0, 2).unwrap();
        });
    }
}

mod deletion {
    use super::*;

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    type System = kestrel_kernel::System<SystemTraits>;

    static QUEUE: OnceLock<QueueId> = OnceLock::new();

    fn blocked(_: usize) {
        let q = *QUEUE.get().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            System::queue_receive(q, &mut buf, cfg::WAIT_FOREVER),
            Err(ReceiveQueueError::ObjectDeleted)
        );
        // The handle is dead and the slots went back to their pools.
        assert_eq!(
            System::queue_send(q, &0u32.to_ne_bytes(), cfg::NO_WAIT),
            Err(SendQueueError::Null)
        );
        assert_eq!(System::pool_stats(PoolId::Queues).unwrap().used, 0);
        assert_eq!(
            System::pool_stats(PoolId::QueueBuffersSmall).unwrap().used,
            0
        );
        kestrel_port_std::shutdown::<SystemTraits>();
    }

    fn deleter(_: usize) {
        System::queue_delete(*QUEUE.get().unwrap()).unwrap();
    }

    #[test]
    fn deleting_a_queue_wakes_its_waiters() {
        kestrel_port_std::run::<SystemTraits>(|| {
            QUEUE.set(System::queue_create(4, 4).unwrap()).unwrap();
            System::task_create(blocked, "blocked", 512, 0, 1).unwrap();
            System::task_create(deleter, "deleter", 512, 0, 2).unwrap();
        });
    }
}

mod creation {
    use super::*;

    kestrel_port_std::use_port!(unsafe struct SystemTraits);
    type System = kestrel_kernel::System<SystemTraits>;

    fn done(_: usize) {
        kestrel_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn creation_validates_and_sizes_by_class() {
        kestrel_port_std::run::<SystemTraits>(|| {
            assert_eq!(
                System::queue_create(0, 4),
                Err(CreateQueueError::BadParam)
            );
            assert_eq!(
                System::queue_create(4, 0),
                Err(CreateQueueError::BadParam)
            );
            // 4096 bytes fits no buffer class.
            assert_eq!(
                System::queue_create(1024, 4),
                Err(CreateQueueError::AllocationFailed)
            );

            // Capacity rounds up to a power of two: 5 × 4 bytes lands in the
            // 64-byte class as 8 × 4.
            let q = System::queue_create(5, 4).unwrap();
            for v in 0..8u32 {
                System::queue_send(q, &v.to_ne_bytes(), cfg::NO_WAIT).unwrap();
            }
            assert_eq!(
                System::queue_send(q, &9u32.to_ne_bytes(), cfg::NO_WAIT),
                Err(SendQueueError::Full)
            );
            assert_eq!(System::queue_messages_waiting(q).unwrap(), 8);

            // Element size mismatches are rejected.
            assert_eq!(
                System::queue_send(q, &[0u8; 2], cfg::NO_WAIT),
                Err(SendQueueError::BadParam)
            );

            // Peeking does not consume.
            let mut buf = [0u8; 4];
            System::queue_peek(q, &mut buf).unwrap();
            assert_eq!(u32::from_ne_bytes(buf), 0);
            assert_eq!(System::queue_messages_waiting(q).unwrap(), 8);

            // Flushing discards everything at once.
            System::queue_flush(q).unwrap();
            assert!(System::queue_is_empty(q).unwrap());
            assert_eq!(
                System::queue_peek(q, &mut buf),
                Err(ReceiveQueueError::Empty)
            );

            System::task_create(done, "done", 512, 0, 0).unwrap();
        });
    }
}
