//! Message queues.
//!
//! A queue is a ring buffer plus two wait lists, one for senders blocked on a
//! full queue and one for receivers blocked on an empty one. Items are copied
//! in and out whole, in strict FIFO order; waiters are released in strict
//! FIFO arrival order, one per unblocking event.
use crate::cfg;
use crate::error::{CreateQueueError, DeleteQueueError, QueryQueueError, ReceiveQueueError, SendQueueError};
use crate::klock;
use crate::pool::queue_buf_class_for;
use crate::ringbuf::RingBuffer;
use crate::task::{self, WaitSource};
use crate::time;
use crate::utils::intrusive_list::{Index, ListHead};
use crate::utils::Init;
use crate::wait::{self, WaitOutcome};
use crate::{Port, QueueId, System};

/// The queue's backing storage allocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BufRef {
    pub(crate) class: crate::pool::SizeClass,
    pub(crate) index: Index,
}

/// *Queue control block* - the state data of a message queue.
pub(crate) struct QueueCb {
    pub(crate) ring: RingBuffer,
    pub(crate) buf: Option<BufRef>,
    pub(crate) senders: ListHead,
    pub(crate) receivers: ListHead,
}

impl Init for QueueCb {
    const INIT: Self = Self {
        ring: Init::INIT,
        buf: None,
        senders: Init::INIT,
        receivers: Init::INIT,
    };
}

impl<Traits: Port> System<Traits> {
    /// Create a queue holding up to `length` elements of `element_size`
    /// bytes. The capacity is rounded up to a power of two.
    pub fn queue_create(length: usize, element_size: usize) -> Result<QueueId, CreateQueueError> {
        if length == 0 || element_size == 0 {
            return Err(CreateQueueError::BadParam);
        }
        if length > cfg::QUEUE_BUF_SIZE_LARGE || element_size > cfg::QUEUE_BUF_SIZE_LARGE {
            return Err(CreateQueueError::AllocationFailed);
        }
        let ring = RingBuffer::new(length, element_size);
        let bytes = ring
            .capacity()
            .checked_mul(ring.element_size())
            .ok_or(CreateQueueError::AllocationFailed)?;
        let class = queue_buf_class_for(bytes).ok_or(CreateQueueError::AllocationFailed)?;

        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.write(&mut *lock);
        let queue = state
            .queues
            .alloc()
            .ok_or(CreateQueueError::AllocationFailed)?;
        let Some(buf) = state.alloc_queue_buf(class) else {
            state.queues.free(usize::from(queue));
            return Err(CreateQueueError::AllocationFailed);
        };

        let qcb = &mut state.queues.slots_mut()[usize::from(queue)];
        qcb.ring = ring;
        qcb.buf = Some(BufRef { class, index: buf });
        Ok(QueueId::from_index(queue))
    }

    /// Delete a queue. Every blocked sender and receiver is released and its
    /// pending operation reports `ObjectDeleted`.
    pub fn queue_delete(queue: QueueId) -> Result<(), DeleteQueueError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.write(&mut *lock);
        let qi = queue.index();
        if !state.queues.is_live(usize::from(qi)) {
            return Err(DeleteQueueError::Null);
        }

        wait::wake_all_signal(state, WaitSource::QueueSend(qi));
        wait::wake_all_signal(state, WaitSource::QueueReceive(qi));

        let buf = state.queues.slots_mut()[usize::from(qi)].buf.take();
        if let Some(buf) = buf {
            state.free_queue_buf(buf.class, buf.index);
        }
        state.queues.free(usize::from(qi));

        task::unlock_and_check_preemption(lock);
        Ok(())
    }

    /// Copy `item` into the queue, blocking for up to `timeout` ticks while
    /// the queue is full. [`cfg::NO_WAIT`] fails immediately with `Full`;
    /// [`cfg::WAIT_FOREVER`] never times out.
    pub fn queue_send(queue: QueueId, item: &[u8], timeout: u32) -> Result<(), SendQueueError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let qi = queue.index();

        let deadline = {
            let state = Traits::state().body.write(&mut *lock);
            let qcb = state
                .queues
                .get(usize::from(qi))
                .ok_or(SendQueueError::Null)?;
            if item.len() != qcb.ring.element_size() {
                return Err(SendQueueError::BadParam);
            }
            if timeout == cfg::WAIT_FOREVER {
                None
            } else {
                Some(state.tick_now.wrapping_add(timeout))
            }
        };

        loop {
            let state = Traits::state().body.write(&mut *lock);
            let Some((ring, storage)) = state.queue_ring_and_storage(usize::from(qi)) else {
                return Err(SendQueueError::Null);
            };
            if !ring.is_full() {
                let ok = ring.put(storage, item);
                debug_assert!(ok);
                if wait::wake_one(state, WaitSource::QueueReceive(qi)).is_some() {
                    task::unlock_and_check_preemption(lock);
                }
                return Ok(());
            }
            if timeout == cfg::NO_WAIT {
                return Err(SendQueueError::Full);
            }
            if let Some(deadline) = deadline {
                if time::ticks_until(deadline, state.tick_now) == 0 {
                    return Err(SendQueueError::Timeout);
                }
            }
            match wait::wait_current(&mut lock, WaitSource::QueueSend(qi), deadline) {
                WaitOutcome::Woken => continue,
                WaitOutcome::TimedOut => return Err(SendQueueError::Timeout),
                WaitOutcome::Deleted => return Err(SendQueueError::ObjectDeleted),
            }
        }
    }

    /// Copy the oldest item out of the queue, blocking for up to `timeout`
    /// ticks while the queue is empty. [`cfg::NO_WAIT`] fails immediately
    /// with `Empty`; [`cfg::WAIT_FOREVER`] never times out.
    pub fn queue_receive(
        queue: QueueId,
        item: &mut [u8],
        timeout: u32,
    ) -> Result<(), ReceiveQueueError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let qi = queue.index();

        let deadline = {
            let state = Traits::state().body.write(&mut *lock);
            let qcb = state
                .queues
                .get(usize::from(qi))
                .ok_or(ReceiveQueueError::Null)?;
            if item.len() != qcb.ring.element_size() {
                return Err(ReceiveQueueError::BadParam);
            }
            if timeout == cfg::WAIT_FOREVER {
                None
            } else {
                Some(state.tick_now.wrapping_add(timeout))
            }
        };

        loop {
            let state = Traits::state().body.write(&mut *lock);
            let Some((ring, storage)) = state.queue_ring_and_storage(usize::from(qi)) else {
                return Err(ReceiveQueueError::Null);
            };
            if !ring.is_empty() {
                let ok = ring.get(storage, item);
                debug_assert!(ok);
                if wait::wake_one(state, WaitSource::QueueSend(qi)).is_some() {
                    task::unlock_and_check_preemption(lock);
                }
                return Ok(());
            }
            if timeout == cfg::NO_WAIT {
                return Err(ReceiveQueueError::Empty);
            }
            if let Some(deadline) = deadline {
                if time::ticks_until(deadline, state.tick_now) == 0 {
                    return Err(ReceiveQueueError::Timeout);
                }
            }
            match wait::wait_current(&mut lock, WaitSource::QueueReceive(qi), deadline) {
                WaitOutcome::Woken => continue,
                WaitOutcome::TimedOut => return Err(ReceiveQueueError::Timeout),
                WaitOutcome::Deleted => return Err(ReceiveQueueError::ObjectDeleted),
            }
        }
    }

    /// [`queue_send`](Self::queue_send) that never blocks.
    pub fn queue_send_immediate(queue: QueueId, item: &[u8]) -> Result<(), SendQueueError> {
        Self::queue_send(queue, item, cfg::NO_WAIT)
    }

    /// Copy the oldest item out without consuming it. Never blocks.
    pub fn queue_peek(queue: QueueId, item: &mut [u8]) -> Result<(), ReceiveQueueError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.write(&mut *lock);
        let qi = queue.index();
        let Some((ring, storage)) = state.queue_ring_and_storage(usize::from(qi)) else {
            return Err(ReceiveQueueError::Null);
        };
        if item.len() != ring.element_size() {
            return Err(ReceiveQueueError::BadParam);
        }
        if ring.peek(storage, item) {
            Ok(())
        } else {
            Err(ReceiveQueueError::Empty)
        }
    }

    /// Discard every stored item. Blocked senders are released to retry
    /// against the emptied queue; blocked receivers keep waiting.
    pub fn queue_flush(queue: QueueId) -> Result<(), QueryQueueError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.write(&mut *lock);
        let qi = queue.index();
        let Some(qcb) = state.queues.get_mut(usize::from(qi)) else {
            return Err(QueryQueueError::Null);
        };
        qcb.ring.clear();
        let mut woke = false;
        while wait::wake_one(state, WaitSource::QueueSend(qi)).is_some() {
            woke = true;
        }
        if woke {
            task::unlock_and_check_preemption(lock);
        }
        Ok(())
    }

    /// [`queue_receive`](Self::queue_receive) that never blocks.
    pub fn queue_receive_immediate(
        queue: QueueId,
        item: &mut [u8],
    ) -> Result<(), ReceiveQueueError> {
        Self::queue_receive(queue, item, cfg::NO_WAIT)
    }

    pub fn queue_is_empty(queue: QueueId) -> Result<bool, QueryQueueError> {
        Self::query_queue(queue, |q| q.ring.is_empty())
    }

    pub fn queue_is_full(queue: QueueId) -> Result<bool, QueryQueueError> {
        Self::query_queue(queue, |q| q.ring.is_full())
    }

    /// The number of items currently stored.
    pub fn queue_messages_waiting(queue: QueueId) -> Result<usize, QueryQueueError> {
        Self::query_queue(queue, |q| q.ring.len())
    }

    fn query_queue<R>(queue: QueueId, f: impl FnOnce(&QueueCb) -> R) -> Result<R, QueryQueueError> {
        let lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().body.read(&*lock);
        state
            .queues
            .get(usize::from(queue.index()))
            .map(f)
            .ok_or(QueryQueueError::Null)
    }
}
