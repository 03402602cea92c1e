//! The kernel-global state.
//!
//! All mutable kernel state is aggregated into a single [`KernelState`] value
//! guarded by the CPU Lock (see [`crate::klock`]). Ports provide one static
//! [`Kernel`] instance per system through [`Port::state`](crate::Port::state).
use core::fmt;

use crate::cfg;
use crate::klock::CpuLockCell;
use crate::mutex::MutexCb;
use crate::pool::{Pool, PoolId, PoolStats, QueueBuf, SizeClass, StackSlot};
use crate::queue::QueueCb;
use crate::semaphore::SemaphoreCb;
use crate::task::{TaskCb, WaitSource};
use crate::task::readyqueue::ReadyQueue;
use crate::utils::intrusive_list::{Index, ListAccessor, ListHead};
use crate::utils::Init;
use crate::Port;

fn wait_link(t: &mut TaskCb) -> &mut Option<crate::utils::intrusive_list::Link> {
    &mut t.wait_link
}

/// Kernel lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Uninit,
    Initialized,
    Running,
}

impl Init for Lifecycle {
    const INIT: Self = Self::Uninit;
}

/// Everything the kernel mutates at run time, in one place.
pub(crate) struct KernelState {
    pub(crate) lifecycle: Lifecycle,

    /// Free-running tick counter, incremented by the tick interrupt.
    pub(crate) tick_now: u32,

    /// The task currently owning the processor.
    pub(crate) current_task: Option<Index>,

    /// The task the next context switch will hand the processor to. Advisory;
    /// the dispatcher re-derives it from the ready queues.
    pub(crate) next_task: Option<Index>,

    pub(crate) idle_task: Option<Index>,

    pub(crate) ready: ReadyQueue,

    /// Tasks with pending wake ticks in the current counter epoch, sorted by
    /// ascending wake tick.
    pub(crate) delayed_current: ListHead,

    /// Tasks whose wake tick is past the next counter wrap.
    pub(crate) delayed_overflow: ListHead,

    pub(crate) tasks: Pool<TaskCb, { cfg::MAX_TASKS }>,
    pub(crate) stacks_small: Pool<StackSlot<{ cfg::STACK_SIZE_SMALL }>, { cfg::STACK_COUNT_SMALL }>,
    pub(crate) stacks_medium:
        Pool<StackSlot<{ cfg::STACK_SIZE_MEDIUM }>, { cfg::STACK_COUNT_MEDIUM }>,
    pub(crate) stacks_large: Pool<StackSlot<{ cfg::STACK_SIZE_LARGE }>, { cfg::STACK_COUNT_LARGE }>,
    pub(crate) queues: Pool<QueueCb, { cfg::MAX_QUEUES }>,
    pub(crate) queue_bufs_small:
        Pool<QueueBuf<{ cfg::QUEUE_BUF_SIZE_SMALL }>, { cfg::QUEUE_BUF_COUNT_SMALL }>,
    pub(crate) queue_bufs_medium:
        Pool<QueueBuf<{ cfg::QUEUE_BUF_SIZE_MEDIUM }>, { cfg::QUEUE_BUF_COUNT_MEDIUM }>,
    pub(crate) queue_bufs_large:
        Pool<QueueBuf<{ cfg::QUEUE_BUF_SIZE_LARGE }>, { cfg::QUEUE_BUF_COUNT_LARGE }>,
    pub(crate) semaphores: Pool<SemaphoreCb, { cfg::MAX_SEMAPHORES }>,
    pub(crate) mutexes: Pool<MutexCb, { cfg::MAX_MUTEXES }>,
}

impl Init for KernelState {
    const INIT: Self = Self {
        lifecycle: Init::INIT,
        tick_now: 0,
        current_task: None,
        next_task: None,
        idle_task: None,
        ready: Init::INIT,
        delayed_current: Init::INIT,
        delayed_overflow: Init::INIT,
        tasks: Init::INIT,
        stacks_small: Init::INIT,
        stacks_medium: Init::INIT,
        stacks_large: Init::INIT,
        queues: Init::INIT,
        queue_bufs_small: Init::INIT,
        queue_bufs_medium: Init::INIT,
        queue_bufs_large: Init::INIT,
        semaphores: Init::INIT,
        mutexes: Init::INIT,
    };
}

impl fmt::Debug for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KernelState")
            .field("lifecycle", &self.lifecycle)
            .field("tick_now", &self.tick_now)
            .field("current_task", &self.current_task)
            .field("next_task", &self.next_task)
            .finish_non_exhaustive()
    }
}

impl KernelState {
    /// Allocate a stack slot from the given class. Returns the slot index and
    /// the slot's byte range as a raw pointer + capacity.
    pub(crate) fn alloc_stack(&mut self, class: SizeClass) -> Option<Index> {
        match class {
            SizeClass::Small => self.stacks_small.alloc(),
            SizeClass::Medium => self.stacks_medium.alloc(),
            SizeClass::Large => self.stacks_large.alloc(),
        }
    }

    pub(crate) fn free_stack(&mut self, class: SizeClass, index: Index) -> bool {
        let i = usize::from(index);
        match class {
            SizeClass::Small => self.stacks_small.free(i),
            SizeClass::Medium => self.stacks_medium.free(i),
            SizeClass::Large => self.stacks_large.free(i),
        }
    }

    /// Raw pointer and capacity of an allocated stack slot.
    pub(crate) fn stack_storage(&mut self, class: SizeClass, index: Index) -> Option<(*mut u8, usize)> {
        let i = usize::from(index);
        match class {
            SizeClass::Small => self
                .stacks_small
                .get_mut(i)
                .map(|s| (s.bytes.as_mut_ptr(), s.bytes.len())),
            SizeClass::Medium => self
                .stacks_medium
                .get_mut(i)
                .map(|s| (s.bytes.as_mut_ptr(), s.bytes.len())),
            SizeClass::Large => self
                .stacks_large
                .get_mut(i)
                .map(|s| (s.bytes.as_mut_ptr(), s.bytes.len())),
        }
    }

    pub(crate) fn alloc_queue_buf(&mut self, class: SizeClass) -> Option<Index> {
        match class {
            SizeClass::Small => self.queue_bufs_small.alloc(),
            SizeClass::Medium => self.queue_bufs_medium.alloc(),
            SizeClass::Large => self.queue_bufs_large.alloc(),
        }
    }

    pub(crate) fn free_queue_buf(&mut self, class: SizeClass, index: Index) -> bool {
        let i = usize::from(index);
        match class {
            SizeClass::Small => self.queue_bufs_small.free(i),
            SizeClass::Medium => self.queue_bufs_medium.free(i),
            SizeClass::Large => self.queue_bufs_large.free(i),
        }
    }

    /// Split borrow of a queue's ring state and its backing bytes, which live
    /// in different pools.
    pub(crate) fn queue_ring_and_storage(
        &mut self,
        qi: usize,
    ) -> Option<(&mut crate::ringbuf::RingBuffer, &mut [u8])> {
        let Self {
            queues,
            queue_bufs_small,
            queue_bufs_medium,
            queue_bufs_large,
            ..
        } = self;
        let qcb = queues.get_mut(qi)?;
        let buf = qcb.buf?;
        let i = usize::from(buf.index);
        let storage: &mut [u8] = match buf.class {
            SizeClass::Small => &mut queue_bufs_small.get_mut(i)?.bytes[..],
            SizeClass::Medium => &mut queue_bufs_medium.get_mut(i)?.bytes[..],
            SizeClass::Large => &mut queue_bufs_large.get_mut(i)?.bytes[..],
        };
        Some((&mut qcb.ring, storage))
    }

    pub(crate) fn pool_stats(&self, id: PoolId) -> PoolStats {
        match id {
            PoolId::Tasks => self.tasks.stats(),
            PoolId::StacksSmall => self.stacks_small.stats(),
            PoolId::StacksMedium => self.stacks_medium.stats(),
            PoolId::StacksLarge => self.stacks_large.stats(),
            PoolId::Queues => self.queues.stats(),
            PoolId::QueueBuffersSmall => self.queue_bufs_small.stats(),
            PoolId::QueueBuffersMedium => self.queue_bufs_medium.stats(),
            PoolId::QueueBuffersLarge => self.queue_bufs_large.stats(),
            PoolId::Semaphores => self.semaphores.stats(),
            PoolId::Mutexes => self.mutexes.stats(),
        }
    }

    /// The head of the wait list `source` refers to, together with the task
    /// pool it threads through. Returns `None` when the referenced object is
    /// no longer live.
    #[allow(clippy::type_complexity)]
    fn wait_list(&mut self, source: WaitSource) -> Option<(&mut ListHead, &mut [TaskCb])> {
        let tasks = self.tasks.slots_mut();
        let head = match source {
            WaitSource::QueueSend(q) => &mut self.queues.get_mut(usize::from(q))?.senders,
            WaitSource::QueueReceive(q) => &mut self.queues.get_mut(usize::from(q))?.receivers,
            WaitSource::Semaphore(s) => &mut self.semaphores.get_mut(usize::from(s))?.waiters,
            WaitSource::Mutex(m) => &mut self.mutexes.get_mut(usize::from(m))?.waiters,
        };
        Some((head, tasks))
    }

    /// Append `task` to the wait list of `source` (FIFO arrival order).
    pub(crate) fn wait_list_push(&mut self, source: WaitSource, task: Index) -> bool {
        let Some((head, tasks)) = self.wait_list(source) else {
            return false;
        };
        ListAccessor::new(head, tasks, wait_link).push_back(task).is_ok()
    }

    /// Pop the longest-waiting task off the wait list of `source`.
    pub(crate) fn wait_list_pop(&mut self, source: WaitSource) -> Option<Index> {
        let (head, tasks) = self.wait_list(source)?;
        ListAccessor::new(head, tasks, wait_link).pop_front()
    }

    /// Unlink `task` from the wait list of `source`.
    pub(crate) fn wait_list_remove(&mut self, source: WaitSource, task: Index) -> bool {
        let Some((head, tasks)) = self.wait_list(source) else {
            return false;
        };
        ListAccessor::new(head, tasks, wait_link).remove(task).is_ok()
    }

    /// The highest (numerically lowest) effective priority among the tasks
    /// waiting on `source`.
    pub(crate) fn wait_list_top_priority(&mut self, source: WaitSource) -> Option<u8> {
        let (head, tasks) = self.wait_list(source)?;
        let mut best: Option<u8> = None;
        let mut cur = head.first;
        while let Some(i) = cur {
            let t = &tasks[usize::from(i)];
            best = Some(match best {
                Some(b) if b <= t.effective_priority => b,
                _ => t.effective_priority,
            });
            cur = t.wait_link.and_then(|l| l.next);
        }
        best
    }
}

/// A complete kernel instance. Ports hold one of these in a `static` and hand
/// it to the kernel through [`Port::state`](crate::Port::state).
pub struct Kernel<Traits> {
    pub(crate) body: CpuLockCell<Traits, KernelState>,
}

impl<Traits> Kernel<Traits> {
    pub const fn new() -> Self {
        Self {
            body: CpuLockCell::new(KernelState::INIT),
        }
    }
}

impl<Traits: Port> fmt::Debug for Kernel<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Kernel").finish_non_exhaustive()
    }
}
