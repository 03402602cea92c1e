//! Task ready queue implementation (internal use only).
//!
//! One FIFO list per priority band, plus a bitmap with one bit per band so
//! the highest non-empty band is found with a single bit scan.
//!
//! Invariant: `queues[p]` is non-empty iff bit `p` of `bitmap` is set.
use crate::cfg;
use crate::task::TaskCb;
use crate::utils::intrusive_list::{Index, Link, ListAccessor, ListHead};
use crate::utils::{FixedBitmap, Init};

pub(crate) struct ReadyQueue {
    queues: [ListHead; cfg::PRIORITY_LEVELS],
    bitmap: FixedBitmap<{ cfg::PRIORITY_LEVELS }>,
}

impl Init for ReadyQueue {
    const INIT: Self = Self {
        queues: Init::INIT,
        bitmap: FixedBitmap::EMPTY,
    };
}

fn ready_link(t: &mut TaskCb) -> &mut Option<Link> {
    &mut t.ready_link
}

impl ReadyQueue {
    /// The priority of the highest-priority Ready task.
    #[inline]
    pub(crate) fn front_priority(&self) -> Option<usize> {
        self.bitmap.find_set()
    }

    /// The first task that the next scheduling decision would pick.
    pub(crate) fn front(&self) -> Option<Index> {
        self.queues[self.bitmap.find_set()?].first
    }

    /// Append `task` at the tail of its effective priority's band.
    pub(crate) fn push_back(&mut self, tasks: &mut [TaskCb], task: Index) {
        let pri = usize::from(tasks[usize::from(task)].effective_priority);
        let r = ListAccessor::new(&mut self.queues[pri], tasks, ready_link).push_back(task);
        debug_assert!(r.is_ok());
        self.bitmap.set(pri);
    }

    /// Insert `task` at the head of its band, ahead of its peers. Used when a
    /// task loses the processor without having finished its turn.
    pub(crate) fn push_front(&mut self, tasks: &mut [TaskCb], task: Index) {
        let pri = usize::from(tasks[usize::from(task)].effective_priority);
        let r = ListAccessor::new(&mut self.queues[pri], tasks, ready_link).push_front(task);
        debug_assert!(r.is_ok());
        self.bitmap.set(pri);
    }

    /// Remove the head of the highest non-empty band.
    pub(crate) fn pop_front(&mut self, tasks: &mut [TaskCb]) -> Option<Index> {
        let pri = self.bitmap.find_set()?;
        let mut acc = ListAccessor::new(&mut self.queues[pri], tasks, ready_link);
        let task = acc.pop_front();
        if self.queues[pri].is_empty() {
            self.bitmap.clear(pri);
        }
        task
    }

    /// Unlink `task` from the band it was queued in (its current effective
    /// priority).
    pub(crate) fn remove(&mut self, tasks: &mut [TaskCb], task: Index) -> bool {
        let pri = usize::from(tasks[usize::from(task)].effective_priority);
        let ok = ListAccessor::new(&mut self.queues[pri], tasks, ready_link)
            .remove(task)
            .is_ok();
        if ok && self.queues[pri].is_empty() {
            self.bitmap.clear(pri);
        }
        ok
    }
}
