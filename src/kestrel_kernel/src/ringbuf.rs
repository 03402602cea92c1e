//! Fixed-capacity ring buffer of same-sized elements.
//!
//! The buffer state (indices and sizes) is separated from the backing bytes,
//! which live in a queue-buffer pool slot and are passed into each operation.
//! Capacity is rounded up to a power of two so wraparound is a bitwise mask.
//! Elements are copied whole; there are no partial reads or writes.
use crate::utils::Init;

#[derive(Debug, Clone, Copy)]
pub(crate) struct RingBuffer {
    head: u16,
    tail: u16,
    len: u16,
    capacity: u16,
    mask: u16,
    element_size: u16,
}

impl Init for RingBuffer {
    const INIT: Self = Self {
        head: 0,
        tail: 0,
        len: 0,
        capacity: 0,
        mask: 0,
        element_size: 0,
    };
}

impl RingBuffer {
    /// `capacity` is rounded up to the next power of two. Both arguments must
    /// be non-zero.
    pub(crate) fn new(capacity: usize, element_size: usize) -> Self {
        debug_assert!(capacity > 0 && element_size > 0);
        let capacity = capacity.next_power_of_two() as u16;
        Self {
            head: 0,
            tail: 0,
            len: 0,
            capacity,
            mask: capacity - 1,
            element_size: element_size as u16,
        }
    }

    #[inline]
    pub(crate) fn element_size(&self) -> usize {
        usize::from(self.element_size)
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        usize::from(self.capacity)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        usize::from(self.len)
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// Copy one element in at the tail. Fails when full.
    pub(crate) fn put(&mut self, storage: &mut [u8], item: &[u8]) -> bool {
        if self.is_full() {
            return false;
        }
        debug_assert_eq!(item.len(), self.element_size());
        let esz = self.element_size();
        let off = usize::from(self.tail) * esz;
        storage[off..off + esz].copy_from_slice(item);
        self.tail = (self.tail + 1) & self.mask;
        self.len += 1;
        true
    }

    /// Copy the oldest element out and advance. Fails when empty.
    pub(crate) fn get(&mut self, storage: &[u8], out: &mut [u8]) -> bool {
        if !self.peek(storage, out) {
            return false;
        }
        self.head = (self.head + 1) & self.mask;
        self.len -= 1;
        true
    }

    /// Copy the oldest element out without consuming it.
    pub(crate) fn peek(&self, storage: &[u8], out: &mut [u8]) -> bool {
        if self.is_empty() {
            return false;
        }
        debug_assert_eq!(out.len(), self.element_size());
        let esz = self.element_size();
        let off = usize::from(self.head) * esz;
        out.copy_from_slice(&storage[off..off + esz]);
        true
    }

    pub(crate) fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.len = 0;
    }
}
