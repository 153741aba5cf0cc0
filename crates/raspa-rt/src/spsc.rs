//! Wait-free single-producer single-consumer ring buffer.
//!
//! The producer and the consumer may live on different threads; neither side
//! ever blocks, allocates or spins. One slot is kept unused so that a full
//! ring can be told apart from an empty one.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    #[error("ring is full")]
    Full,
    #[error("ring is empty")]
    Empty,
}

/// Bounded SPSC ring. `capacity` elements can be in flight at once.
///
/// Only `Copy` payloads are supported; slots are plain memory and no drop
/// glue ever runs on the consumer side.
pub struct SpscRing<T: Copy> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Next slot the consumer will read. Written by the consumer only.
    head: AtomicUsize,
    /// Next slot the producer will write. Written by the producer only.
    tail: AtomicUsize,
}

unsafe impl<T: Copy + Send> Send for SpscRing<T> {}
unsafe impl<T: Copy + Send> Sync for SpscRing<T> {}

impl<T: Copy> SpscRing<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be nonzero");
        let mut slots = Vec::with_capacity(capacity + 1);
        for _ in 0..capacity + 1 {
            slots.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        Self {
            slots: slots.into_boxed_slice(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    #[inline]
    fn advance(&self, index: usize) -> usize {
        let next = index + 1;
        if next == self.slots.len() {
            0
        } else {
            next
        }
    }

    /// Producer side. Fails with [`RingError::Full`] without touching the slot.
    #[inline]
    pub fn try_push(&self, value: T) -> Result<(), RingError> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = self.advance(tail);
        if next == self.head.load(Ordering::Acquire) {
            return Err(RingError::Full);
        }
        unsafe {
            (*self.slots[tail].get()).write(value);
        }
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Consumer side. Fails with [`RingError::Empty`] when nothing is queued.
    #[inline]
    pub fn try_pop(&self) -> Result<T, RingError> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return Err(RingError::Empty);
        }
        let value = unsafe { (*self.slots[head].get()).assume_init() };
        self.head.store(self.advance(head), Ordering::Release);
        Ok(value)
    }

    /// Snapshot emptiness check, callable from either side.
    ///
    /// The answer may be stale by the time the caller acts on it, which is
    /// fine for its single use as an "anything pending?" observer.
    #[inline]
    pub fn was_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }
}
