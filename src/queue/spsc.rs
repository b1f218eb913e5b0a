//! Wait-free single-producer / single-consumer ring buffer.
//!
//! `channel(capacity)` returns the two halves. Neither half is `Clone`, so
//! the type system keeps it at exactly one producer and one consumer.
//!
//! ```text
//!   Producer ── push() ──▶ [ slot | slot | slot | ... ] ──▶ pop() ── Consumer
//!               writes slot, then             reads slot, then
//!               tail.store(Release)           head.store(Release)
//! ```
//!
//! Capacity is fixed at construction. A full buffer never overwrites: `push`
//! hands the element back in `QueueFull` and the caller decides whether to
//! spin or drop. Sizing the buffer so that the steady-state producer rate
//! stays below the drain rate is an operational concern.

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

/// Returned by `push` when the buffer is full. Owns the rejected element.
pub struct QueueFull<T>(pub T);

impl<T> QueueFull<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> std::fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("QueueFull(..)")
    }
}

impl<T> std::fmt::Display for QueueFull<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("lock-free queue is full")
    }
}

impl<T> std::error::Error for QueueFull<T> {}

struct Shared<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    capacity: usize,
    /// Next slot to read. Written by the consumer only.
    head: CachePadded<AtomicUsize>,
    /// Next slot to write. Written by the producer only.
    tail: CachePadded<AtomicUsize>,
}

// Slots in [head, tail) belong to the consumer, the rest to the producer.
// Ownership of a slot moves only through the Release/Acquire pair on
// head/tail, so each slot is touched by one thread at a time.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    #[inline(always)]
    fn slot(&self, pos: usize) -> *mut MaybeUninit<T> {
        self.buffer[pos % self.capacity].get()
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mut pos = head;
        while pos != tail {
            // SAFETY: every slot in [head, tail) was written and not yet read.
            unsafe { (*self.slot(pos)).assume_init_drop() };
            pos = pos.wrapping_add(1);
        }
    }
}

/// Writing half.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
    tail: usize,
    head_cache: usize,
}

/// Reading half.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
    head: usize,
    tail_cache: usize,
}

/// Create a ring buffer that holds up to `capacity` elements.
///
/// # Panics
/// If `capacity` is zero.
pub fn channel<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity > 0, "lock-free queue capacity must be non-zero");
    let buffer = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let shared = Arc::new(Shared {
        buffer,
        capacity,
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
    });
    (
        Producer { shared: Arc::clone(&shared), tail: 0, head_cache: 0 },
        Consumer { shared, head: 0, tail_cache: 0 },
    )
}

impl<T> Producer<T> {
    /// Append `value`, or give it back if the buffer is full.
    #[inline]
    pub fn push(&mut self, value: T) -> Result<(), QueueFull<T>> {
        let cap = self.shared.capacity;
        if self.tail.wrapping_sub(self.head_cache) == cap {
            self.head_cache = self.shared.head.load(Ordering::Acquire);
            if self.tail.wrapping_sub(self.head_cache) == cap {
                return Err(QueueFull(value));
            }
        }
        // SAFETY: the slot is outside [head, tail) so the consumer cannot read it.
        unsafe { (*self.shared.slot(self.tail)).write(value) };
        self.tail = self.tail.wrapping_add(1);
        self.shared.tail.store(self.tail, Ordering::Release);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Elements currently buffered. Exact from the producer's point of view
    /// up to concurrent pops.
    pub fn len(&self) -> usize {
        self.tail.wrapping_sub(self.shared.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the consumer half has been dropped.
    pub fn is_abandoned(&self) -> bool {
        let alone = Arc::strong_count(&self.shared) == 1;
        if alone {
            // Pairs with the Release decrement in the other half's drop.
            fence(Ordering::Acquire);
        }
        alone
    }
}

impl<T> Consumer<T> {
    /// Take the oldest element, `None` when head == tail.
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        if self.head == self.tail_cache {
            self.tail_cache = self.shared.tail.load(Ordering::Acquire);
            if self.head == self.tail_cache {
                return None;
            }
        }
        // SAFETY: the slot is inside [head, tail) and was published by the
        // producer's Release store observed by the Acquire load above.
        let value = unsafe { (*self.shared.slot(self.head)).assume_init_read() };
        self.head = self.head.wrapping_add(1);
        self.shared.head.store(self.head, Ordering::Release);
        Some(value)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn len(&self) -> usize {
        self.shared.tail.load(Ordering::Acquire).wrapping_sub(self.head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the producer half has been dropped.
    pub fn is_abandoned(&self) -> bool {
        let alone = Arc::strong_count(&self.shared) == 1;
        if alone {
            // Pairs with the Release decrement in the other half's drop.
            fence(Ordering::Acquire);
        }
        alone
    }
}
