//! Bounded lock-free single-producer/single-consumer ring.
//!
//! Every cross-task edge in the runtime is exactly one of these rings. The
//! producer never blocks: when the ring is full, [`Producer::next_to_write`]
//! returns `None` and the caller drops the item (counted). The consumer is
//! expected to spin with a short sleep when the ring is empty.
//!
//! The split into [`Producer`] and [`Consumer`] handles enforces the
//! one-producer/one-consumer contract in the type system; neither handle is
//! cloneable.

use std::{
    cell::UnsafeCell,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

struct Inner<T> {
    slots: Box<[UnsafeCell<T>]>,
    capacity: usize,
    /// Monotonic write counter; slot index is `write % capacity`.
    write: AtomicUsize,
    /// Monotonic read counter; slot index is `read % capacity`.
    read: AtomicUsize,
    dropped: AtomicU64,
}

// The producer and consumer touch disjoint slots: a slot is owned by the
// producer until the write counter passes it (Release) and by the consumer
// until the read counter passes it (Release).
unsafe impl<T: Send> Sync for Inner<T> {}
unsafe impl<T: Send> Send for Inner<T> {}

/// Constructs a ring of the given capacity and splits it into its two
/// endpoint handles. A power-of-two capacity is preferred so the slot-index
/// modulo reduces to a mask, but any non-zero capacity is accepted.
pub struct Spsc;

impl Spsc {
    pub fn with_capacity<T: Default>(capacity: usize) -> (Producer<T>, Consumer<T>) {
        assert!(capacity > 0, "queue capacity must be non-zero");
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(T::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let inner = Arc::new(Inner {
            slots,
            capacity,
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        });
        (
            Producer {
                inner: inner.clone(),
                write: 0,
            },
            Consumer { inner, read: 0 },
        )
    }
}

/// The write endpoint of an SPSC ring.
pub struct Producer<T> {
    inner: Arc<Inner<T>>,
    // Local mirror of the atomic write counter; only this handle advances it.
    write: usize,
}

impl<T> Producer<T> {
    /// Returns the next writable slot without advancing, or `None` when the
    /// ring is full. The slot is published by [`Self::commit_write`].
    pub fn next_to_write(&mut self) -> Option<&mut T> {
        let read = self.inner.read.load(Ordering::Acquire);
        if self.write.wrapping_sub(read) == self.inner.capacity {
            return None;
        }
        let idx = self.write % self.inner.capacity;
        // Sole producer: no other writer can hold this slot, and the consumer
        // cannot observe it until commit_write publishes the counter.
        Some(unsafe { &mut *self.inner.slots[idx].get() })
    }

    /// Publishes the slot previously returned by [`Self::next_to_write`].
    pub fn commit_write(&mut self) {
        self.write = self.write.wrapping_add(1);
        self.inner.write.store(self.write, Ordering::Release);
    }

    /// Writes `value` into the next slot, or drops it (counted) when the ring
    /// is full. Returns whether the value was enqueued.
    pub fn push(&mut self, value: T) -> bool {
        match self.next_to_write() {
            Some(slot) => {
                *slot = value;
                self.commit_write();
                true
            }
            None => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Items dropped due to a full ring since construction.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn len(&self) -> usize {
        self.write
            .wrapping_sub(self.inner.read.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The read endpoint of an SPSC ring.
pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
    // Local mirror of the atomic read counter; only this handle advances it.
    read: usize,
}

impl<T> Consumer<T> {
    /// Returns the next readable slot without advancing, or `None` when the
    /// ring is empty. The slot is released by [`Self::advance_read`].
    pub fn next_to_read(&self) -> Option<&T> {
        let write = self.inner.write.load(Ordering::Acquire);
        if write == self.read {
            return None;
        }
        let idx = self.read % self.inner.capacity;
        Some(unsafe { &*self.inner.slots[idx].get() })
    }

    /// Releases the slot previously returned by [`Self::next_to_read`].
    pub fn advance_read(&mut self) {
        self.read = self.read.wrapping_add(1);
        self.inner.read.store(self.read, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn len(&self) -> usize {
        self.inner
            .write
            .load(Ordering::Acquire)
            .wrapping_sub(self.read)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Consumer<T> {
    /// Copies the next item out and releases its slot.
    pub fn pop(&mut self) -> Option<T> {
        let value = self.next_to_read()?.clone();
        self.advance_read();
        Some(value)
    }
}
