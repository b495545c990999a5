//! Michael-Scott lock-free FIFO queue.
//!
//! Multi-producer multi-consumer, unbounded. A sentinel node keeps head and
//! tail always valid; values live in the node *after* the one head points
//! at. Both enqueue and dequeue help a lagging tail forward, so no
//! operation ever waits on another thread.
//!
//! Nodes are reclaimed through `crossbeam-epoch`: a dequeued node is
//! destroyed only once no thread can still hold a reference into it, which
//! closes the ABA window the classic algorithm papers over with tagged
//! pointers.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};

struct Node<T> {
    /// Vacant in the sentinel; initialized in every linked node. Dequeue
    /// moves the value out before the node is retired.
    value: MaybeUninit<T>,
    next: Atomic<Node<T>>,
}

/// A lock-free Michael-Scott queue.
pub struct LfQueue<T> {
    head: Atomic<Node<T>>,
    tail: Atomic<Node<T>>,
    /// Approximate length for metrics; updated after each successful
    /// enqueue or dequeue, so concurrent readers may observe it lagging.
    length: AtomicI64,
}

unsafe impl<T: Send> Send for LfQueue<T> {}
unsafe impl<T: Send> Sync for LfQueue<T> {}

impl<T> LfQueue<T> {
    /// Creates an empty queue with a single sentinel node.
    pub fn new() -> Self {
        let queue = Self {
            head: Atomic::null(),
            tail: Atomic::null(),
            length: AtomicI64::new(0),
        };

        let sentinel = Owned::new(Node {
            value: MaybeUninit::uninit(),
            next: Atomic::null(),
        });

        unsafe {
            let guard = epoch::unprotected();
            let sentinel = sentinel.into_shared(guard);
            queue.head.store(sentinel, Ordering::Relaxed);
            queue.tail.store(sentinel, Ordering::Relaxed);
        }

        queue
    }

    /// Appends a value at the tail. Always succeeds; the queue itself is
    /// unbounded and callers impose capacity through backpressure.
    pub fn enqueue(&self, value: T) -> bool {
        let guard = &epoch::pin();
        let mut new = Owned::new(Node {
            value: MaybeUninit::new(value),
            next: Atomic::null(),
        });

        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, guard);

            if !next.is_null() {
                // Tail is lagging behind the real last node; help it along.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                );
                continue;
            }

            match tail_ref.next.compare_exchange(
                Shared::null(),
                new,
                Ordering::Release,
                Ordering::Relaxed,
                guard,
            ) {
                Ok(linked) => {
                    let _ = self.tail.compare_exchange(
                        tail,
                        linked,
                        Ordering::Release,
                        Ordering::Relaxed,
                        guard,
                    );
                    self.length.fetch_add(1, Ordering::SeqCst);
                    return true;
                }
                Err(err) => new = err.new,
            }
        }
    }

    /// Removes and returns the value at the head, or `None` when empty.
    pub fn dequeue(&self) -> Option<T> {
        let guard = &epoch::pin();

        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            let head_ref = unsafe { head.deref() };
            let next = head_ref.next.load(Ordering::Acquire, guard);

            let next_ref = unsafe { next.as_ref() }?;

            let tail = self.tail.load(Ordering::Acquire, guard);
            if head == tail {
                // Tail still points at the node we are about to unlink.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                );
                continue;
            }

            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, guard)
                .is_ok()
            {
                // The next node becomes the new sentinel; move its value out
                // and retire the old sentinel once all readers are done.
                let value = unsafe { next_ref.value.assume_init_read() };
                unsafe { guard.defer_destroy(head) };
                self.length.fetch_sub(1, Ordering::SeqCst);
                return Some(value);
            }
        }
    }

    /// Polls `dequeue` until a value arrives or the deadline passes,
    /// yielding the thread between attempts.
    pub fn try_dequeue(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.dequeue() {
                return Some(value);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::yield_now();
        }
    }

    /// Approximate number of queued values.
    pub fn len(&self) -> usize {
        self.length.load(Ordering::SeqCst).max(0) as usize
    }

    /// True if the queue is observed empty. Only an approximation under
    /// concurrent mutation.
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Acquire, guard);
        let next = unsafe { head.deref() }.next.load(Ordering::Acquire, guard);
        next.is_null()
    }
}

impl<T: Copy> LfQueue<T> {
    /// Returns the value at the front without removing it. Restricted to
    /// `Copy` values: a concurrent dequeue may hand ownership of the front
    /// value to another thread, so only a bitwise copy is safe to take.
    pub fn peek(&self) -> Option<T> {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Acquire, guard);
        let next = unsafe { head.deref() }.next.load(Ordering::Acquire, guard);
        let next_ref = unsafe { next.as_ref() }?;
        Some(unsafe { next_ref.value.assume_init_read() })
    }
}

impl<T> Default for LfQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LfQueue<T> {
    fn drop(&mut self) {
        unsafe {
            let guard = epoch::unprotected();
            let mut node = self.head.load(Ordering::Relaxed, guard);
            let mut is_sentinel = true;

            while !node.is_null() {
                let mut owned = node.into_owned();
                node = owned.next.load(Ordering::Relaxed, guard);
                if !is_sentinel {
                    owned.value.assume_init_drop();
                }
                is_sentinel = false;
                drop(owned);
            }
        }
    }
}
