//! Object pools.
//!
//! Everything the pipeline recycles per request goes through [`Pool`]: a
//! lock-free bounded free list with a factory for misses. Acquisition never
//! waits; an empty pool simply allocates. Items are [`Recycle`]d before
//! they are retained so nothing from one request survives into the next.

mod buffer;
mod event;

use crossbeam_queue::ArrayQueue;

pub use buffer::{BufferPool, PooledBuf, SIZE_CLASSES};
pub use event::{EventPool, LogEvent};

/// Reset hook applied to every item handed back to a [`Pool`].
pub trait Recycle {
    /// Clear all state, keeping any allocation worth reusing.
    fn recycle(&mut self);
}

impl Recycle for Vec<u8> {
    fn recycle(&mut self) {
        self.clear();
    }
}

/// A thread-safe pool of reusable `T`s.
pub struct Pool<T> {
    // `None` when the pool retains nothing; `ArrayQueue` rejects capacity 0.
    idle: Option<ArrayQueue<T>>,
    make: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Recycle> Pool<T> {
    /// Creates a pool that allocates with `make` on a miss and keeps at most
    /// `max_idle` recycled items around.
    pub fn new(max_idle: usize, make: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let idle = (max_idle > 0).then(|| ArrayQueue::new(max_idle));
        Self { idle, make: Box::new(make) }
    }

    /// Takes an idle item, or makes a fresh one.
    pub fn get(&self) -> T {
        self.idle
            .as_ref()
            .and_then(ArrayQueue::pop)
            .unwrap_or_else(|| (self.make)())
    }

    /// Recycles `item` and keeps it if the pool has room; otherwise drops it.
    pub fn put(&self, mut item: T) {
        item.recycle();
        if let Some(idle) = &self.idle {
            // A full queue hands the item back; dropping it frees it.
            let _ = idle.push(item);
        }
    }

    /// Number of items currently waiting for reuse.
    pub fn idle(&self) -> usize {
        self.idle.as_ref().map_or(0, ArrayQueue::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn misses_call_the_factory() {
        let made = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&made);
        let pool = Pool::new(4, move || {
            counter.fetch_add(1, Ordering::Relaxed);
            Vec::<u8>::with_capacity(16)
        });

        let a = pool.get();
        let b = pool.get();
        assert_eq!(made.load(Ordering::Relaxed), 2);

        pool.put(a);
        pool.put(b);
        let _ = pool.get();
        assert_eq!(made.load(Ordering::Relaxed), 2);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn put_recycles_and_respects_max_idle() {
        let pool = Pool::new(1, Vec::<u8>::new);

        let mut buf = pool.get();
        buf.extend_from_slice(b"left over");
        pool.put(buf);
        pool.put(vec![1, 2, 3]);
        assert_eq!(pool.idle(), 1);

        assert!(pool.get().is_empty());
    }

    #[test]
    fn zero_max_idle_retains_nothing() {
        let pool = Pool::new(0, Vec::<u8>::new);
        pool.put(vec![1]);
        assert_eq!(pool.idle(), 0);
        assert!(pool.get().is_empty());
    }

    #[test]
    fn concurrent_put_never_exceeds_max_idle() {
        let pool = Arc::new(Pool::new(4, || Vec::<u8>::with_capacity(8)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let a = pool.get();
                        let b = pool.get();
                        pool.put(a);
                        pool.put(b);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked");
        }
        assert!(pool.idle() <= 4);
    }
}
