//! Size-classed byte buffers.
//!
//! Requests are rounded up to the smallest class that fits; returned buffers
//! are filed under the largest class their *capacity* still satisfies and
//! shrunk to that class's size, so every pooled buffer holds exactly
//! `SIZE_CLASSES[n]` bytes. Both mappings are closed-form over `log2`, no
//! scanning.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::Pool;

/// Capacity tiers, smallest first: 2 KiB, 8 KiB, 32 KiB, 128 KiB, 512 KiB, 1 MiB.
pub const SIZE_CLASSES: [usize; 6] = [
    2 << 10,
    8 << 10,
    32 << 10,
    128 << 10,
    512 << 10,
    1 << 20,
];

const LAST: usize = SIZE_CLASSES.len() - 1;
const MIN_SIZE: usize = SIZE_CLASSES[0];
const MAX_SIZE: usize = SIZE_CLASSES[LAST];

const DEFAULT_MAX_IDLE: usize = 256;

/// Class serving a request for `min` bytes. Out-of-range requests clamp.
///
/// Classes up to 512 KiB sit on odd powers of two (2^11, 2^13, ...), so the
/// index is `(ceil_log2(min) - 10) / 2`; everything above 512 KiB lands in
/// the 1 MiB class.
#[inline]
fn request_class(min: usize) -> usize {
    if min <= MIN_SIZE {
        return 0;
    }
    let ceil_log2 = (usize::BITS - (min - 1).leading_zeros()) as usize;
    ((ceil_log2 - 10) / 2).min(LAST)
}

/// Class a buffer of `capacity` bytes is returned to, if any.
#[inline]
fn capacity_class(capacity: usize) -> Option<usize> {
    if !(MIN_SIZE..=MAX_SIZE).contains(&capacity) {
        return None;
    }
    if capacity == MAX_SIZE {
        return Some(LAST);
    }
    let floor_log2 = (usize::BITS - 1 - capacity.leading_zeros()) as usize;
    Some((floor_log2 - 11) / 2)
}

/// A concurrent pool of byte buffers in fixed size classes.
pub struct BufferPool {
    classes: [Pool<Vec<u8>>; SIZE_CLASSES.len()],
}

impl BufferPool {
    /// Creates a pool retaining at most `max_idle` buffers per class.
    pub fn new(max_idle: usize) -> Self {
        Self {
            classes: SIZE_CLASSES.map(|size| Pool::new(max_idle, move || Vec::with_capacity(size))),
        }
    }

    /// Returns an empty buffer whose capacity is at least `min`.
    ///
    /// The buffer comes from the smallest class that fits. Requests larger
    /// than the largest class are served from it and grown to `min`; such a
    /// buffer is dropped instead of pooled when it comes back.
    pub fn get(&self, min: usize) -> Vec<u8> {
        let mut buf = self.classes[request_class(min)].get();
        if buf.capacity() < min {
            buf.reserve_exact(min);
        }
        buf
    }

    /// Returns `buf` to the class matching its capacity.
    ///
    /// A buffer that grew past its class is shrunk back to the class size
    /// first, and dropped if the allocator keeps it larger. Unallocated
    /// buffers are ignored. Buffers smaller than the smallest class or larger
    /// than the largest one are dropped.
    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() == 0 {
            return;
        }
        let Some(class) = capacity_class(buf.capacity()) else {
            return;
        };
        let size = SIZE_CLASSES[class];
        if buf.capacity() != size {
            buf.clear();
            buf.shrink_to(size);
            if buf.capacity() != size {
                return;
            }
        }
        self.classes[class].put(buf);
    }

    /// Leases a buffer that returns itself to this pool on drop.
    pub fn lease(self: &Arc<Self>, min: usize) -> PooledBuf {
        PooledBuf { buf: self.get(min), pool: Arc::clone(self) }
    }

    /// Idle buffers per class, smallest class first.
    pub fn idle(&self) -> [usize; SIZE_CLASSES.len()] {
        std::array::from_fn(|i| self.classes[i].idle())
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}

/// A pooled buffer that goes back to its [`BufferPool`] when dropped.
///
/// Dereferences to the underlying `Vec<u8>`; the lease is the only owner, so
/// no two requests ever see the same allocation at the same time.
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.buf.len())
            .field("capacity", &self.buf.capacity())
            .finish()
    }
}
