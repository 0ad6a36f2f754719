//! Native Buffer Management for Engine Results
//!
//! The engine hands results (mangled names, symbol lookups) back to callers
//! in short-lived buffers it owns. Every buffer handed out must be handed back
//! through the matching dispose call, on every exit path.
//!
//! - [`BufferPool`] recycles released buffers so lookups do not hit the
//!   allocator once the pool is warm, and counts outstanding buffers so leaks
//!   are observable.
//! - [`ScopedBuffer`] and [`with_scoped_buffer`] give the acquire/use/release
//!   bracket: release runs on success, early return, error and unwinding.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Mutex;
use tracing::{debug, info};

/// Default capacity in bytes for a newly allocated buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 256;

/// A byte buffer owned by the native engine.
#[derive(Debug)]
pub struct NativeBuffer {
    /// Underlying storage.
    data: Vec<u8>,
    /// The capacity this buffer was created with (used for stats/matching).
    capacity: usize,
}

impl NativeBuffer {
    /// Create a new, empty buffer with room for `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Write `src` into the buffer, replacing any previous contents.
    pub fn write(&mut self, src: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(src);
    }

    /// Returns a slice over the valid data in the buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the capacity the buffer was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reset the buffer for reuse, keeping the allocation.
    fn reset(&mut self) {
        self.data.clear();
    }
}

/// Runtime statistics for a [`BufferPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Total number of buffers allocated since pool creation.
    pub total_allocations: usize,
    /// Number of times an existing buffer was reused from the pool.
    pub reuses: usize,
    /// Number of buffers returned through [`BufferPool::release`].
    pub releases: usize,
    /// Number of buffers currently checked out (not yet released).
    pub active_count: usize,
}

struct PoolState {
    free_list: VecDeque<NativeBuffer>,
    total_allocations: usize,
    reuses: usize,
    releases: usize,
    active_count: usize,
}

/// A thread-safe pool of reusable [`NativeBuffer`]s.
///
/// The pool first serves requests from its free-list and only allocates
/// when the free-list is empty.
pub struct BufferPool {
    /// Default capacity for newly created buffers.
    default_capacity: usize,
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Create a new, empty buffer pool.
    pub fn new(capacity: usize) -> Self {
        info!(capacity, "Creating native BufferPool");
        Self {
            default_capacity: capacity,
            state: Mutex::new(PoolState {
                free_list: VecDeque::new(),
                total_allocations: 0,
                reuses: 0,
                releases: 0,
                active_count: 0,
            }),
        }
    }

    /// Obtain a buffer from the pool.
    pub fn acquire(&self) -> NativeBuffer {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let buf = if let Some(mut buf) = state.free_list.pop_front() {
            buf.reset();
            state.reuses += 1;
            buf
        } else {
            state.total_allocations += 1;
            debug!("Allocating new native buffer");
            NativeBuffer::new(self.default_capacity)
        };
        state.active_count += 1;
        buf
    }

    /// Return a buffer to the pool for future reuse.
    pub fn release(&self, buf: NativeBuffer) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active_count = state.active_count.saturating_sub(1);
        state.releases += 1;
        state.free_list.push_back(buf);
    }

    /// Snapshot the pool's runtime statistics.
    pub fn get_stats(&self) -> BufferPoolStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        BufferPoolStats {
            total_allocations: state.total_allocations,
            reuses: state.reuses,
            releases: state.releases,
            active_count: state.active_count,
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

/// A native resource that is released when the guard goes out of scope.
///
/// ```
/// # use jitlayer_core::engine::buffer::{BufferPool, ScopedBuffer};
/// let pool = BufferPool::default();
/// {
///     let mut buf = ScopedBuffer::new(pool.acquire(), |b| pool.release(b));
///     buf.write(b"_foo");
///     assert_eq!(buf.as_slice(), b"_foo");
/// }
/// assert_eq!(pool.get_stats().active_count, 0);
/// ```
pub struct ScopedBuffer<T, F: FnOnce(T)> {
    inner: Option<(T, F)>,
}

impl<T, F: FnOnce(T)> ScopedBuffer<T, F> {
    pub fn new(value: T, release: F) -> Self {
        Self {
            inner: Some((value, release)),
        }
    }
}

impl<T, F: FnOnce(T)> Deref for ScopedBuffer<T, F> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.inner {
            Some((value, _)) => value,
            None => unreachable!("scoped buffer accessed after release"),
        }
    }
}

impl<T, F: FnOnce(T)> std::ops::DerefMut for ScopedBuffer<T, F> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.inner {
            Some((value, _)) => value,
            None => unreachable!("scoped buffer accessed after release"),
        }
    }
}

impl<T, F: FnOnce(T)> Drop for ScopedBuffer<T, F> {
    fn drop(&mut self) {
        if let Some((value, release)) = self.inner.take() {
            release(value);
        }
    }
}

/// Acquire a native resource, pass it to `body`, then release it.
///
/// If `acquire` fails nothing was obtained and nothing is released. Once it
/// succeeds, `release` runs exactly once whatever `body` does, including
/// panicking.
pub fn with_scoped_buffer<T, U, E>(
    acquire: impl FnOnce() -> Result<T, E>,
    release: impl FnOnce(T),
    body: impl FnOnce(&T) -> Result<U, E>,
) -> Result<U, E> {
    let guard = ScopedBuffer::new(acquire()?, release);
    body(&guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_buffer_write_and_read() {
        let mut buf = NativeBuffer::new(64);
        buf.write(b"hello world");
        assert_eq!(buf.len(), 11);
        assert!(!buf.is_empty());
        assert_eq!(buf.as_slice(), b"hello world");
        assert_eq!(buf.capacity(), 64);
    }

    #[test]
    fn test_buffer_overwrite() {
        let mut buf = NativeBuffer::new(64);
        buf.write(b"first");
        buf.write(b"second");
        assert_eq!(buf.as_slice(), b"second");
    }

    #[test]
    fn test_pool_reuse() {
        let pool = BufferPool::new(32);

        let buf = pool.acquire();
        pool.release(buf);
        let _buf2 = pool.acquire();

        let stats = pool.get_stats();
        assert_eq!(stats.total_allocations, 1);
        assert_eq!(stats.reuses, 1);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.active_count, 1);
    }

    #[test]
    fn test_pool_released_buffer_is_empty() {
        let pool = BufferPool::new(128);
        let mut buf = pool.acquire();
        buf.write(b"leftover data");
        pool.release(buf);

        let reused = pool.acquire();
        assert!(reused.is_empty(), "reused buffer should be cleared");
    }

    #[test]
    fn test_scoped_release_on_success() {
        let pool = BufferPool::default();
        let out: Result<usize, ()> = with_scoped_buffer(
            || {
                let mut b = pool.acquire();
                b.write(b"abc");
                Ok(b)
            },
            |b| pool.release(b),
            |b| Ok(b.len()),
        );
        assert_eq!(out, Ok(3));
        assert_eq!(pool.get_stats().active_count, 0);
    }

    #[test]
    fn test_scoped_release_on_error() {
        let pool = BufferPool::default();
        let out: Result<(), &str> =
            with_scoped_buffer(|| Ok(pool.acquire()), |b| pool.release(b), |_| Err("decode failed"));
        assert_eq!(out, Err("decode failed"));
        assert_eq!(pool.get_stats().active_count, 0);
        assert_eq!(pool.get_stats().releases, 1);
    }

    #[test]
    fn test_scoped_no_release_when_acquire_fails() {
        let released = Cell::new(0);
        let out: Result<(), &str> = with_scoped_buffer(
            || Err::<NativeBuffer, _>("out of memory"),
            |_| released.set(released.get() + 1),
            |_| Ok(()),
        );
        assert_eq!(out, Err("out of memory"));
        assert_eq!(released.get(), 0);
    }

    #[test]
    fn test_scoped_release_on_panic() {
        let pool = BufferPool::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = ScopedBuffer::new(pool.acquire(), |b| pool.release(b));
            panic!("consumer failed");
        }));
        assert!(result.is_err());
        assert_eq!(pool.get_stats().active_count, 0);
    }
}
