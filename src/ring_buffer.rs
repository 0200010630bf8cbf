//! A single-producer/single-consumer byte ring living inside a caller-supplied
//! region of shared memory.
//!
//! The header and payload are placed in-line at a raw pointer handed to us by
//! the [`crate::connection::Connection`] that owns the segment; we never
//! allocate memory ourselves. The only inter-process synchronization is the
//! `size` atomic: the producer publishes writes to it with `Release`, the
//! consumer observes it with `Acquire` before touching the payload, and vice
//! versa for the read side.

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::timeout::{DirectionalTimeouts, Timeout};

/// Which side of a buffer an operation is being performed against; used only
/// to pick `read_timeout` vs. `write_timeout` inside this module, distinct
/// from [`crate::connection::Direction`] which picks server vs. client buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Read,
    Write,
}

/// Packs a [`Timeout`] into a single `u64` so it can live behind one atomic
/// word in shared memory: bits 0-1 are the tag, the remaining bits are a
/// nanosecond count (truncated, which only matters for timeouts longer than
/// ~146 years).
const TAG_NONE: u64 = 0;
const TAG_ZERO: u64 = 1;
const TAG_FINITE: u64 = 2;
const TAG_INFINITE: u64 = 3;

fn pack_timeout(t: Timeout) -> u64 {
    match t {
        Timeout::None => TAG_NONE,
        Timeout::Zero => TAG_ZERO,
        Timeout::Infinite => TAG_INFINITE,
        Timeout::Finite(d) => {
            let nanos = d.as_nanos().min(u128::from(u64::MAX >> 2)) as u64;
            TAG_FINITE | (nanos << 2)
        }
    }
}

fn unpack_timeout(packed: u64) -> Timeout {
    match packed & 0b11 {
        TAG_NONE => Timeout::None,
        TAG_ZERO => Timeout::Zero,
        TAG_INFINITE => Timeout::Infinite,
        TAG_FINITE => Timeout::Finite(Duration::from_nanos(packed >> 2)),
        _ => unreachable!("only two tag bits are ever written"),
    }
}

#[repr(C)]
struct Header {
    capacity: u32,
    _reserved: u32,
    read_index: AtomicU32,
    write_index: AtomicU32,
    size: AtomicU32,
    read_timeout: AtomicU64,
    write_timeout: AtomicU64,
}

/// An in-place ring buffer view over shared memory. Cloning a `RingBuffer` is
/// intentionally not provided: one handle per process per buffer direction is
/// the contract, matching one producer and one consumer.
pub struct RingBuffer {
    header: NonNull<Header>,
    payload: NonNull<u8>,
}

// The header lives in shared memory and is synchronized via its own atomics;
// sending a `RingBuffer` to another thread in the same process (e.g. handing
// the client buffer to a reader thread) is sound under that discipline.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Bytes a buffer of the given payload capacity occupies in a segment,
    /// header included, rounded up to a multiple of `align_of::<Header>()`.
    ///
    /// `Header` carries `AtomicU64` timeout fields, so it needs 8-byte
    /// alignment; rounding the footprint up here, rather than just summing
    /// header and capacity, is what keeps the *next* buffer's header
    /// (placed immediately after this one in a `Connection`'s segment)
    /// aligned too, whatever the previous buffer's capacity was.
    pub fn segment_size_of(capacity: u32) -> usize {
        let raw = size_of::<Header>() + capacity as usize;
        let align = std::mem::align_of::<Header>();
        (raw + align - 1) & !(align - 1)
    }

    /// Initializes a new buffer header at `region` and claims the following
    /// `capacity` bytes as payload.
    ///
    /// # Safety
    ///
    /// `region` must point to at least `segment_size_of(capacity)` bytes of
    /// memory that this call exclusively owns (no other buffer may overlap
    /// it), and that memory must outlive the returned `RingBuffer` and every
    /// other process's attachment to it.
    pub unsafe fn create(
        region: NonNull<u8>,
        capacity: u32,
        timeouts: DirectionalTimeouts,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument {
                reason: "ring buffer capacity must be greater than zero",
            });
        }

        let header = region.cast::<Header>();
        unsafe {
            header.as_ptr().write(Header {
                capacity,
                _reserved: 0,
                read_index: AtomicU32::new(0),
                write_index: AtomicU32::new(0),
                size: AtomicU32::new(0),
                read_timeout: AtomicU64::new(pack_timeout(timeouts.read)),
                write_timeout: AtomicU64::new(pack_timeout(timeouts.write)),
            });
        }

        let payload = unsafe { NonNull::new_unchecked(region.as_ptr().add(size_of::<Header>())) };
        Ok(RingBuffer { header, payload })
    }

    /// Binds a view over a buffer an earlier `create` call (in this process
    /// or another) already initialized at `region`.
    ///
    /// # Safety
    ///
    /// `region` must point at a buffer previously initialized by `create`,
    /// still alive, with the same `capacity` the creator used.
    pub unsafe fn attach(region: NonNull<u8>) -> Self {
        let header = region.cast::<Header>();
        let payload = unsafe { NonNull::new_unchecked(region.as_ptr().add(size_of::<Header>())) };
        RingBuffer { header, payload }
    }

    fn header(&self) -> &Header {
        unsafe { self.header.as_ref() }
    }

    pub fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    pub fn used_space(&self) -> usize {
        self.header().size.load(Ordering::Acquire) as usize
    }

    pub fn free_space(&self) -> usize {
        self.capacity() - self.used_space()
    }

    pub fn set_timeout(&self, direction: Side, timeout: Timeout) {
        let field = match direction {
            Side::Read => &self.header().read_timeout,
            Side::Write => &self.header().write_timeout,
        };
        field.store(pack_timeout(timeout), Ordering::Relaxed);
    }

    pub fn set_read_timeout(&self, timeout: Timeout) {
        self.set_timeout(Side::Read, timeout);
    }

    pub fn set_write_timeout(&self, timeout: Timeout) {
        self.set_timeout(Side::Write, timeout);
    }

    pub fn set_nonblocking(&self, direction: Side, nonblocking: bool) {
        let timeout = if nonblocking { Timeout::Zero } else { Timeout::Infinite };
        self.set_timeout(direction, timeout);
    }

    fn read_timeout(&self) -> Timeout {
        unpack_timeout(self.header().read_timeout.load(Ordering::Relaxed))
    }

    fn write_timeout(&self) -> Timeout {
        unpack_timeout(self.header().write_timeout.load(Ordering::Relaxed))
    }

    /// Copies `src[..n]` into the payload starting at `write_index`, wrapping
    /// at `capacity` with at most two `copy_nonoverlapping` calls.
    unsafe fn copy_in(&self, src: *const u8, n: usize) {
        let capacity = self.capacity();
        let write_index = self.header().write_index.load(Ordering::Relaxed) as usize;
        let first_len = n.min(capacity - write_index);
        let second_len = n - first_len;

        unsafe {
            std::ptr::copy_nonoverlapping(src, self.payload.as_ptr().add(write_index), first_len);
            if second_len > 0 {
                std::ptr::copy_nonoverlapping(src.add(first_len), self.payload.as_ptr(), second_len);
            }
        }

        let new_index = (write_index + n) % capacity;
        self.header()
            .write_index
            .store(new_index as u32, Ordering::Relaxed);
    }

    /// Symmetric to `copy_in`: copies `n` bytes starting at `read_index` into
    /// `dst`. Does not by itself advance `read_index`; callers decide
    /// whether this is a destructive read or a peek.
    unsafe fn copy_out(&self, dst: *mut u8, n: usize) {
        let capacity = self.capacity();
        let read_index = self.header().read_index.load(Ordering::Relaxed) as usize;
        let first_len = n.min(capacity - read_index);
        let second_len = n - first_len;

        unsafe {
            std::ptr::copy_nonoverlapping(self.payload.as_ptr().add(read_index), dst, first_len);
            if second_len > 0 {
                std::ptr::copy_nonoverlapping(self.payload.as_ptr(), dst.add(first_len), second_len);
            }
        }
    }

    fn advance_read_index(&self, n: usize) {
        let capacity = self.capacity();
        let read_index = self.header().read_index.load(Ordering::Relaxed) as usize;
        let new_index = (read_index + n) % capacity;
        self.header()
            .read_index
            .store(new_index as u32, Ordering::Relaxed);
    }

    /// Generic blocking loop shared by write and the destructive read: calls
    /// `try_once` until it reports progress, the configured timeout expires,
    /// or (for a zero/non-blocking timeout) immediately after the first try.
    fn spin_until<F: FnMut() -> usize>(&self, timeout: Timeout, mut try_once: F) -> usize {
        let transferred = try_once();
        if transferred > 0 || !timeout.blocks() {
            return transferred;
        }

        let deadline = timeout.deadline_from(Instant::now());
        let mut spins: u32 = 0;
        loop {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return 0;
                }
            }

            // Exponential backoff: busy-spin briefly, then start yielding the
            // timeslice so we don't starve the peer process on a single-core
            // host while we wait for its atomic store to land.
            if spins < 8 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
            spins = spins.saturating_add(1);

            let transferred = try_once();
            if transferred > 0 {
                return transferred;
            }
        }
    }

    /// Writes up to `src.len()` bytes, honoring the configured write
    /// timeout. Returns the number of bytes actually written, which may be
    /// less than `src.len()` (including zero).
    pub fn write(&self, src: &[u8]) -> usize {
        if src.is_empty() {
            return 0;
        }
        let timeout = self.write_timeout();
        self.spin_until(timeout, || {
            let free = self.free_space();
            if free == 0 {
                return 0;
            }
            let n = free.min(src.len());
            unsafe { self.copy_in(src.as_ptr(), n) };
            self.header().size.fetch_add(n as u32, Ordering::Release);
            n
        })
    }

    /// Reads up to `dst.len()` bytes, advancing past them. Honors the
    /// configured read timeout.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }
        let timeout = self.read_timeout();
        self.spin_until(timeout, || {
            let used = self.used_space();
            if used == 0 {
                return 0;
            }
            let n = used.min(dst.len());
            unsafe { self.copy_out(dst.as_mut_ptr(), n) };
            self.advance_read_index(n);
            self.header().size.fetch_sub(n as u32, Ordering::Release);
            n
        })
    }

    /// Reads up to `dst.len()` bytes without advancing past them. Honors the
    /// configured read timeout the same way `read` does.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }
        let timeout = self.read_timeout();
        self.spin_until(timeout, || {
            let used = self.used_space();
            if used == 0 {
                return 0;
            }
            let n = used.min(dst.len());
            unsafe { self.copy_out(dst.as_mut_ptr(), n) };
            n
        })
    }

    /// Advances past up to `n` unread bytes without copying them anywhere.
    /// Honors the configured read timeout.
    pub fn skip(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let timeout = self.read_timeout();
        self.spin_until(timeout, || {
            let used = self.used_space();
            if used == 0 {
                return 0;
            }
            let skipped = used.min(n);
            self.advance_read_index(skipped);
            self.header().size.fetch_sub(skipped as u32, Ordering::Release);
            skipped
        })
    }

    /// Raw-pointer entry point used by the bridge's façade-facing dispatch,
    /// where the caller only has a `*const u8`/`len` pair from libc. Mirrors
    /// [`RingBuffer::write`] but validates the pointer per the design's
    /// INVALID_ARGUMENT rule.
    ///
    /// # Safety
    ///
    /// If `src` is non-null, it must be valid for reads of `n` bytes.
    pub unsafe fn write_ptr(&self, src: *const u8, n: usize) -> Result<usize> {
        if n == 0 {
            return Ok(0);
        }
        if src.is_null() {
            return Err(Error::InvalidArgument {
                reason: "write source pointer is null",
            });
        }
        Ok(self.write(unsafe { std::slice::from_raw_parts(src, n) }))
    }

    /// Raw-pointer counterpart to [`RingBuffer::read`].
    ///
    /// # Safety
    ///
    /// If `dst` is non-null, it must be valid for writes of `n` bytes.
    pub unsafe fn read_ptr(&self, dst: *mut u8, n: usize) -> Result<usize> {
        if n == 0 {
            return Ok(0);
        }
        if dst.is_null() {
            return Err(Error::InvalidArgument {
                reason: "read destination pointer is null",
            });
        }
        Ok(self.read(unsafe { std::slice::from_raw_parts_mut(dst, n) }))
    }
}

pub use Side::{Read as ReadSide, Write as WriteSide};

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::Rng;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct OwnedRegion {
        ptr: NonNull<u8>,
        layout: Layout,
    }

    impl OwnedRegion {
        fn for_capacity(capacity: u32) -> Self {
            let size = RingBuffer::segment_size_of(capacity);
            let layout = Layout::from_size_align(size, 8).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            OwnedRegion {
                ptr: NonNull::new(ptr).expect("allocation failed"),
                layout,
            }
        }
    }

    impl Drop for OwnedRegion {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }

    fn fresh(capacity: u32) -> (OwnedRegion, RingBuffer) {
        let region = OwnedRegion::for_capacity(capacity);
        let buffer = unsafe {
            RingBuffer::create(region.ptr, capacity, DirectionalTimeouts::default()).unwrap()
        };
        (region, buffer)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_region, buf) = fresh(16);
        let written = buf.write(b"hello");
        assert_eq!(written, 5);
        assert_eq!(buf.used_space(), 5);
        assert_eq!(buf.free_space(), 11);

        let mut out = [0u8; 5];
        let read = buf.read(&mut out);
        assert_eq!(read, 5);
        assert_eq!(&out, b"hello");
        assert_eq!(buf.used_space(), 0);
        assert_eq!(buf.free_space(), 16);
    }

    #[test]
    fn used_plus_free_is_always_capacity() {
        let (_region, buf) = fresh(32);
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let n: usize = rng.gen_range(1, 10);
            let data: Vec<u8> = (0..n).map(|_| rng.gen()).collect();
            let mut sink = vec![0u8; n];
            buf.write(&data);
            buf.read(&mut sink);
            assert_eq!(buf.used_space() + buf.free_space(), buf.capacity());
        }
    }

    #[test]
    fn exact_capacity_write_fully_succeeds() {
        let (_region, buf) = fresh(16);
        let data = vec![7u8; 16];
        assert_eq!(buf.write(&data), 16);
        assert_eq!(buf.free_space(), 0);
    }

    #[test]
    fn nonblocking_write_past_capacity_is_truncated() {
        let (_region, buf) = fresh(16);
        buf.set_write_timeout(Timeout::Zero);
        let data = vec![1u8; 17];
        assert_eq!(buf.write(&data), 16);
    }

    #[test]
    fn nonblocking_read_of_empty_buffer_returns_zero_immediately() {
        let (_region, buf) = fresh(8);
        buf.set_read_timeout(Timeout::Zero);
        let mut out = [0u8; 8];
        let started = Instant::now();
        assert_eq!(buf.read(&mut out), 0);
        assert!(started.elapsed() < Duration::from_millis(20));
    }

    #[test]
    fn timed_read_of_empty_buffer_waits_then_returns_zero() {
        let (_region, buf) = fresh(8);
        buf.set_read_timeout(Timeout::Finite(Duration::from_millis(50)));
        let mut out = [0u8; 8];
        let started = Instant::now();
        assert_eq!(buf.read(&mut out), 0);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(buf.used_space(), 0);
    }

    #[test]
    fn wraparound_carries_the_tail_across_the_boundary() {
        let (_region, buf) = fresh(16);
        let filler = vec![9u8; 15];
        assert_eq!(buf.write(&filler), 15);

        let mut sink = vec![0u8; 15];
        assert_eq!(buf.read(&mut sink), 15);
        assert_eq!(sink, filler);

        assert_eq!(buf.write(b"ab"), 2);
        let mut tail = [0u8; 2];
        assert_eq!(buf.read(&mut tail), 2);
        assert_eq!(&tail, b"ab");
    }

    #[test]
    fn peek_does_not_advance() {
        let (_region, buf) = fresh(16);
        buf.write(b"abcd");
        let mut out = [0u8; 4];
        assert_eq!(buf.peek(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(buf.used_space(), 4);

        let mut again = [0u8; 4];
        assert_eq!(buf.read(&mut again), 4);
        assert_eq!(&again, b"abcd");
    }

    #[test]
    fn skip_advances_without_copying() {
        let (_region, buf) = fresh(16);
        buf.write(b"abcdef");
        assert_eq!(buf.skip(3), 3);
        let mut out = [0u8; 3];
        assert_eq!(buf.read(&mut out), 3);
        assert_eq!(&out, b"def");
    }

    #[test]
    fn timeout_packing_round_trips() {
        for t in [
            Timeout::None,
            Timeout::Zero,
            Timeout::Infinite,
            Timeout::Finite(Duration::from_millis(7)),
        ] {
            assert_eq!(unpack_timeout(pack_timeout(t)), t);
        }
    }

    #[test]
    fn segment_size_of_is_always_header_aligned() {
        // A `Header` holds `AtomicU64` fields, so anything placed right after
        // one buffer's footprint (the next buffer's header, in a
        // `Connection`'s segment) needs that footprint to land on an 8-byte
        // boundary regardless of the odd capacities a caller might pick.
        let align = std::mem::align_of::<Header>();
        for capacity in 1u32..64 {
            assert_eq!(RingBuffer::segment_size_of(capacity) % align, 0);
        }
    }
}
