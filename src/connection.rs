//! A reference-counted pair of ring buffers, plus the shared open-count that
//! governs the segment's lifetime, all co-located in one [`segment`].
//!
//! A `Connection` is role-agnostic: it does not know whether this process is
//! the server or the client of the pair. The caller (the façade, out of
//! scope here) picks [`Direction::Server`] or [`Direction::Client`] on every
//! read/write depending on who it is and which way the bytes are flowing.

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::ConnectionOptions;
use crate::error::{Error, Result};
use crate::ring_buffer::RingBuffer;
use crate::segment::{self, SegmentId};

/// Which of the two buffers in a connection an operation targets. Distinct
/// from [`crate::ring_buffer`]'s internal read/write side enum, which picks
/// a timeout direction within a single buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Server,
    Client,
}

/// Per-process handle onto a connection's shared segment. Sending one to
/// another thread in the same process is sound: every field it exposes is
/// either immutable after construction or backed by an atomic in shared
/// memory.
pub struct Connection {
    segment_id: SegmentId,
    region: NonNull<u8>,
    open_count: NonNull<AtomicU64>,
    server_buffer: RingBuffer,
    client_buffer: RingBuffer,
}

unsafe impl Send for Connection {}

impl Connection {
    /// Total segment size: the open-count word plus both buffers, header
    /// included. The C source accumulates this starting from an
    /// uninitialized local; here the accumulator starts at zero and overflow
    /// is checked rather than silently wrapping.
    ///
    /// The open-count word is a full `AtomicU64`, not `AtomicU32`, even
    /// though the refcount never approaches that range: `RingBuffer::Header`
    /// holds `AtomicU64` timeout fields, so its alignment is 8, and
    /// `RingBuffer::segment_size_of` already rounds each buffer's footprint
    /// up to a multiple of 8. Giving the open-count an 8-byte footprint too
    /// keeps the server header (placed right after it) 8-aligned; a 4-byte
    /// counter would leave every `AtomicU64` load and store in the header
    /// 4-aligned, which is undefined behavior and faults outright on
    /// aarch64.
    fn segment_size(options: &ConnectionOptions) -> Result<usize> {
        0usize
            .checked_add(size_of::<AtomicU64>())
            .and_then(|s| s.checked_add(RingBuffer::segment_size_of(options.server_buffer_size)))
            .and_then(|s| s.checked_add(RingBuffer::segment_size_of(options.client_buffer_size)))
            .ok_or(Error::LayoutOverflow)
    }

    /// Server-side creation: sizes and creates a brand new segment, then
    /// initializes `open_count = 1` and both buffer headers in place.
    pub fn create(options: &ConnectionOptions) -> Result<Self> {
        let size = Self::segment_size(options)?;
        let segment_id = segment::create(size)?;
        let region = match segment::attach(segment_id) {
            Ok(region) => region,
            Err(err) => {
                let _ = segment::destroy(segment_id);
                return Err(err);
            }
        };

        let open_count = region.cast::<AtomicU64>();
        unsafe { open_count.as_ptr().write(AtomicU64::new(1)) };

        let server_region = Self::after_open_count(region);
        let server_buffer = match unsafe {
            RingBuffer::create(server_region, options.server_buffer_size, options.server_timeouts)
        } {
            Ok(buffer) => buffer,
            Err(err) => {
                let _ = segment::detach(region);
                let _ = segment::destroy(segment_id);
                return Err(err);
            }
        };

        let client_region = Self::after_server_buffer(server_region, options);
        let client_buffer = match unsafe {
            RingBuffer::create(client_region, options.client_buffer_size, options.client_timeouts)
        } {
            Ok(buffer) => buffer,
            Err(err) => {
                let _ = segment::detach(region);
                let _ = segment::destroy(segment_id);
                return Err(err);
            }
        };

        debug!("created connection on segment {} (open_count=1)", segment_id);
        Ok(Connection { segment_id, region, open_count, server_buffer, client_buffer })
    }

    /// Client-side (or post-handoff) attachment to a segment another process
    /// already created. `options` MUST describe the same buffer sizes the
    /// creator used; the handshake, out of scope here, is responsible for
    /// keeping both sides in agreement.
    pub fn setup(segment_id: SegmentId, options: &ConnectionOptions) -> Result<Self> {
        let region = segment::attach(segment_id)?;
        let open_count = region.cast::<AtomicU64>();
        let previous = unsafe { open_count.as_ref() }.fetch_add(1, Ordering::AcqRel);

        let server_region = Self::after_open_count(region);
        let server_buffer = unsafe { RingBuffer::attach(server_region) };

        let client_region = Self::after_server_buffer(server_region, options);
        let client_buffer = unsafe { RingBuffer::attach(client_region) };

        debug!("attached connection on segment {} (open_count={})", segment_id, previous + 1);
        Ok(Connection { segment_id, region, open_count, server_buffer, client_buffer })
    }

    fn after_open_count(region: NonNull<u8>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(region.as_ptr().add(size_of::<AtomicU64>())) }
    }

    fn after_server_buffer(server_region: NonNull<u8>, options: &ConnectionOptions) -> NonNull<u8> {
        let server_size = RingBuffer::segment_size_of(options.server_buffer_size);
        unsafe { NonNull::new_unchecked(server_region.as_ptr().add(server_size)) }
    }

    /// Increments `open_count`; called on fork for every descriptor carrying
    /// a connection in the parent, so the child's independent disconnect
    /// doesn't prematurely destroy the segment.
    pub fn add_user(&self) {
        let previous = unsafe { self.open_count.as_ref() }.fetch_add(1, Ordering::AcqRel);
        trace!("segment {} open_count {} -> {}", self.segment_id, previous, previous + 1);
    }

    pub fn buffer(&self, direction: Direction) -> &RingBuffer {
        match direction {
            Direction::Server => &self.server_buffer,
            Direction::Client => &self.client_buffer,
        }
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Detaches the segment from this process and decrements `open_count`;
    /// the last holder to see it reach zero destroys the segment.
    ///
    /// Decrement happens before detach, not after: once this process has
    /// unmapped the segment it can no longer touch the shared counter at
    /// all, so the refcount drop has to be observed while still attached.
    pub fn disconnect(self) -> Result<()> {
        let segment_id = self.segment_id;
        let remaining = unsafe { self.open_count.as_ref() }.fetch_sub(1, Ordering::AcqRel) - 1;

        segment::detach(self.region)?;
        trace!("segment {} open_count -> {}", segment_id, remaining);

        if remaining == 0 {
            segment::destroy(segment_id)?;
        }

        Ok(())
    }
}
