//! Contracts the interception façade (the `#[no_mangle]` `socket`/`read`/
//! `write`/`accept`/`connect`/`close`/`fork` overrides, out of scope for this
//! crate) is built against. Nothing here resolves real libc symbols or
//! installs interposition (that belongs to the `.so` preload shim that
//! links against this crate); this module only gives it a safe, typed
//! surface to call into.

use std::os::unix::io::RawFd;

use libc::{c_int, pid_t};

use crate::bridge;
use crate::connection::{Connection, Direction};
use crate::error::Result;
use crate::ring_buffer::RingBuffer;

/// `(domain, type)` pairs this crate will ever put on the fast path. Anything
/// else (datagrams, `AF_INET`, raw sockets) the façade must forward to real
/// libc unconditionally.
pub fn socket_is_stream_and_domain(domain: c_int, socket_type: c_int) -> bool {
    let stream = socket_type & libc::SOCK_STREAM == libc::SOCK_STREAM;
    let local = domain == libc::AF_UNIX || domain == libc::AF_LOCAL;
    stream && local
}

/// Writes up to `n` bytes from `src` into `fd`'s connection in the given
/// direction. `Ok(None)` is a fast-path miss (no connection on `fd`): the
/// façade should fall through to the real `write`. `Ok(Some(_))` is the
/// number of bytes actually written, which may be less than `n`, including
/// zero on an unexpired timeout or a non-blocking full buffer.
///
/// # Safety
///
/// If non-null, `src` must be valid for reads of `n` bytes for the duration
/// of the call.
pub unsafe fn connection_write(fd: RawFd, src: *const u8, n: usize, direction: Direction) -> Result<Option<usize>> {
    bridge::with_connection(fd, |connection| unsafe { connection.buffer(direction).write_ptr(src, n) })
        .and_then(transpose_inner)
}

/// Symmetric to [`connection_write`].
///
/// # Safety
///
/// If non-null, `dst` must be valid for writes of `n` bytes for the
/// duration of the call.
pub unsafe fn connection_read(fd: RawFd, dst: *mut u8, n: usize, direction: Direction) -> Result<Option<usize>> {
    bridge::with_connection(fd, |connection| unsafe { connection.buffer(direction).read_ptr(dst, n) })
        .and_then(transpose_inner)
}

/// Picks one of a connection's two buffers by direction. A thin, named
/// wrapper around [`Connection::buffer`] so the façade's call sites read the
/// same as the interception contract they're implementing.
pub fn get_buffer(connection: &Connection, direction: Direction) -> &RingBuffer {
    connection.buffer(direction)
}

fn transpose_inner(outer: Option<Result<usize>>) -> Result<Option<usize>> {
    match outer {
        Some(Ok(n)) => Ok(Some(n)),
        Some(Err(e)) => Err(e),
        None => Ok(None),
    }
}

/// Function pointers the façade has resolved via `dlsym(RTLD_NEXT, ...)`
/// (out of scope here) for every libc symbol this crate's interception
/// points shadow. The core never calls these directly except through
/// [`forking_fork`]; the façade's own overrides hold and use the rest.
#[derive(Clone, Copy)]
pub struct RealLibc {
    pub socket: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int,
    pub read: unsafe extern "C" fn(c_int, *mut libc::c_void, libc::size_t) -> libc::ssize_t,
    pub write: unsafe extern "C" fn(c_int, *const libc::c_void, libc::size_t) -> libc::ssize_t,
    pub accept: unsafe extern "C" fn(c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> c_int,
    pub connect: unsafe extern "C" fn(c_int, *const libc::sockaddr, libc::socklen_t) -> c_int,
    pub close: unsafe extern "C" fn(c_int) -> c_int,
    pub fork: unsafe extern "C" fn() -> pid_t,
}

/// Safe wrapper around the real `fork`: calls it, and in the child, before
/// returning control to the caller, fans `open_count` out across every
/// connection this process still holds so the child's eventual disconnect
/// doesn't undercut the parent's refcount. A façade crate re-exports this as
/// its own `fork` override.
///
/// # Safety
///
/// Forwards directly to `real_fork`; all the usual caveats about forking a
/// multithreaded process apply.
pub unsafe fn forking_fork(real_fork: unsafe extern "C" fn() -> pid_t) -> pid_t {
    let pid = unsafe { real_fork() };
    if pid == 0 {
        if let Err(err) = bridge::add_user() {
            error!("fork fan-out failed in child: {}", err);
        }
    }
    pid
}
