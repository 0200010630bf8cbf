//! The process-wide session table plus the signal/atexit machinery that
//! guarantees every shared segment still held by this process is released on
//! the way out, however the process leaves.
//!
//! There is exactly one bridge per process, reached through the free
//! functions in this module rather than a type a caller constructs: the
//! interception points this exists for (`read`, `write`, `close`, `fork`,
//! ...) are themselves process-global, so a singleton is the honest model.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use libc::c_int;
use nix::errno::Errno;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::session::Session;

/// Table size used when the process's open-file limit can't be read.
const FALLBACK_TABLE_SIZE: usize = 1024;

struct BridgeState {
    session_table: Vec<Option<Session>>,
    connection_count: usize,
    is_initialized: bool,
    is_destroyed: bool,
}

impl BridgeState {
    const fn empty() -> Self {
        BridgeState {
            session_table: Vec::new(),
            connection_count: 0,
            is_initialized: false,
            is_destroyed: false,
        }
    }
}

static BRIDGE: Mutex<BridgeState> = Mutex::new(BridgeState::empty());

static OLD_SIGINT: AtomicUsize = AtomicUsize::new(libc::SIG_DFL);
static OLD_SIGTERM: AtomicUsize = AtomicUsize::new(libc::SIG_DFL);
static OLD_SIGABRT: AtomicUsize = AtomicUsize::new(libc::SIG_DFL);

fn session_table_capacity() -> usize {
    let mut limit: libc::rlimit = unsafe { std::mem::zeroed() };
    let got_limit = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } == 0;
    if got_limit && limit.rlim_cur != libc::RLIM_INFINITY {
        limit.rlim_cur as usize
    } else {
        FALLBACK_TABLE_SIZE
    }
}

/// Runs setup exactly once, lazily, the first time any public bridge
/// operation is invoked. A failed attempt leaves `is_initialized` false so a
/// later call can retry instead of silently limping along half set up.
fn ensure_initialized(state: &mut BridgeState) -> Result<()> {
    if state.is_initialized {
        return Ok(());
    }

    let capacity = session_table_capacity();
    let mut table = Vec::with_capacity(capacity);
    table.resize_with(capacity, || None);

    setup_exit_handling()?;

    state.session_table = table;
    state.connection_count = 0;
    state.is_destroyed = false;
    state.is_initialized = true;
    info!("bridge initialized with a {}-slot session table", capacity);
    Ok(())
}

fn setup_exit_handling() -> Result<()> {
    install_signal_handler(libc::SIGINT, &OLD_SIGINT)?;
    install_signal_handler(libc::SIGTERM, &OLD_SIGTERM)?;
    install_signal_handler(libc::SIGABRT, &OLD_SIGABRT)?;

    // With atexit we can register up to 32 functions called at *normal*
    // program termination: a return from main, or a call to exit().
    if unsafe { libc::atexit(exit_hook) } != 0 {
        return Err(Error::AtExitFailed);
    }

    Ok(())
}

fn install_signal_handler(signal_number: c_int, old_slot: &'static AtomicUsize) -> Result<()> {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handle_signal as usize;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    // Restart interruptible syscalls after the handler returns; useful only
    // for the non-terminating path (the user's own chained handler).
    action.sa_flags = libc::SA_RESTART;

    let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
    if unsafe { libc::sigaction(signal_number, &action, &mut previous) } == -1 {
        let inner = nix::Error::Sys(Errno::last());
        warn!("failed installing handler for signal {}: {}", signal_number, inner);
        return Err(Error::SignalSetupFailed { inner });
    }

    old_slot.store(previous.sa_sigaction, Ordering::SeqCst);
    Ok(())
}

extern "C" fn handle_signal(signal_number: c_int) {
    let old_slot = match signal_number {
        libc::SIGINT => &OLD_SIGINT,
        libc::SIGTERM => &OLD_SIGTERM,
        libc::SIGABRT => &OLD_SIGABRT,
        _ => return,
    };

    // Five cases, mirroring the C source this is grown from:
    // 1) no prior handler: we decide to exit (and, via atexit, tear down).
    // 2) prior handler ignores the signal (SIG_IGN): so do we.
    // 3) prior handler calls exit(): our atexit hook tears down, all good.
    // 4) prior handler is for SIGABRT and exits: same as 3.
    // 5) prior handler is for SIGABRT and returns: POSIX replaces it with
    //    SIG_DFL and re-raises, which core-dumps, so we destroy the bridge
    //    here, before returning, rather than let the segments leak.
    let old_handler = old_slot.load(Ordering::SeqCst);
    if old_handler != libc::SIG_DFL && old_handler != libc::SIG_IGN {
        let chained = unsafe { std::mem::transmute::<usize, extern "C" fn(c_int)>(old_handler) };
        chained(signal_number);
    } else if old_handler == libc::SIG_DFL {
        unsafe { libc::exit(libc::EXIT_FAILURE) };
    }

    if signal_number == libc::SIGABRT {
        let _ = destroy();
    }
}

extern "C" fn exit_hook() {
    let _ = destroy();
}

/// Stores `session` under `fd`, bumping `connection_count` if it carries a
/// connection.
pub fn insert(fd: RawFd, session: Session) -> Result<()> {
    let mut state = BRIDGE.lock().unwrap();
    ensure_initialized(&mut state)?;

    let has_connection = session.has_connection();
    let index = fd as usize;
    if index >= state.session_table.len() {
        state.session_table.resize_with(index + 1, || None);
    }
    state.session_table[index] = Some(session);
    if has_connection {
        state.connection_count += 1;
    }
    Ok(())
}

/// Removes and invalidates the session at `fd`, decrementing
/// `connection_count` first if it carried a connection. Returns the removed
/// session so the caller can disconnect it if appropriate; a descriptor with
/// no session is not an error, just a no-op returning `None`.
pub fn erase(fd: RawFd) -> Result<Option<Session>> {
    let mut state = BRIDGE.lock().unwrap();
    ensure_initialized(&mut state)?;

    let index = fd as usize;
    let slot = state.session_table.get_mut(index).and_then(Option::take);
    if let Some(session) = &slot {
        if session.has_connection() {
            state.connection_count -= 1;
        }
    }
    Ok(slot)
}

/// The hot-path predicate the façade uses to pick fast vs. slow path.
pub fn has_connection(fd: RawFd) -> bool {
    let mut state = BRIDGE.lock().unwrap();
    if ensure_initialized(&mut state).is_err() {
        return false;
    }
    state
        .session_table
        .get(fd as usize)
        .and_then(Option::as_ref)
        .map(Session::has_connection)
        .unwrap_or(false)
}

/// Fast "no fast-path users at all" short-circuit.
pub fn has_any_connections() -> bool {
    let state = BRIDGE.lock().unwrap();
    state.connection_count > 0
}

/// Runs `f` with the connection backing `fd`, if any. `f` is run with the
/// bridge lock released: the session is checked out of its slot, the lock is
/// dropped, `f` runs (which may be an unbounded blocking ring-buffer wait),
/// and the session is checked back into the same slot afterward. Holding the
/// lock across a blocking call would serialize every fast-path `fd` in the
/// process through it, even though each descriptor already has its own
/// single-reader/single-writer discipline and doesn't need one.
pub fn with_connection<R>(fd: RawFd, f: impl FnOnce(&Connection) -> R) -> Result<Option<R>> {
    let index = fd as usize;

    let session = {
        let mut state = BRIDGE.lock().unwrap();
        ensure_initialized(&mut state)?;
        state.session_table.get_mut(index).and_then(Option::take)
    };

    let session = match session {
        Some(session) => session,
        None => return Ok(None),
    };

    let result = session.connection().map(f);

    let mut state = BRIDGE.lock().unwrap();
    if index >= state.session_table.len() {
        state.session_table.resize_with(index + 1, || None);
    }
    state.session_table[index] = Some(session);

    Ok(result)
}

/// Called post-fork, in the child, before any I/O on inherited descriptors:
/// walks the session table and bumps every connection's `open_count` so the
/// child's eventual, independent disconnect doesn't prematurely destroy a
/// segment the parent is still using.
pub fn add_user() -> Result<()> {
    let mut state = BRIDGE.lock().unwrap();
    ensure_initialized(&mut state)?;

    if state.connection_count == 0 {
        return Ok(());
    }

    for slot in state.session_table.iter().flatten() {
        if let Some(connection) = slot.connection() {
            connection.add_user();
        }
    }

    Ok(())
}

/// Tears the bridge down: detaches every connection this process still
/// holds (decrementing each segment's refcount, destroying any that reach
/// zero), then marks the bridge uninitialized. Safe to call more than once:
/// a second call, whether from a signal handler racing the atexit hook or a
/// deliberate re-entry, is a no-op.
pub fn destroy() -> Result<()> {
    let mut state = BRIDGE.lock().unwrap();
    if !state.is_initialized || state.is_destroyed {
        return Ok(());
    }

    for slot in state.session_table.iter_mut() {
        if let Some(Session::Connected(connection)) = slot.take() {
            let segment_id = connection.segment_id();
            if let Err(err) = connection.disconnect() {
                warn!("failed disconnecting segment {} during bridge teardown: {}", segment_id, err);
            }
        }
    }

    state.connection_count = 0;
    state.is_initialized = false;
    state.is_destroyed = true;
    info!("bridge destroyed");
    Ok(())
}
