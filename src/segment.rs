//! Shared Segment: allocation, attach/detach and destruction of a System V
//! shared memory region. The core treats a segment as opaque and anonymous;
//! discovery is entirely the handshake's job (out of scope here), which
//! transmits the integer id this module hands back from [`create`].

use std::ptr::NonNull;

use libc::{c_void, IPC_CREAT, IPC_PRIVATE, IPC_RMID};
use nix::errno::Errno;

use crate::error::{Error, Result};

pub type SegmentId = libc::c_int;

/// Allocates a new, private shared memory region of at least `size` bytes.
pub fn create(size: usize) -> Result<SegmentId> {
    let id = unsafe { libc::shmget(IPC_PRIVATE, size, IPC_CREAT | 0o600) };
    if id == -1 {
        let inner = nix::Error::Sys(Errno::last());
        warn!("shmget failed allocating a {}-byte segment: {}", size, inner);
        return Err(Error::AllocationFailed { inner });
    }
    debug!("created shared segment {} ({} bytes)", id, size);
    Ok(id)
}

/// Maps `id` into this process's address space at an OS-chosen address.
pub fn attach(id: SegmentId) -> Result<NonNull<u8>> {
    let address = unsafe { libc::shmat(id, std::ptr::null(), 0) };
    if address as isize == -1 {
        let inner = nix::Error::Sys(Errno::last());
        warn!("shmat failed attaching segment {}: {}", id, inner);
        return Err(Error::AttachFailed { inner });
    }
    trace!("attached segment {} at {:p}", id, address);
    // SAFETY: shmat only returns (void*)-1 on failure, handled above; any
    // other return value, including on uncommon platforms, is a non-null
    // mapped address.
    Ok(unsafe { NonNull::new_unchecked(address as *mut u8) })
}

/// Unmaps `address` from this process. Does not affect other attachments or
/// pending destruction.
pub fn detach(address: NonNull<u8>) -> Result<()> {
    let result = unsafe { libc::shmdt(address.as_ptr() as *const c_void) };
    if result == -1 {
        let inner = nix::Error::Sys(Errno::last());
        warn!("shmdt failed for {:p}: {}", address.as_ptr(), inner);
        return Err(Error::DetachFailed { inner });
    }
    Ok(())
}

/// Requests removal of segment `id`. The OS defers actual reclamation until
/// the last attachment detaches.
pub fn destroy(id: SegmentId) -> Result<()> {
    let result = unsafe { libc::shmctl(id, IPC_RMID, std::ptr::null_mut()) };
    if result == -1 {
        let inner = nix::Error::Sys(Errno::last());
        warn!("shmctl(IPC_RMID) failed for segment {}: {}", id, inner);
        return Err(Error::DestroyFailed { inner });
    }
    debug!("marked segment {} for destruction", id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_attach_detach_destroy_round_trips() {
        let id = create(4096).expect("shmget");
        let address = attach(id).expect("shmat");
        detach(address).expect("shmdt");
        destroy(id).expect("shmctl(IPC_RMID)");
    }

    #[test]
    fn attach_twice_is_independent() {
        let id = create(64).expect("shmget");
        let first = attach(id).expect("first shmat");
        let second = attach(id).expect("second shmat");
        detach(first).expect("first shmdt");
        detach(second).expect("second shmdt");
        destroy(id).expect("shmctl(IPC_RMID)");
    }
}
