use failure;
use nix;

pub type Result<T> = ::std::result::Result<T, Error>;

/// Crate-wide error currency. One variant per error kind in the design's
/// taxonomy (allocation, attach, state, timeout, argument), plus the raw OS
/// error where the kernel is the one complaining.
#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "Failed to allocate a shared memory segment: {}", inner)]
    AllocationFailed { inner: nix::Error },

    #[fail(display = "Failed to attach a shared memory segment: {}", inner)]
    AttachFailed { inner: nix::Error },

    #[fail(display = "Failed to detach a shared memory segment: {}", inner)]
    DetachFailed { inner: nix::Error },

    #[fail(display = "Failed to mark a shared memory segment for destruction: {}", inner)]
    DestroyFailed { inner: nix::Error },

    #[fail(display = "Bridge operation attempted in an invalid state")]
    InvalidState,

    #[fail(display = "Operation timed out with no bytes transferred")]
    TimedOut,

    #[fail(display = "Invalid argument: {}", reason)]
    InvalidArgument { reason: &'static str },

    #[fail(display = "Failed to install a signal handler: {}", inner)]
    SignalSetupFailed { inner: nix::Error },

    #[fail(display = "Failed to register the process-exit teardown hook")]
    AtExitFailed,

    #[fail(display = "Shared memory layout size overflowed a machine word")]
    LayoutOverflow,
}

impl From<nix::Error> for Error {
    fn from(inner: nix::Error) -> Self {
        // Callers that care about the distinction (create vs. attach vs. ...)
        // wrap this themselves; as a bare conversion we can only say "the OS
        // refused," which is closest to allocation failure.
        Error::AllocationFailed { inner }
    }
}
