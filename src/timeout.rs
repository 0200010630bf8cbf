use std::time::Duration;

/// A buffer direction's timeout setting.
///
/// Kept as a tagged variant rather than a sentinel integer (a raw
/// millisecond count can't tell "don't wait at all" apart from "wait
/// forever" without a magic number) so the busy-wait loop in
/// [`crate::ring_buffer::RingBuffer`] can match on it directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// No timeout has been configured; treated the same as `Zero` by the
    /// buffer (an operation that cannot make progress returns immediately).
    None,
    /// Non-blocking: return immediately with whatever fraction transferred.
    Zero,
    /// Spin-wait for up to the given duration before giving up.
    Finite(Duration),
    /// Spin-wait until progress is made, however long that takes.
    Infinite,
}

impl Timeout {
    /// Whether an operation under this timeout should ever suspend.
    pub fn blocks(self) -> bool {
        !matches!(self, Timeout::None | Timeout::Zero)
    }

    pub fn deadline_from(self, now: ::std::time::Instant) -> Option<::std::time::Instant> {
        match self {
            Timeout::Finite(d) => now.checked_add(d),
            _ => None,
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::None
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirectionalTimeouts {
    pub read: Timeout,
    pub write: Timeout,
}
