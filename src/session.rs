//! A single file descriptor's fate, as tracked by the [`crate::bridge`].

use crate::connection::Connection;

/// One slot in the bridge's session table. A slot that doesn't exist at all
/// is modeled by `None` in the table itself, not a third variant here; that
/// keeps `has_connection` a simple match instead of a double-option check.
pub enum Session {
    /// Fast path: this descriptor has a connection backing it.
    Connected(Connection),
    /// Slow path: the façade still tracks this descriptor (so it knows not
    /// to re-probe it), but it has no connection and every call on it goes
    /// straight to the real libc.
    KernelOnly,
}

impl Session {
    pub fn has_connection(&self) -> bool {
        matches!(self, Session::Connected(_))
    }

    pub fn connection(&self) -> Option<&Connection> {
        match self {
            Session::Connected(connection) => Some(connection),
            Session::KernelOnly => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_only_session_has_no_connection() {
        let session = Session::KernelOnly;
        assert!(!session.has_connection());
        assert!(session.connection().is_none());
    }
}
