//! Compile-time defaults for a connection, plus a thin environment overlay.
//!
//! The handshake (out of scope here) never transmits these; both sides are
//! expected to agree out of band, in practice by both using
//! [`ConnectionOptions::default`] or both calling [`ConnectionOptions::from_env`]
//! against the same environment.

use std::env;

use crate::timeout::{DirectionalTimeouts, Timeout};

/// Default payload capacity, in bytes, for a ring buffer direction that
/// doesn't override it.
pub const DEFAULT_BUFFER_SIZE: u32 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub server_buffer_size: u32,
    pub client_buffer_size: u32,
    pub server_timeouts: DirectionalTimeouts,
    pub client_timeouts: DirectionalTimeouts,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            server_buffer_size: DEFAULT_BUFFER_SIZE,
            client_buffer_size: DEFAULT_BUFFER_SIZE,
            server_timeouts: DirectionalTimeouts::default(),
            client_timeouts: DirectionalTimeouts::default(),
        }
    }
}

impl ConnectionOptions {
    /// Process-global default, matching the C source's `DEFAULT_OPTIONS`.
    pub const fn new_default() -> Self {
        ConnectionOptions {
            server_buffer_size: DEFAULT_BUFFER_SIZE,
            client_buffer_size: DEFAULT_BUFFER_SIZE,
            server_timeouts: DirectionalTimeouts {
                read: Timeout::None,
                write: Timeout::None,
            },
            client_timeouts: DirectionalTimeouts {
                read: Timeout::None,
                write: Timeout::None,
            },
        }
    }

    /// Overlays `TSSX_SERVER_BUFFER_SIZE`, `TSSX_CLIENT_BUFFER_SIZE`,
    /// `TSSX_SERVER_TIMEOUT_MS` and `TSSX_CLIENT_TIMEOUT_MS` on top of the
    /// compiled-in defaults. Unset or unparsable variables fall back to the
    /// default and are logged at `warn!`, never treated as a hard error
    /// (this is a convenience overlay, not a validated config file).
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Some(size) = read_env_u32("TSSX_SERVER_BUFFER_SIZE") {
            options.server_buffer_size = size;
        }
        if let Some(size) = read_env_u32("TSSX_CLIENT_BUFFER_SIZE") {
            options.client_buffer_size = size;
        }
        if let Some(ms) = read_env_u64("TSSX_SERVER_TIMEOUT_MS") {
            let timeout = Timeout::Finite(std::time::Duration::from_millis(ms));
            options.server_timeouts = DirectionalTimeouts { read: timeout, write: timeout };
        }
        if let Some(ms) = read_env_u64("TSSX_CLIENT_TIMEOUT_MS") {
            let timeout = Timeout::Finite(std::time::Duration::from_millis(ms));
            options.client_timeouts = DirectionalTimeouts { read: timeout, write: timeout };
        }

        options
    }
}

fn read_env_u32(key: &str) -> Option<u32> {
    match env::var(key) {
        Ok(value) => match value.parse::<u32>() {
            Ok(parsed) if parsed > 0 => Some(parsed),
            _ => {
                warn!("ignoring unparsable {}={:?}", key, value);
                None
            }
        },
        Err(env::VarError::NotPresent) => None,
        Err(env::VarError::NotUnicode(raw)) => {
            warn!("ignoring non-unicode {}={:?}", key, raw);
            None
        }
    }
}

fn read_env_u64(key: &str) -> Option<u64> {
    match env::var(key) {
        Ok(value) => match value.parse::<u64>() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                warn!("ignoring unparsable {}={:?}", key, value);
                None
            }
        },
        Err(env::VarError::NotPresent) => None,
        Err(env::VarError::NotUnicode(raw)) => {
            warn!("ignoring non-unicode {}={:?}", key, raw);
            None
        }
    }
}

/// Process-global default options, mirroring the C source's `DEFAULT_OPTIONS`
/// static. A façade crate uses this on both the `connect` and `accept` sides
/// of the handshake so the two peers agree on buffer sizes without having to
/// transmit them.
pub static DEFAULT_OPTIONS: ConnectionOptions = ConnectionOptions::new_default();
