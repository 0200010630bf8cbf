//! Shared-memory substrate for transparently accelerating same-host,
//! stream-oriented inter-process communication.
//!
//! This crate is the core a `.so` preload façade (out of scope here) links
//! against: it owns the ring buffers, the refcounted shared segment, and the
//! per-process bridge from file descriptor to session, but it never resolves
//! a libc symbol or installs an interception stub itself. See [`facade`] for
//! the contract the façade is built against.
//!
//! Layers, leaves first: [`ring_buffer`] (the lock-free byte ring) is placed
//! inside a [`segment`] (the raw shared memory region) by a [`connection`]
//! (the refcounted pair of buffers plus open-count), which a process-wide
//! [`bridge`] maps file descriptors onto as [`session`]s.

#[macro_use]
extern crate failure_derive;
#[macro_use]
extern crate log;

pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod facade;
pub mod ring_buffer;
pub mod segment;
pub mod session;
pub mod timeout;

pub use config::{ConnectionOptions, DEFAULT_OPTIONS};
pub use connection::{Connection, Direction};
pub use error::{Error, Result};
pub use session::Session;
pub use timeout::{DirectionalTimeouts, Timeout};
