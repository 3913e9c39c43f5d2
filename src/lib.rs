//! In-process aero GPU wire: a [`Client`] and a [`Server`] joined by two
//! command rings.
//!
//! The protocol, transport, client and server live in their own crates and
//! are re-exported here; this crate adds configuration and the loopback
//! [`WireConnection`] used by tests and single-process embedders.

mod config;
mod connection;

pub use config::{ConfigError, WireConfig, MAX_ALLOCATION_SIZE_ENV, RING_CAPACITY_BYTES_ENV};
pub use connection::{ConnectionError, WireConnection};

pub use aero_wire_client as client;
pub use aero_wire_ipc as ipc;
pub use aero_wire_protocol as protocol;
pub use aero_wire_server as server;

pub use aero_wire_client::Client;
pub use aero_wire_server::{Backend, NullBackend, Server};
