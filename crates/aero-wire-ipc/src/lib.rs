//! In-process byte transport for the aero-wire protocol.

pub mod ring;
pub mod transport;

pub use ring::{CommandRing, PopError, PushError, RingError};
pub use transport::{ring_channel, RingCommandReceiver, RingCommandSerializer};
