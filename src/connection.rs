use aero_wire_client::{Client, Device, WireObject};
use aero_wire_ipc::{ring_channel, CommandRing, RingCommandReceiver, RingCommandSerializer, RingError};
use aero_wire_protocol::WireError;
use aero_wire_server::{Backend, Server};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::{ConfigError, WireConfig};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to create command ring: {0}")]
    Ring(#[from] RingError),
}

/// A client and a server in one process, one ring per direction.
///
/// Nothing moves until [`WireConnection::pump`] runs. Both rings are bounded,
/// so callers that issue a lot of work should pump between batches; a sender
/// that finds its ring full treats it as a fatal transport error.
pub struct WireConnection<B: Backend> {
    client: Client<RingCommandSerializer>,
    server: Server<B, RingCommandSerializer>,
    to_server: RingCommandReceiver,
    to_client: RingCommandReceiver,
}

impl<B: Backend> WireConnection<B> {
    pub fn new(config: &WireConfig, backend: B) -> Result<Self, ConnectionError> {
        config.validate()?;
        let (client_tx, to_server) = ring_channel(
            CommandRing::new(config.ring_capacity_bytes)?,
            config.max_allocation_size,
        );
        let (server_tx, to_client) = ring_channel(
            CommandRing::new(config.ring_capacity_bytes)?,
            config.max_allocation_size,
        );
        debug!(
            max_allocation_size = config.max_allocation_size,
            ring_capacity_bytes = config.ring_capacity_bytes,
            "wire connection created"
        );
        Ok(Self {
            client: Client::new(client_tx),
            server: Server::new(backend, server_tx),
            to_server,
            to_client,
        })
    }

    /// Reserves a client device handle and binds `device` to it on the server.
    pub fn create_device(&mut self, device: B::Device) -> Result<Device, WireError> {
        let reserved = self.client.reserve_device()?;
        if let Err(err) = self.server.inject_device(reserved.handle(), device) {
            self.disconnect();
            return Err(err);
        }
        Ok(reserved)
    }

    pub fn client(&self) -> &Client<RingCommandSerializer> {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut Client<RingCommandSerializer> {
        &mut self.client
    }

    pub fn server(&self) -> &Server<B, RingCommandSerializer> {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut Server<B, RingCommandSerializer> {
        &mut self.server
    }

    pub fn is_disconnected(&self) -> bool {
        self.client.is_disconnected() || self.server.is_disconnected()
    }

    /// Disconnects both ends. Idempotent.
    pub fn disconnect(&mut self) {
        self.client.disconnect();
        self.server.disconnect();
    }

    /// Moves commands and completions back and forth until neither ring has
    /// anything left to deliver. Returns the number of rounds that moved
    /// data.
    ///
    /// A fatal error on either end disconnects both and is returned.
    pub fn pump(&mut self) -> Result<usize, WireError> {
        let mut rounds = 0;
        loop {
            match self.step() {
                Ok(0) => return Ok(rounds),
                Ok(records) => {
                    trace!(round = rounds, records, "pumped wire connection");
                    rounds += 1;
                }
                Err(err) => {
                    warn!(%err, "wire connection pump failed");
                    self.disconnect();
                    return Err(err);
                }
            }
        }
    }

    fn step(&mut self) -> Result<usize, WireError> {
        self.client.flush()?;
        let mut records = self.to_server.pump(&mut self.server)?;
        self.server.tick()?;
        records += self.to_client.pump(&mut self.client)?;
        Ok(records)
    }
}
