//! Connection tuning knobs.

use serde::Deserialize;
use thiserror::Error;

use aero_wire_ipc::ring::record_size;
use aero_wire_protocol::{cmd::CommandEncoderCopyBufferToBuffer, WireCommand, CMD_HEADER_SIZE};

pub const MAX_ALLOCATION_SIZE_ENV: &str = "AERO_WIRE_MAX_ALLOCATION_SIZE";
pub const RING_CAPACITY_BYTES_ENV: &str = "AERO_WIRE_RING_CAPACITY_BYTES";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is not a valid byte count: {value:?}")]
    BadEnv { name: &'static str, value: String },

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("max_allocation_size {0} is smaller than the largest fixed command ({1} bytes)")]
    AllocationTooSmall(usize, usize),

    #[error("ring_capacity_bytes {0} must be a power of two")]
    BadRingCapacity(usize),

    #[error("ring_capacity_bytes {ring} cannot hold a {allocation}-byte allocation")]
    RingTooSmall { ring: usize, allocation: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WireConfig {
    /// Largest single transport write. Larger commands are chunked.
    pub max_allocation_size: usize,
    /// Size of each direction's ring buffer.
    pub ring_capacity_bytes: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_allocation_size: 64 * 1024,
            ring_capacity_bytes: 1024 * 1024,
        }
    }
}

fn env_bytes(name: &'static str) -> Result<Option<usize>, ConfigError> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    let v = raw.trim();
    v.parse().map(Some).map_err(|_| ConfigError::BadEnv {
        name,
        value: raw.clone(),
    })
}

impl WireConfig {
    /// Defaults overridden by `AERO_WIRE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = env_bytes(MAX_ALLOCATION_SIZE_ENV)? {
            config.max_allocation_size = v;
        }
        if let Some(v) = env_bytes(RING_CAPACITY_BYTES_ENV)? {
            config.ring_capacity_bytes = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // The fixed part of every command must fit one allocation.
        let largest_fixed = CMD_HEADER_SIZE + CommandEncoderCopyBufferToBuffer::FIXED_SIZE;
        if self.max_allocation_size < largest_fixed {
            return Err(ConfigError::AllocationTooSmall(
                self.max_allocation_size,
                largest_fixed,
            ));
        }
        if !self.ring_capacity_bytes.is_power_of_two() || self.ring_capacity_bytes > 1 << 31 {
            return Err(ConfigError::BadRingCapacity(self.ring_capacity_bytes));
        }
        // Room for a full record plus the worst-case wrap padding in front
        // of it, so a drained ring always accepts the next flush.
        if self.ring_capacity_bytes < 2 * record_size(self.max_allocation_size) {
            return Err(ConfigError::RingTooSmall {
                ring: self.ring_capacity_bytes,
                allocation: self.max_allocation_size,
            });
        }
        Ok(())
    }
}
