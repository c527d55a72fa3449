use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use thiserror::Error;
use tokio::sync::Semaphore;

use crate::frame::DEFAULT_MAX_FRAME_BYTES;

pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_MAX_CLIENTS: usize = 10;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const MIN_FRAME_BYTES: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max clients must be at least 1")]
    NoCapacity,
    #[error("max clients cannot exceed {0}")]
    TooManyClients(usize),
    #[error("handshake timeout must be greater than zero")]
    ZeroHandshakeTimeout,
    #[error("max frame size must be at least {MIN_FRAME_BYTES} bytes")]
    FrameTooSmall,
}

/// Settings the relay is built with. Fixed once the controller is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub address: IpAddr,
    pub port: u16,
    pub max_clients: usize,
    /// How long a new connection may take to send its display name.
    pub handshake_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl RelayConfig {
    pub fn new(address: IpAddr, port: u16, max_clients: usize) -> Self {
        Self {
            address,
            port,
            max_clients,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 {
            return Err(ConfigError::NoCapacity);
        }
        if self.max_clients > Semaphore::MAX_PERMITS {
            return Err(ConfigError::TooManyClients(Semaphore::MAX_PERMITS));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::ZeroHandshakeTimeout);
        }
        if self.max_frame_bytes < MIN_FRAME_BYTES {
            return Err(ConfigError::FrameTooSmall);
        }
        Ok(())
    }
}
