//! Configuration and limits for the fixture server.

use std::net::SocketAddr;
use std::time::Duration;

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8880";

/// Resource limits applied to every connection.
///
/// These limits keep a misbehaving client from making the server buffer
/// unbounded handshake data or frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Maximum size of handshake data in bytes.
    ///
    /// Default: 8 KB (8192)
    pub max_handshake_size: usize,

    /// Maximum size of a single frame in bytes, for frames read by the probe.
    ///
    /// Default: 1 MB (1024 * 1024)
    pub max_frame_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_handshake_size: 8192,
            max_frame_size: 1024 * 1024,
        }
    }
}

impl Limits {
    /// Create new limits with custom values.
    #[must_use]
    pub const fn new(max_handshake_size: usize, max_frame_size: usize) -> Self {
        Self {
            max_handshake_size,
            max_frame_size,
        }
    }

    /// Validate that handshake size is within limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandshakeTooLarge`](crate::Error::HandshakeTooLarge) if `size`
    /// exceeds the configured maximum.
    pub const fn check_handshake_size(&self, size: usize) -> Result<(), crate::Error> {
        if size > self.max_handshake_size {
            Err(crate::Error::HandshakeTooLarge {
                size,
                max: self.max_handshake_size,
            })
        } else {
            Ok(())
        }
    }

    /// Validate that frame size is within limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameTooLarge`](crate::Error::FrameTooLarge) if `size`
    /// exceeds the configured maximum.
    pub const fn check_frame_size(&self, size: usize) -> Result<(), crate::Error> {
        if size > self.max_frame_size {
            Err(crate::Error::FrameTooLarge {
                size,
                max: self.max_frame_size,
            })
        } else {
            Ok(())
        }
    }
}

/// Timeout configuration for fixture connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Maximum time to receive the complete upgrade request.
    ///
    /// Default: 10 seconds
    pub handshake: Duration,

    /// Maximum time for writing the upgrade response or scenario frames.
    ///
    /// Default: 10 seconds
    pub write: Duration,

    /// How long to wait for the peer's close after our Close frame.
    ///
    /// Default: 2 seconds
    pub linger: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            write: Duration::from_secs(10),
            linger: Duration::from_secs(2),
        }
    }
}

impl Timeouts {
    /// Create new timeouts with custom values.
    #[must_use]
    pub const fn new(handshake: Duration, write: Duration, linger: Duration) -> Self {
        Self {
            handshake,
            write,
            linger,
        }
    }
}

/// Fixture server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the server listens on.
    pub bind_addr: SocketAddr,

    /// Resource limits.
    pub limits: Limits,

    /// Timeout configuration.
    pub timeouts: Timeouts,

    /// Allowed origins.
    ///
    /// If `Some`, only upgrades whose Origin header matches one of these values
    /// are accepted. If `None`, origin validation is disabled, which is what
    /// browser test runners usually need.
    /// Default: None
    pub allowed_origins: Option<Vec<String>>,

    /// Send a Close frame (1000) after the scenario's data transfer.
    ///
    /// Default: true
    pub close_after_transfer: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8880)),
            limits: Limits::default(),
            timeouts: Timeouts::default(),
            allowed_origins: None,
            close_after_transfer: true,
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen address.
    #[must_use]
    pub const fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set custom limits.
    #[must_use]
    pub const fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Set timeout configuration.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Restrict upgrades to the given origins.
    #[must_use]
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = Some(origins);
        self
    }

    /// Enable or disable the Close frame after data transfer.
    #[must_use]
    pub const fn with_close_after_transfer(mut self, close: bool) -> Self {
        self.close_after_transfer = close;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_default() {
        let limits = Limits::default();
        assert_eq!(limits.max_handshake_size, 8192);
        assert_eq!(limits.max_frame_size, 1024 * 1024);
    }

    #[test]
    fn test_limits_check_handshake_size() {
        let limits = Limits::default();
        assert!(limits.check_handshake_size(1024).is_ok());
        assert!(limits.check_handshake_size(8192).is_ok());
        assert!(matches!(
            limits.check_handshake_size(10000),
            Err(crate::Error::HandshakeTooLarge { size: 10000, max: 8192 })
        ));
    }

    #[test]
    fn test_limits_check_frame_size() {
        let limits = Limits::new(4096, 128);
        assert!(limits.check_frame_size(128).is_ok());
        assert!(limits.check_frame_size(129).is_err());
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert!(config.close_after_transfer);
        assert!(config.allowed_origins.is_none());
        assert_eq!(config.timeouts, Timeouts::default());
    }

    #[test]
    fn test_config_builder() {
        let addr: SocketAddr = "0.0.0.0:9001".parse().unwrap();
        let config = Config::new()
            .with_bind_addr(addr)
            .with_limits(Limits::new(2048, 4096))
            .with_close_after_transfer(false)
            .with_allowed_origins(vec!["http://127.0.0.1:8000".to_string()]);

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.limits.max_handshake_size, 2048);
        assert!(!config.close_after_transfer);
        assert_eq!(
            config.allowed_origins,
            Some(vec!["http://127.0.0.1:8000".to_string()])
        );
    }

    #[test]
    fn test_timeouts_default() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.handshake, Duration::from_secs(10));
        assert_eq!(timeouts.write, Duration::from_secs(10));
        assert_eq!(timeouts.linger, Duration::from_secs(2));
    }
}
