//! ICE agent configuration
//!
//! [`IceConfig`] carries every timing constant the check engine uses. The
//! defaults are tuned for fast convergence on a single stream: the pacing
//! floor for `Ta` is 200ms rather than the 500ms suggested by RFC 5245.
//!
//! ```rust
//! use std::time::Duration;
//! use rvoip_ice_core::{IceConfig, IceRole};
//!
//! let config = IceConfig::builder()
//!     .role(IceRole::Controlled)
//!     .rto(Duration::from_millis(50))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.initial_role, IceRole::Controlled);
//! assert_eq!(config.max_request_sends, 7);
//! ```

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound on sends per transaction; the send offsets double each time
pub const MAX_REQUEST_SENDS: u32 = 16;

/// Upper bound on the retransmission timeout
pub const MAX_RTO: Duration = Duration::from_secs(60);

/// Which side of the session selects the final pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IceRole {
    /// Controlling agent (nominates)
    Controlling,

    /// Controlled agent
    Controlled,
}

impl IceRole {
    /// The opposite role
    pub fn flipped(self) -> Self {
        match self {
            Self::Controlling => Self::Controlled,
            Self::Controlled => Self::Controlling,
        }
    }

    /// Whether this is the controlling role
    pub fn is_controlling(self) -> bool {
        self == Self::Controlling
    }
}

impl std::fmt::Display for IceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Controlling => write!(f, "controlling"),
            Self::Controlled => write!(f, "controlled"),
        }
    }
}

/// ICE agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceConfig {
    /// Role the agent starts in
    pub initial_role: IceRole,

    /// Number of components per stream (only 1 is supported)
    pub component_count: u16,

    /// Lower bound of the pacing interval Ta
    pub ta_floor: Duration,

    /// Pacing contribution of each active stream
    pub ta_per_stream: Duration,

    /// Base retransmission timeout for check transactions
    pub rto: Duration,

    /// Total number of times a request is sent (first send included)
    pub max_request_sends: u32,

    /// Idle wait after the final send before declaring a timeout
    pub final_response_wait: Duration,

    /// TCP connect timeout for local-network destinations
    pub tcp_connect_timeout_local: Duration,

    /// TCP connect timeout for every other destination
    pub tcp_connect_timeout_remote: Duration,

    /// Local preference used in candidate priorities (single interface)
    pub local_preference: u16,

    /// Overall deadline for reaching a terminal state
    pub check_timeout: Option<Duration>,

    /// Capacity of the recently-seen inbound request id cache
    pub seen_request_cache_size: usize,

    /// Capacity of the agent event channel
    pub event_channel_capacity: usize,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            initial_role: IceRole::Controlling,
            component_count: 1,
            ta_floor: Duration::from_millis(200),
            ta_per_stream: Duration::from_millis(20),
            rto: Duration::from_millis(100),
            max_request_sends: 7,
            final_response_wait: Duration::from_millis(1600),
            tcp_connect_timeout_local: Duration::from_secs(3),
            tcp_connect_timeout_remote: Duration::from_secs(12),
            local_preference: 65535,
            check_timeout: Some(Duration::from_secs(30)),
            seen_request_cache_size: 256,
            event_channel_capacity: 100,
        }
    }
}

impl IceConfig {
    /// Start building a configuration from the defaults
    pub fn builder() -> IceConfigBuilder {
        IceConfigBuilder::new()
    }

    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.component_count != 1 {
            return Err(Error::config(format!(
                "component_count must be 1, got {}",
                self.component_count
            )));
        }
        if self.rto.is_zero() {
            return Err(Error::config("rto must be non-zero"));
        }
        if self.rto > MAX_RTO {
            return Err(Error::config(format!(
                "rto must be at most {}ms, got {}ms",
                MAX_RTO.as_millis(),
                self.rto.as_millis()
            )));
        }
        if self.max_request_sends == 0 || self.max_request_sends > MAX_REQUEST_SENDS {
            return Err(Error::config(format!(
                "max_request_sends must be between 1 and {MAX_REQUEST_SENDS}, got {}",
                self.max_request_sends
            )));
        }
        if self.ta_floor.is_zero() {
            return Err(Error::config("ta_floor must be non-zero"));
        }
        if self.seen_request_cache_size == 0 {
            return Err(Error::config("seen_request_cache_size must be at least 1"));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::config("event_channel_capacity must be at least 1"));
        }
        Ok(())
    }

    /// Pacing interval for the given number of concurrently active streams
    pub fn ta(&self, active_streams: usize) -> Duration {
        let per_stream = self.ta_per_stream * active_streams.max(1) as u32;
        per_stream.max(self.ta_floor)
    }

    /// Connect timeout for a TCP check towards `destination`
    pub fn tcp_connect_timeout(&self, destination: SocketAddr) -> Duration {
        if is_local_network(destination.ip()) {
            self.tcp_connect_timeout_local
        } else {
            self.tcp_connect_timeout_remote
        }
    }
}

/// Loopback, private, link-local and unique-local addresses
fn is_local_network(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Fluent builder for [`IceConfig`]
#[derive(Debug, Clone, Default)]
pub struct IceConfigBuilder {
    config: IceConfig,
}

impl IceConfigBuilder {
    /// Create a builder seeded with the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial role
    pub fn role(mut self, role: IceRole) -> Self {
        self.config.initial_role = role;
        self
    }

    /// Set the pacing floor
    pub fn ta_floor(mut self, ta_floor: Duration) -> Self {
        self.config.ta_floor = ta_floor;
        self
    }

    /// Set the per-stream pacing contribution
    pub fn ta_per_stream(mut self, ta_per_stream: Duration) -> Self {
        self.config.ta_per_stream = ta_per_stream;
        self
    }

    /// Set the retransmission timeout
    pub fn rto(mut self, rto: Duration) -> Self {
        self.config.rto = rto;
        self
    }

    /// Set the number of sends per transaction
    pub fn max_request_sends(mut self, sends: u32) -> Self {
        self.config.max_request_sends = sends;
        self
    }

    /// Set the wait after the last send
    pub fn final_response_wait(mut self, wait: Duration) -> Self {
        self.config.final_response_wait = wait;
        self
    }

    /// Set both TCP connect timeouts
    pub fn tcp_connect_timeouts(mut self, local: Duration, remote: Duration) -> Self {
        self.config.tcp_connect_timeout_local = local;
        self.config.tcp_connect_timeout_remote = remote;
        self
    }

    /// Set the local preference
    pub fn local_preference(mut self, local_preference: u16) -> Self {
        self.config.local_preference = local_preference;
        self
    }

    /// Set (or clear) the overall check deadline
    pub fn check_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.check_timeout = timeout;
        self
    }

    /// Set the recently-seen request cache size
    pub fn seen_request_cache_size(mut self, size: usize) -> Self {
        self.config.seen_request_cache_size = size;
        self
    }

    /// Set the event channel capacity
    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.event_channel_capacity = capacity;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<IceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = IceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rto, Duration::from_millis(100));
        assert_eq!(config.final_response_wait, Duration::from_millis(1600));
        assert_eq!(config.local_preference, 65535);
    }

    #[test]
    fn test_ta_has_floor() {
        let config = IceConfig::default();
        assert_eq!(config.ta(1), Duration::from_millis(200));
        assert_eq!(config.ta(0), Duration::from_millis(200));
        assert_eq!(config.ta(20), Duration::from_millis(400));
    }

    #[test]
    fn test_tcp_connect_timeout_by_destination() {
        let config = IceConfig::default();
        assert_eq!(
            config.tcp_connect_timeout("192.168.1.10:5000".parse().unwrap()),
            Duration::from_secs(3)
        );
        assert_eq!(
            config.tcp_connect_timeout("[fe80::1]:5000".parse().unwrap()),
            Duration::from_secs(3)
        );
        assert_eq!(
            config.tcp_connect_timeout("8.8.8.8:5000".parse().unwrap()),
            Duration::from_secs(12)
        );
    }

    #[test]
    fn test_builder_rejects_invalid_values() {
        assert!(IceConfig::builder().rto(Duration::ZERO).build().is_err());
        assert!(IceConfig::builder().max_request_sends(0).build().is_err());
        assert!(IceConfig::builder().max_request_sends(70).build().is_err());
        assert!(IceConfig::builder().rto(Duration::from_secs(3600)).build().is_err());
        assert!(IceConfig::builder()
            .max_request_sends(MAX_REQUEST_SENDS)
            .rto(MAX_RTO)
            .build()
            .is_ok());
        assert!(IceConfig::builder().seen_request_cache_size(0).build().is_err());
    }

    #[test]
    fn test_role_flip() {
        assert_eq!(IceRole::Controlling.flipped(), IceRole::Controlled);
        assert_eq!(IceRole::Controlled.flipped(), IceRole::Controlling);
        assert_eq!(IceRole::Controlling.to_string(), "controlling");
    }
}
