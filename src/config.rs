//! Runtime tunables for the connection engine.
//!
//! Everything time- or count-based that the lifecycle store, directory
//! client, NAT coordinator, and relay circuits consult lives here, so a
//! deployment can tighten or relax the engine without touching code.

use std::net::SocketAddr;
use std::time::Duration;

use crate::identity::Identity;
use crate::nat::NatClass;

/// Tunables consumed across the crate. `Config::default()` is what the
/// binary ships with; tests override individual fields.
#[derive(Debug, Clone)]
pub struct Config {
    /// UDP socket to bind. Port 0 picks an ephemeral port.
    pub listen_addr: SocketAddr,

    /// Operator-supplied relay. `None` is a valid relay-disabled
    /// configuration: hole punching and relay fallback are simply
    /// unavailable, never an error.
    pub relay_addr: Option<SocketAddr>,

    /// Operator override for our NAT classification. When unset the node
    /// classifies itself from externally observed addresses.
    pub nat_class_override: Option<NatClass>,

    /// Run the relay forwarding server on this node. Only sensible on
    /// publicly reachable machines.
    pub serve_relay: bool,

    /// Answer directory put/get requests from a local store.
    pub serve_directory: bool,

    /// Directory-serving peers to publish to and resolve from. Empty means
    /// a process-local in-memory directory.
    pub directory_peers: Vec<(Identity, SocketAddr)>,

    /// Addresses the operator asserts are reachable. These enter the
    /// lifecycle store pre-verified at the highest priority tier.
    pub operator_addrs: Vec<SocketAddr>,

    /// How long a verified address stays publishable without
    /// reconfirmation before it is discarded.
    pub addr_ttl: Duration,

    /// Lifecycle store maintenance tick.
    pub addr_tick: Duration,

    /// Verification failures tolerated before an address is discarded.
    pub max_verify_failures: u32,

    /// Distinct peers that must report the same observed address before a
    /// peer-observed candidate is promoted without an active probe.
    pub corroboration_count: usize,

    /// Published record TTL; republish fires at 50% elapsed.
    pub record_ttl: Duration,

    /// Maximum accepted age of a resolved record.
    pub record_max_age: Duration,

    /// Tolerated clock skew when judging record freshness.
    pub record_skew_tolerance: Duration,

    /// Directory resolve deadline. Expiry maps to "not found".
    pub resolve_timeout: Duration,

    /// Announce retry policy: base delay, cap, attempt budget.
    pub announce_backoff_base: Duration,
    pub announce_backoff_cap: Duration,
    pub announce_attempts: u32,

    /// Per-address direct dial deadline.
    pub dial_timeout: Duration,

    /// Hole punch budget. Probes stop when this expires.
    pub punch_timeout: Duration,

    /// Interval between punch probe bursts.
    pub punch_probe_interval: Duration,

    /// Tolerated clock skew when aligning the punch window. Must stay
    /// below `punch_timeout`.
    pub punch_skew_tolerance: Duration,

    /// Circuit keepalive interval and the miss budget before a circuit
    /// goes stale.
    pub heartbeat_interval: Duration,
    pub heartbeat_misses: u32,

    /// Deadline for a single signaling request over the relay channel.
    pub signaling_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".parse().unwrap_or_else(|_| unreachable!()),
            relay_addr: None,
            nat_class_override: None,
            serve_relay: false,
            serve_directory: false,
            directory_peers: Vec::new(),
            operator_addrs: Vec::new(),
            addr_ttl: Duration::from_secs(600),
            addr_tick: Duration::from_secs(30),
            max_verify_failures: 3,
            corroboration_count: 2,
            record_ttl: Duration::from_secs(600),
            record_max_age: Duration::from_secs(3600),
            record_skew_tolerance: Duration::from_secs(5),
            resolve_timeout: Duration::from_secs(5),
            announce_backoff_base: Duration::from_secs(1),
            announce_backoff_cap: Duration::from_secs(30),
            announce_attempts: 5,
            dial_timeout: Duration::from_secs(5),
            punch_timeout: Duration::from_secs(5),
            punch_probe_interval: Duration::from_millis(200),
            punch_skew_tolerance: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_misses: 3,
            signaling_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Sanity-check cross-field constraints that silent misconfiguration
    /// would otherwise turn into liveness bugs.
    pub fn validate(&self) -> Result<(), String> {
        if self.punch_skew_tolerance >= self.punch_timeout {
            return Err(format!(
                "punch_skew_tolerance ({:?}) must be below punch_timeout ({:?})",
                self.punch_skew_tolerance, self.punch_timeout
            ));
        }
        if self.corroboration_count < 2 {
            return Err("corroboration_count must be at least 2".to_string());
        }
        if self.announce_attempts == 0 {
            return Err("announce_attempts must be nonzero".to_string());
        }
        if self.heartbeat_misses == 0 {
            return Err("heartbeat_misses must be nonzero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn skew_above_punch_timeout_rejected() {
        let cfg = Config {
            punch_skew_tolerance: Duration::from_secs(6),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn single_source_corroboration_rejected() {
        let cfg = Config {
            corroboration_count: 1,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
