//! Connection configuration knobs.
//!
//! The embedding broker parses and validates its own configuration; this
//! struct is the slice handed to each STOMP connection. Every knob has a
//! default so `ConnectionConfig::default()` is a working production
//! configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::stomp::codec::DEFAULT_MAX_FRAME_SIZE;

fn default_die_delay_ms() -> u64 {
    5000
}

fn default_outbound_heartbeat_ms() -> u64 {
    100
}

fn default_inbound_heartbeat_ms() -> u64 {
    10_000
}

fn default_producer_route_cache_size() -> usize {
    10
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_outbound_buffer_frames() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Grace period between sending an ERROR frame and closing the
    /// transport, giving the client time to receive it.
    #[serde(default = "default_die_delay_ms")]
    pub die_delay_ms: u64,

    /// Server's minimum interval between outbound heart-beats.
    #[serde(default = "default_outbound_heartbeat_ms")]
    pub outbound_heartbeat_ms: u64,

    /// Server's minimum expected interval between inbound activity.
    #[serde(default = "default_inbound_heartbeat_ms")]
    pub inbound_heartbeat_ms: u64,

    /// Producer route LRU capacity.
    #[serde(default = "default_producer_route_cache_size")]
    pub producer_route_cache_size: usize,

    /// Cap on a single inbound frame, headers included.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Outbound frame channel capacity. When a slow client fills it,
    /// producers into this connection's subscriptions observe backpressure.
    #[serde(default = "default_outbound_buffer_frames")]
    pub outbound_buffer_frames: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            die_delay_ms: default_die_delay_ms(),
            outbound_heartbeat_ms: default_outbound_heartbeat_ms(),
            inbound_heartbeat_ms: default_inbound_heartbeat_ms(),
            producer_route_cache_size: default_producer_route_cache_size(),
            max_frame_size: default_max_frame_size(),
            outbound_buffer_frames: default_outbound_buffer_frames(),
        }
    }
}

impl ConnectionConfig {
    pub fn die_delay(&self) -> Duration {
        Duration::from_millis(self.die_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let config = ConnectionConfig::default();
        assert_eq!(config.die_delay_ms, 5000);
        assert_eq!(config.outbound_heartbeat_ms, 100);
        assert_eq!(config.inbound_heartbeat_ms, 10_000);
        assert_eq!(config.producer_route_cache_size, 10);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.die_delay(), Duration::from_millis(5000));
    }
}
