//! Constructor-time settings for the listener and the session.
//!
//! Everything deserializes with defaults, so an embedder can keep a partial
//! JSON object around and only override what it cares about. Durations are
//! given in milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::codec::{DEFAULT_MAX_FRAME_SIZE, MIN_PAYLOAD_LEN};
use crate::listener::BindError;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8080;

/// What the listener does once a connection ends.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Go back to accepting a new producer.
    #[default]
    Relisten,
    /// Stop after the first connection.
    SingleShot,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted frame, counted after the length prefix.
    pub max_frame_size: usize,
    /// Accept poll period and read timeout. Bounds how long `stop` takes.
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    /// Bytes requested from the socket per read.
    pub read_chunk_size: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            poll_interval: Duration::from_millis(50),
            read_chunk_size: 64 * 1024,
            reconnect: ReconnectPolicy::Relisten,
        }
    }
}

impl ListenerConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// `host:port`, as handed to the socket layer.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), BindError> {
        if self.max_frame_size < MIN_PAYLOAD_LEN {
            return Err(BindError::InvalidConfig(format!(
                "max_frame_size {} is below the smallest frame ({MIN_PAYLOAD_LEN} bytes)",
                self.max_frame_size
            )));
        }
        if self.read_chunk_size == 0 {
            return Err(BindError::InvalidConfig(
                "read_chunk_size must be non-zero".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(BindError::InvalidConfig(
                "poll_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub listener: ListenerConfig,
    /// Rate counter period.
    #[serde(rename = "tick_interval_ms", with = "millis")]
    pub tick_interval: Duration,
    /// Queue depth per snapshot subscriber. Updates beyond it are dropped.
    pub subscriber_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            tick_interval: Duration::from_secs(1),
            subscriber_capacity: 4,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_listener(mut self, listener: ListenerConfig) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
