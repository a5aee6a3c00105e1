//! Connection and component configuration, with the defaults named in the
//! external-interfaces section of the protocol description.
//!
//! Loading from disk is a thin convenience around `serde` + `toml` — the
//! wire protocol and connection logic never depend on where a
//! [`QuantumConfig`] came from, only on its field values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for a dialed or listening connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantumConfig {
    pub send_window: u32,
    pub recv_window: u32,
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    pub fec: FecConfig,
    pub bbr: BbrConfig,
    pub transport: TransportConfig,
}

impl Default for QuantumConfig {
    fn default() -> Self {
        QuantumConfig {
            send_window: 256,
            recv_window: 256,
            keepalive_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            fec: FecConfig::default(),
            bbr: BbrConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl QuantumConfig {
    /// Load configuration from a TOML file, falling back to defaults for any
    /// field the file omits.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FecConfig {
    pub enabled: bool,
    pub data_shards: u8,
    pub parity_shards: u8,
}

impl Default for FecConfig {
    fn default() -> Self {
        FecConfig {
            enabled: true,
            data_shards: 10,
            parity_shards: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BbrConfig {
    pub initial_cwnd_packets: u32,
    #[serde(with = "duration_millis")]
    pub min_rtt: Duration,
    /// Bytes per second.
    pub max_bandwidth: u64,
}

impl Default for BbrConfig {
    fn default() -> Self {
        BbrConfig {
            initial_cwnd_packets: 10,
            min_rtt: Duration::from_millis(10),
            max_bandwidth: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub read_buffer_bytes: usize,
    pub write_buffer_bytes: usize,
    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            read_buffer_bytes: 2 * 1024 * 1024,
            write_buffer_bytes: 2 * 1024 * 1024,
            read_timeout: Duration::from_secs(30),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
