//! Configuration for the endpoint daemon.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vphone_core::event_queue::{DEFAULT_BACKPRESSURE_GRACE, DEFAULT_BACKPRESSURE_THRESHOLD};
use vphone_core::vrcl::buffer::DEFAULT_CAPACITY;
use vphone_core::vrcl::server::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_LIFE_CHECK_INTERVAL, DEFAULT_PORT};
use vphone_core::{ConferenceConfig, LoopbackConfig, VrclServerConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub conference: ConferenceSection,
    pub vrcl: VrclSection,
    pub event_queue: EventQueueSection,
    pub loopback: LoopbackSection,
    pub logging: LoggingConfig,
}

/// Call policy and local identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConferenceSection {
    /// Concurrent live calls allowed.
    pub max_calls: usize,
    /// Refuse every incoming invite with `Busy`.
    pub auto_reject: bool,
    pub allow_incoming_calls: bool,
    pub local_name: String,
    pub local_number: String,
    /// Time a hung-up call may wait for signaling to confirm the disconnect.
    pub disconnect_timeout_ms: u64,
}

/// VRCL remote-control listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VrclSection {
    pub enabled: bool,
    pub port: u16,
    /// IPv4 bind address.
    pub bind: Ipv4Addr,
    /// Also listen on `[::]`.
    pub ipv6: bool,
    /// Time a new client has to authenticate.
    pub connect_timeout_ms: u64,
    pub life_check_interval_ms: u64,
    /// Secret the connect key and challenge passwords derive from.
    pub shared_secret: String,
    /// Receive buffer size in bytes.
    pub buffer_capacity: usize,
}

/// Backlog diagnostics applied to every component queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventQueueSection {
    pub backpressure_threshold: usize,
    pub backpressure_grace_ms: u64,
}

/// The simulated far end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackSection {
    pub answer_delay_ms: u64,
    pub transferable: bool,
    /// Echo text and DTMF back.
    pub echo: bool,
    /// Dial strings answered with `Busy`.
    pub busy_numbers: Vec<String>,
    /// Present an incoming call this long after start. 0 disables it.
    pub ring_in_after_ms: u64,
    pub ring_in_name: String,
    pub ring_in_number: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ConferenceSection {
    fn default() -> Self {
        let defaults = ConferenceConfig::default();
        Self {
            max_calls: defaults.max_calls,
            auto_reject: defaults.auto_reject,
            allow_incoming_calls: defaults.allow_incoming_calls,
            local_name: "Videophone".into(),
            local_number: String::new(),
            disconnect_timeout_ms: defaults.disconnect_timeout.as_millis() as u64,
        }
    }
}

impl Default for VrclSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_PORT,
            bind: Ipv4Addr::UNSPECIFIED,
            ipv6: true,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            life_check_interval_ms: DEFAULT_LIFE_CHECK_INTERVAL.as_millis() as u64,
            shared_secret: "change me".into(),
            buffer_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl Default for EventQueueSection {
    fn default() -> Self {
        Self {
            backpressure_threshold: DEFAULT_BACKPRESSURE_THRESHOLD,
            backpressure_grace_ms: DEFAULT_BACKPRESSURE_GRACE.as_millis() as u64,
        }
    }
}

impl Default for LoopbackSection {
    fn default() -> Self {
        let defaults = LoopbackConfig::default();
        Self {
            answer_delay_ms: defaults.answer_delay.as_millis() as u64,
            transferable: defaults.transferable,
            echo: defaults.echo,
            busy_numbers: defaults.busy_numbers,
            ring_in_after_ms: 0,
            ring_in_name: "Loopback".into(),
            ring_in_number: "5550100".into(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl EndpointConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    // ── Conversions ──────────────────────────────────────────────

    pub fn to_conference_config(&self) -> ConferenceConfig {
        ConferenceConfig {
            max_calls: self.conference.max_calls.max(1),
            auto_reject: self.conference.auto_reject,
            allow_incoming_calls: self.conference.allow_incoming_calls,
            local_name: self.conference.local_name.clone(),
            local_number: self.conference.local_number.clone(),
            disconnect_timeout: Duration::from_millis(
                self.conference.disconnect_timeout_ms.max(100),
            ),
        }
    }

    pub fn to_server_config(&self) -> VrclServerConfig {
        VrclServerConfig {
            port: self.vrcl.port,
            bind_v4: self.vrcl.bind,
            ipv6: self.vrcl.ipv6,
            connect_timeout: Duration::from_millis(self.vrcl.connect_timeout_ms.max(100)),
            life_check_interval: Duration::from_millis(self.vrcl.life_check_interval_ms.max(100)),
            buffer_capacity: self.vrcl.buffer_capacity.max(1024),
            ..VrclServerConfig::default()
        }
    }

    pub fn to_loopback_config(&self) -> LoopbackConfig {
        LoopbackConfig {
            answer_delay: Duration::from_millis(self.loopback.answer_delay_ms),
            transferable: self.loopback.transferable,
            echo: self.loopback.echo,
            busy_numbers: self.loopback.busy_numbers.clone(),
            ..LoopbackConfig::default()
        }
    }

    pub fn backpressure(&self) -> (usize, Duration) {
        (
            self.event_queue.backpressure_threshold,
            Duration::from_millis(self.event_queue.backpressure_grace_ms),
        )
    }

    pub fn ring_in_after(&self) -> Option<Duration> {
        match self.loopback.ring_in_after_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
