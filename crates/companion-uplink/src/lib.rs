pub mod agent;
pub mod backoff;
pub mod cert_pin;
pub mod codec;
pub mod doctor;
pub mod loopback;
pub mod mailbox;
pub mod outbox;
pub mod tls;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use time::OffsetDateTime;

pub use agent::{ConnectionAgent, HeartbeatSource};
pub use backoff::Backoff;
pub use loopback::LoopbackConnector;
pub use mailbox::Mailbox;
pub use outbox::Outbox;
pub use tls::TlsConnector;
pub use transport::{Connection, Connector, FrameSink, FrameSource, LinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tls,
    Loopback,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    pub transport: TransportKind,
    /// tls://host:port
    pub endpoint: String,
    /// PEM chain presented to the server
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
    /// Extra trust anchor on top of the webpki roots
    pub ca_cert: Option<String>,
    /// Hex SHA-256 of the server SubjectPublicKeyInfo; empty disables pinning
    pub pinned_server_spki_sha256: String,

    pub heartbeat_interval_s: f64,
    pub reconnect_base_s: f64,
    pub reconnect_max_s: f64,
    pub send_timeout_s: f64,
    pub outbox_capacity: usize,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Tls,
            endpoint: "tls://localhost:8443".into(),
            client_cert: None,
            client_key: None,
            ca_cert: None,
            pinned_server_spki_sha256: String::new(),
            heartbeat_interval_s: 5.0,
            reconnect_base_s: 1.0,
            reconnect_max_s: 40.0,
            send_timeout_s: 10.0,
            outbox_capacity: 64,
        }
    }
}

impl UplinkConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        secs(self.heartbeat_interval_s)
    }

    pub fn send_timeout(&self) -> Duration {
        secs(self.send_timeout_s)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(secs(self.reconnect_base_s), secs(self.reconnect_max_s))
    }
}

fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s.max(0.0))
}

pub fn build_connector(cfg: &UplinkConfig) -> Result<Arc<dyn Connector>> {
    Ok(match cfg.transport {
        TransportKind::Tls => Arc::new(TlsConnector::from_config(cfg)?),
        TransportKind::Loopback => Arc::new(LoopbackConnector::new(true)),
    })
}

#[derive(Debug, Clone)]
pub struct LinkHealth {
    pub rtt_ms: Option<u32>,
    pub quality: u8, // 0-100
    pub consecutive_failures: u32,
    pub last_ok: Option<OffsetDateTime>,
}

impl Default for LinkHealth {
    fn default() -> Self {
        Self {
            rtt_ms: None,
            quality: 100,
            consecutive_failures: 0,
            last_ok: None,
        }
    }
}

impl LinkHealth {
    pub fn record_success(&mut self, rtt: Duration) {
        self.rtt_ms = Some(rtt.as_millis().min(u32::MAX as u128) as u32);
        self.consecutive_failures = 0;
        self.quality = (self.quality + 10).min(100);
        self.last_ok = Some(OffsetDateTime::now_utc());
    }

    /// Returns the new consecutive failure count.
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures += 1;
        self.quality = self.quality.saturating_sub(20);
        self.consecutive_failures
    }
}
