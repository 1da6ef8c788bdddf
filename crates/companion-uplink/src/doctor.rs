use std::path::Path;

use anyhow::Result;

use crate::cert_pin::parse_pin;
use crate::tls::parse_endpoint;
use crate::{TransportKind, UplinkConfig};

pub fn check_config(cfg: &UplinkConfig) -> Result<()> {
    anyhow::ensure!(cfg.heartbeat_interval_s > 0.0, "uplink.heartbeat_interval_s must be > 0");
    anyhow::ensure!(
        cfg.reconnect_base_s > 0.0 && cfg.reconnect_base_s <= cfg.reconnect_max_s,
        "uplink: need 0 < reconnect_base_s <= reconnect_max_s"
    );
    anyhow::ensure!(cfg.send_timeout_s > 0.0, "uplink.send_timeout_s must be > 0");
    anyhow::ensure!(cfg.outbox_capacity >= 1, "uplink.outbox_capacity must be >= 1");

    if cfg.transport == TransportKind::Tls {
        parse_endpoint(&cfg.endpoint)?;
        for (key, path) in [
            ("client_cert", &cfg.client_cert),
            ("client_key", &cfg.client_key),
            ("ca_cert", &cfg.ca_cert),
        ] {
            if let Some(p) = path {
                anyhow::ensure!(Path::new(p).is_file(), "uplink.{} not readable: {}", key, p);
            }
        }
        if !cfg.pinned_server_spki_sha256.is_empty() {
            parse_pin(&cfg.pinned_server_spki_sha256)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass() {
        check_config(&UplinkConfig::default()).unwrap();
    }

    #[test]
    fn timing_ranges() {
        let cfg = UplinkConfig { reconnect_base_s: 50.0, ..Default::default() };
        assert!(check_config(&cfg).is_err());
        let cfg = UplinkConfig { heartbeat_interval_s: 0.0, ..Default::default() };
        assert!(check_config(&cfg).is_err());
        let cfg = UplinkConfig { outbox_capacity: 0, ..Default::default() };
        assert!(check_config(&cfg).is_err());
    }

    #[test]
    fn certificate_files_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("drone.crt.pem");
        std::fs::write(&cert, "-----BEGIN CERTIFICATE-----\n").unwrap();

        let ok = UplinkConfig { client_cert: Some(cert.display().to_string()), ..Default::default() };
        check_config(&ok).unwrap();

        let missing = UplinkConfig {
            client_key: Some(dir.path().join("nope.pem").display().to_string()),
            ..Default::default()
        };
        assert!(check_config(&missing).is_err());
    }

    #[test]
    fn loopback_skips_endpoint_checks() {
        let cfg = UplinkConfig {
            transport: TransportKind::Loopback,
            endpoint: "whatever".into(),
            pinned_server_spki_sha256: "zz".into(),
            ..Default::default()
        };
        check_config(&cfg).unwrap();
    }
}
