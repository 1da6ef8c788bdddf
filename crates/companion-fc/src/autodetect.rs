use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::Result;
use mavlink::common::MavMessage;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CandidateResult {
    pub url: String,
    pub hb_seen: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct AutodetectResult {
    pub chosen: Option<String>,
    pub attempts: Vec<CandidateResult>,
}

pub fn default_candidate_devs() -> Vec<String> {
    vec![
        "/dev/serial0".into(),
        "/dev/ttyAMA0".into(),
        "/dev/ttyS0".into(),
        "/dev/ttyUSB0".into(),
        "/dev/ttyACM0".into(),
    ]
}

pub fn default_candidate_bauds() -> Vec<u32> {
    vec![57600, 115200, 921600]
}

pub fn serial_url(dev: &str, baud: u32) -> String {
    format!("serial:{}:{}", dev, baud)
}

/// Tries each present device at each baud until an autopilot heartbeat shows up.
/// Blocking; call from `spawn_blocking` inside async code.
pub fn autodetect_fc(devs: &[String], bauds: &[u32], heartbeat_timeout: Duration) -> Result<AutodetectResult> {
    let present: Vec<String> = tokio_serial::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .unwrap_or_default();

    let mut attempts = Vec::new();
    for dev in devs {
        // symlinks like /dev/serial0 are not always enumerated
        if !present.iter().any(|p| p == dev) && !std::path::Path::new(dev).exists() {
            attempts.push(CandidateResult {
                url: dev.clone(),
                hb_seen: false,
                elapsed_ms: 0,
                note: "not present".into(),
            });
            continue;
        }
        for &baud in bauds {
            let url = serial_url(dev, baud);
            let start = Instant::now();
            let (hb_seen, note) = match listen_for_heartbeat(&url, heartbeat_timeout) {
                Ok(true) => (true, "heartbeat".to_string()),
                Ok(false) => (false, "no heartbeat".to_string()),
                Err(e) => {
                    warn!("fc autodetect candidate failed url={} err={:#}", url, e);
                    (false, format!("open/connect failed: {:#}", e))
                }
            };
            attempts.push(CandidateResult {
                url: url.clone(),
                hb_seen,
                elapsed_ms: start.elapsed().as_millis() as u64,
                note,
            });
            if hb_seen {
                info!("fc autodetect: OK {}", url);
                return Ok(AutodetectResult { chosen: Some(url), attempts });
            }
        }
    }
    Ok(AutodetectResult { chosen: None, attempts })
}

fn listen_for_heartbeat(url: &str, timeout: Duration) -> Result<bool> {
    let conn = mavlink::connect::<MavMessage>(url)?;
    let (tx, rx) = mpsc::channel();
    // recv() can block indefinitely on a silent port; the reader is left behind on timeout
    std::thread::spawn(move || loop {
        match conn.recv() {
            Ok((_, MavMessage::HEARTBEAT(_))) => {
                let _ = tx.send(true);
                return;
            }
            Ok(_) => {}
            Err(_) => {
                if tx.send(false).is_err() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(25));
            }
        }
    });
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Ok(false);
        }
        match rx.recv_timeout(left) {
            Ok(true) => return Ok(true),
            Ok(false) => continue,
            Err(_) => return Ok(false),
        }
    }
}
