use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{LandingConfig, LandingDetector};

/// Runs the pad-landing pipeline (camera capture, detection, tracking,
/// descent) as a child process and reports its exit status.
///
/// The child is killed if it outlives `timeout` or the caller is cancelled.
#[derive(Debug, Clone)]
pub struct ProcessLandingDetector {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessLandingDetector {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self { command: command.into(), args, timeout }
    }

    pub fn from_config(cfg: &LandingConfig) -> Self {
        Self::new(cfg.command.clone(), cfg.args.clone(), Duration::from_secs_f64(cfg.timeout_s.max(0.0)))
    }
}

#[async_trait]
impl LandingDetector for ProcessLandingDetector {
    async fn try_landing(&self) -> Result<bool> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("landing: spawning {} {:?}", self.command, self.args);
        let child = cmd.spawn().with_context(|| format!("spawn {}", self.command))?;

        let out = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(out) => out.context("wait for landing pipeline")?,
            Err(_) => {
                warn!("landing: pipeline timed out after {:.0}s", self.timeout.as_secs_f64());
                return Ok(false);
            }
        };

        let landed = out.status.success();
        if landed {
            info!("landing: pad landing confirmed");
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr);
            warn!("landing: pipeline exited with {} {}", out.status, stderr.trim());
        }
        Ok(landed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> ProcessLandingDetector {
        ProcessLandingDetector::new("sh", vec!["-c".into(), script.into()], timeout)
    }

    #[tokio::test]
    async fn exit_status_decides() {
        assert!(sh("exit 0", Duration::from_secs(5)).try_landing().await.unwrap());
        assert!(!sh("echo no pad >&2; exit 3", Duration::from_secs(5)).try_landing().await.unwrap());
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let det = sh("sleep 5", Duration::from_millis(100));
        assert!(!det.try_landing().await.unwrap());
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let det = ProcessLandingDetector::new("/nonexistent/pad-landing", vec![], Duration::from_secs(1));
        assert!(det.try_landing().await.is_err());
    }
}
