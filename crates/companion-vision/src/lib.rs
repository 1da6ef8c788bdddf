pub mod process;
pub mod scripted;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

pub use process::ProcessLandingDetector;
pub use scripted::ScriptedLandingDetector;

/// Precision landing on the pad at the current location.
#[async_trait]
pub trait LandingDetector: Send + Sync {
    /// `Ok(true)` once the vehicle is down on the pad. `Ok(false)` and `Err`
    /// both mean the pad landing did not happen.
    async fn try_landing(&self) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LandingMode {
    Process,
    Scripted,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LandingConfig {
    pub mode: LandingMode,
    /// External landing pipeline; exit status 0 means landed.
    pub command: String,
    pub args: Vec<String>,
    pub timeout_s: f64,
    /// Outcomes replayed by the scripted detector, then `true` forever.
    pub outcomes: Vec<bool>,
}

impl Default for LandingConfig {
    fn default() -> Self {
        Self {
            mode: LandingMode::Process,
            command: "/opt/companion/bin/pad-landing".into(),
            args: Vec::new(),
            timeout_s: 120.0,
            outcomes: Vec::new(),
        }
    }
}

pub fn build_detector(cfg: &LandingConfig) -> Arc<dyn LandingDetector> {
    match cfg.mode {
        LandingMode::Process => Arc::new(ProcessLandingDetector::from_config(cfg)),
        LandingMode::Scripted => Arc::new(ScriptedLandingDetector::new(cfg.outcomes.clone(), true)),
    }
}

pub fn check_config(cfg: &LandingConfig) -> Result<()> {
    anyhow::ensure!(cfg.timeout_s > 0.0, "landing.timeout_s must be > 0");
    if cfg.mode == LandingMode::Process {
        anyhow::ensure!(!cfg.command.trim().is_empty(), "landing.command is empty");
    }
    Ok(())
}
