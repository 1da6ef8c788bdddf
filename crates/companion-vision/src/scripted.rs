use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::LandingDetector;

/// Replays a fixed list of landing outcomes, then returns `fallback`.
#[derive(Debug)]
pub struct ScriptedLandingDetector {
    outcomes: Mutex<VecDeque<bool>>,
    fallback: bool,
    attempts: Mutex<u32>,
}

impl ScriptedLandingDetector {
    pub fn new(outcomes: Vec<bool>, fallback: bool) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            fallback,
            attempts: Mutex::new(0),
        }
    }

    pub fn push(&self, outcome: bool) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn attempts(&self) -> u32 {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl LandingDetector for ScriptedLandingDetector {
    async fn try_landing(&self) -> Result<bool> {
        *self.attempts.lock().unwrap() += 1;
        let landed = self.outcomes.lock().unwrap().pop_front().unwrap_or(self.fallback);
        info!("landing(scripted): {}", if landed { "landed" } else { "pad not found" });
        Ok(landed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_then_falls_back() {
        let det = ScriptedLandingDetector::new(vec![false, true], false);
        assert!(!det.try_landing().await.unwrap());
        assert!(det.try_landing().await.unwrap());
        assert!(!det.try_landing().await.unwrap());
        det.push(true);
        assert!(det.try_landing().await.unwrap());
        assert_eq!(det.attempts(), 4);
    }
}
