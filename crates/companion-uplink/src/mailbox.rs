use std::sync::Mutex;

use companion_proto::InboundMessage;
use tokio::sync::Notify;
use tracing::debug;

/// Single-slot inbox. A newer command replaces one not yet consumed.
#[derive(Debug, Default)]
pub struct Mailbox {
    slot: Mutex<Option<InboundMessage>>,
    notify: Notify,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `msg`, returning the unconsumed message it displaced.
    pub fn put(&self, msg: InboundMessage) -> Option<InboundMessage> {
        let displaced = self.slot.lock().unwrap().replace(msg);
        if let Some(old) = &displaced {
            debug!("uplink: unconsumed {} replaced by newer command", old.kind());
        }
        self.notify.notify_one();
        displaced
    }

    pub fn try_take(&self) -> Option<InboundMessage> {
        self.slot.lock().unwrap().take()
    }

    /// Cancel-safe.
    pub async fn take(&self) -> InboundMessage {
        loop {
            let notified = self.notify.notified();
            if let Some(msg) = self.try_take() {
                return msg;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_proto::{FacilityRef, MissionPlan, Position};

    fn update() -> InboundMessage {
        InboundMessage::Update(MissionPlan {
            id: None,
            start: FacilityRef { id: "A".into(), pos: Position::new(0.0, 0.0) },
            waypoints: vec![],
            goal: FacilityRef { id: "B".into(), pos: Position::new(0.0, 1.0) },
        })
    }

    #[tokio::test]
    async fn only_latest_survives() {
        let mb = Mailbox::new();
        assert!(mb.put(update()).is_none());
        assert_eq!(mb.put(InboundMessage::EmergencyLand), Some(update()));
        assert_eq!(mb.take().await, InboundMessage::EmergencyLand);
        assert!(mb.try_take().is_none());
    }

    #[tokio::test]
    async fn take_wakes_on_put() {
        let mb = std::sync::Arc::new(Mailbox::new());
        let waiter = {
            let mb = mb.clone();
            tokio::spawn(async move { mb.take().await })
        };
        tokio::task::yield_now().await;
        mb.put(InboundMessage::Return);
        assert_eq!(waiter.await.unwrap(), InboundMessage::Return);
    }
}
