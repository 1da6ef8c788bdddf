use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use companion_proto::{OutboundKind, OutboundMessage, OutboundPayload};
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct OutboxState {
    /// Oldest at the front, next to send at the back.
    stack: VecDeque<OutboundMessage>,
    /// Newest sequence number handed out per kind.
    latest: HashMap<OutboundKind, u64>,
}

/// Bounded LIFO of outbound messages.
///
/// Every push takes the next sequence number for its kind. A message whose
/// number is no longer the newest for its kind has been superseded and is
/// dropped at dequeue time instead of being sent. When full, superseded
/// entries are purged first; only if that frees nothing is the oldest live
/// entry discarded.
#[derive(Debug)]
pub struct Outbox {
    inner: Mutex<OutboxState>,
    notify: Notify,
    capacity: usize,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(OutboxState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Queues `payload` and returns the sequence number it was given.
    pub fn push(&self, payload: OutboundPayload) -> u64 {
        let kind = payload.kind();
        let seq = {
            let mut st = self.inner.lock().unwrap();
            let seq = st.latest.entry(kind).or_insert(0);
            *seq += 1;
            let seq = *seq;
            self.insert(&mut st, OutboundMessage::new(seq, payload));
            seq
        };
        debug!("uplink: queued {} #{}", kind.as_str(), seq);
        self.notify.notify_one();
        seq
    }

    /// Puts back a message whose send failed, keeping its sequence number.
    pub fn requeue(&self, msg: OutboundMessage) {
        {
            let mut st = self.inner.lock().unwrap();
            if st.latest.get(&msg.kind) != Some(&msg.sequence_number) {
                debug!(
                    "uplink: not requeueing superseded {} #{}",
                    msg.kind.as_str(),
                    msg.sequence_number
                );
                return;
            }
            self.insert(&mut st, msg);
        }
        self.notify.notify_one();
    }

    fn insert(&self, st: &mut OutboxState, msg: OutboundMessage) {
        if st.stack.len() >= self.capacity {
            let OutboxState { stack, latest } = &mut *st;
            let before = stack.len();
            stack.retain(|m| latest.get(&m.kind) == Some(&m.sequence_number));
            if stack.len() < before {
                debug!("uplink: outbox full, purged {} superseded", before - stack.len());
            }
        }
        if st.stack.len() >= self.capacity {
            if let Some(old) = st.stack.pop_front() {
                warn!(
                    "uplink: outbox full, dropping {} #{}",
                    old.kind.as_str(),
                    old.sequence_number
                );
            }
        }
        st.stack.push_back(msg);
    }

    /// Newest current message, skipping superseded ones.
    pub fn try_pop(&self) -> Option<OutboundMessage> {
        let mut st = self.inner.lock().unwrap();
        while let Some(msg) = st.stack.pop_back() {
            if st.latest.get(&msg.kind) == Some(&msg.sequence_number) {
                return Some(msg);
            }
            debug!(
                "uplink: dropping superseded {} #{}",
                msg.kind.as_str(),
                msg.sequence_number
            );
        }
        None
    }

    /// Waits for the next sendable message. Cancel-safe.
    pub async fn pop(&self) -> OutboundMessage {
        loop {
            let notified = self.notify.notified();
            if let Some(msg) = self.try_pop() {
                return msg;
            }
            notified.await;
        }
    }

    /// Sequence number of the newest `kind` message pushed so far, 0 if none.
    pub fn last_sequence(&self, kind: OutboundKind) -> u64 {
        self.inner.lock().unwrap().latest.get(&kind).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
