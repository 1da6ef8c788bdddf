use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::{Connection, Connector, FrameSink, FrameSource, LinkError};

const SENT_HISTORY: usize = 1024;

#[derive(Debug, Default)]
struct LoopState {
    online: bool,
    generation: u64,
    connects: u32,
    fail_sends: u32,
    sent: VecDeque<Vec<u8>>,
    to_client: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// In-process stand-in for the ground server. Frames sent by the agent are
/// recorded; frames injected here are delivered to the agent. Going offline
/// drops the current connection and refuses new ones.
#[derive(Debug, Clone, Default)]
pub struct LoopbackConnector {
    state: Arc<Mutex<LoopState>>,
}

impl LoopbackConnector {
    pub fn new(online: bool) -> Self {
        let this = Self::default();
        this.state.lock().unwrap().online = online;
        this
    }

    pub fn set_online(&self, online: bool) {
        let mut st = self.state.lock().unwrap();
        st.online = online;
        if !online {
            st.to_client = None;
            st.generation += 1;
        }
    }

    /// Makes the next `n` sends fail as if the link dropped mid-write.
    pub fn fail_next_sends(&self, n: u32) {
        self.state.lock().unwrap().fail_sends = n;
    }

    /// Delivers `frame` to the connected agent. Returns false when nobody is connected.
    pub fn inject(&self, frame: impl Into<Vec<u8>>) -> bool {
        let st = self.state.lock().unwrap();
        match &st.to_client {
            Some(tx) => tx.send(frame.into()).is_ok(),
            None => false,
        }
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.iter().cloned().collect()
    }

    /// Sent frames parsed as JSON.
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent()
            .iter()
            .filter_map(|f| serde_json::from_slice(f).ok())
            .collect()
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().unwrap().connects
    }
}

struct LoopSink {
    state: Arc<Mutex<LoopState>>,
    generation: u64,
}

#[async_trait]
impl FrameSink for LoopSink {
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let mut st = self.state.lock().unwrap();
        if !st.online || st.generation != self.generation {
            return Err(LinkError::Closed);
        }
        if st.fail_sends > 0 {
            st.fail_sends -= 1;
            st.to_client = None;
            st.generation += 1;
            return Err(LinkError::Closed);
        }
        if st.sent.len() >= SENT_HISTORY {
            st.sent.pop_front();
        }
        st.sent.push_back(frame.to_vec());
        debug!("uplink(loopback): {}", String::from_utf8_lossy(frame));
        Ok(())
    }
}

struct LoopSource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameSource for LoopSource {
    async fn recv(&mut self) -> Result<Vec<u8>, LinkError> {
        self.rx.recv().await.ok_or(LinkError::Closed)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Connection, LinkError> {
        let mut st = self.state.lock().unwrap();
        st.connects += 1;
        if !st.online {
            return Err(LinkError::Refused("loopback offline".into()));
        }
        st.generation += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        st.to_client = Some(tx);
        let sink = LoopSink { state: self.state.clone(), generation: st.generation };
        Ok((Box::new(sink), Box::new(LoopSource { rx })))
    }

    fn describe(&self) -> String {
        "loopback".into()
    }
}
