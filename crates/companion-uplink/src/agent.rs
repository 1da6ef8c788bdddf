use std::sync::{Arc, Mutex};
use std::time::Duration;

use companion_proto::{Heartbeat, InboundMessage, OutboundKind, OutboundMessage};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::mailbox::Mailbox;
use crate::outbox::Outbox;
use crate::transport::{Connector, FrameSink, FrameSource, LinkError};
use crate::{LinkHealth, UplinkConfig};

/// Produces the current heartbeat, or `None` while telemetry is incomplete.
pub type HeartbeatSource = Arc<dyn Fn() -> Option<Heartbeat> + Send + Sync>;

enum SessionEnd {
    Shutdown,
    Lost,
    ReaderClosed,
}

/// Keeps one connection to the ground server alive.
///
/// Per round the agent sends whichever is ready first: a heartbeat when the
/// interval has elapsed, or the newest queued message. A failed send drops the
/// connection, puts non-heartbeat messages back into the outbox and reconnects
/// after a backoff delay. Inbound frames land in the mailbox.
pub struct ConnectionAgent {
    connector: Arc<dyn Connector>,
    outbox: Arc<Outbox>,
    mailbox: Arc<Mailbox>,
    heartbeat: HeartbeatSource,
    heartbeat_interval: Duration,
    send_timeout: Duration,
    backoff: Backoff,
    health: Mutex<LinkHealth>,
}

impl ConnectionAgent {
    pub fn new(
        cfg: &UplinkConfig,
        connector: Arc<dyn Connector>,
        outbox: Arc<Outbox>,
        mailbox: Arc<Mailbox>,
        heartbeat: HeartbeatSource,
    ) -> Self {
        Self {
            connector,
            outbox,
            mailbox,
            heartbeat,
            heartbeat_interval: cfg.heartbeat_interval(),
            send_timeout: cfg.send_timeout(),
            backoff: cfg.backoff(),
            health: Mutex::new(LinkHealth::default()),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn health(&self) -> LinkHealth {
        self.health.lock().unwrap().clone()
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = self.backoff.clone();
        info!("uplink: agent started, endpoint {}", self.connector.describe());

        while !cancel.is_cancelled() {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.connector.connect() => res,
            };

            let end = match connected {
                Ok((mut sink, source)) => {
                    info!("uplink: connected to {}", self.connector.describe());
                    let reader_cancel = cancel.child_token();
                    let mut reader = tokio::spawn(read_loop(source, self.mailbox.clone(), reader_cancel.clone()));
                    let end = self.session(sink.as_mut(), &mut reader, &cancel, &mut backoff).await;
                    if !matches!(end, SessionEnd::ReaderClosed) {
                        reader_cancel.cancel();
                        let _ = reader.await;
                    }
                    end
                }
                Err(e) => {
                    self.link_failed("connect", &e);
                    SessionEnd::Lost
                }
            };
            if matches!(end, SessionEnd::Shutdown) {
                break;
            }

            let delay = backoff.next_delay();
            info!("uplink: reconnecting in {:.1}s", delay.as_secs_f64());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("uplink: agent stopped");
    }

    async fn session(
        &self,
        sink: &mut dyn FrameSink,
        reader: &mut JoinHandle<()>,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
    ) -> SessionEnd {
        let mut confirmed = false;
        let mut confirm = |backoff: &mut Backoff| {
            if !confirmed {
                confirmed = true;
                backoff.reset();
            }
        };

        // first heartbeat goes out before the outbox drains
        if let Some(hb) = (self.heartbeat)() {
            if self.send(sink, &OutboundMessage::heartbeat(hb)).await.is_err() {
                return SessionEnd::Lost;
            }
            confirm(backoff);
        }
        let mut next_hb = Instant::now() + self.heartbeat_interval;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return SessionEnd::Shutdown,
                _ = &mut *reader => return SessionEnd::ReaderClosed,
                _ = sleep_until(next_hb) => {
                    next_hb = Instant::now() + self.heartbeat_interval;
                    match (self.heartbeat)() {
                        Some(hb) => {
                            if self.send(sink, &OutboundMessage::heartbeat(hb)).await.is_err() {
                                return SessionEnd::Lost;
                            }
                            confirm(backoff);
                        }
                        None => debug!("uplink: no position/battery yet, heartbeat skipped"),
                    }
                }
                msg = self.outbox.pop() => {
                    if self.send(sink, &msg).await.is_err() {
                        if msg.kind != OutboundKind::Heartbeat {
                            self.outbox.requeue(msg);
                        }
                        return SessionEnd::Lost;
                    }
                    confirm(backoff);
                }
            }
        }
    }

    async fn send(&self, sink: &mut dyn FrameSink, msg: &OutboundMessage) -> Result<(), LinkError> {
        let frame = msg.encode()?;
        let start = Instant::now();
        let res = match timeout(self.send_timeout, sink.send(&frame)).await {
            Ok(res) => res,
            Err(_) => Err(LinkError::Timeout),
        };
        match &res {
            Ok(()) => {
                let quality = {
                    let mut h = self.health.lock().unwrap();
                    h.record_success(start.elapsed());
                    h.quality
                };
                debug!(
                    "uplink: sent {} #{} ({} bytes, quality {}%)",
                    msg.kind.as_str(),
                    msg.sequence_number,
                    frame.len(),
                    quality
                );
            }
            Err(e) => self.link_failed(&format!("send {}", msg.kind.as_str()), e),
        }
        res
    }

    fn link_failed(&self, what: &str, err: &LinkError) {
        let (failures, quality) = {
            let mut h = self.health.lock().unwrap();
            (h.record_failure(), h.quality)
        };
        warn!("uplink: {} failed (failures: {}, quality: {}%): {}", what, failures, quality, err);
    }
}

async fn read_loop(mut source: Box<dyn FrameSource>, mailbox: Arc<Mailbox>, cancel: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            res = source.recv() => res,
        };
        match frame {
            Ok(frame) => match InboundMessage::decode(&frame) {
                Ok(msg) => {
                    info!("uplink: received {}", msg.kind());
                    mailbox.put(msg);
                }
                Err(e) => warn!("uplink: ignoring inbound frame: {}", e),
            },
            Err(e) => {
                warn!("uplink: receive failed: {}", e);
                return;
            }
        }
    }
}
