use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::TelemetryStream;

#[derive(Debug, Clone)]
pub struct TelemetryValue<T> {
    pub value: Option<T>,
    /// Monotonic time of the last update; `None` until the first one.
    pub last_update: Option<Instant>,
    /// Wall clock of the last update, for status output.
    pub updated_at: Option<OffsetDateTime>,
}

/// Latest value of a continuous telemetry stream.
///
/// A gap longer than `stale_after` between two updates is logged, never an error.
#[derive(Debug, Clone)]
pub struct TelemetryCache<T> {
    name: &'static str,
    stale_after: Duration,
    inner: Arc<Mutex<TelemetryValue<T>>>,
}

impl<T: Clone + Send + 'static> TelemetryCache<T> {
    pub fn new(name: &'static str, stale_after: Duration) -> Self {
        Self {
            name,
            stale_after,
            inner: Arc::new(Mutex::new(TelemetryValue {
                value: None,
                last_update: None,
                updated_at: None,
            })),
        }
    }

    /// Creates the cache and a listener task feeding it from `stream` until the
    /// stream ends or `cancel` fires.
    pub fn spawn(
        name: &'static str,
        stale_after: Duration,
        mut stream: TelemetryStream<T>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let cache = Self::new(name, stale_after);
        let feeder = cache.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.next() => match next {
                        Some(v) => feeder.update(v),
                        None => {
                            warn!("telemetry: {} stream ended", feeder.name);
                            break;
                        }
                    },
                }
            }
            debug!("telemetry: {} listener stopped", feeder.name);
        });
        (cache, handle)
    }

    pub fn update(&self, v: T) {
        let now = Instant::now();
        let mut g = self.inner.lock().unwrap();
        if let Some(prev) = g.last_update {
            let gap = now.duration_since(prev);
            if gap >= self.stale_after {
                warn!("telemetry: {} came too late ({:.1}s since previous)", self.name, gap.as_secs_f64());
            }
        }
        g.value = Some(v);
        g.last_update = Some(now);
        g.updated_at = Some(OffsetDateTime::now_utc());
    }

    pub fn latest(&self) -> Option<T> {
        self.inner.lock().unwrap().value.clone()
    }

    pub fn snapshot(&self) -> TelemetryValue<T> {
        self.inner.lock().unwrap().clone()
    }

    /// True when nothing arrived yet or the last value is older than `stale_after`.
    pub fn is_stale(&self) -> bool {
        match self.inner.lock().unwrap().last_update {
            Some(t) => t.elapsed() >= self.stale_after,
            None => true,
        }
    }
}
