//! Node-local clock
//!
//! A millisecond counter seeded from wall-clock time and advanced by a
//! ticker worker. Control packets are stamped with it (`time_sent`,
//! traceroute hop times, ping round trips).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug};

/// Millisecond clock shared by all workers of a node
#[derive(Debug)]
pub struct NodeClock {
    millis: AtomicU64,
    tick: Duration,
}

impl NodeClock {
    /// Seed from the current wall-clock time
    pub fn new(tick: Duration) -> Self {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Self::starting_at(now, tick)
    }

    /// Start from an explicit millisecond value
    pub fn starting_at(millis: u64, tick: Duration) -> Self {
        Self {
            millis: AtomicU64::new(millis),
            tick,
        }
    }

    /// Current node time in milliseconds
    pub fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::Acquire)
    }

    /// Current node time in seconds
    pub fn now_secs(&self) -> f64 {
        self.now_millis() as f64 / 1000.0
    }

    /// Advance by one tick
    pub fn advance(&self) {
        let step = (self.tick.as_millis() as u64).max(1);
        self.millis.fetch_add(step, Ordering::AcqRel);
    }

    /// Spawn the ticker worker
    pub fn spawn_ticker(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick.max(Duration::from_millis(1)));
            // The first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => self.advance(),
                }
            }
            debug!("clock ticker stopped");
        }
        .in_current_span())
    }
}
