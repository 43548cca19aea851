//! Ordered shutdown
//!
//! Workers are grouped into stages listed upstream first: the accept loop
//! and timers, then the inbound queue consumers, then the outbound consumer.
//! Stopping signals one stage and waits for every task in it before the next
//! stage is signalled, so a queue is always still being read while its
//! producers drain into it.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A group of workers stopped together
#[derive(Debug)]
pub(crate) struct Stage {
    name: &'static str,
    signal: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Stage {
    pub(crate) fn new(name: &'static str) -> Self {
        let (signal, _) = broadcast::channel(1);
        Self {
            name,
            signal,
            tasks: Vec::new(),
        }
    }

    /// Receiver that fires when this stage is stopped
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<()> {
        self.signal.subscribe()
    }

    /// Sender for tasks that subscribe later (retry timers)
    pub(crate) fn signal(&self) -> broadcast::Sender<()> {
        self.signal.clone()
    }

    pub(crate) fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    async fn stop(self) {
        let _ = self.signal.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(stage = self.name, error = %e, "worker ended abnormally");
            }
        }
        debug!(stage = self.name, "stage stopped");
    }
}

/// Stop `stages` one after another, in order
pub(crate) async fn stop_in_order(stages: Vec<Stage>) {
    for stage in stages {
        stage.stop().await;
    }
}
