use serde::Serialize;
use tokio::sync::broadcast;

use crate::job::JobStatus;
use crate::progress::ProgressSnapshot;

/// Push notifications emitted by the job manager and progress reporter.
#[derive(Debug, Clone, Serialize)]
pub enum EngineEvent {
    StatusChanged { job_id: String, status: JobStatus },
    Progress(ProgressSnapshot),
}

/// Best-effort fan-out channel. Publishing with no subscribers is a no-op;
/// slow subscribers lag and drop, they never block a running job.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
