use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::notify::{EngineEvent, EventBus};

/// Latest progress of one job. Mutated only by the job's own worker; read
/// by any number of observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: String,
    pub processed: usize,
    pub total: usize,
    pub percent: f32,
    pub current_step: String,
    pub eta_secs: u64,
}

/// Percentage with the reporting contract applied: clamped to [0, 100],
/// and an empty workload reports 100 immediately.
pub fn percent_complete(processed: usize, total: usize) -> f32 {
    if total == 0 {
        return 100.0;
    }
    ((processed as f64 * 100.0 / total as f64) as f32).clamp(0.0, 100.0)
}

struct Entry {
    snapshot: ProgressSnapshot,
    started: Instant,
}

/// Keeps the latest snapshot per job. No history is retained.
pub struct ProgressReporter {
    entries: RwLock<HashMap<String, Entry>>,
    bus: Option<EventBus>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            bus: None,
        }
    }

    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            bus: Some(bus),
        }
    }

    pub fn report(&self, job_id: &str, processed: usize, total: usize, step: &str) {
        let percent = percent_complete(processed, total);
        let mut entries = self.entries.write().expect("progress registry poisoned");
        let started = entries
            .get(job_id)
            .map(|e| e.started)
            .unwrap_or_else(Instant::now);
        let frac = percent as f64 / 100.0;
        let eta_secs = if frac > 0.0 && frac < 1.0 {
            (started.elapsed().as_secs_f64() * (1.0 - frac) / frac) as u64
        } else {
            0
        };
        let snapshot = ProgressSnapshot {
            job_id: job_id.to_string(),
            processed,
            total,
            percent,
            current_step: step.to_string(),
            eta_secs,
        };
        entries.insert(
            job_id.to_string(),
            Entry {
                snapshot: snapshot.clone(),
                started,
            },
        );
        drop(entries);
        if let Some(bus) = &self.bus {
            bus.publish(EngineEvent::Progress(snapshot));
        }
    }

    pub fn snapshot(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.entries
            .read()
            .expect("progress registry poisoned")
            .get(job_id)
            .map(|e| e.snapshot.clone())
    }

    /// Drop a finished job's snapshot.
    pub fn remove(&self, job_id: &str) {
        self.entries
            .write()
            .expect("progress registry poisoned")
            .remove(job_id);
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}
