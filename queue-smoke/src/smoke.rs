use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_queue::{Batch, BatchProcessor, Context};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmokeEvent {
    pub run_id: Uuid,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

pub fn events(run_id: Uuid, count: usize) -> Batch<SmokeEvent> {
    (0..count as u64)
        .map(|sequence| SmokeEvent {
            run_id,
            sequence,
            created_at: Utc::now(),
        })
        .collect()
}

/// Counts the distinct events of one run and cancels `done` once all of them
/// arrived. Events left on the topic by earlier runs are ignored.
pub struct SmokeProcessor {
    run_id: Uuid,
    expected: usize,
    seen: Mutex<HashSet<u64>>,
    done: CancellationToken,
}

impl SmokeProcessor {
    pub fn new(run_id: Uuid, expected: usize, done: CancellationToken) -> Self {
        SmokeProcessor {
            run_id,
            expected,
            seen: Mutex::new(HashSet::new()),
            done,
        }
    }

    pub fn seen(&self) -> usize {
        self.seen.lock().map(|seen| seen.len()).unwrap_or_default()
    }
}

#[async_trait]
impl BatchProcessor<SmokeEvent> for SmokeProcessor {
    async fn process_batch(&self, _: &Context, batch: &mut Batch<SmokeEvent>) -> anyhow::Result<()> {
        let seen = {
            let mut seen = self
                .seen
                .lock()
                .map_err(|_| anyhow::anyhow!("smoke counter lock poisoned"))?;
            for event in batch.iter().filter(|e| e.run_id == self.run_id) {
                seen.insert(event.sequence);
            }
            seen.len()
        };

        debug!(batch = batch.len(), "consumed batch");
        if seen >= self.expected {
            info!(seen, "all smoke events consumed");
            self.done.cancel();
        }
        Ok(())
    }
}
