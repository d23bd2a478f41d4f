use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AgentError;

/// One persisted reading: a tag→value map with its capture time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSample {
    pub taken_at: u64,
    pub values: BTreeMap<String, f64>,
}

/// Interface of the local persistence collaborator. The agent hands it
/// every completed snapshot and never waits on anything downstream of
/// it; history queries exist for the uploader's drain cycle.
pub trait SampleStore: Send + Sync {
    fn store(&self, sample: StoredSample);
    fn latest(&self) -> Option<StoredSample>;
    fn older_than(&self, cutoff: u64) -> Vec<StoredSample>;
    fn purge_older_than(&self, cutoff: u64) -> usize;
}

/// Interface of the uploader that periodically drains persisted samples
/// to a remote endpoint in size-bounded chunks. Retry/backoff lives
/// behind this seam; the core never blocks on upload completion.
#[async_trait]
pub trait SampleUploader: Send + Sync {
    async fn upload_chunk(&self, samples: &[StoredSample]) -> Result<(), AgentError>;
}

/// Bounded in-memory sample ring. The oldest sample falls off when the
/// ring is full.
pub struct MemoryStore {
    ring: Mutex<VecDeque<StoredSample>>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self { ring: Mutex::new(VecDeque::with_capacity(capacity)), capacity }
    }

    pub fn len(&self) -> usize {
        self.ring.lock().map(|ring| ring.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(3_600)
    }
}

impl SampleStore for MemoryStore {
    fn store(&self, sample: StoredSample) {
        if let Ok(mut ring) = self.ring.lock() {
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(sample);
            debug!(samples = ring.len(), "snapshot persisted");
        }
    }

    fn latest(&self) -> Option<StoredSample> {
        self.ring.lock().ok().and_then(|ring| ring.back().cloned())
    }

    fn older_than(&self, cutoff: u64) -> Vec<StoredSample> {
        self.ring
            .lock()
            .map(|ring| {
                ring.iter()
                    .filter(|sample| sample.taken_at < cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn purge_older_than(&self, cutoff: u64) -> usize {
        self.ring
            .lock()
            .map(|mut ring| {
                let before = ring.len();
                ring.retain(|sample| sample.taken_at >= cutoff);
                before - ring.len()
            })
            .unwrap_or(0)
    }
}
