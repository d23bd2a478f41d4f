use heapless::Deque;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::AgentError;

/// Bound of the read queue. The periodic reader enqueues at most one
/// cycle per tick, so depth only builds up while the bus is slow.
pub const READ_QUEUE_DEPTH: usize = 10;
/// Bound of the write queue. Writes are rare operator/remote intent.
pub const WRITE_QUEUE_DEPTH: usize = 5;

/// Confirmed result of a register write, echoed back to the originator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteConfirm {
    pub address: u16,
    pub value: u16,
}

/// A queued bus operation. Owned by the scheduler from enqueue until it
/// is handed to the engine; write results travel back over the oneshot.
#[derive(Debug)]
pub enum BusRequest {
    /// One full read cycle over all configured register blocks.
    Read,
    Write {
        address: u16,
        value: u16,
        reply: oneshot::Sender<Result<WriteConfirm, AgentError>>,
    },
}

impl BusRequest {
    pub fn is_write(&self) -> bool {
        matches!(self, BusRequest::Write { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub reads_enqueued: u32,
    pub writes_enqueued: u32,
    pub reads_dropped: u32,
    pub writes_dropped: u32,
    pub serviced: u32,
}

/// Two bounded FIFO queues multiplexed onto the single half-duplex bus.
///
/// Whenever the bus goes idle a pending write is serviced before any
/// pending read; within a queue order is strict FIFO. A full queue
/// rejects the request back to the caller instead of blocking.
#[derive(Debug, Default)]
pub struct BusScheduler {
    reads: Deque<BusRequest, READ_QUEUE_DEPTH>,
    writes: Deque<BusRequest, WRITE_QUEUE_DEPTH>,
    stats: SchedulerStats,
}

impl BusScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one read cycle. Errors when the read queue is full; the
    /// dropped cycle is only logged by the caller since the previous
    /// snapshot stays valid.
    pub fn enqueue_read(&mut self) -> Result<(), AgentError> {
        match self.reads.push_back(BusRequest::Read) {
            Ok(()) => {
                self.stats.reads_enqueued += 1;
                Ok(())
            }
            Err(_) => {
                self.stats.reads_dropped += 1;
                Err(AgentError::Capacity("read"))
            }
        }
    }

    /// Queues a write. On overflow the request is handed back so the
    /// caller can fail its reply channel.
    pub fn enqueue_write(&mut self, request: BusRequest) -> Result<(), BusRequest> {
        debug_assert!(request.is_write());
        match self.writes.push_back(request) {
            Ok(()) => {
                self.stats.writes_enqueued += 1;
                Ok(())
            }
            Err(rejected) => {
                self.stats.writes_dropped += 1;
                Err(rejected)
            }
        }
    }

    /// Picks the next task for the idle bus: writes before reads.
    pub fn next(&mut self) -> Option<BusRequest> {
        let request = self.writes.pop_front().or_else(|| self.reads.pop_front());
        if request.is_some() {
            self.stats.serviced += 1;
        }
        request
    }

    pub fn has_pending_write(&self) -> bool {
        !self.writes.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    pub fn pending_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }
}
