//! In-process fake of the controller's register bus, shared by the
//! integration tests. Holds a scripted register image and records every
//! bus operation with its (tokio) timestamp.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dryerlink::bus::RegisterBus;
use dryerlink::error::AgentError;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read { start: u16, count: u16 },
    Write { address: u16, value: u16 },
}

#[derive(Debug, Clone, Copy)]
pub struct Op {
    pub kind: OpKind,
    pub at: Instant,
}

impl Op {
    pub fn is_read(&self) -> bool {
        matches!(self.kind, OpKind::Read { .. })
    }

    pub fn is_write(&self) -> bool {
        matches!(self.kind, OpKind::Write { .. })
    }
}

#[derive(Clone, Default)]
pub struct MockBus {
    image: Arc<Mutex<HashMap<u16, u16>>>,
    log: Arc<Mutex<Vec<Op>>>,
    failing_reads: Arc<Mutex<u32>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.image.lock().unwrap().insert(address, value);
    }

    pub fn register(&self, address: u16) -> u16 {
        self.image.lock().unwrap().get(&address).copied().unwrap_or(0)
    }

    /// Makes the next `count` read operations fail with a transport error.
    pub fn fail_reads(&self, count: u32) {
        *self.failing_reads.lock().unwrap() = count;
    }

    pub fn ops(&self) -> Vec<Op> {
        self.log.lock().unwrap().clone()
    }

    pub fn read_count(&self) -> usize {
        self.ops().iter().filter(|op| op.is_read()).count()
    }
}

#[async_trait]
impl RegisterBus for MockBus {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, AgentError> {
        self.log.lock().unwrap().push(Op {
            kind: OpKind::Read { start: address, count },
            at: Instant::now(),
        });

        {
            let mut failing = self.failing_reads.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(AgentError::Connection("injected read fault".into()));
            }
        }

        let image = self.image.lock().unwrap();
        Ok((address..address + count)
            .map(|addr| image.get(&addr).copied().unwrap_or(0))
            .collect())
    }

    async fn write_single_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> Result<(), AgentError> {
        self.log.lock().unwrap().push(Op {
            kind: OpKind::Write { address, value },
            at: Instant::now(),
        });
        self.image.lock().unwrap().insert(address, value);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), AgentError> {
        Ok(())
    }
}
