use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_serial::SerialStream;
use tracing::{debug, error, info, warn};

use crate::config::BusConfig;
use crate::error::AgentError;
use crate::registers::{apply_block, read_blocks, Block, Snapshot, REGISTER_MAP};
use crate::scheduler::{BusRequest, BusScheduler, WriteConfirm};
use crate::unix_time_ms;

/// Transport seam for the half-duplex field bus. The production
/// implementation wraps a Modbus RTU context; tests substitute a fake
/// with a scripted register image.
#[async_trait]
pub trait RegisterBus: Send {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, AgentError>;

    async fn write_single_register(&mut self, address: u16, value: u16)
        -> Result<(), AgentError>;

    async fn close(&mut self) -> Result<(), AgentError>;
}

/// Modbus RTU transport over the configured serial port.
pub struct RtuBus {
    ctx: tokio_modbus::client::Context,
    command_timeout: Duration,
}

impl RtuBus {
    /// Opens the serial channel at the controller's fixed bus parameters.
    /// Failure must be retried by the caller; the engine does not
    /// self-reconnect during active reads.
    pub async fn open(config: &BusConfig) -> Result<Self, AgentError> {
        let builder = tokio_serial::new(config.serial_port.as_str(), config.baud_rate)
            .parity(tokio_serial::Parity::None)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One);

        let port = SerialStream::open(&builder)
            .map_err(|e| AgentError::Connection(format!("{}: {e}", config.serial_port)))?;

        let ctx = tokio_modbus::client::rtu::attach_slave(
            port,
            tokio_modbus::slave::Slave(config.slave_id),
        );

        info!(port = %config.serial_port, baud = config.baud_rate, "bus connected");
        Ok(Self { ctx, command_timeout: config.command_timeout })
    }
}

#[async_trait]
impl RegisterBus for RtuBus {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, AgentError> {
        use tokio_modbus::client::Reader;

        let response = timeout(
            self.command_timeout,
            self.ctx.read_holding_registers(address, count),
        )
        .await
        .map_err(|_| AgentError::Timeout(format!("read of {count} registers at {address}")))?
        .map_err(|e| AgentError::Connection(e.to_string()))?
        .map_err(|e| AgentError::Protocol(format!("bus exception reading {address}: {e:?}")))?;

        Ok(response)
    }

    async fn write_single_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> Result<(), AgentError> {
        use tokio_modbus::client::Writer;

        timeout(
            self.command_timeout,
            self.ctx.write_single_register(address, value),
        )
        .await
        .map_err(|_| AgentError::Timeout(format!("write to register {address}")))?
        .map_err(|e| AgentError::Write { address, reason: e.to_string() })?
        .map_err(|e| AgentError::Write { address, reason: format!("bus exception: {e:?}") })?;

        Ok(())
    }

    async fn close(&mut self) -> Result<(), AgentError> {
        use tokio_modbus::client::Client;

        self.ctx
            .disconnect()
            .await
            .map_err(|e| AgentError::Connection(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub completed_cycles: u32,
    pub failed_cycles: u32,
    pub writes_confirmed: u32,
}

/// Owns the single bus connection and produces a fresh register
/// snapshot per read cycle. Only this engine writes the snapshot; every
/// other component reads the most recently completed one through the
/// watch channel.
pub struct BusEngine<B: RegisterBus> {
    bus: Option<B>,
    blocks: Vec<Block>,
    read_retries: u8,
    snapshot_tx: watch::Sender<Option<Snapshot>>,
    data_ready_tx: watch::Sender<bool>,
    data_ready_fired: bool,
    stats: EngineStats,
}

impl<B: RegisterBus> BusEngine<B> {
    pub fn new(
        read_retries: u8,
        snapshot_tx: watch::Sender<Option<Snapshot>>,
        data_ready_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            bus: None,
            blocks: read_blocks(REGISTER_MAP),
            read_retries,
            snapshot_tx,
            data_ready_tx,
            data_ready_fired: false,
            stats: EngineStats::default(),
        }
    }

    /// Attaches an opened transport. Attaching while already connected
    /// is a no-op that logs and keeps the existing connection.
    pub fn attach(&mut self, bus: B) {
        if self.bus.is_some() {
            info!("bus already connected");
            return;
        }
        self.bus = Some(bus);
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_some()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    fn bus_mut(&mut self) -> Result<&mut B, AgentError> {
        self.bus
            .as_mut()
            .ok_or_else(|| AgentError::Connection("bus not connected".into()))
    }

    /// One read cycle: one bus read per contiguous block, assembled into
    /// a new snapshot only if every block succeeds. Any block failure
    /// retries the whole cycle, back to back, up to the retry bound;
    /// after that the cycle is abandoned and the previous snapshot
    /// stays in place.
    pub async fn read_cycle(&mut self, now: u64) -> Result<(), AgentError> {
        let mut last_error = AgentError::Connection("no read attempted".into());

        for attempt in 1..=self.read_retries {
            match self.read_all_blocks(now).await {
                Ok(snapshot) => {
                    self.stats.completed_cycles += 1;
                    self.snapshot_tx.send_replace(Some(snapshot));
                    // Fires at most once per process lifetime; downstream
                    // work (alarms, uplink, persistence) starts on it.
                    if !self.data_ready_fired {
                        self.data_ready_fired = true;
                        info!("first full register snapshot assembled");
                        self.data_ready_tx.send_replace(true);
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "register read attempt failed");
                    last_error = e;
                }
            }
        }

        self.stats.failed_cycles += 1;
        Err(last_error)
    }

    async fn read_all_blocks(&mut self, now: u64) -> Result<Snapshot, AgentError> {
        let bus = self
            .bus
            .as_mut()
            .ok_or_else(|| AgentError::Connection("bus not connected".into()))?;
        let mut snapshot = Snapshot::new(now);

        for &block in &self.blocks {
            let words = bus.read_holding_registers(block.start, block.count).await?;
            if words.len() < block.count as usize {
                return Err(AgentError::Protocol(format!(
                    "short read at {}: {} of {} words",
                    block.start,
                    words.len(),
                    block.count
                )));
            }
            apply_block(&mut snapshot, block, &words);
        }

        Ok(snapshot)
    }

    /// Writes one register and confirms the address/value pair. Never
    /// retried here; a failed write propagates to the originator.
    pub async fn write_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> Result<WriteConfirm, AgentError> {
        self.bus_mut()?.write_single_register(address, value).await?;
        self.stats.writes_confirmed += 1;
        info!(address, value, "register write confirmed");
        Ok(WriteConfirm { address, value })
    }

    /// Releases the bus handle. Safe to call when already closed.
    pub async fn close(&mut self) -> Result<(), AgentError> {
        match self.bus.take() {
            Some(mut bus) => {
                bus.close().await?;
                info!("bus connection closed");
                Ok(())
            }
            None => {
                warn!("bus was already closed");
                Ok(())
            }
        }
    }
}

/// Command surface other tasks use to reach the bus.
#[derive(Debug)]
pub enum BusCommand {
    Write {
        address: u16,
        value: u16,
        reply: oneshot::Sender<Result<WriteConfirm, AgentError>>,
    },
}

/// Drives the engine: multiplexes the periodic read cadence and inbound
/// write commands through the scheduler so exactly one bus operation is
/// ever in flight. Writes pause the read cadence and reads resume after
/// the settle delay, keeping the half-duplex line quiet around a write.
pub struct BusRunner<B: RegisterBus> {
    engine: BusEngine<B>,
    scheduler: BusScheduler,
    commands: mpsc::Receiver<BusCommand>,
    read_period: Duration,
    settle_delay: Duration,
    resume_reads_at: Option<Instant>,
    shutdown: watch::Receiver<bool>,
}

impl<B: RegisterBus> BusRunner<B> {
    pub fn new(
        engine: BusEngine<B>,
        commands: mpsc::Receiver<BusCommand>,
        config: &BusConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            engine,
            scheduler: BusScheduler::new(),
            commands,
            read_period: config.read_period,
            settle_delay: config.settle_delay,
            resume_reads_at: None,
            shutdown,
        }
    }

    fn reads_allowed(&self) -> bool {
        match self.resume_reads_at {
            Some(at) => Instant::now() >= at,
            None => true,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.read_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(BusCommand::Write { address, value, reply }) => {
                        let request = BusRequest::Write { address, value, reply };
                        if let Err(BusRequest::Write { address, reply, .. }) =
                            self.scheduler.enqueue_write(request)
                        {
                            warn!(address, "write queue full, rejecting command");
                            let _ = reply.send(Err(AgentError::Capacity("write")));
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    // Pending writes take the bus first; reads stay
                    // paused through the post-write settle window.
                    if self.reads_allowed() && !self.scheduler.has_pending_write() {
                        if let Err(e) = self.scheduler.enqueue_read() {
                            warn!(error = %e, "read cycle dropped");
                        }
                    }
                }
            }

            // Pull any burst of queued commands into the scheduler so
            // capacity limits apply before the bus goes busy again.
            while let Ok(BusCommand::Write { address, value, reply }) = self.commands.try_recv() {
                let request = BusRequest::Write { address, value, reply };
                if let Err(BusRequest::Write { address, reply, .. }) =
                    self.scheduler.enqueue_write(request)
                {
                    warn!(address, "write queue full, rejecting command");
                    let _ = reply.send(Err(AgentError::Capacity("write")));
                }
            }

            self.drain().await;
        }

        if let Err(e) = self.engine.close().await {
            warn!(error = %e, "error closing bus on shutdown");
        }
        info!("bus runner stopped");
    }

    /// Services queued requests one at a time until the bus goes idle.
    async fn drain(&mut self) {
        while let Some(request) = self.scheduler.next() {
            match request {
                BusRequest::Read => {
                    if !self.reads_allowed() {
                        debug!("read cycle skipped inside settle window");
                        continue;
                    }
                    if let Err(e) = self.engine.read_cycle(unix_time_ms()).await {
                        error!(error = %e, "read cycle abandoned, keeping previous snapshot");
                    }
                }
                BusRequest::Write { address, value, reply } => {
                    let result = self.engine.write_register(address, value).await;
                    self.resume_reads_at = Some(Instant::now() + self.settle_delay);
                    if let Err(e) = &result {
                        error!(address, error = %e, "register write failed");
                    }
                    if reply.send(result).is_err() {
                        warn!(address, "write originator dropped before confirmation");
                    }
                }
            }
        }
    }
}
