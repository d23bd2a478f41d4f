use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::alarms::{run_decode, run_delivery, AlarmPolicy, AlarmRegistry, AlarmTrigger};
use crate::bus::{BusEngine, BusRunner, RegisterBus, RtuBus};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::registers::Snapshot;
use crate::storage::{MemoryStore, SampleStore, StoredSample};
use crate::unix_time_ms;
use crate::uplink::UplinkClient;

const BUS_COMMAND_BUFFER: usize = 16;
const ALARM_OUTBOUND_BUFFER: usize = 32;
const BUS_OPEN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// The running agent: one bus runner, three periodic alarm/persistence
/// activities gated on the first snapshot, and the supervisory uplink.
/// Dropping the handles does not stop the tasks; call [`DryerAgent::shutdown`].
pub struct DryerAgent {
    pub snapshot_rx: watch::Receiver<Option<Snapshot>>,
    pub connected_rx: watch::Receiver<bool>,
    pub registry: Arc<Mutex<AlarmRegistry>>,
    pub store: Arc<MemoryStore>,
    reboot_rx: mpsc::Receiver<()>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DryerAgent {
    /// Opens the serial bus (retrying until it opens) and starts every
    /// task. The production entry point used by the agent binary.
    pub async fn spawn(config: AgentConfig) -> Result<Self, AgentError> {
        let bus = loop {
            match RtuBus::open(&config.bus).await {
                Ok(bus) => break bus,
                Err(e) => {
                    error!(error = %e, "bus open failed, retrying");
                    sleep(BUS_OPEN_RETRY_DELAY).await;
                }
            }
        };
        Ok(Self::spawn_with_bus(config, bus))
    }

    /// Wires channels and spawns every task over an already-open
    /// transport. Tests drive this with an in-process fake bus.
    pub fn spawn_with_bus<B: RegisterBus + 'static>(config: AgentConfig, bus: B) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let (data_ready_tx, data_ready_rx) = watch::channel(false);
        let (bus_cmd_tx, bus_cmd_rx) = mpsc::channel(BUS_COMMAND_BUFFER);
        let (alarm_tx, alarm_rx) = mpsc::channel(ALARM_OUTBOUND_BUFFER);
        let (connected_tx, connected_rx) = watch::channel(false);
        let (reboot_tx, reboot_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let registry = Arc::new(Mutex::new(AlarmRegistry::new(&config.alarms)));
        let store = Arc::new(MemoryStore::default());
        let mut tasks = Vec::new();

        let mut engine = BusEngine::new(config.bus.read_retries, snapshot_tx, data_ready_tx);
        engine.attach(bus);
        let runner = BusRunner::new(engine, bus_cmd_rx, &config.bus, shutdown_rx.clone());
        tasks.push(tokio::spawn(runner.run()));

        tasks.push(tokio::spawn(decode_task(
            config.alarms,
            Arc::clone(&registry),
            snapshot_rx.clone(),
            data_ready_rx.clone(),
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(delivery_task(
            config.alarms,
            Arc::clone(&registry),
            alarm_tx,
            connected_rx.clone(),
            data_ready_rx.clone(),
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(storage_task(
            Arc::clone(&store) as Arc<dyn SampleStore>,
            snapshot_rx.clone(),
            data_ready_rx.clone(),
            shutdown_rx.clone(),
        )));

        let uplink = UplinkClient::new(
            config.uplink.clone(),
            config.device_model.clone(),
            config.host_ip.clone(),
            config.public_ip.clone(),
            snapshot_rx.clone(),
            Arc::clone(&registry),
            bus_cmd_tx,
            alarm_rx,
            connected_tx,
            reboot_tx,
            shutdown_rx.clone(),
        );
        tasks.push(tokio::spawn(uplink_task(uplink, data_ready_rx, shutdown_rx)));

        info!("agent started");
        Self {
            snapshot_rx,
            connected_rx,
            registry,
            store,
            reboot_rx,
            shutdown_tx,
            tasks,
        }
    }

    /// Resolves when the server requests a reboot.
    pub async fn reboot_requested(&mut self) {
        if self.reboot_rx.recv().await.is_none() {
            // Uplink gone; only an explicit shutdown ends the process.
            std::future::pending::<()>().await;
        }
    }

    /// Orderly shutdown: signals every task, then waits for the bus and
    /// uplink to close their handles.
    pub async fn shutdown(self) {
        info!("agent shutting down");
        self.shutdown_tx.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "task ended abnormally during shutdown");
                }
            }
        }
        info!("agent stopped");
    }
}

/// Blocks until the first snapshot exists. Returns false when shutdown
/// wins instead.
async fn wait_for_data(
    ready: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        if *shutdown.borrow() {
            return false;
        }
        if *ready.borrow() {
            return true;
        }
        tokio::select! {
            changed = ready.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

/// Decode cadence: folds the latest snapshot's alarm bits into the
/// registry. Runs independently of the delivery cadence; fusing the two
/// would corrupt retry bookkeeping on every decode tick.
async fn decode_task(
    policy: AlarmPolicy,
    registry: Arc<Mutex<AlarmRegistry>>,
    snapshot_rx: watch::Receiver<Option<Snapshot>>,
    mut ready: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    if !wait_for_data(&mut ready, &mut shutdown).await {
        return;
    }

    let mut ticker = interval(Duration::from_millis(policy.decode_period_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let snapshot = snapshot_rx.borrow().clone();
                if let Some(snapshot) = snapshot {
                    let mut registry = registry.lock().await;
                    run_decode(&mut registry, &snapshot, unix_time_ms());
                }
            }
        }
    }
    info!("alarm decode stopped");
}

/// Delivery cadence: while a session is open, queues due alarm triggers
/// for the uplink. While the link is down the cycle is skipped entirely,
/// so no retries are consumed against a dead connection.
async fn delivery_task(
    policy: AlarmPolicy,
    registry: Arc<Mutex<AlarmRegistry>>,
    alarm_tx: mpsc::Sender<AlarmTrigger>,
    connected_rx: watch::Receiver<bool>,
    mut ready: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    if !wait_for_data(&mut ready, &mut shutdown).await {
        return;
    }

    let mut ticker = interval(Duration::from_millis(policy.delivery_period_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !*connected_rx.borrow() {
                    continue;
                }
                let due = {
                    let mut registry = registry.lock().await;
                    run_delivery(&mut registry, unix_time_ms(), &policy)
                };
                for trigger in due {
                    if alarm_tx.send(trigger).await.is_err() {
                        warn!("uplink gone, alarm trigger dropped");
                        return;
                    }
                }
            }
        }
    }
    info!("alarm delivery stopped");
}

/// Hands every completed snapshot to the persistence collaborator. The
/// store call is synchronous and bounded; nothing here waits on uploads.
async fn storage_task(
    store: Arc<dyn SampleStore>,
    mut snapshot_rx: watch::Receiver<Option<Snapshot>>,
    mut ready: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    if !wait_for_data(&mut ready, &mut shutdown).await {
        return;
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            changed = snapshot_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let sample = snapshot_rx.borrow().as_ref().map(|snapshot| StoredSample {
                    taken_at: snapshot.taken_at,
                    values: snapshot.to_map(),
                });
                if let Some(sample) = sample {
                    store.store(sample);
                }
            }
        }
    }
    info!("sample storage stopped");
}

async fn uplink_task(
    uplink: UplinkClient,
    mut ready: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    // The uplink waits for the first snapshot too: the identity
    // handshake reads the serial number out of it.
    if !wait_for_data(&mut ready, &mut shutdown).await {
        return;
    }
    uplink.run().await;
}
