use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alarms::{apply_ack, AlarmRegistry, AlarmTrigger};
use crate::bus::BusCommand;
use crate::config::UplinkConfig;
use crate::error::AgentError;
use crate::protocol::{
    alarm_trigger_fields, encode, encode_error, parse_line, sensor_data_fields,
    settings_ack_fields, AlarmAckPayload, DeviceIdentity, Envelope, MessageType,
    UpdateSettingsPayload,
};
use crate::registers::Snapshot;

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Reconnect delay policy: the base delay for up to `threshold`
/// consecutive attempts, then one doubled delay after which the counter
/// starts over. Bounded by construction, never unbounded exponential
/// growth.
#[derive(Debug)]
pub struct Backoff {
    attempts: u32,
    base: Duration,
    threshold: u32,
}

impl Backoff {
    pub fn new(base: Duration, threshold: u32) -> Self {
        Self { attempts: 0, base, threshold }
    }

    /// Successful connection: the attempt counter starts over.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Registers one failed/closed session and yields the delay before
    /// the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        if self.attempts > self.threshold {
            self.attempts = 0;
            self.base * 2
        } else {
            self.base
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Why a session ended. Every variant leads to exactly one scheduled
/// reconnect; `Shutdown` leaves the loop instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Server closed the stream.
    Closed,
    /// Transport error on read or write.
    TransportError,
    /// No PONG arrived within the response deadline.
    HeartbeatTimeout,
    /// Agent is shutting down.
    Shutdown,
}

/// Maintains exactly one logical connection to the supervisory server:
/// connect with an establishment timeout, identity handshake, heartbeat
/// liveness, inbound command dispatch, and reconnect with backoff. A new
/// session only starts after the previous one is fully torn down.
pub struct UplinkClient {
    config: UplinkConfig,
    device_model: String,
    host_ip: String,
    public_ip: String,
    snapshot_rx: watch::Receiver<Option<Snapshot>>,
    registry: Arc<Mutex<AlarmRegistry>>,
    bus_commands: mpsc::Sender<BusCommand>,
    alarm_rx: mpsc::Receiver<AlarmTrigger>,
    connected_tx: watch::Sender<bool>,
    reboot_tx: mpsc::Sender<()>,
    shutdown: watch::Receiver<bool>,
}

impl UplinkClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: UplinkConfig,
        device_model: String,
        host_ip: String,
        public_ip: String,
        snapshot_rx: watch::Receiver<Option<Snapshot>>,
        registry: Arc<Mutex<AlarmRegistry>>,
        bus_commands: mpsc::Sender<BusCommand>,
        alarm_rx: mpsc::Receiver<AlarmTrigger>,
        connected_tx: watch::Sender<bool>,
        reboot_tx: mpsc::Sender<()>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            device_model,
            host_ip,
            public_ip,
            snapshot_rx,
            registry,
            bus_commands,
            alarm_rx,
            connected_tx,
            reboot_tx,
            shutdown,
        }
    }

    /// Identity for the current session, with the serial number taken
    /// from the most recent register snapshot.
    fn current_identity(&self) -> DeviceIdentity {
        let serial_number = self
            .snapshot_rx
            .borrow()
            .as_ref()
            .and_then(Snapshot::serial_number);
        DeviceIdentity {
            model: self.device_model.clone(),
            ip_address: self.host_ip.clone(),
            public_ip_address: self.public_ip.clone(),
            serial_number,
        }
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn run(mut self) {
        let mut backoff = Backoff::new(
            self.config.reconnect_base_delay,
            self.config.backoff_threshold,
        );

        loop {
            if self.shutting_down() {
                break;
            }

            let addr = self.config.server_addr.clone();
            info!(%addr, "connecting to supervisory server");

            match timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => {
                    backoff.reset();
                    let end = self.run_session(stream).await;
                    info!(reason = ?end, "session ended");
                    if end == SessionEnd::Shutdown {
                        break;
                    }
                }
                Ok(Err(e)) => error!(error = %e, "connection attempt failed"),
                Err(_) => error!("connection attempt timed out"),
            }

            if self.shutting_down() {
                break;
            }

            // At most one reconnect is ever pending: this loop is the
            // only place a reconnect is scheduled.
            let delay = backoff.next_delay();
            info!(delay_s = delay.as_secs(), "reconnect scheduled");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.changed() => {}
            }
        }

        self.connected_tx.send_replace(false);
        info!("uplink stopped");
    }

    async fn run_session(&mut self, stream: TcpStream) -> SessionEnd {
        let (reader, writer) = stream.into_split();
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        let mut lines = BufReader::new(reader).lines();
        let mut command_tasks: Vec<JoinHandle<()>> = Vec::new();

        let identity = self.current_identity();
        let handshake = match encode(MessageType::DeviceConnect, &identity, json!({})) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "failed to build handshake");
                return SessionEnd::TransportError;
            }
        };
        if send_line(&writer, &handshake).await.is_err() {
            return SessionEnd::TransportError;
        }
        info!("supervisory session established");
        self.connected_tx.send_replace(true);

        let mut heartbeat = interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Single response deadline, re-armed on each unanswered probe and
        // disarmed by the matching PONG so a stale timer never fires into
        // the next session.
        let pong_deadline = sleep(Duration::from_secs(0));
        tokio::pin!(pong_deadline);
        let mut pong_armed = false;

        let end = loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break SessionEnd::Shutdown;
                    }
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let envelope = match parse_line(&line) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!(error = %e, "dropping malformed frame");
                                let _ = send_line(&writer, &encode_error(&e.to_string())).await;
                                continue;
                            }
                        };
                        if envelope.message_type() == Some(MessageType::Pong) {
                            debug!("heartbeat reply received");
                            pong_armed = false;
                            continue;
                        }
                        if let Err(e) = self.dispatch(&writer, envelope, &mut command_tasks).await {
                            error!(error = %e, "error handling inbound message");
                            let _ = send_line(&writer, &encode_error(&e.to_string())).await;
                            if e.is_fatal_to_session() {
                                break SessionEnd::TransportError;
                            }
                        }
                    }
                    Ok(None) => break SessionEnd::Closed,
                    Err(e) => {
                        error!(error = %e, "session read failed");
                        break SessionEnd::TransportError;
                    }
                },
                _ = heartbeat.tick() => {
                    let frame = match encode(MessageType::Ping, &self.current_identity(), json!({})) {
                        Ok(frame) => frame,
                        Err(e) => {
                            error!(error = %e, "failed to build heartbeat probe");
                            break SessionEnd::TransportError;
                        }
                    };
                    if send_line(&writer, &frame).await.is_err() {
                        break SessionEnd::TransportError;
                    }
                    debug!("heartbeat probe sent");
                    if !pong_armed {
                        pong_deadline
                            .as_mut()
                            .reset(Instant::now() + self.config.pong_deadline);
                        pong_armed = true;
                    }
                }
                _ = pong_deadline.as_mut(), if pong_armed => {
                    error!("no heartbeat reply within deadline, terminating session");
                    break SessionEnd::HeartbeatTimeout;
                }
                trigger = self.alarm_rx.recv() => match trigger {
                    Some(trigger) => {
                        if self.send_alarm(&writer, &trigger).await.is_err() {
                            break SessionEnd::TransportError;
                        }
                    }
                    None => break SessionEnd::Shutdown,
                },
            }
        };

        // Teardown: mark the link down and cancel in-flight command
        // handlers so nothing from this session leaks into the next.
        self.connected_tx.send_replace(false);
        for task in command_tasks {
            task.abort();
        }
        end
    }

    async fn send_alarm(
        &self,
        writer: &SharedWriter,
        trigger: &AlarmTrigger,
    ) -> Result<(), AgentError> {
        let frame = encode(
            MessageType::AlarmTrigger,
            &self.current_identity(),
            alarm_trigger_fields(trigger)?,
        )?;
        send_line(writer, &frame).await?;
        info!(alarm = trigger.alarm.as_str(), "alarm trigger sent");
        Ok(())
    }

    async fn dispatch(
        &mut self,
        writer: &SharedWriter,
        envelope: Envelope,
        command_tasks: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), AgentError> {
        let Some(kind) = envelope.message_type() else {
            warn!(kind = %envelope.kind, "unknown message type dropped");
            return Ok(());
        };

        match kind {
            MessageType::Ping => {
                let frame = encode(MessageType::Pong, &self.current_identity(), json!({}))?;
                send_line(writer, &frame).await
            }
            MessageType::AlarmAck => {
                let payload: AlarmAckPayload = envelope.payload()?;
                let mut registry = self.registry.lock().await;
                apply_ack(&mut registry, payload.alarm_type, payload.timestamp);
                Ok(())
            }
            MessageType::RequestSensorData => {
                let snapshot = self.snapshot_rx.borrow().clone();
                let snapshot = snapshot.ok_or_else(|| {
                    AgentError::Protocol("no register snapshot available yet".into())
                })?;
                let frame = encode(
                    MessageType::SensorDataResponse,
                    &self.current_identity(),
                    sensor_data_fields(&snapshot.to_map()),
                )?;
                send_line(writer, &frame).await
            }
            MessageType::UpdateDeviceSettings => {
                let payload: UpdateSettingsPayload = envelope.payload()?;
                command_tasks.push(self.spawn_settings_update(writer, payload));
                Ok(())
            }
            MessageType::RebootDevice => {
                let frame = encode(MessageType::RebootDeviceAck, &self.current_identity(), json!({}))?;
                send_line(writer, &frame).await?;
                warn!("reboot requested by server");
                let _ = self.reboot_tx.try_send(());
                Ok(())
            }
            other => {
                warn!(kind = other.as_str(), "unexpected message type dropped");
                Ok(())
            }
        }
    }

    /// Register writes can occupy the bus for up to the command timeout,
    /// so they run off the session loop; heartbeats keep flowing while
    /// the write is in flight.
    fn spawn_settings_update(
        &self,
        writer: &SharedWriter,
        payload: UpdateSettingsPayload,
    ) -> JoinHandle<()> {
        let writer = Arc::clone(writer);
        let identity = self.current_identity();
        let bus_commands = self.bus_commands.clone();

        tokio::spawn(async move {
            let (reply, confirm_rx) = oneshot::channel();
            let command = BusCommand::Write {
                address: payload.register_address,
                value: payload.new_value,
                reply,
            };
            if bus_commands.send(command).await.is_err() {
                let _ = send_line(&writer, &encode_error("bus unavailable")).await;
                return;
            }

            match confirm_rx.await {
                Ok(Ok(confirm)) => {
                    match encode(
                        MessageType::DeviceSettingsUpdateAck,
                        &identity,
                        settings_ack_fields(confirm),
                    ) {
                        Ok(frame) => {
                            if send_line(&writer, &frame).await.is_err() {
                                warn!("settings ack lost with session");
                            }
                        }
                        Err(e) => error!(error = %e, "failed to encode settings ack"),
                    }
                }
                Ok(Err(e)) => {
                    error!(error = %e, "register write rejected");
                    let _ = send_line(&writer, &encode_error(&e.to_string())).await;
                }
                Err(_) => {
                    let _ = send_line(&writer, &encode_error("write confirmation lost")).await;
                }
            }
        })
    }
}

async fn send_line(writer: &SharedWriter, line: &str) -> Result<(), AgentError> {
    let mut guard = writer.lock().await;
    guard.write_all(line.as_bytes()).await?;
    guard.write_all(b"\n").await?;
    Ok(())
}
