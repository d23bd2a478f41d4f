pub mod decode;
pub mod delivery;

pub use decode::run_decode;
pub use delivery::{apply_ack, run_delivery, AckOutcome, AlarmTrigger};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Stable identifier of each monitored alarm condition. The wire names
/// match the supervisory server's alarm keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlarmId {
    #[serde(rename = "inletMoistureAlarm")]
    InletMoisture,
    #[serde(rename = "outletMoistureAlarm")]
    OutletMoisture,
    #[serde(rename = "inletTemperatureAlarm")]
    InletTemperature,
    #[serde(rename = "outletTemperatureAlarm")]
    OutletTemperature,
    #[serde(rename = "burnerTemperatureAlarm")]
    BurnerTemperature,
    #[serde(rename = "dischargeRateAlarm")]
    DischargeRate,
}

impl AlarmId {
    pub const ALL: [AlarmId; 6] = [
        AlarmId::InletMoisture,
        AlarmId::OutletMoisture,
        AlarmId::InletTemperature,
        AlarmId::OutletTemperature,
        AlarmId::BurnerTemperature,
        AlarmId::DischargeRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmId::InletMoisture => "inletMoistureAlarm",
            AlarmId::OutletMoisture => "outletMoistureAlarm",
            AlarmId::InletTemperature => "inletTemperatureAlarm",
            AlarmId::OutletTemperature => "outletTemperatureAlarm",
            AlarmId::BurnerTemperature => "burnerTemperatureAlarm",
            AlarmId::DischargeRate => "dischargeRateAlarm",
        }
    }
}

/// Severity/category token decoded from a status-register bit position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmStage {
    /// Critical high.
    #[serde(rename = "CHI")]
    Chi,
    /// Critical low.
    #[serde(rename = "CLO")]
    Clo,
    /// Warning high.
    #[serde(rename = "WHI")]
    Whi,
    /// Warning low.
    #[serde(rename = "WLO")]
    Wlo,
    /// Burner-off condition on the combined discharge/burner register.
    #[serde(rename = "DryerOff")]
    DryerOff,
}

/// Reference timing/retry policy for decode and delivery. All values are
/// configuration, not invariants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AlarmPolicy {
    pub decode_period_ms: u64,
    pub delivery_period_ms: u64,
    pub resend_interval_ms: u64,
    pub max_send_retries: u8,
    pub debounce_ms: u64,
}

impl Default for AlarmPolicy {
    fn default() -> Self {
        Self {
            decode_period_ms: 3_000,
            delivery_period_ms: 1_000,
            resend_interval_ms: 5_000,
            max_send_retries: 3,
            debounce_ms: 5_000,
        }
    }
}

/// Live state of one alarm. Created once at process start and mutated on
/// every decode cycle (activity) and delivery cycle (send bookkeeping);
/// never destroyed while the process runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmEntity {
    pub active: bool,
    pub stage: Option<AlarmStage>,
    pub last_active: u64,
    pub last_deactivated: u64,
    pub last_checked: u64,
    pub last_sent_to_server: u64,
    pub debounce_ms: u64,
    pub sent_retries: u8,
    pub server_ack: bool,
    pub auto_ack: bool,
    pub was_previously_inactive: bool,
}

impl AlarmEntity {
    pub fn new(debounce_ms: u64) -> Self {
        Self {
            active: false,
            stage: None,
            last_active: 0,
            last_deactivated: 0,
            last_checked: 0,
            last_sent_to_server: 0,
            debounce_ms,
            sent_retries: 0,
            server_ack: false,
            auto_ack: false,
            was_previously_inactive: true,
        }
    }

    /// Delivery-perspective state of this activation.
    pub fn delivery_state(&self) -> DeliveryState {
        if !self.active {
            DeliveryState::Inactive
        } else if self.server_ack {
            DeliveryState::ActiveAcked
        } else if self.auto_ack {
            DeliveryState::ActiveAutoAcked
        } else {
            DeliveryState::ActivePending
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Inactive,
    ActivePending,
    ActiveAcked,
    ActiveAutoAcked,
}

/// The process-wide alarm table. Explicitly owned and passed to the
/// decode and delivery routines; callers put it behind a single
/// synchronization boundary so decode, delivery and acknowledgment
/// never race on an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmRegistry {
    entries: BTreeMap<AlarmId, AlarmEntity>,
}

impl AlarmRegistry {
    pub fn new(policy: &AlarmPolicy) -> Self {
        let entries = AlarmId::ALL
            .iter()
            .map(|id| (*id, AlarmEntity::new(policy.debounce_ms)))
            .collect();
        Self { entries }
    }

    pub fn get(&self, id: AlarmId) -> &AlarmEntity {
        &self.entries[&id]
    }

    pub fn get_mut(&mut self, id: AlarmId) -> &mut AlarmEntity {
        self.entries.get_mut(&id).expect("registry holds every alarm id")
    }

    pub fn iter(&self) -> impl Iterator<Item = (AlarmId, &AlarmEntity)> {
        self.entries.iter().map(|(id, entity)| (*id, entity))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (AlarmId, &mut AlarmEntity)> {
        self.entries.iter_mut().map(|(id, entity)| (*id, entity))
    }

    pub fn active_count(&self) -> usize {
        self.entries.values().filter(|entity| entity.active).count()
    }
}

impl Default for AlarmRegistry {
    fn default() -> Self {
        Self::new(&AlarmPolicy::default())
    }
}
