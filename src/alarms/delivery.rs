use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{AlarmId, AlarmPolicy, AlarmRegistry, AlarmStage};

/// Outbound alarm notification, sent as an ALARM_TRIGGER message. The
/// timestamp is the alarm's current activation time and doubles as the
/// acknowledgment correlation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmTrigger {
    #[serde(rename = "alarmType")]
    pub alarm: AlarmId,
    pub stage: Option<AlarmStage>,
    pub timestamp: u64,
}

/// One delivery cycle over the registry. Returns the triggers that are
/// due; the caller sends them while a session is open and must not call
/// this at all while the uplink is down (delivery is paused entirely,
/// retry counts included).
///
/// Per alarm: a reactivation edge (inactive since the last cycle, active
/// now) resets the acknowledgment bookkeeping. An active, unacknowledged
/// alarm is sent when no attempt has been made yet or the resend interval
/// has elapsed; after `max_send_retries` unanswered sends the alarm is
/// auto-acknowledged and goes quiet until it deactivates and reactivates.
pub fn run_delivery(registry: &mut AlarmRegistry, now: u64, policy: &AlarmPolicy) -> Vec<AlarmTrigger> {
    let mut due = Vec::new();

    for (id, entity) in registry.iter_mut() {
        if entity.active && entity.was_previously_inactive {
            entity.server_ack = false;
            entity.auto_ack = false;
            entity.sent_retries = 0;
            entity.was_previously_inactive = false;
        }

        if !entity.active {
            entity.was_previously_inactive = true;
            continue;
        }

        if entity.server_ack || entity.auto_ack {
            continue;
        }

        let since_last_send = now.saturating_sub(entity.last_sent_to_server);
        if entity.sent_retries == 0 || since_last_send > policy.resend_interval_ms {
            if entity.sent_retries < policy.max_send_retries {
                due.push(AlarmTrigger {
                    alarm: id,
                    stage: entity.stage,
                    timestamp: entity.last_active,
                });
                entity.last_sent_to_server = now;
                entity.sent_retries += 1;
                info!(
                    alarm = id.as_str(),
                    attempt = entity.sent_retries,
                    "alarm trigger queued for server"
                );
            } else {
                entity.auto_ack = true;
                entity.sent_retries = 0;
                info!(
                    alarm = id.as_str(),
                    "alarm auto-acknowledged after exhausting delivery retries"
                );
            }
        }
    }

    due
}

/// Result of applying an inbound ALARM_ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Timestamp matched the current activation; `server_ack` is now set.
    Applied,
    /// The alarm has reactivated since this acknowledgment was produced.
    StaleTimestamp,
}

/// Applies a server acknowledgment. The acknowledgment only counts when
/// its timestamp matches the alarm's current activation time; anything
/// else refers to an earlier activation and is ignored.
pub fn apply_ack(registry: &mut AlarmRegistry, alarm: AlarmId, timestamp: u64) -> AckOutcome {
    let entity = registry.get_mut(alarm);

    if entity.last_active == timestamp {
        entity.server_ack = true;
        info!(alarm = alarm.as_str(), "server acknowledgment applied");
        AckOutcome::Applied
    } else {
        warn!(
            alarm = alarm.as_str(),
            acked = timestamp,
            current = entity.last_active,
            "stale acknowledgment ignored"
        );
        AckOutcome::StaleTimestamp
    }
}
