use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::alarms::AlarmTrigger;
use crate::error::AgentError;
use crate::scheduler::WriteConfirm;

/// Message types exchanged with the supervisory server. The wire uses
/// the server's SCREAMING_SNAKE names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "DEVICE_CONNECT")]
    DeviceConnect,
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "ALARM_TRIGGER")]
    AlarmTrigger,
    #[serde(rename = "ALARM_ACK")]
    AlarmAck,
    #[serde(rename = "REQUEST_SENSOR_DATA")]
    RequestSensorData,
    #[serde(rename = "SENSOR_DATA_RESPONSE")]
    SensorDataResponse,
    #[serde(rename = "UPDATE_DEVICE_SETTINGS")]
    UpdateDeviceSettings,
    #[serde(rename = "DEVICE_SETTINGS_UPDATE_ACK")]
    DeviceSettingsUpdateAck,
    #[serde(rename = "REBOOT_DEVICE")]
    RebootDevice,
    #[serde(rename = "REBOOT_DEVICE_ACK")]
    RebootDeviceAck,
    #[serde(rename = "ERROR")]
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::DeviceConnect => "DEVICE_CONNECT",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::AlarmTrigger => "ALARM_TRIGGER",
            MessageType::AlarmAck => "ALARM_ACK",
            MessageType::RequestSensorData => "REQUEST_SENSOR_DATA",
            MessageType::SensorDataResponse => "SENSOR_DATA_RESPONSE",
            MessageType::UpdateDeviceSettings => "UPDATE_DEVICE_SETTINGS",
            MessageType::DeviceSettingsUpdateAck => "DEVICE_SETTINGS_UPDATE_ACK",
            MessageType::RebootDevice => "REBOOT_DEVICE",
            MessageType::RebootDeviceAck => "REBOOT_DEVICE_ACK",
            MessageType::Error => "ERROR",
        }
    }

    pub fn parse(kind: &str) -> Option<MessageType> {
        match kind {
            "DEVICE_CONNECT" => Some(MessageType::DeviceConnect),
            "PING" => Some(MessageType::Ping),
            "PONG" => Some(MessageType::Pong),
            "ALARM_TRIGGER" => Some(MessageType::AlarmTrigger),
            "ALARM_ACK" => Some(MessageType::AlarmAck),
            "REQUEST_SENSOR_DATA" => Some(MessageType::RequestSensorData),
            "SENSOR_DATA_RESPONSE" => Some(MessageType::SensorDataResponse),
            "UPDATE_DEVICE_SETTINGS" => Some(MessageType::UpdateDeviceSettings),
            "DEVICE_SETTINGS_UPDATE_ACK" => Some(MessageType::DeviceSettingsUpdateAck),
            "REBOOT_DEVICE" => Some(MessageType::RebootDevice),
            "REBOOT_DEVICE_ACK" => Some(MessageType::RebootDeviceAck),
            "ERROR" => Some(MessageType::Error),
            _ => None,
        }
    }
}

/// Identity fields stamped into every outbound message's data object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub model: String,
    pub ip_address: String,
    pub public_ip_address: String,
    pub serial_number: Option<String>,
}

impl DeviceIdentity {
    /// Serial number to put on the wire. Falls back to the public IP
    /// address when the controller has not reported one.
    pub fn effective_serial(&self) -> String {
        match &self.serial_number {
            Some(serial) => serial.clone(),
            None => {
                warn!(
                    fallback = %self.public_ip_address,
                    "serial number unavailable, substituting public ip address"
                );
                self.public_ip_address.clone()
            }
        }
    }
}

/// Raw inbound/outbound message frame: `{"type": ..., "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::parse(&self.kind)
    }

    /// Deserializes the data object into a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, AgentError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| AgentError::Protocol(format!("bad {} payload: {e}", self.kind)))
    }
}

/// Parses one newline-delimited frame off the wire.
pub fn parse_line(line: &str) -> Result<Envelope, AgentError> {
    serde_json::from_str(line).map_err(|e| AgentError::Protocol(format!("malformed frame: {e}")))
}

/// Serializes an outbound message, stamping the identity fields into the
/// data object the way every message to the server carries them.
pub fn encode(
    kind: MessageType,
    identity: &DeviceIdentity,
    extra: Value,
) -> Result<String, AgentError> {
    let mut data = Map::new();
    data.insert("model".into(), json!(identity.model));
    data.insert("ipAddress".into(), json!(identity.ip_address));
    data.insert("publicIpAddress".into(), json!(identity.public_ip_address));
    data.insert("serialNumber".into(), json!(identity.effective_serial()));

    if let Value::Object(fields) = extra {
        data.extend(fields);
    }

    let envelope = json!({ "type": kind.as_str(), "data": Value::Object(data) });
    serde_json::to_string(&envelope)
        .map_err(|e| AgentError::Protocol(format!("encode failed: {e}")))
}

/// ERROR frames carry the failure text alongside the type, not inside a
/// data object.
pub fn encode_error(message: &str) -> String {
    json!({ "type": MessageType::Error.as_str(), "error": message }).to_string()
}

/// Inbound ALARM_ACK payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmAckPayload {
    pub alarm_type: crate::alarms::AlarmId,
    pub timestamp: u64,
}

/// Inbound UPDATE_DEVICE_SETTINGS payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettingsPayload {
    #[serde(default)]
    pub serial_number: Option<String>,
    pub register_address: u16,
    pub new_value: u16,
}

/// Extra fields of an outbound ALARM_TRIGGER.
pub fn alarm_trigger_fields(trigger: &AlarmTrigger) -> Result<Value, AgentError> {
    serde_json::to_value(trigger)
        .map_err(|e| AgentError::Protocol(format!("encode failed: {e}")))
}

/// Extra fields of an outbound SENSOR_DATA_RESPONSE.
pub fn sensor_data_fields(readings: &BTreeMap<String, f64>) -> Value {
    json!({ "data": readings })
}

/// Extra fields of an outbound DEVICE_SETTINGS_UPDATE_ACK.
pub fn settings_ack_fields(confirm: WriteConfirm) -> Value {
    json!({ "registerAddress": confirm.address, "newValue": confirm.value })
}
