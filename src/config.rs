use std::env;
use std::time::Duration;

use crate::alarms::AlarmPolicy;

const DEFAULT_SERIAL_PORT: &str = "/dev/ttyS2";
const DEFAULT_SUPERVISOR_ADDR: &str = "127.0.0.1:9550";
const DEFAULT_DEVICE_MODEL: &str = "DM510";

/// Field-bus parameters. The electrical settings are fixed by the
/// controller; the cadence values are reference policy and tunable.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub serial_port: String,
    pub baud_rate: u32,
    pub slave_id: u8,
    pub command_timeout: Duration,
    pub read_period: Duration,
    pub read_retries: u8,
    pub settle_delay: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            serial_port: DEFAULT_SERIAL_PORT.to_string(),
            baud_rate: 19_200,
            slave_id: 1,
            command_timeout: Duration::from_secs(20),
            read_period: Duration::from_secs(1),
            read_retries: 3,
            settle_delay: Duration::from_secs(1),
        }
    }
}

/// Supervisory-connection parameters.
#[derive(Debug, Clone)]
pub struct UplinkConfig {
    pub server_addr: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub pong_deadline: Duration,
    pub reconnect_base_delay: Duration,
    /// Consecutive attempts after which the reconnect delay doubles once
    /// and the attempt counter resets.
    pub backoff_threshold: u32,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SUPERVISOR_ADDR.to_string(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            pong_deadline: Duration::from_secs(15),
            reconnect_base_delay: Duration::from_secs(5),
            backoff_threshold: 5,
        }
    }
}

/// Full agent configuration: bus, uplink, alarm policy and the
/// environment-provided device metadata used in the identity handshake.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub bus: BusConfig,
    pub uplink: UplinkConfig,
    pub alarms: AlarmPolicy,
    pub device_model: String,
    pub host_ip: String,
    pub public_ip: String,
}

impl AgentConfig {
    /// Reads deployment-specific settings from the environment, keeping
    /// defaults for everything unset.
    pub fn from_env() -> Self {
        let mut config = Self {
            device_model: DEFAULT_DEVICE_MODEL.to_string(),
            host_ip: "Unknown".to_string(),
            public_ip: "Unknown".to_string(),
            ..Self::default()
        };

        if let Ok(port) = env::var("SERIAL_PORT") {
            config.bus.serial_port = port;
        }
        if let Ok(addr) = env::var("SUPERVISOR_ADDR") {
            config.uplink.server_addr = addr;
        }
        if let Ok(model) = env::var("DEVICE_MODEL") {
            config.device_model = model;
        }
        if let Ok(ip) = env::var("HOST_IP") {
            config.host_ip = ip;
        }
        if let Ok(ip) = env::var("PUBLIC_IP") {
            config.public_ip = ip;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_policy() {
        let config = AgentConfig::default();
        assert_eq!(config.bus.baud_rate, 19_200);
        assert_eq!(config.bus.slave_id, 1);
        assert_eq!(config.bus.command_timeout, Duration::from_secs(20));
        assert_eq!(config.bus.read_retries, 3);
        assert_eq!(config.uplink.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.uplink.pong_deadline, Duration::from_secs(15));
        assert_eq!(config.uplink.backoff_threshold, 5);
        assert_eq!(config.alarms.max_send_retries, 3);
    }
}
