mod common;

use std::time::Duration;

use common::MockBus;
use dryerlink::agent::DryerAgent;
use dryerlink::alarms::AlarmId;
use dryerlink::config::AgentConfig;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config(server_addr: String) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.device_model = "DM510".to_string();
    config.host_ip = "10.0.0.12".to_string();
    config.public_ip = "203.0.113.9".to_string();
    config.bus.read_period = Duration::from_millis(20);
    config.bus.settle_delay = Duration::from_millis(20);
    config.alarms.decode_period_ms = 50;
    config.alarms.delivery_period_ms = 30;
    config.alarms.resend_interval_ms = 200;
    config.uplink.server_addr = server_addr;
    config.uplink.heartbeat_interval = Duration::from_millis(200);
    config.uplink.pong_deadline = Duration::from_millis(300);
    config.uplink.reconnect_base_delay = Duration::from_millis(50);
    config
}

struct Server {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Server {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let (reader, writer) = stream.into_split();
        Self { lines: BufReader::new(reader).lines(), writer }
    }

    async fn send(&mut self, message: &Value) {
        self.writer
            .write_all(message.to_string().as_bytes())
            .await
            .unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn expect(&mut self, kind: &str) -> Value {
        timeout(WAIT, async {
            loop {
                let line = self.lines.next_line().await.unwrap().expect("session open");
                let message: Value = serde_json::from_str(&line).unwrap();
                if message["type"] == "PING" {
                    self.send(&json!({ "type": "PONG", "data": {} })).await;
                    continue;
                }
                if message["type"] == kind {
                    return message;
                }
            }
        })
        .await
        .expect("expected frame in time")
    }
}

#[tokio::test]
async fn test_agent_end_to_end_against_mock_controller_and_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let mock = MockBus::new();
    mock.set_register(0, 1234);
    mock.set_register(149, 7341);

    let agent = DryerAgent::spawn_with_bus(fast_config(addr), mock.clone());
    let mut server = Server::accept(&listener).await;

    // Identity handshake carries the serial number read off the bus.
    let connect = server.expect("DEVICE_CONNECT").await;
    assert_eq!(connect["data"]["model"], "DM510");
    assert_eq!(connect["data"]["serialNumber"], "7341");

    // Raise the outlet-moisture critical-high bit on the controller; the
    // decode cadence turns it into a trigger on the wire.
    mock.set_register(23, 0b1000_0000);
    let trigger = server.expect("ALARM_TRIGGER").await;
    assert_eq!(trigger["data"]["alarmType"], "outletMoistureAlarm");
    assert_eq!(trigger["data"]["stage"], "CHI");
    let activation = trigger["data"]["timestamp"].as_u64().unwrap();
    assert!(activation > 0);

    // Acknowledge with the trigger's own timestamp.
    server
        .send(&json!({
            "type": "ALARM_ACK",
            "data": { "alarmType": "outletMoistureAlarm", "timestamp": activation }
        }))
        .await;
    timeout(WAIT, async {
        loop {
            {
                let registry = agent.registry.lock().await;
                if registry.get(AlarmId::OutletMoisture).server_ack {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("acknowledgment applied to registry");

    // A remote setpoint write lands on the controller and is confirmed.
    server
        .send(&json!({
            "type": "UPDATE_DEVICE_SETTINGS",
            "data": { "serialNumber": "7341", "registerAddress": 103, "newValue": 1450 }
        }))
        .await;
    let ack = server.expect("DEVICE_SETTINGS_UPDATE_ACK").await;
    assert_eq!(ack["data"]["registerAddress"], 103);
    assert_eq!(ack["data"]["newValue"], 1450);
    assert_eq!(mock.register(103), 1450);

    // Sensor data comes from the latest snapshot.
    server.send(&json!({ "type": "REQUEST_SENSOR_DATA", "data": {} })).await;
    let data = server.expect("SENSOR_DATA_RESPONSE").await;
    assert_eq!(data["data"]["data"]["inletMoisture"], 12.34);

    // Snapshots were persisted along the way.
    assert!(!agent.store.is_empty());

    timeout(WAIT, agent.shutdown()).await.expect("clean shutdown");
}

#[tokio::test]
async fn test_alarm_delivery_waits_for_connection() {
    // No server is listening: the uplink keeps retrying, and alarm
    // delivery consumes no retries while the link is down.
    let mock = MockBus::new();
    mock.set_register(23, 0b1000_0000);

    // Grab a free port and close it again so connects are refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let config = fast_config(dead_addr);
    let resend_ms = config.alarms.resend_interval_ms;
    let agent = DryerAgent::spawn_with_bus(config, mock);

    tokio::time::sleep(Duration::from_millis(4 * resend_ms)).await;

    {
        let registry = agent.registry.lock().await;
        let entity = registry.get(AlarmId::OutletMoisture);
        assert!(entity.active, "alarm decoded while offline");
        assert_eq!(entity.sent_retries, 0, "no delivery attempts while offline");
        assert!(!entity.auto_ack);
    }

    timeout(WAIT, agent.shutdown()).await.expect("clean shutdown");
}
