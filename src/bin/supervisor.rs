//! Mock supervisory server for bench testing the agent: accepts device
//! connections, answers heartbeats, acknowledges alarm triggers and can
//! poll sensor data. Not a production component.

use clap::{App, Arg};
use colored::*;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("dryerlink-supervisor")
        .version("0.1.0")
        .about("🖥️  Mock supervisory server for dryerlink bench testing")
        .arg(
            Arg::with_name("listen")
                .short("l")
                .long("listen")
                .value_name("HOST:PORT")
                .help("Listen address")
                .takes_value(true)
                .default_value("127.0.0.1:9550"),
        )
        .arg(
            Arg::with_name("poll")
                .long("poll")
                .value_name("SECONDS")
                .help("Request sensor data every N seconds")
                .takes_value(true),
        )
        .get_matches();

    let listen = matches.value_of("listen").unwrap_or("127.0.0.1:9550");
    let poll_secs: Option<u64> = matches.value_of("poll").and_then(|v| v.parse().ok());

    let listener = TcpListener::bind(listen).await?;
    println!("{}", "🖥️  Dryerlink mock supervisor".bright_blue().bold());
    println!("{} {}", "Listening on".dimmed(), listen);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!(%addr, "device connected");
                tokio::spawn(async move {
                    if let Err(e) = handle_device(stream, poll_secs).await {
                        warn!(%addr, error = %e, "device session error");
                    }
                    info!(%addr, "device disconnected");
                });
            }
            Err(e) => error!(error = %e, "accept failed"),
        }
    }
}

async fn handle_device(
    stream: TcpStream,
    poll_secs: Option<u64>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let mut poll = poll_secs.map(|secs| time::interval(Duration::from_secs(secs)));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let message: Value = match serde_json::from_str(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "unparseable frame from device");
                        continue;
                    }
                };

                match message["type"].as_str() {
                    Some("DEVICE_CONNECT") => {
                        println!(
                            "{} model={} serial={}",
                            "✅ DEVICE_CONNECT".green(),
                            message["data"]["model"].as_str().unwrap_or("?"),
                            message["data"]["serialNumber"].as_str().unwrap_or("?"),
                        );
                    }
                    Some("PING") => {
                        send(&mut writer, &json!({ "type": "PONG", "data": {} })).await?;
                    }
                    Some("ALARM_TRIGGER") => {
                        let alarm = &message["data"];
                        println!(
                            "{} {} stage={} ts={}",
                            "🚨 ALARM".red().bold(),
                            alarm["alarmType"].as_str().unwrap_or("?"),
                            alarm["stage"].as_str().unwrap_or("?"),
                            alarm["timestamp"],
                        );
                        // Acknowledge with the trigger's own timestamp.
                        send(&mut writer, &json!({
                            "type": "ALARM_ACK",
                            "data": {
                                "alarmType": alarm["alarmType"],
                                "timestamp": alarm["timestamp"],
                            }
                        })).await?;
                    }
                    Some("SENSOR_DATA_RESPONSE") => {
                        println!("{} {}", "📊 SENSOR_DATA".bright_blue(), message["data"]["data"]);
                    }
                    Some("DEVICE_SETTINGS_UPDATE_ACK") => {
                        println!(
                            "{} register={} value={}",
                            "✅ SETTINGS_ACK".green(),
                            message["data"]["registerAddress"],
                            message["data"]["newValue"],
                        );
                    }
                    Some("ERROR") => {
                        println!("{} {}", "❌ DEVICE ERROR".red(), message["error"]);
                    }
                    Some(other) => info!(kind = other, "message from device"),
                    None => warn!("frame without a type field"),
                }
            }
            _ = async { poll.as_mut().unwrap().tick().await }, if poll.is_some() => {
                send(&mut writer, &json!({ "type": "REQUEST_SENSOR_DATA", "data": {} })).await?;
            }
        }
    }

    Ok(())
}

async fn send(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    message: &Value,
) -> std::io::Result<()> {
    writer.write_all(message.to_string().as_bytes()).await?;
    writer.write_all(b"\n").await
}
