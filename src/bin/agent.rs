use clap::{App, Arg};
use colored::*;
use dryerlink::agent::DryerAgent;
use dryerlink::config::AgentConfig;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("dryerlink-agent")
        .version("0.1.0")
        .author("Dryer Controls Engineering Team")
        .about("🌾 On-device agent for DM510 dryer controllers")
        .arg(
            Arg::with_name("serial-port")
                .short("s")
                .long("serial-port")
                .value_name("DEVICE")
                .help("Serial device of the controller bus")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("server")
                .long("server")
                .value_name("HOST:PORT")
                .help("Supervisory server address")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("model")
                .long("model")
                .value_name("MODEL")
                .help("Device model reported in the identity handshake")
                .takes_value(true),
        )
        .get_matches();

    let mut config = AgentConfig::from_env();
    if let Some(port) = matches.value_of("serial-port") {
        config.bus.serial_port = port.to_string();
    }
    if let Some(server) = matches.value_of("server") {
        config.uplink.server_addr = server.to_string();
    }
    if let Some(model) = matches.value_of("model") {
        config.device_model = model.to_string();
    }

    println!("{}", "🌾 Dryerlink Agent".bright_blue().bold());
    println!(
        "{} {} @ {} baud",
        "Bus:".dimmed(),
        config.bus.serial_port,
        config.bus.baud_rate
    );
    println!("{} {}", "Server:".dimmed(), config.uplink.server_addr);

    let mut agent = DryerAgent::spawn(config).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = agent.reboot_requested() => {
            info!("reboot requested by supervisory server");
        }
    }

    agent.shutdown().await;
    println!("{}", "🌾 Dryerlink Agent stopped".bright_blue());

    Ok(())
}
