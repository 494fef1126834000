use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use cubesat_flight::bus::{BusClient, Incoming};
use cubesat_flight::config::FlightConfig;
use cubesat_flight::protocol::{
    BusMessage, CommandKind, GroundCommand, PhotoCommand, PhotoResponse, Topic,
};
use cubesat_flight::state_machine::SatelliteMode;
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const FLUSH_DELAY: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("cubesat-ctl")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Space Systems Engineering Team")
        .about("🛰️  Bench console for the CubeSat bus")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("command")
                .about("🎛️  Send a ground command")
                .arg(
                    Arg::with_name("name")
                        .required(true)
                        .possible_values(&[
                            "science_start",
                            "science_stop",
                            "safe_mode",
                            "recover",
                            "timelapse_start",
                            "timelapse_stop",
                        ]),
                )
                .arg(
                    Arg::with_name("request-id")
                        .long("request-id")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("interval")
                        .long("interval")
                        .value_name("SECS")
                        .help("Timelapse interval")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("photo")
                .about("📷 Request a photo and wait for the response")
                .arg(
                    Arg::with_name("request-id")
                        .long("request-id")
                        .takes_value(true),
                )
                .arg(Arg::with_name("overlay").long("overlay"))
                .arg(
                    Arg::with_name("wait")
                        .long("wait")
                        .value_name("SECS")
                        .takes_value(true)
                        .default_value("10"),
                ),
        )
        .subcommand(
            SubCommand::with_name("watch")
                .about("👀 Print bus traffic")
                .arg(
                    Arg::with_name("topic")
                        .help("Topic names such as mode/status, or 'all'")
                        .multiple(true)
                        .default_value("all"),
                ),
        )
        .get_matches();

    let level = if matches.is_present("verbose") { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let mut config = FlightConfig::load(matches.value_of("config").map(Path::new))?;
    if let Some(host) = matches.value_of("host") {
        config.bus.host = host.to_string();
    }
    if let Some(port) = matches.value_of("port") {
        config.bus.port = port.parse()?;
    }
    let bus_config = config.bus.ephemeral("cubesat-ground");

    match matches.subcommand() {
        ("command", Some(sub)) => send_command(&bus_config, sub).await?,
        ("photo", Some(sub)) => request_photo(&bus_config, sub).await?,
        ("watch", Some(sub)) => watch(&bus_config, sub).await?,
        _ => return Err("missing subcommand".into()),
    }
    Ok(())
}

async fn send_command(
    config: &cubesat_flight::config::BusConfig,
    matches: &ArgMatches<'_>,
) -> Result<(), Box<dyn std::error::Error>> {
    let name = matches.value_of("name").unwrap_or_default();
    let command: CommandKind = serde_json::from_value(serde_json::Value::String(name.to_string()))?;
    let message = GroundCommand {
        command,
        request_id: matches.value_of("request-id").map(str::to_string),
        interval_secs: matches.value_of("interval").map(str::parse::<u64>).transpose()?,
    };

    let bus = BusClient::connect(config, &[]).await?;
    let message = BusMessage::Command(message);
    message.validate()?;
    bus.handle().publish_message(&message).await?;
    tokio::time::sleep(FLUSH_DELAY).await;
    bus.shutdown().await;

    println!("{} Sent {}", "✅".green(), name.bold());
    Ok(())
}

async fn request_photo(
    config: &cubesat_flight::config::BusConfig,
    matches: &ArgMatches<'_>,
) -> Result<(), Box<dyn std::error::Error>> {
    let request_id = matches
        .value_of("request-id")
        .map(str::to_string)
        .unwrap_or_else(|| format!("req_{}", chrono::Utc::now().timestamp_millis()));
    let wait: u64 = matches.value_of("wait").unwrap_or("10").parse()?;

    let mut bus = BusClient::connect(config, &[Topic::PayloadPhoto]).await?;
    let request = BusMessage::PhotoRequest(PhotoCommand {
        request_id: Some(request_id.clone()),
        overlay: matches.is_present("overlay"),
    });
    request.validate()?;
    bus.handle().publish_message(&request).await?;
    println!("📷 Requested photo {}", request_id.bold());

    let response = tokio::time::timeout(Duration::from_secs(wait), async {
        while let Some(incoming) = bus.recv().await {
            if let Ok(BusMessage::Photo(response)) = incoming.decode() {
                if response.request_id() == request_id {
                    return Some(response);
                }
            }
        }
        None
    })
    .await;

    match response {
        Ok(Some(PhotoResponse::Ok { path, size_bytes, .. })) => {
            println!("{} Captured {} ({} bytes)", "✅".green(), path, size_bytes);
        }
        Ok(Some(PhotoResponse::Error { reason, .. })) => {
            println!("{} Rejected: {}", "❌".red(), reason.red());
        }
        Ok(None) | Err(_) => println!("{} No response within {}s", "⏱️".yellow(), wait),
    }

    bus.shutdown().await;
    Ok(())
}

async fn watch(
    config: &cubesat_flight::config::BusConfig,
    matches: &ArgMatches<'_>,
) -> Result<(), Box<dyn std::error::Error>> {
    let names: Vec<&str> = matches.values_of("topic").map(Iterator::collect).unwrap_or_default();
    let topics: Vec<Topic> = if names.contains(&"all") {
        Topic::ALL.to_vec()
    } else {
        names
            .iter()
            .map(|name| {
                Topic::ALL
                    .iter()
                    .copied()
                    .find(|topic| topic.name() == *name)
                    .ok_or_else(|| format!("unknown topic: {name}"))
            })
            .collect::<Result<_, _>>()?
    };

    let mut bus = BusClient::connect(config, &topics).await?;
    println!("👀 Watching {} topic(s) on {}:{}", topics.len(), config.host, config.port);

    while let Some(incoming) = bus.recv().await {
        print_message(&incoming);
    }
    Ok(())
}

fn print_message(incoming: &Incoming) {
    let topic = incoming.topic.name().cyan();
    match incoming.decode() {
        Ok(BusMessage::Mode(status)) => println!("{} {}", topic, colored_mode(status.state)),
        Ok(BusMessage::Eps(status)) => println!(
            "{} battery={} voltage={} external={} health={:?}",
            topic,
            status.battery_percent.map_or("--".to_string(), |p| format!("{p:.1}%")),
            status.voltage_volts.map_or("--".to_string(), |v| format!("{v:.2}V")),
            status.external_power,
            status.health
        ),
        Ok(BusMessage::Adcs(status)) => println!(
            "{} roll={:.2}° pitch={:.2}° yaw={:.2}°",
            topic, status.roll_deg, status.pitch_deg, status.yaw_deg
        ),
        Ok(BusMessage::Photo(PhotoResponse::Ok { request_id, size_bytes, .. })) => {
            println!("{} {} {} bytes", topic, request_id, size_bytes);
        }
        Ok(BusMessage::Photo(PhotoResponse::Error { request_id, reason })) => {
            println!("{} {} {}", topic, request_id, reason.red());
        }
        Ok(BusMessage::Downlink(frame)) => println!(
            "{} {} [{}/{}] crc={:04x} {}",
            topic,
            frame.packet_id,
            frame.index + 1,
            frame.total,
            frame.crc16,
            if frame.verify() { "ok".green() } else { "BAD".red() }
        ),
        Ok(other) => match serde_json::from_slice::<serde_json::Value>(&incoming.payload) {
            Ok(value) => println!("{} {}", topic, value),
            Err(_) => println!("{} {:?}", topic, other),
        },
        Err(e) => println!("{} {}", topic, format!("invalid: {e}").red()),
    }
}

fn colored_mode(mode: SatelliteMode) -> ColoredString {
    match mode {
        SatelliteMode::Safe => mode.as_str().red().bold(),
        SatelliteMode::LowPower => mode.as_str().yellow(),
        SatelliteMode::Nominal | SatelliteMode::Science => mode.as_str().green(),
        SatelliteMode::Boot | SatelliteMode::Deploy => mode.as_str().blue(),
    }
}
