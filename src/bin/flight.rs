use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use cubesat_flight::agent::{run_agents, AgentError};
use cubesat_flight::config::FlightConfig;
use cubesat_flight::metrics::SystemMetricsCollector;
use cubesat_flight::sensors::{
    SimulatedCamera, SimulatedEnvironment, SimulatedImu, SimulatedPowerMonitor,
};
use cubesat_flight::subsystems::{
    AdcsAgent, CommsRelay, EpsAgent, FlightAgent, ObcAgent, PayloadAgent, SubsystemId,
};
use cubesat_flight::telemetry::{CsvTelemetryLog, TelemetryAgent, TelemetryAggregator};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let matches = build_cli().get_matches();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(matches.value_of("log-level").unwrap_or("info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(&matches).await {
        eprintln!("{} {}", "❌".red(), e.to_string().red());
        std::process::exit(1);
    }
}

fn build_cli() -> App<'static, 'static> {
    let agents = SubsystemId::ALL.iter().map(|id| {
        SubCommand::with_name(id.name()).about(match id {
            SubsystemId::Obc => "🧠 On-board computer mode controller",
            SubsystemId::Eps => "🔋 Electrical power system monitor",
            SubsystemId::Adcs => "🧭 Attitude determination",
            SubsystemId::Payload => "📷 Camera and science payload",
            SubsystemId::Telemetry => "📊 Telemetry aggregator and logger",
            SubsystemId::Comms => "📡 Downlink relay",
        })
    });

    App::new("cubesat-flight")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Space Systems Engineering Team")
        .about("🛰️  CubeSat flight software agents")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("MQTT broker host (overrides config and MQTT_BROKER)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("MQTT broker port (overrides config and MQTT_PORT)")
                .takes_value(true)
                .global(true)
                .validator(|v| {
                    v.parse::<u16>()
                        .map(|_| ())
                        .map_err(|_| "Port must be a number between 0 and 65535".to_string())
                }),
        )
        .arg(
            Arg::with_name("log-level")
                .short("l")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log filter when RUST_LOG is unset")
                .takes_value(true)
                .default_value("info")
                .global(true),
        )
        .arg(
            Arg::with_name("battery")
                .long("battery")
                .value_name("PERCENT")
                .help("Initial simulated battery charge")
                .takes_value(true)
                .default_value("85")
                .global(true)
                .validator(validate_battery),
        )
        .arg(
            Arg::with_name("external-power")
                .long("external-power")
                .help("Simulate external power present")
                .global(true),
        )
        .subcommands(agents)
        .subcommand(SubCommand::with_name("all").about("🚀 Run every agent, each with its own connection"))
}

fn validate_battery(value: String) -> Result<(), String> {
    match value.parse::<f64>() {
        Ok(percent) if (0.0..=100.0).contains(&percent) => Ok(()),
        _ => Err(format!("Battery must be a percentage between 0 and 100, got '{}'", value)),
    }
}

async fn run(matches: &ArgMatches<'static>) -> Result<(), AgentError> {
    let mut config = FlightConfig::load(matches.value_of("config").map(Path::new))?;
    if let Some(host) = matches.value_of("host") {
        config.bus.host = host.to_string();
    }
    if let Some(port) = matches.value_of("port").and_then(|p| p.parse().ok()) {
        config.bus.port = port;
    }

    let selected: Vec<SubsystemId> = match matches.subcommand_name() {
        Some("all") | None => SubsystemId::ALL.to_vec(),
        Some(name) => SubsystemId::from_name(name).into_iter().collect(),
    };

    let mut agents = Vec::with_capacity(selected.len());
    for id in &selected {
        agents.push(build_agent(*id, &config, matches)?);
    }

    println!("{}", "🛰️  CubeSat flight software starting...".bold());
    println!("   Broker: {}:{}", config.bus.host, config.bus.port);
    for id in &selected {
        println!("   {}: {}", id.name(), "✓".green());
    }

    let (shutdown, _) = watch::channel(false);
    let shutdown = Arc::new(shutdown);
    let ctrl_c = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            ctrl_c.send_replace(true);
        }
    });

    run_agents(agents, &config.bus, &shutdown).await?;
    Ok(())
}

fn build_agent(
    id: SubsystemId,
    config: &FlightConfig,
    matches: &ArgMatches<'static>,
) -> Result<Box<dyn FlightAgent>, AgentError> {
    let intervals = &config.intervals;
    let agent: Box<dyn FlightAgent> = match id {
        SubsystemId::Obc => Box::new(ObcAgent::new(
            intervals.deploy(),
            intervals.restore_window(),
            intervals.telemetry(),
        )),
        SubsystemId::Eps => {
            // Checked by the argument validator
            let battery = matches
                .value_of("battery")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(85.0);
            let monitor = SimulatedPowerMonitor::new(
                battery,
                0.2,
                matches.is_present("external-power"),
            );
            Box::new(EpsAgent::new(
                Box::new(monitor),
                config.eps.polarity,
                intervals.eps(),
            ))
        }
        SubsystemId::Adcs => Box::new(AdcsAgent::new(
            Box::new(SimulatedImu::new()),
            &config.ahrs,
            intervals.adcs(),
        )),
        SubsystemId::Payload => Box::new(PayloadAgent::new(
            Box::new(SimulatedCamera::new(config.paths.photo_dir.clone())),
            Box::new(SimulatedEnvironment::new()),
            intervals.science(),
        )),
        SubsystemId::Telemetry => {
            // A log that cannot be opened is fatal at startup
            let log = CsvTelemetryLog::open(&config.paths.telemetry_log)?;
            Box::new(TelemetryAgent::new(
                TelemetryAggregator::new(intervals.telemetry(), intervals.low_power_telemetry()),
                Box::new(SystemMetricsCollector::new()),
                Box::new(log),
            ))
        }
        SubsystemId::Comms => Box::new(CommsRelay::new()),
    };
    Ok(agent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_argument_validated() {
        assert!(validate_battery("42.5".into()).is_ok());
        assert!(validate_battery("0".into()).is_ok());
        assert!(validate_battery("abc".into()).is_err());
        assert!(validate_battery("150".into()).is_err());
        assert!(validate_battery("NaN".into()).is_err());

        let rejected = build_cli().get_matches_from_safe(vec!["cubesat-flight", "--battery", "lots", "eps"]);
        assert!(rejected.is_err());
    }
}
