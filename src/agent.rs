use crate::bus::{BusClient, BusError, BusHandle};
use crate::config::{BusConfig, ConfigError};
use crate::protocol::{BusMessage, Outbound, ProtocolError};
use crate::sensors::SensorError;
use crate::subsystems::{FlightAgent, SubsystemId};
use crate::telemetry::StoreError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Sleep used when an agent has no periodic work.
const IDLE_TICK: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("agent tick panicked: {0}")]
    Tick(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStats {
    pub messages_received: u64,
    pub messages_rejected: u64,
    pub messages_published: u64,
    pub messages_dropped: u64,
    pub ticks: u64,
}

/// Drives one agent: a single task owning the agent, interleaving bus
/// deliveries with its periodic tick until `shutdown` flips to true or the
/// bus connection is gone.
pub async fn run_agent(
    mut agent: Box<dyn FlightAgent>,
    config: &BusConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<AgentStats, AgentError> {
    let id = agent.id();
    let config = config.with_client_name(&format!("{}-{}", config.client_name, id.name()));
    let mut bus = BusClient::connect(&config, agent.subscriptions()).await?;
    let handle = bus.handle();
    let mut stats = AgentStats::default();

    info!(agent = id.name(), client_id = bus.client_id(), "🚀 Agent running");
    agent.attach(handle.clone());

    let started = Instant::now();
    let initial = agent.on_start(started.into_std());
    publish_all(&handle, initial, &mut stats);

    let mut next_tick = started + agent.tick_interval().unwrap_or(IDLE_TICK);

    loop {
        tokio::select! {
            incoming = bus.recv() => {
                let Some(incoming) = incoming else {
                    warn!(agent = id.name(), "Bus event loop ended");
                    break;
                };
                stats.messages_received += 1;
                match incoming.decode() {
                    Ok(message) => {
                        let replies = agent.on_message(message);
                        publish_all(&handle, replies, &mut stats);
                    }
                    Err(e) => {
                        stats.messages_rejected += 1;
                        warn!(topic = %incoming.topic, "Discarding malformed message: {}", e);
                    }
                }
            }
            () = sleep_until(next_tick) => {
                stats.ticks += 1;
                let now = Instant::now();
                if agent.tick_interval().is_some() {
                    let (returned, messages) = tick_blocking(agent, now.into_std()).await?;
                    agent = returned;
                    publish_all(&handle, messages, &mut stats);
                }
                next_tick = now + agent.tick_interval().unwrap_or(IDLE_TICK);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(agent = id.name(), "Shutdown requested");
                    break;
                }
            }
        }
    }

    agent.on_shutdown();
    bus.shutdown().await;
    Ok(stats)
}

/// Ticks read sensors and files, which may block, so they run on the
/// blocking pool with the agent handed over and back.
async fn tick_blocking(
    mut agent: Box<dyn FlightAgent>,
    now: std::time::Instant,
) -> Result<(Box<dyn FlightAgent>, Vec<BusMessage>), AgentError> {
    let ticked = tokio::task::spawn_blocking(move || {
        let messages = agent.on_tick(now);
        (agent, messages)
    })
    .await?;
    Ok(ticked)
}

/// Runs several agents, each on its own connection, until all stop.
///
/// The first agent to fail flips `shutdown` so the others wind down too; a
/// partially started flight stack never keeps running. Returns that error, or
/// every agent's stats after a clean shutdown.
pub async fn run_agents(
    agents: Vec<Box<dyn FlightAgent>>,
    config: &BusConfig,
    shutdown: &watch::Sender<bool>,
) -> Result<Vec<(SubsystemId, AgentStats)>, AgentError> {
    let mut tasks = JoinSet::new();
    for agent in agents {
        let bus = config.clone();
        let stop = shutdown.subscribe();
        tasks.spawn(async move {
            let id = agent.id();
            (id, run_agent(agent, &bus, stop).await)
        });
    }

    let mut first_error = None;
    let mut stopped = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((id, Ok(stats))) => {
                info!(
                    agent = id.name(),
                    received = stats.messages_received,
                    published = stats.messages_published,
                    dropped = stats.messages_dropped,
                    rejected = stats.messages_rejected,
                    "Agent stopped"
                );
                stopped.push((id, stats));
            }
            Ok((id, Err(e))) => {
                error!(agent = id.name(), "Agent failed, stopping the rest: {}", e);
                shutdown.send_replace(true);
                first_error.get_or_insert(e);
            }
            Err(e) => {
                error!("Agent task panicked, stopping the rest: {}", e);
                shutdown.send_replace(true);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(stopped),
    }
}

/// Never blocks, so a broker outage cannot stall inbound handling or shutdown.
fn publish_all(handle: &BusHandle, messages: Vec<BusMessage>, stats: &mut AgentStats) {
    for message in messages {
        let outbound = match Outbound::from_message(&message) {
            Ok(outbound) => outbound,
            Err(e) => {
                warn!(topic = %message.topic(), "Dropping unencodable message: {}", e);
                continue;
            }
        };
        debug!(topic = %outbound.topic, bytes = outbound.payload.len(), "Publishing");
        if let Err(e) = handle.try_publish(outbound) {
            stats.messages_dropped += 1;
            warn!(dropped = stats.messages_dropped, "{}", e);
            continue;
        }
        stats.messages_published += 1;
    }
}
