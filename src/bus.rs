//! Broker connection owned by a single agent.
//!
//! The rumqttc event loop runs in its own task: it re-subscribes on every
//! CONNACK, forwards publishes to the agent through a bounded channel and
//! sleeps with exponential backoff after connection errors. Outbound traffic
//! goes through [`BusHandle`], which background tasks may clone.

use crate::config::BusConfig;
use crate::protocol::{BusMessage, Outbound, ProtocolError, Topic, MAX_MESSAGE_SIZE};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Headroom for MQTT framing on top of the largest accepted payload.
const PACKET_OVERHEAD: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("initial connection to {host}:{port} not established within {timeout:?}")]
    InitialConnect {
        host: String,
        port: u16,
        timeout: Duration,
    },
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("publish queue full, dropped message for {topic}")]
    QueueFull { topic: Topic },
    #[error("bus channel closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Exponential reconnect delay, doubled per failure and reset on CONNACK.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// `<name>` or `<name>-<instance>`. Stable across restarts so the broker
/// resumes the persistent session instead of orphaning it.
pub fn stable_client_id(name: &str, instance_id: Option<&str>) -> String {
    match instance_id {
        Some(instance) => format!("{}-{}", name, instance),
        None => name.to_string(),
    }
}

/// `<name>-<8 hex chars>` for clean-session clients that may run concurrently.
pub fn unique_client_id(name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", name, &suffix[..8])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub topic: Topic,
    pub payload: Vec<u8>,
}

impl Incoming {
    pub fn decode(&self) -> Result<BusMessage, ProtocolError> {
        BusMessage::decode(self.topic, &self.payload)
    }
}

#[derive(Debug, Clone)]
pub struct BusHandle {
    outbound: mpsc::Sender<Outbound>,
}

impl BusHandle {
    pub fn new(outbound: mpsc::Sender<Outbound>) -> Self {
        Self { outbound }
    }

    pub async fn publish(&self, message: Outbound) -> Result<(), BusError> {
        self.outbound.send(message).await.map_err(|_| BusError::Closed)
    }

    pub async fn publish_message(&self, message: &BusMessage) -> Result<(), BusError> {
        self.publish(Outbound::from_message(message)?).await
    }

    /// Queues without waiting. While the broker is unreachable the queue fills
    /// and further messages are dropped rather than stalling the caller.
    pub fn try_publish(&self, message: Outbound) -> Result<(), BusError> {
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(message) => BusError::QueueFull {
                topic: message.topic,
            },
            mpsc::error::TrySendError::Closed(_) => BusError::Closed,
        })
    }

    pub fn try_publish_message(&self, message: &BusMessage) -> Result<(), BusError> {
        self.try_publish(Outbound::from_message(message)?)
    }
}

pub struct BusClient {
    client_id: String,
    client: AsyncClient,
    handle: BusHandle,
    inbound: mpsc::Receiver<Incoming>,
    state: watch::Receiver<ConnectionState>,
    tasks: Vec<JoinHandle<()>>,
}

impl BusClient {
    /// Connects and waits for the first CONNACK. Flight agents use a persistent
    /// session under a stable id; ephemeral clients a clean one.
    pub async fn connect(config: &BusConfig, subscriptions: &[Topic]) -> Result<Self, BusError> {
        let client_id = if config.persistent_session {
            stable_client_id(&config.client_name, config.instance_id.as_deref())
        } else {
            unique_client_id(&config.client_name)
        };
        let mut options = MqttOptions::new(client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(!config.persistent_session);
        options.set_max_packet_size(
            MAX_MESSAGE_SIZE + PACKET_OVERHEAD,
            MAX_MESSAGE_SIZE + PACKET_OVERHEAD,
        );

        let (client, eventloop) = AsyncClient::new(options, config.channel_capacity);
        let (inbound_tx, inbound) = mpsc::channel(config.channel_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.channel_capacity);
        let (state_tx, mut state) = watch::channel(ConnectionState::Connecting);

        let topics: Vec<String> = subscriptions
            .iter()
            .map(|topic| topic.path(&config.topic_prefix))
            .collect();

        info!(%client_id, host = %config.host, port = config.port, "Connecting to broker");

        let tasks = vec![
            tokio::spawn(drive_event_loop(
                eventloop,
                client.clone(),
                topics,
                config.topic_prefix.clone(),
                inbound_tx,
                state_tx,
                Backoff::new(config.reconnect_min(), config.reconnect_max()),
            )),
            tokio::spawn(drain_outbound(
                client.clone(),
                config.topic_prefix.clone(),
                outbound_rx,
            )),
        ];

        let connected = if config.retry_initial_connect {
            state
                .wait_for(|s| *s == ConnectionState::Connected)
                .await
                .is_ok()
        } else {
            matches!(
                tokio::time::timeout(
                    config.connect_timeout(),
                    state.wait_for(|s| *s == ConnectionState::Connected),
                )
                .await,
                Ok(Ok(_))
            )
        };

        if !connected {
            for task in &tasks {
                task.abort();
            }
            error!(%client_id, "Initial broker connection failed");
            return Err(BusError::InitialConnect {
                host: config.host.clone(),
                port: config.port,
                timeout: config.connect_timeout(),
            });
        }

        Ok(Self {
            client_id,
            client,
            handle: BusHandle::new(outbound_tx),
            inbound,
            state,
            tasks,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    pub async fn recv(&mut self) -> Option<Incoming> {
        self.inbound.recv().await
    }

    pub async fn shutdown(self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("Disconnect request failed: {}", e);
        }
        for task in self.tasks {
            task.abort();
        }
        info!(client_id = %self.client_id, "Bus connection closed");
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Vec<String>,
    prefix: String,
    inbound: mpsc::Sender<Incoming>,
    state: watch::Sender<ConnectionState>,
    mut backoff: Backoff,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff.reset();
                state.send_replace(ConnectionState::Connected);
                info!("📡 Broker connected");
                for topic in &topics {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        warn!(%topic, "Subscribe failed: {}", e);
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Some(topic) = Topic::from_path(&prefix, &publish.topic) else {
                    warn!(topic = %publish.topic, "Discarding message on unknown topic");
                    continue;
                };
                let message = Incoming {
                    topic,
                    payload: publish.payload.to_vec(),
                };
                if inbound.send(message).await.is_err() {
                    debug!("Inbound receiver dropped, stopping event loop");
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                state.send_replace(ConnectionState::Disconnected);
                let delay = backoff.next_delay();
                warn!(?delay, "Broker connection error: {}", e);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn drain_outbound(client: AsyncClient, prefix: String, mut outbound: mpsc::Receiver<Outbound>) {
    while let Some(message) = outbound.recv().await {
        let topic = message.topic.path(&prefix);
        // rumqttc's request queue is bounded too; never wait on it while offline
        if let Err(e) = client.try_publish(topic.as_str(), QoS::AtLeastOnce, message.retain, message.payload) {
            warn!(%topic, "Publish dropped: {}", e);
        }
    }
}
