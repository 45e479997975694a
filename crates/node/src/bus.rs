//! MQTT plumbing for the node: the broker reachability probe, the session
//! factory the supervisor drives, and the live session the device talks to.

use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};

use crate::supervisor::{Network, SessionFactory};

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 32;

/// One message received on the command topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// What the device loop needs from a connected session.
#[allow(async_fn_in_trait)]
pub trait CommandBus {
    /// Wait until `deadline` for the next inbound command. `Ok(None)` when the
    /// deadline passes quietly; `Err` means the session is gone.
    async fn next_command(&mut self, deadline: Instant) -> Result<Option<Inbound>>;

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Network probe
// ---------------------------------------------------------------------------

/// Treats the network as up when the broker port accepts a TCP connection.
pub struct BrokerProbe {
    host: String,
    port: u16,
}

impl BrokerProbe {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl Network for BrokerProbe {
    async fn is_up(&mut self) -> bool {
        let addr = (self.host.as_str(), self.port);
        matches!(timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await, Ok(Ok(_)))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct MqttConnector {
    host: String,
    port: u16,
    client_id: String,
    command_topic: String,
}

impl MqttConnector {
    pub fn new(host: &str, port: u16, client_id: &str, command_topic: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            client_id: client_id.to_string(),
            command_topic: command_topic.to_string(),
        }
    }
}

impl SessionFactory for MqttConnector {
    type Session = MqttSession;

    async fn open(&mut self) -> Result<MqttSession> {
        let mut opts = MqttOptions::new(&self.client_id, &self.host, self.port);
        opts.set_keep_alive(KEEP_ALIVE);

        let (client, mut eventloop) = AsyncClient::new(opts, REQUEST_CAPACITY);
        // Queued now, sent right after CONNACK.
        client
            .subscribe(&self.command_topic, QoS::AtLeastOnce)
            .await
            .context("failed to queue command subscription")?;

        let connack = timeout(CONNACK_TIMEOUT, async {
            loop {
                if let Event::Incoming(Packet::ConnAck(ack)) = eventloop.poll().await? {
                    return Ok::<_, rumqttc::ConnectionError>(ack);
                }
            }
        })
        .await
        .context("timed out waiting for CONNACK")?
        .with_context(|| format!("mqtt connect to {}:{} failed", self.host, self.port))?;

        anyhow::ensure!(
            connack.code == ConnectReturnCode::Success,
            "broker refused connection: {:?}",
            connack.code
        );

        tracing::info!(
            host = %self.host,
            port = self.port,
            topic = %self.command_topic,
            "mqtt connected"
        );
        Ok(MqttSession { client, eventloop })
    }
}

pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl CommandBus for MqttSession {
    async fn next_command(&mut self, deadline: Instant) -> Result<Option<Inbound>> {
        loop {
            match timeout_at(deadline, self.eventloop.poll()).await {
                Err(_) => return Ok(None),
                Ok(Ok(Event::Incoming(Packet::Publish(p)))) => {
                    return Ok(Some(Inbound {
                        topic: p.topic,
                        payload: p.payload.to_vec(),
                    }))
                }
                Ok(Ok(Event::Incoming(Packet::SubAck(_)))) => {
                    tracing::debug!("command subscription acknowledged");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e).context("mqtt session lost"),
            }
        }
    }

    /// Queue the publish without awaiting the event loop; it goes out on the
    /// next `next_command` poll. A full queue is treated as a dead session.
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .with_context(|| format!("publish to {topic} failed"))
    }
}
