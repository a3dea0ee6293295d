//! NSQ consumer.
//!
//! One supervisor task per subscription polls nsqlookupd and keeps a
//! connection task open to every producer of the topic. Each connection
//! speaks the V2 protocol directly:
//!
//! ```text
//! "  V2" → IDENTIFY → SUB topic channel → RDY n → (message → FIN)*
//! ```
//!
//! Stopping flips a watch flag; connection tasks send `CLS` and exit.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::error::BrokerError;
use crate::group::local_host_identity;
use crate::nsq::lookupd::LookupClient;
use crate::nsq::protocol::{read_frame, Command, Frame, CLOSE_WAIT, HEARTBEAT, MAGIC_V2, OK};
use crate::subscriber::{Consumer, MessageHandler, Subscriber};

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// nsqlookupd HTTP addresses.
    pub lookupd_http_addresses: Vec<String>,
    /// How often to re-query lookupd for new producers.
    pub lookupd_poll_interval: Duration,
    /// Messages nsqd may have in flight per connection.
    pub max_in_flight: u32,
    /// Timeout for connecting and for each handshake step.
    pub dial_timeout: Duration,
    /// Sent in IDENTIFY.
    pub user_agent: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            lookupd_http_addresses: vec!["127.0.0.1:4161".to_string()],
            lookupd_poll_interval: Duration::from_secs(15),
            max_in_flight: 10,
            dial_timeout: Duration::from_secs(5),
            user_agent: concat!("relay/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Creates [`NsqConsumer`]s discovered through nsqlookupd.
#[derive(Debug, Clone)]
pub struct NsqSubscriber {
    config: ConsumerConfig,
    lookup: LookupClient,
}

impl NsqSubscriber {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: ConsumerConfig) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .timeout(config.dial_timeout)
            .build()?;
        let lookup = LookupClient::new(http, config.lookupd_http_addresses.clone());
        Ok(Self { config, lookup })
    }
}

#[async_trait]
impl Subscriber for NsqSubscriber {
    /// Fails if no lookupd answers the first discovery round. A topic with
    /// no producers yet is not an error; later polls pick them up.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn Consumer>, BrokerError> {
        if self.config.max_in_flight == 0 {
            return Err(BrokerError::Config("max_in_flight must be positive".into()));
        }
        if self.config.lookupd_poll_interval.is_zero() {
            return Err(BrokerError::Config("lookupd_poll_interval must be positive".into()));
        }
        let initial = self.lookup.producers(topic).await?;
        info!(
            topic = %topic,
            group = %group,
            producers = initial.len(),
            "Starting NSQ consumer"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let supervisor = Supervisor {
            topic: topic.to_string(),
            channel: group.to_string(),
            config: self.config.clone(),
            lookup: self.lookup.clone(),
            handler,
            stop: stop_rx,
            connections: HashMap::new(),
        };
        let task = tokio::spawn(supervisor.run(initial.into_iter().collect()));

        Ok(Box::new(NsqConsumer {
            stop: stop_tx,
            task: Some(task),
        }))
    }
}

/// Running NSQ subscription.
pub struct NsqConsumer {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl Consumer for NsqConsumer {
    async fn stop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "NSQ supervisor task failed");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for NsqConsumer {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

struct Supervisor {
    topic: String,
    channel: String,
    config: ConsumerConfig,
    lookup: LookupClient,
    handler: Arc<dyn MessageHandler>,
    stop: watch::Receiver<bool>,
    connections: HashMap<String, JoinHandle<()>>,
}

impl Supervisor {
    async fn run(mut self, initial: Vec<String>) {
        self.connect_all(initial);

        let mut ticker = interval(self.config.lookupd_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    match self.lookup.producers(&self.topic).await {
                        Ok(found) => self.connect_all(found.into_iter().collect()),
                        Err(e) => warn!(topic = %self.topic, error = %e, "Lookupd poll failed"),
                    }
                }
            }
        }

        debug!(topic = %self.topic, connections = self.connections.len(), "Stopping NSQ consumer");
        for (address, task) in self.connections.drain() {
            if timeout(self.config.dial_timeout, task).await.is_err() {
                warn!(nsqd = %address, "Connection did not close in time");
            }
        }
    }

    /// Open connections to producers not already connected.
    fn connect_all(&mut self, addresses: Vec<String>) {
        self.connections.retain(|_, task| !task.is_finished());

        for address in addresses {
            if self.connections.contains_key(&address) {
                continue;
            }
            let connection = Connection {
                address: address.clone(),
                topic: self.topic.clone(),
                channel: self.channel.clone(),
                config: self.config.clone(),
                handler: Arc::clone(&self.handler),
                stop: self.stop.clone(),
            };
            self.connections.insert(address, tokio::spawn(connection.run()));
        }
    }
}

#[derive(Serialize)]
struct Identify<'a> {
    client_id: &'a str,
    hostname: &'a str,
    user_agent: &'a str,
    feature_negotiation: bool,
}

struct Connection {
    address: String,
    topic: String,
    channel: String,
    config: ConsumerConfig,
    handler: Arc<dyn MessageHandler>,
    stop: watch::Receiver<bool>,
}

impl Connection {
    async fn run(mut self) {
        match self.consume().await {
            Ok(()) => debug!(nsqd = %self.address, "NSQ connection closed"),
            Err(e) => warn!(nsqd = %self.address, error = %e, "NSQ connection failed"),
        }
    }

    async fn consume(&mut self) -> Result<(), BrokerError> {
        let stream = timeout(self.config.dial_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| BrokerError::Timeout("connect"))??;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        writer.write_all(MAGIC_V2).await?;

        let host = local_host_identity();
        let client_id = host.split('.').next().unwrap_or(&host);
        let identify = serde_json::to_vec(&Identify {
            client_id,
            hostname: &host,
            user_agent: &self.config.user_agent,
            feature_negotiation: false,
        })
        .map_err(|e| BrokerError::Protocol(e.to_string()))?;
        send(&mut writer, Command::Identify(Bytes::from(identify))).await?;
        self.expect_ok(&mut reader).await?;

        send(
            &mut writer,
            Command::Sub {
                topic: self.topic.clone(),
                channel: self.channel.clone(),
            },
        )
        .await?;
        self.expect_ok(&mut reader).await?;

        send(&mut writer, Command::Rdy(self.config.max_in_flight)).await?;
        info!(nsqd = %self.address, topic = %self.topic, "Subscribed");

        loop {
            tokio::select! {
                biased;

                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        send(&mut writer, Command::Cls).await?;
                        return Ok(());
                    }
                }

                frame = read_frame(&mut reader) => match frame? {
                    Frame::Message(message) => {
                        trace!(attempts = message.attempts, "NSQ message");
                        self.handler.handle(&message.body);
                        send(&mut writer, Command::Fin(message.id)).await?;
                    }
                    Frame::Response(body) if body == HEARTBEAT => {
                        send(&mut writer, Command::Nop).await?;
                    }
                    Frame::Response(body) if body == CLOSE_WAIT => return Ok(()),
                    Frame::Response(body) => {
                        trace!(response = %String::from_utf8_lossy(&body), "NSQ response");
                    }
                    Frame::Error(body) => {
                        warn!(nsqd = %self.address, error = %String::from_utf8_lossy(&body), "NSQ error frame");
                    }
                },
            }
        }
    }

    async fn expect_ok<R>(&self, reader: &mut R) -> Result<(), BrokerError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let frame = timeout(self.config.dial_timeout, read_frame(reader))
            .await
            .map_err(|_| BrokerError::Timeout("handshake"))??;
        match frame {
            Frame::Response(body) if body == OK => Ok(()),
            Frame::Error(body) => Err(BrokerError::Remote(
                String::from_utf8_lossy(&body).into_owned(),
            )),
            other => Err(BrokerError::Protocol(format!(
                "unexpected handshake frame: {:?}",
                other
            ))),
        }
    }
}

async fn send(writer: &mut OwnedWriteHalf, command: Command) -> Result<(), BrokerError> {
    writer.write_all(&command.to_bytes()).await?;
    Ok(())
}
