use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_QUEUE: usize = 1024;
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("subscribe to {filter} failed: {reason}")]
    Subscribe { filter: String, reason: String },
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("outgoing queue full, dropped message for {topic}")]
    Backpressure { topic: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusEndpoint {
    pub host: String,
    pub port: u16,
}

impl BusEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for BusEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What a bus connection reports back. Messages arrive in transport order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Message { topic: String, payload: Vec<u8> },
    /// The transport came back after a loss.
    Connected,
    Disconnected,
}

/// A live publish/subscribe connection.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn subscribe(&self, filter: &str) -> Result<(), BusError>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
    /// Queue a publish without waiting. Fails with `Backpressure` when the
    /// outgoing queue is full.
    fn try_publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
    fn is_connected(&self) -> bool;
}

/// Serialize `value` as JSON and publish it.
pub async fn publish_json<T: Serialize + ?Sized>(
    bus: &dyn Bus,
    topic: &str,
    value: &T,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(value).map_err(|e| BusError::Publish {
        topic: topic.to_string(),
        reason: e.to_string(),
    })?;
    bus.publish(topic, payload).await
}

/// A connected bus plus the stream of everything it receives.
pub struct BusLink {
    pub bus: Arc<dyn Bus>,
    pub events: mpsc::Receiver<BusEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection and wait until the transport confirms it.
    async fn connect(&self, endpoint: &BusEndpoint, client_id: &str) -> Result<BusLink, BusError>;
}

// ===================== MQTT =====================

pub struct MqttConnector {
    connect_timeout: Duration,
}

impl MqttConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, endpoint: &BusEndpoint, client_id: &str) -> Result<BusLink, BusError> {
        let mut opts = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
        opts.set_keep_alive(Duration::from_secs(5));
        let (client, eventloop) = AsyncClient::new(opts, 64);

        let connected = Arc::new(AtomicBool::new(false));
        let filters = Arc::new(Mutex::new(Vec::<String>::new()));
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(drive(
            eventloop,
            client.clone(),
            connected.clone(),
            filters.clone(),
            events_tx,
            ready_tx,
            endpoint.to_string(),
        ));

        let failure = |reason: String| BusError::Connect { endpoint: endpoint.to_string(), reason };
        match tokio::time::timeout(self.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(reason))) => {
                task.abort();
                return Err(failure(reason));
            }
            Ok(Err(_)) => {
                task.abort();
                return Err(failure("event loop stopped".to_string()));
            }
            Err(_) => {
                task.abort();
                return Err(failure("timed out waiting for CONNACK".to_string()));
            }
        }

        info!(endpoint=%endpoint, client_id=%client_id, "bus connected");
        let bus = MqttBus { client, connected, filters, task };
        Ok(BusLink { bus: Arc::new(bus), events: events_rx })
    }
}

struct MqttBus {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    filters: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl Bus for MqttBus {
    async fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        if let Ok(mut filters) = self.filters.lock() {
            if !filters.iter().any(|f| f == filter) {
                filters.push(filter.to_string());
            }
        }
        self.client
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .map_err(|e| BusError::Subscribe { filter: filter.to_string(), reason: e.to_string() })
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| BusError::Publish { topic: topic.to_string(), reason: e.to_string() })
    }

    fn try_publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| match e {
                ClientError::TryRequest(_) => BusError::Backpressure { topic: topic.to_string() },
                other => BusError::Publish { topic: topic.to_string(), reason: other.to_string() },
            })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Poll the MQTT event loop forever, translating it into `BusEvent`s.
/// The first outcome (CONNACK or error) is reported through `ready`.
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    filters: Arc<Mutex<Vec<String>>>,
    events: mpsc::Sender<BusEvent>,
    ready: oneshot::Sender<Result<(), String>>,
    endpoint: String,
) {
    let mut ready = Some(ready);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::Relaxed);
                // The broker may have dropped our session; subscribe again.
                let current: Vec<String> = filters.lock().map(|f| f.clone()).unwrap_or_default();
                for filter in current {
                    if let Err(e) = client.try_subscribe(filter.clone(), QoS::AtMostOnce) {
                        warn!(endpoint=%endpoint, filter=%filter, error=%e, "resubscribe failed");
                    }
                }
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Ok(()));
                    }
                    None => {
                        info!(endpoint=%endpoint, "bus reconnected");
                        let _ = events.send(BusEvent::Connected).await;
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let _ = events
                    .send(BusEvent::Message { topic: p.topic, payload: p.payload.to_vec() })
                    .await;
            }
            Ok(_) => {}
            Err(e) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(e.to_string()));
                    return;
                }
                if connected.swap(false, Ordering::Relaxed) {
                    warn!(endpoint=%endpoint, error=%e, "bus disconnected");
                    let _ = events.send(BusEvent::Disconnected).await;
                } else {
                    debug!(endpoint=%endpoint, error=%e, "bus still unreachable");
                }
                tokio::time::sleep(RECONNECT_PAUSE).await;
            }
        }
    }
}

// ===================== In-memory double =====================

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    pub struct MemoryBus {
        published: Mutex<Vec<(String, Vec<u8>)>>,
        subscriptions: Mutex<Vec<String>>,
        connected: AtomicBool,
        fail_subscribe: AtomicBool,
        saturated: AtomicBool,
    }

    impl MemoryBus {
        pub fn new() -> Arc<Self> {
            let bus = Self::default();
            bus.connected.store(true, Ordering::Relaxed);
            Arc::new(bus)
        }

        pub fn fail_subscriptions(&self) {
            self.fail_subscribe.store(true, Ordering::Relaxed);
        }

        /// Refuse non-blocking publishes as if the outgoing queue were full.
        pub fn saturate(&self, full: bool) {
            self.saturated.store(full, Ordering::Relaxed);
        }

        pub fn published(&self) -> Vec<(String, Vec<u8>)> {
            self.published.lock().unwrap().clone()
        }

        pub fn published_on(&self, topic: &str) -> Vec<serde_json::Value> {
            self.published()
                .into_iter()
                .filter(|(t, _)| t == topic)
                .map(|(_, p)| serde_json::from_slice(&p).unwrap())
                .collect()
        }

        pub fn subscriptions(&self) -> Vec<String> {
            self.subscriptions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Bus for MemoryBus {
        async fn subscribe(&self, filter: &str) -> Result<(), BusError> {
            if self.fail_subscribe.load(Ordering::Relaxed) {
                return Err(BusError::Subscribe { filter: filter.to_string(), reason: "refused".into() });
            }
            self.subscriptions.lock().unwrap().push(filter.to_string());
            Ok(())
        }

        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
            self.published.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }

        fn try_publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
            if self.saturated.load(Ordering::Relaxed) {
                return Err(BusError::Backpressure { topic: topic.to_string() });
            }
            self.published.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }
    }

    /// Hands out pre-registered links per endpoint, in registration order.
    #[derive(Default)]
    pub struct MemoryConnector {
        links: Mutex<HashMap<BusEndpoint, VecDeque<(Arc<MemoryBus>, mpsc::Receiver<BusEvent>)>>>,
        connects: AtomicUsize,
    }

    impl MemoryConnector {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn add(&self, endpoint: &BusEndpoint) -> (Arc<MemoryBus>, mpsc::Sender<BusEvent>) {
            let bus = MemoryBus::new();
            let (tx, rx) = mpsc::channel(EVENT_QUEUE);
            self.links
                .lock()
                .unwrap()
                .entry(endpoint.clone())
                .or_default()
                .push_back((bus.clone(), rx));
            (bus, tx)
        }

        pub fn connects(&self) -> usize {
            self.connects.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, endpoint: &BusEndpoint, _client_id: &str) -> Result<BusLink, BusError> {
            self.connects.fetch_add(1, Ordering::Relaxed);
            let next = self
                .links
                .lock()
                .unwrap()
                .get_mut(endpoint)
                .and_then(|q| q.pop_front());
            match next {
                Some((bus, events)) => Ok(BusLink { bus, events }),
                None => Err(BusError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: "connection refused".into(),
                }),
            }
        }
    }
}
