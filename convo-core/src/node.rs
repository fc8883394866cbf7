//! Node: broker connections, channel pooling and container identity.
//!
//! Bidirectional channels are pooled. Each pooled wrapper is keyed by a local id from an
//! [`IdPool`]; while a wrapper is checked out, `checked_out` maps that id to the broker's own
//! channel number. Releasing a healthy, non-auto-delete channel puts it back under the same id;
//! anything else is closed and its id freed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use async_trait::async_trait;

use crate::bridge::BlockingBridge;
use crate::broker::Broker;
use crate::channel::{Channel, ChannelKind, Releaser};
use crate::config::{Config, ConfigError};
use crate::conversation::ConversationIds;
use crate::interceptor::{Interceptor, InterceptorStack};
use crate::monitor::ConversationMonitor;
use crate::pool::IdPool;
use crate::remote::RemoteConnection;
use crate::transport::{Connection, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("no broker connection could be established ({})", .0.join("; "))]
    NoConnection(Vec<String>),
    #[error("broker {url} not ready within {secs}s")]
    ReadyTimeout { url: String, secs: u64 },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Pool occupancy, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub pooled: usize,
    pub checked_out: usize,
    pub ids_in_use: usize,
}

#[derive(Default)]
struct PoolState {
    ids: IdPool,
    free: HashMap<u32, Arc<Channel>>,
    /// local id -> broker channel number, only while checked out
    checked_out: HashMap<u32, u16>,
}

struct NodeInner {
    container_id: String,
    config: Arc<Config>,
    connections: Vec<Arc<dyn Connection>>,
    next_connection: AtomicUsize,
    pool: Mutex<PoolState>,
    ids: ConversationIds,
    bridge: BlockingBridge,
    interceptors: RwLock<InterceptorStack>,
    running: AtomicBool,
    this: Weak<NodeInner>,
}

/// Handle to a node. Clones share one set of connections and one pool.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Start from the config file and environment (see [`crate::config::load`]).
    pub async fn start_from_env() -> Result<Self, ContainerError> {
        let config = crate::config::load()?;
        Self::start(config).await
    }

    /// Connect to every configured broker. `local` entries share one in-process broker.
    pub async fn start(config: Config) -> Result<Self, ContainerError> {
        Self::start_with_broker(config, Broker::new()).await
    }

    /// Like [`Node::start`], with `local` entries bound to the given broker.
    pub async fn start_with_broker(
        config: Config,
        broker: Arc<Broker>,
    ) -> Result<Self, ContainerError> {
        let policy = config.broker.cancel_policy();
        let ready = config.broker.ready_timeout();
        let mut connections: Vec<Arc<dyn Connection>> = Vec::new();
        let mut failures = Vec::new();
        for url in &config.broker.urls {
            if url == "local" {
                connections.push(Arc::new(broker.connect().with_cancel_policy(policy)));
                continue;
            }
            match tokio::time::timeout(ready, RemoteConnection::connect(url)).await {
                Ok(Ok(conn)) => connections.push(Arc::new(conn.with_cancel_policy(policy))),
                Ok(Err(e)) => {
                    tracing::warn!(url = %url, error = %e, "broker connection failed");
                    failures.push(format!("{}: {}", url, e));
                }
                Err(_) => {
                    let e = ContainerError::ReadyTimeout {
                        url: url.clone(),
                        secs: config.broker.ready_timeout_secs,
                    };
                    tracing::warn!(url = %url, "broker not ready in time");
                    failures.push(e.to_string());
                }
            }
        }
        if connections.is_empty() {
            return Err(ContainerError::NoConnection(failures));
        }
        if !failures.is_empty() {
            tracing::warn!(
                up = connections.len(),
                down = failures.len(),
                "starting with a subset of broker connections"
            );
        }
        Ok(Self::from_connections(config, connections))
    }

    /// Assemble a node over already-open connections.
    pub fn from_connections(config: Config, connections: Vec<Arc<dyn Connection>>) -> Self {
        let container_id = format!("{}", uuid::Uuid::new_v4().simple());
        let bridge = BlockingBridge::new(config.bridge.workers);
        let mut interceptors = InterceptorStack::new();
        if config.monitor.enabled {
            let monitor = ConversationMonitor::from_config(&config.monitor, bridge.clone());
            interceptors.push(Arc::new(monitor));
        }
        let inner = Arc::new_cyclic(|this| NodeInner {
            ids: ConversationIds::new(container_id.clone()),
            container_id,
            config: Arc::new(config),
            connections,
            next_connection: AtomicUsize::new(0),
            pool: Mutex::new(PoolState::default()),
            bridge,
            interceptors: RwLock::new(interceptors),
            running: AtomicBool::new(true),
            this: this.clone(),
        });
        tracing::info!(
            container = %inner.container_id,
            connections = inner.connections.len(),
            "node ready"
        );
        Self { inner }
    }

    pub fn container_id(&self) -> &str {
        &self.inner.container_id
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    pub fn conversation_ids(&self) -> &ConversationIds {
        &self.inner.ids
    }

    pub fn bridge(&self) -> &BlockingBridge {
        &self.inner.bridge
    }

    /// Interceptors endpoints created from now on will run.
    pub fn interceptors(&self) -> InterceptorStack {
        self.inner
            .interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.inner
            .interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(interceptor);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// A channel of `kind`. Bidirectional channels come from the pool when a healthy one is
    /// free; unhealthy pooled channels are closed and replaced without the caller noticing.
    pub async fn channel(&self, kind: ChannelKind) -> Result<Arc<Channel>, TransportError> {
        if !self.is_running() {
            return Err(TransportError::ConnectionLost("node stopped".into()));
        }
        if kind != ChannelKind::Bidir {
            let transport = self.inner.open_transport().await?;
            return Ok(Arc::new(Channel::new(
                kind,
                transport,
                self.inner.config.messaging.max_message_size,
            )));
        }

        loop {
            let candidate = {
                let mut pool = self.inner.lock();
                let id = pool.free.keys().min().copied();
                id.and_then(|id| pool.free.remove(&id).map(|ch| (id, ch)))
            };
            let Some((id, ch)) = candidate else {
                break;
            };
            if ch.is_healthy() {
                let number = ch.transport().channel_number();
                self.inner.lock().checked_out.insert(id, number);
                tracing::debug!(local_id = id, channel = number, "reusing pooled channel");
                return Ok(ch);
            }
            tracing::debug!(local_id = id, "discarding unhealthy pooled channel");
            let _ = ch.transport().close().await;
            self.inner.lock().ids.release_id(id);
        }

        let id = self.inner.lock().ids.get_id();
        let transport = match self.inner.open_transport().await {
            Ok(t) => t,
            Err(e) => {
                self.inner.lock().ids.release_id(id);
                return Err(e);
            }
        };
        let number = transport.channel_number();
        let releaser: Weak<dyn Releaser> = self.inner.this.clone();
        let ch = Arc::new(
            Channel::new(
                ChannelKind::Bidir,
                transport,
                self.inner.config.messaging.max_message_size,
            )
            .pooled(id, releaser),
        );
        self.inner.lock().checked_out.insert(id, number);
        tracing::debug!(local_id = id, channel = number, "opened pooled channel");
        Ok(ch)
    }

    /// Return a pooled channel. Same as closing it.
    pub async fn on_channel_release(&self, ch: Arc<Channel>) {
        self.inner.release(ch).await;
    }

    pub fn pool_stats(&self) -> PoolStats {
        let pool = self.inner.lock();
        PoolStats {
            pooled: pool.free.len(),
            checked_out: pool.checked_out.len(),
            ids_in_use: pool.ids.in_use(),
        }
    }

    /// Local id -> broker channel number for channels currently checked out.
    pub fn checked_out(&self) -> HashMap<u32, u16> {
        self.inner.lock().checked_out.clone()
    }

    /// Close pooled channels and every connection. Channels still checked out are closed by
    /// their holders; their release then closes the broker channel.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let pooled: Vec<Arc<Channel>> = {
            let mut pool = self.inner.lock();
            pool.free.drain().map(|(_, ch)| ch).collect()
        };
        for ch in pooled {
            let _ = ch.transport().close().await;
        }
        for conn in &self.inner.connections {
            if let Err(e) = conn.close().await {
                tracing::warn!(broker = %conn.describe(), error = %e, "connection close failed");
            }
        }
        self.inner.bridge.close();
        tracing::info!(container = %self.inner.container_id, "node stopped");
    }
}

impl NodeInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a broker channel, trying connections round-robin and skipping closed ones.
    async fn open_transport(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let n = self.connections.len();
        let start = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut last = TransportError::ConnectionLost("no open broker connection".into());
        for i in 0..n {
            let conn = &self.connections[(start + i) % n];
            if !conn.is_open() {
                continue;
            }
            match conn.open_channel().await {
                Ok(t) => return Ok(t),
                Err(e) => {
                    tracing::warn!(broker = %conn.describe(), error = %e, "open channel failed");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

#[async_trait]
impl Releaser for NodeInner {
    async fn release(&self, ch: Arc<Channel>) {
        let Some(id) = ch.local_id() else {
            return;
        };
        if let Err(e) = ch.stop_consume().await {
            tracing::debug!(local_id = id, error = %e, "stop consume on release failed");
        }
        let keep = self.running.load(Ordering::Acquire) && ch.is_healthy() && !ch.auto_delete().await;
        self.lock().checked_out.remove(&id);
        if keep {
            ch.reset().await;
            self.lock().free.insert(id, ch);
            tracing::debug!(local_id = id, "channel returned to pool");
        } else {
            if let Err(e) = ch.transport().close().await {
                tracing::debug!(local_id = id, error = %e, "broker channel close failed");
            }
            self.lock().ids.release_id(id);
            tracing::debug!(local_id = id, "channel discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Headers;
    use crate::name::NameTrio;
    use crate::transport::QueueOptions;

    async fn local_node(broker: &Arc<Broker>) -> Node {
        Node::start_with_broker(Config::default(), broker.clone())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pooled_channel_is_reused() {
        let broker = Broker::new();
        let node = local_node(&broker).await;
        let mut numbers = Vec::new();
        for _ in 0..5 {
            let ch = node.channel(ChannelKind::Bidir).await.unwrap();
            assert_eq!(node.checked_out().len(), 1);
            numbers.push(ch.transport().channel_number());
            ch.close().await.unwrap();
        }
        assert!(numbers.windows(2).all(|w| w[0] == w[1]));
        let stats = node.pool_stats();
        assert_eq!(stats.pooled, 1);
        assert_eq!(stats.checked_out, 0);
        assert!(node.checked_out().is_empty());
    }

    #[tokio::test]
    async fn concurrent_checkouts_get_distinct_ids() {
        let broker = Broker::new();
        let node = local_node(&broker).await;
        let a = node.channel(ChannelKind::Bidir).await.unwrap();
        let b = node.channel(ChannelKind::Bidir).await.unwrap();
        assert_ne!(a.local_id(), b.local_id());
        assert_eq!(node.checked_out().len(), 2);
        a.close().await.unwrap();
        b.close().await.unwrap();
        assert_eq!(node.pool_stats().pooled, 2);
        assert!(node.checked_out().is_empty());
    }

    #[tokio::test]
    async fn auto_delete_channel_is_discarded() {
        let broker = Broker::new();
        let node = local_node(&broker).await;
        let ch = node.channel(ChannelKind::Bidir).await.unwrap();
        ch.set_queue_options(QueueOptions {
            auto_delete: true,
            ..QueueOptions::default()
        })
        .await;
        let transport = ch.transport().clone();
        ch.close().await.unwrap();
        assert!(!transport.is_open());
        assert_eq!(node.pool_stats().pooled, 0);
        assert_eq!(node.pool_stats().ids_in_use, 0);
    }

    #[tokio::test]
    async fn unhealthy_channel_is_replaced() {
        let broker = Broker::new();
        let node = local_node(&broker).await;
        let ch = node.channel(ChannelKind::Bidir).await.unwrap();
        let first_id = ch.local_id();
        ch.close().await.unwrap();
        assert_eq!(node.pool_stats().pooled, 1);

        // take it again and break it from the broker side while it sits in the pool
        let ch = node.channel(ChannelKind::Bidir).await.unwrap();
        let number = ch.transport().channel_number();
        ch.close().await.unwrap();
        // the node holds the first connection made on this broker
        broker.kill_channel(1, number);

        let fresh = node.channel(ChannelKind::Bidir).await.unwrap();
        assert!(fresh.is_healthy());
        assert_ne!(fresh.transport().channel_number(), number);
        assert_eq!(fresh.local_id(), first_id);
    }

    #[tokio::test]
    async fn channel_broken_in_use_is_not_pooled() {
        let broker = Broker::new();
        let node = local_node(&broker).await;
        let ch = node.channel(ChannelKind::Bidir).await.unwrap();
        ch.connect(NameTrio::with_queue("missing-exchange", "q"))
            .await
            .unwrap();
        assert!(ch.send(vec![1], Headers::new()).await.is_err());
        ch.close().await.unwrap();
        assert_eq!(node.pool_stats().pooled, 0);
    }

    #[tokio::test]
    async fn non_pooled_kinds_open_fresh() {
        let broker = Broker::new();
        let node = local_node(&broker).await;
        let a = node.channel(ChannelKind::Send).await.unwrap();
        let b = node.channel(ChannelKind::Send).await.unwrap();
        assert_ne!(a.transport().channel_number(), b.transport().channel_number());
        assert_eq!(a.local_id(), None);
        a.close().await.unwrap();
        assert!(!a.transport().is_open());
        assert_eq!(node.pool_stats().pooled, 0);
    }

    #[tokio::test]
    async fn startup_tolerates_partial_failure() {
        let broker = Broker::new();
        let mut config = Config::default();
        config.broker.urls = vec!["127.0.0.1:1".into(), "local".into()];
        config.broker.ready_timeout_secs = 1;
        let node = Node::start_with_broker(config, broker).await.unwrap();
        assert!(node.channel(ChannelKind::Send).await.is_ok());
    }

    #[tokio::test]
    async fn startup_without_any_broker_fails() {
        let mut config = Config::default();
        config.broker.urls = vec!["127.0.0.1:1".into()];
        config.broker.ready_timeout_secs = 1;
        assert!(matches!(
            Node::start(config).await,
            Err(ContainerError::NoConnection(_))
        ));
    }

    #[tokio::test]
    async fn stop_closes_pool_and_refuses_channels() {
        let broker = Broker::new();
        let node = local_node(&broker).await;
        let ch = node.channel(ChannelKind::Bidir).await.unwrap();
        ch.close().await.unwrap();
        node.stop().await;
        node.stop().await;
        assert!(node.channel(ChannelKind::Bidir).await.is_err());
        assert_eq!(node.pool_stats().pooled, 0);
    }

    #[test]
    fn conversation_ids_rooted_at_container() {
        let conn: Arc<dyn Connection> = Arc::new(Broker::new().connect());
        let node = Node::from_connections(Config::default(), vec![conn]);
        let id = node.conversation_ids().next_id();
        assert!(id.starts_with(node.container_id()));
        assert!(id.ends_with("-1"));
    }
}
