//! In-process broker with AMQP-like semantics.
//!
//! Exchanges (direct, fanout, topic), queues, bindings and consumers live in one shared state
//! behind a mutex. Errors that AMQP treats as channel exceptions (unknown exchange on publish,
//! redeclare with a different type, bad delivery tag, locked exclusive queue) close the
//! offending broker channel, which then reports itself unhealthy.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::header::Headers;
use crate::transport::{
    CancelPolicy, Connection, Delivery, DeliveryCallback, ExchangeKind, PublishOptions,
    QueueOptions, QueueStats, Transport, TransportError,
};

/// Highest channel number a connection hands out (AMQP default channel-max).
pub const MAX_CHANNELS: u16 = 2047;

type ChannelKey = (u64, u16);

/// Shared broker state. Cheap to clone through `Arc`; every connection holds one.
pub struct Broker {
    state: Mutex<BrokerState>,
    next_connection: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    consumers: HashMap<String, Consumer>,
    channels: HashMap<ChannelKey, ChannelEntry>,
    next_consumer: u64,
}

struct Exchange {
    kind: ExchangeKind,
    auto_delete: bool,
    /// (queue, binding key)
    bindings: Vec<(String, String)>,
}

struct Queue {
    options: QueueOptions,
    owner: Option<u64>,
    messages: VecDeque<Stored>,
    consumers: Vec<String>,
    exclusive_consumer: bool,
    cursor: usize,
}

#[derive(Clone)]
struct Stored {
    body: Vec<u8>,
    headers: Headers,
    routing_key: String,
    redelivered: bool,
}

struct Consumer {
    queue: String,
    channel: ChannelKey,
    callback: DeliveryCallback,
    no_ack: bool,
}

#[derive(Default)]
struct ChannelEntry {
    next_tag: u64,
    unacked: BTreeMap<u64, (String, Stored)>,
}

impl Broker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            next_connection: AtomicU64::new(1),
        })
    }

    /// Open a new connection to this broker.
    pub fn connect(self: &Arc<Self>) -> LocalConnection {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection = id, "local broker connection opened");
        LocalConnection {
            broker: self.clone(),
            id,
            next_number: AtomicU16::new(1),
            open: AtomicBool::new(true),
            policy: CancelPolicy::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Close one broker channel from the broker side, as a channel exception would.
    pub fn kill_channel(&self, connection: u64, number: u16) {
        self.lock().close_channel((connection, number));
    }

    fn register_channel(&self, key: ChannelKey) {
        self.lock().channels.insert(key, ChannelEntry::default());
    }

    fn channel_open(&self, key: ChannelKey) -> bool {
        self.lock().channels.contains_key(&key)
    }

    fn close_connection(&self, connection: u64) {
        let mut state = self.lock();
        let keys: Vec<ChannelKey> = state
            .channels
            .keys()
            .filter(|(c, _)| *c == connection)
            .copied()
            .collect();
        for key in keys {
            state.close_channel(key);
        }
        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            state.remove_queue(&name);
        }
    }
}

/// Topic match: words split on `.`, `*` matches one word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) => (word == "*" || word == k) && match_words(rest, key_rest),
            None => false,
        },
    }
}

impl BrokerState {
    fn check(&self, key: ChannelKey) -> Result<(), TransportError> {
        if self.channels.contains_key(&key) {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed(key.1))
        }
    }

    /// Channel exception: close the channel and hand the error back.
    fn fail(&mut self, key: ChannelKey, err: TransportError) -> TransportError {
        tracing::debug!(connection = key.0, channel = key.1, error = %err, "closing broker channel on error");
        self.close_channel(key);
        err
    }

    fn declare_exchange(
        &mut self,
        key: ChannelKey,
        name: &str,
        kind: ExchangeKind,
        auto_delete: bool,
    ) -> Result<(), TransportError> {
        self.check(key)?;
        if name.is_empty() {
            return Ok(());
        }
        if let Some(existing) = self.exchanges.get(name) {
            if existing.kind != kind {
                let msg = format!(
                    "exchange {} is {}, redeclared as {}",
                    name, existing.kind, kind
                );
                return Err(self.fail(key, TransportError::PreconditionFailed(msg)));
            }
            return Ok(());
        }
        self.exchanges.insert(
            name.to_string(),
            Exchange {
                kind,
                auto_delete,
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    fn declare_queue(
        &mut self,
        key: ChannelKey,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, TransportError> {
        self.check(key)?;
        let name = if name.is_empty() {
            format!("amq.gen-{:016x}", rand::random::<u64>())
        } else {
            name.to_string()
        };
        if let Some(existing) = self.queues.get(&name) {
            if let Some(owner) = existing.owner {
                if owner != key.0 {
                    let err = TransportError::ResourceLocked(format!("queue {} is exclusive", name));
                    return Err(self.fail(key, err));
                }
            }
            return Ok(name);
        }
        self.queues.insert(
            name.clone(),
            Queue {
                options,
                owner: options.exclusive.then_some(key.0),
                messages: VecDeque::new(),
                consumers: Vec::new(),
                exclusive_consumer: false,
                cursor: 0,
            },
        );
        Ok(name)
    }

    fn remove_queue(&mut self, name: &str) {
        let Some(queue) = self.queues.remove(name) else {
            return;
        };
        for tag in queue.consumers {
            self.consumers.remove(&tag);
        }
        let mut emptied = Vec::new();
        for (ex_name, exchange) in self.exchanges.iter_mut() {
            let before = exchange.bindings.len();
            exchange.bindings.retain(|(q, _)| q != name);
            if exchange.auto_delete && before > 0 && exchange.bindings.is_empty() {
                emptied.push(ex_name.clone());
            }
        }
        for ex in emptied {
            self.exchanges.remove(&ex);
        }
    }

    fn bind(
        &mut self,
        key: ChannelKey,
        exchange: &str,
        queue: &str,
        binding: &str,
    ) -> Result<(), TransportError> {
        self.check(key)?;
        if !self.queues.contains_key(queue) {
            return Err(self.fail(key, not_found("queue", queue)));
        }
        let Some(ex) = self.exchanges.get_mut(exchange) else {
            return Err(self.fail(key, not_found("exchange", exchange)));
        };
        let entry = (queue.to_string(), binding.to_string());
        if !ex.bindings.contains(&entry) {
            ex.bindings.push(entry);
        }
        Ok(())
    }

    fn unbind(
        &mut self,
        key: ChannelKey,
        exchange: &str,
        queue: &str,
        binding: &str,
    ) -> Result<(), TransportError> {
        self.check(key)?;
        let Some(ex) = self.exchanges.get_mut(exchange) else {
            return Err(self.fail(key, not_found("exchange", exchange)));
        };
        ex.bindings.retain(|(q, b)| !(q == queue && b == binding));
        if ex.auto_delete && ex.bindings.is_empty() {
            self.exchanges.remove(exchange);
        }
        Ok(())
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Option<Vec<String>> {
        if exchange.is_empty() {
            return Some(
                self.queues
                    .contains_key(routing_key)
                    .then(|| routing_key.to_string())
                    .into_iter()
                    .collect(),
            );
        }
        let ex = self.exchanges.get(exchange)?;
        let mut targets: Vec<String> = Vec::new();
        for (queue, binding) in &ex.bindings {
            let hit = match ex.kind {
                ExchangeKind::Direct => binding == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(binding, routing_key),
            };
            if hit && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Some(targets)
    }

    fn publish(
        &mut self,
        key: ChannelKey,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: Headers,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        self.check(key)?;
        let Some(targets) = self.route(exchange, routing_key) else {
            return Err(self.fail(key, not_found("exchange", exchange)));
        };
        if targets.is_empty() {
            if options.mandatory {
                return Err(TransportError::Unroutable {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }
            tracing::debug!(exchange, routing_key, "message dropped, no bound queue");
            return Ok(());
        }
        let stored = Stored {
            body,
            headers,
            routing_key: routing_key.to_string(),
            redelivered: false,
        };
        for queue in &targets {
            if let Some(q) = self.queues.get_mut(queue) {
                q.messages.push_back(stored.clone());
            }
        }
        for queue in &targets {
            self.dispatch(queue);
        }
        Ok(())
    }

    /// Hand queued messages to consumers, round-robin. Callbacks run under the state lock so
    /// delivery order matches queue order.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }
            let tag = queue.consumers[queue.cursor % queue.consumers.len()].clone();
            queue.cursor = queue.cursor.wrapping_add(1);
            let Some(msg) = queue.messages.pop_front() else {
                return;
            };
            let Some(consumer) = self.consumers.get(&tag) else {
                queue.consumers.retain(|t| *t != tag);
                queue.messages.push_front(msg);
                continue;
            };
            let Some(channel) = self.channels.get_mut(&consumer.channel) else {
                if let Some(q) = self.queues.get_mut(queue_name) {
                    q.messages.push_front(msg);
                }
                return;
            };
            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;
            if !consumer.no_ack {
                channel
                    .unacked
                    .insert(delivery_tag, (queue_name.to_string(), msg.clone()));
            }
            (consumer.callback)(Delivery {
                body: msg.body,
                headers: msg.headers,
                delivery_tag,
                routing_key: msg.routing_key,
                redelivered: msg.redelivered,
            });
        }
    }

    fn start_consume(
        &mut self,
        key: ChannelKey,
        callback: DeliveryCallback,
        queue: &str,
        no_ack: bool,
        exclusive: bool,
    ) -> Result<String, TransportError> {
        self.check(key)?;
        let Some(q) = self.queues.get(queue) else {
            return Err(self.fail(key, not_found("queue", queue)));
        };
        if q.exclusive_consumer || (exclusive && !q.consumers.is_empty()) {
            let err = TransportError::ResourceLocked(format!("queue {} has an exclusive consumer", queue));
            return Err(self.fail(key, err));
        }
        self.next_consumer += 1;
        let tag = format!("ctag-{}.{}-{}", key.0, key.1, self.next_consumer);
        self.consumers.insert(
            tag.clone(),
            Consumer {
                queue: queue.to_string(),
                channel: key,
                callback,
                no_ack,
            },
        );
        if let Some(q) = self.queues.get_mut(queue) {
            q.consumers.push(tag.clone());
            q.exclusive_consumer = exclusive;
        }
        self.dispatch(queue);
        Ok(tag)
    }

    fn cancel_consumer(&mut self, key: ChannelKey, tag: &str) -> Result<(), TransportError> {
        self.check(key)?;
        self.drop_consumer(tag);
        Ok(())
    }

    fn drop_consumer(&mut self, tag: &str) {
        let Some(consumer) = self.consumers.remove(tag) else {
            return;
        };
        let mut delete = false;
        if let Some(q) = self.queues.get_mut(&consumer.queue) {
            q.consumers.retain(|t| t != tag);
            if q.consumers.is_empty() {
                q.exclusive_consumer = false;
                delete = q.options.auto_delete;
            }
        }
        if delete {
            tracing::debug!(queue = %consumer.queue, "auto-delete queue lost its last consumer");
            self.remove_queue(&consumer.queue);
        }
    }

    fn ack(&mut self, key: ChannelKey, delivery_tag: u64) -> Result<(), TransportError> {
        self.check(key)?;
        let removed = self
            .channels
            .get_mut(&key)
            .and_then(|c| c.unacked.remove(&delivery_tag));
        match removed {
            Some(_) => Ok(()),
            None => Err(self.fail(key, TransportError::UnknownDeliveryTag(delivery_tag))),
        }
    }

    fn reject(
        &mut self,
        key: ChannelKey,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), TransportError> {
        self.check(key)?;
        let removed = self
            .channels
            .get_mut(&key)
            .and_then(|c| c.unacked.remove(&delivery_tag));
        let Some((queue, mut msg)) = removed else {
            return Err(self.fail(key, TransportError::UnknownDeliveryTag(delivery_tag)));
        };
        if requeue {
            if let Some(q) = self.queues.get_mut(&queue) {
                msg.redelivered = true;
                q.messages.push_front(msg);
            }
            self.dispatch(&queue);
        }
        Ok(())
    }

    fn queue_stats(&mut self, key: ChannelKey, queue: &str) -> Result<QueueStats, TransportError> {
        self.check(key)?;
        match self.queues.get(queue) {
            Some(q) => Ok(QueueStats {
                message_count: q.messages.len() as u32,
                consumer_count: q.consumers.len() as u32,
            }),
            None => Err(self.fail(key, not_found("queue", queue))),
        }
    }

    fn purge(&mut self, key: ChannelKey, queue: &str) -> Result<u32, TransportError> {
        self.check(key)?;
        match self.queues.get_mut(queue) {
            Some(q) => {
                let n = q.messages.len() as u32;
                q.messages.clear();
                Ok(n)
            }
            None => Err(self.fail(key, not_found("queue", queue))),
        }
    }

    /// Drop a channel: its consumers go away and unacked messages return to their queues.
    fn close_channel(&mut self, key: ChannelKey) {
        let Some(entry) = self.channels.remove(&key) else {
            return;
        };
        let mut touched: Vec<String> = Vec::new();
        for (_, (queue, mut msg)) in entry.unacked.into_iter().rev() {
            if let Some(q) = self.queues.get_mut(&queue) {
                msg.redelivered = true;
                q.messages.push_front(msg);
                if !touched.contains(&queue) {
                    touched.push(queue);
                }
            }
        }
        let tags: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.channel == key)
            .map(|(t, _)| t.clone())
            .collect();
        for tag in tags {
            self.drop_consumer(&tag);
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }
}

fn not_found(kind: &str, name: &str) -> TransportError {
    TransportError::NotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

/// Connection to a [`Broker`] in the same process.
pub struct LocalConnection {
    broker: Arc<Broker>,
    id: u64,
    next_number: AtomicU16,
    open: AtomicBool,
    policy: CancelPolicy,
}

impl LocalConnection {
    /// Cancel-confirmation policy given to every channel opened afterwards.
    pub fn with_cancel_policy(mut self, policy: CancelPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Open a channel with its concrete type, for callers that need the broker-side key.
    pub fn open_local_channel(&self) -> Result<Arc<LocalChannel>, TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionLost(self.describe()));
        }
        let number = self.next_number.fetch_add(1, Ordering::Relaxed);
        if number == 0 || number > MAX_CHANNELS {
            return Err(TransportError::ChannelsExhausted);
        }
        let key = (self.id, number);
        self.broker.register_channel(key);
        Ok(Arc::new(LocalChannel {
            broker: self.broker.clone(),
            key,
            open: AtomicBool::new(true),
            policy: self.policy,
        }))
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn describe(&self) -> String {
        format!("local#{}", self.id)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn open_channel(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let channel: Arc<dyn Transport> = self.open_local_channel()?;
        Ok(channel)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.open.swap(false, Ordering::AcqRel) {
            self.broker.close_connection(self.id);
            tracing::debug!(connection = self.id, "local broker connection closed");
        }
        Ok(())
    }
}

/// One broker channel on a [`LocalConnection`].
pub struct LocalChannel {
    broker: Arc<Broker>,
    key: ChannelKey,
    open: AtomicBool,
    policy: CancelPolicy,
}

impl LocalChannel {
    fn state(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::ChannelClosed(self.key.1));
        }
        Ok(self.broker.lock())
    }
}

#[async_trait]
impl Transport for LocalChannel {
    fn channel_number(&self) -> u16 {
        self.key.1
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.broker.channel_open(self.key)
    }

    fn is_healthy(&self) -> bool {
        self.is_open()
    }

    fn cancel_policy(&self) -> CancelPolicy {
        self.policy
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        _durable: bool,
        auto_delete: bool,
    ) -> Result<(), TransportError> {
        self.state()?
            .declare_exchange(self.key, exchange, kind, auto_delete)
    }

    async fn delete_exchange(&self, exchange: &str) -> Result<(), TransportError> {
        let mut state = self.state()?;
        state.check(self.key)?;
        state.exchanges.remove(exchange);
        Ok(())
    }

    async fn declare_queue(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<String, TransportError> {
        self.state()?.declare_queue(self.key, queue, options)
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError> {
        let mut state = self.state()?;
        state.check(self.key)?;
        state.remove_queue(queue);
        Ok(())
    }

    async fn bind(&self, exchange: &str, queue: &str, binding: &str) -> Result<(), TransportError> {
        self.state()?.bind(self.key, exchange, queue, binding)
    }

    async fn unbind(
        &self,
        exchange: &str,
        queue: &str,
        binding: &str,
    ) -> Result<(), TransportError> {
        self.state()?.unbind(self.key, exchange, queue, binding)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: Headers,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        self.state()?
            .publish(self.key, exchange, routing_key, body, headers, options)
    }

    async fn start_consume(
        &self,
        callback: DeliveryCallback,
        queue: &str,
        no_ack: bool,
        exclusive: bool,
    ) -> Result<String, TransportError> {
        self.state()?
            .start_consume(self.key, callback, queue, no_ack, exclusive)
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.state()?.cancel_consumer(self.key, consumer_tag)
    }

    async fn consumer_active(&self, consumer_tag: &str) -> Result<bool, TransportError> {
        Ok(self.broker.lock().consumers.contains_key(consumer_tag))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.state()?.ack(self.key, delivery_tag)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.state()?.reject(self.key, delivery_tag, requeue)
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, TransportError> {
        self.state()?.queue_stats(self.key, queue)
    }

    async fn purge(&self, queue: &str) -> Result<u32, TransportError> {
        self.state()?.purge(self.key, queue)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.open.swap(false, Ordering::AcqRel) {
            self.broker.lock().close_channel(self.key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn collector() -> (DeliveryCallback, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cb: DeliveryCallback = Arc::new(move |d| {
            let _ = tx.send(d);
        });
        (cb, rx)
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("a.*.c", "a.b.c"));
        assert!(!topic_matches("a.*.c", "a.b.b.c"));
        assert!(topic_matches("a.#", "a"));
        assert!(topic_matches("a.#", "a.b.c"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("*.x.#", "q.x"));
        assert!(!topic_matches("a.b", "a"));
    }

    #[tokio::test]
    async fn publish_and_consume_in_order() {
        let broker = Broker::new();
        let conn = broker.connect();
        let ch = conn.open_channel().await.unwrap();
        ch.declare_exchange("ex", ExchangeKind::Topic, false, false)
            .await
            .unwrap();
        let q = ch.declare_queue("", QueueOptions::default()).await.unwrap();
        assert!(q.starts_with("amq.gen-"));
        ch.bind("ex", &q, "k.*").await.unwrap();
        let (cb, mut rx) = collector();
        ch.start_consume(cb, &q, false, false).await.unwrap();
        for i in 0..3u8 {
            ch.publish("ex", "k.x", vec![i], Headers::new(), PublishOptions::default())
                .await
                .unwrap();
        }
        for i in 0..3u8 {
            let d = rx.recv().await.unwrap();
            assert_eq!(d.body, vec![i]);
            ch.ack(d.delivery_tag).await.unwrap();
        }
    }

    #[tokio::test]
    async fn publish_to_missing_exchange_closes_channel() {
        let broker = Broker::new();
        let conn = broker.connect();
        let ch = conn.open_channel().await.unwrap();
        let err = ch
            .publish("nope", "k", vec![], Headers::new(), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotFound { .. }));
        assert!(!ch.is_healthy());
        assert!(matches!(
            ch.declare_queue("q", QueueOptions::default()).await,
            Err(TransportError::ChannelClosed(_))
        ));
    }

    #[tokio::test]
    async fn mandatory_publish_reports_unroutable() {
        let broker = Broker::new();
        let conn = broker.connect();
        let ch = conn.open_channel().await.unwrap();
        ch.declare_exchange("ex", ExchangeKind::Direct, false, false)
            .await
            .unwrap();
        let opts = PublishOptions {
            durable: false,
            mandatory: true,
        };
        let err = ch
            .publish("ex", "nobody", vec![1], Headers::new(), opts)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unroutable { .. }));
        assert!(ch.is_healthy());
    }

    #[tokio::test]
    async fn unacked_messages_requeue_on_channel_close() {
        let broker = Broker::new();
        let conn = broker.connect();
        let a = conn.open_channel().await.unwrap();
        a.declare_queue("work", QueueOptions::default()).await.unwrap();
        let (cb, mut rx) = collector();
        a.start_consume(cb, "work", false, false).await.unwrap();
        a.publish("", "work", b"job".to_vec(), Headers::new(), PublishOptions::default())
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert!(!first.redelivered);
        a.close().await.unwrap();

        let b = conn.open_channel().await.unwrap();
        let (cb, mut rx) = collector();
        b.start_consume(cb, "work", false, false).await.unwrap();
        let again = rx.recv().await.unwrap();
        assert_eq!(again.body, b"job".to_vec());
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn reject_with_requeue_redelivers() {
        let broker = Broker::new();
        let conn = broker.connect();
        let ch = conn.open_channel().await.unwrap();
        ch.declare_queue("q", QueueOptions::default()).await.unwrap();
        let (cb, mut rx) = collector();
        ch.start_consume(cb, "q", false, false).await.unwrap();
        ch.publish("", "q", vec![7], Headers::new(), PublishOptions::default())
            .await
            .unwrap();
        let d = rx.recv().await.unwrap();
        ch.reject(d.delivery_tag, true).await.unwrap();
        let d2 = rx.recv().await.unwrap();
        assert!(d2.redelivered);
        ch.reject(d2.delivery_tag, false).await.unwrap();
        assert_eq!(ch.queue_stats("q").await.unwrap().message_count, 0);
    }

    #[tokio::test]
    async fn auto_delete_queue_removed_after_last_consumer() {
        let broker = Broker::new();
        let conn = broker.connect();
        let ch = conn.open_channel().await.unwrap();
        let opts = QueueOptions {
            auto_delete: true,
            ..QueueOptions::default()
        };
        ch.declare_queue("temp", opts).await.unwrap();
        let (cb, _rx) = collector();
        let tag = ch.start_consume(cb, "temp", false, false).await.unwrap();
        assert!(broker.queue_exists("temp"));
        ch.stop_consume(&tag).await.unwrap();
        assert!(!broker.queue_exists("temp"));
    }

    #[tokio::test]
    async fn exclusive_queue_locked_to_owner_connection() {
        let broker = Broker::new();
        let c1 = broker.connect();
        let c2 = broker.connect();
        let a = c1.open_channel().await.unwrap();
        let opts = QueueOptions {
            exclusive: true,
            ..QueueOptions::default()
        };
        a.declare_queue("mine", opts).await.unwrap();
        let b = c2.open_channel().await.unwrap();
        assert!(matches!(
            b.declare_queue("mine", opts).await,
            Err(TransportError::ResourceLocked(_))
        ));
        c1.close().await.unwrap();
        assert!(!broker.queue_exists("mine"));
    }

    #[tokio::test]
    async fn exchange_type_mismatch_is_precondition_failure() {
        let broker = Broker::new();
        let conn = broker.connect();
        let ch = conn.open_channel().await.unwrap();
        ch.declare_exchange("ex", ExchangeKind::Topic, false, false)
            .await
            .unwrap();
        assert!(matches!(
            ch.declare_exchange("ex", ExchangeKind::Fanout, false, false)
                .await,
            Err(TransportError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn double_close_is_harmless() {
        let broker = Broker::new();
        let conn = broker.connect();
        let ch = conn.open_channel().await.unwrap();
        ch.close().await.unwrap();
        ch.close().await.unwrap();
        assert!(!ch.is_open());
    }
}
