//! Channels: the unit callers send and receive on.
//!
//! A [`Channel`] wraps one broker channel ([`Transport`]) and an in-process receive queue.
//! Broker deliveries are pushed onto the queue by the consumer callback; `recv` pops them in
//! order. `close` pushes a shutdown sentinel so a task blocked in `recv` always wakes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::header::{self, Headers};
use crate::name::NameTrio;
use crate::transport::{
    Delivery, DeliveryCallback, ExchangeKind, PublishOptions, QueueOptions, QueueStats, Transport,
    TransportError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Publish only.
    Send,
    /// Consume only.
    Recv,
    /// Consume on its own address, publish to a connected peer. Pooled by the node.
    Bidir,
    /// Server side: consume on a well-known address and `accept` per-client channels.
    Listen,
    /// Created by `accept`; shares the listening channel's broker channel.
    Accepted,
}

impl ChannelKind {
    pub fn can_send(self) -> bool {
        matches!(self, ChannelKind::Send | ChannelKind::Bidir | ChannelKind::Accepted)
    }

    pub fn can_listen(self) -> bool {
        matches!(self, ChannelKind::Recv | ChannelKind::Bidir | ChannelKind::Listen)
    }
}

/// Where a channel is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unconfigured,
    Connected,
    Listening,
    Consuming,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("channel has no {0} address configured")]
    NotConfigured(&'static str),
    #[error("channel is already consuming")]
    AlreadyConsuming,
    #[error("{kind:?} channel does not support {op}")]
    Unsupported { kind: ChannelKind, op: &'static str },
    #[error("first message carries no usable reply-to header")]
    MissingReplyTo,
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("receive timed out after {0:?}")]
    Timeout(Duration),
}

enum Inbound {
    Message(Delivery),
    Shutdown,
}

/// Called when a pooled channel is closed, instead of closing the broker channel.
#[async_trait]
pub trait Releaser: Send + Sync {
    async fn release(&self, channel: Arc<Channel>);
}

struct Addressing {
    send_name: Option<NameTrio>,
    recv_name: Option<NameTrio>,
    consumer_tag: Option<String>,
    queue_options: QueueOptions,
    exchange_kind: ExchangeKind,
}

impl Default for Addressing {
    fn default() -> Self {
        Self {
            send_name: None,
            recv_name: None,
            consumer_tag: None,
            queue_options: QueueOptions::default(),
            exchange_kind: ExchangeKind::Topic,
        }
    }
}

pub struct Channel {
    kind: ChannelKind,
    transport: Arc<dyn Transport>,
    /// Accepted channels borrow their parent's broker channel and never close it.
    shares_transport: bool,
    local_id: Option<u32>,
    releaser: Option<Weak<dyn Releaser>>,
    max_message_size: usize,
    addressing: Mutex<Addressing>,
    inbox_tx: StdMutex<mpsc::UnboundedSender<Inbound>>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    closed: AtomicBool,
}

impl Channel {
    pub fn new(kind: ChannelKind, transport: Arc<dyn Transport>, max_message_size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            kind,
            transport,
            shares_transport: false,
            local_id: None,
            releaser: None,
            max_message_size,
            addressing: Mutex::new(Addressing::default()),
            inbox_tx: StdMutex::new(tx),
            inbox_rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    /// Mark as pooled: `close` hands the channel to `releaser` under `local_id`.
    pub fn pooled(mut self, local_id: u32, releaser: Weak<dyn Releaser>) -> Self {
        self.local_id = Some(local_id);
        self.releaser = Some(releaser);
        self
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn local_id(&self) -> Option<u32> {
        self.local_id
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.transport.is_healthy()
    }

    pub async fn state(&self) -> ChannelState {
        if self.is_closed() {
            return ChannelState::Closed;
        }
        let a = self.addressing.lock().await;
        if a.consumer_tag.is_some() {
            ChannelState::Consuming
        } else if a.recv_name.is_some() {
            ChannelState::Listening
        } else if a.send_name.is_some() {
            ChannelState::Connected
        } else {
            ChannelState::Unconfigured
        }
    }

    /// Queue flags used by the next `setup_listener`.
    pub async fn set_queue_options(&self, options: QueueOptions) {
        self.addressing.lock().await.queue_options = options;
    }

    pub async fn set_exchange_kind(&self, kind: ExchangeKind) {
        self.addressing.lock().await.exchange_kind = kind;
    }

    pub async fn auto_delete(&self) -> bool {
        self.addressing.lock().await.queue_options.auto_delete
    }

    /// Resolved receive address, once listening.
    pub async fn recv_name(&self) -> Option<NameTrio> {
        self.addressing.lock().await.recv_name.clone()
    }

    pub async fn send_name(&self) -> Option<NameTrio> {
        self.addressing.lock().await.send_name.clone()
    }

    fn check_open(&self) -> Result<(), ChannelError> {
        if self.is_closed() {
            Err(ChannelError::Closed)
        } else {
            Ok(())
        }
    }

    /// Set the default destination for `send`.
    pub async fn connect(&self, name: NameTrio) -> Result<(), ChannelError> {
        self.check_open()?;
        if !self.kind.can_send() {
            return Err(ChannelError::Unsupported {
                kind: self.kind,
                op: "connect",
            });
        }
        self.addressing.lock().await.send_name = Some(name);
        Ok(())
    }

    /// Declare the exchange and queue for `name` and bind them. The queue is anonymous when
    /// `name` has no queue part, otherwise namespaced under the exchange. The binding is
    /// `binding`, else the name's explicit binding, else the resolved queue name. A second call
    /// returns the address from the first.
    pub async fn setup_listener(
        &self,
        name: &NameTrio,
        binding: Option<&str>,
    ) -> Result<NameTrio, ChannelError> {
        self.check_open()?;
        if !self.kind.can_listen() {
            return Err(ChannelError::Unsupported {
                kind: self.kind,
                op: "setup_listener",
            });
        }
        let mut a = self.addressing.lock().await;
        if let Some(existing) = &a.recv_name {
            return Ok(existing.clone());
        }
        let exchange = name.exchange();
        self.transport
            .declare_exchange(exchange, a.exchange_kind, false, false)
            .await?;
        let requested = name.qualified_queue().unwrap_or_default();
        let queue = self
            .transport
            .declare_queue(&requested, a.queue_options)
            .await?;
        let bind_key = binding
            .or(name.explicit_binding())
            .map(String::from)
            .unwrap_or_else(|| queue.clone());
        self.transport.bind(exchange, &queue, &bind_key).await?;
        let resolved = NameTrio::new(
            exchange,
            Some(queue.clone()),
            (bind_key != queue).then_some(bind_key),
        );
        tracing::debug!(name = %resolved, "listener set up");
        a.recv_name = Some(resolved.clone());
        Ok(resolved)
    }

    /// Register the broker consumer that feeds `recv`.
    pub async fn start_consume(&self) -> Result<(), ChannelError> {
        self.check_open()?;
        let mut a = self.addressing.lock().await;
        if a.consumer_tag.is_some() {
            return Err(ChannelError::AlreadyConsuming);
        }
        let queue = a
            .recv_name
            .as_ref()
            .and_then(|n| n.queue().map(String::from))
            .ok_or(ChannelError::NotConfigured("receive"))?;
        let tx = self
            .inbox_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let callback: DeliveryCallback = Arc::new(move |mut d: Delivery| {
            d.headers
                .insert(header::ROUTING_KEY.to_string(), d.routing_key.clone());
            let _ = tx.send(Inbound::Message(d));
        });
        let tag = self
            .transport
            .start_consume(callback, &queue, false, false)
            .await?;
        a.consumer_tag = Some(tag);
        Ok(())
    }

    /// Cancel the consumer and wait for the broker to confirm. No-op when not consuming.
    pub async fn stop_consume(&self) -> Result<(), ChannelError> {
        let tag = self.addressing.lock().await.consumer_tag.take();
        if let Some(tag) = tag {
            self.transport.stop_consume(&tag).await?;
        }
        Ok(())
    }

    pub async fn is_consuming(&self) -> bool {
        self.addressing.lock().await.consumer_tag.is_some()
    }

    /// Publish to the connected destination. Bidirectional channels stamp `reply-to` with their
    /// own receive address.
    pub async fn send(&self, body: Vec<u8>, headers: Headers) -> Result<(), ChannelError> {
        let name = self
            .send_name()
            .await
            .ok_or(ChannelError::NotConfigured("send"))?;
        self.send_to(&name, body, headers).await
    }

    /// Publish to an explicit destination.
    pub async fn send_to(
        &self,
        name: &NameTrio,
        body: Vec<u8>,
        headers: Headers,
    ) -> Result<(), ChannelError> {
        self.publish(name, body, headers, PublishOptions::default())
            .await
    }

    /// Publish, failing with `Unroutable` when nothing is bound at `name`.
    pub async fn send_mandatory(
        &self,
        name: &NameTrio,
        body: Vec<u8>,
        headers: Headers,
    ) -> Result<(), ChannelError> {
        let options = PublishOptions {
            durable: false,
            mandatory: true,
        };
        self.publish(name, body, headers, options).await
    }

    async fn publish(
        &self,
        name: &NameTrio,
        body: Vec<u8>,
        mut headers: Headers,
        options: PublishOptions,
    ) -> Result<(), ChannelError> {
        self.check_open()?;
        if !self.kind.can_send() {
            return Err(ChannelError::Unsupported {
                kind: self.kind,
                op: "send",
            });
        }
        if body.len() > self.max_message_size {
            return Err(ChannelError::TooLarge {
                size: body.len(),
                max: self.max_message_size,
            });
        }
        if self.kind == ChannelKind::Bidir && !headers.contains_key(header::REPLY_TO) {
            if let Some(own) = self.recv_name().await {
                headers.insert(header::REPLY_TO.to_string(), own.to_header_value());
            }
        }
        let routing_key = name.routing_key().unwrap_or_default();
        self.transport
            .publish(name.exchange(), &routing_key, body, headers, options)
            .await?;
        Ok(())
    }

    /// Wait for the next delivery. Fails with [`ChannelError::Closed`] once the channel closes.
    pub async fn recv(&self) -> Result<Delivery, ChannelError> {
        let mut rx = self.inbox_rx.lock().await;
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        match rx.recv().await {
            Some(Inbound::Message(d)) => Ok(d),
            Some(Inbound::Shutdown) | None => {
                tracing::debug!(kind = ?self.kind, "recv woke on closed channel");
                Err(ChannelError::Closed)
            }
        }
    }

    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Delivery, ChannelError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| ChannelError::Timeout(timeout))?
    }

    pub async fn ack(&self, delivery_tag: u64) -> Result<(), ChannelError> {
        self.transport.ack(delivery_tag).await?;
        Ok(())
    }

    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError> {
        self.transport.reject(delivery_tag, requeue).await?;
        Ok(())
    }

    /// Take one message off a listening channel and spin up a channel for its sender. The new
    /// channel shares this broker channel, sends to the message's `reply-to`, and yields the
    /// message on its first `recv`.
    pub async fn accept(&self) -> Result<Arc<Channel>, ChannelError> {
        if self.kind != ChannelKind::Listen {
            return Err(ChannelError::Unsupported {
                kind: self.kind,
                op: "accept",
            });
        }
        let first = self.recv().await?;
        let reply_to = first
            .headers
            .get(header::REPLY_TO)
            .and_then(|v| NameTrio::from_header_value(v));
        let Some(reply_to) = reply_to else {
            self.reject(first.delivery_tag, false).await?;
            return Err(ChannelError::MissingReplyTo);
        };
        let mut accepted = Channel::new(
            ChannelKind::Accepted,
            self.transport.clone(),
            self.max_message_size,
        );
        accepted.shares_transport = true;
        accepted.addressing.get_mut().send_name = Some(reply_to);
        accepted.push(Inbound::Message(first));
        Ok(Arc::new(accepted))
    }

    fn push(&self, item: Inbound) {
        let tx = self.inbox_tx.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = tx.send(item);
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, ChannelError> {
        let queue = self.listening_queue().await?;
        Ok(self.transport.queue_stats(&queue).await?)
    }

    /// Drop every message waiting in this channel's broker queue.
    pub async fn purge(&self) -> Result<u32, ChannelError> {
        let queue = self.listening_queue().await?;
        Ok(self.transport.purge(&queue).await?)
    }

    async fn listening_queue(&self) -> Result<String, ChannelError> {
        self.recv_name()
            .await
            .and_then(|n| n.queue().map(String::from))
            .ok_or(ChannelError::NotConfigured("receive"))
    }

    /// Prepare a released pooled channel for its next borrower: fresh receive queue, no
    /// addresses. Deliveries nobody read are handed back to the broker.
    pub async fn reset(&self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stale = {
            let mut guard = self.inbox_rx.lock().await;
            *self.inbox_tx.lock().unwrap_or_else(PoisonError::into_inner) = tx;
            std::mem::replace(&mut *guard, rx)
        };
        while let Ok(item) = stale.try_recv() {
            if let Inbound::Message(d) = item {
                if let Err(e) = self.transport.reject(d.delivery_tag, true).await {
                    tracing::debug!(error = %e, "requeue of unread delivery failed");
                }
            }
        }
        *self.addressing.lock().await = Addressing::default();
        self.closed.store(false, Ordering::Release);
    }

    /// Stop consuming, delete the queue unless the broker auto-deletes it, and wake any reader.
    /// Pooled channels then go back to their node; others close the broker channel. Closing an
    /// already-closed channel does nothing.
    pub async fn close(self: &Arc<Self>) -> Result<(), ChannelError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (tag, recv_name, options) = {
            let mut a = self.addressing.lock().await;
            (a.consumer_tag.take(), a.recv_name.clone(), a.queue_options)
        };
        if let Some(tag) = tag {
            if let Err(e) = self.transport.stop_consume(&tag).await {
                tracing::warn!(error = %e, "stop consume on close failed");
            }
        }
        if !self.shares_transport && !options.auto_delete {
            if let Some(queue) = recv_name.as_ref().and_then(|n| n.queue()) {
                if let Err(e) = self.transport.delete_queue(queue).await {
                    tracing::debug!(queue, error = %e, "queue delete on close failed");
                }
            }
        }
        self.push(Inbound::Shutdown);

        if let Some(releaser) = self.releaser.as_ref().and_then(Weak::upgrade) {
            releaser.release(self.clone()).await;
        } else if !self.shares_transport {
            self.transport.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::transport::Connection;

    const MAX: usize = 1024;

    async fn open(broker: &Arc<Broker>, kind: ChannelKind) -> Arc<Channel> {
        let conn = broker.connect();
        let transport = conn.open_channel().await.unwrap();
        Arc::new(Channel::new(kind, transport, MAX))
    }

    #[tokio::test]
    async fn listener_queue_is_namespaced_and_idempotent() {
        let broker = Broker::new();
        let ch = open(&broker, ChannelKind::Recv).await;
        let name = NameTrio::with_queue("sys", "alice");
        let first = ch.setup_listener(&name, None).await.unwrap();
        assert_eq!(first.queue(), Some("sys.alice"));
        let again = ch.setup_listener(&name, None).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(ch.state().await, ChannelState::Listening);
        assert!(broker.queue_exists("sys.alice"));
    }

    #[tokio::test]
    async fn anonymous_listener_gets_broker_name() {
        let broker = Broker::new();
        let ch = open(&broker, ChannelKind::Bidir).await;
        let resolved = ch
            .setup_listener(&NameTrio::anonymous("sys"), None)
            .await
            .unwrap();
        let q = resolved.queue().unwrap();
        assert!(q.starts_with("amq.gen-"));
        assert_eq!(resolved.routing_key().as_deref(), Some(q));
    }

    #[tokio::test]
    async fn start_consume_requires_config_and_is_single() {
        let broker = Broker::new();
        let ch = open(&broker, ChannelKind::Recv).await;
        assert!(matches!(
            ch.start_consume().await,
            Err(ChannelError::NotConfigured(_))
        ));
        ch.setup_listener(&NameTrio::with_queue("sys", "q"), None)
            .await
            .unwrap();
        ch.start_consume().await.unwrap();
        assert!(matches!(
            ch.start_consume().await,
            Err(ChannelError::AlreadyConsuming)
        ));
        ch.stop_consume().await.unwrap();
        ch.start_consume().await.unwrap();
    }

    #[tokio::test]
    async fn send_and_recv_with_reply_to() {
        let broker = Broker::new();
        let rx = open(&broker, ChannelKind::Recv).await;
        let addr = rx
            .setup_listener(&NameTrio::with_queue("sys", "bob"), None)
            .await
            .unwrap();
        rx.start_consume().await.unwrap();

        let tx = open(&broker, ChannelKind::Bidir).await;
        let own = tx
            .setup_listener(&NameTrio::anonymous("sys"), None)
            .await
            .unwrap();
        tx.connect(NameTrio::with_queue("sys", "bob")).await.unwrap();
        tx.send(b"hi".to_vec(), Headers::new()).await.unwrap();

        let d = rx.recv().await.unwrap();
        assert_eq!(d.body, b"hi".to_vec());
        assert_eq!(
            d.headers.get(header::REPLY_TO),
            Some(&own.to_header_value())
        );
        assert_eq!(
            d.headers.get(header::ROUTING_KEY).map(String::as_str),
            addr.routing_key().as_deref()
        );
        rx.ack(d.delivery_tag).await.unwrap();
    }

    #[tokio::test]
    async fn oversize_send_never_reaches_broker() {
        let broker = Broker::new();
        let tx = open(&broker, ChannelKind::Send).await;
        tx.connect(NameTrio::with_queue("nowhere", "q")).await.unwrap();
        let err = tx.send(vec![0; MAX + 1], Headers::new()).await.unwrap_err();
        assert!(matches!(err, ChannelError::TooLarge { size, max } if size == MAX + 1 && max == MAX));
        // the missing exchange would have killed the broker channel
        assert!(tx.is_healthy());
    }

    #[tokio::test]
    async fn close_wakes_blocked_reader() {
        let broker = Broker::new();
        let ch = open(&broker, ChannelKind::Recv).await;
        ch.setup_listener(&NameTrio::with_queue("sys", "r"), None)
            .await
            .unwrap();
        ch.start_consume().await.unwrap();
        let reader = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.recv().await })
        };
        tokio::task::yield_now().await;
        ch.close().await.unwrap();
        let res = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader did not wake")
            .unwrap();
        assert!(matches!(res, Err(ChannelError::Closed)));
        assert!(matches!(ch.recv().await, Err(ChannelError::Closed)));
        assert!(!broker.queue_exists("sys.r"));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_safe_unconfigured() {
        let broker = Broker::new();
        let ch = open(&broker, ChannelKind::Bidir).await;
        ch.close().await.unwrap();
        ch.close().await.unwrap();
        assert_eq!(ch.state().await, ChannelState::Closed);
        assert!(matches!(
            ch.send(vec![], Headers::new()).await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn accept_replays_first_message_and_replies() {
        let broker = Broker::new();
        let server = open(&broker, ChannelKind::Listen).await;
        server
            .setup_listener(&NameTrio::with_queue("sys", "svc"), None)
            .await
            .unwrap();
        server.start_consume().await.unwrap();

        let client = open(&broker, ChannelKind::Bidir).await;
        client
            .setup_listener(&NameTrio::anonymous("sys"), None)
            .await
            .unwrap();
        client.start_consume().await.unwrap();
        client
            .connect(NameTrio::with_queue("sys", "svc"))
            .await
            .unwrap();
        client.send(b"ping".to_vec(), Headers::new()).await.unwrap();

        let session = server.accept().await.unwrap();
        assert_eq!(session.kind(), ChannelKind::Accepted);
        let first = session.recv().await.unwrap();
        assert_eq!(first.body, b"ping".to_vec());
        session.ack(first.delivery_tag).await.unwrap();
        session.send(b"pong".to_vec(), Headers::new()).await.unwrap();

        let reply = client.recv().await.unwrap();
        assert_eq!(reply.body, b"pong".to_vec());
        session.close().await.unwrap();
        // the shared broker channel stays up for the listener
        assert!(server.is_healthy());
    }

    #[tokio::test]
    async fn accept_without_reply_to_is_rejected() {
        let broker = Broker::new();
        let server = open(&broker, ChannelKind::Listen).await;
        server
            .setup_listener(&NameTrio::with_queue("sys", "svc"), None)
            .await
            .unwrap();
        server.start_consume().await.unwrap();
        let sender = open(&broker, ChannelKind::Send).await;
        sender
            .send_to(&NameTrio::with_queue("sys", "svc"), b"x".to_vec(), Headers::new())
            .await
            .unwrap();
        assert!(matches!(
            server.accept().await,
            Err(ChannelError::MissingReplyTo)
        ));
        assert_eq!(server.queue_stats().await.unwrap().message_count, 0);
    }

    #[tokio::test]
    async fn stats_and_purge() {
        let broker = Broker::new();
        let ch = open(&broker, ChannelKind::Recv).await;
        ch.setup_listener(&NameTrio::with_queue("sys", "backlog"), None)
            .await
            .unwrap();
        let sender = open(&broker, ChannelKind::Send).await;
        for _ in 0..3 {
            sender
                .send_to(&NameTrio::with_queue("sys", "backlog"), vec![1], Headers::new())
                .await
                .unwrap();
        }
        let stats = ch.queue_stats().await.unwrap();
        assert_eq!(stats.message_count, 3);
        assert_eq!(stats.consumer_count, 0);
        assert_eq!(ch.purge().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn mandatory_send_to_unbound_address_fails() {
        let broker = Broker::new();
        let listener = open(&broker, ChannelKind::Recv).await;
        listener
            .setup_listener(&NameTrio::with_queue("sys", "exists"), None)
            .await
            .unwrap();
        let tx = open(&broker, ChannelKind::Send).await;
        let err = tx
            .send_mandatory(&NameTrio::with_queue("sys", "ghost"), vec![], Headers::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Transport(TransportError::Unroutable { .. })
        ));
    }
}
