//! TCP client for a `convo-broker` daemon.
//!
//! One socket per connection. A writer task drains an mpsc of encoded frames; a reader task
//! completes pending requests and routes deliveries to consumer callbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::header::Headers;
use crate::transport::{
    CancelPolicy, Connection, DeliveryCallback, ExchangeKind, PublishOptions, QueueOptions, QueueStats,
    Transport, TransportError,
};
use crate::wire::{encode_frame, read_frame, write_frame, Frame, Op, Reply};

type ReplySender = oneshot::Sender<(Result<Reply, TransportError>, bool)>;

#[derive(Default)]
struct LinkState {
    pending: HashMap<u64, ReplySender>,
    /// client consumer id -> callback
    consumers: HashMap<u64, DeliveryCallback>,
    /// broker consumer tag -> client consumer id
    tags: HashMap<String, u64>,
}

struct Link {
    addr: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    state: Mutex<LinkState>,
    next_id: AtomicU64,
    open: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Link {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lost(&self) -> TransportError {
        TransportError::ConnectionLost(self.addr.clone())
    }

    /// Send `op` on `channel` and wait for its reply. Returns the result and whether the broker
    /// still has the channel open.
    async fn request(&self, channel: u16, op: Op) -> Result<(Reply, bool), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(self.lost());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // an oversize frame fails this call only
        let bytes = encode_frame(&Frame::Request { id, channel, op })?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.lock().pending.insert(id, reply_tx);
        if self.tx.send(bytes).is_err() {
            self.lock().pending.remove(&id);
            return Err(self.lost());
        }
        let (result, channel_open) = reply_rx.await.map_err(|_| self.lost())?;
        result.map(|r| (r, channel_open))
    }

    fn shutdown(&self) {
        self.open.store(false, Ordering::Release);
        let pending: Vec<ReplySender> = {
            let mut state = self.lock();
            state.consumers.clear();
            state.tags.clear();
            state.pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in pending {
            let _ = tx.send((Err(self.lost()), false));
        }
    }
}

/// Connection to a remote broker over TCP.
pub struct RemoteConnection {
    link: Arc<Link>,
    policy: CancelPolicy,
}

impl RemoteConnection {
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionLost(format!("{}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let link = Arc::new(Link {
            addr: addr.to_string(),
            tx,
            state: Mutex::new(LinkState::default()),
            next_id: AtomicU64::new(1),
            open: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        });

        let writer_link = link.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &bytes).await {
                    tracing::warn!(addr = %writer_link.addr, error = %e, "broker link write failed");
                    break;
                }
            }
            writer_link.shutdown();
        });

        let reader_link = link.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                let frame = match read_frame(&mut reader).await {
                    Ok(Some(f)) => f,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(addr = %reader_link.addr, error = %e, "broker link read failed");
                        break;
                    }
                };
                match frame {
                    Frame::Reply {
                        id,
                        result,
                        channel_open,
                    } => {
                        let tx = reader_link.lock().pending.remove(&id);
                        if let Some(tx) = tx {
                            let _ = tx.send((result, channel_open));
                        }
                    }
                    Frame::Deliver { consumer, delivery } => {
                        let state = reader_link.lock();
                        match state.consumers.get(&consumer) {
                            Some(cb) => cb(delivery),
                            None => tracing::debug!(consumer, "delivery for unknown consumer dropped"),
                        }
                    }
                    Frame::Request { .. } => {
                        tracing::warn!(addr = %reader_link.addr, "unexpected request frame from broker");
                    }
                }
            }
            tracing::debug!(addr = %reader_link.addr, "broker link closed");
            reader_link.shutdown();
        });

        link.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([writer_task, reader_task]);
        tracing::info!(addr, "connected to broker");
        Ok(Self {
            link,
            policy: CancelPolicy::default(),
        })
    }

    /// Cancel-confirmation policy given to every channel opened afterwards.
    pub fn with_cancel_policy(mut self, policy: CancelPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl Connection for RemoteConnection {
    fn describe(&self) -> String {
        format!("tcp://{}", self.link.addr)
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::Acquire)
    }

    async fn open_channel(&self) -> Result<Arc<dyn Transport>, TransportError> {
        match self.link.request(0, Op::OpenChannel).await? {
            (Reply::Channel(number), _) => Ok(Arc::new(RemoteChannel {
                link: self.link.clone(),
                number,
                open: AtomicBool::new(true),
                policy: self.policy,
            })),
            (other, _) => Err(unexpected(&other)),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.link.shutdown();
        let tasks: Vec<JoinHandle<()>> = self
            .link
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}

fn unexpected(reply: &Reply) -> TransportError {
    TransportError::Protocol(format!("unexpected reply {:?}", reply))
}

/// One broker channel over a [`RemoteConnection`].
pub struct RemoteChannel {
    link: Arc<Link>,
    number: u16,
    open: AtomicBool,
    policy: CancelPolicy,
}

impl RemoteChannel {
    async fn call(&self, op: Op) -> Result<Reply, TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::ChannelClosed(self.number));
        }
        match self.link.request(self.number, op).await {
            Ok((reply, channel_open)) => {
                if !channel_open {
                    self.open.store(false, Ordering::Release);
                }
                Ok(reply)
            }
            Err(e) => {
                if matches!(
                    e,
                    TransportError::NotFound { .. }
                        | TransportError::PreconditionFailed(_)
                        | TransportError::ResourceLocked(_)
                        | TransportError::UnknownDeliveryTag(_)
                        | TransportError::ChannelClosed(_)
                        | TransportError::ConnectionLost(_)
                ) {
                    self.open.store(false, Ordering::Release);
                }
                Err(e)
            }
        }
    }

    async fn call_done(&self, op: Op) -> Result<(), TransportError> {
        match self.call(op).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

#[async_trait]
impl Transport for RemoteChannel {
    fn channel_number(&self) -> u16 {
        self.number
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.link.open.load(Ordering::Acquire)
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
        durable: bool,
        auto_delete: bool,
    ) -> Result<(), TransportError> {
        self.call_done(Op::DeclareExchange {
            exchange: exchange.to_string(),
            kind,
            durable,
            auto_delete,
        })
        .await
    }

    async fn delete_exchange(&self, exchange: &str) -> Result<(), TransportError> {
        self.call_done(Op::DeleteExchange {
            exchange: exchange.to_string(),
        })
        .await
    }

    async fn declare_queue(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<String, TransportError> {
        match self
            .call(Op::DeclareQueue {
                queue: queue.to_string(),
                options,
            })
            .await?
        {
            Reply::Queue(name) => Ok(name),
            other => Err(unexpected(&other)),
        }
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.call_done(Op::DeleteQueue {
            queue: queue.to_string(),
        })
        .await
    }

    async fn bind(&self, exchange: &str, queue: &str, binding: &str) -> Result<(), TransportError> {
        self.call_done(Op::Bind {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            binding: binding.to_string(),
        })
        .await
    }

    async fn unbind(
        &self,
        exchange: &str,
        queue: &str,
        binding: &str,
    ) -> Result<(), TransportError> {
        self.call_done(Op::Unbind {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            binding: binding.to_string(),
        })
        .await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: Headers,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        self.call_done(Op::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            headers,
            options,
        })
        .await
    }

    async fn start_consume(
        &self,
        callback: DeliveryCallback,
        queue: &str,
        no_ack: bool,
        exclusive: bool,
    ) -> Result<String, TransportError> {
        let consumer = self.link.next_id.fetch_add(1, Ordering::Relaxed);
        // Registered before the request so deliveries racing the reply are not lost.
        self.link.lock().consumers.insert(consumer, callback);
        let result = self
            .call(Op::Consume {
                consumer,
                queue: queue.to_string(),
                no_ack,
                exclusive,
            })
            .await;
        match result {
            Ok(Reply::ConsumerTag(tag)) => {
                self.link.lock().tags.insert(tag.clone(), consumer);
                Ok(tag)
            }
            Ok(other) => {
                self.link.lock().consumers.remove(&consumer);
                Err(unexpected(&other))
            }
            Err(e) => {
                self.link.lock().consumers.remove(&consumer);
                Err(e)
            }
        }
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.call_done(Op::Cancel {
            consumer_tag: consumer_tag.to_string(),
        })
        .await?;
        let mut state = self.link.lock();
        if let Some(consumer) = state.tags.remove(consumer_tag) {
            state.consumers.remove(&consumer);
        }
        Ok(())
    }

    async fn consumer_active(&self, consumer_tag: &str) -> Result<bool, TransportError> {
        match self
            .call(Op::ConsumerActive {
                consumer_tag: consumer_tag.to_string(),
            })
            .await?
        {
            Reply::Active(active) => Ok(active),
            other => Err(unexpected(&other)),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.call_done(Op::Ack { delivery_tag }).await
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.call_done(Op::Reject {
            delivery_tag,
            requeue,
        })
        .await
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, TransportError> {
        match self
            .call(Op::QueueStats {
                queue: queue.to_string(),
            })
            .await?
        {
            Reply::Stats(stats) => Ok(stats),
            other => Err(unexpected(&other)),
        }
    }

    async fn purge(&self, queue: &str) -> Result<u32, TransportError> {
        match self
            .call(Op::Purge {
                queue: queue.to_string(),
            })
            .await?
        {
            Reply::Purged(n) => Ok(n),
            other => Err(unexpected(&other)),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Ok(());
        }
        let result = self.call(Op::CloseChannel).await;
        self.open.store(false, Ordering::Release);
        match result {
            Ok(_) | Err(TransportError::ConnectionLost(_)) | Err(TransportError::ChannelClosed(_)) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
