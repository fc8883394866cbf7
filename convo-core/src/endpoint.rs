//! Conversation endpoints: one role's view of a conversation.
//!
//! An endpoint owns a pooled bidirectional channel. `join` declares the role's receive address,
//! publishes it into the conversation's role table and spawns a listener task that dispatches
//! every delivery: INVITE and ACCEPT record the sender's address, REJECT marks the sender as
//! refused, and TRANSMIT payloads are queued per sending role for `recv`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelError, ChannelKind};
use crate::codec::{decode_validated, decode_with_encoding, BincodeCodec, Codec, CodecError, Validate};
use crate::conversation::{Conversation, ConversationError};
use crate::header::{self, ControlType, Headers, MsgType};
use crate::interceptor::{Annotations, InterceptorStack, Invocation, Path};
use crate::name::NameTrio;
use crate::node::Node;
use crate::transport::Delivery;

/// Progress of this endpoint's session with one peer role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SessionState {
    #[default]
    Unbound,
    Invited,
    Accepted,
    InSession,
    Closed,
}

/// A TRANSMIT payload as handed to the application.
#[derive(Debug, Clone)]
pub struct Message {
    pub body: Vec<u8>,
    pub headers: Headers,
    /// Set by interceptors on the way in; never travels on the wire.
    pub annotations: Annotations,
}

impl Message {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn op(&self) -> Option<&str> {
        self.header(header::OP)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        decode_with_encoding(self.header(header::ENCODING), &self.body)
    }
}

#[derive(Default)]
struct Peer {
    state: SessionState,
    /// Where to send the first message when this role has not answered yet.
    invitation: Option<NameTrio>,
    invited: bool,
    owe_accept: bool,
    rejected: Option<Option<String>>,
}

impl Peer {
    fn advance(&mut self, to: SessionState) {
        self.state = self.state.max(to);
    }
}

enum Inbound {
    Message(Message),
    Rejected(Option<String>),
    Closed,
}

struct RoleQueue {
    tx: mpsc::UnboundedSender<Inbound>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Inbound>>>,
}

impl RoleQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

#[derive(Clone, Copy)]
enum Outbound {
    Transmit,
    Invite,
    Accept,
}

struct EndpointInner {
    role: String,
    conversation: Arc<Conversation>,
    is_originator: bool,
    channel: Arc<Channel>,
    address: NameTrio,
    interceptors: InterceptorStack,
    resolve_timeout: Duration,
    join_timeout: Duration,
    /// Highest conv-seq seen or sent.
    seq: AtomicU64,
    peers: StdMutex<HashMap<String, Peer>>,
    queues: StdMutex<HashMap<String, RoleQueue>>,
    listener: StdMutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct ConversationEndpoint {
    inner: Arc<EndpointInner>,
}

impl ConversationEndpoint {
    /// Take `role` in `conversation`, listening on `base_name` (anonymous queue when it names
    /// only an exchange).
    pub async fn join(
        node: &Node,
        role: impl Into<String>,
        base_name: &NameTrio,
        conversation: Arc<Conversation>,
        is_originator: bool,
    ) -> Result<Self, ConversationError> {
        let role = role.into();
        let channel = node
            .channel(ChannelKind::Bidir)
            .await
            .map_err(ChannelError::from)?;
        let address = match listen_on(&channel, base_name).await {
            Ok(a) => a,
            Err(e) => {
                let _ = channel.close().await;
                return Err(e.into());
            }
        };
        conversation.set(&role, address.clone());

        let endpoint_config = &node.config().endpoint;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(EndpointInner {
            role,
            conversation,
            is_originator,
            channel: channel.clone(),
            address,
            interceptors: node.interceptors(),
            resolve_timeout: endpoint_config.role_resolve_timeout(),
            join_timeout: endpoint_config.listener_join_timeout(),
            seq: AtomicU64::new(0),
            peers: StdMutex::new(HashMap::new()),
            queues: StdMutex::new(HashMap::new()),
            listener: StdMutex::new(None),
            shutdown,
            closed: AtomicBool::new(false),
        });
        let handle = tokio::spawn(listener_loop(
            channel,
            Arc::downgrade(&inner),
            shutdown_rx,
        ));
        *lock(&inner.listener) = Some(handle);
        tracing::debug!(
            conv_id = %inner.conversation.id(),
            role = %inner.role,
            address = %inner.address,
            "joined conversation"
        );
        Ok(Self { inner })
    }

    pub fn role(&self) -> &str {
        &self.inner.role
    }

    pub fn conversation(&self) -> &Arc<Conversation> {
        &self.inner.conversation
    }

    pub fn is_originator(&self) -> bool {
        self.inner.is_originator
    }

    /// This role's receive address.
    pub fn address(&self) -> &NameTrio {
        &self.inner.address
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn session_state(&self, role: &str) -> SessionState {
        lock(&self.inner.peers)
            .get(role)
            .map(|p| p.state)
            .unwrap_or_default()
    }

    /// Invite `to_role`, reachable at `to_role_addr` (else through the role table). Unless
    /// merged, a zero-payload INVITE goes out now; merged, it rides on the first `send`.
    /// Originators invite every unbound peer on first send anyway; any other role gets the
    /// merged INVITE only when it names an address here.
    pub async fn invite(
        &self,
        to_role: &str,
        to_role_addr: Option<NameTrio>,
        merge_with_first_send: bool,
    ) -> Result<(), ConversationError> {
        self.check_open()?;
        lock(&self.inner.peers)
            .entry(to_role.to_string())
            .or_default()
            .invitation = to_role_addr;
        if !merge_with_first_send {
            self.inner
                .deliver(to_role, Vec::new(), Headers::new(), Outbound::Invite)
                .await?;
        }
        Ok(())
    }

    /// Answer an invitation from `to_role` with a bare ACCEPT.
    pub async fn send_accept(&self, to_role: &str) -> Result<(), ConversationError> {
        self.check_open()?;
        self.inner
            .deliver(to_role, Vec::new(), Headers::new(), Outbound::Accept)
            .await
    }

    /// Send `body` as operation `op`.
    pub async fn send(
        &self,
        to_role: &str,
        op: &str,
        body: Vec<u8>,
    ) -> Result<(), ConversationError> {
        let mut headers = Headers::new();
        headers.insert(header::OP.to_string(), op.to_string());
        self.send_with_headers(to_role, body, headers).await
    }

    /// Send with caller headers. Conversation headers are filled in over them.
    pub async fn send_with_headers(
        &self,
        to_role: &str,
        body: Vec<u8>,
        headers: Headers,
    ) -> Result<(), ConversationError> {
        self.check_open()?;
        self.inner
            .deliver(to_role, body, headers, Outbound::Transmit)
            .await
    }

    /// Encode `value` with bincode and send it.
    pub async fn send_object<T>(
        &self,
        to_role: &str,
        op: &str,
        value: &T,
    ) -> Result<(), ConversationError>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.send_object_with(&BincodeCodec, to_role, op, value).await
    }

    pub async fn send_object_with<C, T>(
        &self,
        codec: &C,
        to_role: &str,
        op: &str,
        value: &T,
    ) -> Result<(), ConversationError>
    where
        C: Codec + Sync,
        T: Serialize + Sync + ?Sized,
    {
        let body = codec.encode(value)?;
        let mut headers = Headers::new();
        headers.insert(header::OP.to_string(), op.to_string());
        headers.insert(header::ENCODING.to_string(), codec.encoding().to_string());
        headers.insert(header::FORMAT.to_string(), codec.format().to_string());
        self.send_with_headers(to_role, body, headers).await
    }

    /// Next TRANSMIT payload from `from_role`. A REJECT from that role fails this and every
    /// later call.
    pub async fn recv(&self, from_role: &str) -> Result<Message, ConversationError> {
        let rx = self.inner.queue_rx(from_role);
        let mut rx = rx.lock().await;
        if let Some(reason) = self.inner.rejection(from_role) {
            return Err(ConversationError::Rejected {
                role: from_role.to_string(),
                reason,
            });
        }
        self.check_open()?;
        match rx.recv().await {
            Some(Inbound::Message(m)) => Ok(m),
            Some(Inbound::Rejected(reason)) => Err(ConversationError::Rejected {
                role: from_role.to_string(),
                reason,
            }),
            Some(Inbound::Closed) | None => {
                tracing::debug!(role = %self.inner.role, from = from_role, "recv woke on closed endpoint");
                Err(ConversationError::Closed)
            }
        }
    }

    pub async fn recv_timeout(
        &self,
        from_role: &str,
        timeout: Duration,
    ) -> Result<Message, ConversationError> {
        tokio::time::timeout(timeout, self.recv(from_role))
            .await
            .map_err(|_| ConversationError::RecvTimeout {
                role: from_role.to_string(),
                timeout,
            })?
    }

    pub async fn recv_object<T: DeserializeOwned>(
        &self,
        from_role: &str,
    ) -> Result<T, ConversationError> {
        Ok(self.recv(from_role).await?.decode()?)
    }

    pub async fn recv_validated<T: DeserializeOwned + Validate>(
        &self,
        from_role: &str,
    ) -> Result<T, ConversationError> {
        let m = self.recv(from_role).await?;
        Ok(decode_validated(m.header(header::ENCODING), &m.body)?)
    }

    /// Run a delivery received elsewhere (an invitation) through this endpoint's dispatch.
    pub(crate) async fn replay(&self, delivery: Delivery) {
        self.inner.dispatch(delivery).await;
    }

    /// Stop the listener, close the channel and wake every blocked `recv`. Calling it again
    /// does nothing.
    pub async fn close(&self) -> Result<(), ConversationError> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for peer in lock(&inner.peers).values_mut() {
            peer.advance(SessionState::Closed);
        }
        for queue in lock(&inner.queues).values() {
            let _ = queue.tx.send(Inbound::Closed);
        }
        let _ = inner.shutdown.send(true);
        let closed = inner.channel.close().await;

        let handle = lock(&inner.listener).take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(inner.join_timeout, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!(role = %inner.role, "listener did not stop in time, aborting");
                handle.abort();
            }
        }
        tracing::debug!(conv_id = %inner.conversation.id(), role = %inner.role, "endpoint closed");
        closed.map_err(ConversationError::from)
    }

    fn check_open(&self) -> Result<(), ConversationError> {
        if self.is_closed() {
            Err(ConversationError::Closed)
        } else {
            Ok(())
        }
    }
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn listen_on(channel: &Arc<Channel>, base_name: &NameTrio) -> Result<NameTrio, ChannelError> {
    let address = channel.setup_listener(base_name, None).await?;
    channel.start_consume().await?;
    Ok(address)
}

async fn listener_loop(
    channel: Arc<Channel>,
    endpoint: Weak<EndpointInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            r = channel.recv() => match r {
                Ok(d) => d,
                Err(ChannelError::Closed) => {
                    tracing::debug!("endpoint channel closed, listener stopping");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "endpoint listener failed");
                    break;
                }
            },
        };
        let tag = delivery.delivery_tag;
        let Some(inner) = endpoint.upgrade() else {
            break;
        };
        inner.dispatch(delivery).await;
        drop(inner);
        if let Err(e) = channel.ack(tag).await {
            tracing::debug!(error = %e, "ack failed");
        }
    }
}

impl EndpointInner {
    fn queue_rx(&self, role: &str) -> Arc<Mutex<mpsc::UnboundedReceiver<Inbound>>> {
        lock(&self.queues)
            .entry(role.to_string())
            .or_insert_with(RoleQueue::new)
            .rx
            .clone()
    }

    fn push(&self, role: &str, item: Inbound) {
        let mut queues = lock(&self.queues);
        let queue = queues.entry(role.to_string()).or_insert_with(RoleQueue::new);
        let _ = queue.tx.send(item);
    }

    fn rejection(&self, role: &str) -> Option<Option<String>> {
        lock(&self.peers).get(role).and_then(|p| p.rejected.clone())
    }

    async fn dispatch(&self, delivery: Delivery) {
        let headers = delivery.headers;
        let msg_type = match MsgType::from_headers(&headers) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(role = %self.role, error = %e, "dropping message without a valid conv-msg-type");
                return;
            }
        };
        let Some(from) = headers.get(header::SENDER_ROLE).cloned() else {
            tracing::warn!(role = %self.role, "dropping message without sender-role");
            return;
        };
        if let Some(seq) = header::conv_seq(&headers) {
            self.seq.fetch_max(seq, Ordering::AcqRel);
        }
        tracing::info!(
            conv_id = %self.conversation.id(),
            role = %self.role,
            from = %from,
            msg_type = msg_type.bits(),
            seq = ?header::conv_seq(&headers),
            op = ?headers.get(header::OP),
            "MESSAGE RECV"
        );

        // control messages are checked too: a bare INVITE opens the conversation at seq 1
        let inv = self
            .interceptors
            .process(Invocation::new(Path::In, delivery.body, headers))
            .await;
        let headers = &inv.headers;
        let reply_to = headers
            .get(header::REPLY_TO)
            .and_then(|v| NameTrio::from_header_value(v));
        match msg_type.control {
            Some(control @ (ControlType::Invite | ControlType::Accept)) => {
                if let Some(addr) = reply_to {
                    self.conversation.set(&from, addr);
                }
                let mut peers = lock(&self.peers);
                let peer = peers.entry(from.clone()).or_default();
                if control == ControlType::Invite {
                    peer.owe_accept = true;
                    peer.advance(SessionState::Invited);
                } else {
                    peer.advance(SessionState::Accepted);
                }
            }
            Some(ControlType::Reject) => {
                let reason = headers.get(header::REJECT_REASON).cloned();
                tracing::info!(conv_id = %self.conversation.id(), role = %self.role, from = %from, "invitation rejected");
                {
                    let mut peers = lock(&self.peers);
                    let peer = peers.entry(from.clone()).or_default();
                    peer.rejected = Some(reason.clone());
                    peer.advance(SessionState::Closed);
                }
                self.push(&from, Inbound::Rejected(reason));
                return;
            }
            None => {
                if let Some(addr) = reply_to.filter(|_| !self.conversation.is_resolved(&from)) {
                    self.conversation.set(&from, addr);
                }
            }
        }

        if msg_type.is_transmit() {
            {
                let mut peers = lock(&self.peers);
                let peer = peers.entry(from.clone()).or_default();
                if peer.state >= SessionState::Accepted {
                    peer.advance(SessionState::InSession);
                }
            }
            self.push(
                &from,
                Inbound::Message(Message {
                    body: inv.message,
                    headers: inv.headers,
                    annotations: inv.annotations,
                }),
            );
        }
    }

    /// Pick the message type, stamp conversation headers, run outgoing interceptors and
    /// publish to `to_role`'s address.
    async fn deliver(
        &self,
        to_role: &str,
        body: Vec<u8>,
        mut headers: Headers,
        kind: Outbound,
    ) -> Result<(), ConversationError> {
        let (msg_type, invitation) = {
            let mut peers = lock(&self.peers);
            let peer = peers.entry(to_role.to_string()).or_default();
            if let Some(reason) = &peer.rejected {
                return Err(ConversationError::Rejected {
                    role: to_role.to_string(),
                    reason: reason.clone(),
                });
            }
            match kind {
                Outbound::Invite => {
                    peer.invited = true;
                    peer.advance(SessionState::Invited);
                    (MsgType::control(ControlType::Invite), peer.invitation.clone())
                }
                Outbound::Accept => {
                    peer.owe_accept = false;
                    peer.advance(SessionState::Accepted);
                    (MsgType::control(ControlType::Accept), None)
                }
                Outbound::Transmit
                    if (self.is_originator || peer.invitation.is_some())
                        && !peer.invited
                        && peer.state == SessionState::Unbound =>
                {
                    peer.invited = true;
                    peer.advance(SessionState::Invited);
                    (
                        MsgType::TRANSMIT.with_control(ControlType::Invite),
                        peer.invitation.clone(),
                    )
                }
                Outbound::Transmit if peer.owe_accept => {
                    peer.owe_accept = false;
                    peer.advance(SessionState::InSession);
                    (MsgType::TRANSMIT.with_control(ControlType::Accept), None)
                }
                Outbound::Transmit => {
                    if peer.state >= SessionState::Accepted {
                        peer.advance(SessionState::InSession);
                    }
                    (MsgType::TRANSMIT, None)
                }
            }
        };

        let addr = match invitation {
            Some(addr) => addr,
            None => {
                self.conversation
                    .resolve_within(to_role, self.resolve_timeout)
                    .await?
            }
        };

        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let stamp = [
            (header::CONV_ID, self.conversation.id().to_string()),
            (header::CONV_SEQ, seq.to_string()),
            (header::CONV_MSG_TYPE, msg_type.bits().to_string()),
            (header::SENDER_ROLE, self.role.clone()),
            (header::RECEIVER_ROLE, to_role.to_string()),
            (header::PROTOCOL, self.conversation.protocol().to_string()),
            (header::RECEIVER, addr.to_header_value()),
            (header::LANGUAGE, "rust".to_string()),
        ];
        for (k, v) in stamp {
            headers.insert(k.to_string(), v);
        }
        headers
            .entry(header::ENCODING.to_string())
            .or_insert_with(|| "raw".to_string());
        headers
            .entry(header::FORMAT.to_string())
            .or_insert_with(|| "bytes".to_string());

        let inv = self
            .interceptors
            .process(Invocation::new(Path::Out, body, headers))
            .await;
        if let Err(v) = inv.annotations.check() {
            tracing::warn!(conv_id = %self.conversation.id(), role = %self.role, to = to_role, reason = %v.reason, "outgoing message violates protocol");
        }
        tracing::info!(
            conv_id = %self.conversation.id(),
            role = %self.role,
            to = to_role,
            msg_type = msg_type.bits(),
            seq,
            op = ?inv.headers.get(header::OP),
            "MESSAGE SEND"
        );
        self.channel
            .send_mandatory(&addr, inv.message, inv.headers)
            .await
            .map_err(|source| ConversationError::SendFailed {
                role: to_role.to_string(),
                source,
            })
    }
}
