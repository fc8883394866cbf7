//! Conversation monitor: checks every message of a monitored role against its protocol.
//!
//! One state machine per `(conversation id, local role)`, built from the role's protocol
//! on the first message of the conversation (`conv-seq` 1). Outgoing messages are checked as
//! `SEND_<op>_<receiver>` from the sender's side, incoming ones as `RECV_<op>_<sender>` from
//! the receiver's side. A failed check never blocks delivery: the message is annotated as
//! rejected and the context dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Deserialize;

use crate::bridge::BlockingBridge;
use crate::config::MonitorConfig;
use crate::fsm::{Fsm, State};
use crate::header::{self, ControlType, MsgType};
use crate::interceptor::{Interceptor, Invocation, Path};
use crate::spec::{FileSpecSource, ProtocolSource};
use crate::transition::{LocalType, Transition};

/// When a conversation's state machine is dropped after a legal message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// After the second TRANSMIT of the conversation (the reply leg of a request/response).
    /// Bare control messages never evict.
    ResponseLeg,
    /// Once the machine reaches a state with no way out.
    #[default]
    TerminalState,
    /// Only on a violation.
    Never,
}

/// Label of the implicit transition checked for ACCEPT control bits.
pub const ACCEPT_LABEL: &str = "accept";

type ContextKey = (String, String);

struct Context {
    fsm: Fsm,
    transmits: u64,
}

pub struct ConversationMonitor {
    source: Arc<dyn ProtocolSource>,
    eviction: EvictionPolicy,
    check_accept: bool,
    contexts: Mutex<HashMap<ContextKey, Context>>,
}

impl ConversationMonitor {
    pub fn new(source: Arc<dyn ProtocolSource>, eviction: EvictionPolicy, check_accept: bool) -> Self {
        Self {
            source,
            eviction,
            check_accept,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Monitor the roles named in `[monitor.roles]`, reading spec files on `bridge`.
    pub fn from_config(config: &MonitorConfig, bridge: BlockingBridge) -> Self {
        let source = FileSpecSource::new(config.roles.clone(), bridge);
        Self::new(Arc::new(source), config.eviction, config.check_accept)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ContextKey, Context>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live conversation contexts.
    pub fn context_count(&self) -> usize {
        self.lock().len()
    }

    /// Current state of a live context.
    pub fn state(&self, conv_id: &str, role: &str) -> Option<State> {
        self.lock()
            .get(&(conv_id.to_string(), role.to_string()))
            .map(|c| c.fsm.current_state())
    }

    async fn check(&self, mut inv: Invocation) -> Invocation {
        let (local_type, local_key, peer_key) = match inv.path {
            Path::Out => (LocalType::Send, header::SENDER_ROLE, header::RECEIVER_ROLE),
            Path::In => (LocalType::Recv, header::RECEIVER_ROLE, header::SENDER_ROLE),
        };
        let (Some(conv_id), Some(local), Some(peer)) = (
            inv.header(header::CONV_ID),
            inv.header(local_key),
            inv.header(peer_key),
        ) else {
            return inv;
        };
        let key = (conv_id.to_string(), local.to_string());
        let peer = peer.to_string();
        let seq = header::conv_seq(&inv.headers);

        if !self.lock().contains_key(&key) {
            if seq != Some(1) || !self.source.monitors(&key.1) {
                return inv;
            }
            match self.source.load(&key.1).await.and_then(|t| t.map(|t| t.build()).transpose()) {
                Ok(Some(fsm)) => {
                    tracing::debug!(conv_id = %key.0, role = %key.1, "monitoring conversation");
                    self.lock()
                        .entry(key.clone())
                        .or_insert(Context { fsm, transmits: 0 });
                }
                Ok(None) => return inv,
                Err(e) => {
                    tracing::warn!(conv_id = %key.0, role = %key.1, error = %e, "protocol spec unavailable");
                    inv.annotations.reject(format!("protocol for role {} unavailable: {}", key.1, e));
                    return inv;
                }
            }
        }

        let msg_type = match MsgType::from_headers(&inv.headers) {
            Ok(t) => t,
            Err(e) => {
                self.violation(&mut inv, &key, e.to_string());
                return inv;
            }
        };
        let op = inv.header(header::OP).map(str::to_string);

        let outcome = {
            let mut contexts = self.lock();
            let Some(ctx) = contexts.get_mut(&key) else {
                return inv;
            };
            if msg_type.is_transmit() {
                ctx.transmits += 1;
            }
            step(&mut ctx.fsm, local_type, &peer, msg_type, op.as_deref(), self.check_accept)
                .map(|()| (ctx.fsm.is_terminal(), ctx.transmits))
        };
        match outcome {
            Ok((terminal, transmits)) => {
                inv.annotations.accept();
                let evict = match self.eviction {
                    EvictionPolicy::ResponseLeg => msg_type.is_transmit() && transmits > 1,
                    EvictionPolicy::TerminalState => terminal,
                    EvictionPolicy::Never => false,
                };
                if evict {
                    tracing::debug!(conv_id = %key.0, role = %key.1, "conversation context evicted");
                    self.lock().remove(&key);
                }
            }
            Err(reason) => self.violation(&mut inv, &key, reason),
        }
        inv
    }

    fn violation(&self, inv: &mut Invocation, key: &ContextKey, reason: String) {
        tracing::warn!(conv_id = %key.0, role = %key.1, reason = %reason, "protocol violation");
        inv.annotations.reject(reason);
        self.lock().remove(key);
    }
}

fn step(
    fsm: &mut Fsm,
    local_type: LocalType,
    peer: &str,
    msg_type: MsgType,
    op: Option<&str>,
    check_accept: bool,
) -> Result<(), String> {
    if check_accept && msg_type.control == Some(ControlType::Accept) {
        let accept = Transition::new(local_type, ACCEPT_LABEL, peer).trigger();
        // only protocols that model the accept see it
        if fsm.has_transition(&accept, fsm.current_state()) {
            fsm.process(&accept).map_err(|e| e.to_string())?;
        }
    }
    if msg_type.is_transmit() {
        let op = op.ok_or_else(|| format!("{} message has no {} header", local_type, header::OP))?;
        let trigger = Transition::new(local_type, op, peer).trigger();
        fsm.process(&trigger).map_err(|e| e.to_string())?;
    }
    Ok(())
}

#[async_trait]
impl Interceptor for ConversationMonitor {
    fn name(&self) -> &str {
        "conversation-monitor"
    }

    async fn outgoing(&self, invocation: Invocation) -> Invocation {
        self.check(invocation).await
    }

    async fn incoming(&self, invocation: Invocation) -> Invocation {
        self.check(invocation).await
    }
}
