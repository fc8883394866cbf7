//! Principals: named parties that start conversations and accept invitations to them.
//!
//! A listening principal consumes its well-known address `<sys_name>.<name>`. Every INVITE
//! arriving there becomes an [`Invitation`]; anything else is dropped.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelError, ChannelKind};
use crate::conversation::{Conversation, ConversationError};
use crate::endpoint::ConversationEndpoint;
use crate::header::{self, ControlType, Headers, MsgType};
use crate::name::NameTrio;
use crate::node::Node;
use crate::transport::Delivery;

/// An INVITE waiting for an answer.
#[derive(Debug, Clone)]
pub struct Invitation {
    pub conversation_id: String,
    pub protocol: String,
    /// Inviting role.
    pub from_role: String,
    /// Role this principal is invited to play.
    pub to_role: String,
    pub reply_to: Option<NameTrio>,
    delivery: Delivery,
}

impl Invitation {
    fn from_delivery(delivery: Delivery) -> Result<Self, header::HeaderError> {
        let h = &delivery.headers;
        Ok(Self {
            conversation_id: header::require(h, header::CONV_ID)?.to_string(),
            protocol: h.get(header::PROTOCOL).cloned().unwrap_or_default(),
            from_role: header::require(h, header::SENDER_ROLE)?.to_string(),
            to_role: header::require(h, header::RECEIVER_ROLE)?.to_string(),
            reply_to: h
                .get(header::REPLY_TO)
                .and_then(|v| NameTrio::from_header_value(v)),
            delivery,
        })
    }

    pub fn headers(&self) -> &Headers {
        &self.delivery.headers
    }

    /// Payload of a merged invite; empty for a bare INVITE.
    pub fn body(&self) -> &[u8] {
        &self.delivery.body
    }
}

struct Listening {
    channel: Arc<Channel>,
    task: JoinHandle<()>,
}

pub struct Principal {
    node: Node,
    name: String,
    address: NameTrio,
    listening: Mutex<Option<Listening>>,
    invitations: Mutex<Option<mpsc::UnboundedReceiver<Invitation>>>,
    endpoints: StdMutex<Vec<ConversationEndpoint>>,
}

impl Principal {
    pub fn new(node: Node, name: impl Into<String>) -> Self {
        let name = name.into();
        let address = NameTrio::with_queue(node.config().messaging.sys_name.clone(), name.clone());
        Self {
            node,
            name,
            address,
            listening: Mutex::new(None),
            invitations: Mutex::new(None),
            endpoints: StdMutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Well-known address invitations are sent to.
    pub fn address(&self) -> &NameTrio {
        &self.address
    }

    fn base_name(&self) -> NameTrio {
        NameTrio::anonymous(self.address.exchange())
    }

    fn track(&self, endpoint: &ConversationEndpoint) {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(endpoint.clone());
    }

    /// Start taking invitations. Already listening is not an error.
    pub async fn start_listening(&self) -> Result<(), ConversationError> {
        let mut listening = self.listening.lock().await;
        if listening.is_some() {
            return Ok(());
        }
        let channel = self
            .node
            .channel(ChannelKind::Listen)
            .await
            .map_err(ChannelError::from)?;
        let setup: Result<(), ChannelError> = async {
            channel.setup_listener(&self.address, None).await?;
            channel.start_consume().await
        }
        .await;
        if let Err(e) = setup {
            let _ = channel.close().await;
            return Err(e.into());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(invitation_loop(channel.clone(), tx, self.name.clone()));
        *self.invitations.lock().await = Some(rx);
        *listening = Some(Listening { channel, task });
        tracing::info!(principal = %self.name, address = %self.address, "listening for invitations");
        Ok(())
    }

    /// Next invitation. Fails with `Closed` once listening stops.
    pub async fn get_invitation(&self) -> Result<Invitation, ConversationError> {
        let mut guard = self.invitations.lock().await;
        let rx = guard.as_mut().ok_or(ConversationError::Closed)?;
        rx.recv().await.ok_or(ConversationError::Closed)
    }

    pub async fn get_invitation_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Invitation, ConversationError> {
        tokio::time::timeout(timeout, self.get_invitation())
            .await
            .map_err(|_| ConversationError::RecvTimeout {
                role: self.name.clone(),
                timeout,
            })?
    }

    /// Join the invitation's conversation in the invited role. The invite itself is replayed
    /// into the new endpoint, so a merged payload is the first thing `recv` returns. With
    /// `auto_reply` a bare ACCEPT goes back at once.
    pub async fn accept_invitation(
        &self,
        invitation: Invitation,
        auto_reply: bool,
    ) -> Result<ConversationEndpoint, ConversationError> {
        let conversation = Arc::new(Conversation::new(
            invitation.conversation_id.clone(),
            invitation.protocol.clone(),
        ));
        let endpoint = ConversationEndpoint::join(
            &self.node,
            invitation.to_role.clone(),
            &self.base_name(),
            conversation,
            false,
        )
        .await?;
        self.track(&endpoint);
        let from_role = invitation.from_role.clone();
        endpoint.replay(invitation.delivery).await;
        if auto_reply {
            endpoint.send_accept(&from_role).await?;
        }
        tracing::info!(
            principal = %self.name,
            conv_id = %endpoint.conversation().id(),
            role = %endpoint.role(),
            "invitation accepted"
        );
        Ok(endpoint)
    }

    /// Answer with REJECT. The inviter's next interaction with the invited role fails.
    pub async fn reject_invitation(
        &self,
        invitation: Invitation,
        reason: Option<&str>,
    ) -> Result<(), ConversationError> {
        let reply_to = invitation
            .reply_to
            .clone()
            .ok_or_else(|| ConversationError::MissingAddress(invitation.from_role.clone()))?;
        let seq = header::conv_seq(invitation.headers()).unwrap_or(0) + 1;
        let mut headers = Headers::new();
        let stamp = [
            (header::CONV_ID, invitation.conversation_id.clone()),
            (header::CONV_SEQ, seq.to_string()),
            (
                header::CONV_MSG_TYPE,
                MsgType::control(ControlType::Reject).bits().to_string(),
            ),
            (header::SENDER_ROLE, invitation.to_role.clone()),
            (header::RECEIVER_ROLE, invitation.from_role.clone()),
            (header::PROTOCOL, invitation.protocol.clone()),
            (header::RECEIVER, reply_to.to_header_value()),
        ];
        for (k, v) in stamp {
            headers.insert(k.to_string(), v);
        }
        if let Some(reason) = reason {
            headers.insert(header::REJECT_REASON.to_string(), reason.to_string());
        }
        let channel = self
            .node
            .channel(ChannelKind::Send)
            .await
            .map_err(ChannelError::from)?;
        let sent = channel.send_mandatory(&reply_to, Vec::new(), headers).await;
        let _ = channel.close().await;
        sent.map_err(|source| ConversationError::SendFailed {
            role: invitation.from_role.clone(),
            source,
        })?;
        tracing::info!(
            principal = %self.name,
            conv_id = %invitation.conversation_id,
            from = %invitation.from_role,
            "invitation rejected"
        );
        Ok(())
    }

    /// Open a new conversation as its originator, playing `role`.
    pub async fn start_conversation(
        &self,
        protocol: &str,
        role: &str,
    ) -> Result<ConversationEndpoint, ConversationError> {
        let conversation = Arc::new(Conversation::new(
            self.node.conversation_ids().next_id(),
            protocol,
        ));
        let endpoint =
            ConversationEndpoint::join(&self.node, role, &self.base_name(), conversation, true)
                .await?;
        self.track(&endpoint);
        Ok(endpoint)
    }

    /// Stop taking invitations and delete the well-known queue. Pending `get_invitation` calls
    /// drain what is already queued, then fail with `Closed`.
    pub async fn stop_listening(&self) -> Result<(), ConversationError> {
        let Some(listening) = self.listening.lock().await.take() else {
            return Ok(());
        };
        let closed = listening.channel.close().await;
        let join = self.node.config().endpoint.listener_join_timeout();
        let mut task = listening.task;
        if tokio::time::timeout(join, &mut task).await.is_err() {
            tracing::warn!(principal = %self.name, "invitation listener did not stop in time, aborting");
            task.abort();
        }
        tracing::info!(principal = %self.name, "stopped listening");
        closed.map_err(ConversationError::from)
    }

    /// Stop listening and close every endpoint this principal opened.
    pub async fn terminate(&self) -> Result<(), ConversationError> {
        self.stop_listening().await?;
        let endpoints: Vec<ConversationEndpoint> = self
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for endpoint in endpoints {
            if let Err(e) = endpoint.close().await {
                tracing::warn!(principal = %self.name, role = %endpoint.role(), error = %e, "endpoint close failed");
            }
        }
        Ok(())
    }
}

async fn invitation_loop(
    channel: Arc<Channel>,
    tx: mpsc::UnboundedSender<Invitation>,
    principal: String,
) {
    loop {
        let delivery = match channel.recv().await {
            Ok(d) => d,
            Err(ChannelError::Closed) => {
                tracing::debug!(principal = %principal, "invitation channel closed");
                break;
            }
            Err(e) => {
                tracing::warn!(principal = %principal, error = %e, "invitation listener failed");
                break;
            }
        };
        let tag = delivery.delivery_tag;
        let is_invite = MsgType::from_headers(&delivery.headers)
            .map(|t| t.control == Some(ControlType::Invite))
            .unwrap_or(false);
        let invitation = if is_invite {
            Invitation::from_delivery(delivery).map_err(|e| e.to_string())
        } else {
            Err("not an invitation".to_string())
        };
        match invitation {
            Ok(inv) => {
                tracing::debug!(principal = %principal, conv_id = %inv.conversation_id, from = %inv.from_role, "invitation received");
                let _ = tx.send(inv);
                if let Err(e) = channel.ack(tag).await {
                    tracing::debug!(error = %e, "ack failed");
                }
            }
            Err(reason) => {
                tracing::warn!(principal = %principal, reason = %reason, "dropping message on invitation address");
                if let Err(e) = channel.reject(tag, false).await {
                    tracing::debug!(error = %e, "reject failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::config::Config;
    use crate::endpoint::SessionState;

    const WAIT: Duration = Duration::from_secs(2);

    async fn node() -> Node {
        Node::start_with_broker(Config::default(), Broker::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn invite_accept_ping_pong() {
        let node = node().await;
        let alice = Principal::new(node.clone(), "alice");
        let bob = Principal::new(node.clone(), "bob");
        bob.start_listening().await.unwrap();

        let client = alice.start_conversation("rpc", "client").await.unwrap();
        client
            .invite("server", Some(bob.address().clone()), true)
            .await
            .unwrap();
        client.send("server", "ping", b"ping".to_vec()).await.unwrap();

        let inv = bob.get_invitation_timeout(WAIT).await.unwrap();
        assert_eq!(inv.from_role, "client");
        assert_eq!(inv.to_role, "server");
        assert_eq!(inv.conversation_id, client.conversation().id());
        assert_eq!(
            inv.headers().get(header::CONV_MSG_TYPE).map(String::as_str),
            Some("9")
        );
        assert_eq!(inv.body(), b"ping");

        let server = bob.accept_invitation(inv, false).await.unwrap();
        let m = server.recv_timeout("client", WAIT).await.unwrap();
        assert_eq!(m.body, b"ping");
        server.send("client", "pong", b"pong".to_vec()).await.unwrap();

        let reply = client.recv_timeout("server", WAIT).await.unwrap();
        assert_eq!(reply.body, b"pong");
        assert_eq!(reply.header(header::CONV_MSG_TYPE), Some("17"));

        alice.terminate().await.unwrap();
        bob.terminate().await.unwrap();
        assert!(client.is_closed());
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn bare_invite_with_auto_accept() {
        let node = node().await;
        let alice = Principal::new(node.clone(), "alice");
        let bob = Principal::new(node.clone(), "bob");
        bob.start_listening().await.unwrap();

        let client = alice.start_conversation("rpc", "client").await.unwrap();
        client
            .invite("server", Some(bob.address().clone()), false)
            .await
            .unwrap();
        let inv = bob.get_invitation_timeout(WAIT).await.unwrap();
        assert!(inv.body().is_empty());
        let server = bob.accept_invitation(inv, true).await.unwrap();

        // goes to the address carried by the ACCEPT, not to bob's well-known queue
        client.send("server", "ping", vec![7]).await.unwrap();
        let m = server.recv_timeout("client", WAIT).await.unwrap();
        assert_eq!(m.body, vec![7]);
        assert_eq!(m.header(header::CONV_MSG_TYPE), Some("1"));
        assert!(client.session_state("server") >= SessionState::Accepted);

        alice.terminate().await.unwrap();
        bob.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_invitation_fails_next_interaction() {
        let node = node().await;
        let alice = Principal::new(node.clone(), "alice");
        let bob = Principal::new(node.clone(), "bob");
        bob.start_listening().await.unwrap();

        let client = alice.start_conversation("rpc", "client").await.unwrap();
        client
            .invite("server", Some(bob.address().clone()), true)
            .await
            .unwrap();
        client.send("server", "ping", vec![]).await.unwrap();
        let inv = bob.get_invitation_timeout(WAIT).await.unwrap();
        bob.reject_invitation(inv, Some("busy")).await.unwrap();

        let err = client.recv_timeout("server", WAIT).await.unwrap_err();
        assert!(
            matches!(&err, ConversationError::Rejected { role, reason } if role == "server" && reason.as_deref() == Some("busy")),
            "{}",
            err
        );
        assert!(matches!(
            client.send("server", "ping", vec![]).await,
            Err(ConversationError::Rejected { .. })
        ));
        assert_eq!(client.session_state("server"), SessionState::Closed);
        alice.terminate().await.unwrap();
        bob.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn non_invites_are_dropped() {
        let node = node().await;
        let bob = Principal::new(node.clone(), "bob");
        bob.start_listening().await.unwrap();
        let ch = node.channel(ChannelKind::Send).await.unwrap();
        let mut headers = Headers::new();
        headers.insert(header::CONV_MSG_TYPE.to_string(), "1".to_string());
        ch.send_to(bob.address(), vec![1], headers).await.unwrap();
        assert!(matches!(
            bob.get_invitation_timeout(Duration::from_millis(100)).await,
            Err(ConversationError::RecvTimeout { .. })
        ));
        ch.close().await.unwrap();
        bob.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn stop_listening_ends_invitations() {
        let node = node().await;
        let bob = Principal::new(node.clone(), "bob");
        bob.start_listening().await.unwrap();
        bob.start_listening().await.unwrap();
        bob.stop_listening().await.unwrap();
        assert!(matches!(
            bob.get_invitation().await,
            Err(ConversationError::Closed)
        ));
        bob.stop_listening().await.unwrap();
    }
}
