//! Request/response as a two-role conversation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::conversation::{Conversation, ConversationError};
use crate::endpoint::{ConversationEndpoint, Message};
use crate::header::{self, Headers};
use crate::name::NameTrio;
use crate::node::Node;
use crate::principal::Principal;

/// Roles and protocol name of an RPC exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConversation {
    pub protocol: String,
    pub server_role: String,
    pub client_role: String,
}

impl Default for RpcConversation {
    fn default() -> Self {
        Self {
            protocol: "rpc".to_string(),
            server_role: "server".to_string(),
            client_role: "client".to_string(),
        }
    }
}

pub const REQUEST_OP: &str = "request";
pub const RESPONSE_OP: &str = "response";

pub struct RpcClient {
    node: Node,
    server: NameTrio,
    rpc: RpcConversation,
}

impl RpcClient {
    /// Client for the server principal listening at `server`.
    pub fn new(node: Node, server: NameTrio) -> Self {
        Self {
            node,
            server,
            rpc: RpcConversation::default(),
        }
    }

    pub fn with_conversation(mut self, rpc: RpcConversation) -> Self {
        self.rpc = rpc;
        self
    }

    /// One request in a fresh conversation. The invite rides on the request; the conversation
    /// is closed whatever the outcome.
    pub async fn request(
        &self,
        msg: Vec<u8>,
        mut headers: Headers,
        timeout: Duration,
    ) -> Result<Message, ConversationError> {
        let conversation = Arc::new(Conversation::new(
            self.node.conversation_ids().next_id(),
            self.rpc.protocol.clone(),
        ));
        let endpoint = ConversationEndpoint::join(
            &self.node,
            self.rpc.client_role.clone(),
            &NameTrio::anonymous(self.server.exchange()),
            conversation,
            true,
        )
        .await?;
        headers
            .entry(header::OP.to_string())
            .or_insert_with(|| REQUEST_OP.to_string());
        let server_role = &self.rpc.server_role;
        let outcome = async {
            endpoint
                .invite(server_role, Some(self.server.clone()), true)
                .await?;
            endpoint.send_with_headers(server_role, msg, headers).await?;
            endpoint.recv_timeout(server_role, timeout).await
        }
        .await;
        if let Err(e) = endpoint.close().await {
            tracing::debug!(error = %e, "rpc client endpoint close failed");
        }
        outcome
    }

    /// [`RpcClient::request`] waiting `endpoint.receive_timeout_secs` for the response.
    pub async fn call(&self, msg: Vec<u8>, headers: Headers) -> Result<Message, ConversationError> {
        let timeout = self.node.config().endpoint.receive_timeout();
        self.request(msg, headers, timeout).await
    }
}

pub struct RpcServer {
    principal: Principal,
    rpc: RpcConversation,
}

impl RpcServer {
    /// Server reachable at `<sys_name>.<name>`.
    pub fn new(node: Node, name: impl Into<String>) -> Self {
        Self {
            principal: Principal::new(node, name),
            rpc: RpcConversation::default(),
        }
    }

    pub fn with_conversation(mut self, rpc: RpcConversation) -> Self {
        self.rpc = rpc;
        self
    }

    pub fn address(&self) -> &NameTrio {
        self.principal.address()
    }

    pub async fn listen(&self) -> Result<(), ConversationError> {
        self.principal.start_listening().await
    }

    /// Accept the next invitation, hand its request to `handler` and send back what it returns.
    pub async fn serve_one<F, Fut>(&self, handler: F) -> Result<(), ConversationError>
    where
        F: FnOnce(Message) -> Fut,
        Fut: Future<Output = Vec<u8>>,
    {
        let invitation = self.principal.get_invitation().await?;
        if invitation.to_role != self.rpc.server_role {
            let role = invitation.to_role.clone();
            self.principal
                .reject_invitation(invitation, Some("not an rpc server role"))
                .await?;
            return Err(ConversationError::UnknownRole(role));
        }
        let client_role = invitation.from_role.clone();
        let endpoint = self.principal.accept_invitation(invitation, false).await?;
        let outcome = async {
            let request = endpoint.recv(&client_role).await?;
            let response = handler(request).await;
            endpoint.send(&client_role, RESPONSE_OP, response).await
        }
        .await;
        if let Err(e) = endpoint.close().await {
            tracing::debug!(error = %e, "rpc server endpoint close failed");
        }
        outcome
    }

    pub async fn stop(&self) -> Result<(), ConversationError> {
        self.principal.terminate().await
    }
}
