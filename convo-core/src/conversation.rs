//! Conversations: an id, a protocol name and a role table.
//!
//! Each role slot is either pending (readers wait on a watch channel) or resolved to an
//! address. The first writer resolves a pending slot in place; readers that arrived earlier
//! wake with that address.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

use crate::channel::ChannelError;
use crate::codec::CodecError;
use crate::header::HeaderError;
use crate::name::NameTrio;

#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("role {0} is not part of this conversation")]
    UnknownRole(String),
    #[error("role {role} rejected the conversation: {}", .reason.as_deref().unwrap_or("no reason given"))]
    Rejected {
        role: String,
        reason: Option<String>,
    },
    #[error("no address for role {0}")]
    MissingAddress(String),
    #[error("address of role {role} not resolved within {timeout:?}")]
    ResolveTimeout { role: String, timeout: Duration },
    #[error("send to role {role} failed: {source}")]
    SendFailed {
        role: String,
        #[source]
        source: ChannelError,
    },
    #[error("no message from role {role} within {timeout:?}")]
    RecvTimeout { role: String, timeout: Duration },
    #[error("conversation endpoint is closed")]
    Closed,
    #[error("invitation header: {0}")]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

enum RoleSlot {
    Pending(watch::Sender<Option<NameTrio>>),
    Resolved(NameTrio),
}

fn pending_slot() -> RoleSlot {
    let (tx, _) = watch::channel(None);
    RoleSlot::Pending(tx)
}

pub struct Conversation {
    id: String,
    protocol: String,
    roles: Mutex<HashMap<String, RoleSlot>>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            protocol: protocol.into(),
            roles: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RoleSlot>> {
        self.roles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `role`'s address, waking anyone waiting on it. A later call overwrites.
    pub fn set(&self, role: &str, addr: NameTrio) {
        let mut roles = self.lock();
        if let Some(RoleSlot::Pending(tx)) = roles.get(role) {
            tx.send_replace(Some(addr.clone()));
        }
        roles.insert(role.to_string(), RoleSlot::Resolved(addr));
    }

    /// Address of `role` if already known.
    pub fn get(&self, role: &str) -> Option<NameTrio> {
        match self.lock().get(role) {
            Some(RoleSlot::Resolved(addr)) => Some(addr.clone()),
            _ => None,
        }
    }

    pub fn is_resolved(&self, role: &str) -> bool {
        self.get(role).is_some()
    }

    /// Roles with a known address.
    pub fn resolved_roles(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, RoleSlot::Resolved(_)))
            .map(|(role, _)| role.clone())
            .collect();
        out.sort();
        out
    }

    /// Wait until `role` has an address. Returns at once when it is already resolved.
    pub async fn resolve(&self, role: &str) -> Result<NameTrio, ConversationError> {
        let mut rx = {
            let mut roles = self.lock();
            match roles.entry(role.to_string()).or_insert_with(pending_slot) {
                RoleSlot::Resolved(addr) => return Ok(addr.clone()),
                RoleSlot::Pending(tx) => tx.subscribe(),
            }
        };
        loop {
            if let Some(addr) = rx.borrow_and_update().clone() {
                return Ok(addr);
            }
            if rx.changed().await.is_err() {
                return self
                    .get(role)
                    .ok_or_else(|| ConversationError::MissingAddress(role.to_string()));
            }
        }
    }

    pub async fn resolve_within(
        &self,
        role: &str,
        timeout: Duration,
    ) -> Result<NameTrio, ConversationError> {
        tokio::time::timeout(timeout, self.resolve(role))
            .await
            .map_err(|_| ConversationError::ResolveTimeout {
                role: role.to_string(),
                timeout,
            })?
    }
}

/// Conversation id generator: `<root>-<n>` with a mutex-guarded counter.
pub struct ConversationIds {
    root: String,
    counter: Mutex<u64>,
}

impl ConversationIds {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            counter: Mutex::new(0),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn next_id(&self) -> String {
        let mut n = self.counter.lock().unwrap_or_else(PoisonError::into_inner);
        *n += 1;
        format!("{}-{}", self.root, *n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn resolve_blocks_until_set() {
        let conv = Arc::new(Conversation::new("c-1", "rpc"));
        let waiter = {
            let conv = conv.clone();
            tokio::spawn(async move { conv.resolve("server").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        let addr = NameTrio::with_queue("sys", "amq.gen-9");
        conv.set("server", addr.clone());
        assert_eq!(waiter.await.unwrap().unwrap(), addr);
    }

    #[tokio::test]
    async fn resolved_role_never_blocks() {
        let conv = Conversation::new("c-1", "rpc");
        let addr = NameTrio::with_queue("sys", "x");
        conv.set("client", addr.clone());
        let got = tokio::time::timeout(Duration::from_millis(50), conv.resolve("client"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, addr);
        assert_eq!(conv.resolved_roles(), vec!["client".to_string()]);
    }

    #[tokio::test]
    async fn many_readers_one_writer() {
        let conv = Arc::new(Conversation::new("c-1", "rpc"));
        let mut readers = Vec::new();
        for _ in 0..4 {
            let conv = conv.clone();
            readers.push(tokio::spawn(async move { conv.resolve("b").await }));
        }
        tokio::task::yield_now().await;
        let addr = NameTrio::with_queue("sys", "b");
        conv.set("b", addr.clone());
        for r in readers {
            assert_eq!(r.await.unwrap().unwrap(), addr);
        }
    }

    #[tokio::test]
    async fn resolve_within_times_out() {
        let conv = Conversation::new("c-1", "rpc");
        let err = conv
            .resolve_within("nobody", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ConversationError::ResolveTimeout { role, .. } if role == "nobody"));
    }

    #[test]
    fn set_overwrites_resolved() {
        let conv = Conversation::new("c-1", "rpc");
        conv.set("a", NameTrio::with_queue("sys", "1"));
        conv.set("a", NameTrio::with_queue("sys", "2"));
        assert_eq!(conv.get("a"), Some(NameTrio::with_queue("sys", "2")));
    }

    #[test]
    fn ids_are_unique_and_rooted() {
        let ids = ConversationIds::new("node-a");
        let seen: HashSet<String> = (0..100).map(|_| ids.next_id()).collect();
        assert_eq!(seen.len(), 100);
        assert!(seen.contains("node-a-1"));
        assert!(seen.contains("node-a-100"));
    }
}
