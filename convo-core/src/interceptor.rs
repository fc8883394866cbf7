//! Interceptors: hooks every conversation message passes through on its way out and in.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::header::Headers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Path {
    Out,
    In,
}

/// Governance verdict attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    Accept,
    Reject,
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConversationStatus::Accept => "accept",
            ConversationStatus::Reject => "reject",
        })
    }
}

/// A message failed the protocol check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("protocol violation: {reason}")]
pub struct ProtocolViolation {
    pub reason: String,
}

/// Out-of-band notes interceptors attach to a message. Never sent on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotations {
    pub conversation_status: Option<ConversationStatus>,
    pub reason: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl Annotations {
    pub fn reject(&mut self, reason: impl Into<String>) {
        self.conversation_status = Some(ConversationStatus::Reject);
        self.reason = Some(reason.into());
    }

    pub fn accept(&mut self) {
        if self.conversation_status.is_none() {
            self.conversation_status = Some(ConversationStatus::Accept);
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.conversation_status == Some(ConversationStatus::Reject)
    }

    /// Governance check: a rejected message becomes a [`ProtocolViolation`].
    pub fn check(&self) -> Result<(), ProtocolViolation> {
        if self.is_rejected() {
            return Err(ProtocolViolation {
                reason: self
                    .reason
                    .clone()
                    .unwrap_or_else(|| "rejected by conversation monitor".to_string()),
            });
        }
        Ok(())
    }
}

/// One message in flight through the stack.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub path: Path,
    pub message: Vec<u8>,
    pub headers: Headers,
    pub annotations: Annotations,
}

impl Invocation {
    pub fn new(path: Path, message: Vec<u8>, headers: Headers) -> Self {
        Self {
            path,
            message,
            headers,
            annotations: Annotations::default(),
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    async fn outgoing(&self, invocation: Invocation) -> Invocation {
        invocation
    }

    async fn incoming(&self, invocation: Invocation) -> Invocation {
        invocation
    }
}

/// Ordered interceptors. Outgoing messages run front to back, incoming back to front.
#[derive(Clone, Default)]
pub struct InterceptorStack {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.push(interceptor);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.interceptors.iter().map(|i| i.name().to_string()).collect()
    }

    pub async fn process(&self, mut invocation: Invocation) -> Invocation {
        match invocation.path {
            Path::Out => {
                for i in &self.interceptors {
                    invocation = i.outgoing(invocation).await;
                }
            }
            Path::In => {
                for i in self.interceptors.iter().rev() {
                    invocation = i.incoming(invocation).await;
                }
            }
        }
        invocation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tag(&'static str);

    #[async_trait]
    impl Interceptor for Tag {
        fn name(&self) -> &str {
            self.0
        }

        async fn outgoing(&self, mut inv: Invocation) -> Invocation {
            let trail = inv.annotations.extra.entry("trail".into()).or_default();
            trail.push_str(self.0);
            inv
        }

        async fn incoming(&self, mut inv: Invocation) -> Invocation {
            let trail = inv.annotations.extra.entry("trail".into()).or_default();
            trail.push_str(self.0);
            inv
        }
    }

    #[tokio::test]
    async fn order_reverses_on_the_way_in() {
        let stack = InterceptorStack::new()
            .with(Arc::new(Tag("a")))
            .with(Arc::new(Tag("b")));
        let out = stack
            .process(Invocation::new(Path::Out, vec![], Headers::new()))
            .await;
        assert_eq!(out.annotations.extra["trail"], "ab");
        let inb = stack
            .process(Invocation::new(Path::In, vec![], Headers::new()))
            .await;
        assert_eq!(inb.annotations.extra["trail"], "ba");
        assert_eq!(stack.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn check_turns_reject_into_violation() {
        let mut a = Annotations::default();
        assert!(a.check().is_ok());
        a.accept();
        assert!(a.check().is_ok());
        a.reject("unexpected request");
        assert_eq!(
            a.check(),
            Err(ProtocolViolation {
                reason: "unexpected request".into()
            })
        );
        // a later accept does not clear a rejection
        a.accept();
        assert!(a.is_rejected());
    }
}
