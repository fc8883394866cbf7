//! Broker addressing: the (exchange, queue, binding) triple used wherever a name is passed.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Address of a receiving location on the broker.
///
/// `binding` falls back to `queue` when not given explicitly. Values are never mutated once
/// handed out; a declare returns a new trio carrying the broker-assigned queue name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NameTrio {
    exchange: String,
    queue: Option<String>,
    binding: Option<String>,
}

impl NameTrio {
    pub fn new(exchange: impl Into<String>, queue: Option<String>, binding: Option<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.filter(|q| !q.is_empty()),
            binding: binding.filter(|b| !b.is_empty()),
        }
    }

    /// Exchange plus named queue, binding defaulting to the queue.
    pub fn with_queue(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self::new(exchange, Some(queue.into()), None)
    }

    /// Exchange only; the broker picks the queue name on declare.
    pub fn anonymous(exchange: impl Into<String>) -> Self {
        Self::new(exchange, None, None)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Routing key to bind or publish with: explicit binding, else the queue name.
    pub fn binding(&self) -> Option<&str> {
        self.binding.as_deref().or(self.queue.as_deref())
    }

    /// Queue name namespaced under the exchange: `<exchange>.<queue>`. Names already carrying
    /// the prefix, and broker-generated `amq.*` names, are returned unchanged.
    pub fn qualified_queue(&self) -> Option<String> {
        let queue = self.queue.as_deref()?;
        let prefix = format!("{}.", self.exchange);
        if queue.starts_with(&prefix) || queue.starts_with("amq.") {
            Some(queue.to_string())
        } else {
            Some(format!("{}{}", prefix, queue))
        }
    }

    /// The binding as given, without the queue fallback.
    pub fn explicit_binding(&self) -> Option<&str> {
        self.binding.as_deref()
    }

    /// Routing key a sender publishes with: the explicit binding, else the qualified queue.
    pub fn routing_key(&self) -> Option<String> {
        match &self.binding {
            Some(b) => Some(b.clone()),
            None => self.qualified_queue(),
        }
    }

    /// `exchange,queue` form carried in `reply-to` and `receiver` headers.
    pub fn to_header_value(&self) -> String {
        format!("{},{}", self.exchange, self.queue.as_deref().unwrap_or(""))
    }

    /// Parse the `exchange,queue` header form. Whitespace around each part is ignored.
    pub fn from_header_value(value: &str) -> Option<Self> {
        let (exchange, queue) = value.split_once(',')?;
        let exchange = exchange.trim();
        if exchange.is_empty() {
            return None;
        }
        Some(Self::new(exchange, Some(queue.trim().to_string()), None))
    }
}

impl fmt::Display for NameTrio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.exchange,
            self.queue.as_deref().unwrap_or("-"),
            self.binding().unwrap_or("-")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_defaults_to_queue() {
        let n = NameTrio::with_queue("ex", "q1");
        assert_eq!(n.binding(), Some("q1"));
        let anon = NameTrio::anonymous("ex");
        assert_eq!(anon.binding(), None);
        let explicit = NameTrio::new("ex", Some("q1".into()), Some("k.*".into()));
        assert_eq!(explicit.binding(), Some("k.*"));
    }

    #[test]
    fn empty_parts_are_absent() {
        let n = NameTrio::new("ex", Some(String::new()), Some(String::new()));
        assert_eq!(n.queue(), None);
        assert_eq!(n.binding(), None);
    }

    #[test]
    fn header_value_parses_with_whitespace() {
        let n = NameTrio::from_header_value(" sys , sys.alice ").unwrap();
        assert_eq!(n.exchange(), "sys");
        assert_eq!(n.queue(), Some("sys.alice"));
        assert_eq!(n.to_header_value(), "sys,sys.alice");
        assert!(NameTrio::from_header_value("no-comma").is_none());
        assert!(NameTrio::from_header_value(",q").is_none());
    }

    #[test]
    fn qualified_queue_prefixes_once() {
        assert_eq!(
            NameTrio::with_queue("sys", "alice").qualified_queue().as_deref(),
            Some("sys.alice")
        );
        assert_eq!(
            NameTrio::with_queue("sys", "sys.alice").qualified_queue().as_deref(),
            Some("sys.alice")
        );
        assert_eq!(
            NameTrio::with_queue("sys", "amq.gen-1f").routing_key().as_deref(),
            Some("amq.gen-1f")
        );
        let explicit = NameTrio::new("sys", Some("alice".into()), Some("k".into()));
        assert_eq!(explicit.routing_key().as_deref(), Some("k"));
        assert_eq!(NameTrio::anonymous("sys").routing_key(), None);
    }
}
