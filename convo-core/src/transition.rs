//! Protocol transitions: `(local type, label, peer role)` and their trigger strings.

use std::fmt;

/// Direction of a message relative to the monitored role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalType {
    Send,
    Recv,
}

impl LocalType {
    pub fn as_str(self) -> &'static str {
        match self {
            LocalType::Send => "SEND",
            LocalType::Recv => "RECV",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SEND" => Some(LocalType::Send),
            "RECV" | "RESV" => Some(LocalType::Recv),
            _ => None,
        }
    }
}

impl fmt::Display for LocalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transition {
    pub local_type: LocalType,
    pub label: String,
    pub role: String,
}

impl Transition {
    pub fn new(local_type: LocalType, label: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            local_type,
            label: label.into(),
            role: role.into(),
        }
    }

    /// FSM input symbol: `<TYPE>_<label>_<role lowercased>`.
    pub fn trigger(&self) -> String {
        format!(
            "{}_{}_{}",
            self.local_type,
            self.label,
            self.role.to_lowercase()
        )
    }

    /// Inverse of [`Transition::trigger`]. The label may itself contain underscores.
    pub fn parse(trigger: &str) -> Option<Self> {
        let (lt, rest) = trigger.split_once('_')?;
        let (label, role) = rest.rsplit_once('_')?;
        if label.is_empty() || role.is_empty() {
            return None;
        }
        Some(Self::new(LocalType::parse(lt)?, label, role))
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.trigger())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_lowercases_role() {
        let t = Transition::new(LocalType::Send, "request", "Server");
        assert_eq!(t.trigger(), "SEND_request_server");
    }

    #[test]
    fn parse_handles_underscored_labels() {
        let t = Transition::parse("RECV_get_quote_buyer").unwrap();
        assert_eq!(t.local_type, LocalType::Recv);
        assert_eq!(t.label, "get_quote");
        assert_eq!(t.role, "buyer");
        assert_eq!(Transition::parse("RESV_x_y").unwrap().local_type, LocalType::Recv);
        assert!(Transition::parse("SEND_onlyone").is_none());
        assert!(Transition::parse("PUSH_a_b").is_none());
    }
}
