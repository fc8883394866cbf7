//! Message header keys and the `conv-msg-type` bitmask.

use std::collections::BTreeMap;

/// Message metadata. Every value is carried as a string; numeric fields are parsed on read.
pub type Headers = BTreeMap<String, String>;

pub const CONV_ID: &str = "conv-id";
pub const CONV_SEQ: &str = "conv-seq";
pub const CONV_MSG_TYPE: &str = "conv-msg-type";
pub const SENDER_ROLE: &str = "sender-role";
pub const RECEIVER_ROLE: &str = "receiver-role";
pub const REPLY_TO: &str = "reply-to";
pub const RECEIVER: &str = "receiver";
pub const PROTOCOL: &str = "protocol";
pub const OP: &str = "op";
pub const LANGUAGE: &str = "language";
pub const ENCODING: &str = "encoding";
pub const FORMAT: &str = "format";
/// Free-text reason carried by REJECT.
pub const REJECT_REASON: &str = "reject-reason";
/// Added by the channel on delivery.
pub const ROUTING_KEY: &str = "routing_key";

const TRANSMIT_BITS: u8 = 1;
const INVITE_BITS: u8 = 8;
const ACCEPT_BITS: u8 = 16;
const REJECT_BITS: u8 = 24;
const IN_SESSION_MASK: u8 = 7;
const CONTROL_MASK: u8 = 56;

/// In-session part of `conv-msg-type` (low three bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Transmit,
}

/// Control part of `conv-msg-type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Invite,
    Accept,
    Reject,
}

/// Decoded `conv-msg-type`. Either half may be absent (a pure control message carries no
/// session type; a plain in-session message carries no control type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgType {
    pub session: Option<SessionType>,
    pub control: Option<ControlType>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header {0} is not set")]
    Missing(&'static str),
    #[error("header {key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("unknown conv-msg-type bits {0:#x}")]
    UnknownMsgType(u8),
}

impl MsgType {
    pub const TRANSMIT: MsgType = MsgType {
        session: Some(SessionType::Transmit),
        control: None,
    };

    pub fn control(control: ControlType) -> Self {
        Self {
            session: None,
            control: Some(control),
        }
    }

    pub fn with_control(self, control: ControlType) -> Self {
        Self {
            control: Some(control),
            ..self
        }
    }

    pub fn from_bits(bits: u8) -> Result<Self, HeaderError> {
        let session = match bits & IN_SESSION_MASK {
            0 => None,
            TRANSMIT_BITS => Some(SessionType::Transmit),
            _ => return Err(HeaderError::UnknownMsgType(bits)),
        };
        let control = match bits & CONTROL_MASK {
            0 => None,
            INVITE_BITS => Some(ControlType::Invite),
            ACCEPT_BITS => Some(ControlType::Accept),
            REJECT_BITS => Some(ControlType::Reject),
            _ => return Err(HeaderError::UnknownMsgType(bits)),
        };
        if bits & !(IN_SESSION_MASK | CONTROL_MASK) != 0 {
            return Err(HeaderError::UnknownMsgType(bits));
        }
        Ok(Self { session, control })
    }

    pub fn bits(&self) -> u8 {
        let session = match self.session {
            Some(SessionType::Transmit) => TRANSMIT_BITS,
            None => 0,
        };
        let control = match self.control {
            Some(ControlType::Invite) => INVITE_BITS,
            Some(ControlType::Accept) => ACCEPT_BITS,
            Some(ControlType::Reject) => REJECT_BITS,
            None => 0,
        };
        session | control
    }

    /// Decode from the `conv-msg-type` header.
    pub fn from_headers(headers: &Headers) -> Result<Self, HeaderError> {
        let raw = headers
            .get(CONV_MSG_TYPE)
            .ok_or(HeaderError::Missing(CONV_MSG_TYPE))?;
        let bits = raw.trim().parse::<u8>().map_err(|_| HeaderError::Invalid {
            key: CONV_MSG_TYPE,
            value: raw.clone(),
        })?;
        Self::from_bits(bits)
    }

    pub fn is_transmit(&self) -> bool {
        self.session == Some(SessionType::Transmit)
    }
}

/// `conv-seq` as an integer, if present and well formed.
pub fn conv_seq(headers: &Headers) -> Option<u64> {
    headers.get(CONV_SEQ).and_then(|s| s.trim().parse().ok())
}

/// Required string header.
pub fn require<'a>(headers: &'a Headers, key: &'static str) -> Result<&'a str, HeaderError> {
    headers
        .get(key)
        .map(String::as_str)
        .ok_or(HeaderError::Missing(key))
}
