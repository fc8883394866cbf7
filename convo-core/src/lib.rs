//! Conversation-checked messaging over a message broker.
//!
//! Layers, bottom up: the broker adapter ([`transport`], with an in-process [`broker`] and a
//! TCP link in [`remote`]), channels and pooling ([`channel`], [`node`]), conversations
//! ([`conversation`], [`endpoint`], [`principal`], [`rpc`]) and protocol monitoring
//! ([`interceptor`], [`fsm`], [`spec`], [`monitor`]).

pub mod bridge;
pub mod broker;
pub mod channel;
pub mod codec;
pub mod config;
pub mod conversation;
pub mod endpoint;
pub mod fsm;
pub mod header;
pub mod interceptor;
pub mod monitor;
pub mod name;
pub mod node;
pub mod pool;
pub mod principal;
pub mod remote;
pub mod rpc;
pub mod spec;
pub mod transition;
pub mod transport;
pub mod wire;

pub use broker::Broker;
pub use channel::{Channel, ChannelError, ChannelKind};
pub use config::{Config, ConfigError};
pub use conversation::{Conversation, ConversationError};
pub use endpoint::{ConversationEndpoint, Message};
pub use fsm::{Fsm, FsmError};
pub use header::{Headers, MsgType};
pub use interceptor::{Annotations, Interceptor, InterceptorStack, ProtocolViolation};
pub use monitor::{ConversationMonitor, EvictionPolicy};
pub use name::NameTrio;
pub use node::{ContainerError, Node};
pub use principal::{Invitation, Principal};
pub use rpc::{RpcClient, RpcServer};
pub use transport::{Connection, Transport, TransportError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
