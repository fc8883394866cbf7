//! Protocol specifications: per-role transition tables loaded from TOML.
//!
//! ```toml
//! initial = 1
//! final = 3
//!
//! [[transition]]
//! from = 1
//! on = "SEND_request_server"
//! to = 2
//!
//! [[transition]]
//! from = 2
//! on = "RECV_response_server"
//! to = 3
//! ```
//!
//! `catch` entries (`on`, `to`) fire for a symbol in any state, `any` entries (`from`, `to`)
//! for any symbol in a state, and an optional `default = { to = .. }` catches the rest.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::bridge::{BlockingBridge, BridgeError};
use crate::fsm::{Fsm, State, EMPTY};
use crate::transition::Transition;

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("read protocol spec {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse protocol spec {name}: {source}")]
    Parse {
        name: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("bad transition trigger {0:?}")]
    BadTrigger(String),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransitionSpec {
    pub from: State,
    pub on: String,
    /// Omitted: stay in `from`.
    #[serde(default)]
    pub to: Option<State>,
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatchSpec {
    pub on: String,
    pub to: State,
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnySpec {
    pub from: State,
    #[serde(default)]
    pub to: Option<State>,
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultSpec {
    pub to: State,
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterruptSpec {
    pub on: String,
    pub to: State,
}

/// Parsed form of one role's protocol.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransitionTable {
    pub initial: State,
    #[serde(default, rename = "final")]
    pub final_state: Option<State>,
    #[serde(default)]
    pub default: Option<DefaultSpec>,
    #[serde(default)]
    pub interrupt: Option<InterruptSpec>,
    #[serde(default, rename = "transition")]
    pub transitions: Vec<TransitionSpec>,
    #[serde(default, rename = "catch")]
    pub catches: Vec<CatchSpec>,
    #[serde(default)]
    pub any: Vec<AnySpec>,
}

fn check_trigger(symbol: &str) -> Result<(), SpecError> {
    if symbol == EMPTY || Transition::parse(symbol).is_some() {
        Ok(())
    } else {
        Err(SpecError::BadTrigger(symbol.to_string()))
    }
}

impl TransitionTable {
    pub fn from_toml_str(name: &str, s: &str) -> Result<Self, SpecError> {
        toml::from_str(s).map_err(|source| SpecError::Parse {
            name: name.to_string(),
            source,
        })
    }

    /// Replace generic operation labels (e.g. `request`) with concrete ones.
    pub fn instantiate_generics(&mut self, op_mapping: &HashMap<String, String>) {
        let rename = |symbol: &mut String| {
            if let Some(mut t) = Transition::parse(symbol) {
                if let Some(op) = op_mapping.get(&t.label) {
                    t.label = op.clone();
                    *symbol = t.trigger();
                }
            }
        };
        for t in &mut self.transitions {
            rename(&mut t.on);
        }
        for c in &mut self.catches {
            rename(&mut c.on);
        }
        if let Some(i) = &mut self.interrupt {
            rename(&mut i.on);
        }
    }

    /// Fresh state machine in the initial state.
    pub fn build(&self) -> Result<Fsm, SpecError> {
        let mut fsm = Fsm::new(self.initial);
        for t in &self.transitions {
            check_trigger(&t.on)?;
            fsm.add_transition(t.on.clone(), t.from, t.to, t.action.clone());
        }
        for c in &self.catches {
            check_trigger(&c.on)?;
            fsm.add_catch(c.on.clone(), c.to, c.action.clone());
        }
        for a in &self.any {
            fsm.add_transition_any(a.from, a.to, a.action.clone());
        }
        if let Some(d) = &self.default {
            fsm.set_default_transition(d.to, d.action.clone());
        }
        if let Some(i) = &self.interrupt {
            check_trigger(&i.on)?;
            fsm.set_interrupt(i.on.clone(), i.to);
        }
        if let Some(f) = self.final_state {
            fsm.set_final_state(f);
        }
        Ok(fsm)
    }
}

/// Read and parse a protocol spec file. Blocking.
pub fn parse_protocol_spec(path: &Path) -> Result<TransitionTable, SpecError> {
    let s = std::fs::read_to_string(path).map_err(|source| SpecError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    TransitionTable::from_toml_str(&path.display().to_string(), &s)
}

/// Where the monitor finds a role's protocol.
#[async_trait]
pub trait ProtocolSource: Send + Sync {
    /// Whether `role` is monitored at all.
    fn monitors(&self, role: &str) -> bool;

    /// `Ok(None)` when `role` is not monitored.
    async fn load(&self, role: &str) -> Result<Option<TransitionTable>, SpecError>;
}

/// Role -> spec file, read on the blocking bridge.
pub struct FileSpecSource {
    roles: BTreeMap<String, PathBuf>,
    bridge: BlockingBridge,
}

impl FileSpecSource {
    pub fn new(roles: BTreeMap<String, PathBuf>, bridge: BlockingBridge) -> Self {
        Self { roles, bridge }
    }
}

#[async_trait]
impl ProtocolSource for FileSpecSource {
    fn monitors(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }

    async fn load(&self, role: &str) -> Result<Option<TransitionTable>, SpecError> {
        let Some(path) = self.roles.get(role).cloned() else {
            return Ok(None);
        };
        let table = self.bridge.run(move || parse_protocol_spec(&path)).await??;
        Ok(Some(table))
    }
}

/// In-memory tables.
#[derive(Default)]
pub struct StaticSpecSource {
    tables: HashMap<String, TransitionTable>,
}

impl StaticSpecSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, role: impl Into<String>, table: TransitionTable) -> Self {
        self.tables.insert(role.into(), table);
        self
    }
}

#[async_trait]
impl ProtocolSource for StaticSpecSource {
    fn monitors(&self, role: &str) -> bool {
        self.tables.contains_key(role)
    }

    async fn load(&self, role: &str) -> Result<Option<TransitionTable>, SpecError> {
        Ok(self.tables.get(role).cloned())
    }
}

#[cfg(test)]
pub(crate) const RPC_CLIENT_SPEC: &str = r#"
initial = 1

[[transition]]
from = 1
on = "SEND_request_server"
to = 2

[[transition]]
from = 2
on = "RECV_response_server"
to = 3
"#;
