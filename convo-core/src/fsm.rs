//! Protocol state machine.
//!
//! Lookup precedence for an input symbol in the current state: exact `(symbol, state)`, then
//! the symbol's catch entry (any state), then the state's any-symbol entry, then the default.
//! No match is a [`FsmError::Undefined`]. `EMPTY` transitions out of a state are followed
//! before the lookup.

use std::collections::{BTreeSet, HashMap, HashSet};

pub type State = u32;

/// Epsilon input symbol.
pub const EMPTY: &str = "EMPTY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub action: Option<String>,
    pub next: State,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsmError {
    #[error("transition is undefined: ({symbol}, {state})")]
    Undefined { symbol: String, state: State },
    #[error("conversation already finished in state {0}")]
    Finished(State),
}

#[derive(Debug, Clone)]
pub struct Fsm {
    initial: State,
    current: State,
    transitions: HashMap<(String, State), Target>,
    catch: HashMap<String, Target>,
    any: HashMap<State, Target>,
    default: Option<Target>,
    interrupt: Option<(String, State)>,
    final_state: Option<State>,
    end_states: BTreeSet<State>,
}

impl Fsm {
    pub fn new(initial: State) -> Self {
        Self {
            initial,
            current: initial,
            transitions: HashMap::new(),
            catch: HashMap::new(),
            any: HashMap::new(),
            default: None,
            interrupt: None,
            final_state: None,
            end_states: BTreeSet::new(),
        }
    }

    pub fn current_state(&self) -> State {
        self.current
    }

    pub fn initial_state(&self) -> State {
        self.initial
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// `(symbol, state) -> next`. `next = None` stays in `state`.
    pub fn add_transition(
        &mut self,
        symbol: impl Into<String>,
        state: State,
        next: Option<State>,
        action: Option<String>,
    ) {
        let next = next.unwrap_or(state);
        self.end_states.remove(&state);
        if !self.transitions.keys().any(|(_, s)| *s == next) {
            self.end_states.insert(next);
        }
        self.transitions
            .insert((symbol.into(), state), Target { action, next });
    }

    pub fn add_transition_list<I, S>(&mut self, symbols: I, state: State, next: Option<State>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for s in symbols {
            self.add_transition(s, state, next, None);
        }
    }

    pub fn remove_transition(&mut self, symbol: &str, state: State) -> Option<Target> {
        self.transitions.remove(&(symbol.to_string(), state))
    }

    /// `symbol` in any state.
    pub fn add_catch(&mut self, symbol: impl Into<String>, next: State, action: Option<String>) {
        self.catch.insert(symbol.into(), Target { action, next });
    }

    pub fn remove_catch(&mut self, symbol: &str) -> Option<Target> {
        self.catch.remove(symbol)
    }

    /// Any symbol in `state`. `next = None` stays in `state`.
    pub fn add_transition_any(&mut self, state: State, next: Option<State>, action: Option<String>) {
        self.any.insert(
            state,
            Target {
                action,
                next: next.unwrap_or(state),
            },
        );
    }

    pub fn remove_any(&mut self, state: State) -> Option<Target> {
        self.any.remove(&state)
    }

    pub fn set_default_transition(&mut self, next: State, action: Option<String>) {
        self.default = Some(Target { action, next });
    }

    pub fn clear_default_transition(&mut self) {
        self.default = None;
    }

    /// A symbol that jumps to `state` from wherever the machine is.
    pub fn set_interrupt(&mut self, symbol: impl Into<String>, state: State) {
        self.interrupt = Some((symbol.into(), state));
    }

    /// Once reached, any further input is [`FsmError::Finished`].
    pub fn set_final_state(&mut self, state: State) {
        self.final_state = Some(state);
    }

    /// Follow `EMPTY` transitions from `state`.
    fn settle(&self, mut state: State) -> State {
        let mut seen = HashSet::new();
        while let Some(t) = self.transitions.get(&(EMPTY.to_string(), state)) {
            if !seen.insert(state) {
                break;
            }
            state = t.next;
        }
        state
    }

    /// The entry `symbol` would fire from `state`, without changing anything.
    pub fn get_transition(&self, symbol: &str, state: State) -> Result<&Target, FsmError> {
        let state = self.settle(state);
        self.transitions
            .get(&(symbol.to_string(), state))
            .or_else(|| self.catch.get(symbol))
            .or_else(|| self.any.get(&state))
            .or(self.default.as_ref())
            .ok_or_else(|| FsmError::Undefined {
                symbol: symbol.to_string(),
                state,
            })
    }

    pub fn has_transition(&self, symbol: &str, state: State) -> bool {
        self.get_transition(symbol, state).is_ok()
    }

    /// Feed one symbol. Returns the fired entry's action, if any.
    pub fn process(&mut self, symbol: &str) -> Result<Option<String>, FsmError> {
        if Some(self.current) == self.final_state {
            return Err(FsmError::Finished(self.current));
        }
        if let Some((interrupt, start)) = &self.interrupt {
            if interrupt == symbol {
                self.current = *start;
            }
        }
        let target = self.get_transition(symbol, self.current)?.clone();
        self.current = target.next;
        Ok(target.action)
    }

    /// Feed symbols in order, stopping at the first failure.
    pub fn process_list<I, S>(&mut self, symbols: I) -> Result<(), FsmError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for s in symbols {
            self.process(s.as_ref())?;
        }
        Ok(())
    }

    /// No exact or any-symbol transition leaves the current state (after `EMPTY` moves), or
    /// the final state is reached.
    pub fn is_terminal(&self) -> bool {
        if Some(self.current) == self.final_state {
            return true;
        }
        let state = self.settle(self.current);
        !self.any.contains_key(&state) && !self.transitions.keys().any(|(_, s)| *s == state)
    }

    /// States that were only ever entered, never left, as tables were built.
    pub fn end_states(&self) -> &BTreeSet<State> {
        &self.end_states
    }
}
