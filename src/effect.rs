//! Suspension requests yielded by routines.

use crate::deferred::Deferred;
use crate::dispatch::ActionTarget;
use crate::emitter::EventSelector;
use crate::store::WatchSelector;
use indexmap::IndexMap;
use serde_json::Value;
use std::time::Duration;

/// What a routine waits for
#[derive(Clone, Debug)]
pub enum WaitSource {
    /// Resume with the outcome of a future; a rejection is injected
    Future(Deferred),
    /// Resume with `null` after a timer owned by the waiting task
    Delay(Duration),
    /// Resume with the next matching event
    Event(EventSelector),
    /// Resume with `{current, previous}` once the selected value changes
    Change(WatchSelector),
}

/// A request for the interpreter, consumed exactly once
///
/// # Example
/// ```ignore
/// // inside Routine::resume
/// Ok(Step::Yield(Effect::race([
///     ("cancel", cx.when("cancel")),
///     ("done", cx.call("increase", Value::Null)),
/// ])))
/// ```
#[derive(Clone, Debug)]
pub enum Effect {
    /// Run an action and resume with its result
    Call { target: ActionTarget, payload: Value },
    Wait(WaitSource),
    /// Start an action as a child task and resume immediately
    Fork { target: ActionTarget, payload: Value },
    /// Wait for every entry; results in input order
    All(Vec<Effect>),
    /// Wait for the first entry to settle; the others are cancelled
    Race(IndexMap<String, Effect>),
}

impl Effect {
    pub fn call(target: impl Into<ActionTarget>, payload: Value) -> Self {
        Effect::Call {
            target: target.into(),
            payload,
        }
    }

    pub fn fork(target: impl Into<ActionTarget>, payload: Value) -> Self {
        Effect::Fork {
            target: target.into(),
            payload,
        }
    }

    pub fn wait(deferred: Deferred) -> Self {
        Effect::Wait(WaitSource::Future(deferred))
    }

    pub fn delay(duration: Duration) -> Self {
        Effect::Wait(WaitSource::Delay(duration))
    }

    pub fn when(selector: impl Into<EventSelector>) -> Self {
        Effect::Wait(WaitSource::Event(selector.into()))
    }

    pub fn watch(selector: impl Into<WatchSelector>) -> Self {
        Effect::Wait(WaitSource::Change(selector.into()))
    }

    pub fn all(effects: impl IntoIterator<Item = Effect>) -> Self {
        Effect::All(effects.into_iter().collect())
    }

    pub fn race<K: Into<String>>(effects: impl IntoIterator<Item = (K, Effect)>) -> Self {
        Effect::Race(effects.into_iter().map(|(key, effect)| (key.into(), effect)).collect())
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Effect::Call { .. } => "call",
            Effect::Wait(_) => "wait",
            Effect::Fork { .. } => "fork",
            Effect::All(_) => "all",
            Effect::Race(_) => "race",
        }
    }
}

impl From<Deferred> for Effect {
    fn from(deferred: Deferred) -> Self {
        Effect::wait(deferred)
    }
}
