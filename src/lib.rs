//! Reactive state store with a cooperative effect interpreter.
//!
//! A [`Store`] holds named state cells, memoized computed properties and
//! actions. Actions are plain functions, futures, or suspendable
//! [`Routine`]s that yield [`Effect`]s (call, fork, wait, all, race) and are
//! resumed with the outcome. Every dispatch returns a [`Task`] handle that
//! can be awaited or cancelled; cancelling a task cancels everything it
//! forked or called.
//!
//! # Quick Start
//!
//! ```ignore
//! use tenx::{Computed, Outcome, Step, Store};
//! use serde_json::{Value, json};
//! use std::time::Duration;
//!
//! let store = Store::builder()
//!     .state("count", json!(0))
//!     .computed("doubled", Computed::new(["count"], |args| {
//!         json!(args[0].as_i64().unwrap_or(0) * 2)
//!     }))
//!     .action("increase", |cx, _| {
//!         cx.update("count", |count| json!(count.as_i64().unwrap_or(0) + 1))?;
//!         Ok(Outcome::Value(Value::Null))
//!     })
//!     .action("increase_later", |_, _| {
//!         let mut waited = false;
//!         Ok(Outcome::routine_fn(move |cx, input| {
//!             input.into_result()?;
//!             if !waited {
//!                 waited = true;
//!                 return Ok(Step::Yield(cx.delay(Duration::from_millis(10))));
//!             }
//!             cx.update("count", |count| json!(count.as_i64().unwrap_or(0) + 1))?;
//!             Ok(Step::Done(Value::Null))
//!         }))
//!     })
//!     .build()?;
//!
//! let _updates = store.when("update", |_| println!("updated"));
//! store.dispatch("increase", Value::Null);
//! assert_eq!(store.value("doubled")?, json!(2));
//!
//! // inside a tokio LocalSet
//! store.dispatch("increase_later", Value::Null).await?;
//! ```
//!
//! # Notifications
//!
//! - `dispatch` - every action invocation, before its body runs
//! - `change` - a value changed during a batch
//! - `update` - a value or a loading/error status changed during a batch
//! - `error` - an uncaught action failure or a failed async mutation
//! - `ready` - the init action finished
//!
//! Changes made while a dispatch (or [`Store::batch`]) is on the stack are
//! coalesced into one `change` and one `update`.
//!
//! # Runtime
//!
//! The store is single-threaded. Timers and async waits are spawned with
//! `tokio::task::spawn_local`, so async actions must run inside a
//! `tokio::task::LocalSet`.

pub(crate) mod arena;
mod batch;
mod cell;
mod deferred;
mod dispatch;
mod effect;
mod emitter;
mod error;
mod hash;
mod interpreter;
mod path;
mod selector;
mod store;

// Store
pub use store::{DEFAULT_PRIVATE_PREFIX, Snapshot, Store, StoreBuilder, WatchChange, WatchSelector, WeakStore};

// State
pub use cell::{Loadable, MutateInput, StateCell, Status, Suspense};
pub use deferred::Deferred;
pub use selector::{Computed, ComputedValue, DeriveContext, Derived};

// Actions
pub use dispatch::{Action, ActionContext, ActionTarget, Outcome, SET_STATE_ACTION, Task};
pub use effect::{Effect, WaitSource};
pub use interpreter::{Resume, Routine, RoutineContext, Step};

// Events
pub use batch::ChangeToken;
pub use emitter::{Channel, Event, EventSelector, Next, NextEvent, Subscription};

pub use error::{Result, StoreError};
pub use path::{DependencyPath, Method};
pub use serde_json::Value;

#[cfg(test)]
mod tests;
