//! Memoized computed values.
//!
//! A [`Computed`] definition is compiled into a [`ComputedSlot`] owned by the
//! store. Slots are pulled, never pushed: reading one checks whether anything
//! it depends on changed and re-derives only then. Results that are equal to
//! the previous ones keep their previous `Rc`, so downstream consumers can
//! skip work with a pointer comparison.

use crate::batch::{Batch, ChangeToken};
use crate::cell::Suspense;
use crate::deferred::Deferred;
use crate::error::{Result, StoreError};
use crate::path::DependencyPath;
use crate::store::{Snapshot, Store};
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::trace;

type SelectFn = Rc<dyn Fn(&Snapshot) -> Value>;
type CombineFn = Rc<dyn Fn(&[Value]) -> Derived>;
type AsyncDerive = Box<dyn FnOnce(DeriveContext) -> LocalBoxFuture<'static, Result<Value>>>;

/// Definition of a computed property
///
/// Either a function of the whole state snapshot, or a list of dependency
/// paths plus a function receiving their values positionally.
///
/// # Example
/// ```ignore
/// let store = Store::builder()
///     .state("todos", json!([]))
///     .computed("done", Computed::new(["todos.filter(done)"], |args| {
///         json!(args[0].as_array().map_or(0, Vec::len))
///     }))
///     .computed("total", Computed::from_state(|state| {
///         json!(state.get("todos").and_then(Value::as_array).map_or(0, Vec::len))
///     }))
///     .build()?;
/// ```
#[derive(Clone)]
pub struct Computed {
    kind: ComputedKind,
}

#[derive(Clone)]
enum ComputedKind {
    Select(SelectFn),
    Combine { deps: Vec<String>, combine: CombineFn },
}

impl Computed {
    /// Derive from the full state snapshot
    ///
    /// Re-runs only when the snapshot identity changes.
    pub fn from_state<F>(select: F) -> Self
    where
        F: Fn(&Snapshot) -> Value + 'static,
    {
        Computed {
            kind: ComputedKind::Select(Rc::new(select)),
        }
    }

    /// Combine dependency values synchronously
    pub fn new<I, S, F>(deps: I, combine: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&[Value]) -> Value + 'static,
    {
        Self::derive(deps, move |args| Derived::Value(combine(args)))
    }

    /// Combine dependency values, possibly asynchronously
    ///
    /// Returning [`Derived::Async`] turns the property into a [`Deferred`]
    /// whose derivation gets a [`DeriveContext`] for `cache`, `latest` and
    /// `debounce`.
    pub fn derive<I, S, F>(deps: I, combine: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&[Value]) -> Derived + 'static,
    {
        Computed {
            kind: ComputedKind::Combine {
                deps: deps.into_iter().map(Into::into).collect(),
                combine: Rc::new(combine),
            },
        }
    }

    /// Expose another property (or a path into it) under a new name
    pub fn alias(path: impl Into<String>) -> Self {
        Self::new([path], |args| args.first().cloned().unwrap_or(Value::Null))
    }

    pub(crate) fn compile(self, name: Rc<str>) -> Result<ComputedSlot> {
        let kind = match self.kind {
            ComputedKind::Select(select) => SlotKind::Select(select),
            ComputedKind::Combine { deps, combine } => SlotKind::Combine {
                deps: deps
                    .iter()
                    .map(|dep| DependencyPath::parse(dep))
                    .collect::<Result<_>>()?,
                combine,
            },
        };
        Ok(ComputedSlot {
            name,
            kind,
            memo: RefCell::new(Memo::default()),
            evaluating: Cell::new(false),
        })
    }
}

/// What a combining function produced
pub enum Derived {
    Value(Value),
    Async(AsyncDerive),
}

impl Derived {
    /// Derive asynchronously
    ///
    /// # Example
    /// ```ignore
    /// Computed::derive(["count"], |args| {
    ///     let count = args[0].as_i64().unwrap_or(0);
    ///     Derived::future(move |cx| async move {
    ///         cx.debounce(Duration::from_millis(10)).await?;
    ///         Ok(json!(count * 2))
    ///     })
    /// })
    /// ```
    pub fn future<F, Fut>(derive: F) -> Self
    where
        F: FnOnce(DeriveContext) -> Fut + 'static,
        Fut: Future<Output = Result<Value>> + 'static,
    {
        Derived::Async(Box::new(move |cx| derive(cx).boxed_local()))
    }
}

impl From<Value> for Derived {
    fn from(value: Value) -> Self {
        Derived::Value(value)
    }
}

/// Helpers handed to an async derivation
#[derive(Clone)]
pub struct DeriveContext {
    name: Rc<str>,
    previous: Option<Deferred>,
    settled: Option<Rc<Value>>,
    keep: Rc<Cell<bool>>,
}

impl DeriveContext {
    pub(crate) fn new(name: Rc<str>, previous: Option<Deferred>, settled: Option<Rc<Value>>) -> Self {
        DeriveContext {
            name,
            previous,
            settled,
            keep: Rc::new(Cell::new(false)),
        }
    }

    /// Name of the computed property being derived
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The derivation this one replaces
    pub fn previous(&self) -> Option<&Deferred> {
        self.previous.as_ref()
    }

    /// Keep the identity of the last successful result if `value` equals it
    ///
    /// Once this derivation settles, [`Store::computed`] hands out the same
    /// `Rc` as before, so readers can skip work with `Rc::ptr_eq`. Without a
    /// call to `cache` every settled derivation gets a fresh `Rc`.
    pub fn cache(&self, value: Value) -> Value {
        match &self.settled {
            Some(previous) if **previous == value => {
                self.keep.set(true);
                Value::clone(previous)
            }
            _ => value,
        }
    }

    /// Cancel the previous derivation if it is still in flight
    pub fn latest(&self) {
        if let Some(previous) = &self.previous {
            if previous.is_loading() {
                trace!(computed = %self.name, "previous derivation cancelled");
                previous.cancel();
            }
        }
    }

    /// Cancel the previous derivation, then wait `duration`
    pub fn debounce(&self, duration: Duration) -> Deferred {
        self.latest();
        Deferred::delay(duration)
    }
}

/// Current value of a computed property
#[derive(Clone, Debug)]
pub enum ComputedValue {
    /// Derived synchronously, or an async derivation that succeeded
    Ready(Rc<Value>),
    /// Derived asynchronously; still loading or failed
    Async(Deferred),
    /// A dependency is still pending
    Suspended(Deferred),
}

impl ComputedValue {
    /// Settled value, `None` while loading
    pub fn value(&self) -> Option<Value> {
        match self {
            ComputedValue::Ready(value) => Some(Value::clone(value)),
            ComputedValue::Async(deferred) => deferred.result(),
            ComputedValue::Suspended(_) => None,
        }
    }

    /// The future to wait on, if any
    pub fn deferred(&self) -> Option<&Deferred> {
        match self {
            ComputedValue::Ready(_) => None,
            ComputedValue::Async(deferred) | ComputedValue::Suspended(deferred) => Some(deferred),
        }
    }

    pub fn is_loading(&self) -> bool {
        match self {
            ComputedValue::Ready(_) => false,
            ComputedValue::Async(deferred) => deferred.is_loading(),
            ComputedValue::Suspended(_) => true,
        }
    }

    /// Read in derive mode: pending and failed become a [`Suspense`]
    pub(crate) fn read(&self) -> std::result::Result<Value, Suspense> {
        match self {
            ComputedValue::Ready(value) => Ok(Value::clone(value)),
            ComputedValue::Async(deferred) => match deferred.peek() {
                Some(Ok(value)) => Ok(value),
                Some(Err(error)) => Err(Suspense::Failed(error)),
                None => Err(Suspense::Pending(deferred.clone())),
            },
            ComputedValue::Suspended(deferred) => Err(Suspense::Pending(deferred.clone())),
        }
    }
}

enum SlotKind {
    Select(SelectFn),
    Combine {
        deps: Vec<DependencyPath>,
        combine: CombineFn,
    },
}

#[derive(Default)]
enum Inputs {
    #[default]
    None,
    Snapshot(Snapshot),
    Args(Vec<Value>),
}

struct InFlight {
    deferred: Deferred,
    keep: Rc<Cell<bool>>,
}

#[derive(Default)]
struct Memo {
    token: Option<ChangeToken>,
    inputs: Inputs,
    result: Option<ComputedValue>,
    in_flight: Option<InFlight>,
    /// Last successful async result
    settled: Option<Rc<Value>>,
}

impl Memo {
    /// Replace a successfully settled async result with its value
    fn promote(&mut self) {
        let Some(ComputedValue::Async(deferred)) = &self.result else {
            return;
        };
        let Some(Ok(value)) = deferred.peek() else {
            return;
        };
        let keep = self
            .in_flight
            .as_ref()
            .is_some_and(|flight| flight.deferred.ptr_eq(deferred) && flight.keep.get());
        let shared = match &self.settled {
            Some(previous) if keep && **previous == value => previous.clone(),
            _ => Rc::new(value),
        };
        self.settled = Some(shared.clone());
        self.result = Some(ComputedValue::Ready(shared));
    }
}

/// Compiled, memoized computed property
pub(crate) struct ComputedSlot {
    name: Rc<str>,
    kind: SlotKind,
    memo: RefCell<Memo>,
    evaluating: Cell<bool>,
}

struct EvaluatingGuard<'a>(&'a Cell<bool>);

impl Drop for EvaluatingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl ComputedSlot {
    #[cfg(test)]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub(crate) fn dependencies(&self) -> &[DependencyPath] {
        match &self.kind {
            SlotKind::Select(_) => &[],
            SlotKind::Combine { deps, .. } => deps,
        }
    }

    /// Current value, re-deriving if an input changed
    pub(crate) fn evaluate(&self, store: &Store) -> Result<ComputedValue> {
        let token = store.coordinator().token();
        {
            let mut memo = self.memo.borrow_mut();
            if memo.token == Some(token) {
                memo.promote();
                if let Some(result) = &memo.result {
                    return Ok(result.clone());
                }
            }
        }

        if self.evaluating.replace(true) {
            return Err(StoreError::CyclicDependency(self.name.to_string().into()));
        }
        let _guard = EvaluatingGuard(&self.evaluating);

        let inputs = match &self.kind {
            SlotKind::Select(_) => Inputs::Snapshot(store.state()),
            SlotKind::Combine { deps, .. } => {
                let mut args = Vec::with_capacity(deps.len());
                for dep in deps {
                    match store.resolve(dep) {
                        Ok(value) => args.push(value),
                        Err(Suspense::Pending(deferred)) => {
                            return Ok(ComputedValue::Suspended(deferred));
                        }
                        Err(Suspense::Failed(error)) => {
                            return Err(StoreError::dependency(dep.as_str(), error));
                        }
                    }
                }
                Inputs::Args(args)
            }
        };

        {
            let mut memo = self.memo.borrow_mut();
            let unchanged = match (&memo.inputs, &inputs) {
                (Inputs::Snapshot(previous), Inputs::Snapshot(current)) => previous.ptr_eq(current),
                (Inputs::Args(previous), Inputs::Args(current)) => previous == current,
                _ => false,
            };
            if unchanged {
                memo.promote();
                if let Some(result) = memo.result.clone() {
                    memo.token = Some(token);
                    return Ok(result);
                }
            }
        }

        let derived = match (&self.kind, &inputs) {
            (SlotKind::Select(select), Inputs::Snapshot(snapshot)) => Derived::Value(select(snapshot)),
            (SlotKind::Combine { combine, .. }, Inputs::Args(args)) => combine(args),
            _ => Derived::Value(Value::Null),
        };

        let result = match derived {
            Derived::Value(value) => {
                let memo = self.memo.borrow();
                match &memo.result {
                    Some(ComputedValue::Ready(previous)) if **previous == value => {
                        ComputedValue::Ready(previous.clone())
                    }
                    _ => ComputedValue::Ready(Rc::new(value)),
                }
            }
            Derived::Async(derive) => {
                let (previous, settled) = {
                    let memo = self.memo.borrow();
                    let previous = memo.in_flight.as_ref().map(|flight| flight.deferred.clone());
                    (previous, memo.settled.clone())
                };
                let cx = DeriveContext::new(self.name.clone(), previous, settled);
                let keep = cx.keep.clone();
                let deferred = Deferred::new(derive(cx));
                spawn_driver(&self.name, deferred.clone(), Rc::downgrade(store.coordinator()));
                self.memo.borrow_mut().in_flight = Some(InFlight {
                    deferred: deferred.clone(),
                    keep,
                });
                ComputedValue::Async(deferred)
            }
        };

        let mut memo = self.memo.borrow_mut();
        memo.token = Some(token);
        memo.inputs = inputs;
        memo.result = Some(result.clone());
        Ok(result)
    }
}

/// Poll an async derivation to completion so its status is observable
/// without anybody awaiting it
fn spawn_driver(name: &Rc<str>, deferred: Deferred, batch: Weak<Batch>) {
    let name = name.clone();
    tokio::task::spawn_local(async move {
        let outcome = deferred.await;
        match outcome {
            Err(StoreError::Cancelled) => trace!(computed = %name, "derivation cancelled"),
            _ => {
                if let Some(batch) = batch.upgrade() {
                    batch.status_changed();
                }
            }
        }
    });
}
