//! Named mutable value with an asynchronous status.

use crate::batch::{Batch, ChangeToken};
use crate::deferred::Deferred;
use crate::emitter::Event;
use crate::error::{Result, StoreError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

/// Async status of a cell or computed value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Settled,
    Pending,
    Failed,
}

/// Status/value/error triple handed to binding layers
///
/// While `Pending` or `Failed`, `value` still holds the last settled value.
#[derive(Clone, Debug)]
pub struct Loadable {
    pub status: Status,
    pub value: Value,
    pub error: Option<StoreError>,
}

impl Loadable {
    pub(crate) fn settled(value: Value) -> Self {
        Loadable {
            status: Status::Settled,
            value,
            error: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == Status::Pending
    }
}

/// Why a derivation could not read a value
#[derive(Clone, Debug)]
pub enum Suspense {
    /// Settles when the deferred does
    Pending(Deferred),
    Failed(StoreError),
}

impl From<Suspense> for StoreError {
    fn from(suspense: Suspense) -> Self {
        match suspense {
            Suspense::Pending(_) => StoreError::Pending("value".into()),
            Suspense::Failed(error) => error,
        }
    }
}

/// Input accepted by [`StateCell::mutate`]
#[derive(Clone, Debug)]
pub enum MutateInput {
    Value(Value),
    Future(Deferred),
}

impl From<Value> for MutateInput {
    fn from(value: Value) -> Self {
        MutateInput::Value(value)
    }
}

impl From<Deferred> for MutateInput {
    fn from(deferred: Deferred) -> Self {
        MutateInput::Future(deferred)
    }
}

/// Combines the current value with the resolved input
pub(crate) type Reducer = Rc<dyn Fn(&Value, Value) -> Value>;

struct CellState {
    value: Value,
    pending: Option<Deferred>,
    error: Option<StoreError>,
    token: ChangeToken,
    loadable: Option<(ChangeToken, Rc<Loadable>)>,
}

impl CellState {
    fn status(&self) -> Status {
        if self.pending.is_some() {
            Status::Pending
        } else if self.error.is_some() {
            Status::Failed
        } else {
            Status::Settled
        }
    }
}

struct CellInner {
    name: Rc<str>,
    initial: Value,
    batch: Rc<Batch>,
    state: RefCell<CellState>,
}

/// Handle to one named value of a store
///
/// The status is `Pending` exactly while an async mutation is in flight.
/// Assigning a value directly drops the in-flight future (its eventual
/// outcome is discarded) and clears any error.
///
/// Handles are cheap to clone and all clones refer to the same cell.
#[derive(Clone)]
pub struct StateCell {
    inner: Rc<CellInner>,
}

impl StateCell {
    pub(crate) fn new(name: Rc<str>, initial: Value, batch: Rc<Batch>) -> Self {
        let token = batch.next_token();
        StateCell {
            inner: Rc::new(CellInner {
                name,
                batch,
                state: RefCell::new(CellState {
                    value: initial.clone(),
                    pending: None,
                    error: None,
                    token,
                    loadable: None,
                }),
                initial,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Last settled value
    pub fn value(&self) -> Value {
        self.inner.state.borrow().value.clone()
    }

    pub fn with_value<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        f(&self.inner.state.borrow().value)
    }

    /// Deserialize the last settled value
    pub fn get_as<T: DeserializeOwned>(&self) -> Result<T> {
        self.with_value(|value| T::deserialize(value).map_err(StoreError::from))
    }

    pub fn status(&self) -> Status {
        self.inner.state.borrow().status()
    }

    pub fn error(&self) -> Option<StoreError> {
        self.inner.state.borrow().error.clone()
    }

    /// The in-flight future, if any
    pub fn pending(&self) -> Option<Deferred> {
        self.inner.state.borrow().pending.clone()
    }

    /// Read from a derivation context
    ///
    /// A pending cell yields its future and a failed cell its error instead
    /// of the stale value.
    pub fn read(&self) -> std::result::Result<Value, Suspense> {
        let state = self.inner.state.borrow();
        if let Some(pending) = &state.pending {
            return Err(Suspense::Pending(pending.clone()));
        }
        if let Some(error) = &state.error {
            return Err(Suspense::Failed(error.clone()));
        }
        Ok(state.value.clone())
    }

    /// Stable status snapshot
    ///
    /// The same `Rc` is returned until the cell is mutated again.
    pub fn loadable(&self) -> Rc<Loadable> {
        let mut state = self.inner.state.borrow_mut();
        if let Some((token, loadable)) = &state.loadable {
            if *token == state.token {
                return loadable.clone();
            }
        }
        let loadable = Rc::new(Loadable {
            status: state.status(),
            value: state.value.clone(),
            error: state.error.clone(),
        });
        state.loadable = Some((state.token, loadable.clone()));
        loadable
    }

    /// Assign a value, settling the cell
    pub fn set(&self, value: Value) {
        let (value_changed, status_changed) = {
            let mut state = self.inner.state.borrow_mut();
            let was_settled = state.status() == Status::Settled;
            state.pending = None;
            state.error = None;
            let value_changed = state.value != value;
            if value_changed {
                state.value = value;
            }
            if value_changed || !was_settled {
                state.token = self.inner.batch.next_token();
            }
            (value_changed, !was_settled)
        };
        if value_changed {
            self.inner.batch.value_changed();
        } else if status_changed {
            self.inner.batch.status_changed();
        }
    }

    /// Assign the value computed from the current one
    pub fn update(&self, f: impl FnOnce(&Value) -> Value) {
        let next = self.with_value(f);
        self.set(next);
    }

    /// Assign a value or start tracking a future
    ///
    /// A future puts the cell into `Pending` until it settles. Mutating again
    /// with the same future is a no-op. Only the most recent future may settle
    /// the cell: when a superseded one resolves, its outcome is dropped.
    pub fn mutate(&self, input: impl Into<MutateInput>) {
        match input.into() {
            MutateInput::Value(value) => self.set(value),
            MutateInput::Future(deferred) => self.mutate_future(deferred, None),
        }
    }

    /// Like [`mutate`](StateCell::mutate), combining the current value with
    /// the (resolved) input through `reducer`
    pub fn mutate_with<F>(&self, input: impl Into<MutateInput>, reducer: F)
    where
        F: Fn(&Value, Value) -> Value + 'static,
    {
        match input.into() {
            MutateInput::Value(value) => {
                let next = self.with_value(|current| reducer(current, value));
                self.set(next);
            }
            MutateInput::Future(deferred) => self.mutate_future(deferred, Some(Rc::new(reducer))),
        }
    }

    fn mutate_future(&self, deferred: Deferred, reducer: Option<Reducer>) {
        if let Some(outcome) = deferred.peek() {
            if !self.is_tracking(&deferred) {
                // supersedes whatever is still in flight
                self.inner.state.borrow_mut().pending = None;
                self.apply(outcome, reducer.as_ref());
            }
            return;
        }
        if !self.begin(&deferred) {
            return;
        }
        let cell = self.downgrade();
        tokio::task::spawn_local(async move {
            let outcome = deferred.clone().await;
            if let Some(cell) = cell.upgrade() {
                cell.settle(&deferred, outcome, reducer.as_ref());
            }
        });
    }

    fn is_tracking(&self, deferred: &Deferred) -> bool {
        self.inner
            .state
            .borrow()
            .pending
            .as_ref()
            .is_some_and(|pending| pending.ptr_eq(deferred))
    }

    /// Enter `Pending` for `deferred`; false if it is already tracked
    pub(crate) fn begin(&self, deferred: &Deferred) -> bool {
        if self.is_tracking(deferred) {
            cov_mark::hit!(cell_same_future_ignored);
            return false;
        }
        {
            let mut state = self.inner.state.borrow_mut();
            state.pending = Some(deferred.clone());
            state.error = None;
            state.token = self.inner.batch.next_token();
        }
        self.inner.batch.status_changed();
        true
    }

    /// Apply the outcome of `deferred` unless a newer mutation superseded it
    pub(crate) fn settle(&self, deferred: &Deferred, outcome: Result<Value>, reducer: Option<&Reducer>) {
        if !self.is_tracking(deferred) {
            cov_mark::hit!(stale_future_discarded);
            trace!(cell = %self.inner.name, "stale future discarded");
            return;
        }
        self.inner.state.borrow_mut().pending = None;
        self.inner.batch.run(|| self.apply(outcome, reducer));
    }

    fn apply(&self, outcome: Result<Value>, reducer: Option<&Reducer>) {
        match outcome {
            Ok(resolved) => {
                let next = match reducer {
                    Some(reducer) => self.with_value(|current| reducer(current, resolved)),
                    None => resolved,
                };
                self.force_update(next);
            }
            Err(StoreError::Cancelled) => {
                self.inner.state.borrow_mut().token = self.inner.batch.next_token();
                self.inner.batch.status_changed();
            }
            Err(error) => {
                debug!(cell = %self.inner.name, %error, "async mutation failed");
                {
                    let mut state = self.inner.state.borrow_mut();
                    state.error = Some(error.clone());
                    state.token = self.inner.batch.next_token();
                }
                self.inner.batch.status_changed();
                self.inner.batch.emitter().emit(&Event::Error(error));
            }
        }
    }

    /// Like `set`, but always notifies: the status left `Pending` even if
    /// the value did not change
    fn force_update(&self, value: Value) {
        let value_changed = {
            let mut state = self.inner.state.borrow_mut();
            state.error = None;
            state.token = self.inner.batch.next_token();
            let changed = state.value != value;
            state.value = value;
            changed
        };
        if value_changed {
            self.inner.batch.value_changed();
        } else {
            self.inner.batch.status_changed();
        }
    }

    /// Drop the in-flight future and fall back to the last settled value
    ///
    /// Readers are invalidated but no notification is emitted.
    pub fn cancel(&self) {
        let mut state = self.inner.state.borrow_mut();
        if state.pending.take().is_some() {
            state.token = self.inner.batch.next_token();
            drop(state);
            self.inner.batch.touch();
        }
    }

    /// Restore the initial value
    pub fn reset(&self) {
        self.set(self.inner.initial.clone());
    }

    /// Changes whenever the value or the status does
    pub fn token(&self) -> ChangeToken {
        self.inner.state.borrow().token
    }

    pub(crate) fn downgrade(&self) -> WeakStateCell {
        WeakStateCell(Rc::downgrade(&self.inner))
    }
}

impl std::fmt::Debug for StateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("StateCell")
            .field("name", &self.inner.name)
            .field("status", &state.status())
            .field("value", &state.value)
            .finish()
    }
}

#[derive(Clone)]
pub(crate) struct WeakStateCell(Weak<CellInner>);

impl WeakStateCell {
    pub(crate) fn upgrade(&self) -> Option<StateCell> {
        self.0.upgrade().map(|inner| StateCell { inner })
    }
}
