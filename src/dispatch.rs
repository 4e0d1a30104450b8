//! Synchronous entry point for actions.
//!
//! [`dispatch`] emits the `dispatch` event, runs the action body inside a
//! batch and classifies what it returned. Every dispatch produces a [`Task`],
//! whether the body finished on the spot, returned a future, or returned a
//! routine for the interpreter to drive.

use crate::arena::{TaskArena, TaskId};
use crate::cell::{MutateInput, StateCell};
use crate::deferred::Deferred;
use crate::emitter::Event;
use crate::error::{Result, StoreError};
use crate::interpreter::{self, Resume, Routine, RoutineContext, Step};
use crate::store::{Snapshot, Store};
use futures::future::LocalBoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::future::IntoFuture;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Name under which [`Store::set_state`] is dispatched
pub const SET_STATE_ACTION: &str = "@store.setState";

type ActionBody = Rc<dyn Fn(&ActionContext, Value) -> Result<Outcome>>;

/// A named action body
///
/// The name is the action's identity: it is what `when` listeners match on
/// and what `latest`/`debounce` use to find the previous invocation.
#[derive(Clone)]
pub struct Action {
    name: Rc<str>,
    body: ActionBody,
}

impl Action {
    pub fn new<F>(name: impl Into<Rc<str>>, body: F) -> Self
    where
        F: Fn(&ActionContext, Value) -> Result<Outcome> + 'static,
    {
        Action {
            name: name.into(),
            body: Rc::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_rc(&self) -> Rc<str> {
        self.name.clone()
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Action").field(&self.name).finish()
    }
}

/// What to dispatch: a registered action by name, or an action value
#[derive(Clone, Debug)]
pub enum ActionTarget {
    Named(Rc<str>),
    Action(Action),
}

impl From<&str> for ActionTarget {
    fn from(name: &str) -> Self {
        ActionTarget::Named(name.into())
    }
}

impl From<String> for ActionTarget {
    fn from(name: String) -> Self {
        ActionTarget::Named(name.into())
    }
}

impl From<Rc<str>> for ActionTarget {
    fn from(name: Rc<str>) -> Self {
        ActionTarget::Named(name)
    }
}

impl From<Action> for ActionTarget {
    fn from(action: Action) -> Self {
        ActionTarget::Action(action)
    }
}

impl From<&Action> for ActionTarget {
    fn from(action: &Action) -> Self {
        ActionTarget::Action(action.clone())
    }
}

/// What an action body returned
pub enum Outcome {
    /// Finished synchronously
    Value(Value),
    /// Finishes when the future settles
    Future(Deferred),
    /// Driven step by step by the interpreter
    Routine(Box<dyn Routine>),
}

impl Outcome {
    pub fn routine(routine: impl Routine + 'static) -> Self {
        Outcome::Routine(Box::new(routine))
    }

    /// Build a routine from a closure
    ///
    /// Exists so the closure's argument types are inferred.
    pub fn routine_fn<F>(resume: F) -> Self
    where
        F: FnMut(&mut RoutineContext<'_>, Resume) -> Result<Step> + 'static,
    {
        Outcome::Routine(Box::new(resume))
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Outcome::Value(value)
    }
}

impl From<Deferred> for Outcome {
    fn from(deferred: Deferred) -> Self {
        Outcome::Future(deferred)
    }
}

/// Context handed to a plain action body
///
/// Dispatching from here runs the nested action inline, as a child of the
/// current task.
pub struct ActionContext {
    store: Store,
    task: Task,
    previous: Option<Task>,
}

impl ActionContext {
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Name of the running action
    pub fn action(&self) -> &str {
        self.task.action()
    }

    pub fn get(&self, name: &str) -> Result<StateCell> {
        self.store.get(name)
    }

    pub fn value(&self, name: &str) -> Result<Value> {
        self.store.value(name)
    }

    pub fn value_as<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        self.store.value_as(name)
    }

    pub fn set(&self, name: &str, value: Value) -> Result<()> {
        self.store.get(name)?.set(value);
        Ok(())
    }

    pub fn update(&self, name: &str, f: impl FnOnce(&Value) -> Value) -> Result<()> {
        self.store.get(name)?.update(f);
        Ok(())
    }

    pub fn mutate(&self, name: &str, input: impl Into<MutateInput>) -> Result<()> {
        self.store.get(name)?.mutate(input);
        Ok(())
    }

    /// Put several cells into `Pending` on one future
    ///
    /// On success each cell takes its own key from the resolved object.
    pub fn mutate_all(&self, names: &[&str], deferred: Deferred) -> Result<()> {
        self.store.mutate_all(names, deferred)
    }

    pub fn state(&self) -> Snapshot {
        self.store.state()
    }

    pub fn dispatch(&self, target: impl Into<ActionTarget>, payload: Value) -> Task {
        dispatch(&self.store, target.into(), payload, Origin::Forked(&self.task))
    }

    pub fn delay(&self, duration: Duration) -> Deferred {
        Deferred::delay(duration)
    }

    /// Cancel the previous invocation of this action, if still running
    pub fn latest(&self) {
        if let Some(previous) = &self.previous {
            previous.cancel();
        }
    }
}

#[derive(Default)]
struct TaskState {
    cancelled: bool,
    done: bool,
    is_async: bool,
    result: Option<Value>,
    error: Option<StoreError>,
}

type SettleCallback = Box<dyn FnOnce(&Result<Value>)>;

struct TaskInner {
    action: Rc<str>,
    reports_errors: bool,
    state: RefCell<TaskState>,
    outcome: watch::Sender<Option<Result<Value>>>,
    on_settle: RefCell<Vec<SettleCallback>>,
    arena: Weak<RefCell<TaskArena>>,
    id: Cell<Option<TaskId>>,
}

/// Handle to one dispatched action
///
/// A task is running until it is done or cancelled; both states are final.
/// Await it (it implements [`IntoFuture`]) to get its result. A cancelled
/// task resolves to `Err(StoreError::Cancelled)`.
///
/// # Example
/// ```ignore
/// let task = store.dispatch("load", json!({ "id": 1 }));
/// if task.is_async() {
///     let user = task.clone().await?;
/// }
/// task.cancel(); // no-op once done
/// ```
#[derive(Clone)]
pub struct Task {
    inner: Rc<TaskInner>,
}

impl Task {
    fn new(action: Rc<str>, reports_errors: bool, arena: Weak<RefCell<TaskArena>>) -> Self {
        let (outcome, _) = watch::channel(None);
        Task {
            inner: Rc::new(TaskInner {
                action,
                reports_errors,
                state: RefCell::new(TaskState::default()),
                outcome,
                on_settle: RefCell::new(Vec::new()),
                arena,
                id: Cell::new(None),
            }),
        }
    }

    /// A task that belongs to no store
    #[cfg(test)]
    pub(crate) fn detached(action: Rc<str>) -> Self {
        Self::new(action, false, Weak::new())
    }

    pub fn action(&self) -> &str {
        &self.inner.action
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.borrow().cancelled
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.borrow().done
    }

    /// Neither done nor cancelled
    pub fn is_running(&self) -> bool {
        let state = self.inner.state.borrow();
        !state.done && !state.cancelled
    }

    /// True if the task did not finish during `dispatch`
    pub fn is_async(&self) -> bool {
        self.inner.state.borrow().is_async
    }

    pub fn result(&self) -> Option<Value> {
        self.inner.state.borrow().result.clone()
    }

    pub fn error(&self) -> Option<StoreError> {
        self.inner.state.borrow().error.clone()
    }

    pub fn ptr_eq(&self, other: &Task) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Cancel the task and every task it forked or called
    ///
    /// Safe to call any number of times. A task that already finished stays
    /// done, but its still-running children are cancelled.
    pub fn cancel(&self) {
        let cancelled = match (self.inner.arena.upgrade(), self.inner.id.get()) {
            (Some(arena), Some(id)) => {
                let mut arena = arena.borrow_mut();
                arena.cancel_tree(id)
            }
            _ => Vec::new(),
        };
        if cancelled.is_empty() {
            self.mark_cancelled();
            return;
        }
        for (task, disposers) in cancelled {
            task.mark_cancelled();
            for disposer in disposers {
                disposer();
            }
        }
    }

    pub(crate) fn id(&self) -> Option<TaskId> {
        self.inner.id.get()
    }

    pub(crate) fn reports_errors(&self) -> bool {
        self.inner.reports_errors
    }

    pub(crate) fn set_async(&self) {
        self.inner.state.borrow_mut().is_async = true;
    }

    /// Run `callback` once the task is done or cancelled
    ///
    /// Runs immediately if it already is.
    pub(crate) fn on_settle(&self, callback: impl FnOnce(&Result<Value>) + 'static) {
        let settled = self.inner.outcome.borrow().clone();
        match settled {
            Some(outcome) => callback(&outcome),
            None => self.inner.on_settle.borrow_mut().push(Box::new(callback)),
        }
    }

    fn mark_cancelled(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.done || state.cancelled {
                return;
            }
            state.cancelled = true;
            state.error = Some(StoreError::Cancelled);
        }
        debug!(action = %self.inner.action, "task cancelled");
        self.notify(Err(StoreError::Cancelled));
    }

    /// Record the final outcome; ignored if the task already finished
    pub(crate) fn settle(&self, outcome: Result<Value>) -> bool {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.done || state.cancelled {
                return false;
            }
            state.done = true;
            match &outcome {
                Ok(value) => state.result = Some(value.clone()),
                Err(error) => state.error = Some(error.clone()),
            }
        }
        self.notify(outcome);
        true
    }

    fn notify(&self, outcome: Result<Value>) {
        self.inner.outcome.send_replace(Some(outcome.clone()));
        let callbacks = std::mem::take(&mut *self.inner.on_settle.borrow_mut());
        for callback in callbacks {
            callback(&outcome);
        }
    }
}

impl IntoFuture for Task {
    type Output = Result<Value>;
    type IntoFuture = LocalBoxFuture<'static, Result<Value>>;

    fn into_future(self) -> Self::IntoFuture {
        let mut outcome = self.inner.outcome.subscribe();
        Box::pin(async move {
            // keep the sender alive while waiting
            let _task = self;
            match outcome.wait_for(Option::is_some).await {
                Ok(settled) => settled.clone().unwrap_or(Err(StoreError::Cancelled)),
                Err(_) => Err(StoreError::Cancelled),
            }
        })
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Task")
            .field("action", &self.inner.action)
            .field("done", &state.done)
            .field("cancelled", &state.cancelled)
            .field("is_async", &state.is_async)
            .field("result", &state.result)
            .finish()
    }
}

/// Where a dispatch comes from
#[derive(Clone, Copy)]
pub(crate) enum Origin<'a> {
    /// An outside caller
    Root,
    /// Started without being awaited by `parent`
    Forked(&'a Task),
    /// Awaited by `parent`, which receives any failure
    Called(&'a Task),
}

impl<'a> Origin<'a> {
    fn parent(self) -> Option<&'a Task> {
        match self {
            Origin::Root => None,
            Origin::Forked(parent) | Origin::Called(parent) => Some(parent),
        }
    }
}

/// Dispatch `target` with `payload`
///
/// The `dispatch` event fires before the body runs. Everything the body
/// mutates synchronously lands in one batch.
pub(crate) fn dispatch(store: &Store, target: ActionTarget, payload: Value, origin: Origin<'_>) -> Task {
    let (name, action) = match target {
        ActionTarget::Named(name) => {
            let action = store.action(&name);
            (name, action)
        }
        ActionTarget::Action(action) => (action.name_rc(), Some(action)),
    };

    store.batch(|| {
        debug!(action = %name, "dispatch");
        store.emitter().emit(&Event::Dispatch {
            action: name.clone(),
            payload: payload.clone(),
        });

        let reports_errors = !matches!(origin, Origin::Called(_));
        let task = Task::new(name.clone(), reports_errors, Rc::downgrade(store.tasks()));
        let parent = origin.parent().and_then(Task::id);
        let id = store.tasks().borrow_mut().insert(task.clone(), parent);
        task.inner.id.set(Some(id));

        let Some(action) = action else {
            debug!(action = %name, "no action registered, nothing to run");
            finish_task(store, &task, Ok(Value::Null));
            return task;
        };

        let previous = store.swap_latest(&name, &task);
        let cx = ActionContext {
            store: store.clone(),
            task: task.clone(),
            previous: previous.clone(),
        };
        match (action.body)(&cx, payload) {
            Err(error) => finish_task(store, &task, Err(error)),
            Ok(Outcome::Value(value)) => finish_task(store, &task, Ok(value)),
            Ok(Outcome::Future(deferred)) => {
                task.set_async();
                wait_for_future(store, &task, deferred);
            }
            Ok(Outcome::Routine(routine)) => interpreter::run(store, &task, routine, previous),
        }
        task
    })
}

fn wait_for_future(store: &Store, task: &Task, deferred: Deferred) {
    if let Some(outcome) = deferred.peek() {
        finish_task(store, task, outcome);
        return;
    }
    let weak_store = store.downgrade();
    let waiting = task.clone();
    let handle = tokio::task::spawn_local(async move {
        let outcome = deferred.await;
        if let Some(store) = weak_store.upgrade() {
            store.batch(|| finish_task(&store, &waiting, outcome));
        }
    });
    if let Some(id) = task.id() {
        let added = store
            .tasks()
            .borrow_mut()
            .add_disposer(id, Box::new(move || handle.abort()));
        if let Err(disposer) = added {
            disposer();
        }
    }
}

/// Settle `task`, release its resources and report a failure
pub(crate) fn finish_task(store: &Store, task: &Task, outcome: Result<Value>) {
    let failure = outcome.as_ref().err().cloned();
    if !task.settle(outcome) {
        return;
    }
    let disposers = match task.id() {
        Some(id) => store.tasks().borrow_mut().complete(id),
        None => Vec::new(),
    };
    drop(disposers);
    store.clear_latest(task);

    match failure {
        Some(error) if !error.is_cancelled() && task.reports_errors() => {
            warn!(action = %task.action(), %error, "action failed");
            store.emitter().emit(&Event::Error(error));
        }
        Some(error) => debug!(action = %task.action(), %error, "task failed"),
        None => debug!(action = %task.action(), "task done"),
    }
}
