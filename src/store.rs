//! The store: named state cells, computed properties and actions.

use crate::arena::TaskArena;
use crate::batch::{Batch, ChangeToken};
use crate::cell::{Loadable, Reducer, StateCell, Status, Suspense, WeakStateCell};
use crate::deferred::Deferred;
use crate::dispatch::{self, Action, ActionContext, ActionTarget, Origin, Outcome, SET_STATE_ACTION, Task};
use crate::emitter::{Channel, Emitter, Event, EventSelector, Next, NextEvent, Subscription};
use crate::error::{Result, StoreError};
use crate::hash::FastHashMap;
use crate::path::DependencyPath;
use crate::selector::{Computed, ComputedSlot, ComputedValue};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::debug;

/// Default marker for computed properties that are only usable as dependencies
pub const DEFAULT_PRIVATE_PREFIX: char = '_';

/// Immutable mapping from state name to value
///
/// Snapshots are rebuilt lazily after a value changed, and a rebuilt
/// snapshot that equals the previous one is replaced by it, so
/// [`ptr_eq`](Snapshot::ptr_eq) is a cheap "nothing changed" check.
#[derive(Clone, Debug)]
pub struct Snapshot(Rc<IndexMap<Rc<str>, Value>>);

impl Snapshot {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, value)| (&**name, value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ptr_eq(&self, other: &Snapshot) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
        )
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0 == other.0
    }
}

/// What a watcher observes
#[derive(Clone)]
pub enum WatchSelector {
    /// One dependency path
    Path(Rc<str>),
    /// Several paths, selected as an object keyed by path
    Paths(Vec<Rc<str>>),
    /// Any function of the store
    Func(Rc<dyn Fn(&Store) -> Value>),
}

impl WatchSelector {
    pub fn func(select: impl Fn(&Store) -> Value + 'static) -> Self {
        WatchSelector::Func(Rc::new(select))
    }

    fn compile(&self) -> Result<CompiledWatch> {
        Ok(match self {
            WatchSelector::Path(path) => CompiledWatch::Path(DependencyPath::parse(path)?),
            WatchSelector::Paths(paths) => CompiledWatch::Paths(
                paths
                    .iter()
                    .map(|path| DependencyPath::parse(path))
                    .collect::<Result<_>>()?,
            ),
            WatchSelector::Func(select) => CompiledWatch::Func(select.clone()),
        })
    }
}

impl std::fmt::Debug for WatchSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchSelector::Path(path) => f.debug_tuple("Path").field(path).finish(),
            WatchSelector::Paths(paths) => f.debug_tuple("Paths").field(paths).finish(),
            WatchSelector::Func(_) => f.write_str("Func(..)"),
        }
    }
}

impl From<&str> for WatchSelector {
    fn from(path: &str) -> Self {
        WatchSelector::Path(path.into())
    }
}

impl From<String> for WatchSelector {
    fn from(path: String) -> Self {
        WatchSelector::Path(path.into())
    }
}

impl From<Vec<&str>> for WatchSelector {
    fn from(paths: Vec<&str>) -> Self {
        WatchSelector::Paths(paths.into_iter().map(Rc::from).collect())
    }
}

impl<const N: usize> From<[&str; N]> for WatchSelector {
    fn from(paths: [&str; N]) -> Self {
        WatchSelector::Paths(paths.into_iter().map(Rc::from).collect())
    }
}

enum CompiledWatch {
    Path(DependencyPath),
    Paths(Vec<DependencyPath>),
    Func(Rc<dyn Fn(&Store) -> Value>),
}

impl CompiledWatch {
    fn select(&self, store: &Store) -> Value {
        match self {
            CompiledWatch::Path(path) => store.peek_path(path),
            CompiledWatch::Paths(paths) => Value::Object(
                paths
                    .iter()
                    .map(|path| (path.as_str().to_owned(), store.peek_path(path)))
                    .collect::<Map<_, _>>(),
            ),
            CompiledWatch::Func(select) => select(store),
        }
    }
}

/// A change delivered to a watcher
#[derive(Clone, Debug, PartialEq)]
pub struct WatchChange {
    pub current: Value,
    pub previous: Value,
}

impl WatchChange {
    pub fn to_value(&self) -> Value {
        json!({ "current": self.current, "previous": self.previous })
    }
}

type WatchListener = Rc<dyn Fn(&Store, &WatchChange)>;

#[derive(Default)]
struct InitState {
    loading: bool,
    error: Option<StoreError>,
}

struct StoreInner {
    batch: Rc<Batch>,
    cells: IndexMap<Rc<str>, StateCell>,
    ad_hoc: RefCell<FastHashMap<Rc<str>, StateCell>>,
    computed: IndexMap<Rc<str>, ComputedSlot>,
    actions: FastHashMap<Rc<str>, Action>,
    private_prefix: char,
    snapshot: RefCell<Option<(ChangeToken, Snapshot)>>,
    tasks: Rc<RefCell<TaskArena>>,
    latest: RefCell<FastHashMap<Rc<str>, Task>>,
    init: RefCell<InitState>,
}

/// A reactive state container
///
/// Cells are only changed through their own setters, typically from inside
/// dispatched actions. Everything an action changes synchronously, including
/// nested dispatches, is reported as one `change` (if a value changed) and
/// one `update` notification once the outermost dispatch returns.
///
/// The store is single-threaded. Async actions, async mutations and delays
/// are driven with `tokio::task::spawn_local` and need a `LocalSet`.
///
/// # Example
/// ```ignore
/// let store = Store::builder()
///     .state("count", json!(0))
///     .computed("doubled", Computed::new(["count"], |args| {
///         json!(args[0].as_i64().unwrap_or(0) * 2)
///     }))
///     .action("increase", |cx, _| {
///         cx.update("count", |count| json!(count.as_i64().unwrap_or(0) + 1))?;
///         Ok(Outcome::Value(Value::Null))
///     })
///     .build()?;
///
/// let _updates = store.when("update", |_| println!("updated"));
/// store.dispatch("increase", Value::Null);
/// assert_eq!(store.value("doubled")?, json!(2));
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Rc<StoreInner>,
}

impl Store {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    /// Run an action
    ///
    /// Never fails: a failing body is reported on the `error` channel and
    /// recorded on the returned task.
    pub fn dispatch(&self, target: impl Into<ActionTarget>, payload: Value) -> Task {
        dispatch::dispatch(self, target.into(), payload, Origin::Root)
    }

    /// Listen to events
    ///
    /// `"*"` selects every dispatch, `"change"`, `"update"`, `"dispatch"`,
    /// `"error"` and `"ready"` select a channel, any other name (or list of
    /// names) selects dispatches of those actions.
    pub fn when(&self, selector: impl Into<EventSelector>, listener: impl Fn(&Event) + 'static) -> Subscription {
        self.emitter().on_selected(selector.into(), Rc::new(listener))
    }

    /// Wait for the next matching event
    pub fn when_next(&self, selector: impl Into<EventSelector>) -> NextEvent {
        let emitter = self.emitter().clone();
        let selector = selector.into();
        Next::new(move |deliver| {
            emitter.on_selected(selector, Rc::new(move |event: &Event| deliver(event.clone())))
        })
    }

    /// Call `listener` whenever the selected value changes
    ///
    /// Values are compared by equality; `previous` is the value delivered
    /// last (or the value at subscription time).
    pub fn watch(
        &self,
        selector: impl Into<WatchSelector>,
        listener: impl Fn(&WatchChange) + 'static,
    ) -> Result<Subscription> {
        self.on_change(&selector.into(), Rc::new(move |change: &WatchChange| listener(change)))
    }

    /// Wait for the next change of the selected value
    pub fn watch_next(&self, selector: impl Into<WatchSelector>) -> Result<Next<WatchChange>> {
        let compiled = selector.into().compile()?;
        let store = self.clone();
        Ok(Next::new(move |deliver| {
            store.subscribe_compiled(
                compiled,
                Rc::new(move |_: &Store, change: &WatchChange| deliver(change.clone())),
            )
        }))
    }

    pub(crate) fn on_change(
        &self,
        selector: &WatchSelector,
        listener: Rc<dyn Fn(&WatchChange)>,
    ) -> Result<Subscription> {
        let compiled = selector.compile()?;
        Ok(self.subscribe_compiled(compiled, Rc::new(move |_: &Store, change: &WatchChange| listener(change))))
    }

    fn subscribe_compiled(&self, compiled: CompiledWatch, listener: WatchListener) -> Subscription {
        let previous = RefCell::new(compiled.select(self));
        let weak = self.downgrade();
        self.emitter().on(
            Channel::Update,
            Rc::new(move |_: &Event| {
                let Some(store) = weak.upgrade() else {
                    return;
                };
                let current = compiled.select(&store);
                if *previous.borrow() == current {
                    return;
                }
                let previous = previous.replace(current.clone());
                listener(&store, &WatchChange { current, previous });
            }),
        )
    }

    /// Handle to a state cell, created empty if it was never declared
    ///
    /// Undeclared cells are not part of [`state`](Store::state). Names of
    /// computed properties never get a cell.
    pub fn get(&self, name: &str) -> Result<StateCell> {
        if let Some(cell) = self.cell(name) {
            return Ok(cell);
        }
        if self.inner.computed.contains_key(name) {
            return Err(if self.is_private(name) {
                StoreError::PrivateProperty(name.into())
            } else {
                StoreError::ComputedProperty(name.into())
            });
        }
        let name: Rc<str> = name.into();
        let cell = StateCell::new(name.clone(), Value::Null, self.inner.batch.clone());
        self.inner.ad_hoc.borrow_mut().insert(name, cell.clone());
        Ok(cell)
    }

    fn is_private(&self, name: &str) -> bool {
        name.starts_with(self.inner.private_prefix)
    }

    fn cell(&self, name: &str) -> Option<StateCell> {
        self.inner
            .cells
            .get(name)
            .cloned()
            .or_else(|| self.inner.ad_hoc.borrow().get(name).cloned())
    }

    /// Snapshot of every declared state value
    pub fn state(&self) -> Snapshot {
        let token = self.inner.batch.value_token();
        let mut cache = self.inner.snapshot.borrow_mut();
        if let Some((built, snapshot)) = &*cache {
            if *built == token {
                return snapshot.clone();
            }
        }
        let values: IndexMap<Rc<str>, Value> = self
            .inner
            .cells
            .iter()
            .map(|(name, cell)| (name.clone(), cell.value()))
            .collect();
        let snapshot = match cache.take() {
            Some((_, previous)) if *previous.0 == values => previous,
            _ => Snapshot(Rc::new(values)),
        };
        *cache = Some((token, snapshot.clone()));
        snapshot
    }

    /// Settled value of a state cell or computed property
    ///
    /// Fails with [`StoreError::Pending`] while an async computed value is
    /// loading. Pending cells report their last settled value.
    pub fn value(&self, name: &str) -> Result<Value> {
        if let Some(cell) = self.cell(name) {
            return Ok(cell.value());
        }
        match self.computed(name)? {
            ComputedValue::Ready(value) => Ok(Value::clone(&value)),
            ComputedValue::Async(deferred) => match deferred.peek() {
                Some(outcome) => outcome,
                None => Err(StoreError::Pending(name.into())),
            },
            ComputedValue::Suspended(_) => Err(StoreError::Pending(name.into())),
        }
    }

    /// Wait until a cell or computed property has a settled value
    ///
    /// A suspended computed property is re-derived once the dependency that
    /// blocked it settles.
    pub async fn settled(&self, name: &str) -> Result<Value> {
        loop {
            let blocking = match self.cell(name) {
                Some(cell) => match (cell.pending(), cell.error()) {
                    (Some(pending), _) => pending,
                    (None, Some(error)) => return Err(error),
                    (None, None) => return Ok(cell.value()),
                },
                None => match self.computed(name)? {
                    ComputedValue::Ready(value) => return Ok(Value::clone(&value)),
                    ComputedValue::Async(deferred) => return deferred.await,
                    ComputedValue::Suspended(deferred) => deferred,
                },
            };
            // failures surface through the next read
            let _ = blocking.await;
            tokio::task::yield_now().await;
        }
    }

    pub fn value_as<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        Ok(serde_json::from_value(self.value(name)?)?)
    }

    /// Current value of a public computed property
    pub fn computed(&self, name: &str) -> Result<ComputedValue> {
        if self.is_private(name) {
            return Err(StoreError::PrivateProperty(name.into()));
        }
        match self.inner.computed.get(name) {
            Some(slot) => slot.evaluate(self),
            None => Err(StoreError::UnknownProperty(name.into())),
        }
    }

    /// Status/value/error triple of a cell or public computed property
    pub fn loadable(&self, name: &str) -> Result<Rc<Loadable>> {
        if let Some(cell) = self.cell(name) {
            return Ok(cell.loadable());
        }
        let loadable = match self.computed(name)? {
            ComputedValue::Ready(value) => Loadable::settled(Value::clone(&value)),
            ComputedValue::Async(deferred) | ComputedValue::Suspended(deferred) => match deferred.peek() {
                Some(Ok(value)) => Loadable::settled(value),
                Some(Err(error)) => Loadable {
                    status: Status::Failed,
                    value: Value::Null,
                    error: Some(error),
                },
                None => Loadable {
                    status: Status::Pending,
                    value: Value::Null,
                    error: None,
                },
            },
        };
        Ok(Rc::new(loadable))
    }

    /// Assign several declared cells at once
    ///
    /// Dispatched as `@store.setState`; names that are not declared are
    /// ignored.
    pub fn set_state(&self, values: Value) -> Task {
        self.dispatch(SET_STATE_ACTION, values)
    }

    /// Coalesce every notification raised by `f` into one batch
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.batch.run(f)
    }

    pub fn delay(&self, duration: Duration) -> Deferred {
        Deferred::delay(duration)
    }

    /// True while the init action is running
    pub fn loading(&self) -> bool {
        self.inner.init.borrow().loading
    }

    /// Failure of the init action, if it failed
    pub fn init_error(&self) -> Option<StoreError> {
        self.inner.init.borrow().error.clone()
    }

    pub fn downgrade(&self) -> WeakStore {
        WeakStore(Rc::downgrade(&self.inner))
    }

    pub(crate) fn coordinator(&self) -> &Rc<Batch> {
        &self.inner.batch
    }

    pub(crate) fn emitter(&self) -> &Emitter {
        self.inner.batch.emitter()
    }

    pub(crate) fn tasks(&self) -> &Rc<RefCell<TaskArena>> {
        &self.inner.tasks
    }

    pub(crate) fn action(&self, name: &str) -> Option<Action> {
        self.inner.actions.get(name).cloned()
    }

    /// Make `task` the latest invocation of `name`, returning the previous one
    pub(crate) fn swap_latest(&self, name: &Rc<str>, task: &Task) -> Option<Task> {
        self.inner
            .latest
            .borrow_mut()
            .insert(name.clone(), task.clone())
    }

    pub(crate) fn clear_latest(&self, task: &Task) {
        let mut latest = self.inner.latest.borrow_mut();
        if latest.get(task.action()).is_some_and(|current| current.ptr_eq(task)) {
            latest.remove(task.action());
        }
    }

    /// Resolve a dependency for a derivation
    ///
    /// Pending or failed values become a [`Suspense`].
    pub(crate) fn resolve(&self, path: &DependencyPath) -> std::result::Result<Value, Suspense> {
        let root = path.root();
        let value = if let Some(cell) = self.cell(root) {
            cell.read()?
        } else if let Some(slot) = self.inner.computed.get(root) {
            slot.evaluate(self).map_err(Suspense::Failed)?.read()?
        } else {
            return Err(Suspense::Failed(StoreError::UnknownProperty(root.into())));
        };
        Ok(path.apply(&value))
    }

    /// Read a path without suspending; anything unavailable reads as `null`
    pub(crate) fn peek_path(&self, path: &DependencyPath) -> Value {
        let root = path.root();
        let value = if let Some(cell) = self.cell(root) {
            cell.value()
        } else if let Some(slot) = self.inner.computed.get(root) {
            slot.evaluate(self)
                .ok()
                .and_then(|computed| computed.value())
                .unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        path.apply(&value)
    }

    pub(crate) fn mutate_all(&self, names: &[&str], deferred: Deferred) -> Result<()> {
        let cells = names.iter().map(|name| self.get(name)).collect::<Result<Vec<_>>>()?;
        let started: Vec<StateCell> = self.batch(|| cells.into_iter().filter(|cell| cell.begin(&deferred)).collect());
        if started.is_empty() {
            return Ok(());
        }
        if let Some(outcome) = deferred.peek() {
            settle_all(self, &deferred, &started, outcome);
            return Ok(());
        }
        let weak = self.downgrade();
        let cells: Vec<WeakStateCell> = started.iter().map(StateCell::downgrade).collect();
        tokio::task::spawn_local(async move {
            let outcome = deferred.clone().await;
            let Some(store) = weak.upgrade() else {
                return;
            };
            let cells: Vec<StateCell> = cells.iter().filter_map(WeakStateCell::upgrade).collect();
            settle_all(&store, &deferred, &cells, outcome);
        });
        Ok(())
    }

    fn start_init(&self, target: ActionTarget) {
        let task = self.dispatch(target, Value::Null);
        if !task.is_running() {
            self.inner.init.borrow_mut().error = task.error();
            return;
        }
        self.inner.init.borrow_mut().loading = true;
        let weak = self.downgrade();
        task.on_settle(move |outcome| {
            let Some(store) = weak.upgrade() else {
                return;
            };
            {
                let mut init = store.inner.init.borrow_mut();
                init.loading = false;
                init.error = outcome.as_ref().err().cloned();
            }
            debug!(ok = outcome.is_ok(), "init settled");
            store.batch(|| {
                store.inner.batch.status_changed();
                if outcome.is_ok() {
                    store.emitter().emit(&Event::Ready);
                }
            });
        });
    }
}

fn settle_all(store: &Store, deferred: &Deferred, cells: &[StateCell], outcome: Result<Value>) {
    store.batch(|| {
        for cell in cells {
            let name: Rc<str> = cell.name().into();
            let reducer: Reducer = Rc::new(move |current: &Value, resolved: Value| {
                resolved.get(&*name).cloned().unwrap_or_else(|| current.clone())
            });
            cell.settle(deferred, outcome.clone(), Some(&reducer));
        }
    });
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("state", &self.inner.cells.keys().collect::<Vec<_>>())
            .field("computed", &self.inner.computed.keys().collect::<Vec<_>>())
            .field("actions", &self.inner.actions.len())
            .finish()
    }
}

/// Non-owning handle to a [`Store`]
#[derive(Clone)]
pub struct WeakStore(Weak<StoreInner>);

impl WeakStore {
    pub fn upgrade(&self) -> Option<Store> {
        self.0.upgrade().map(|inner| Store { inner })
    }
}

/// Declares and builds a [`Store`]
///
/// # Example
/// ```ignore
/// let store = Store::builder()
///     .state("query", json!(""))
///     .state("results", json!([]))
///     .computed("_count", Computed::new(["results.len()"], |args| args[0].clone()))
///     .computed("summary", Computed::new(["query", "_count"], |args| {
///         json!(format!("{}: {}", args[0], args[1]))
///     }))
///     .watch("query", |store, _change| {
///         store.dispatch("search", Value::Null);
///     })
///     .private_prefix('_')
///     .build()?;
/// ```
pub struct StoreBuilder {
    state: IndexMap<Rc<str>, Value>,
    computed: IndexMap<Rc<str>, Computed>,
    actions: FastHashMap<Rc<str>, Action>,
    watchers: Vec<(WatchSelector, WatchListener)>,
    init: Option<ActionTarget>,
    private_prefix: char,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        StoreBuilder {
            state: IndexMap::new(),
            computed: IndexMap::new(),
            actions: FastHashMap::default(),
            watchers: Vec::new(),
            init: None,
            private_prefix: DEFAULT_PRIVATE_PREFIX,
        }
    }

    /// Declare a state cell
    pub fn state(mut self, name: impl Into<Rc<str>>, initial: Value) -> Self {
        self.state.insert(name.into(), initial);
        self
    }

    /// Declare a computed property
    ///
    /// A state cell of the same name shadows it.
    pub fn computed(mut self, name: impl Into<Rc<str>>, computed: Computed) -> Self {
        self.computed.insert(name.into(), computed);
        self
    }

    /// Register an action body under `name`
    pub fn action<F>(self, name: impl Into<Rc<str>>, body: F) -> Self
    where
        F: Fn(&ActionContext, Value) -> Result<Outcome> + 'static,
    {
        self.register(Action::new(name, body))
    }

    pub fn register(mut self, action: Action) -> Self {
        self.actions.insert(action.name_rc(), action);
        self
    }

    /// Call `listener` for every change of the selected value
    pub fn watch<F>(mut self, selector: impl Into<WatchSelector>, listener: F) -> Self
    where
        F: Fn(&Store, &WatchChange) + 'static,
    {
        self.watchers.push((selector.into(), Rc::new(listener)));
        self
    }

    /// Dispatch `target` once the store is built
    ///
    /// While an async init runs, [`Store::loading`] is true; success emits
    /// `ready`.
    pub fn init(mut self, target: impl Into<ActionTarget>) -> Self {
        self.init = Some(target.into());
        self
    }

    /// Marker for computed properties hidden from the public surface
    pub fn private_prefix(mut self, prefix: char) -> Self {
        self.private_prefix = prefix;
        self
    }

    /// Fails if a computed dependency or watch path does not parse
    pub fn build(self) -> Result<Store> {
        let batch = Rc::new(Batch::new(Emitter::new()));
        let cells = self
            .state
            .into_iter()
            .map(|(name, initial)| (name.clone(), StateCell::new(name, initial, batch.clone())))
            .collect();
        let computed = self
            .computed
            .into_iter()
            .map(|(name, computed)| -> Result<(Rc<str>, ComputedSlot)> {
                Ok((name.clone(), computed.compile(name)?))
            })
            .collect::<Result<IndexMap<_, _>>>()?;

        let mut actions = self.actions;
        actions
            .entry(SET_STATE_ACTION.into())
            .or_insert_with(set_state_action);

        let store = Store {
            inner: Rc::new(StoreInner {
                batch,
                cells,
                ad_hoc: RefCell::new(FastHashMap::default()),
                computed,
                actions,
                private_prefix: self.private_prefix,
                snapshot: RefCell::new(None),
                tasks: Rc::new(RefCell::new(TaskArena::new())),
                latest: RefCell::new(FastHashMap::default()),
                init: RefCell::new(InitState::default()),
            }),
        };

        for (selector, listener) in self.watchers {
            let compiled = selector.compile()?;
            store.subscribe_compiled(compiled, listener).detach();
        }
        if let Some(init) = self.init {
            store.start_init(init);
        }
        debug!(
            state = store.inner.cells.len(),
            computed = store.inner.computed.len(),
            actions = store.inner.actions.len(),
            "store built"
        );
        Ok(store)
    }
}

fn set_state_action() -> Action {
    Action::new(SET_STATE_ACTION, |cx, payload| {
        let Value::Object(values) = payload else {
            return Err(StoreError::msg("setState expects an object"));
        };
        for (name, value) in values {
            if let Some(cell) = cx.store().inner.cells.get(name.as_str()) {
                cell.set(value);
            }
        }
        Ok(Outcome::Value(Value::Null))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_store() -> Store {
        Store::builder()
            .state("count", json!(0))
            .state("name", json!("a"))
            .build()
            .unwrap()
    }

    #[test]
    fn snapshot_is_reused_until_a_value_changes() {
        let store = counter_store();
        let first = store.state();
        assert!(first.ptr_eq(&store.state()));

        store.get("count").unwrap().set(json!(1));
        let second = store.state();
        assert!(!first.ptr_eq(&second));
        assert_eq!(second.get("count"), Some(&json!(1)));
    }

    #[test]
    fn snapshot_identity_survives_unrelated_mutations() {
        let store = counter_store();
        let first = store.state();
        store.get("scratch").unwrap().set(json!(true));
        assert!(first.ptr_eq(&store.state()));
    }

    #[test]
    fn set_state_assigns_declared_cells_only() {
        let store = counter_store();
        store.set_state(json!({ "count": 5, "unknown": 1 }));
        assert_eq!(store.value("count").unwrap(), json!(5));
        assert_eq!(store.state().len(), 2);
    }

    #[test]
    fn unknown_property_is_an_error() {
        let store = counter_store();
        assert!(matches!(store.value("missing"), Err(StoreError::UnknownProperty(_))));
    }

    #[test]
    fn ad_hoc_cells_are_created_on_demand() {
        let store = counter_store();
        assert_eq!(store.get("draft").unwrap().value(), Value::Null);
        store.get("draft").unwrap().set(json!("hi"));
        assert_eq!(store.value("draft").unwrap(), json!("hi"));
        assert!(store.state().get("draft").is_none());
    }

    #[test]
    fn computed_names_never_get_a_cell() {
        let store = Store::builder()
            .state("count", json!(1))
            .computed("doubled", Computed::new(["count"], |args| json!(args[0].as_i64().unwrap_or(0) * 2)))
            .computed("_tripled", Computed::new(["count"], |args| json!(args[0].as_i64().unwrap_or(0) * 3)))
            .build()
            .unwrap();

        assert!(matches!(store.get("doubled"), Err(StoreError::ComputedProperty(_))));
        assert!(matches!(store.get("_tripled"), Err(StoreError::PrivateProperty(_))));
        assert_eq!(store.value("doubled").unwrap(), json!(2));
        assert!(store.inner.ad_hoc.borrow().is_empty());
    }

    #[test]
    fn invalid_watch_path_fails_build() {
        let result = Store::builder().watch("a.map(", |_, _| {}).build();
        assert!(matches!(result, Err(StoreError::InvalidPath { .. })));
    }
}
