//! Step-by-step driver for suspendable routines.
//!
//! A [`Routine`] is a state machine: every call to [`Routine::resume`] runs
//! one synchronous step and either yields an [`Effect`] or finishes. The
//! driver starts the effect and, once it settles, resumes the routine with
//! the outcome. Effects that settle while they are being started (a call to
//! a plain action, a fork, an already settled future) are trampolined: the
//! driver loops instead of recursing.
//!
//! Everything a waiting routine holds on to (timers, event subscriptions,
//! called children) is registered as a disposer on its task in the store's
//! task arena, so cancelling the task releases it.

use crate::arena::{Disposer, DisposerKey};
use crate::cell::{MutateInput, StateCell};
use crate::deferred::Deferred;
use crate::dispatch::{self, ActionTarget, Origin, Task};
use crate::effect::{Effect, WaitSource};
use crate::emitter::{Event, EventSelector};
use crate::error::{Result, StoreError};
use crate::selector::ComputedValue;
use crate::store::{Snapshot, Store, WatchChange, WatchSelector, WeakStore};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use tracing::{trace, warn};

/// Input a routine is resumed with
#[derive(Clone, Debug)]
pub enum Resume {
    /// First step
    Start,
    /// The previous effect settled with a value
    Value(Value),
    /// The previous effect failed; return it (or a new error) to fail the task
    Error(StoreError),
}

impl Resume {
    /// `Start` becomes `null`; an injected failure becomes `Err`
    pub fn into_result(self) -> Result<Value> {
        match self {
            Resume::Start => Ok(Value::Null),
            Resume::Value(value) => Ok(value),
            Resume::Error(error) => Err(error),
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, Resume::Start)
    }
}

impl From<Result<Value>> for Resume {
    fn from(outcome: Result<Value>) -> Self {
        match outcome {
            Ok(value) => Resume::Value(value),
            Err(error) => Resume::Error(error),
        }
    }
}

/// Result of one routine step
#[derive(Debug)]
pub enum Step {
    /// Suspend until the effect settles
    Yield(Effect),
    /// Finish the task with a value
    Done(Value),
}

/// A suspendable action body
///
/// Returning `Err` from `resume` is an uncaught failure: the task fails with
/// it. Use `input.into_result()?` to let injected failures propagate, or
/// match on [`Resume::Error`] to recover.
///
/// # Example
/// ```ignore
/// struct Countdown(u32);
///
/// impl Routine for Countdown {
///     fn resume(&mut self, cx: &mut RoutineContext<'_>, input: Resume) -> Result<Step> {
///         input.into_result()?;
///         if self.0 == 0 {
///             return Ok(Step::Done(Value::Null));
///         }
///         self.0 -= 1;
///         cx.update("ticks", |ticks| json!(ticks.as_u64().unwrap_or(0) + 1))?;
///         Ok(Step::Yield(cx.delay(Duration::from_secs(1))))
///     }
/// }
/// ```
pub trait Routine {
    fn resume(&mut self, cx: &mut RoutineContext<'_>, input: Resume) -> Result<Step>;
}

impl<F> Routine for F
where
    F: FnMut(&mut RoutineContext<'_>, Resume) -> Result<Step>,
{
    fn resume(&mut self, cx: &mut RoutineContext<'_>, input: Resume) -> Result<Step> {
        self(cx, input)
    }
}

/// The currently stepping routine
///
/// Reads and writes go straight to the store. Dispatching from here does not
/// run anything: it builds an [`Effect::Call`] for the routine to yield, so
/// only one routine step is ever on the stack.
pub struct RoutineContext<'a> {
    store: &'a Store,
    task: &'a Task,
    previous: Option<&'a Task>,
}

impl<'a> RoutineContext<'a> {
    pub fn store(&self) -> &'a Store {
        self.store
    }

    pub fn task(&self) -> &'a Task {
        self.task
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

    pub fn state(&self) -> Snapshot {
        self.store.state()
    }

    pub fn computed(&self, name: &str) -> Result<ComputedValue> {
        self.store.computed(name)
    }

    /// Build a call of `target`; yield it to run the action
    pub fn dispatch(&self, target: impl Into<ActionTarget>, payload: Value) -> Effect {
        Effect::call(target, payload)
    }

    pub fn call(&self, target: impl Into<ActionTarget>, payload: Value) -> Effect {
        Effect::call(target, payload)
    }

    pub fn fork(&self, target: impl Into<ActionTarget>, payload: Value) -> Effect {
        Effect::fork(target, payload)
    }

    pub fn wait(&self, deferred: Deferred) -> Effect {
        Effect::wait(deferred)
    }

    pub fn when(&self, selector: impl Into<EventSelector>) -> Effect {
        Effect::when(selector)
    }

    pub fn watch(&self, selector: impl Into<WatchSelector>) -> Effect {
        Effect::watch(selector)
    }

    pub fn delay(&self, duration: Duration) -> Effect {
        Effect::delay(duration)
    }

    /// Cancel the previous invocation of this action, if still running
    pub fn latest(&self) {
        if let Some(previous) = self.previous {
            previous.cancel();
        }
    }

    /// Cancel the previous invocation, then wait `duration`
    pub fn debounce(&self, duration: Duration) -> Effect {
        self.latest();
        Effect::delay(duration)
    }
}

type Sink = Rc<dyn Fn(Result<Value>)>;

enum Slot {
    /// Stepping the routine, or finished
    Idle,
    /// Starting an effect; a completion now is trampolined
    Starting,
    /// The effect settled while it was being started
    Settled(Resume),
    Waiting,
}

/// Bookkeeping shared by the entries of an `All` or `Race`
#[derive(Default)]
struct Group {
    done: Cell<bool>,
    results: RefCell<Vec<Option<Value>>>,
    remaining: Cell<usize>,
    entry_keys: RefCell<Vec<Vec<DisposerKey>>>,
}

struct Driver {
    store: WeakStore,
    task: Task,
    routine: RefCell<Box<dyn Routine>>,
    previous: Option<Task>,
    slot: RefCell<Slot>,
    generation: Cell<u64>,
    wait_keys: RefCell<Vec<DisposerKey>>,
}

/// Drive `routine` as the body of `task`
///
/// Steps synchronously until the first effect that does not settle on the
/// spot; the task is async if it is still running afterwards.
pub(crate) fn run(store: &Store, task: &Task, routine: Box<dyn Routine>, previous: Option<Task>) {
    let driver = Rc::new(Driver {
        store: store.downgrade(),
        task: task.clone(),
        routine: RefCell::new(routine),
        previous,
        slot: RefCell::new(Slot::Idle),
        generation: Cell::new(0),
        wait_keys: RefCell::new(Vec::new()),
    });
    driver.drive(store, Resume::Start);
    if task.is_running() {
        task.set_async();
    }
}

impl Driver {
    fn drive(self: &Rc<Self>, store: &Store, input: Resume) {
        store.batch(|| self.drive_batched(store, input));
    }

    fn drive_batched(self: &Rc<Self>, store: &Store, mut input: Resume) {
        loop {
            if !self.task.is_running() {
                return;
            }
            let step = {
                let mut cx = RoutineContext {
                    store,
                    task: &self.task,
                    previous: self.previous.as_ref(),
                };
                let mut routine = self.routine.borrow_mut();
                routine.resume(&mut cx, input)
            };

            let effect = match step {
                Err(error) => return self.finish(store, Err(error)),
                Ok(Step::Done(value)) => return self.finish(store, Ok(value)),
                Ok(Step::Yield(effect)) => effect,
            };
            // the step itself may have cancelled the task
            if !self.task.is_running() {
                return;
            }

            trace!(action = %self.task.action(), effect = effect.kind(), "yield");
            let generation = self.generation.get() + 1;
            self.generation.set(generation);
            *self.slot.borrow_mut() = Slot::Starting;

            if let Err(fault) = self.start(store, effect, self.sink(generation)) {
                warn!(action = %self.task.action(), %fault, "routine yielded an invalid effect");
                *self.slot.borrow_mut() = Slot::Idle;
                self.cancel_wait(store);
                return self.finish(store, Err(fault));
            }

            let started = std::mem::replace(&mut *self.slot.borrow_mut(), Slot::Waiting);
            match started {
                Slot::Settled(resume) => {
                    cov_mark::hit!(sync_effect_trampolined);
                    *self.slot.borrow_mut() = Slot::Idle;
                    self.release_wait(store);
                    input = resume;
                }
                _ => return,
            }
        }
    }

    /// Completion callback for the effect started at `generation`
    fn sink(self: &Rc<Self>, generation: u64) -> Sink {
        let driver = self.clone();
        Rc::new(move |outcome: Result<Value>| driver.complete(generation, outcome))
    }

    fn complete(self: &Rc<Self>, generation: u64, outcome: Result<Value>) {
        if generation != self.generation.get() || !self.task.is_running() {
            return;
        }
        let slot = std::mem::replace(&mut *self.slot.borrow_mut(), Slot::Idle);
        match slot {
            Slot::Starting => *self.slot.borrow_mut() = Slot::Settled(outcome.into()),
            Slot::Waiting => {
                let Some(store) = self.store.upgrade() else {
                    return;
                };
                self.release_wait(&store);
                self.drive(&store, outcome.into());
            }
            // already resumed by an earlier completion
            other => *self.slot.borrow_mut() = other,
        }
    }

    fn finish(&self, store: &Store, outcome: Result<Value>) {
        *self.slot.borrow_mut() = Slot::Idle;
        self.wait_keys.borrow_mut().clear();
        dispatch::finish_task(store, &self.task, outcome);
    }

    /// Register a disposer for the current wait
    ///
    /// If the task is gone the disposer runs right away.
    fn register(&self, store: &Store, disposer: Disposer) -> Option<DisposerKey> {
        let Some(id) = self.task.id() else {
            disposer();
            return None;
        };
        let added = store.tasks().borrow_mut().add_disposer(id, disposer);
        match added {
            Ok(key) => {
                self.wait_keys.borrow_mut().push(key);
                Some(key)
            }
            Err(disposer) => {
                disposer();
                None
            }
        }
    }

    fn take_disposers(&self, store: &Store, keys: impl IntoIterator<Item = DisposerKey>) -> Vec<Disposer> {
        let Some(id) = self.task.id() else {
            return Vec::new();
        };
        let mut arena = store.tasks().borrow_mut();
        keys.into_iter()
            .filter_map(|key| arena.take_disposer(id, key))
            .collect()
    }

    /// The wait settled: release what it held without cancelling it
    fn release_wait(&self, store: &Store) {
        let keys = std::mem::take(&mut *self.wait_keys.borrow_mut());
        drop(self.take_disposers(store, keys));
    }

    /// Abandon a partially started wait
    fn cancel_wait(&self, store: &Store) {
        let keys = std::mem::take(&mut *self.wait_keys.borrow_mut());
        for disposer in self.take_disposers(store, keys) {
            disposer();
        }
    }

    /// Cancel every entry of a group except `winner`
    fn cancel_entries(&self, store: &Store, group: &Group, winner: usize) -> usize {
        let keys: Vec<DisposerKey> = group
            .entry_keys
            .borrow()
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != winner)
            .flat_map(|(_, keys)| keys.iter().copied())
            .collect();
        let disposers = self.take_disposers(store, keys);
        let count = disposers.len();
        for disposer in disposers {
            disposer();
        }
        count
    }

    /// Start `effect`; `sink` receives its outcome exactly once
    ///
    /// Returns the disposer keys registered for it.
    fn start(self: &Rc<Self>, store: &Store, effect: Effect, sink: Sink) -> Result<Vec<DisposerKey>> {
        let mut keys = Vec::new();
        match effect {
            Effect::Call { target, payload } => {
                let child = dispatch::dispatch(store, target, payload, Origin::Called(&self.task));
                let cancel = child.clone();
                keys.extend(self.register(store, Box::new(move || cancel.cancel())));
                child.on_settle(move |outcome| sink(outcome.clone()));
            }
            Effect::Fork { target, payload } => {
                dispatch::dispatch(store, target, payload, Origin::Forked(&self.task));
                sink(Ok(Value::Null));
            }
            Effect::Wait(WaitSource::Future(deferred)) => match deferred.peek() {
                Some(outcome) => sink(outcome),
                None => {
                    let waiter = tokio::task::spawn_local(async move {
                        let outcome = deferred.await;
                        sink(outcome);
                    });
                    keys.extend(self.register(store, Box::new(move || waiter.abort())));
                }
            },
            Effect::Wait(WaitSource::Delay(duration)) => {
                let timer = tokio::task::spawn_local(async move {
                    tokio::time::sleep(duration).await;
                    sink(Ok(Value::Null));
                });
                keys.extend(self.register(store, Box::new(move || timer.abort())));
            }
            Effect::Wait(WaitSource::Event(selector)) => {
                let fired = Cell::new(false);
                let subscription = store.emitter().on_selected(
                    selector,
                    Rc::new(move |event: &Event| {
                        if !fired.replace(true) {
                            sink(Ok(event.to_value()));
                        }
                    }),
                );
                keys.extend(self.register(store, Box::new(move || drop(subscription))));
            }
            Effect::Wait(WaitSource::Change(selector)) => {
                let fired = Cell::new(false);
                let subscription = store.on_change(
                    &selector,
                    Rc::new(move |change: &WatchChange| {
                        if !fired.replace(true) {
                            sink(Ok(change.to_value()));
                        }
                    }),
                )?;
                keys.extend(self.register(store, Box::new(move || drop(subscription))));
            }
            Effect::All(entries) => keys.extend(self.start_all(store, entries, sink)?),
            Effect::Race(entries) => {
                let entries: Vec<(String, Effect)> = entries.into_iter().collect();
                keys.extend(self.start_race(store, entries, sink)?);
            }
        }
        Ok(keys)
    }

    fn start_all(self: &Rc<Self>, store: &Store, entries: Vec<Effect>, sink: Sink) -> Result<Vec<DisposerKey>> {
        if entries.is_empty() {
            return Err(StoreError::InvalidSuspension("`all` needs at least one effect"));
        }
        let group = Rc::new(Group {
            results: RefCell::new(vec![None; entries.len()]),
            remaining: Cell::new(entries.len()),
            ..Group::default()
        });

        for (index, entry) in entries.into_iter().enumerate() {
            if group.done.get() {
                break;
            }
            let entry_sink: Sink = {
                let driver = self.clone();
                let group = group.clone();
                let sink = sink.clone();
                Rc::new(move |outcome: Result<Value>| {
                    if group.done.get() {
                        return;
                    }
                    match outcome {
                        Ok(value) => {
                            group.results.borrow_mut()[index] = Some(value);
                            let remaining = group.remaining.get() - 1;
                            group.remaining.set(remaining);
                            if remaining == 0 {
                                group.done.set(true);
                                let values = std::mem::take(&mut *group.results.borrow_mut());
                                sink(Ok(values.into_iter().map(Option::unwrap_or_default).collect()));
                            }
                        }
                        Err(error) => {
                            group.done.set(true);
                            if let Some(store) = driver.store.upgrade() {
                                driver.cancel_entries(&store, &group, index);
                            }
                            sink(Err(error));
                        }
                    }
                })
            };
            let entry_keys = self.start(store, entry, entry_sink)?;
            group.entry_keys.borrow_mut().push(entry_keys);
        }

        let keys = group.entry_keys.borrow().iter().flatten().copied().collect();
        Ok(keys)
    }

    fn start_race(
        self: &Rc<Self>,
        store: &Store,
        entries: Vec<(String, Effect)>,
        sink: Sink,
    ) -> Result<Vec<DisposerKey>> {
        if entries.is_empty() {
            return Err(StoreError::InvalidSuspension("`race` needs at least one effect"));
        }
        let group = Rc::new(Group::default());

        for (index, (key, entry)) in entries.into_iter().enumerate() {
            if group.done.get() {
                break;
            }
            let entry_sink: Sink = {
                let driver = self.clone();
                let group = group.clone();
                let sink = sink.clone();
                Rc::new(move |outcome: Result<Value>| {
                    if group.done.replace(true) {
                        return;
                    }
                    if let Some(store) = driver.store.upgrade() {
                        let cancelled = driver.cancel_entries(&store, &group, index);
                        if cancelled > 0 {
                            cov_mark::hit!(race_loser_cancelled);
                            trace!(action = %driver.task.action(), winner = %key, cancelled, "race settled");
                        }
                    }
                    sink(outcome.map(|value| {
                        let mut winner = Map::new();
                        winner.insert(key.clone(), value);
                        Value::Object(winner)
                    }));
                })
            };
            let entry_keys = self.start(store, entry, entry_sink)?;
            group.entry_keys.borrow_mut().push(entry_keys);
        }

        let keys = group.entry_keys.borrow().iter().flatten().copied().collect();
        Ok(keys)
    }
}
