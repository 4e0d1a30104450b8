//! Named-channel publish/subscribe.
//!
//! Every store owns one emitter. Dispatches, value changes, batched updates,
//! errors and the init `ready` notification all travel through it. Listeners
//! live in a slab per channel; a [`Subscription`] removes its listener when it
//! is dropped.

use crate::error::StoreError;
use crate::hash::FastHashMap;
use futures::channel::oneshot;
use serde_json::{Value, json};
use slab::Slab;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

/// Reserved notification channels
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// An action was dispatched (fires before the action body runs)
    Dispatch,
    /// At least one state value changed during the last batch
    Change,
    /// A value or an async status changed during the last batch
    Update,
    /// An action, routine or async mutation failed
    Error,
    /// The async init action completed
    Ready,
}

impl Channel {
    pub fn name(self) -> &'static str {
        match self {
            Channel::Dispatch => "dispatch",
            Channel::Change => "change",
            Channel::Update => "update",
            Channel::Error => "error",
            Channel::Ready => "ready",
        }
    }

    /// Look up a reserved channel by name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "dispatch" => Some(Channel::Dispatch),
            "change" => Some(Channel::Change),
            "update" => Some(Channel::Update),
            "error" => Some(Channel::Error),
            "ready" => Some(Channel::Ready),
            _ => None,
        }
    }
}

/// A notification delivered to listeners
#[derive(Clone, Debug)]
pub enum Event {
    Dispatch { action: Rc<str>, payload: Value },
    Change,
    Update,
    Error(StoreError),
    Ready,
}

impl Event {
    pub fn channel(&self) -> Channel {
        match self {
            Event::Dispatch { .. } => Channel::Dispatch,
            Event::Change => Channel::Change,
            Event::Update => Channel::Update,
            Event::Error(_) => Channel::Error,
            Event::Ready => Channel::Ready,
        }
    }

    /// Name of the dispatched action, for dispatch events
    pub fn action(&self) -> Option<&str> {
        match self {
            Event::Dispatch { action, .. } => Some(action),
            _ => None,
        }
    }

    /// The value a routine is resumed with when it waits for this event
    ///
    /// Dispatch events become `{"type": action, "payload": payload}`.
    pub fn to_value(&self) -> Value {
        match self {
            Event::Dispatch { action, payload } => json!({ "type": &**action, "payload": payload }),
            Event::Error(error) => json!({ "type": "error", "message": error.to_string() }),
            other => json!({ "type": other.channel().name() }),
        }
    }
}

/// Which events a listener is interested in
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventSelector {
    /// Any dispatch (`"*"`)
    Any,
    /// Dispatches of one action
    Action(Rc<str>),
    /// Dispatches of any of several actions
    Actions(Vec<Rc<str>>),
    /// Everything emitted on a reserved channel
    Channel(Channel),
}

impl EventSelector {
    pub fn channel(&self) -> Channel {
        match self {
            EventSelector::Channel(channel) => *channel,
            _ => Channel::Dispatch,
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        match self {
            EventSelector::Any => event.channel() == Channel::Dispatch,
            EventSelector::Action(name) => event.action() == Some(&**name),
            EventSelector::Actions(names) => event
                .action()
                .is_some_and(|action| names.iter().any(|name| &**name == action)),
            EventSelector::Channel(channel) => event.channel() == *channel,
        }
    }
}

impl From<&str> for EventSelector {
    fn from(name: &str) -> Self {
        if name == "*" {
            return EventSelector::Any;
        }
        match Channel::from_name(name) {
            Some(channel) => EventSelector::Channel(channel),
            None => EventSelector::Action(name.into()),
        }
    }
}

impl From<String> for EventSelector {
    fn from(name: String) -> Self {
        EventSelector::from(name.as_str())
    }
}

impl From<Channel> for EventSelector {
    fn from(channel: Channel) -> Self {
        EventSelector::Channel(channel)
    }
}

impl From<Vec<&str>> for EventSelector {
    fn from(names: Vec<&str>) -> Self {
        EventSelector::Actions(names.into_iter().map(Rc::from).collect())
    }
}

impl From<&[&str]> for EventSelector {
    fn from(names: &[&str]) -> Self {
        EventSelector::Actions(names.iter().copied().map(Rc::from).collect())
    }
}

impl<const N: usize> From<[&str; N]> for EventSelector {
    fn from(names: [&str; N]) -> Self {
        EventSelector::Actions(names.into_iter().map(Rc::from).collect())
    }
}

pub(crate) type Listener = Rc<dyn Fn(&Event)>;

#[derive(Default)]
struct EmitterInner {
    channels: RefCell<FastHashMap<Channel, Slab<Listener>>>,
}

#[derive(Clone, Default)]
pub(crate) struct Emitter {
    inner: Rc<EmitterInner>,
}

impl Emitter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a listener on a channel
    pub(crate) fn on(&self, channel: Channel, listener: Listener) -> Subscription {
        let key = self
            .inner
            .channels
            .borrow_mut()
            .entry(channel)
            .or_default()
            .insert(listener);
        Subscription {
            emitter: Rc::downgrade(&self.inner),
            channel,
            key: Some(key),
        }
    }

    /// Register a listener that only sees events matching `selector`
    pub(crate) fn on_selected(&self, selector: EventSelector, listener: Listener) -> Subscription {
        let channel = selector.channel();
        let listener: Listener = match selector {
            EventSelector::Channel(_) => listener,
            selector => Rc::new(move |event: &Event| {
                if selector.matches(event) {
                    listener(event);
                }
            }),
        };
        self.on(channel, listener)
    }

    /// Deliver an event to every listener of its channel
    ///
    /// Listeners are snapshotted first so they may subscribe or unsubscribe
    /// while the event is being delivered. A listener removed during delivery
    /// is not called afterwards; one added during delivery waits for the next
    /// event.
    pub(crate) fn emit(&self, event: &Event) {
        let channel = event.channel();
        let listeners: Vec<(usize, Listener)> = match self.inner.channels.borrow().get(&channel) {
            Some(slab) => slab
                .iter()
                .map(|(key, listener)| (key, Rc::clone(listener)))
                .collect(),
            None => return,
        };

        for (key, listener) in listeners {
            let live = self
                .inner
                .channels
                .borrow()
                .get(&channel)
                .and_then(|slab| slab.get(key))
                .is_some_and(|current| Rc::ptr_eq(current, &listener));
            if live {
                listener(event);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self, channel: Channel) -> usize {
        self.inner
            .channels
            .borrow()
            .get(&channel)
            .map_or(0, Slab::len)
    }
}

/// Handle to a registered listener
///
/// Dropping the handle (or calling [`unsubscribe`](Subscription::unsubscribe))
/// removes the listener. Use [`detach`](Subscription::detach) to keep the
/// listener for the lifetime of the store.
#[must_use = "dropping a Subscription removes its listener"]
pub struct Subscription {
    emitter: Weak<EmitterInner>,
    channel: Channel,
    key: Option<usize>,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    /// Keep the listener registered until the store is dropped
    pub fn detach(mut self) {
        self.key = None;
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let (Some(key), Some(inner)) = (self.key.take(), self.emitter.upgrade()) else {
            return;
        };
        // Take the listener out before dropping it: its captures may own
        // other subscriptions on this emitter.
        let removed = inner
            .channels
            .borrow_mut()
            .get_mut(&self.channel)
            .and_then(|slab| slab.try_remove(key));
        drop(removed);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("active", &self.key.is_some())
            .finish()
    }
}

/// One-shot awaitable that resolves with the next matching item
///
/// Resolves to `None` once [`cancel`](Next::cancel) has been called.
pub struct Next<T> {
    rx: oneshot::Receiver<T>,
    subscription: Rc<RefCell<Option<Subscription>>>,
}

/// Awaitable returned by `Store::when_next`
pub type NextEvent = Next<Event>;

impl<T: 'static> Next<T> {
    /// Build a one-shot awaitable around a subscription
    ///
    /// `subscribe` receives the delivery callback and returns the subscription
    /// feeding it. The subscription is released after the first delivery.
    pub(crate) fn new<S>(subscribe: S) -> Self
    where
        S: FnOnce(Rc<dyn Fn(T)>) -> Subscription,
    {
        let (tx, rx) = oneshot::channel();
        let slot: Rc<RefCell<Option<Subscription>>> = Rc::default();
        let sender = RefCell::new(Some(tx));
        let weak_slot = Rc::downgrade(&slot);

        let deliver: Rc<dyn Fn(T)> = Rc::new(move |item| {
            if let Some(tx) = sender.borrow_mut().take() {
                let _ = tx.send(item);
            }
            if let Some(slot) = weak_slot.upgrade() {
                let subscription = slot.borrow_mut().take();
                drop(subscription);
            }
        });

        let subscription = subscribe(deliver);
        *slot.borrow_mut() = Some(subscription);
        Next {
            rx,
            subscription: slot,
        }
    }

    /// Stop waiting; the awaitable resolves to `None`
    pub fn cancel(&self) {
        let subscription = self.subscription.borrow_mut().take();
        drop(subscription);
    }
}

impl<T> Future for Next<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(Result::ok)
    }
}
