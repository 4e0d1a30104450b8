use crate::emitter::{Emitter, Event};
use std::cell::Cell;
use tracing::trace;

/// Opaque version stamp
///
/// Tokens are only ever compared for equality. Every value or status mutation
/// in a store produces a fresh token, which invalidates memoized snapshots and
/// selector results keyed by the previous one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChangeToken(u64);

impl ChangeToken {
    pub(crate) const INITIAL: ChangeToken = ChangeToken(0);
}

/// Coalesces mutations into one `change` + `update` notification pair
///
/// Mutations that happen while a batch is open only set flags. When the
/// outermost batch exits the flags are flushed: `change` fires if any value
/// changed, then `update` fires if any value or status changed. A mutation
/// outside of any batch flushes immediately.
pub(crate) struct Batch {
    emitter: Emitter,
    depth: Cell<usize>,
    flushing: Cell<bool>,
    changed: Cell<bool>,
    updated: Cell<bool>,
    counter: Cell<u64>,
    value_token: Cell<ChangeToken>,
    token: Cell<ChangeToken>,
}

/// RAII guard that closes a batch level, even when unwinding
struct BatchGuard<'a> {
    batch: &'a Batch,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let depth = self.batch.depth.get().saturating_sub(1);
        self.batch.depth.set(depth);
        // Listeners observing a half-applied batch during a panic would see
        // inconsistent state, so pending flags are left for the next flush.
        if depth == 0 && !std::thread::panicking() {
            self.batch.flush();
        }
    }
}

struct FlushGuard<'a> {
    flushing: &'a Cell<bool>,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.flushing.set(false);
    }
}

impl Batch {
    pub(crate) fn new(emitter: Emitter) -> Self {
        Batch {
            emitter,
            depth: Cell::new(0),
            flushing: Cell::new(false),
            changed: Cell::new(false),
            updated: Cell::new(false),
            counter: Cell::new(0),
            value_token: Cell::new(ChangeToken::INITIAL),
            token: Cell::new(ChangeToken::INITIAL),
        }
    }

    pub(crate) fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    /// Run `f` inside a batch
    ///
    /// Batches nest; only the outermost one flushes.
    pub(crate) fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        self.depth.set(self.depth.get() + 1);
        let _guard = BatchGuard { batch: self };
        f()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.depth.get() > 0
    }

    /// Allocate a fresh token
    pub(crate) fn next_token(&self) -> ChangeToken {
        let next = self.counter.get() + 1;
        self.counter.set(next);
        ChangeToken(next)
    }

    /// Token bumped on every value or status mutation
    pub(crate) fn token(&self) -> ChangeToken {
        self.token.get()
    }

    /// Token bumped only when a value changes
    pub(crate) fn value_token(&self) -> ChangeToken {
        self.value_token.get()
    }

    /// Record a value mutation
    pub(crate) fn value_changed(&self) {
        let token = self.next_token();
        self.value_token.set(token);
        self.token.set(token);
        self.changed.set(true);
        self.updated.set(true);
        self.flush_if_idle();
    }

    /// Record an async status mutation (pending, failed)
    pub(crate) fn status_changed(&self) {
        let token = self.next_token();
        self.token.set(token);
        self.updated.set(true);
        self.flush_if_idle();
    }

    /// Invalidate memoized readers without notifying anybody
    pub(crate) fn touch(&self) {
        let token = self.next_token();
        self.token.set(token);
    }

    fn flush_if_idle(&self) {
        if !self.is_active() {
            self.flush();
        }
    }

    fn flush(&self) {
        // Mutations made by listeners are picked up by the running loop.
        if self.flushing.replace(true) {
            return;
        }
        let _guard = FlushGuard {
            flushing: &self.flushing,
        };
        loop {
            let changed = self.changed.replace(false);
            let updated = self.updated.replace(false);
            if !changed && !updated {
                break;
            }
            trace!(changed, updated, "batch flush");
            if changed {
                self.emitter.emit(&Event::Change);
            }
            if updated {
                self.emitter.emit(&Event::Update);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::Channel;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recording(batch: &Batch) -> (Rc<RefCell<Vec<Channel>>>, Vec<crate::emitter::Subscription>) {
        let log: Rc<RefCell<Vec<Channel>>> = Rc::default();
        let subscriptions = [Channel::Change, Channel::Update]
            .into_iter()
            .map(|channel| {
                let log = log.clone();
                batch
                    .emitter()
                    .on(channel, Rc::new(move |event: &Event| log.borrow_mut().push(event.channel())))
            })
            .collect();
        (log, subscriptions)
    }

    #[test]
    fn nested_batches_flush_once() {
        let batch = Batch::new(Emitter::new());
        let (log, _subscriptions) = recording(&batch);

        batch.run(|| {
            batch.value_changed();
            batch.run(|| {
                batch.value_changed();
                batch.status_changed();
            });
            assert!(log.borrow().is_empty());
        });

        assert_eq!(*log.borrow(), vec![Channel::Change, Channel::Update]);
    }

    #[test]
    fn status_change_only_emits_update() {
        let batch = Batch::new(Emitter::new());
        let (log, _subscriptions) = recording(&batch);

        let before = batch.value_token();
        batch.status_changed();

        assert_eq!(*log.borrow(), vec![Channel::Update]);
        assert_eq!(batch.value_token(), before);
    }

    #[test]
    fn touch_is_silent() {
        let batch = Batch::new(Emitter::new());
        let (log, _subscriptions) = recording(&batch);

        let before = batch.token();
        batch.touch();

        assert_ne!(batch.token(), before);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn batch_returns_value() {
        let batch = Batch::new(Emitter::new());
        assert_eq!(batch.run(|| 42), 42);
        assert!(!batch.is_active());
    }

    #[test]
    fn mutation_from_listener_is_flushed_after_current_pair() {
        let batch = Rc::new(Batch::new(Emitter::new()));
        let (log, _subscriptions) = recording(&batch);
        let fired = Rc::new(Cell::new(false));

        let inner = Rc::downgrade(&batch);
        let once = fired.clone();
        let _chain = batch.emitter().on(
            Channel::Change,
            Rc::new(move |_: &Event| {
                if !once.replace(true) {
                    if let Some(batch) = inner.upgrade() {
                        batch.value_changed();
                    }
                }
            }),
        );

        batch.value_changed();

        assert_eq!(
            *log.borrow(),
            vec![Channel::Change, Channel::Update, Channel::Change, Channel::Update]
        );
    }
}
