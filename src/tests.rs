/// End-to-end scenarios for stores, actions and routines
use crate::{
    Action, Computed, ComputedValue, Deferred, Derived, Effect, Event, Outcome, Resume, Status, Step, Store,
    StoreBuilder, StoreError, Value,
};
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::LocalSet;

fn int(value: &Value) -> i64 {
    value.as_i64().unwrap_or(0)
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

async fn sleep(millis: u64) {
    tokio::time::sleep(ms(millis)).await;
}

async fn local<F: Future>(future: F) -> F::Output {
    LocalSet::new().run_until(future).await
}

/// Count every event on `selector`
fn count_events(store: &Store, selector: &str) -> (Rc<Cell<usize>>, crate::Subscription) {
    let count = Rc::new(Cell::new(0));
    let counter = count.clone();
    let subscription = store.when(selector, move |_| counter.set(counter.get() + 1));
    (count, subscription)
}

fn counter() -> StoreBuilder {
    Store::builder()
        .state("count", json!(0))
        .action("increase", |cx, _| {
            cx.update("count", |count| json!(int(count) + 1))?;
            Ok(Outcome::Value(Value::Null))
        })
        .action("double", |_, payload| Ok(Outcome::Value(json!(int(&payload) * 2))))
        .action("increase_later", |_, _| {
            Ok(Outcome::routine_fn(|cx, input| {
                if input.is_start() {
                    return Ok(Step::Yield(cx.delay(ms(10))));
                }
                input.into_result()?;
                cx.update("count", |count| json!(int(count) + 1))?;
                Ok(Step::Done(Value::Null))
            }))
        })
}

#[test]
fn plain_action_finishes_during_dispatch() {
    let store = counter().build().unwrap();
    let (updates, _updates) = count_events(&store, "update");

    let task = store.dispatch("increase", Value::Null);

    assert!(task.is_done());
    assert!(!task.is_async());
    assert_eq!(task.result(), Some(Value::Null));
    assert_eq!(store.value("count").unwrap(), json!(1));
    assert_eq!(updates.get(), 1);
}

#[test]
fn dispatch_event_fires_before_the_body() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = seen.clone();
    let store = counter().build().unwrap();
    let _dispatches = store.when("*", move |event| {
        log.borrow_mut().push(event.to_value());
    });
    let log = seen.clone();
    let _changes = store.when("change", move |_| log.borrow_mut().push(json!("change")));

    store.dispatch("increase", json!(7));

    assert_eq!(
        *seen.borrow(),
        vec![json!({ "type": "increase", "payload": 7 }), json!("change")]
    );
}

#[test]
fn unbound_dispatch_only_emits_the_event() {
    let store = counter().build().unwrap();
    let (dispatches, _dispatches) = count_events(&store, "anything");

    let task = store.dispatch("anything", json!(1));

    assert!(task.is_done());
    assert_eq!(task.result(), Some(Value::Null));
    assert_eq!(dispatches.get(), 1);
}

#[test]
fn inline_action_runs_without_registration() {
    let store = counter().build().unwrap();
    let echo = Action::new("echo", |_, payload| Ok(Outcome::from(payload)));
    let task = store.dispatch(&echo, json!(3));
    assert_eq!(task.result(), Some(json!(3)));
}

#[test]
fn nested_dispatches_land_in_one_batch() {
    let store = Store::builder()
        .state("a", json!(0))
        .state("b", json!(0))
        .state("c", json!(0))
        .action("fill", |cx, _| {
            cx.set("a", json!(1))?;
            cx.set("b", json!(2))?;
            cx.dispatch("fill_c", Value::Null);
            Ok(Outcome::Value(Value::Null))
        })
        .action("fill_c", |cx, _| {
            cx.set("c", json!(3))?;
            Ok(Outcome::Value(Value::Null))
        })
        .build()
        .unwrap();
    let (changes, _changes) = count_events(&store, "change");
    let (updates, _updates) = count_events(&store, "update");

    store.dispatch("fill", Value::Null);

    assert_eq!(changes.get(), 1);
    assert_eq!(updates.get(), 1);
    assert_eq!(store.state().to_value(), json!({ "a": 1, "b": 2, "c": 3 }));
}

#[test]
fn explicit_batch_coalesces_direct_writes() {
    let store = counter().build().unwrap();
    let (updates, _updates) = count_events(&store, "update");

    store.batch(|| {
        store.get("count").unwrap().set(json!(1));
        store.get("count").unwrap().set(json!(2));
    });

    assert_eq!(updates.get(), 1);
}

#[test]
fn setting_an_equal_value_is_silent() {
    let store = counter().build().unwrap();
    let (updates, _updates) = count_events(&store, "update");
    store.get("count").unwrap().set(json!(0));
    assert_eq!(updates.get(), 0);
}

#[test]
fn calls_compose_synchronously() {
    cov_mark::check!(sync_effect_trampolined);
    let store = counter()
        .action("compose", |_, _| {
            let mut sum = 0;
            let mut step = 0;
            Ok(Outcome::routine_fn(move |cx, input| {
                sum += int(&input.into_result()?);
                step += 1;
                match step {
                    1 => Ok(Step::Yield(cx.call("double", json!(1)))),
                    2 => Ok(Step::Yield(cx.call("double", json!(2)))),
                    _ => Ok(Step::Done(json!(sum))),
                }
            }))
        })
        .build()
        .unwrap();

    let task = store.dispatch("compose", Value::Null);

    assert!(task.is_done());
    assert!(!task.is_async());
    assert_eq!(task.result(), Some(json!(6)));
}

#[test]
fn set_state_updates_declared_cells() {
    let store = counter().state("name", json!("a")).build().unwrap();
    let (updates, _updates) = count_events(&store, "update");

    let task = store.set_state(json!({ "count": 4, "name": "b", "ghost": 1 }));

    assert!(task.is_done());
    assert_eq!(updates.get(), 1);
    assert_eq!(store.state().to_value(), json!({ "count": 4, "name": "b" }));
}

#[test]
fn set_state_rejects_non_objects() {
    let store = counter().build().unwrap();
    let task = store.set_state(json!(3));
    assert!(matches!(task.error(), Some(StoreError::Failed(_))));
}

#[test]
fn snapshot_identity_follows_value_changes() {
    let store = counter().build().unwrap();
    let before = store.state();

    store.set_state(json!({ "count": 0 }));
    assert!(before.ptr_eq(&store.state()));

    store.dispatch("increase", Value::Null);
    let after = store.state();
    assert!(!before.ptr_eq(&after));
    assert_eq!(after.get("count"), Some(&json!(1)));
}

#[test]
fn computed_combines_dependencies() {
    let store = Store::builder()
        .state("user", json!({ "first": "Ada", "last": "Lovelace", "tags": ["a", "b"] }))
        .computed(
            "full_name",
            Computed::new(["user.first", "user.last"], |args| {
                json!(format!("{} {}", args[0].as_str().unwrap_or(""), args[1].as_str().unwrap_or("")))
            }),
        )
        .computed("tag_count", Computed::alias("user.tags.len()"))
        .build()
        .unwrap();

    assert_eq!(store.value("full_name").unwrap(), json!("Ada Lovelace"));
    assert_eq!(store.value("tag_count").unwrap(), json!(2));

    store.get("user").unwrap().update(|user| {
        let mut user = user.clone();
        user["first"] = json!("Grace");
        user
    });
    assert_eq!(store.value("full_name").unwrap(), json!("Grace Lovelace"));
}

#[test]
fn private_computed_is_only_a_dependency() {
    let store = Store::builder()
        .state("count", json!(3))
        .computed("_squared", Computed::new(["count"], |args| json!(int(&args[0]) * int(&args[0]))))
        .computed("label", Computed::new(["_squared"], |args| json!(format!("{}!", args[0]))))
        .build()
        .unwrap();

    assert!(matches!(store.computed("_squared"), Err(StoreError::PrivateProperty(_))));
    assert!(matches!(store.value("_squared"), Err(StoreError::PrivateProperty(_))));
    assert_eq!(store.value("label").unwrap(), json!("9!"));
}

#[test]
fn equal_results_keep_their_identity() {
    let runs = Rc::new(Cell::new(0));
    let counted = runs.clone();
    let store = counter()
        .state("unrelated", json!(0))
        .computed(
            "positive",
            Computed::new(["count"], move |args| {
                counted.set(counted.get() + 1);
                json!(int(&args[0]) > 0)
            }),
        )
        .build()
        .unwrap();

    store.dispatch("increase", Value::Null);
    let first = store.computed("positive").unwrap();
    store.dispatch("increase", Value::Null);
    let second = store.computed("positive").unwrap();

    let (ComputedValue::Ready(first), ComputedValue::Ready(second)) = (first, second) else {
        panic!("expected synchronous values");
    };
    assert!(Rc::ptr_eq(&first, &second));
    assert_eq!(runs.get(), 2);

    store.get("unrelated").unwrap().set(json!(1));
    store.computed("positive").unwrap();
    assert_eq!(runs.get(), 2);
}

#[test]
fn from_state_rederives_on_snapshot_change() {
    let store = counter()
        .computed(
            "summary",
            Computed::from_state(|state| json!(format!("count={}", state.get("count").map_or(0, int)))),
        )
        .build()
        .unwrap();

    assert_eq!(store.value("summary").unwrap(), json!("count=0"));
    store.dispatch("increase", Value::Null);
    assert_eq!(store.value("summary").unwrap(), json!("count=1"));
}

#[test]
fn cyclic_computed_values_fail() {
    let store = Store::builder()
        .computed("a", Computed::alias("b"))
        .computed("b", Computed::alias("a"))
        .build()
        .unwrap();

    let error = store.value("a").unwrap_err();
    let mut cause = &error;
    while let StoreError::Dependency { source, .. } = cause {
        cause = &**source;
    }
    assert!(matches!(cause, StoreError::CyclicDependency(_)));
}

#[test]
fn effect_yielded_after_self_cancel_never_starts() {
    let store = counter()
        .action("quit_then_increase", |_, _| {
            Ok(Outcome::routine_fn(|cx, input| {
                if input.is_start() {
                    cx.task().cancel();
                    return Ok(Step::Yield(cx.call("increase", Value::Null)));
                }
                Ok(Step::Done(Value::Null))
            }))
        })
        .build()
        .unwrap();
    let (dispatches, _dispatches) = count_events(&store, "dispatch");

    let task = store.dispatch("quit_then_increase", Value::Null);

    assert!(task.is_cancelled());
    assert_eq!(dispatches.get(), 1);
    assert_eq!(store.value("count").unwrap(), json!(0));
}

#[test]
fn failed_action_is_reported_on_the_error_channel() {
    let errors = Rc::new(RefCell::new(Vec::new()));
    let log = errors.clone();
    let store = Store::builder()
        .action("explode", |_, _| Err(StoreError::msg("boom")))
        .build()
        .unwrap();
    let _errors = store.when("error", move |event| {
        if let Event::Error(error) = event {
            log.borrow_mut().push(error.to_string());
        }
    });

    let task = store.dispatch("explode", Value::Null);

    assert!(task.is_done());
    assert_eq!(task.error().map(|e| e.to_string()).as_deref(), Some("boom"));
    assert_eq!(*errors.borrow(), ["boom"]);
}

#[test]
fn routine_catches_injected_failure() {
    let store = Store::builder()
        .action("explode", |_, _| Err(StoreError::msg("boom")))
        .action("careful", |_, _| {
            Ok(Outcome::routine_fn(|cx, input| match input {
                Resume::Start => Ok(Step::Yield(cx.call("explode", Value::Null))),
                Resume::Error(error) => Ok(Step::Done(json!(format!("recovered from {error}")))),
                Resume::Value(_) => Ok(Step::Done(Value::Null)),
            }))
        })
        .build()
        .unwrap();
    let (errors, _errors) = count_events(&store, "error");

    let task = store.dispatch("careful", Value::Null);

    assert_eq!(task.result(), Some(json!("recovered from boom")));
    assert_eq!(errors.get(), 0);
}

#[test]
fn uncaught_failure_fails_the_routine() {
    let store = Store::builder()
        .action("explode", |_, _| Err(StoreError::msg("boom")))
        .action("careless", |_, _| {
            Ok(Outcome::routine_fn(|cx, input| {
                if input.is_start() {
                    return Ok(Step::Yield(cx.call("explode", Value::Null)));
                }
                input.into_result()?;
                Ok(Step::Done(json!("unreachable")))
            }))
        })
        .build()
        .unwrap();
    let (errors, _errors) = count_events(&store, "error");

    let task = store.dispatch("careless", Value::Null);

    assert!(task.is_done());
    assert!(task.result().is_none());
    assert_eq!(task.error().map(|e| e.to_string()).as_deref(), Some("boom"));
    assert_eq!(errors.get(), 1);
}

#[test]
fn empty_race_is_an_invalid_suspension() {
    let store = Store::builder()
        .action("nothing", |_, _| {
            Ok(Outcome::routine_fn(|_, _| {
                Ok(Step::Yield(Effect::race(Vec::<(String, Effect)>::new())))
            }))
        })
        .action("nobody", |_, _| Ok(Outcome::routine_fn(|_, _| Ok(Step::Yield(Effect::all(Vec::<Effect>::new()))))))
        .build()
        .unwrap();

    for action in ["nothing", "nobody"] {
        let task = store.dispatch(action, Value::Null);
        assert!(matches!(task.error(), Some(StoreError::InvalidSuspension(_))));
    }
}

#[test]
fn watch_reports_current_and_previous() {
    let store = counter().build().unwrap();
    let changes = Rc::new(RefCell::new(Vec::new()));
    let log = changes.clone();
    let _watch = store
        .watch("count", move |change| log.borrow_mut().push(change.to_value()))
        .unwrap();

    store.dispatch("increase", Value::Null);
    store.set_state(json!({ "count": 1 }));
    store.dispatch("increase", Value::Null);

    assert_eq!(
        *changes.borrow(),
        vec![
            json!({ "current": 1, "previous": 0 }),
            json!({ "current": 2, "previous": 1 }),
        ]
    );
}

#[test]
fn watch_many_paths_and_functions() {
    let store = Store::builder()
        .state("a", json!(1))
        .state("b", json!(2))
        .build()
        .unwrap();
    let paths = Rc::new(RefCell::new(Vec::new()));
    let log = paths.clone();
    let _paths = store
        .watch(["a", "b"], move |change| log.borrow_mut().push(change.current.clone()))
        .unwrap();
    let sums = Rc::new(RefCell::new(Vec::new()));
    let log = sums.clone();
    let _sum = store
        .watch(
            crate::WatchSelector::func(|store| {
                json!(int(&store.value("a").unwrap_or_default()) + int(&store.value("b").unwrap_or_default()))
            }),
            move |change| log.borrow_mut().push(change.current.clone()),
        )
        .unwrap();

    store.set_state(json!({ "a": 2, "b": 1 }));
    store.get("b").unwrap().set(json!(5));

    assert_eq!(*paths.borrow(), vec![json!({ "a": 2, "b": 1 }), json!({ "a": 2, "b": 5 })]);
    assert_eq!(*sums.borrow(), vec![json!(7)]);
}

#[test]
fn builder_watcher_dispatches_follow_up_actions() {
    let store = Store::builder()
        .state("query", json!(""))
        .state("results", json!([]))
        .action("search", |cx, payload| {
            let query = payload.as_str().unwrap_or_default().to_owned();
            cx.set("results", json!([format!("{query}-1"), format!("{query}-2")]))?;
            Ok(Outcome::Value(Value::Null))
        })
        .watch("query", |store, change| {
            store.dispatch("search", change.current.clone());
        })
        .build()
        .unwrap();
    let (updates, _updates) = count_events(&store, "update");

    store.set_state(json!({ "query": "rust" }));

    assert_eq!(store.value("results").unwrap(), json!(["rust-1", "rust-2"]));
    assert_eq!(updates.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn delayed_action_is_async() {
    local(async {
        let store = counter().build().unwrap();

        let task = store.dispatch("increase_later", Value::Null);
        assert!(task.is_async());
        assert!(task.is_running());
        assert_eq!(store.value("count").unwrap(), json!(0));

        sleep(15).await;
        assert_eq!(store.value("count").unwrap(), json!(1));
        assert!(task.is_done());
        assert_eq!(task.await.unwrap(), Value::Null);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn cancelled_delay_never_resumes() {
    local(async {
        let store = counter().build().unwrap();

        let task = store.dispatch("increase_later", Value::Null);
        task.cancel();
        task.cancel();

        sleep(15).await;
        assert_eq!(store.value("count").unwrap(), json!(0));
        assert!(task.is_cancelled());
        assert!(!task.is_done());
        assert!(task.error().is_some_and(|error| error.is_cancelled()));
        assert!(matches!(task.await, Err(StoreError::Cancelled)));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn future_outcome_finishes_the_task() {
    local(async {
        let store = Store::builder()
            .action("fetch", |_, payload| {
                Ok(Outcome::Future(Deferred::new(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(json!({ "id": payload }))
                })))
            })
            .build()
            .unwrap();

        let task = store.dispatch("fetch", json!(4));
        assert!(task.is_async());
        assert_eq!(task.clone().await.unwrap(), json!({ "id": 4 }));
        assert_eq!(task.result(), Some(json!({ "id": 4 })));
    })
    .await;
}

fn searcher() -> StoreBuilder {
    Store::builder()
        .state("results", json!(null))
        .action("search", |_, payload| {
            Ok(Outcome::routine_fn(move |cx, input| {
                if input.is_start() {
                    return Ok(Step::Yield(cx.debounce(ms(10))));
                }
                input.into_result()?;
                cx.set("results", payload.clone())?;
                Ok(Step::Done(payload.clone()))
            }))
        })
}

#[tokio::test(start_paused = true)]
async fn debounced_action_keeps_only_the_latest() {
    local(async {
        let store = searcher().build().unwrap();

        let first = store.dispatch("search", json!("r"));
        let second = store.dispatch("search", json!("ru"));
        let third = store.dispatch("search", json!("rust"));

        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert!(third.is_running());

        sleep(15).await;
        assert_eq!(store.value("results").unwrap(), json!("rust"));
        assert_eq!(third.result(), Some(json!("rust")));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn finished_invocations_are_not_cancelled_by_latest() {
    local(async {
        let store = searcher().build().unwrap();

        let first = store.dispatch("search", json!("a"));
        sleep(15).await;
        let second = store.dispatch("search", json!("b"));

        assert!(first.is_done());
        assert!(!first.is_cancelled());
        assert!(second.is_running());
    })
    .await;
}

fn guarded() -> StoreBuilder {
    counter().action("guarded", |_, _| {
        Ok(Outcome::routine_fn(|cx, input| {
            if input.is_start() {
                return Ok(Step::Yield(Effect::race([
                    ("cancel", cx.when("cancel")),
                    ("done", cx.call("increase_later", Value::Null)),
                ])));
            }
            Ok(Step::Done(input.into_result()?))
        }))
    })
}

#[tokio::test(start_paused = true)]
async fn race_cancels_the_losers() {
    cov_mark::check!(race_loser_cancelled);
    local(async {
        let store = guarded().build().unwrap();

        let task = store.dispatch("guarded", Value::Null);
        store.dispatch("cancel", json!("now"));

        assert_eq!(
            task.result(),
            Some(json!({ "cancel": { "type": "cancel", "payload": "now" } }))
        );
        sleep(15).await;
        assert_eq!(store.value("count").unwrap(), json!(0));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn race_resumes_with_the_winner() {
    local(async {
        let store = guarded().build().unwrap();

        let task = store.dispatch("guarded", Value::Null);
        sleep(15).await;

        assert_eq!(store.value("count").unwrap(), json!(1));
        assert_eq!(task.result(), Some(json!({ "done": null })));

        // the event wait was released with the race
        store.dispatch("cancel", Value::Null);
        assert_eq!(task.result(), Some(json!({ "done": null })));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn all_collects_results_in_order() {
    local(async {
        let store = counter()
            .action("both", |_, _| {
                Ok(Outcome::routine_fn(|cx, input| {
                    if input.is_start() {
                        return Ok(Step::Yield(Effect::all([
                            cx.delay(ms(5)),
                            cx.call("double", json!(2)),
                            cx.wait(Deferred::resolved(json!("ready"))),
                        ])));
                    }
                    Ok(Step::Done(input.into_result()?))
                }))
            })
            .build()
            .unwrap();

        let task = store.dispatch("both", Value::Null);
        assert!(task.is_async());
        assert_eq!(task.await.unwrap(), json!([null, 4, "ready"]));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn failing_entry_fails_all() {
    local(async {
        let store = counter()
            .action("both", |_, _| {
                Ok(Outcome::routine_fn(|cx, input| {
                    if input.is_start() {
                        return Ok(Step::Yield(Effect::all([
                            cx.call("increase_later", Value::Null),
                            cx.wait(Deferred::new(async {
                                tokio::time::sleep(Duration::from_millis(5)).await;
                                Err(StoreError::msg("offline"))
                            })),
                        ])));
                    }
                    Ok(Step::Done(input.into_result()?))
                }))
            })
            .build()
            .unwrap();

        let task = store.dispatch("both", Value::Null);
        sleep(15).await;

        assert_eq!(task.error().map(|e| e.to_string()).as_deref(), Some("offline"));
        assert_eq!(store.value("count").unwrap(), json!(0));
    })
    .await;
}

fn ticking() -> StoreBuilder {
    counter()
        .action("ticker", |_, _| {
            Ok(Outcome::routine_fn(|cx, input| {
                if !input.is_start() {
                    input.into_result()?;
                    cx.update("count", |count| json!(int(count) + 1))?;
                }
                Ok(Step::Yield(cx.delay(ms(10))))
            }))
        })
        .action("supervisor", |_, _| {
            let mut step = 0;
            Ok(Outcome::routine_fn(move |cx, input| {
                input.into_result()?;
                step += 1;
                match step {
                    1 => Ok(Step::Yield(cx.fork("ticker", Value::Null))),
                    2 => Ok(Step::Yield(cx.delay(Duration::from_secs(1)))),
                    _ => Ok(Step::Done(Value::Null)),
                }
            }))
        })
        .action("spawner", |cx, _| {
            cx.dispatch("ticker", Value::Null);
            Ok(Outcome::Value(Value::Null))
        })
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_parent_cancels_forked_children() {
    local(async {
        let store = ticking().build().unwrap();

        let task = store.dispatch("supervisor", Value::Null);
        sleep(25).await;
        assert_eq!(store.value("count").unwrap(), json!(2));

        task.cancel();
        sleep(50).await;
        assert_eq!(store.value("count").unwrap(), json!(2));
        assert!(task.is_cancelled());
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_finished_parent_still_reaches_children() {
    local(async {
        let store = ticking().build().unwrap();

        let task = store.dispatch("spawner", Value::Null);
        assert!(task.is_done());
        sleep(15).await;
        assert_eq!(store.value("count").unwrap(), json!(1));

        task.cancel();
        sleep(50).await;
        assert_eq!(store.value("count").unwrap(), json!(1));
        assert!(task.is_done());
        assert!(!task.is_cancelled());
    })
    .await;
}

fn ping_counter(cell: &'static str) -> impl Fn(&crate::ActionContext, Value) -> crate::Result<Outcome> {
    move |_, _| {
        Ok(Outcome::routine_fn(move |cx, input| {
            if !input.is_start() {
                input.into_result()?;
                cx.update(cell, |hits| json!(int(hits) + 1))?;
            }
            Ok(Step::Yield(cx.when("ping")))
        }))
    }
}

#[test]
fn cancelling_a_parent_stops_forked_event_loops() {
    let store = Store::builder()
        .state("a", json!(0))
        .state("b", json!(0))
        .action("loop_a", ping_counter("a"))
        .action("loop_b", ping_counter("b"))
        .action("parent", |_, _| {
            Ok(Outcome::routine_fn(|cx, input| match input {
                Resume::Start => Ok(Step::Yield(Effect::all([
                    cx.fork("loop_a", Value::Null),
                    cx.fork("loop_b", Value::Null),
                ]))),
                Resume::Value(Value::Array(_)) => Ok(Step::Yield(cx.when("stop"))),
                other => Ok(Step::Done(other.into_result()?)),
            }))
        })
        .build()
        .unwrap();

    let parent = store.dispatch("parent", Value::Null);
    store.dispatch("ping", Value::Null);
    assert_eq!(store.state().to_value(), json!({ "a": 1, "b": 1 }));

    parent.cancel();
    store.dispatch("ping", Value::Null);
    store.dispatch("ping", Value::Null);

    assert!(parent.is_cancelled());
    assert_eq!(store.state().to_value(), json!({ "a": 1, "b": 1 }));
}

#[tokio::test(start_paused = true)]
async fn routine_waits_for_a_value_change() {
    local(async {
        let store = counter()
            .action("await_increase", |_, _| {
                Ok(Outcome::routine_fn(|cx, input| {
                    if input.is_start() {
                        return Ok(Step::Yield(cx.watch("count")));
                    }
                    Ok(Step::Done(input.into_result()?))
                }))
            })
            .build()
            .unwrap();

        let task = store.dispatch("await_increase", Value::Null);
        assert!(task.is_running());

        store.dispatch("increase_later", Value::Null);
        sleep(15).await;

        assert_eq!(task.result(), Some(json!({ "current": 1, "previous": 0 })));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn mutating_with_the_same_future_is_a_no_op() {
    cov_mark::check!(cell_same_future_ignored);
    local(async {
        let store = counter().build().unwrap();
        let (updates, _updates) = count_events(&store, "update");
        let cell = store.get("count").unwrap();
        let load = Deferred::new(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(json!(9))
        });

        cell.mutate(load.clone());
        cell.mutate(load.clone());
        assert_eq!(cell.status(), Status::Pending);
        assert_eq!(updates.get(), 1);

        sleep(10).await;
        assert_eq!(cell.status(), Status::Settled);
        assert_eq!(cell.value(), json!(9));
        assert_eq!(updates.get(), 2);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn superseded_future_is_discarded() {
    cov_mark::check!(stale_future_discarded);
    local(async {
        let store = counter().build().unwrap();
        let cell = store.get("count").unwrap();

        cell.mutate(Deferred::new(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(json!("slow"))
        }));
        cell.mutate(Deferred::new(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(json!("fast"))
        }));

        sleep(30).await;
        assert_eq!(cell.value(), json!("fast"));
        assert_eq!(cell.status(), Status::Settled);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn failed_mutation_keeps_the_last_value() {
    local(async {
        let store = counter().build().unwrap();
        let (errors, _errors) = count_events(&store, "error");
        let cell = store.get("count").unwrap();

        cell.mutate(Deferred::new(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(StoreError::msg("denied"))
        }));
        sleep(10).await;

        let loadable = cell.loadable();
        assert_eq!(loadable.status, Status::Failed);
        assert_eq!(loadable.value, json!(0));
        assert_eq!(errors.get(), 1);
        assert!(store.settled("count").await.is_err());
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn mutate_all_spreads_one_result() {
    local(async {
        let store = Store::builder()
            .state("user", json!(null))
            .state("posts", json!([]))
            .state("draft", json!("keep"))
            .action("load", |cx, _| {
                cx.mutate_all(
                    &["user", "posts", "draft"],
                    Deferred::new(async {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(json!({ "user": "ada", "posts": [1, 2] }))
                    }),
                )?;
                Ok(Outcome::Value(Value::Null))
            })
            .build()
            .unwrap();
        let (updates, _updates) = count_events(&store, "update");

        store.dispatch("load", Value::Null);
        assert!(store.loadable("user").unwrap().is_pending());
        assert!(store.loadable("posts").unwrap().is_pending());

        sleep(10).await;
        assert_eq!(
            store.state().to_value(),
            json!({ "user": "ada", "posts": [1, 2], "draft": "keep" })
        );
        assert_eq!(updates.get(), 2);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn async_computed_is_debounced() {
    local(async {
        let runs = Rc::new(Cell::new(0));
        let counted = runs.clone();
        let store = counter()
            .state("count", json!(1))
            .computed(
                "doubled",
                Computed::derive(["count"], move |args| {
                    counted.set(counted.get() + 1);
                    let count = int(&args[0]);
                    Derived::future(move |cx| async move {
                        cx.debounce(Duration::from_millis(10)).await?;
                        Ok(json!(count * 2))
                    })
                }),
            )
            .build()
            .unwrap();

        let first = store.computed("doubled").unwrap();
        assert!(first.is_loading());
        assert!(matches!(store.value("doubled"), Err(StoreError::Pending(_))));

        for _ in 0..4 {
            store.dispatch("increase", Value::Null);
        }
        assert_eq!(store.settled("doubled").await.unwrap(), json!(10));

        assert_eq!(runs.get(), 2);
        let superseded = first.deferred().and_then(Deferred::peek);
        assert!(matches!(superseded, Some(Err(StoreError::Cancelled))));
        assert_eq!(store.value("doubled").unwrap(), json!(10));
        assert_eq!(store.loadable("doubled").unwrap().status, Status::Settled);
    })
    .await;
}

fn parity(cached: bool) -> Computed {
    Computed::derive(["count"], move |args| {
        let value = json!({ "even": int(&args[0]) % 2 == 0 });
        Derived::future(move |cx| async move {
            sleep(1).await;
            Ok(if cached { cx.cache(value) } else { value })
        })
    })
}

async fn settled_rc(store: &Store, name: &str) -> Rc<Value> {
    store.settled(name).await.unwrap();
    match store.computed(name).unwrap() {
        ComputedValue::Ready(value) => value,
        other => panic!("expected a settled value, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn cached_async_results_keep_their_identity() {
    local(async {
        let store = counter()
            .computed("parity", parity(true))
            .computed("fresh_parity", parity(false))
            .build()
            .unwrap();
        let first = settled_rc(&store, "parity").await;
        let fresh = settled_rc(&store, "fresh_parity").await;

        store.dispatch("increase", Value::Null);
        store.dispatch("increase", Value::Null);
        let second = settled_rc(&store, "parity").await;
        assert_eq!(*second, json!({ "even": true }));
        assert!(Rc::ptr_eq(&first, &second));
        let refreshed = settled_rc(&store, "fresh_parity").await;
        assert_eq!(fresh, refreshed);
        assert!(!Rc::ptr_eq(&fresh, &refreshed));

        store.dispatch("increase", Value::Null);
        let odd = settled_rc(&store, "parity").await;
        assert_eq!(*odd, json!({ "even": false }));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn pending_dependency_suspends_the_computed() {
    local(async {
        let store = counter()
            .computed("label", Computed::new(["count"], |args| json!(format!("#{}", args[0]))))
            .build()
            .unwrap();

        store.get("count").unwrap().mutate(Deferred::new(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(json!(3))
        }));

        assert!(matches!(store.computed("label").unwrap(), ComputedValue::Suspended(_)));
        assert_eq!(store.settled("label").await.unwrap(), json!("#3"));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn async_init_reports_loading_then_ready() {
    local(async {
        let store = counter()
            .state("booted", json!(false))
            .action("boot", |_, _| {
                Ok(Outcome::routine_fn(|cx, input| {
                    if input.is_start() {
                        return Ok(Step::Yield(cx.delay(ms(10))));
                    }
                    cx.set("booted", json!(true))?;
                    Ok(Step::Done(Value::Null))
                }))
            })
            .init("boot")
            .build()
            .unwrap();

        assert!(store.loading());
        let ready = store.when_next("ready").await;

        assert!(matches!(ready, Some(Event::Ready)));
        assert!(!store.loading());
        assert!(store.init_error().is_none());
        assert_eq!(store.value("booted").unwrap(), json!(true));
    })
    .await;
}

#[test]
fn failed_sync_init_is_recorded() {
    let store = Store::builder()
        .action("boot", |_, _| Err(StoreError::msg("no config")))
        .init("boot")
        .build()
        .unwrap();

    assert!(!store.loading());
    assert_eq!(store.init_error().map(|e| e.to_string()).as_deref(), Some("no config"));
}

#[tokio::test(start_paused = true)]
async fn when_next_resolves_with_the_next_dispatch() {
    local(async {
        let store = counter().build().unwrap();
        let next = store.when_next(["increase", "double"]);

        store.dispatch("double", json!(1));

        let Some(Event::Dispatch { action, payload }) = next.await else {
            panic!("expected a dispatch");
        };
        assert_eq!(&*action, "double");
        assert_eq!(payload, json!(1));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn watch_next_resolves_with_the_next_change() {
    local(async {
        let store = counter().build().unwrap();
        let next = store.watch_next("count").unwrap();

        store.dispatch("increase_later", Value::Null);
        let change = next.await.unwrap();

        assert_eq!(change.current, json!(1));
        assert_eq!(change.previous, json!(0));
    })
    .await;
}
