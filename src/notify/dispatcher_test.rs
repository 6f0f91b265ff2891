use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use tracing_test::traced_test;

use super::*;
use crate::lock::HolderId;
use crate::subscription::Callback;
use crate::subscription::SubscribeOptions;
use crate::subscription::SubscriptionKind;
use crate::subscription::SubscriptionState;
use crate::test_utils::dead_pid;
use crate::test_utils::tree_of;
use crate::test_utils::ForeignProcess;
use crate::test_utils::StoreFixture;
use crate::tree::DataTree;
use crate::tree::Diff;
use crate::tree::XPath;
use crate::utils::time::Deadline;
use crate::CallbackError;
use crate::DatastoreKind;
use crate::Error;

type Log = Arc<Mutex<Vec<(u64, Phase, u64, usize)>>>;

const BUDGET: Duration = Duration::from_millis(500);

fn change_subscriber(
    fixture: &StoreFixture,
    xpath: &str,
    options: SubscribeOptions,
    log: &Log,
    reject: Option<CallbackError>,
) -> u64 {
    let log = log.clone();
    fixture.subscribe(
        xpath,
        SubscriptionKind::ModuleChange,
        DatastoreKind::Running,
        options,
        Callback::ModuleChange(Arc::new(move |event: &ChangeEvent| {
            log.lock()
                .push((event.subscription_id, event.phase, event.request_id, event.diff.len()));
            match (&reject, event.phase) {
                (Some(error), Phase::Event) => Err(error.clone()),
                _ => Ok(()),
            }
        })),
    )
}

/// Change subscriber that spends `delay` in the EVENT phase.
fn slow_subscriber(
    fixture: &StoreFixture,
    priority: u32,
    delay: Duration,
) -> u64 {
    fixture.subscribe(
        "/car:cars",
        SubscriptionKind::ModuleChange,
        DatastoreKind::Running,
        SubscribeOptions::default().priority(priority),
        Callback::ModuleChange(Arc::new(move |event: &ChangeEvent| {
            if event.phase == Phase::Event {
                std::thread::sleep(delay);
            }
            Ok(())
        })),
    )
}

fn car_diff() -> Diff {
    Diff::between(
        &DataTree::new(),
        &tree_of(&[
            ("/car:cars/car[name='a']/speed", Some("90")),
            ("/car:garage/open", Some("true")),
        ]),
    )
}

fn phases(
    log: &Log,
    id: u64,
) -> Vec<Phase> {
    log.lock()
        .iter()
        .filter(|(sub, ..)| *sub == id)
        .map(|(_, phase, ..)| *phase)
        .collect()
}

#[test]
#[traced_test]
fn test_event_commit_done_in_order() {
    let fixture = StoreFixture::new();
    let log: Log = Arc::default();
    let id = change_subscriber(&fixture, "/car:cars", SubscribeOptions::default(), &log, None);
    let commits = AtomicUsize::new(0);

    let result = fixture
        .dispatcher
        .run_commit(DatastoreKind::Running, &car_diff(), &Deadline::after(Some(BUDGET)), || {
            assert_eq!(phases(&log, id), vec![Phase::Event]);
            commits.fetch_add(1, Ordering::SeqCst);
            Ok("committed")
        })
        .unwrap();

    assert_eq!(result, "committed");
    assert_eq!(commits.load(Ordering::SeqCst), 1);
    assert_eq!(phases(&log, id), vec![Phase::Event, Phase::Done]);

    let entries = log.lock().clone();
    // same request id for both phases, diff restricted to the subscribed subtree
    assert_eq!(entries[0].2, entries[1].2);
    assert_eq!(entries[0].3, car_diff().filter(&XPath::parse("/car:cars").unwrap()).len());
}

#[test]
#[traced_test]
fn test_rejection_aborts_earlier_subscribers_and_skips_commit() {
    let fixture = StoreFixture::new();
    let log: Log = Arc::default();
    let first = change_subscriber(&fixture, "/car:*", SubscribeOptions::default().priority(10), &log, None);
    let second = change_subscriber(
        &fixture,
        "/car:*",
        SubscribeOptions::default().priority(5),
        &log,
        Some(CallbackError::Validation("speed limit".into())),
    );
    let third = change_subscriber(&fixture, "/car:*", SubscribeOptions::default().priority(1), &log, None);

    let err = fixture
        .dispatcher
        .run_commit(DatastoreKind::Running, &car_diff(), &Deadline::after(Some(BUDGET)), || -> crate::Result<()> {
            panic!("commit must not run after a rejection")
        })
        .unwrap_err();

    assert!(err.is_validation());
    assert_eq!(phases(&log, first), vec![Phase::Event, Phase::Abort]);
    assert_eq!(phases(&log, second), vec![Phase::Event]);
    assert!(phases(&log, third).is_empty());
}

#[test]
fn test_failed_commit_aborts_notified_subscribers() {
    let fixture = StoreFixture::new();
    let log: Log = Arc::default();
    let id = change_subscriber(&fixture, "/car:cars", SubscribeOptions::default(), &log, None);

    let err = fixture
        .dispatcher
        .run_commit(DatastoreKind::Running, &car_diff(), &Deadline::after(Some(BUDGET)), || -> crate::Result<()> {
            Err(Error::Fatal("disk full".into()))
        })
        .unwrap_err();

    assert!(matches!(err, Error::Fatal(_)));
    assert_eq!(phases(&log, id), vec![Phase::Event, Phase::Abort]);
}

#[test]
#[traced_test]
fn test_late_subscriber_times_out_the_change() {
    let fixture = StoreFixture::new();
    let id = fixture.subscribe(
        "/car:cars",
        SubscriptionKind::ModuleChange,
        DatastoreKind::Running,
        SubscribeOptions::default(),
        Callback::ModuleChange(Arc::new(|_: &ChangeEvent| {
            std::thread::sleep(Duration::from_millis(400));
            Ok(())
        })),
    );

    let err = fixture
        .dispatcher
        .run_commit(DatastoreKind::Running, &car_diff(), &Deadline::after(Some(Duration::from_millis(50))), || Ok(()))
        .unwrap_err();

    match err {
        Error::CallbackTimedOut { subscription_id, .. } => assert_eq!(subscription_id, id),
        other => panic!("unexpected error {other}"),
    }
    assert!(logs_contain("Change callback timed out"));
}

#[test]
fn test_call_deadline_bounds_the_whole_event_phase() {
    let fixture = StoreFixture::new();
    slow_subscriber(&fixture, 10, Duration::from_millis(300));
    let second = slow_subscriber(&fixture, 5, Duration::from_millis(300));

    let started = Instant::now();
    let err = fixture
        .dispatcher
        .run_commit(
            DatastoreKind::Running,
            &car_diff(),
            &Deadline::after(Some(Duration::from_millis(400))),
            || -> crate::Result<()> { panic!("commit must not run after a timeout") },
        )
        .unwrap_err();

    assert!(matches!(err, Error::CallbackTimedOut { subscription_id, .. } if subscription_id == second));
    assert!(started.elapsed() < Duration::from_millis(650), "took {:?}", started.elapsed());
}

#[test]
fn test_callback_budget_applies_under_a_generous_deadline() {
    let fixture = StoreFixture::new();
    let mut config = fixture.config.dispatch.clone();
    config.callback_timeout_ms = 100;
    let dispatcher = Dispatcher::new(
        fixture.namespace.clone(),
        fixture.main.clone(),
        fixture.tables.clone(),
        config,
        &fixture.config.lock,
    );
    let id = slow_subscriber(&fixture, 0, Duration::from_millis(800));

    let started = Instant::now();
    let err = dispatcher
        .run_commit(
            DatastoreKind::Running,
            &car_diff(),
            &Deadline::after(Some(Duration::from_secs(5))),
            || Ok(()),
        )
        .unwrap_err();

    match err {
        Error::CallbackTimedOut { subscription_id, budget } => {
            assert_eq!(subscription_id, id);
            assert_eq!(budget, Duration::from_millis(100));
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(started.elapsed() < Duration::from_millis(600));
}

#[test]
#[traced_test]
fn test_unreachable_change_subscriber_aborts_the_change() {
    let fixture = StoreFixture::new();
    let log: Log = Arc::default();
    let local = change_subscriber(&fixture, "/car:cars", SubscribeOptions::default().priority(10), &log, None);
    let other = ForeignProcess::spawn();
    let remote = fixture.register_foreign(
        "/car:cars",
        SubscriptionKind::ModuleChange,
        DatastoreKind::Running,
        SubscribeOptions::default().priority(1),
        other.pid(),
    );

    let err = fixture
        .dispatcher
        .run_commit(
            DatastoreKind::Running,
            &car_diff(),
            &Deadline::after(Some(BUDGET)),
            || -> crate::Result<()> { panic!("commit must not run with an unreachable subscriber") },
        )
        .unwrap_err();

    assert!(matches!(err, Error::Unreachable { subscription_id, .. } if subscription_id == remote));
    assert_eq!(phases(&log, local), vec![Phase::Event, Phase::Abort]);
    assert!(logs_contain("Change subscriber in another process cannot be reached"));
}

#[test]
fn test_unreachable_rpc_handler_fails_the_call() {
    let fixture = StoreFixture::new();
    let other = ForeignProcess::spawn();
    fixture.register_foreign(
        "/car:start",
        SubscriptionKind::Rpc,
        DatastoreKind::Running,
        SubscribeOptions::default(),
        other.pid(),
    );

    let err = fixture
        .dispatcher
        .send_rpc(&XPath::parse("/car:start").unwrap(), DataTree::new(), Duration::from_secs(1))
        .unwrap_err();

    assert!(matches!(err, Error::Unreachable { owner_pid, .. } if owner_pid == other.pid()));
}

#[test]
fn test_filters_by_datastore_xpath_state_and_done_only() {
    let fixture = StoreFixture::new();
    let log: Log = Arc::default();
    let elsewhere = change_subscriber(&fixture, "/car:parking", SubscribeOptions::default(), &log, None);
    let done_only = change_subscriber(&fixture, "/car:cars", SubscribeOptions::default().done_only(), &log, None);
    let suspended = change_subscriber(&fixture, "/car:cars", SubscribeOptions::default(), &log, None);
    fixture
        .tables
        .table("car")
        .unwrap()
        .set_state(
            suspended,
            SubscriptionState::Suspended,
            HolderId::for_session(1),
            Some(BUDGET),
        )
        .unwrap();
    let log_clone = log.clone();
    let startup = fixture.subscribe(
        "/car:cars",
        SubscriptionKind::ModuleChange,
        DatastoreKind::Startup,
        SubscribeOptions::default(),
        Callback::ModuleChange(Arc::new(move |event: &ChangeEvent| {
            log_clone.lock().push((event.subscription_id, event.phase, 0, 0));
            Ok(())
        })),
    );

    fixture
        .dispatcher
        .run_commit(DatastoreKind::Running, &car_diff(), &Deadline::after(Some(BUDGET)), || Ok(()))
        .unwrap();

    assert!(phases(&log, elsewhere).is_empty());
    assert_eq!(phases(&log, done_only), vec![Phase::Done]);
    assert!(phases(&log, suspended).is_empty());
    assert!(phases(&log, startup).is_empty());
}

#[test]
fn test_entries_of_dead_owners_are_purged() {
    let fixture = StoreFixture::new();
    let table = fixture.tables.table("car").unwrap();
    let mut orphan = fixture.entry(
        "/car:cars",
        SubscriptionKind::ModuleChange,
        DatastoreKind::Running,
        SubscribeOptions::default(),
    );
    orphan.owner_pid = dead_pid();
    table
        .register(orphan, HolderId::for_session(1), Some(BUDGET))
        .unwrap();

    fixture
        .dispatcher
        .notify(DatastoreKind::Running, &car_diff(), Phase::Event)
        .unwrap();

    assert!(table
        .entries(HolderId::for_session(1), Some(BUDGET))
        .unwrap()
        .is_empty());
}

#[test]
fn test_rpc_outputs_are_merged_in_priority_order() {
    let fixture = StoreFixture::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    for (priority, leaf) in [(1, "low"), (9, "high")] {
        let order = order.clone();
        fixture.subscribe(
            "/car:start",
            SubscriptionKind::Rpc,
            DatastoreKind::Running,
            SubscribeOptions::default().priority(priority),
            Callback::Rpc(Arc::new(move |request: &RpcRequest| {
                order.lock().push(leaf);
                assert!(request.input.contains("/car:start/name").unwrap());
                Ok(tree_of(&[(format!("/car:start/{leaf}").as_str(), Some("done"))]))
            })),
        );
    }

    let output = fixture
        .dispatcher
        .send_rpc(
            &XPath::parse("/car:start").unwrap(),
            tree_of(&[("/car:start/name", Some("a"))]),
            Duration::from_secs(1),
        )
        .unwrap();

    assert_eq!(*order.lock(), vec!["high", "low"]);
    assert!(output.contains("/car:start/high").unwrap());
    assert!(output.contains("/car:start/low").unwrap());
}

#[test]
fn test_rpc_without_handler_is_not_found() {
    let fixture = StoreFixture::new();

    let err = fixture
        .dispatcher
        .send_rpc(&XPath::parse("/car:stop").unwrap(), DataTree::new(), Duration::from_secs(1))
        .unwrap_err();

    assert!(err.is_not_found());
}

#[test]
fn test_notification_counts_accepting_subscribers() {
    let fixture = StoreFixture::new();
    let received = Arc::new(AtomicUsize::new(0));
    for fail in [false, true] {
        let received = received.clone();
        fixture.subscribe(
            "/car:alarm",
            SubscriptionKind::Notification,
            DatastoreKind::Running,
            SubscribeOptions::default(),
            Callback::Notification(Arc::new(move |event: &NotificationEvent| {
                received.fetch_add(1, Ordering::SeqCst);
                assert!(event.timestamp_ms > 0);
                if fail {
                    Err(CallbackError::Application("ignored".into()))
                } else {
                    Ok(())
                }
            })),
        );
    }

    let delivered = fixture
        .dispatcher
        .send_notification(
            &XPath::parse("/car:alarm").unwrap(),
            tree_of(&[("/car:alarm/level", Some("3"))]),
        )
        .unwrap();

    assert_eq!(delivered, 1);
    assert_eq!(received.load(Ordering::SeqCst), 2);
    assert_eq!(
        fixture
            .dispatcher
            .send_notification(&XPath::parse("/other:alarm").unwrap(), DataTree::new())
            .unwrap(),
        0
    );
}
