use std::thread;
use std::time::Duration;
use std::time::Instant;

use dstore::CallbackError;
use dstore::DataTree;
use dstore::DatastoreKind;
use dstore::EditOptions;
use dstore::OperGetRequest;
use dstore::SubscribeOptions;
use dstore::XPath;

use crate::common::commit_item;
use crate::common::config;
use crate::common::connect;
use crate::common::read;
use crate::common::TIMEOUT;

fn tree(leaves: &[(&str, &str)]) -> DataTree {
    let mut tree = DataTree::new();
    for (path, value) in leaves {
        let keys = XPath::parse(path).unwrap().to_keys().unwrap();
        tree.merge_path(&keys, Some(value.to_string()));
    }
    tree
}

#[test]
fn operational_view_is_union_of_config_pushed_and_pulled_state() {
    let dir = tempfile::tempdir().unwrap();
    let config_owner = connect(dir.path());
    let pusher = connect(dir.path());
    let provider = connect(dir.path());
    let reader = connect(dir.path());

    commit_item(&config_owner, DatastoreKind::Running, "/car:cars/car[name='a']/color", Some("red"));
    let _pushed = commit_item(&pusher, DatastoreKind::Operational, "/car:cars/car[name='a']/speed", Some("90"));
    let _sub = provider
        .session_start(DatastoreKind::Operational)
        .unwrap()
        .subscribe_oper_get(
            "car",
            "/car:cars/car[name='a']/engine",
            SubscribeOptions::default(),
            |request: &OperGetRequest| {
                assert_eq!(request.query.to_string(), "/car:cars");
                Ok(tree(&[("/car:cars/car[name='a']/engine/rpm", "3000")]))
            },
        )
        .unwrap();

    let view = read(&reader, DatastoreKind::Operational, "/car:cars");

    assert_eq!(
        view,
        tree(&[
            ("/car:cars/car[name='a']/color", "red"),
            ("/car:cars/car[name='a']/speed", "90"),
            ("/car:cars/car[name='a']/engine/rpm", "3000"),
        ])
    );
    // running itself only holds configuration
    assert!(!read(&reader, DatastoreKind::Running, "/car:cars")
        .contains("/car:cars/car[name='a']/speed")
        .unwrap());
}

#[test]
fn repeated_delete_create_rounds_leave_one_instance() {
    let dir = tempfile::tempdir().unwrap();
    let pusher = connect(dir.path());
    let reader = connect(dir.path());
    let mut session = pusher.session_start(DatastoreKind::Operational).unwrap();
    let instance = "/car:cars/car[name='a']/tags[.='fast']";

    for round in 0..20 {
        session.delete_item(instance, EditOptions::default()).unwrap();
        session.set_item(instance, None, EditOptions::default()).unwrap();
        session.apply_changes(TIMEOUT).unwrap();

        let view = read(&reader, DatastoreKind::Operational, "/car:cars");
        let tags = view
            .nodes()
            .into_iter()
            .filter(|(keys, _)| keys.last().is_some_and(|k| k.name == "tags"))
            .count();
        assert_eq!(tags, 1, "round {round}");
    }
}

#[test]
fn slow_provider_is_left_out_within_budget() {
    let dir = tempfile::tempdir().unwrap();
    let mut fast_config = config(dir.path());
    fast_config.oper.pull_timeout_ms = 100;
    let reader = dstore::Connection::connect(fast_config).unwrap();
    let provider = connect(dir.path());

    let providers = provider.session_start(DatastoreKind::Operational).unwrap();
    let _slow = providers
        .subscribe_oper_get("car", "/car:stats/slow", SubscribeOptions::default(), |_: &OperGetRequest| {
            thread::sleep(Duration::from_secs(2));
            Ok(tree(&[("/car:stats/slow", "late")]))
        })
        .unwrap();
    let _failing = providers
        .subscribe_oper_get("car", "/car:stats/broken", SubscribeOptions::default(), |_: &OperGetRequest| {
            Err(CallbackError::Application("sensor offline".into()))
        })
        .unwrap();
    let _fast = providers
        .subscribe_oper_get("car", "/car:stats/fast", SubscribeOptions::default(), |_: &OperGetRequest| {
            Ok(tree(&[("/car:stats/fast", "ok")]))
        })
        .unwrap();

    let started = Instant::now();
    let view = read(&reader, DatastoreKind::Operational, "/car:stats");

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(view, tree(&[("/car:stats/fast", "ok")]));
}

#[test]
fn pushed_state_disappears_with_its_session() {
    let dir = tempfile::tempdir().unwrap();
    let reader = connect(dir.path());
    let pusher = connect(dir.path());

    let session = commit_item(&pusher, DatastoreKind::Operational, "/car:stats/load", Some("7"));
    assert!(read(&reader, DatastoreKind::Operational, "/car:stats")
        .contains("/car:stats/load")
        .unwrap());

    drop(session);
    assert!(read(&reader, DatastoreKind::Operational, "/car:stats").is_empty());
}
