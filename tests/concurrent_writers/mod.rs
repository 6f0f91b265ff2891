use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use dstore::constants::READ_LIMIT;
use dstore::CallbackError;
use dstore::ChangeEvent;
use dstore::DatastoreKind;
use dstore::EditOptions;
use dstore::GetFlags;
use dstore::Phase;
use dstore::SubscribeOptions;

use crate::common::commit_item;
use crate::common::connect;
use crate::common::read;
use crate::common::TIMEOUT;

#[test]
fn concurrent_writers_from_many_connections_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let writers = 8;
    let barrier = Arc::new(Barrier::new(writers));

    let handles: Vec<_> = (0..writers)
        .map(|n| {
            let path = dir.path().to_path_buf();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let conn = connect(&path);
                let mut session = conn.session_start(DatastoreKind::Running).unwrap();
                session
                    .set_item(&format!("/car:cars/car[name='c{n}']/speed"), Some("1"), EditOptions::default())
                    .unwrap();
                barrier.wait();
                session.apply_changes(Duration::ZERO).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let view = read(&connect(dir.path()), DatastoreKind::Running, "/car:cars");
    for n in 0..writers {
        assert!(view.contains(&format!("/car:cars/car[name='c{n}']/speed")).unwrap());
    }
}

#[test]
fn readers_beyond_the_slot_limit_queue_up() {
    let dir = tempfile::tempdir().unwrap();
    let seed = connect(dir.path());
    commit_item(&seed, DatastoreKind::Running, "/car:cars/car[name='a']/color", Some("red"));

    let readers = READ_LIMIT * 3;
    let barrier = Arc::new(Barrier::new(readers));
    let conn = Arc::new(seed);
    let handles: Vec<_> = (0..readers)
        .map(|_| {
            let conn = conn.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let session = conn.session_start(DatastoreKind::Running).unwrap();
                barrier.wait();
                session
                    .get_data("/car:cars", 0, TIMEOUT, GetFlags::default())
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        let view = handle.join().unwrap();
        assert_eq!(view.value("/car:cars/car[name='a']/color").unwrap(), Some("red"));
    }
}

#[test]
fn subscriber_in_another_connection_vetoes_change() {
    let dir = tempfile::tempdir().unwrap();
    let guard = connect(dir.path());
    let writer = connect(dir.path());
    let aborted = Arc::new(AtomicUsize::new(0));

    let _limit = guard
        .session_start(DatastoreKind::Running)
        .unwrap()
        .subscribe_module_change(
            "car",
            Some("/car:cars"),
            SubscribeOptions::default().priority(1),
            |event: &ChangeEvent| {
                let too_fast = event.diff.changes().iter().any(|c| c.new_value.as_deref() == Some("300"));
                if too_fast && event.phase == Phase::Event {
                    return Err(CallbackError::Validation("speed limit".into()));
                }
                Ok(())
            },
        )
        .unwrap();
    let _audit = {
        let aborted = aborted.clone();
        guard
            .session_start(DatastoreKind::Running)
            .unwrap()
            .subscribe_module_change("car", None, SubscribeOptions::default().priority(9), move |event: &ChangeEvent| {
                if event.phase == Phase::Abort {
                    aborted.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            })
            .unwrap()
    };

    commit_item(&writer, DatastoreKind::Running, "/car:cars/car[name='a']/speed", Some("100"));

    let mut session = writer.session_start(DatastoreKind::Running).unwrap();
    session
        .set_item("/car:cars/car[name='a']/speed", Some("300"), EditOptions::default())
        .unwrap();
    let err = session.apply_changes(TIMEOUT).unwrap_err();

    assert!(err.is_validation());
    assert_eq!(aborted.load(Ordering::SeqCst), 1);
    let view = read(&writer, DatastoreKind::Running, "/car:cars");
    assert_eq!(view.value("/car:cars/car[name='a']/speed").unwrap(), Some("100"));
}
