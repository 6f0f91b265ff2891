use super::*;
use crate::test_utils::dead_pid;
use crate::tree::DataTree;
use crate::tree::XPath;
use crate::utils::process::current_pid;

fn edit(
    operation: EditOperation,
    path: &str,
    value: Option<&str>,
) -> OperEdit {
    OperEdit::new(operation, &XPath::parse(path).unwrap(), value.map(str::to_string))
}

fn origin(session_id: u64) -> EditOrigin {
    EditOrigin {
        pid: current_pid(),
        connection_id: 1,
        session_id,
    }
}

fn running() -> DataTree {
    let mut tree = DataTree::new();
    edit(EditOperation::Merge, "/m:cars/car[id='1']/color", Some("red"))
        .apply(&mut tree)
        .unwrap();
    tree
}

#[test]
fn test_remove_drops_covered_edits() {
    let mut layer = EditLayer::new(origin(1), 1);
    layer
        .push(edit(EditOperation::Merge, "/m:cars/car[id='1']/speed", Some("10")))
        .unwrap();
    layer
        .push(edit(EditOperation::Merge, "/m:other/leaf", Some("x")))
        .unwrap();
    layer
        .push(edit(EditOperation::Remove, "/m:cars/car[id='1']", None))
        .unwrap();

    let paths: Vec<&str> = layer.edits().iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["/m:other/leaf", "/m:cars/car[id='1']"]);
}

#[test]
fn test_merge_replaces_earlier_value_at_same_path() {
    let mut layer = EditLayer::new(origin(1), 1);
    layer
        .push(edit(EditOperation::Merge, "/m:state/load", Some("1")))
        .unwrap();
    layer
        .push(edit(EditOperation::Merge, "/m:state/load", Some("2")))
        .unwrap();

    assert_eq!(layer.edits().len(), 1);
    assert_eq!(layer.edits()[0].value.as_deref(), Some("2"));
}

#[test]
fn test_create_is_skipped_when_already_set() {
    let mut layer = EditLayer::new(origin(1), 1);
    layer
        .push(edit(EditOperation::Merge, "/m:state/load", Some("1")))
        .unwrap();
    layer
        .push(edit(EditOperation::Create, "/m:state/load", Some("2")))
        .unwrap();

    assert_eq!(layer.edits().len(), 1);
    assert_eq!(layer.edits()[0].value.as_deref(), Some("1"));
}

#[test]
fn test_delete_create_rounds_keep_layer_bounded() {
    let mut layer = EditLayer::new(origin(1), 1);
    let instance = "/m:cars/car[id='1']/tags[.='fast']";

    for _ in 0..50 {
        layer.push(edit(EditOperation::Remove, instance, None)).unwrap();
        layer.push(edit(EditOperation::Create, instance, None)).unwrap();
    }

    assert_eq!(layer.edits().len(), 2);
    let mut tree = DataTree::new();
    layer.apply_to(&mut tree, &XPath::root()).unwrap();
    let tags: Vec<_> = tree
        .nodes()
        .into_iter()
        .filter(|(keys, _)| keys.last().map(|k| k.name.as_str()) == Some("tags"))
        .collect();
    assert_eq!(tags.len(), 1);
}

#[test]
fn test_remove_hides_running_data() {
    let mut state = OperState::default();
    state
        .layer_mut(origin(1))
        .push(edit(EditOperation::Remove, "/m:cars/car[id='1']/color", None))
        .unwrap();

    let mut tree = running();
    state.apply(&mut tree, &XPath::root()).unwrap();

    assert!(!tree.contains("/m:cars/car[id='1']/color").unwrap());
    assert!(tree.contains("/m:cars/car[id='1']").unwrap());
}

#[test]
fn test_later_layers_win() {
    let mut state = OperState::default();
    state
        .layer_mut(origin(7))
        .push(edit(EditOperation::Merge, "/m:state/load", Some("first")))
        .unwrap();
    state
        .layer_mut(origin(3))
        .push(edit(EditOperation::Merge, "/m:state/load", Some("second")))
        .unwrap();

    let sequences: Vec<u64> = state.layers().iter().map(|l| l.origin.session_id).collect();
    assert_eq!(sequences, vec![7, 3]);

    let mut tree = DataTree::new();
    state.apply(&mut tree, &XPath::root()).unwrap();
    assert_eq!(tree.value("/m:state/load").unwrap(), Some("second"));
}

#[test]
fn test_apply_skips_edits_outside_query() {
    let mut state = OperState::default();
    let layer = state.layer_mut(origin(1));
    layer
        .push(edit(EditOperation::Merge, "/m:state/load", Some("1")))
        .unwrap();
    layer
        .push(edit(EditOperation::Merge, "/n:other/leaf", Some("2")))
        .unwrap();

    let mut tree = DataTree::new();
    state
        .apply(&mut tree, &XPath::parse("/m:state").unwrap())
        .unwrap();

    assert!(tree.contains("/m:state/load").unwrap());
    assert!(!tree.contains("/n:other/leaf").unwrap());
}

#[test]
fn test_remove_connection_and_layer() {
    let mut state = OperState::default();
    state.layer_mut(origin(1));
    state.layer_mut(origin(2));
    state.layer_mut(EditOrigin {
        pid: current_pid(),
        connection_id: 9,
        session_id: 3,
    });

    assert!(state.remove_layer(1));
    assert!(!state.remove_layer(1));
    assert_eq!(state.remove_connection(current_pid(), 1), 1);
    assert!(state.layer(3).is_some());
    assert_eq!(state.layers().len(), 1);
}

#[test]
fn test_purge_dead_drops_only_dead_layers() {
    let mut state = OperState::default();
    state.layer_mut(origin(1));
    let dead = EditOrigin {
        pid: dead_pid(),
        connection_id: 2,
        session_id: 2,
    };
    state.layer_mut(dead);

    assert_eq!(state.purge_dead(), vec![dead]);
    assert!(state.layer(1).is_some());
    assert!(state.layer(2).is_none());
}
