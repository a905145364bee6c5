use std::sync::Arc;

use crate::{
    ops::{AssignAdd, Operation},
    scope::{Device, NameScope, Scope},
    store::VariableStore,
    tests::helpers::{assert_all_close, scalar},
};

#[test]
fn test_name_scope_join() {
    let root = NameScope::root();
    assert!(root.is_root());
    assert_eq!(root.join("v"), "v");

    let nested = root.child("a").child("b");
    assert_eq!(nested.to_string(), "a/b");
    assert_eq!(nested.join("v"), "a/b/v");
    assert_eq!(root.child("a/b"), nested);
    assert_eq!(nested.child(""), nested);
}

#[test]
fn test_child_scope_keeps_device() {
    let scope = Scope::root()
        .on_device(Device::new("/job:worker"))
        .child("layer");
    assert_eq!(scope.device().map(Device::as_str), Some("/job:worker"));
    assert_eq!(scope.join("w"), "layer/w");
    assert!(Scope::root().device().is_none());
}

#[test]
fn test_control_dependencies_accumulate_in_order() {
    let mut store = VariableStore::new();
    let root = Scope::root();
    let counter = store.variable(&root, "counter", scalar(0.0));
    let first: Arc<dyn Operation> = AssignAdd::new(&counter, scalar(1.0));
    let second: Arc<dyn Operation> = AssignAdd::new(&counter, scalar(10.0));

    let scope = root
        .with_control_dependencies([first])
        .child("inner")
        .with_control_dependencies([second]);
    let names: Vec<&str> = scope
        .control_dependencies()
        .iter()
        .map(|op| op.name())
        .collect();
    assert_eq!(names, vec!["counter/AssignAdd", "counter/AssignAdd"]);
    assert!(root.control_dependencies().is_empty());

    for op in scope.control_dependencies() {
        op.run(&mut store).unwrap();
    }
    assert_all_close(store.value(&counter).unwrap(), &scalar(11.0));
}
