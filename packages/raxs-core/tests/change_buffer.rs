use raxs_core::{Content, Error, Key, MutableRefTree, Position, RefTree};
use raxs_test_support::{child_names, shot, texts, TempStore, SAMPLE_DOC};

fn fixture() -> TempStore {
    TempStore::with_document("xas-items", SAMPLE_DOC)
}

#[test]
fn edits_stay_in_the_buffer_until_commit() {
    let fx = fixture();
    let on_disk = std::fs::read(fx.path().join("content.xml")).unwrap();
    let before = shot(fx.store.tree().unwrap().as_ref());

    let mut buffer = fx.store.editable_tree().unwrap();
    buffer.delete(&Key::path(vec![0, 0])).unwrap();
    buffer
        .insert(&Key::path(vec![0]), Position::Index(0), None, Content::element("shelf"))
        .unwrap();
    buffer
        .update(&Key::path(vec![0, 2, 0, 0]), Content::text("Deltas"))
        .unwrap();

    assert_eq!(std::fs::read(fx.path().join("content.xml")).unwrap(), on_disk);
    assert_eq!(shot(fx.store.tree().unwrap().as_ref()), before);
    assert_eq!(child_names(&buffer, &Key::path(vec![0])), vec!["shelf", "book"]);
    assert_eq!(texts(&buffer), vec!["Deltas"]);
}

#[test]
fn second_checkout_is_refused() {
    let fx = fixture();
    let _first = fx.store.editable_tree().unwrap();
    let err = fx.store.editable_tree().unwrap_err();
    assert!(matches!(err, Error::IllegalState(_)));
}

#[test]
fn deleted_subtree_is_invisible() {
    let fx = fixture();
    let mut buffer = fx.store.editable_tree().unwrap();
    let book = Key::path(vec![0, 0]);
    buffer.delete(&book).unwrap();

    let backing = fx.store.tree().unwrap();
    for key in [
        Key::path(vec![0, 0, 0]),
        Key::path(vec![0, 0, 0, 0]),
        Key::path(vec![0, 0, 1]),
        Key::path(vec![0, 0, 1, 0]),
    ] {
        assert!(backing.contains(&key).unwrap());
        assert!(!buffer.contains(&key).unwrap());
        assert!(buffer.node(&key).unwrap_err().is_not_found());
    }
    assert!(buffer.delete(&book).unwrap_err().is_not_found());
    assert!(buffer.delete(&Key::root_path()).unwrap_err().is_precondition());
}

#[test]
fn moves_never_create_cycles() {
    let fx = fixture();
    let mut buffer = fx.store.editable_tree().unwrap();
    let book = Key::path(vec![0, 2]);
    let title = Key::path(vec![0, 2, 0]);
    assert!(buffer
        .move_node(&book, &title, Position::Append)
        .unwrap_err()
        .is_precondition());
    assert!(buffer
        .move_node(&book, &book, Position::Append)
        .unwrap_err()
        .is_precondition());
    assert!(buffer
        .move_node(&Key::path(vec![0]), &Key::path(vec![0, 0, 1]), Position::Append)
        .is_err());

    buffer
        .move_node(&title, &Key::path(vec![0, 0]), Position::Index(0))
        .unwrap();
    assert_eq!(
        child_names(&buffer, &Key::path(vec![0, 0])),
        vec!["title", "title", "note"]
    );
    assert!(child_names(&buffer, &book).is_empty());
}

#[test]
fn moved_namespaced_subtree_survives_commit() {
    let fx = fixture();
    let mut buffer = fx.store.editable_tree().unwrap();
    // <m:note> leaves the book that sits in the scope declaring `m`.
    buffer
        .move_node(&Key::path(vec![0, 0, 1]), &Key::path(vec![0, 2]), Position::Append)
        .unwrap();
    let expected = shot(&buffer);
    fx.store.commit_edits(&mut buffer, false).unwrap();

    let tree = fx.store.tree().unwrap();
    assert_eq!(shot(tree.as_ref()), expected);
    let note = tree.content(&Key::path(vec![0, 2, 1])).unwrap();
    match note {
        Content::Element { name, .. } => {
            assert_eq!(name.namespace.as_deref(), Some("urn:example:meta"));
            assert_eq!(name.local, "note");
        }
        other => panic!("expected element, got {other:?}"),
    }
}

#[test]
fn reset_discards_edits() {
    let fx = fixture();
    let mut buffer = fx.store.editable_tree().unwrap();
    buffer.delete(&Key::path(vec![0, 1])).unwrap();
    assert!(buffer.has_changes().unwrap());
    buffer.reset().unwrap();
    assert!(!buffer.has_changes().unwrap());
    assert_eq!(shot(&buffer), shot(fx.store.tree().unwrap().as_ref()));
}

#[test]
fn update_with_equal_content_is_not_a_change() {
    let fx = fixture();
    let mut buffer = fx.store.editable_tree().unwrap();
    let text = Key::path(vec![0, 0, 0, 0]);
    assert!(!buffer.update(&text, Content::text("Tree Stores")).unwrap());
    assert!(!buffer.has_changes().unwrap());
    assert!(buffer.update(&text, Content::text("Stores")).unwrap());
    assert!(buffer
        .update(&Key::path(vec![0, 0]), Content::text("not a container"))
        .is_err());
}
