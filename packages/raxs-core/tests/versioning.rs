use raxs_core::{
    Content, Error, Key, MemTree, MutableRefTree, Position, RefTree, CURRENT_VERSION,
    FIRST_VERSION, NO_VERSION,
};
use raxs_test_support::{child_names, root_only, shot, texts, TempStore, SAMPLE_DOC};

fn doc_with(path: &[&str]) -> MemTree {
    let mut tree = MemTree::new();
    let mut parent = tree.insert_root(None, Content::Document).unwrap();
    for name in path {
        parent = tree
            .insert(&parent, Position::Append, None, Content::element(*name))
            .unwrap();
    }
    tree
}

#[test]
fn three_commits_recall_each_version() {
    let mut fx = TempStore::new();
    let store = &fx.store;
    assert_eq!(store.current_version().unwrap(), NO_VERSION);
    assert_eq!(store.oldest_version().unwrap(), NO_VERSION);

    let mut buffer = store.editable_tree().unwrap();
    let doc = buffer.insert_root(None, Content::Document).unwrap();
    buffer
        .insert(&doc, Position::Append, None, Content::element("root"))
        .unwrap();
    assert_eq!(store.commit_edits(&mut buffer, true).unwrap(), FIRST_VERSION);

    buffer
        .insert(&Key::path(vec![0]), Position::Append, None, Content::element("a"))
        .unwrap();
    assert_eq!(store.commit_edits(&mut buffer, true).unwrap(), 2);

    buffer
        .insert(&Key::path(vec![0, 0]), Position::Append, None, Content::element("b"))
        .unwrap();
    assert_eq!(store.commit_edits(&mut buffer, false).unwrap(), 3);

    assert_eq!(store.oldest_version().unwrap(), 1);
    assert_eq!(store.current_version().unwrap(), 3);
    assert_eq!(shot(&store.tree_at(1).unwrap()), shot(&doc_with(&["root"])));
    assert_eq!(shot(&store.tree_at(2).unwrap()), shot(&doc_with(&["root", "a"])));
    assert_eq!(
        shot(&store.tree_at(CURRENT_VERSION).unwrap()),
        shot(&doc_with(&["root", "a", "b"]))
    );
    assert_eq!(fx.history_files(), vec!["0.xml", "1.xml", "2.xml"]);

    fx.reopen();
    assert_eq!(fx.store.current_version().unwrap(), 3);
    assert_eq!(shot(&fx.store.tree_at(2).unwrap()), shot(&doc_with(&["root", "a"])));
    assert_eq!(
        shot(fx.store.tree().unwrap().as_ref()),
        shot(&doc_with(&["root", "a", "b"]))
    );
}

#[test]
fn zero_length_document_is_empty_and_first_delta_is_empty() {
    let fx = TempStore::with_document("xas-items", "");
    let store = &fx.store;
    assert_eq!(store.tree().unwrap().root().unwrap(), None);
    assert_eq!(store.current_version().unwrap(), NO_VERSION);
    assert_eq!(store.next_version().unwrap(), FIRST_VERSION);

    let version = store.commit(&root_only("r")).unwrap();
    assert_eq!(version, FIRST_VERSION);
    let sentinel = fx.path().join("history").join("0.xml");
    assert_eq!(std::fs::metadata(sentinel).unwrap().len(), 0);
    assert_eq!(shot(store.tree().unwrap().as_ref()), shot(&root_only("r")));
}

#[test]
fn unchanged_commit_keeps_version() {
    let fx = TempStore::with_document("xas-items", SAMPLE_DOC);
    let store = &fx.store;
    assert_eq!(store.current_version().unwrap(), FIRST_VERSION);

    let mut buffer = store.editable_tree().unwrap();
    assert_eq!(store.commit_edits(&mut buffer, true).unwrap(), FIRST_VERSION);
    assert_eq!(store.commit_edits(&mut buffer, false).unwrap(), FIRST_VERSION);
    assert!(fx.history_files().is_empty());

    assert_eq!(
        store.commit(&MemTree::tree_ref(Key::root_path())).unwrap(),
        FIRST_VERSION
    );
    assert!(fx.history_files().is_empty());
}

#[test]
fn imported_document_is_first_version() {
    let fx = TempStore::with_document("xas-items", SAMPLE_DOC);
    let store = &fx.store;
    let original = shot(store.tree().unwrap().as_ref());

    let mut buffer = store.editable_tree().unwrap();
    buffer.delete(&Key::path(vec![0, 1])).unwrap();
    buffer
        .update(&Key::path(vec![0, 2, 0, 0]), Content::text("Deltas"))
        .unwrap();
    assert_eq!(store.commit_edits(&mut buffer, false).unwrap(), 2);
    assert_eq!(fx.history_files(), vec!["1.xml"]);

    let current = store.tree().unwrap();
    assert_eq!(child_names(current.as_ref(), &Key::path(vec![0])), vec!["book", "book"]);
    assert_eq!(shot(&store.tree_at(1).unwrap()), original);
}

#[test]
fn history_navigation() {
    let fx = TempStore::new();
    let store = &fx.store;
    for n in 0..4 {
        let mut tree = doc_with(&["r"]);
        let r = tree.children(&tree.root().unwrap().unwrap()).unwrap()[0].clone();
        tree.insert(&r, Position::Append, None, Content::text(format!("v{n}")))
            .unwrap();
        store.commit(&tree).unwrap();
    }
    let history = store.history().unwrap();
    assert_eq!(history.list_versions(), vec![1, 2, 3, 4]);
    assert_eq!(store.previous_version(4).unwrap(), 3);
    assert_eq!(store.previous_version(CURRENT_VERSION).unwrap(), 3);
    assert_eq!(store.previous_version(1).unwrap(), NO_VERSION);
    assert_eq!(store.next_version().unwrap(), 5);

    assert!(store.tree_at(0).unwrap_err().is_not_found());
    assert!(store.tree_at(5).unwrap_err().is_not_found());
    for v in 1..=4 {
        let texts = raxs_test_support::texts(&store.tree_at(v).unwrap());
        assert_eq!(texts, vec![format!("v{}", v - 1)]);
    }
}

#[test]
fn failed_commit_leaves_version_and_history() {
    let fx = TempStore::with_document("xas-items", SAMPLE_DOC);
    let store = &fx.store;
    let before = std::fs::read(fx.path().join("content.xml")).unwrap();

    let dangling = MemTree::tree_ref(Key::path(vec![0, 9]));
    assert!(store.commit(&dangling).is_err());
    assert_eq!(store.current_version().unwrap(), FIRST_VERSION);
    assert!(fx.history_files().is_empty());
    assert_eq!(std::fs::read(fx.path().join("content.xml")).unwrap(), before);
}

#[test]
fn emptying_the_store_writes_full_delta() {
    let fx = TempStore::with_document("xas-items", SAMPLE_DOC);
    let store = &fx.store;
    let original = shot(store.tree().unwrap().as_ref());

    assert_eq!(store.commit(&MemTree::new()).unwrap(), 2);
    assert_eq!(store.tree().unwrap().root().unwrap(), None);
    assert_eq!(std::fs::metadata(fx.path().join("content.xml")).unwrap().len(), 0);
    assert_eq!(shot(&store.tree_at(1).unwrap()), original);

    assert_eq!(store.commit(&root_only("again")).unwrap(), 3);
    assert_eq!(std::fs::metadata(fx.path().join("history/2.xml")).unwrap().len(), 0);
    assert_eq!(store.tree_at(2).unwrap().root().unwrap(), None);
    assert_eq!(shot(&store.tree_at(1).unwrap()), original);
}

fn append_text_after_copied_text(document: &str, first: &str) {
    let mut fx = TempStore::with_document("xas-items", document);
    let store = &fx.store;
    let mut buffer = store.editable_tree().unwrap();
    buffer
        .insert(&Key::path(vec![0]), Position::Append, None, Content::text("y"))
        .unwrap();
    assert_eq!(store.commit_edits(&mut buffer, false).unwrap(), 2);
    assert_eq!(texts(store.tree().unwrap().as_ref()), vec![first, "y"]);
    assert_eq!(texts(&store.tree_at(1).unwrap()), vec![first]);

    fx.reopen();
    assert_eq!(texts(fx.store.tree().unwrap().as_ref()), vec![first, "y"]);
    assert_eq!(texts(&fx.store.tree_at(1).unwrap()), vec![first]);
}

#[test]
fn text_appended_after_cdata_stays_separate() {
    append_text_after_copied_text("<r><![CDATA[x]]></r>", "x");
}

#[test]
fn text_appended_after_text_ending_in_gt_stays_separate() {
    append_text_after_copied_text("<r>a></r>", "a>");
}

#[test]
fn cancelled_edits_keep_version() {
    let fx = TempStore::with_document("xas-items", "<r><a/></r>");
    let store = &fx.store;
    let mut buffer = store.editable_tree().unwrap();
    let b = buffer
        .insert(&Key::path(vec![0]), Position::Append, None, Content::element("b"))
        .unwrap();
    buffer.delete(&b).unwrap();
    assert!(!buffer.has_changes().unwrap());
    assert_eq!(store.commit_edits(&mut buffer, false).unwrap(), FIRST_VERSION);
    assert_eq!(store.current_version().unwrap(), FIRST_VERSION);
    assert!(fx.history_files().is_empty());
}

/// Rewrites the first subtree reference of delta `version` to a node that
/// does not exist.
fn corrupt_delta(fx: &TempStore, version: i64) {
    let path = fx.path().join("history").join(format!("{version}.xml"));
    let text = std::fs::read_to_string(&path).unwrap();
    let start = text.find("<rt:tree key=\"").expect("delta has a subtree reference")
        + "<rt:tree key=\"".len();
    let end = start + text[start..].find('"').unwrap();
    let corrupted = format!("{}/0.9{}", &text[..start], &text[end..]);
    std::fs::write(&path, corrupted).unwrap();
}

#[test]
fn corrupted_delta_is_a_broken_repository() {
    let fx = TempStore::with_document("xas-items", SAMPLE_DOC);
    let store = &fx.store;
    let mut buffer = store.editable_tree().unwrap();
    buffer.delete(&Key::path(vec![0, 1])).unwrap();
    assert_eq!(store.commit_edits(&mut buffer, false).unwrap(), 2);
    corrupt_delta(&fx, 1);

    match store.tree_at(1).unwrap_err() {
        Error::BrokenRepository { version, .. } => assert_eq!(version, 1),
        other => panic!("expected a broken repository, got {other:?}"),
    }
}

#[test]
fn failed_recall_leaves_store_state() {
    let fx = TempStore::with_document("xas-items", SAMPLE_DOC);
    let store = &fx.store;
    let mut buffer = store.editable_tree().unwrap();
    buffer.delete(&Key::path(vec![0, 1])).unwrap();
    assert_eq!(store.commit_edits(&mut buffer, true).unwrap(), 2);
    buffer
        .update(&Key::path(vec![0, 1, 0, 0]), Content::text("Recalled"))
        .unwrap();
    assert_eq!(store.commit_edits(&mut buffer, false).unwrap(), 3);
    let current = shot(store.tree().unwrap().as_ref());
    let second = shot(&store.tree_at(2).unwrap());
    corrupt_delta(&fx, 1);

    assert!(store.tree_at(1).is_err());
    assert_eq!(store.current_version().unwrap(), 3);
    assert_eq!(store.oldest_version().unwrap(), 1);
    assert_eq!(shot(store.tree().unwrap().as_ref()), current);
    assert_eq!(shot(&store.tree_at(2).unwrap()), second);
    assert_eq!(fx.history_files(), vec!["1.xml", "2.xml"]);
}
