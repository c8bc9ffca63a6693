//! Fixtures shared by the store test suites.

use std::path::Path;

use raxs_core::{
    snapshot, Content, Key, MemTree, MutableRefTree, Position, RefTree, StoreConfig, TreeSnapshot,
    VersionedStore, DEWEY_MODEL,
};
use tempfile::TempDir;
use tracing_subscriber::{prelude::*, EnvFilter};

/// A small document exercising elements, text, comments and namespaces.
pub const SAMPLE_DOC: &str = concat!(
    "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
    "<catalog xmlns:m=\"urn:example:meta\">",
    "<book id=\"b1\"><title>Tree Stores</title><m:note>first</m:note></book>",
    "<!-- shelf two -->",
    "<book id=\"b2\"><title>Deltas &amp; Versions</title></book>",
    "</catalog>"
);

/// The same shape keyed by `id` attributes, for the identifier model.
pub const SAMPLE_ID_DOC: &str = concat!(
    "<catalog id=\"c\">\n",
    "  <book id=\"b1\"><title id=\"t1\"/></book>\n",
    "  <book id=\"b2\"><title id=\"t2\"/></book>\n",
    "</catalog>\n"
);

/// Routes `tracing` output to stderr, filtered by `RUST_LOG`. Safe to call
/// from every test.
pub fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// A versioned store in a temporary directory that lives as long as the
/// fixture.
pub struct TempStore {
    pub dir: TempDir,
    pub store: VersionedStore,
}

impl TempStore {
    pub fn new() -> Self {
        Self::with_model(DEWEY_MODEL)
    }

    pub fn with_model(model: &str) -> Self {
        setup_logging();
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = open(dir.path(), model);
        Self { dir, store }
    }

    /// Starts from an existing document.
    pub fn with_document(model: &str, document: &str) -> Self {
        setup_logging();
        let dir = tempfile::tempdir().expect("create temp dir");
        std::fs::write(dir.path().join("content.xml"), document).expect("write document");
        let store = open(dir.path(), model);
        Self { dir, store }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Drops the store and opens a fresh instance over the same files.
    pub fn reopen(&mut self) {
        let model = self.store.model().name().to_string();
        self.store = open(self.dir.path(), &model);
    }

    pub fn history_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.dir.path().join("history"))
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl Default for TempStore {
    fn default() -> Self {
        Self::new()
    }
}

fn open(root: &Path, model: &str) -> VersionedStore {
    let config = StoreConfig::for_path(root).with_model(model);
    let store = VersionedStore::new(config).expect("build store");
    store.open().expect("open store");
    store
}

/// Key-free image of any tree, panicking on unresolved references.
pub fn shot(tree: &dyn RefTree) -> TreeSnapshot {
    snapshot(tree).expect("snapshot")
}

/// Text of every text node, in document order.
pub fn texts(tree: &dyn RefTree) -> Vec<String> {
    fn walk(tree: &dyn RefTree, key: &Key, out: &mut Vec<String>) {
        if let Content::Text(text) = tree.content(key).expect("content") {
            out.push(text);
        }
        for child in tree.children(key).expect("children") {
            walk(tree, &child, out);
        }
    }
    let mut out = Vec::new();
    if let Some(root) = tree.root().expect("root") {
        walk(tree, &root, &mut out);
    }
    out
}

/// Local names of the element children of `key`.
pub fn child_names(tree: &dyn RefTree, key: &Key) -> Vec<String> {
    tree.children(key)
        .expect("children")
        .iter()
        .filter_map(|child| match tree.content(child).expect("content") {
            Content::Element { name, .. } => Some(name.local),
            _ => None,
        })
        .collect()
}

/// A document node holding a single empty element, as a plain tree.
pub fn root_only(element: &str) -> MemTree {
    let mut tree = MemTree::new();
    let doc = tree
        .insert_root(Some(Key::root_path()), Content::Document)
        .expect("root");
    tree.insert(&doc, Position::Append, Some(Key::path(vec![0])), Content::element(element))
        .expect("element");
    tree
}
