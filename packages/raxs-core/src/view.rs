use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::fragment::{expand, FragmentState, LazySource};
use crate::index::{Entry, Index};
use crate::key::Key;
use crate::model::{Content, TreeModel};
use crate::traits::{Position, RefTree};
use crate::tree::{MemTree, Payload, RefNode};

/// Read-only tree over a content file, loaded node by node on demand.
#[derive(Debug)]
pub struct IndexedTree {
    model: Arc<TreeModel>,
    index: Index,
    source: Option<LazySource>,
    fragments: Mutex<HashMap<Key, FragmentState>>,
}

impl IndexedTree {
    /// Indexes the file at `path`. A missing or zero-length file is an empty tree.
    pub fn open(path: &Path, model: Arc<TreeModel>) -> Result<Self> {
        let source = match LazySource::open(path) {
            Ok(source) => source,
            Err(Error::Io(err)) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no content file, starting empty");
                return Ok(Self::empty(model));
            }
            Err(err) => return Err(err),
        };
        if source.is_empty() {
            return Ok(Self::empty(model));
        }
        let bytes = source.read_all()?;
        let index = Index::build(&bytes, &model)?;
        Ok(Self {
            model,
            index,
            source: Some(source),
            fragments: Mutex::new(HashMap::new()),
        })
    }

    pub fn empty(model: Arc<TreeModel>) -> Self {
        let kind = model.key_kind();
        Self {
            model,
            index: Index::empty(kind),
            source: None,
            fragments: Mutex::new(HashMap::new()),
        }
    }

    pub fn model(&self) -> &Arc<TreeModel> {
        &self.model
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn entry(&self, key: &Key) -> Result<&Entry> {
        self.index.entry(key)
    }

    pub fn source(&self) -> Result<&LazySource> {
        self.source
            .as_ref()
            .ok_or_else(|| Error::IllegalState("tree has no content file".into()))
    }

    /// Number of nodes whose content has been decoded.
    pub fn loaded_count(&self) -> usize {
        self.fragments
            .lock()
            .values()
            .filter(|s| !matches!(s, FragmentState::Indexed(_)))
            .count()
    }

    fn fragment(&self, key: &Key) -> Result<FragmentState> {
        if let Some(state) = self.fragments.lock().get(key) {
            if !matches!(state, FragmentState::Indexed(_)) {
                return Ok(state.clone());
            }
        }
        let entry = self.index.entry(key)?.clone();
        let state = expand(
            key,
            FragmentState::Indexed(entry),
            self.source()?,
            &self.index,
            &self.model,
        )?;
        self.fragments.lock().insert(key.clone(), state.clone());
        Ok(state)
    }

    /// Copies `key` and `depth` further levels into memory. Nodes one level
    /// deeper are kept as tree references into this tree.
    pub fn force_subtree(&self, key: &Key, depth: usize) -> Result<MemTree> {
        let mut out = MemTree::new();
        self.force_into(key, depth, None, &mut out)?;
        Ok(out)
    }

    fn force_into(&self, key: &Key, depth: usize, parent: Option<&Key>, out: &mut MemTree) -> Result<()> {
        let node = self.node(key)?;
        out.add(parent, Position::Append, key.clone(), node.payload)?;
        for child in &node.children {
            if depth == 0 {
                out.add(
                    Some(key),
                    Position::Append,
                    child.clone(),
                    Payload::TreeRef(child.clone()),
                )?;
            } else {
                self.force_into(child, depth - 1, Some(key), out)?;
            }
        }
        Ok(())
    }
}

impl RefTree for IndexedTree {
    fn root(&self) -> Result<Option<Key>> {
        Ok(self.index.root().cloned())
    }

    fn node(&self, key: &Key) -> Result<RefNode> {
        let state = self.fragment(key)?;
        let (content, children): (Content, Vec<Key>) = match state {
            FragmentState::PartiallyExpanded {
                content, children, ..
            } => (content, children),
            FragmentState::FullyMaterialized { content, .. } => (content, Vec::new()),
            FragmentState::Indexed(_) => {
                return Err(Error::IllegalState(format!("node {key} failed to expand")))
            }
        };
        Ok(RefNode {
            key: key.clone(),
            parent: self.index.parent(key)?,
            payload: Payload::Content(content),
            children,
        })
    }

    fn contains(&self, key: &Key) -> Result<bool> {
        Ok(self.index.find(key).is_some())
    }

    fn parent(&self, key: &Key) -> Result<Option<Key>> {
        self.index.parent(key)
    }

    fn children(&self, key: &Key) -> Result<Vec<Key>> {
        self.index.children(key)
    }

    fn content(&self, key: &Key) -> Result<Content> {
        self.fragment(key)?
            .content()
            .cloned()
            .ok_or_else(|| Error::IllegalState(format!("node {key} failed to expand")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::snapshot;

    fn write(dir: &tempfile::TempDir, doc: &str) -> std::path::PathBuf {
        let path = dir.path().join("content.xml");
        std::fs::write(&path, doc).unwrap();
        path
    }

    #[test]
    fn loads_nodes_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "<r><a>x</a><b>y</b></r>");
        let tree = IndexedTree::open(&path, Arc::new(TreeModel::dewey())).unwrap();
        assert_eq!(tree.loaded_count(), 0);
        let b = tree.node(&Key::path(vec![0, 1])).unwrap();
        assert_eq!(b.payload, Payload::Content(Content::element("b")));
        assert_eq!(b.parent, Some(Key::path(vec![0])));
        assert_eq!(tree.loaded_count(), 1);
        let shot = snapshot(&tree).unwrap();
        assert_eq!(shot.node_count(), 6);
    }

    #[test]
    fn force_subtree_leaves_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "<r><a><c/></a><b/></r>");
        let tree = IndexedTree::open(&path, Arc::new(TreeModel::dewey())).unwrap();
        let forced = tree.force_subtree(&Key::path(vec![0]), 1).unwrap();
        assert_eq!(forced.len(), 4);
        assert_eq!(
            forced.payload(&Key::path(vec![0, 0, 0])).unwrap(),
            Payload::TreeRef(Key::path(vec![0, 0, 0]))
        );
        assert_eq!(
            forced.payload(&Key::path(vec![0, 1])).unwrap(),
            Payload::Content(Content::element("b"))
        );
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tree = IndexedTree::open(&dir.path().join("none.xml"), Arc::new(TreeModel::dewey())).unwrap();
        assert_eq!(tree.root().unwrap(), None);
        assert!(tree.node(&Key::root_path()).unwrap_err().is_not_found());
    }
}
