//! A single document on disk: opened as an indexed tree, replaced
//! atomically on apply.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::change_buffer::ChangeBuffer;
use crate::encode::{DocumentEncoder, EncodeStats};
use crate::error::{Error, Result};
use crate::model::TreeModel;
use crate::traits::{IoTrap, LoggingTrap, RefTree};
use crate::view::IndexedTree;

pub struct Store {
    path: PathBuf,
    model: Arc<TreeModel>,
    trap: Arc<dyn IoTrap>,
    tree: Option<Arc<IndexedTree>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("model", &self.model.name())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Store {
    pub fn new(path: impl Into<PathBuf>, model: Arc<TreeModel>) -> Self {
        Self::with_trap(path, model, Arc::new(LoggingTrap))
    }

    pub fn with_trap(path: impl Into<PathBuf>, model: Arc<TreeModel>, trap: Arc<dyn IoTrap>) -> Self {
        Self {
            path: path.into(),
            model,
            trap,
            tree: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn model(&self) -> &Arc<TreeModel> {
        &self.model
    }

    pub fn is_open(&self) -> bool {
        self.tree.is_some()
    }

    /// Indexes the document. Does nothing when already open.
    pub fn open(&mut self) -> Result<()> {
        if self.tree.is_some() {
            return Ok(());
        }
        let tree = IndexedTree::open(&self.path, self.model.clone()).map_err(|e| self.trapped("open", e))?;
        debug!(path = %self.path.display(), nodes = tree.index().len(), "opened store");
        self.tree = Some(Arc::new(tree));
        Ok(())
    }

    pub fn close(&mut self) {
        self.tree = None;
    }

    /// A document that does not exist yet counts as writable.
    pub fn is_writable(&self) -> bool {
        match fs::metadata(&self.path) {
            Ok(meta) => !meta.permissions().readonly(),
            Err(_) => true,
        }
    }

    pub fn tree(&self) -> Result<Arc<IndexedTree>> {
        self.tree
            .clone()
            .ok_or_else(|| Error::IllegalState(format!("store {} is closed", self.path.display())))
    }

    /// A fresh buffer over the current tree.
    pub fn change_buffer(&self) -> Result<ChangeBuffer> {
        if !self.is_writable() {
            return Err(Error::NotWritable(self.path.clone()));
        }
        let tree: Arc<dyn RefTree> = self.tree()?;
        ChangeBuffer::new(tree, self.model.clone())
    }

    /// Replaces the document with `tree`, whose references point into the
    /// current tree, and reopens. The old document stays in place if
    /// anything fails before the final rename.
    pub fn apply(&mut self, tree: &dyn RefTree) -> Result<EncodeStats> {
        if !self.is_writable() {
            return Err(Error::NotWritable(self.path.clone()));
        }
        let started = Instant::now();
        let base = self.tree()?;
        let stats = self
            .write_document(tree, &base)
            .map_err(|e| self.trapped("apply", e))?;
        self.reopen()?;
        info!(
            path = %self.path.display(),
            nodes = stats.nodes,
            bytes = stats.bytes,
            fast_copies = stats.fast_copies,
            slow_copies = stats.slow_copies,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "applied tree to store"
        );
        Ok(stats)
    }

    /// Reindexes a document that was just replaced. On failure the store
    /// stays closed.
    fn reopen(&mut self) -> Result<()> {
        self.tree = None;
        self.open().map_err(|err| {
            warn!(path = %self.path.display(), error = %err, "document written but reopening failed");
            err
        })
    }

    fn write_document(&self, tree: &dyn RefTree, base: &IndexedTree) -> Result<EncodeStats> {
        let dir = parent_dir(&self.path);
        fs::create_dir_all(dir)?;
        let temp = NamedTempFile::new_in(dir)?;
        let encoder = DocumentEncoder::new(BufWriter::new(temp.as_file()), &self.model, Some(base));
        let (mut out, stats) = encoder.encode(tree)?;
        out.flush()?;
        drop(out);
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| e.error)?;
        Ok(stats)
    }

    fn trapped(&self, operation: &str, err: Error) -> Error {
        match err {
            Error::Io(io) => self.trap.trap(operation, io),
            other => other,
        }
    }
}

pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
