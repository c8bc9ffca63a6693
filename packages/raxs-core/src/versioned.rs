//! Versioned store: each commit persists a reverse delta from the new tree
//! back to the old one, and old versions are rebuilt by replaying deltas
//! from the current tree backwards.
//!
//! Layout under the store root:
//!
//! - `content.xml` (configurable): the current document.
//! - `history/<v>.xml`: the delta from version `v + 1` back to `v`. A
//!   zero-length file stands for the empty tree.
//!
//! The current version is one past the highest delta file, found by binary
//! search over file existence.

use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::change_buffer::{ChangeBuffer, SessionId, SessionToken};
use crate::config::StoreConfig;
use crate::encode::{read_ref_tree, write_ref_tree};
use crate::error::{Error, Result};
use crate::model::{ModelRegistry, TreeModel};
use crate::reftrees::{combine, reverse_ref_tree};
use crate::store::{parent_dir, Store};
use crate::traits::{IoTrap, LoggingTrap, RefTree};
use crate::tree::{materialize, MemTree, Payload};
use crate::version::{
    Version, VersionHistory, CURRENT_VERSION, FIRST_VERSION, MAX_VERSION, NO_VERSION,
};
use crate::view::IndexedTree;

struct State {
    store: Store,
    /// Computed on first use after each open.
    current: Option<Version>,
    session: Weak<SessionToken>,
    next_session: SessionId,
}

pub struct VersionedStore {
    config: StoreConfig,
    model: Arc<TreeModel>,
    history_dir: Option<PathBuf>,
    trap: Arc<dyn IoTrap>,
    state: Mutex<State>,
}

impl std::fmt::Debug for VersionedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn delta_path(dir: &Path, version: Version) -> PathBuf {
    dir.join(format!("{version}.xml"))
}

/// One past the highest delta file. Files are assumed to exist for every
/// version from the first one found up to the highest.
fn probe_current(dir: &Path, has_root: bool) -> Version {
    let exists = |v: Version| delta_path(dir, v).is_file();
    let mut low = if exists(0) {
        0
    } else if exists(FIRST_VERSION) {
        FIRST_VERSION
    } else if has_root {
        return FIRST_VERSION;
    } else {
        return NO_VERSION;
    };
    let mut high = MAX_VERSION + 1;
    let mut probes = 0u32;
    while high - low > 1 {
        let mid = low + (high - low) / 2;
        probes += 1;
        if exists(mid) {
            low = mid;
        } else {
            high = mid;
        }
    }
    debug!(dir = %dir.display(), current = low + 1, probes, "probed version history");
    low + 1
}

impl VersionedStore {
    /// Resolves the configured model from the built-in registry. The store
    /// starts closed.
    pub fn new(config: StoreConfig) -> Result<Self> {
        Self::with_registry(config, &ModelRegistry::default())
    }

    pub fn with_registry(config: StoreConfig, registry: &ModelRegistry) -> Result<Self> {
        let model = registry.get(&config.model)?;
        Self::with_parts(config, model, Arc::new(LoggingTrap))
    }

    pub fn with_parts(config: StoreConfig, model: Arc<TreeModel>, trap: Arc<dyn IoTrap>) -> Result<Self> {
        config.validate()?;
        let store = Store::with_trap(config.content_file(), model.clone(), trap.clone());
        Ok(Self {
            history_dir: config.history_dir(),
            config,
            model,
            trap,
            state: Mutex::new(State {
                store,
                current: None,
                session: Weak::new(),
                next_session: 1,
            }),
        })
    }

    /// Builds and opens a store for a directory or document path.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self::new(StoreConfig::for_path(path))?;
        store.open()?;
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn model(&self) -> &Arc<TreeModel> {
        &self.model
    }

    pub fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.store.is_open() {
            return Ok(());
        }
        state.store.open()?;
        state.current = None;
        info!(path = %state.store.path().display(), model = self.model.name(), "opened versioned store");
        Ok(())
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.store.close();
        state.current = None;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().store.is_open()
    }

    pub fn current_version(&self) -> Result<Version> {
        let mut state = self.state.lock();
        self.current_locked(&mut state)
    }

    pub fn oldest_version(&self) -> Result<Version> {
        Ok(self.history()?.oldest_version())
    }

    pub fn history(&self) -> Result<VersionHistory> {
        let mut state = self.state.lock();
        self.history_locked(&mut state)
    }

    /// Version number the next commit will produce.
    pub fn next_version(&self) -> Result<Version> {
        Ok(match self.current_version()? {
            NO_VERSION => FIRST_VERSION,
            current => current + 1,
        })
    }

    pub fn previous_version(&self, version: Version) -> Result<Version> {
        Ok(self.history()?.previous_version(version))
    }

    /// The current tree.
    pub fn tree(&self) -> Result<Arc<IndexedTree>> {
        self.state.lock().store.tree()
    }

    /// Whether an editable tree is checked out.
    pub fn has_editable_tree(&self) -> bool {
        self.state.lock().session.upgrade().is_some()
    }

    /// Checks out the single editable tree of this store. The checkout ends
    /// when the buffer is committed without `keep_editable` or dropped.
    pub fn editable_tree(&self) -> Result<ChangeBuffer> {
        let mut state = self.state.lock();
        if state.session.upgrade().is_some() {
            return Err(Error::IllegalState(
                "an editable tree is already checked out".into(),
            ));
        }
        let mut buffer = state.store.change_buffer()?;
        let token = Arc::new(SessionToken::new(state.next_session));
        state.next_session += 1;
        state.session = Arc::downgrade(&token);
        debug!(session = token.id(), "checked out editable tree");
        buffer.set_session(Some(token));
        Ok(buffer)
    }

    /// Commits the edits of the checked-out buffer. With `keep_editable` the
    /// buffer stays checked out, rebased onto the new tree with no edits.
    pub fn commit_edits(&self, buffer: &mut ChangeBuffer, keep_editable: bool) -> Result<Version> {
        let mut state = self.state.lock();
        let owned = state
            .session
            .upgrade()
            .is_some_and(|token| Some(token.id()) == buffer.session());
        if !owned {
            return Err(Error::IllegalState(
                "buffer is not the editable tree of this store".into(),
            ));
        }
        let changes = buffer.change_tree()?;
        let version = self.commit_locked(&mut state, &changes)?;
        if keep_editable {
            let tree: Arc<dyn RefTree> = state.store.tree()?;
            buffer.rebase(tree)?;
        } else {
            buffer.set_session(None);
        }
        Ok(version)
    }

    /// Commits a tree whose references point into the current tree.
    pub fn commit(&self, tree: &dyn RefTree) -> Result<Version> {
        let mut state = self.state.lock();
        if state.session.upgrade().is_some() {
            return Err(Error::IllegalState(
                "an editable tree is checked out; commit it with commit_edits".into(),
            ));
        }
        self.commit_locked(&mut state, tree)
    }

    /// The tree at `version` as a buffer over the current tree.
    pub fn tree_at(&self, version: Version) -> Result<ChangeBuffer> {
        let mut state = self.state.lock();
        self.recall(&mut state, version)
    }

    /// The tree at `version` with references into the tree at `refs_version`.
    /// `NO_VERSION` as `refs_version` gives a tree with no references.
    pub fn ref_tree(&self, version: Version, refs_version: Version) -> Result<MemTree> {
        let mut state = self.state.lock();
        let current = self.current_locked(&mut state)?;
        let is_current = |v: Version| v == CURRENT_VERSION || v == current;
        let kind = self.model.key_kind();
        let base = state.store.tree()?;

        let x_refs_c = if is_current(version) {
            match base.root()? {
                Some(root) => MemTree::tree_ref(root),
                None => MemTree::new(),
            }
        } else {
            self.recall(&mut state, version)?.change_tree()?
        };
        if refs_version == NO_VERSION {
            return materialize(&x_refs_c, base.as_ref(), kind);
        }
        if is_current(refs_version) {
            return Ok(x_refs_c);
        }
        let y_refs_c = self.recall(&mut state, refs_version)?.change_tree()?;
        let c_refs_y = reverse_ref_tree(base.as_ref(), &y_refs_c, kind)?;
        combine(&x_refs_c, &c_refs_y, base.as_ref(), kind)
    }

    /// Writes [`VersionedStore::ref_tree`] in the delta format.
    pub fn export_ref_tree<W: Write>(&self, version: Version, refs_version: Version, out: W) -> Result<W> {
        let tree = self.ref_tree(version, refs_version)?;
        write_ref_tree(&tree, &self.model, out)
    }

    fn ensure_open(state: &State) -> Result<()> {
        if state.store.is_open() {
            Ok(())
        } else {
            Err(Error::IllegalState("versioned store is closed".into()))
        }
    }

    fn current_locked(&self, state: &mut State) -> Result<Version> {
        Self::ensure_open(state)?;
        if let Some(current) = state.current {
            return Ok(current);
        }
        let current = match &self.history_dir {
            Some(dir) => probe_current(dir, state.store.tree()?.root()?.is_some()),
            None => NO_VERSION,
        };
        state.current = Some(current);
        Ok(current)
    }

    fn history_locked(&self, state: &mut State) -> Result<VersionHistory> {
        Ok(match self.current_locked(state)? {
            NO_VERSION => VersionHistory::empty(),
            current => VersionHistory::new(current, FIRST_VERSION),
        })
    }

    fn commit_locked(&self, state: &mut State, changes: &dyn RefTree) -> Result<Version> {
        let started = Instant::now();
        let history_dir = self
            .history_dir
            .as_ref()
            .ok_or_else(|| Error::Config("versioning is off for this store".into()))?;
        let current = self.current_locked(state)?;
        let base = state.store.tree()?;
        let base_root = base.root()?;
        let unchanged = match (changes.root()?, &base_root) {
            (None, None) => true,
            (Some(root), Some(base_root)) => {
                changes.payload(&root)? == Payload::TreeRef(base_root.clone())
            }
            _ => false,
        };
        if unchanged {
            info!(version = current, "commit without changes");
            return Ok(current);
        }

        let delta_version = if current == NO_VERSION { 0 } else { current };
        let delta_file = delta_path(history_dir, delta_version);
        let reverse = match base_root {
            Some(_) => Some(reverse_ref_tree(base.as_ref(), changes, self.model.key_kind())?),
            None => {
                info!(version = delta_version, "current tree is empty, writing empty delta");
                None
            }
        };
        self.write_delta(&delta_file, reverse.as_ref())
            .map_err(|e| self.trapped("write delta", e))?;

        if let Err(err) = state.store.apply(changes) {
            warn!(delta = %delta_file.display(), error = %err, "apply failed, removing delta");
            if let Err(remove) = fs::remove_file(&delta_file) {
                error!(delta = %delta_file.display(), error = %remove, "could not remove orphaned delta");
            }
            return Err(err);
        }
        let version = if current == NO_VERSION {
            FIRST_VERSION
        } else {
            current + 1
        };
        state.current = Some(version);
        info!(
            version,
            delta_nodes = reverse.as_ref().map(MemTree::len).unwrap_or(0),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "committed"
        );
        Ok(version)
    }

    fn write_delta(&self, path: &Path, tree: Option<&MemTree>) -> Result<()> {
        let dir = parent_dir(path);
        fs::create_dir_all(dir)?;
        let temp = NamedTempFile::new_in(dir)?;
        if let Some(tree) = tree {
            let mut out = write_ref_tree(tree, &self.model, BufWriter::new(temp.as_file()))?;
            out.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn recall(&self, state: &mut State, version: Version) -> Result<ChangeBuffer> {
        let current = self.current_locked(state)?;
        let tree: Arc<dyn RefTree> = state.store.tree()?;
        let mut buffer = ChangeBuffer::new(tree, self.model.clone())?;
        if version == CURRENT_VERSION || version == current {
            return Ok(buffer);
        }
        let history = self.history_locked(state)?;
        let dir = match &self.history_dir {
            Some(dir) if history.contains(version) => dir,
            _ => return Err(Error::NoSuchVersion(version)),
        };

        let started = Instant::now();
        for v in (version..current).rev() {
            let path = delta_path(dir, v);
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    error!(delta = %path.display(), "delta missing from history");
                    return Err(Error::NoSuchVersion(v));
                }
                Err(err) => return Err(self.trap.trap("read delta", err)),
            };
            if bytes.is_empty() {
                buffer.clear()?;
                continue;
            }
            let delta = read_ref_tree(&bytes, &self.model)?;
            buffer.apply_delta(&delta).map_err(|e| {
                let e = e.in_delta(v);
                if let Error::BrokenRepository { version, key } = &e {
                    error!(version, %key, "delta references a missing node");
                }
                e
            })?;
        }
        info!(
            version,
            from = current,
            overlay = buffer.overlay_len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "recalled version"
        );
        Ok(buffer)
    }

    fn trapped(&self, operation: &str, err: Error) -> Error {
        match err {
            Error::Io(io) => self.trap.trap(operation, io),
            other => other,
        }
    }
}
