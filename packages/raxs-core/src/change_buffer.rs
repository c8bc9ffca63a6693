//! Copy-on-write editing layer over a read-only tree.
//!
//! The buffer keeps an overlay of the nodes it has touched. An overlay node is
//! either `Backed` (its whole subtree is still the backing tree's) or
//! `Expanded` (its children are listed explicitly, its content is either the
//! backing node's or an explicit replacement). A backing node that is not in
//! the overlay is visible exactly when its nearest overlay ancestor is
//! `Backed`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::key::Key;
use crate::model::{Content, KeyKind, TreeModel};
use crate::traits::{MutableRefTree, Position, RefTree};
use crate::tree::{MemTree, Payload, RefNode};

/// Identifies the editable checkout a buffer was handed out as.
pub type SessionId = u64;

/// Held by the editable buffer of a store. The store sees the session as
/// active until every handle is dropped.
#[derive(Debug)]
pub struct SessionToken {
    id: SessionId,
}

impl SessionToken {
    pub(crate) fn new(id: SessionId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }
}

#[derive(Clone, Debug)]
struct Slot {
    parent: Option<Key>,
    state: SlotState,
}

#[derive(Clone, Debug)]
enum SlotState {
    Backed,
    Expanded {
        content: Option<Content>,
        children: Vec<Key>,
    },
}

enum Located<'a> {
    Overlay(&'a Slot),
    Backing,
}

pub struct ChangeBuffer {
    backing: Arc<dyn RefTree>,
    model: Arc<TreeModel>,
    slots: HashMap<Key, Slot>,
    root: Option<Key>,
    deleted: HashSet<Key>,
    next_transient: u64,
    session: Option<Arc<SessionToken>>,
}

impl std::fmt::Debug for ChangeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeBuffer")
            .field("model", &self.model.name())
            .field("root", &self.root)
            .field("overlay", &self.slots.len())
            .field("session", &self.session())
            .finish()
    }
}

impl ChangeBuffer {
    /// A buffer whose view starts out identical to `backing`.
    pub fn new(backing: Arc<dyn RefTree>, model: Arc<TreeModel>) -> Result<Self> {
        let mut buffer = Self {
            backing,
            model,
            slots: HashMap::new(),
            root: None,
            deleted: HashSet::new(),
            next_transient: 0,
            session: None,
        };
        buffer.reset()?;
        Ok(buffer)
    }

    pub fn model(&self) -> &Arc<TreeModel> {
        &self.model
    }

    pub fn backing(&self) -> &Arc<dyn RefTree> {
        &self.backing
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session.as_ref().map(|token| token.id())
    }

    pub(crate) fn set_session(&mut self, session: Option<Arc<SessionToken>>) {
        self.session = session;
    }

    /// Number of nodes held in the overlay.
    pub fn overlay_len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the view differs structurally from the backing tree.
    pub fn has_changes(&self) -> Result<bool> {
        let backing_root = self.backing.root()?;
        Ok(match (&self.root, &backing_root) {
            (None, None) => false,
            (Some(root), Some(b)) if root == b => !self.matches_backing(root)?,
            _ => true,
        })
    }

    /// Drops every edit.
    pub fn reset(&mut self) -> Result<()> {
        self.slots.clear();
        self.deleted.clear();
        self.root = self.backing.root()?;
        if let Some(root) = &self.root {
            self.slots.insert(
                root.clone(),
                Slot {
                    parent: None,
                    state: SlotState::Backed,
                },
            );
        }
        Ok(())
    }

    /// Points the buffer at a new backing tree and drops every edit.
    pub fn rebase(&mut self, backing: Arc<dyn RefTree>) -> Result<()> {
        self.backing = backing;
        self.reset()
    }

    /// Empties the view.
    pub fn clear(&mut self) -> Result<()> {
        self.slots.clear();
        self.deleted.clear();
        self.root = None;
        if let Some(root) = self.backing.root()? {
            self.deleted.insert(root);
        }
        Ok(())
    }

    /// The view expressed against the backing tree: subtrees equal to the
    /// backing's as tree references, expanded nodes with unchanged content
    /// as node references, everything else as explicit content.
    pub fn change_tree(&self) -> Result<MemTree> {
        let mut out = MemTree::new();
        if let Some(root) = &self.root {
            self.emit_change(root, None, &mut out)?;
        }
        Ok(out)
    }

    fn emit_change(&self, key: &Key, parent: Option<&Key>, out: &mut MemTree) -> Result<()> {
        let slot = self
            .slots
            .get(key)
            .ok_or_else(|| Error::IllegalState(format!("overlay lost node {key}")))?;
        let SlotState::Expanded { content, children } = &slot.state else {
            return out.add(parent, Position::Append, key.clone(), Payload::TreeRef(key.clone()));
        };
        if self.matches_backing(key)? {
            return out.add(parent, Position::Append, key.clone(), Payload::TreeRef(key.clone()));
        }
        let payload = match content {
            Some(content) => Payload::Content(content.clone()),
            None => Payload::NodeRef(key.clone()),
        };
        out.add(parent, Position::Append, key.clone(), payload)?;
        for child in children {
            self.emit_change(child, Some(key), out)?;
        }
        Ok(())
    }

    /// Whether the view subtree at `key` is the backing subtree, which holds
    /// after edits that cancel out.
    fn matches_backing(&self, key: &Key) -> Result<bool> {
        let Some(slot) = self.slots.get(key) else {
            return Ok(false);
        };
        let SlotState::Expanded { content, children } = &slot.state else {
            return Ok(true);
        };
        if !self.backing.contains(key)? || self.backing.children(key)? != *children {
            return Ok(false);
        }
        if let Some(content) = content {
            if self.backing.content(key)? != *content {
                return Ok(false);
            }
        }
        for child in children {
            if !self.matches_backing(child)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Replaces the view with `tree`, whose references name nodes of the
    /// current view by key. Tree references keep the referenced view subtree
    /// as it is, edits included.
    pub fn apply(&mut self, tree: &dyn RefTree) -> Result<()> {
        let Some(root) = tree.root()? else {
            return self.clear();
        };
        let mut next = HashMap::new();
        let new_root = self.graft(tree, &root, None, &mut next)?;
        debug!(
            before = self.slots.len(),
            after = next.len(),
            "applied reference tree to change buffer"
        );
        self.slots = next;
        self.root = Some(new_root);
        self.deleted.clear();
        Ok(())
    }

    /// Like [`ChangeBuffer::apply`], for trees whose references are child-index
    /// paths into the current view and whose own keys carry no identity.
    pub fn apply_positional(&mut self, tree: &dyn RefTree) -> Result<()> {
        let mut rekeyed = MemTree::new();
        if let Some(root) = tree.root()? {
            self.rekey_positional(tree, &root, None, &mut rekeyed)?;
        }
        self.apply(&rekeyed)
    }

    /// Applies a reference tree using the addressing of this buffer's model.
    pub fn apply_delta(&mut self, tree: &dyn RefTree) -> Result<()> {
        match self.model.key_kind() {
            KeyKind::Positional => self.apply_positional(tree),
            KeyKind::Identified => self.apply(tree),
        }
    }

    fn rekey_positional(
        &mut self,
        tree: &dyn RefTree,
        key: &Key,
        parent: Option<&Key>,
        out: &mut MemTree,
    ) -> Result<()> {
        let node = tree.node(key)?;
        let (new_key, payload) = match node.payload {
            Payload::TreeRef(target) => {
                let resolved = self.resolve_view_path(&target)?;
                (resolved.clone(), Payload::TreeRef(resolved))
            }
            Payload::NodeRef(target) => {
                let resolved = self.resolve_view_path(&target)?;
                (resolved.clone(), Payload::NodeRef(resolved))
            }
            Payload::Content(content) => (self.allocate(), Payload::Content(content)),
        };
        out.add(parent, Position::Append, new_key.clone(), payload)?;
        for child in &node.children {
            self.rekey_positional(tree, child, Some(&new_key), out)?;
        }
        Ok(())
    }

    /// Key of the view node at a child-index path.
    pub fn resolve_view_path(&self, target: &Key) -> Result<Key> {
        let path = target.as_path().ok_or_else(|| {
            Error::InvalidOperation(format!("expected a positional key, got {target}"))
        })?;
        let mut current = self
            .root
            .clone()
            .ok_or_else(|| Error::NodeNotFound(target.clone()))?;
        for &index in path.components() {
            let children = self.view_children(&current)?;
            current = children
                .get(index as usize)
                .cloned()
                .ok_or_else(|| Error::NodeNotFound(target.clone()))?;
        }
        Ok(current)
    }

    fn graft(
        &self,
        tree: &dyn RefTree,
        key: &Key,
        parent: Option<&Key>,
        next: &mut HashMap<Key, Slot>,
    ) -> Result<Key> {
        let node = tree.node(key)?;
        match node.payload {
            Payload::TreeRef(target) => {
                self.require(&target)?;
                self.copy_view(&target, parent, next)?;
                Ok(target)
            }
            Payload::NodeRef(target) => {
                self.require(&target)?;
                let content = match self.slots.get(&target).map(|s| &s.state) {
                    Some(SlotState::Expanded { content, .. }) => content.clone(),
                    _ => None,
                };
                let mut children = Vec::with_capacity(node.children.len());
                for child in &node.children {
                    children.push(self.graft(tree, child, Some(&target), next)?);
                }
                claim(
                    next,
                    target.clone(),
                    Slot {
                        parent: parent.cloned(),
                        state: SlotState::Expanded { content, children },
                    },
                )?;
                Ok(target)
            }
            Payload::Content(content) => {
                let mut children = Vec::with_capacity(node.children.len());
                for child in &node.children {
                    children.push(self.graft(tree, child, Some(&node.key), next)?);
                }
                claim(
                    next,
                    node.key.clone(),
                    Slot {
                        parent: parent.cloned(),
                        state: SlotState::Expanded {
                            content: Some(content),
                            children,
                        },
                    },
                )?;
                Ok(node.key)
            }
        }
    }

    fn copy_view(&self, key: &Key, parent: Option<&Key>, next: &mut HashMap<Key, Slot>) -> Result<()> {
        let state = match self.slots.get(key) {
            Some(Slot {
                state: SlotState::Expanded { content, children },
                ..
            }) => {
                for child in children {
                    self.copy_view(child, Some(key), next)?;
                }
                SlotState::Expanded {
                    content: content.clone(),
                    children: children.clone(),
                }
            }
            _ => SlotState::Backed,
        };
        claim(
            next,
            key.clone(),
            Slot {
                parent: parent.cloned(),
                state,
            },
        )
    }

    fn allocate(&mut self) -> Key {
        loop {
            self.next_transient += 1;
            let key = Key::Transient(self.next_transient);
            if !self.slots.contains_key(&key) {
                return key;
            }
        }
    }

    fn locate(&self, key: &Key) -> Result<Option<Located<'_>>> {
        if let Some(slot) = self.slots.get(key) {
            return Ok(Some(Located::Overlay(slot)));
        }
        if key.is_transient() || self.deleted.contains(key) || !self.backing.contains(key)? {
            return Ok(None);
        }
        let mut cursor = self.backing.parent(key)?;
        while let Some(ancestor) = cursor {
            if let Some(slot) = self.slots.get(&ancestor) {
                return Ok(matches!(slot.state, SlotState::Backed).then_some(Located::Backing));
            }
            if self.deleted.contains(&ancestor) {
                return Ok(None);
            }
            cursor = self.backing.parent(&ancestor)?;
        }
        Ok(None)
    }

    fn require(&self, key: &Key) -> Result<Located<'_>> {
        self.locate(key)?
            .ok_or_else(|| Error::NodeNotFound(key.clone()))
    }

    fn view_parent(&self, key: &Key) -> Result<Option<Key>> {
        match self.require(key)? {
            Located::Overlay(slot) => Ok(slot.parent.clone()),
            Located::Backing => self.backing.parent(key),
        }
    }

    fn view_children(&self, key: &Key) -> Result<Vec<Key>> {
        match self.require(key)? {
            Located::Overlay(Slot {
                state: SlotState::Expanded { children, .. },
                ..
            }) => Ok(children.clone()),
            _ => self.backing.children(key),
        }
    }

    fn view_content(&self, key: &Key) -> Result<Content> {
        match self.require(key)? {
            Located::Overlay(Slot {
                state:
                    SlotState::Expanded {
                        content: Some(content),
                        ..
                    },
                ..
            }) => Ok(content.clone()),
            _ => self.backing.content(key),
        }
    }

    /// Brings a visible node into the overlay, expanding its ancestors.
    fn ensure_slot(&mut self, key: &Key) -> Result<()> {
        if self.slots.contains_key(key) {
            return Ok(());
        }
        self.require(key)?;
        let mut chain = vec![key.clone()];
        let mut cursor = self.backing.parent(key)?;
        let top = loop {
            let ancestor = cursor.ok_or_else(|| Error::NodeNotFound(key.clone()))?;
            if self.slots.contains_key(&ancestor) {
                break ancestor;
            }
            cursor = self.backing.parent(&ancestor)?;
            chain.push(ancestor);
        };
        self.expand_children(&top)?;
        for ancestor in chain.iter().skip(1).rev() {
            self.expand_children(ancestor)?;
        }
        Ok(())
    }

    /// Lists the children of an overlay node explicitly.
    fn expand_children(&mut self, key: &Key) -> Result<()> {
        let is_backed = match self.slots.get(key) {
            Some(slot) => matches!(slot.state, SlotState::Backed),
            None => return Err(Error::NodeNotFound(key.clone())),
        };
        if !is_backed {
            return Ok(());
        }
        let children = self.backing.children(key)?;
        for child in &children {
            self.slots.insert(
                child.clone(),
                Slot {
                    parent: Some(key.clone()),
                    state: SlotState::Backed,
                },
            );
        }
        if let Some(slot) = self.slots.get_mut(key) {
            slot.state = SlotState::Expanded {
                content: None,
                children,
            };
        }
        Ok(())
    }

    fn children_mut(&mut self, key: &Key) -> Result<&mut Vec<Key>> {
        match self.slots.get_mut(key).map(|s| &mut s.state) {
            Some(SlotState::Expanded { children, .. }) => Ok(children),
            _ => Err(Error::IllegalState(format!("node {key} is not expanded"))),
        }
    }

    fn remove_overlay_subtree(&mut self, key: &Key) {
        let mut stack = vec![key.clone()];
        while let Some(k) = stack.pop() {
            if let Some(Slot {
                state: SlotState::Expanded { children, .. },
                ..
            }) = self.slots.remove(&k)
            {
                stack.extend(children);
            }
        }
    }

    /// Picks the key of a new node and checks it is free.
    fn new_key(&mut self, key: Option<Key>, content: &Content) -> Result<Key> {
        let key = match key.or_else(|| self.model.identification().identify(content)) {
            Some(key) => key,
            None => match self.model.key_kind() {
                KeyKind::Positional => self.allocate(),
                KeyKind::Identified => {
                    return Err(Error::InvalidOperation(
                        "content carries no id and no key was given".into(),
                    ))
                }
            },
        };
        if self.locate(&key)?.is_some() {
            return Err(Error::InvalidOperation(format!("key {key} already exists")));
        }
        Ok(key)
    }

    fn prepare_content(&self, key: &Key, content: Content) -> Result<Content> {
        let content = self.model.identification().stamp(key, content);
        self.model.codec().encode(key, &content)?;
        Ok(content)
    }

    fn require_container(&self, key: &Key) -> Result<()> {
        if self.view_content(key)?.is_container() {
            Ok(())
        } else {
            Err(Error::InvalidOperation(format!("node {key} cannot have children")))
        }
    }
}

fn claim(next: &mut HashMap<Key, Slot>, key: Key, slot: Slot) -> Result<()> {
    if next.contains_key(&key) {
        return Err(Error::InvalidOperation(format!(
            "node {key} appears twice in reference tree"
        )));
    }
    next.insert(key, slot);
    Ok(())
}

impl RefTree for ChangeBuffer {
    fn root(&self) -> Result<Option<Key>> {
        Ok(self.root.clone())
    }

    fn node(&self, key: &Key) -> Result<RefNode> {
        Ok(RefNode {
            key: key.clone(),
            parent: self.view_parent(key)?,
            payload: Payload::Content(self.view_content(key)?),
            children: self.view_children(key)?,
        })
    }

    fn contains(&self, key: &Key) -> Result<bool> {
        Ok(self.locate(key)?.is_some())
    }

    fn parent(&self, key: &Key) -> Result<Option<Key>> {
        self.view_parent(key)
    }

    fn children(&self, key: &Key) -> Result<Vec<Key>> {
        self.view_children(key)
    }

    fn content(&self, key: &Key) -> Result<Content> {
        self.view_content(key)
    }
}

impl MutableRefTree for ChangeBuffer {
    fn insert(
        &mut self,
        parent: &Key,
        position: Position,
        key: Option<Key>,
        content: Content,
    ) -> Result<Key> {
        self.require(parent)?;
        self.require_container(parent)?;
        let key = self.new_key(key, &content)?;
        let content = self.prepare_content(&key, content)?;
        self.ensure_slot(parent)?;
        self.expand_children(parent)?;
        let siblings = self.children_mut(parent)?;
        let index = position.resolve(siblings.len());
        siblings.insert(index, key.clone());
        self.slots.insert(
            key.clone(),
            Slot {
                parent: Some(parent.clone()),
                state: SlotState::Expanded {
                    content: Some(content),
                    children: Vec::new(),
                },
            },
        );
        self.deleted.remove(&key);
        debug!(%key, %parent, index, "inserted node");
        Ok(key)
    }

    fn insert_root(&mut self, key: Option<Key>, content: Content) -> Result<Key> {
        if self.root.is_some() {
            return Err(Error::InvalidOperation("tree already has a root".into()));
        }
        let key = self.new_key(key, &content)?;
        let content = self.prepare_content(&key, content)?;
        self.slots.insert(
            key.clone(),
            Slot {
                parent: None,
                state: SlotState::Expanded {
                    content: Some(content),
                    children: Vec::new(),
                },
            },
        );
        self.deleted.remove(&key);
        self.root = Some(key.clone());
        Ok(key)
    }

    fn delete(&mut self, key: &Key) -> Result<()> {
        self.require(key)?;
        if self.root.as_ref() == Some(key) {
            return Err(Error::InvalidOperation("cannot delete the root".into()));
        }
        self.ensure_slot(key)?;
        let parent = self.slots.get(key).and_then(|s| s.parent.clone());
        if let Some(parent) = parent {
            self.children_mut(&parent)?.retain(|c| c != key);
        }
        self.remove_overlay_subtree(key);
        self.deleted.insert(key.clone());
        debug!(%key, "deleted node");
        Ok(())
    }

    fn move_node(&mut self, key: &Key, new_parent: &Key, position: Position) -> Result<()> {
        self.require(key)?;
        self.require(new_parent)?;
        if self.root.as_ref() == Some(key) {
            return Err(Error::InvalidOperation("cannot move the root".into()));
        }
        let mut cursor = Some(new_parent.clone());
        while let Some(current) = cursor {
            if &current == key {
                return Err(Error::InvalidOperation(format!(
                    "moving {key} under {new_parent} would create a cycle"
                )));
            }
            cursor = self.view_parent(&current)?;
        }
        self.require_container(new_parent)?;

        self.ensure_slot(new_parent)?;
        self.expand_children(new_parent)?;
        self.ensure_slot(key)?;
        let old_parent = self.slots.get(key).and_then(|s| s.parent.clone());
        if let Some(old_parent) = old_parent {
            self.children_mut(&old_parent)?.retain(|c| c != key);
        }
        let siblings = self.children_mut(new_parent)?;
        let index = position.resolve(siblings.len());
        siblings.insert(index, key.clone());
        if let Some(slot) = self.slots.get_mut(key) {
            slot.parent = Some(new_parent.clone());
        }
        debug!(%key, %new_parent, index, "moved node");
        Ok(())
    }

    fn update(&mut self, key: &Key, content: Content) -> Result<bool> {
        self.require(key)?;
        let content = self.prepare_content(key, content)?;
        if self.view_content(key)? == content {
            return Ok(false);
        }
        if !content.is_container() && !self.view_children(key)?.is_empty() {
            return Err(Error::InvalidOperation(format!(
                "node {key} has children and cannot become a leaf"
            )));
        }
        let same_as_backing =
            self.backing.contains(key)? && self.backing.content(key)? == content;
        self.ensure_slot(key)?;
        self.expand_children(key)?;
        if let Some(Slot {
            state: SlotState::Expanded { content: slot, .. },
            ..
        }) = self.slots.get_mut(key)
        {
            *slot = if same_as_backing { None } else { Some(content) };
        }
        debug!(%key, "updated node");
        Ok(true)
    }
}
