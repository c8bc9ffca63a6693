use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::key::{DeweyKey, Key};
use crate::model::{Content, KeyKind};
use crate::traits::{MutableRefTree, Position, RefTree};

/// What a node of a reference tree stands for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// Explicit content.
    Content(Content),
    /// The content of `key` in the referenced tree; children are explicit.
    NodeRef(Key),
    /// The whole subtree rooted at `key` in the referenced tree.
    TreeRef(Key),
}

impl Payload {
    pub fn target(&self) -> Option<&Key> {
        match self {
            Payload::NodeRef(key) | Payload::TreeRef(key) => Some(key),
            Payload::Content(_) => None,
        }
    }

    pub fn is_tree_ref(&self) -> bool {
        matches!(self, Payload::TreeRef(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefNode {
    pub key: Key,
    pub parent: Option<Key>,
    pub payload: Payload,
    pub children: Vec<Key>,
}

#[derive(Clone, Debug)]
struct MemNode {
    parent: Option<Key>,
    payload: Payload,
    children: Vec<Key>,
}

/// In-memory reference tree: an arena of nodes keyed by [`Key`].
#[derive(Clone, Debug, Default)]
pub struct MemTree {
    nodes: HashMap<Key, MemNode>,
    root: Option<Key>,
    next_transient: u64,
}

impl MemTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tree that is a single reference to the whole of another tree.
    pub fn tree_ref(key: Key) -> Self {
        let mut tree = Self::new();
        tree.nodes.insert(
            key.clone(),
            MemNode {
                parent: None,
                payload: Payload::TreeRef(key.clone()),
                children: Vec::new(),
            },
        );
        tree.root = Some(key);
        tree
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn root_key(&self) -> Option<&Key> {
        self.root.as_ref()
    }

    /// Adds a node. With no parent the node becomes the root of an empty tree.
    pub fn add(
        &mut self,
        parent: Option<&Key>,
        position: Position,
        key: Key,
        payload: Payload,
    ) -> Result<()> {
        if self.nodes.contains_key(&key) {
            return Err(Error::InvalidOperation(format!("duplicate key {key}")));
        }
        match parent {
            None => {
                if self.root.is_some() {
                    return Err(Error::InvalidOperation("tree already has a root".into()));
                }
                self.root = Some(key.clone());
            }
            Some(parent) => {
                let siblings = &mut self
                    .nodes
                    .get_mut(parent)
                    .ok_or_else(|| Error::NodeNotFound(parent.clone()))?
                    .children;
                let index = position.resolve(siblings.len());
                siblings.insert(index, key.clone());
            }
        }
        self.nodes.insert(
            key,
            MemNode {
                parent: parent.cloned(),
                payload,
                children: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn set_payload(&mut self, key: &Key, payload: Payload) -> Result<()> {
        let node = self
            .nodes
            .get_mut(key)
            .ok_or_else(|| Error::NodeNotFound(key.clone()))?;
        node.payload = payload;
        Ok(())
    }

    /// Pre-order walk from the root.
    pub fn keys(&self) -> Vec<Key> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<&Key> = self.root.iter().collect();
        while let Some(key) = stack.pop() {
            out.push(key.clone());
            if let Some(node) = self.nodes.get(key) {
                stack.extend(node.children.iter().rev());
            }
        }
        out
    }

    fn allocate(&mut self) -> Key {
        loop {
            self.next_transient += 1;
            let key = Key::Transient(self.next_transient);
            if !self.nodes.contains_key(&key) {
                return key;
            }
        }
    }

    fn detach(&mut self, key: &Key) {
        let parent = self.nodes.get(key).and_then(|n| n.parent.clone());
        if let Some(parent) = parent {
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.children.retain(|c| c != key);
            }
        }
    }

    fn remove_subtree(&mut self, key: &Key) {
        let mut stack = vec![key.clone()];
        while let Some(k) = stack.pop() {
            if let Some(node) = self.nodes.remove(&k) {
                stack.extend(node.children);
            }
        }
    }

    fn introduces_cycle(&self, key: &Key, new_parent: &Key) -> bool {
        let mut cursor = Some(new_parent.clone());
        while let Some(current) = cursor {
            if &current == key {
                return true;
            }
            cursor = self.nodes.get(&current).and_then(|n| n.parent.clone());
        }
        false
    }

    /// Checks parent/child consistency, reachability and acyclicity.
    /// Intended for tests and debugging.
    pub fn validate_invariants(&self) -> Result<()> {
        for (key, node) in &self.nodes {
            let mut seen = HashSet::new();
            for child in &node.children {
                if !seen.insert(child) {
                    return Err(Error::InvalidOperation("duplicate child entry".into()));
                }
                match self.nodes.get(child) {
                    Some(c) if c.parent.as_ref() == Some(key) => {}
                    Some(_) => return Err(Error::InvalidOperation("child parent mismatch".into())),
                    None => {
                        return Err(Error::InvalidOperation("child not present in nodes".into()))
                    }
                }
            }
        }
        if self.keys().len() != self.nodes.len() {
            return Err(Error::InvalidOperation("unreachable nodes".into()));
        }
        Ok(())
    }
}

impl RefTree for MemTree {
    fn root(&self) -> Result<Option<Key>> {
        Ok(self.root.clone())
    }

    fn node(&self, key: &Key) -> Result<RefNode> {
        let node = self
            .nodes
            .get(key)
            .ok_or_else(|| Error::NodeNotFound(key.clone()))?;
        Ok(RefNode {
            key: key.clone(),
            parent: node.parent.clone(),
            payload: node.payload.clone(),
            children: node.children.clone(),
        })
    }

    fn contains(&self, key: &Key) -> Result<bool> {
        Ok(self.nodes.contains_key(key))
    }

    fn parent(&self, key: &Key) -> Result<Option<Key>> {
        self.nodes
            .get(key)
            .map(|n| n.parent.clone())
            .ok_or_else(|| Error::NodeNotFound(key.clone()))
    }

    fn children(&self, key: &Key) -> Result<Vec<Key>> {
        self.nodes
            .get(key)
            .map(|n| n.children.clone())
            .ok_or_else(|| Error::NodeNotFound(key.clone()))
    }

    fn payload(&self, key: &Key) -> Result<Payload> {
        self.nodes
            .get(key)
            .map(|n| n.payload.clone())
            .ok_or_else(|| Error::NodeNotFound(key.clone()))
    }
}

impl MutableRefTree for MemTree {
    fn insert(
        &mut self,
        parent: &Key,
        position: Position,
        key: Option<Key>,
        content: Content,
    ) -> Result<Key> {
        let key = match key {
            Some(key) => key,
            None => self.allocate(),
        };
        self.add(Some(parent), position, key.clone(), Payload::Content(content))?;
        Ok(key)
    }

    fn insert_root(&mut self, key: Option<Key>, content: Content) -> Result<Key> {
        let key = match key {
            Some(key) => key,
            None => self.allocate(),
        };
        self.add(None, Position::Append, key.clone(), Payload::Content(content))?;
        Ok(key)
    }

    fn delete(&mut self, key: &Key) -> Result<()> {
        if !self.nodes.contains_key(key) {
            return Err(Error::NodeNotFound(key.clone()));
        }
        if self.root.as_ref() == Some(key) {
            return Err(Error::InvalidOperation("cannot delete the root".into()));
        }
        self.detach(key);
        self.remove_subtree(key);
        Ok(())
    }

    fn move_node(&mut self, key: &Key, new_parent: &Key, position: Position) -> Result<()> {
        for k in [key, new_parent] {
            if !self.nodes.contains_key(k) {
                return Err(Error::NodeNotFound(k.clone()));
            }
        }
        if self.root.as_ref() == Some(key) {
            return Err(Error::InvalidOperation("cannot move the root".into()));
        }
        if self.introduces_cycle(key, new_parent) {
            return Err(Error::InvalidOperation(format!(
                "moving {key} under {new_parent} would create a cycle"
            )));
        }
        self.detach(key);
        if let Some(parent) = self.nodes.get_mut(new_parent) {
            let index = position.resolve(parent.children.len());
            parent.children.insert(index, key.clone());
        }
        if let Some(node) = self.nodes.get_mut(key) {
            node.parent = Some(new_parent.clone());
        }
        Ok(())
    }

    fn update(&mut self, key: &Key, content: Content) -> Result<bool> {
        let node = self
            .nodes
            .get_mut(key)
            .ok_or_else(|| Error::NodeNotFound(key.clone()))?;
        if node.payload == Payload::Content(content.clone()) {
            return Ok(false);
        }
        node.payload = Payload::Content(content);
        Ok(true)
    }
}

/// Key-free structural image of a fully resolved tree, for equality checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub content: Content,
    pub children: Vec<NodeSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TreeSnapshot {
    pub root: Option<NodeSnapshot>,
}

impl TreeSnapshot {
    pub fn node_count(&self) -> usize {
        fn count(node: &NodeSnapshot) -> usize {
            1 + node.children.iter().map(count).sum::<usize>()
        }
        self.root.as_ref().map(count).unwrap_or(0)
    }
}

/// Captures the content and shape of `tree`. Fails on reference payloads.
pub fn snapshot(tree: &dyn RefTree) -> Result<TreeSnapshot> {
    fn walk(tree: &dyn RefTree, key: &Key) -> Result<NodeSnapshot> {
        let node = tree.node(key)?;
        let content = match node.payload {
            Payload::Content(content) => content,
            other => {
                return Err(Error::InvalidOperation(format!(
                    "cannot snapshot unresolved reference {other:?}"
                )))
            }
        };
        let children = node
            .children
            .iter()
            .map(|child| walk(tree, child))
            .collect::<Result<Vec<_>>>()?;
        Ok(NodeSnapshot { content, children })
    }
    match tree.root()? {
        Some(root) => Ok(TreeSnapshot {
            root: Some(walk(tree, &root)?),
        }),
        None => Ok(TreeSnapshot::default()),
    }
}

/// Resolves every reference in `tree` against `base`, yielding a tree of
/// explicit content. Positional output is re-keyed by position.
pub fn materialize(tree: &dyn RefTree, base: &dyn RefTree, kind: KeyKind) -> Result<MemTree> {
    let mut out = MemTree::new();
    if let Some(root) = tree.root()? {
        let key = match kind {
            KeyKind::Positional => Key::Path(DeweyKey::root()),
            KeyKind::Identified => root.clone(),
        };
        materialize_node(tree, base, kind, &root, None, key, &mut out)?;
    }
    Ok(out)
}

fn materialize_node(
    tree: &dyn RefTree,
    base: &dyn RefTree,
    kind: KeyKind,
    key: &Key,
    parent: Option<&Key>,
    out_key: Key,
    out: &mut MemTree,
) -> Result<()> {
    let node = tree.node(key)?;
    match node.payload {
        Payload::TreeRef(target) => return copy_subtree(base, kind, &target, parent, out_key, out),
        Payload::NodeRef(target) => {
            let content = base.content(&target)?;
            out.add(parent, Position::Append, out_key.clone(), Payload::Content(content))?;
        }
        Payload::Content(content) => {
            out.add(parent, Position::Append, out_key.clone(), Payload::Content(content))?;
        }
    }
    for (i, child) in node.children.iter().enumerate() {
        let child_key = out_child_key(kind, &out_key, i, child);
        materialize_node(tree, base, kind, child, Some(&out_key), child_key, out)?;
    }
    Ok(())
}

fn copy_subtree(
    base: &dyn RefTree,
    kind: KeyKind,
    key: &Key,
    parent: Option<&Key>,
    out_key: Key,
    out: &mut MemTree,
) -> Result<()> {
    let node = base.node(key)?;
    let content = match node.payload {
        Payload::Content(content) => content,
        other => {
            return Err(Error::InvalidOperation(format!(
                "base tree node {key} is a reference {other:?}"
            )))
        }
    };
    out.add(parent, Position::Append, out_key.clone(), Payload::Content(content))?;
    for (i, child) in node.children.iter().enumerate() {
        let child_key = out_child_key(kind, &out_key, i, child);
        copy_subtree(base, kind, child, Some(&out_key), child_key, out)?;
    }
    Ok(())
}

fn out_child_key(kind: KeyKind, parent: &Key, index: usize, key: &Key) -> Key {
    match (kind, parent) {
        (KeyKind::Positional, Key::Path(path)) => Key::Path(path.child(index as u32)),
        _ => key.clone(),
    }
}
