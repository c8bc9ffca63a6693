//! Reference-tree algebra: inverting a change tree so the old tree refers to
//! the new one, and composing two levels of references into one.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::key::Key;
use crate::model::KeyKind;
use crate::traits::{Position, RefTree};
use crate::tree::{MemTree, Payload};

#[derive(Clone, Debug)]
struct Share {
    whole_tree: bool,
    key: Key,
}

/// Key a node of `changes` will have once the tree is written out: its
/// position for positional models, otherwise its id.
fn written_key(kind: KeyKind, node_key: &Key, payload: &Payload, position: &Key) -> Key {
    match (kind, payload) {
        (KeyKind::Positional, _) => position.clone(),
        (KeyKind::Identified, Payload::TreeRef(target)) => target.clone(),
        (KeyKind::Identified, _) => node_key.clone(),
    }
}

/// Base keys referenced from `changes`, mapped to the key the referring node
/// has in the tree `changes` describes.
fn shared_targets(changes: &dyn RefTree, kind: KeyKind) -> Result<HashMap<Key, Share>> {
    let mut shares = HashMap::new();
    let Some(root) = changes.root()? else {
        return Ok(shares);
    };
    let mut stack = vec![(root, Key::root_path())];
    while let Some((key, position)) = stack.pop() {
        let node = changes.node(&key)?;
        let new_key = written_key(kind, &node.key, &node.payload, &position);
        let (target, whole_tree) = match &node.payload {
            Payload::TreeRef(target) => (Some(target), true),
            Payload::NodeRef(target) => (Some(target), false),
            Payload::Content(_) => (None, false),
        };
        if let Some(target) = target {
            let share = Share {
                whole_tree,
                key: new_key,
            };
            if shares.insert(target.clone(), share).is_some() {
                return Err(Error::InvalidOperation(format!(
                    "node {target} is referenced more than once"
                )));
            }
            if whole_tree {
                continue;
            }
        }
        for (i, child) in node.children.iter().enumerate() {
            let child_position = match &position {
                Key::Path(path) => Key::Path(path.child(i as u32)),
                other => other.clone(),
            };
            stack.push((child.clone(), child_position));
        }
    }
    Ok(shares)
}

/// Given `changes`, a tree expressed with references into `base`, returns
/// `base` expressed with references into the tree `changes` describes.
/// Only nodes the new tree does not share come out as explicit content.
pub fn reverse_ref_tree(base: &dyn RefTree, changes: &dyn RefTree, kind: KeyKind) -> Result<MemTree> {
    let shares = shared_targets(changes, kind)?;
    let mut out = MemTree::new();
    if let Some(root) = base.root()? {
        reverse_node(base, &shares, &root, None, &mut out)?;
    }
    Ok(out)
}

fn reverse_node(
    base: &dyn RefTree,
    shares: &HashMap<Key, Share>,
    key: &Key,
    parent: Option<&Key>,
    out: &mut MemTree,
) -> Result<()> {
    let payload = match shares.get(key) {
        Some(share) if share.whole_tree => {
            return out.add(parent, Position::Append, key.clone(), Payload::TreeRef(share.key.clone()));
        }
        Some(share) => Payload::NodeRef(share.key.clone()),
        None => Payload::Content(base.content(key)?),
    };
    out.add(parent, Position::Append, key.clone(), payload)?;
    for child in base.children(key)? {
        reverse_node(base, shares, &child, Some(key), out)?;
    }
    Ok(())
}

/// Composes `x_refs_c` (a tree X referring into C) with `c_refs_y` (C
/// referring into Y) into X referring into Y. References into C that Y does
/// not share are expanded from `c`.
pub fn combine(
    x_refs_c: &dyn RefTree,
    c_refs_y: &dyn RefTree,
    c: &dyn RefTree,
    kind: KeyKind,
) -> Result<MemTree> {
    let mut combiner = Combiner {
        refs: c_refs_y,
        base: c,
        kind,
        out: MemTree::new(),
    };
    if let Some(root) = x_refs_c.root()? {
        let out_key = match kind {
            KeyKind::Positional => Key::root_path(),
            KeyKind::Identified => root.clone(),
        };
        combiner.node(x_refs_c, &root, None, out_key)?;
    }
    Ok(combiner.out)
}

struct Combiner<'a> {
    refs: &'a dyn RefTree,
    base: &'a dyn RefTree,
    kind: KeyKind,
    out: MemTree,
}

impl Combiner<'_> {
    fn child_key(&self, parent: &Key, index: usize, key: &Key) -> Key {
        match (self.kind, parent) {
            (KeyKind::Positional, Key::Path(path)) => Key::Path(path.child(index as u32)),
            _ => key.clone(),
        }
    }

    /// Closest node at or above `key` in C that the reference tree mentions.
    fn lookup(&self, key: &Key) -> Result<Option<(Key, Payload)>> {
        let mut cursor = Some(key.clone());
        while let Some(at) = cursor {
            if self.refs.contains(&at)? {
                let payload = self.refs.payload(&at)?;
                return Ok(Some((at, payload)));
            }
            cursor = self.base.parent(&at)?;
        }
        Ok(None)
    }

    fn tree_share(&self, key: &Key) -> Result<Option<Key>> {
        Ok(match self.lookup(key)? {
            Some((at, Payload::TreeRef(target))) => Some(key.rebase(&at, &target)),
            _ => None,
        })
    }

    fn node_payload(&self, key: &Key) -> Result<Payload> {
        Ok(match self.lookup(key)? {
            Some((at, Payload::TreeRef(target))) => Payload::NodeRef(key.rebase(&at, &target)),
            Some((at, Payload::NodeRef(target))) if at == *key => Payload::NodeRef(target),
            _ => Payload::Content(self.base.content(key)?),
        })
    }

    fn node(&mut self, tree: &dyn RefTree, key: &Key, parent: Option<&Key>, out_key: Key) -> Result<()> {
        let node = tree.node(key)?;
        let payload = match node.payload {
            Payload::TreeRef(target) => return self.tree(&target, parent, out_key),
            Payload::NodeRef(target) => self.node_payload(&target)?,
            content => content,
        };
        self.out.add(parent, Position::Append, out_key.clone(), payload)?;
        for (i, child) in node.children.iter().enumerate() {
            let child_key = self.child_key(&out_key, i, child);
            self.node(tree, child, Some(&out_key), child_key)?;
        }
        Ok(())
    }

    fn tree(&mut self, target: &Key, parent: Option<&Key>, out_key: Key) -> Result<()> {
        if let Some(shared) = self.tree_share(target)? {
            return self
                .out
                .add(parent, Position::Append, out_key, Payload::TreeRef(shared));
        }
        let payload = self.node_payload(target)?;
        self.out.add(parent, Position::Append, out_key.clone(), payload)?;
        for (i, child) in self.base.children(target)?.iter().enumerate() {
            let child_key = self.child_key(&out_key, i, child);
            self.tree(child, Some(&out_key), child_key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Content;
    use crate::traits::MutableRefTree;
    use crate::tree::{materialize, snapshot};

    fn ids_base() -> MemTree {
        let mut tree = MemTree::new();
        let r = tree.insert_root(Some(Key::id("r")), Content::element("r")).unwrap();
        tree.insert(&r, Position::Append, Some(Key::id("a")), Content::element("a"))
            .unwrap();
        tree.insert(&Key::id("a"), Position::Append, Some(Key::id("a1")), Content::element("a1"))
            .unwrap();
        tree.insert(&r, Position::Append, Some(Key::id("b")), Content::element("b"))
            .unwrap();
        tree
    }

    fn add(tree: &mut MemTree, parent: Option<&str>, key: &str, payload: Payload) {
        let parent = parent.map(Key::id);
        tree.add(parent.as_ref(), Position::Append, Key::id(key), payload).unwrap();
    }

    #[test]
    fn reverse_keeps_only_unshared_content() {
        let base = ids_base();
        let mut changes = MemTree::new();
        add(&mut changes, None, "r", Payload::NodeRef(Key::id("r")));
        add(&mut changes, Some("r"), "a", Payload::TreeRef(Key::id("a")));
        add(&mut changes, Some("r"), "c", Payload::Content(Content::element("c")));

        let reversed = reverse_ref_tree(&base, &changes, KeyKind::Identified).unwrap();
        assert_eq!(reversed.len(), 3);
        assert_eq!(reversed.payload(&Key::id("r")).unwrap(), Payload::NodeRef(Key::id("r")));
        assert_eq!(reversed.payload(&Key::id("a")).unwrap(), Payload::TreeRef(Key::id("a")));
        assert_eq!(
            reversed.payload(&Key::id("b")).unwrap(),
            Payload::Content(Content::element("b"))
        );

        let new_tree = materialize(&changes, &base, KeyKind::Identified).unwrap();
        let restored = materialize(&reversed, &new_tree, KeyKind::Identified).unwrap();
        assert_eq!(snapshot(&restored).unwrap(), snapshot(&base).unwrap());
    }

    #[test]
    fn reverse_uses_new_positions() {
        let mut base = MemTree::new();
        let doc = base.insert_root(Some(Key::root_path()), Content::Document).unwrap();
        base.insert(&doc, Position::Append, Some(Key::path(vec![0])), Content::element("r"))
            .unwrap();
        base.insert(&Key::path(vec![0]), Position::Append, Some(Key::path(vec![0, 0])), Content::text("a"))
            .unwrap();
        base.insert(&Key::path(vec![0]), Position::Append, Some(Key::path(vec![0, 1])), Content::element("b"))
            .unwrap();

        // Replace the text and put a new element in front of <b>.
        let mut changes = MemTree::new();
        changes
            .add(None, Position::Append, Key::root_path(), Payload::NodeRef(Key::root_path()))
            .unwrap();
        changes
            .add(Some(&Key::root_path()), Position::Append, Key::path(vec![0]), Payload::NodeRef(Key::path(vec![0])))
            .unwrap();
        for (n, content) in [(1, Content::text("z")), (2, Content::element("new"))] {
            changes
                .add(Some(&Key::path(vec![0])), Position::Append, Key::Transient(n), Payload::Content(content))
                .unwrap();
        }
        changes
            .add(Some(&Key::path(vec![0])), Position::Append, Key::path(vec![0, 1]), Payload::TreeRef(Key::path(vec![0, 1])))
            .unwrap();

        let reversed = reverse_ref_tree(&base, &changes, KeyKind::Positional).unwrap();
        assert_eq!(
            reversed.payload(&Key::path(vec![0, 1])).unwrap(),
            Payload::TreeRef(Key::path(vec![0, 2]))
        );
        let new_tree = materialize(&changes, &base, KeyKind::Positional).unwrap();
        let restored = materialize(&reversed, &new_tree, KeyKind::Positional).unwrap();
        assert_eq!(snapshot(&restored).unwrap(), snapshot(&base).unwrap());
    }

    #[test]
    fn double_reference_is_rejected() {
        let base = ids_base();
        let mut changes = MemTree::new();
        add(&mut changes, None, "r", Payload::NodeRef(Key::id("r")));
        add(&mut changes, Some("r"), "a", Payload::TreeRef(Key::id("b")));
        add(&mut changes, Some("r"), "b", Payload::TreeRef(Key::id("b")));
        assert!(reverse_ref_tree(&base, &changes, KeyKind::Identified).is_err());
    }

    #[test]
    fn combine_resolves_through_middle_tree() {
        let c = ids_base();
        let mut x = MemTree::new();
        add(&mut x, None, "r", Payload::NodeRef(Key::id("r")));
        add(&mut x, Some("r"), "a", Payload::TreeRef(Key::id("a")));
        add(&mut x, Some("r"), "b", Payload::TreeRef(Key::id("b")));
        add(&mut x, Some("r"), "x", Payload::Content(Content::element("x")));

        let mut y = MemTree::new();
        add(&mut y, None, "r", Payload::NodeRef(Key::id("r")));
        add(&mut y, Some("r"), "b", Payload::TreeRef(Key::id("b")));

        let c_refs_y = reverse_ref_tree(&c, &y, KeyKind::Identified).unwrap();
        let x_refs_y = combine(&x, &c_refs_y, &c, KeyKind::Identified).unwrap();
        assert_eq!(x_refs_y.payload(&Key::id("r")).unwrap(), Payload::NodeRef(Key::id("r")));
        assert_eq!(x_refs_y.payload(&Key::id("b")).unwrap(), Payload::TreeRef(Key::id("b")));
        assert_eq!(
            x_refs_y.payload(&Key::id("a1")).unwrap(),
            Payload::Content(Content::element("a1"))
        );

        let y_tree = materialize(&y, &c, KeyKind::Identified).unwrap();
        let x_tree = materialize(&x, &c, KeyKind::Identified).unwrap();
        let resolved = materialize(&x_refs_y, &y_tree, KeyKind::Identified).unwrap();
        assert_eq!(snapshot(&resolved).unwrap(), snapshot(&x_tree).unwrap());
    }

    #[test]
    fn combine_rebases_positions_inside_shared_trees() {
        let mut c = MemTree::new();
        let doc = c.insert_root(Some(Key::root_path()), Content::Document).unwrap();
        c.insert(&doc, Position::Append, Some(Key::path(vec![0])), Content::element("r"))
            .unwrap();
        c.insert(&Key::path(vec![0]), Position::Append, Some(Key::path(vec![0, 0])), Content::element("a"))
            .unwrap();
        c.insert(&Key::path(vec![0, 0]), Position::Append, Some(Key::path(vec![0, 0, 0])), Content::text("t"))
            .unwrap();

        // Y wraps <a> in a new element; X keeps only the text of <a>.
        let mut y = MemTree::new();
        y.add(None, Position::Append, Key::root_path(), Payload::NodeRef(Key::root_path())).unwrap();
        y.add(Some(&Key::root_path()), Position::Append, Key::path(vec![0]), Payload::NodeRef(Key::path(vec![0])))
            .unwrap();
        y.add(Some(&Key::path(vec![0])), Position::Append, Key::Transient(1), Payload::Content(Content::element("w")))
            .unwrap();
        y.add(Some(&Key::Transient(1)), Position::Append, Key::path(vec![0, 0]), Payload::TreeRef(Key::path(vec![0, 0])))
            .unwrap();

        let mut x = MemTree::new();
        x.add(None, Position::Append, Key::root_path(), Payload::NodeRef(Key::root_path())).unwrap();
        x.add(Some(&Key::root_path()), Position::Append, Key::path(vec![0]), Payload::Content(Content::element("q")))
            .unwrap();
        x.add(Some(&Key::path(vec![0])), Position::Append, Key::path(vec![0, 0, 0]), Payload::TreeRef(Key::path(vec![0, 0, 0])))
            .unwrap();

        let c_refs_y = reverse_ref_tree(&c, &y, KeyKind::Positional).unwrap();
        let x_refs_y = combine(&x, &c_refs_y, &c, KeyKind::Positional).unwrap();
        assert_eq!(
            x_refs_y.payload(&Key::path(vec![0, 0])).unwrap(),
            Payload::TreeRef(Key::path(vec![0, 0, 0, 0]))
        );

        let y_tree = materialize(&y, &c, KeyKind::Positional).unwrap();
        let x_tree = materialize(&x, &c, KeyKind::Positional).unwrap();
        let resolved = materialize(&x_refs_y, &y_tree, KeyKind::Positional).unwrap();
        assert_eq!(snapshot(&resolved).unwrap(), snapshot(&x_tree).unwrap());
    }
}
