use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Positional key: the child-index path from the document node.
///
/// The empty path is the document itself. Ordering is lexicographic over the
/// components, so an ancestor always sorts before its descendants and siblings
/// sort in document order.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DeweyKey(Vec<u32>);

impl DeweyKey {
    pub const fn root() -> Self {
        DeweyKey(Vec::new())
    }

    pub fn from_components(components: impl Into<Vec<u32>>) -> Self {
        DeweyKey(components.into())
    }

    pub fn components(&self) -> &[u32] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Parent key, or `None` for the document.
    pub fn up(&self) -> Option<DeweyKey> {
        if self.0.is_empty() {
            return None;
        }
        Some(DeweyKey(self.0[..self.0.len() - 1].to_vec()))
    }

    /// First child.
    pub fn down(&self) -> DeweyKey {
        self.child(0)
    }

    /// Next sibling. The document has no siblings and maps to itself.
    pub fn next(&self) -> DeweyKey {
        let mut components = self.0.clone();
        if let Some(last) = components.last_mut() {
            *last += 1;
        }
        DeweyKey(components)
    }

    pub fn child(&self, index: u32) -> DeweyKey {
        let mut components = Vec::with_capacity(self.0.len() + 1);
        components.extend_from_slice(&self.0);
        components.push(index);
        DeweyKey(components)
    }

    /// Index among siblings; `None` for the document.
    pub fn position(&self) -> Option<u32> {
        self.0.last().copied()
    }

    pub fn is_ancestor_of(&self, other: &DeweyKey) -> bool {
        self.0.len() < other.0.len() && other.0.starts_with(&self.0)
    }

    /// Re-anchors `self` (a descendant-or-self of `from`) under `to`.
    pub fn rebase(&self, from: &DeweyKey, to: &DeweyKey) -> Option<DeweyKey> {
        let suffix = self.0.strip_prefix(from.0.as_slice())?;
        let mut components = to.0.clone();
        components.extend_from_slice(suffix);
        Some(DeweyKey(components))
    }
}

impl fmt::Display for DeweyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("/")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl FromStr for DeweyKey {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let rest = text
            .strip_prefix('/')
            .ok_or_else(|| Error::InvalidOperation(format!("malformed path key {text:?}")))?;
        if rest.is_empty() {
            return Ok(DeweyKey::root());
        }
        let components = rest
            .split('.')
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| Error::InvalidOperation(format!("malformed path key {text:?}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(DeweyKey(components))
    }
}

/// Identity of a node inside one tree.
///
/// `Path` keys come from the positional model, `Id` keys from the id-attribute
/// model. `Transient` keys name nodes inserted into a change buffer that have
/// no persistent identity yet.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Key {
    Path(DeweyKey),
    Id(String),
    Transient(u64),
}

impl Key {
    pub fn root_path() -> Key {
        Key::Path(DeweyKey::root())
    }

    pub fn path(components: impl Into<Vec<u32>>) -> Key {
        Key::Path(DeweyKey::from_components(components))
    }

    pub fn id(value: impl Into<String>) -> Key {
        Key::Id(value.into())
    }

    pub fn as_path(&self) -> Option<&DeweyKey> {
        match self {
            Key::Path(path) => Some(path),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Key::Transient(_))
    }

    /// Moves `self` from under `from` to under `to`. Only positional keys
    /// encode their ancestry; other keys are returned unchanged.
    pub fn rebase(&self, from: &Key, to: &Key) -> Key {
        match (self, from, to) {
            (Key::Path(key), Key::Path(from), Key::Path(to)) => key
                .rebase(from, to)
                .map(Key::Path)
                .unwrap_or_else(|| self.clone()),
            _ => self.clone(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Path(path) => path.fmt(f),
            Key::Id(id) => f.write_str(id),
            Key::Transient(n) => write!(f, "#{n}"),
        }
    }
}

impl From<DeweyKey> for Key {
    fn from(path: DeweyKey) -> Self {
        Key::Path(path)
    }
}
