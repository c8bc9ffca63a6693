use std::io;

use tracing::error;

use crate::error::{Error, Result};
use crate::key::Key;
use crate::model::Content;
use crate::tree::{Payload, RefNode};

/// Where to place a node among its new siblings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Position {
    #[default]
    Append,
    /// Index among the siblings; clamped to the sibling count.
    Index(usize),
}

impl Position {
    pub(crate) fn resolve(self, len: usize) -> usize {
        match self {
            Position::Append => len,
            Position::Index(i) => i.min(len),
        }
    }
}

/// Read access to a keyed tree whose nodes carry content or references.
///
/// Every lookup of an absent key fails with [`Error::NodeNotFound`].
pub trait RefTree: Send + Sync {
    fn root(&self) -> Result<Option<Key>>;
    fn node(&self, key: &Key) -> Result<RefNode>;
    fn contains(&self, key: &Key) -> Result<bool>;
    fn parent(&self, key: &Key) -> Result<Option<Key>>;
    fn children(&self, key: &Key) -> Result<Vec<Key>>;

    fn payload(&self, key: &Key) -> Result<Payload> {
        Ok(self.node(key)?.payload)
    }

    /// Content of a node in a fully resolved tree.
    fn content(&self, key: &Key) -> Result<Content> {
        match self.payload(key)? {
            Payload::Content(content) => Ok(content),
            other => Err(Error::InvalidOperation(format!(
                "node {key} is an unresolved reference {other:?}"
            ))),
        }
    }
}

/// Content-level editing of a tree.
pub trait MutableRefTree: RefTree {
    /// Inserts a new node. With no key a fresh one is allocated.
    fn insert(
        &mut self,
        parent: &Key,
        position: Position,
        key: Option<Key>,
        content: Content,
    ) -> Result<Key>;

    /// Creates the root of an empty tree.
    fn insert_root(&mut self, key: Option<Key>, content: Content) -> Result<Key>;

    /// Removes a node with all of its descendants. The root cannot be deleted.
    fn delete(&mut self, key: &Key) -> Result<()>;

    fn move_node(&mut self, key: &Key, new_parent: &Key, position: Position) -> Result<()>;

    /// Replaces a node's content; returns whether anything changed.
    fn update(&mut self, key: &Key, content: Content) -> Result<bool>;
}

/// Hook through which storage-level I/O failures pass before being returned.
pub trait IoTrap: Send + Sync {
    fn trap(&self, operation: &str, err: io::Error) -> Error {
        error!(operation, error = %err, "store i/o failure");
        Error::Io(err)
    }
}

/// Logs and propagates.
#[derive(Debug, Default)]
pub struct LoggingTrap;

impl IoTrap for LoggingTrap {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_clamp() {
        assert_eq!(Position::Append.resolve(3), 3);
        assert_eq!(Position::Index(1).resolve(3), 1);
        assert_eq!(Position::Index(9).resolve(3), 3);
    }

    #[test]
    fn default_trap_wraps_io() {
        let err = LoggingTrap.trap("write", io::Error::new(io::ErrorKind::Other, "disk"));
        assert!(matches!(err, Error::Io(_)));
    }
}
