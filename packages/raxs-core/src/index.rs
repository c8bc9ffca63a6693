//! Key → byte-range index over a serialized tree.

use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;

use crate::error::{Error, Result};
use crate::key::{DeweyKey, Key};
use crate::model::{KeyKind, TreeModel};
use crate::xml::{Context, Token, XmlReader};

/// Byte range covering a node and its whole subtree, plus the namespace
/// bindings in effect just before it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub offset: u64,
    pub length: u64,
    pub context: Context,
    /// The node is a text run.
    pub text: bool,
}

impl Entry {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

#[derive(Clone, Debug, Default)]
struct Links {
    parents: HashMap<Key, Option<Key>>,
    children: HashMap<Key, Vec<Key>>,
}

/// Positional indexes answer structure queries by probing keys; identified
/// indexes keep explicit parent and child tables.
#[derive(Clone, Debug)]
pub struct Index {
    kind: KeyKind,
    entries: HashMap<Key, Entry>,
    links: Links,
    root: Option<Key>,
}

impl Index {
    pub fn empty(kind: KeyKind) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
            links: Links::default(),
            root: None,
        }
    }

    /// Scans a serialized tree once. An empty input is an empty tree.
    pub fn build(bytes: &[u8], model: &TreeModel) -> Result<Self> {
        let started = Instant::now();
        let index = if bytes.is_empty() {
            Self::empty(model.key_kind())
        } else {
            match model.key_kind() {
                KeyKind::Positional => Self::build_positional(bytes)?,
                KeyKind::Identified => Self::build_identified(bytes, model)?,
            }
        };
        debug!(
            model = model.name(),
            nodes = index.len(),
            bytes = bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "built index"
        );
        Ok(index)
    }

    fn build_positional(bytes: &[u8]) -> Result<Self> {
        struct Open {
            key: DeweyKey,
            offset: u64,
            context: Context,
            next_child: u32,
        }
        fn next_child(stack: &mut [Open]) -> Result<DeweyKey> {
            let parent = stack
                .last_mut()
                .ok_or_else(|| Error::IllegalState("token outside the document".into()))?;
            let key = parent.key.child(parent.next_child);
            parent.next_child += 1;
            Ok(key)
        }

        let mut index = Self::empty(KeyKind::Positional);
        let mut stack: Vec<Open> = Vec::new();
        let mut reader = XmlReader::document(bytes);
        loop {
            let context = reader.context();
            let Some(span) = reader.next_token()? else {
                break;
            };
            match span.token {
                Token::StartDocument => stack.push(Open {
                    key: DeweyKey::root(),
                    offset: 0,
                    context,
                    next_child: 0,
                }),
                Token::StartTag(_) => {
                    let key = next_child(&mut stack)?;
                    stack.push(Open {
                        key,
                        offset: span.start,
                        context,
                        next_child: 0,
                    });
                }
                Token::EndTag(_) | Token::EndDocument => {
                    let open = stack
                        .pop()
                        .ok_or_else(|| Error::IllegalState("unbalanced token stream".into()))?;
                    let end = if open.key.is_root() {
                        bytes.len() as u64
                    } else {
                        span.end
                    };
                    index.entries.insert(
                        Key::Path(open.key),
                        Entry {
                            offset: open.offset,
                            length: end - open.offset,
                            context: open.context,
                            text: false,
                        },
                    );
                }
                Token::Text(_) | Token::Comment(_) | Token::ProcessingInstruction { .. } => {
                    let key = next_child(&mut stack)?;
                    index.entries.insert(
                        Key::Path(key),
                        Entry {
                            offset: span.start,
                            length: span.end - span.start,
                            context,
                            text: matches!(span.token, Token::Text(_)),
                        },
                    );
                }
            }
        }
        index.root = Some(Key::root_path());
        Ok(index)
    }

    fn build_identified(bytes: &[u8], model: &TreeModel) -> Result<Self> {
        let mut index = Self::empty(KeyKind::Identified);
        let mut stack: Vec<(Key, u64, Context)> = Vec::new();
        let mut reader = XmlReader::document(bytes);
        loop {
            let context = reader.context();
            let Some(span) = reader.next_token()? else {
                break;
            };
            if let Token::EndTag(_) = span.token {
                let (key, offset, context) = stack
                    .pop()
                    .ok_or_else(|| Error::IllegalState("unbalanced token stream".into()))?;
                index.entries.insert(
                    key,
                    Entry {
                        offset,
                        length: span.end - offset,
                        context,
                        text: false,
                    },
                );
                continue;
            }
            let Some(content) = model.codec().decode(&span.token, span.start)? else {
                continue;
            };
            let key = model.identification().identify(&content).ok_or_else(|| {
                Error::parse("element without id", span.start, &bytes[span.start as usize..])
            })?;
            if index.links.parents.contains_key(&key) {
                return Err(Error::parse(
                    format!("duplicate id {key}"),
                    span.start,
                    &bytes[span.start as usize..],
                ));
            }
            let parent = stack.last().map(|(k, _, _)| k.clone());
            match &parent {
                Some(p) => index
                    .links
                    .children
                    .entry(p.clone())
                    .or_default()
                    .push(key.clone()),
                None => index.root = Some(key.clone()),
            }
            index.links.parents.insert(key.clone(), parent);
            index.links.children.entry(key.clone()).or_default();
            stack.push((key, span.start, context));
        }
        Ok(index)
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn root(&self) -> Option<&Key> {
        self.root.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, key: &Key) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn entry(&self, key: &Key) -> Result<&Entry> {
        self.find(key).ok_or_else(|| Error::NodeNotFound(key.clone()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.keys()
    }

    pub fn parent(&self, key: &Key) -> Result<Option<Key>> {
        match self.kind {
            KeyKind::Positional => {
                self.entry(key)?;
                Ok(key.as_path().and_then(DeweyKey::up).map(Key::Path))
            }
            KeyKind::Identified => self
                .links
                .parents
                .get(key)
                .cloned()
                .ok_or_else(|| Error::NodeNotFound(key.clone())),
        }
    }

    pub fn children(&self, key: &Key) -> Result<Vec<Key>> {
        match self.kind {
            KeyKind::Positional => {
                self.entry(key)?;
                let Some(path) = key.as_path() else {
                    return Ok(Vec::new());
                };
                let mut out = Vec::new();
                let mut probe = Key::Path(path.down());
                while self.entries.contains_key(&probe) {
                    let next = probe.as_path().map(DeweyKey::next);
                    out.push(probe);
                    match next {
                        Some(next) => probe = Key::Path(next),
                        None => break,
                    }
                }
                Ok(out)
            }
            KeyKind::Identified => self
                .links
                .children
                .get(key)
                .cloned()
                .ok_or_else(|| Error::NodeNotFound(key.clone())),
        }
    }
}
