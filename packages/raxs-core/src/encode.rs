//! Serialization of trees: whole documents with raw copies of unchanged
//! ranges, and the reference-tree format used for deltas.

use std::io::Write;

use tracing::debug;

use crate::error::{Error, Result};
use crate::index::Entry;
use crate::key::Key;
use crate::model::{KeyKind, TreeModel};
use crate::traits::{Position, RefTree};
use crate::tree::{MemTree, Payload};
use crate::view::IndexedTree;
use crate::xml::{
    Attribute, QName, SafeDecoder, SafeEncoder, StartTag, TextEdges, Token, TokenTransform,
    XmlReader, XmlWriter,
};

pub const REFTREE_NAMESPACE: &str = "urn:raxs:reftree";
pub const DELTA_NAMESPACE: &str = "urn:raxs:delta";
const REFTREE_PREFIX: &str = "rt";
const DELTA_PREFIX: &str = "rd";
const TREE_REF: &str = "tree";
const NODE_REF: &str = "node";
const DELTA_ROOT: &str = "delta";
const KEY_ATTRIBUTE: &str = "key";

/// Counters from one document write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncodeStats {
    pub nodes: u64,
    pub fast_copies: u64,
    pub slow_copies: u64,
    pub bytes: u64,
}

struct Pending {
    offset: u64,
    length: u64,
    entry: Entry,
    ends_with_text: bool,
}

/// Writes `tree` as a document. References resolve against `base`; tree
/// references are copied byte for byte when the namespace bindings at the
/// destination match those at the source.
pub struct DocumentEncoder<'a, W: Write> {
    writer: XmlWriter<W>,
    model: &'a TreeModel,
    base: Option<&'a IndexedTree>,
    pending: Option<Pending>,
    stats: EncodeStats,
}

impl<'a, W: Write> DocumentEncoder<'a, W> {
    pub fn new(out: W, model: &'a TreeModel, base: Option<&'a IndexedTree>) -> Self {
        Self {
            writer: XmlWriter::new(out),
            model,
            base,
            pending: None,
            stats: EncodeStats::default(),
        }
    }

    /// Writes the tree and returns the sink. An empty tree writes nothing.
    pub fn encode(mut self, tree: &dyn RefTree) -> Result<(W, EncodeStats)> {
        if let Some(root) = tree.root()? {
            let wrap = !self.model.document_is_node();
            if wrap {
                self.writer.write_token(&Token::StartDocument)?;
            }
            self.write_node(tree, &root)?;
            self.flush_pending()?;
            if wrap {
                self.writer.write_token(&Token::EndDocument)?;
            }
        }
        self.stats.bytes = self.writer.bytes_written();
        let stats = self.stats;
        Ok((self.writer.into_inner()?, stats))
    }

    fn base(&self) -> Result<&'a IndexedTree> {
        self.base
            .ok_or_else(|| Error::InvalidOperation("tree has references but no base tree".into()))
    }

    fn write_node(&mut self, tree: &dyn RefTree, key: &Key) -> Result<()> {
        let node = tree.node(key)?;
        let content = match node.payload {
            Payload::TreeRef(target) => {
                let entry = self.base()?.entry(&target)?.clone();
                self.stats.nodes += 1;
                return self.queue_copy(entry);
            }
            Payload::NodeRef(target) => self.base()?.content(&target)?,
            Payload::Content(content) => content,
        };
        self.flush_pending()?;
        let token = self.model.codec().encode(&node.key, &content)?;
        self.writer.write_token(&token)?;
        self.stats.nodes += 1;
        for child in &node.children {
            self.write_node(tree, child)?;
        }
        match content.end_token() {
            Some(end) => {
                self.flush_pending()?;
                self.writer.write_token(&end)?;
            }
            None if !node.children.is_empty() => {
                return Err(Error::InvalidOperation(format!(
                    "leaf node {key} has children"
                )))
            }
            None => {}
        }
        Ok(())
    }

    fn queue_copy(&mut self, entry: Entry) -> Result<()> {
        if let Some(pending) = &mut self.pending {
            if pending.offset + pending.length == entry.offset
                && pending.entry.context.resolves_like(&entry.context)
            {
                pending.length += entry.length;
                pending.ends_with_text = entry.text;
                return Ok(());
            }
        }
        self.flush_pending()?;
        self.pending = Some(Pending {
            offset: entry.offset,
            length: entry.length,
            ends_with_text: entry.text,
            entry,
        });
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let source = self.base()?.source()?;
        if self.writer.context().resolves_like(&pending.entry.context) {
            let edges = TextEdges {
                leading: pending.entry.text,
                trailing: pending.ends_with_text,
            };
            source.copy_to(pending.offset, pending.length, edges, &mut self.writer)?;
            self.stats.fast_copies += 1;
        } else {
            debug!(
                offset = pending.offset,
                length = pending.length,
                "namespace scope differs, re-encoding copied range"
            );
            for token in source.read_tokens(pending.offset, pending.length, &pending.entry.context)? {
                self.writer.write_token(&token)?;
            }
            self.stats.slow_copies += 1;
        }
        Ok(())
    }
}

/// Serializes a reference tree inside a delta wrapper element. Nested
/// document tokens go through [`SafeEncoder`].
pub fn write_ref_tree<W: Write>(tree: &dyn RefTree, model: &TreeModel, out: W) -> Result<W> {
    let mut sink = RefTreeSink {
        writer: XmlWriter::new(out),
        safe: SafeEncoder::default(),
        buf: Vec::new(),
    };
    let wrapper = QName::qualified(DELTA_NAMESPACE, DELTA_PREFIX, DELTA_ROOT);
    let mut start = StartTag::new(wrapper.clone());
    start
        .namespace_decls
        .push((REFTREE_PREFIX.to_string(), REFTREE_NAMESPACE.to_string()));
    sink.emit(Token::StartDocument)?;
    sink.emit(Token::StartTag(start))?;
    if let Some(root) = tree.root()? {
        write_ref_node(tree, model, &root, &mut sink)?;
    }
    sink.emit(Token::EndTag(wrapper))?;
    sink.emit(Token::EndDocument)?;
    sink.writer.into_inner()
}

struct RefTreeSink<W: Write> {
    writer: XmlWriter<W>,
    safe: SafeEncoder,
    buf: Vec<Token>,
}

impl<W: Write> RefTreeSink<W> {
    fn emit(&mut self, token: Token) -> Result<()> {
        self.safe.transform(token, &mut self.buf);
        for token in self.buf.drain(..) {
            self.writer.write_token(&token)?;
        }
        Ok(())
    }
}

fn ref_element(local: &str, target: &Key) -> (Token, Token) {
    let name = QName::qualified(REFTREE_NAMESPACE, REFTREE_PREFIX, local);
    let mut tag = StartTag::new(name.clone());
    tag.attributes
        .push(Attribute::new(KEY_ATTRIBUTE, target.to_string()));
    (Token::StartTag(tag), Token::EndTag(name))
}

fn write_ref_node<W: Write>(
    tree: &dyn RefTree,
    model: &TreeModel,
    key: &Key,
    sink: &mut RefTreeSink<W>,
) -> Result<()> {
    let node = tree.node(key)?;
    let end = match &node.payload {
        Payload::TreeRef(target) => {
            let (start, end) = ref_element(TREE_REF, target);
            sink.emit(start)?;
            sink.emit(end)?;
            return Ok(());
        }
        Payload::NodeRef(target) => {
            let (start, end) = ref_element(NODE_REF, target);
            sink.emit(start)?;
            Some(end)
        }
        Payload::Content(content) => {
            sink.emit(model.codec().encode(&node.key, content)?)?;
            content.end_token()
        }
    };
    for child in &node.children {
        write_ref_node(tree, model, child, sink)?;
    }
    if let Some(end) = end {
        sink.emit(end)?;
    }
    Ok(())
}

/// Parses a delta written by [`write_ref_tree`].
///
/// Positional models key every node by its position in the delta itself;
/// identified models use the carried id, and the target for references.
pub fn read_ref_tree(bytes: &[u8], model: &TreeModel) -> Result<MemTree> {
    struct Frame {
        key: Key,
        next_child: u32,
    }

    fn place(
        kind: KeyKind,
        stack: &mut [Frame],
        out: &mut MemTree,
        identity: Key,
        payload: Payload,
    ) -> Result<Key> {
        let (parent, key) = match stack.last_mut() {
            None if kind == KeyKind::Positional => (None, Key::root_path()),
            None => (None, identity),
            Some(frame) => {
                let key = match (kind, &frame.key) {
                    (KeyKind::Positional, Key::Path(path)) => Key::Path(path.child(frame.next_child)),
                    _ => identity,
                };
                frame.next_child += 1;
                (Some(frame.key.clone()), key)
            }
        };
        out.add(parent.as_ref(), Position::Append, key.clone(), payload)?;
        Ok(key)
    }

    let kind = model.key_kind();
    let mut tokens = Vec::new();
    let mut decoder = SafeDecoder;
    let mut reader = XmlReader::document(bytes);
    while let Some(span) = reader.next_token()? {
        let start = span.start;
        let mut decoded = Vec::new();
        decoder.transform(span.token, &mut decoded);
        tokens.extend(decoded.into_iter().map(|t| (t, start)));
    }

    let mut out = MemTree::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut in_delta = false;
    let mut started = false;

    for (token, at) in tokens {
        match token {
            Token::StartDocument if !started => started = true,
            Token::StartTag(tag) if !in_delta && tag.name.is(DELTA_NAMESPACE, DELTA_ROOT) => {
                in_delta = true;
            }
            Token::EndTag(name) if stack.is_empty() && name.is(DELTA_NAMESPACE, DELTA_ROOT) => {
                in_delta = false;
            }
            Token::EndDocument if stack.is_empty() => {}
            Token::StartTag(tag) if tag.name.namespace.as_deref() == Some(REFTREE_NAMESPACE) => {
                let text = tag.attribute(KEY_ATTRIBUTE).ok_or_else(|| {
                    Error::parse("reference without key", at, b"")
                })?;
                let target = model.identification().parse_key(text)?;
                let payload = match tag.name.local.as_str() {
                    TREE_REF => Payload::TreeRef(target.clone()),
                    NODE_REF => Payload::NodeRef(target.clone()),
                    other => {
                        return Err(Error::parse(format!("unknown reference element {other}"), at, b""))
                    }
                };
                let key = place(kind, &mut stack, &mut out, target, payload)?;
                stack.push(Frame { key, next_child: 0 });
            }
            Token::EndTag(_) | Token::EndDocument => {
                stack
                    .pop()
                    .ok_or_else(|| Error::parse("unbalanced delta", at, b""))?;
            }
            token => {
                if !in_delta {
                    return Err(Error::parse("content outside the delta element", at, b""));
                }
                let Some(content) = model.codec().decode(&token, at)? else {
                    continue;
                };
                let identity = match kind {
                    KeyKind::Identified => model
                        .identification()
                        .identify(&content)
                        .ok_or_else(|| Error::parse("element without id", at, b""))?,
                    KeyKind::Positional => Key::root_path(),
                };
                let opens = token.opens();
                let key = place(kind, &mut stack, &mut out, identity, Payload::Content(content))?;
                if opens {
                    stack.push(Frame { key, next_child: 0 });
                }
            }
        }
    }
    if !stack.is_empty() {
        return Err(Error::parse("unterminated delta", bytes.len() as u64, b""));
    }
    debug!(nodes = out.len(), "read reference tree");
    Ok(out)
}
