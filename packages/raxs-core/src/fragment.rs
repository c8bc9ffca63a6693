//! Lazy access to indexed byte ranges of the content file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::index::{Entry, Index};
use crate::key::Key;
use crate::model::{Content, TreeModel};
use crate::xml::{Context, TextEdges, Token, XmlReader, XmlWriter};

/// Bytes read to decode a node's own content before falling back to the
/// whole range.
const HEAD_CHUNK: u64 = 4096;

/// An open content file. Reads seek to an entry's offset and read forward.
#[derive(Debug)]
pub struct LazySource {
    path: PathBuf,
    file: Mutex<File>,
    len: u64,
}

impl LazySource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        self.read_range(0, self.len)
    }

    fn check_range(&self, offset: u64, length: u64) -> Result<()> {
        match offset.checked_add(length) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::IllegalState(format!(
                "range {offset}+{length} is past the end of {}",
                self.path.display()
            ))),
        }
    }

    pub fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.check_range(offset, length)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Streams a byte range into `out` without decoding it.
    pub fn copy_to<W: Write>(
        &self,
        offset: u64,
        length: u64,
        edges: TextEdges,
        out: &mut XmlWriter<W>,
    ) -> Result<()> {
        self.check_range(offset, length)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut range = (&mut *file).take(length);
        out.copy_raw(&mut range, length, edges)
    }

    /// Tokens of a balanced byte range, resolved against `context`.
    pub fn read_tokens(&self, offset: u64, length: u64, context: &Context) -> Result<Vec<Token>> {
        let bytes = self.read_range(offset, length)?;
        let spans = XmlReader::fragment(&bytes, offset, context.clone()).collect_tokens()?;
        Ok(spans.into_iter().map(|s| s.token).collect())
    }

    /// Decodes the content of the node at `entry`, reading as little as possible.
    pub fn read_content(&self, entry: &Entry, model: &TreeModel) -> Result<Content> {
        let head = entry.length.min(HEAD_CHUNK);
        let truncated = head < entry.length;
        let bytes = self.read_range(entry.offset, head)?;
        match first_token(&bytes, entry) {
            Ok((token, end)) if !(truncated && end >= entry.offset + head) => {
                decode_node(model, &token, entry)
            }
            Err(err) if !truncated => Err(err),
            _ => {
                debug!(offset = entry.offset, length = entry.length, "re-reading whole node head");
                let bytes = self.read_range(entry.offset, entry.length)?;
                let (token, _) = first_token(&bytes, entry)?;
                decode_node(model, &token, entry)
            }
        }
    }
}

fn first_token(bytes: &[u8], entry: &Entry) -> Result<(Token, u64)> {
    let mut reader = XmlReader::fragment(bytes, entry.offset, entry.context.clone());
    let span = reader
        .next_token()?
        .ok_or_else(|| Error::IllegalState(format!("empty range at {}", entry.offset)))?;
    Ok((span.token, span.end))
}

fn decode_node(model: &TreeModel, token: &Token, entry: &Entry) -> Result<Content> {
    model.codec().decode(token, entry.offset)?.ok_or_else(|| {
        Error::IllegalState(format!("index entry at {} does not start a node", entry.offset))
    })
}

/// How much of a node has been pulled out of the file.
#[derive(Clone, Debug, PartialEq)]
pub enum FragmentState {
    /// Only the byte range is known.
    Indexed(Entry),
    /// Content decoded and child keys listed; children are still lazy.
    PartiallyExpanded {
        entry: Entry,
        content: Content,
        children: Vec<Key>,
    },
    /// Leaf node with its content decoded; nothing left to load.
    FullyMaterialized { entry: Entry, content: Content },
}

impl FragmentState {
    pub fn entry(&self) -> &Entry {
        match self {
            FragmentState::Indexed(entry)
            | FragmentState::PartiallyExpanded { entry, .. }
            | FragmentState::FullyMaterialized { entry, .. } => entry,
        }
    }

    pub fn content(&self) -> Option<&Content> {
        match self {
            FragmentState::Indexed(_) => None,
            FragmentState::PartiallyExpanded { content, .. }
            | FragmentState::FullyMaterialized { content, .. } => Some(content),
        }
    }

    pub fn children(&self) -> Option<&[Key]> {
        match self {
            FragmentState::Indexed(_) => None,
            FragmentState::PartiallyExpanded { children, .. } => Some(children),
            FragmentState::FullyMaterialized { .. } => Some(&[]),
        }
    }
}

/// Moves a node one step out of the `Indexed` state. Other states are
/// returned unchanged.
pub fn expand(
    key: &Key,
    state: FragmentState,
    source: &LazySource,
    index: &Index,
    model: &TreeModel,
) -> Result<FragmentState> {
    let FragmentState::Indexed(entry) = state else {
        return Ok(state);
    };
    let content = if model.document_is_node() && index.root() == Some(key) {
        Content::Document
    } else {
        source.read_content(&entry, model)?
    };
    let children = index.children(key)?;
    if children.is_empty() {
        Ok(FragmentState::FullyMaterialized { entry, content })
    } else {
        Ok(FragmentState::PartiallyExpanded {
            entry,
            content,
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn source_for(doc: &[u8]) -> (tempfile::NamedTempFile, LazySource) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(doc).unwrap();
        file.flush().unwrap();
        let source = LazySource::open(file.path()).unwrap();
        (file, source)
    }

    #[test]
    fn expands_one_level_at_a_time() {
        let doc = b"<r><a>x</a><b/></r>";
        let model = TreeModel::dewey();
        let index = Index::build(doc, &model).unwrap();
        let (_file, source) = source_for(doc);

        let key = Key::path(vec![0]);
        let state = FragmentState::Indexed(index.entry(&key).unwrap().clone());
        let state = expand(&key, state, &source, &index, &model).unwrap();
        assert_eq!(state.content(), Some(&Content::element("r")));
        assert_eq!(state.children().map(<[Key]>::len), Some(2));

        let leaf = Key::path(vec![0, 0, 0]);
        let state = FragmentState::Indexed(index.entry(&leaf).unwrap().clone());
        let state = expand(&leaf, state, &source, &index, &model).unwrap();
        assert!(matches!(state, FragmentState::FullyMaterialized { .. }));
        assert_eq!(state.content(), Some(&Content::text("x")));

        let root = Key::root_path();
        let state = FragmentState::Indexed(index.entry(&root).unwrap().clone());
        let state = expand(&root, state, &source, &index, &model).unwrap();
        assert_eq!(state.content(), Some(&Content::Document));
    }

    #[test]
    fn ranges_past_the_end_are_rejected() {
        let doc = b"<r/>";
        let (_file, source) = source_for(doc);
        assert_eq!(source.read_range(1, 3).unwrap(), b"r/>");
        for (offset, length) in [(1, 4), (5, 0), (u64::MAX, 2), (2, u64::MAX)] {
            let err = source.read_range(offset, length).unwrap_err();
            assert!(matches!(err, Error::IllegalState(_)), "{offset}+{length}: {err:?}");
        }
        let mut out = XmlWriter::new(Vec::new());
        let err = source
            .copy_to(u64::MAX, 1, TextEdges::default(), &mut out)
            .unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
    }

    #[test]
    fn long_heads_fall_back_to_full_read() {
        let long = "y".repeat(3 * HEAD_CHUNK as usize);
        let doc = format!("<r><t>{long}</t></r>");
        let model = TreeModel::dewey();
        let index = Index::build(doc.as_bytes(), &model).unwrap();
        let (_file, source) = source_for(doc.as_bytes());
        let entry = index.entry(&Key::path(vec![0, 0, 0])).unwrap();
        assert_eq!(source.read_content(entry, &model).unwrap(), Content::text(long));
    }

    #[test]
    fn rejects_ranges_past_end() {
        let (_file, source) = source_for(b"<r/>");
        assert!(source.read_range(2, 10).is_err());
        assert_eq!(source.read_all().unwrap(), b"<r/>");
    }
}
