//! Tree models: how a token stream maps onto keyed nodes and back.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::key::{DeweyKey, Key};
use crate::xml::{Attribute, QName, StartTag, Token};

pub const DEWEY_MODEL: &str = "xas-items";
pub const ID_MODEL: &str = "xmlr-ids";

/// Content of a single node, independent of its children.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Content {
    Document,
    Element {
        name: QName,
        attributes: Vec<Attribute>,
    },
    Text(String),
    Comment(String),
    ProcessingInstruction {
        target: String,
        data: String,
    },
}

impl Content {
    pub fn element(local: impl Into<String>) -> Self {
        Content::Element {
            name: QName::local(local),
            attributes: Vec::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Content::Text(text.into())
    }

    /// Adds or replaces an unqualified attribute. No-op on non-elements.
    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        if let Content::Element { attributes, .. } = self {
            let value = value.into();
            match attributes
                .iter_mut()
                .find(|a| a.name.namespace.is_none() && a.name.local == name)
            {
                Some(existing) => existing.value = value,
                None => attributes.push(Attribute::new(name, value)),
            }
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        match self {
            Content::Element { attributes, .. } => attributes
                .iter()
                .find(|a| a.name.namespace.is_none() && a.name.local == name)
                .map(|a| a.value.as_str()),
            _ => None,
        }
    }

    /// Whether nodes with this content may have children.
    pub fn is_container(&self) -> bool {
        matches!(self, Content::Document | Content::Element { .. })
    }

    /// Content carried by an opening or leaf token.
    pub fn from_token(token: &Token) -> Option<Content> {
        match token {
            Token::StartDocument => Some(Content::Document),
            Token::StartTag(tag) => Some(Content::Element {
                name: tag.name.clone(),
                attributes: tag.attributes.clone(),
            }),
            Token::Text(text) => Some(Content::Text(text.clone())),
            Token::Comment(body) => Some(Content::Comment(body.clone())),
            Token::ProcessingInstruction { target, data } => Some(Content::ProcessingInstruction {
                target: target.clone(),
                data: data.clone(),
            }),
            Token::EndDocument | Token::EndTag(_) => None,
        }
    }

    pub fn start_token(&self) -> Token {
        match self {
            Content::Document => Token::StartDocument,
            Content::Element { name, attributes } => Token::StartTag(StartTag {
                name: name.clone(),
                attributes: attributes.clone(),
                namespace_decls: Vec::new(),
            }),
            Content::Text(text) => Token::Text(text.clone()),
            Content::Comment(body) => Token::Comment(body.clone()),
            Content::ProcessingInstruction { target, data } => Token::ProcessingInstruction {
                target: target.clone(),
                data: data.clone(),
            },
        }
    }

    pub fn end_token(&self) -> Option<Token> {
        match self {
            Content::Document => Some(Token::EndDocument),
            Content::Element { name, .. } => Some(Token::EndTag(name.clone())),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyKind {
    /// Keys are child-index paths; they shift when siblings change.
    Positional,
    /// Keys are carried inside the content and survive edits.
    Identified,
}

/// Assigns identity to nodes.
pub trait IdentificationModel: Send + Sync + fmt::Debug {
    fn kind(&self) -> KeyKind;

    /// Key carried by the content itself, if any.
    fn identify(&self, content: &Content) -> Option<Key>;

    /// Content with `key` written into it, for models that store keys in content.
    fn stamp(&self, key: &Key, content: Content) -> Content;

    fn parse_key(&self, text: &str) -> Result<Key>;
}

#[derive(Debug, Default)]
pub struct PositionalIdentification;

impl IdentificationModel for PositionalIdentification {
    fn kind(&self) -> KeyKind {
        KeyKind::Positional
    }

    fn identify(&self, _content: &Content) -> Option<Key> {
        None
    }

    fn stamp(&self, _key: &Key, content: Content) -> Content {
        content
    }

    fn parse_key(&self, text: &str) -> Result<Key> {
        Ok(Key::Path(text.parse::<DeweyKey>()?))
    }
}

/// Identity taken from an unqualified attribute of every element.
#[derive(Debug)]
pub struct AttributeIdentification {
    attribute: String,
}

impl AttributeIdentification {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
        }
    }
}

impl IdentificationModel for AttributeIdentification {
    fn kind(&self) -> KeyKind {
        KeyKind::Identified
    }

    fn identify(&self, content: &Content) -> Option<Key> {
        content.attribute(&self.attribute).map(Key::id)
    }

    fn stamp(&self, key: &Key, mut content: Content) -> Content {
        if let Key::Id(id) = key {
            if content.attribute(&self.attribute) != Some(id.as_str()) {
                content.set_attribute(&self.attribute, id.clone());
            }
        }
        content
    }

    fn parse_key(&self, text: &str) -> Result<Key> {
        if text.is_empty() {
            return Err(Error::InvalidOperation("empty id".into()));
        }
        Ok(Key::id(text))
    }
}

/// Converts between node content and tokens.
pub trait ContentCodec: Send + Sync + fmt::Debug {
    /// Opening token for a node. Containers are closed by [`Content::end_token`].
    fn encode(&self, key: &Key, content: &Content) -> Result<Token>;

    /// Node content carried by `token`, or `None` when the token is not a node
    /// of this model. `at` is the token's byte offset for error reporting.
    fn decode(&self, token: &Token, at: u64) -> Result<Option<Content>>;
}

/// Every token is a node: the document, elements, text runs, comments and
/// processing instructions.
#[derive(Debug, Default)]
pub struct ItemCodec;

impl ContentCodec for ItemCodec {
    fn encode(&self, key: &Key, content: &Content) -> Result<Token> {
        if matches!(content, Content::Text(text) if text.is_empty()) {
            return Err(Error::InvalidOperation(format!(
                "node {key} has empty text content"
            )));
        }
        Ok(content.start_token())
    }

    fn decode(&self, token: &Token, _at: u64) -> Result<Option<Content>> {
        Ok(Content::from_token(token))
    }
}

/// Only elements are nodes. Whitespace between elements is dropped; any
/// other character data, comment or processing instruction is rejected.
#[derive(Debug)]
pub struct ElementCodec {
    identification: Arc<dyn IdentificationModel>,
}

impl ElementCodec {
    pub fn new(identification: Arc<dyn IdentificationModel>) -> Self {
        Self { identification }
    }
}

impl ContentCodec for ElementCodec {
    fn encode(&self, key: &Key, content: &Content) -> Result<Token> {
        match content {
            Content::Element { .. } => Ok(self
                .identification
                .stamp(key, content.clone())
                .start_token()),
            other => Err(Error::InvalidOperation(format!(
                "node {key}: only elements are allowed, got {other:?}"
            ))),
        }
    }

    fn decode(&self, token: &Token, at: u64) -> Result<Option<Content>> {
        match token {
            Token::StartTag(_) => {
                let content = Content::from_token(token);
                if let Some(content) = &content {
                    if self.identification.identify(content).is_none() {
                        return Err(Error::parse("element without id", at, b""));
                    }
                }
                Ok(content)
            }
            Token::Text(text) if text.trim().is_empty() => Ok(None),
            Token::Text(_) => Err(Error::parse("character data between elements", at, b"")),
            Token::Comment(_) | Token::ProcessingInstruction { .. } => {
                Err(Error::parse("comments and processing instructions are not nodes", at, b""))
            }
            Token::StartDocument | Token::EndDocument | Token::EndTag(_) => Ok(None),
        }
    }
}

/// A named pairing of identification and codec.
#[derive(Clone, Debug)]
pub struct TreeModel {
    name: String,
    identification: Arc<dyn IdentificationModel>,
    codec: Arc<dyn ContentCodec>,
}

impl TreeModel {
    pub fn new(
        name: impl Into<String>,
        identification: Arc<dyn IdentificationModel>,
        codec: Arc<dyn ContentCodec>,
    ) -> Self {
        Self {
            name: name.into(),
            identification,
            codec,
        }
    }

    /// Positional keys over every token, the document included.
    pub fn dewey() -> Self {
        Self::new(
            DEWEY_MODEL,
            Arc::new(PositionalIdentification),
            Arc::new(ItemCodec),
        )
    }

    /// Element-only trees keyed by an `id` attribute.
    pub fn id_attribute(attribute: &str) -> Self {
        let identification: Arc<dyn IdentificationModel> =
            Arc::new(AttributeIdentification::new(attribute));
        Self::new(
            ID_MODEL,
            identification.clone(),
            Arc::new(ElementCodec::new(identification)),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_kind(&self) -> KeyKind {
        self.identification.kind()
    }

    pub fn identification(&self) -> &dyn IdentificationModel {
        self.identification.as_ref()
    }

    pub fn codec(&self) -> &dyn ContentCodec {
        self.codec.as_ref()
    }

    /// Whether the document itself is a node. When it is not, writers wrap
    /// the root element in document tokens.
    pub fn document_is_node(&self) -> bool {
        self.key_kind() == KeyKind::Positional
    }
}

/// Models selectable by name from configuration.
#[derive(Clone, Debug)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<TreeModel>>,
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self {
            models: HashMap::new(),
        }
    }

    pub fn register(&mut self, model: TreeModel) {
        self.models.insert(model.name().to_string(), Arc::new(model));
    }

    pub fn get(&self, name: &str) -> Result<Arc<TreeModel>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown tree model {name:?}")))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(TreeModel::dewey());
        registry.register(TreeModel::id_attribute("id"));
        registry
    }
}
