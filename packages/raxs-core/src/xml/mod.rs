//! Streaming XML tokens: a byte-offset-aware reader, a namespace-repairing
//! writer, and reversible token transforms used for delta files.

mod reader;
mod safe;
mod writer;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub use reader::{ReadMode, TokenSpan, XmlReader};
pub use safe::{SafeDecoder, SafeEncoder, TokenTransform, SAFE_NAMESPACE};
pub use writer::{TextEdges, XmlWriter};

pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Expanded name. The prefix is kept so re-encoding can reuse it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QName {
    pub namespace: Option<String>,
    pub local: String,
    pub prefix: Option<String>,
}

impl QName {
    pub fn local(local: impl Into<String>) -> Self {
        Self {
            namespace: None,
            local: local.into(),
            prefix: None,
        }
    }

    pub fn qualified(
        namespace: impl Into<String>,
        prefix: impl Into<String>,
        local: impl Into<String>,
    ) -> Self {
        Self {
            namespace: Some(namespace.into()),
            local: local.into(),
            prefix: Some(prefix.into()),
        }
    }

    pub fn is(&self, namespace: &str, local: &str) -> bool {
        self.namespace.as_deref() == Some(namespace) && self.local == local
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(prefix) => write!(f, "{prefix}:{}", self.local),
            None => f.write_str(&self.local),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Attribute {
    pub name: QName,
    pub value: String,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: QName::local(name),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartTag {
    pub name: QName,
    pub attributes: Vec<Attribute>,
    /// `(prefix, uri)` declarations written on this tag; `""` is the default namespace.
    pub namespace_decls: Vec<(String, String)>,
}

impl StartTag {
    pub fn new(name: QName) -> Self {
        Self {
            name,
            attributes: Vec::new(),
            namespace_decls: Vec::new(),
        }
    }

    pub fn attribute(&self, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name.namespace.is_none() && a.name.local == local)
            .map(|a| a.value.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    StartDocument,
    EndDocument,
    StartTag(StartTag),
    EndTag(QName),
    Text(String),
    Comment(String),
    ProcessingInstruction { target: String, data: String },
}

impl Token {
    /// Whether the token opens a scope that a later token closes.
    pub fn opens(&self) -> bool {
        matches!(self, Token::StartDocument | Token::StartTag(_))
    }

    pub fn closes(&self) -> bool {
        matches!(self, Token::EndDocument | Token::EndTag(_))
    }
}

/// Namespace bindings in effect at some point of a document.
///
/// Snapshots share storage: a tag without declarations reuses its parent's map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Context(Arc<BTreeMap<String, String>>);

impl Context {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn lookup(&self, prefix: &str) -> Option<&str> {
        if prefix == "xml" {
            return Some(XML_NAMESPACE);
        }
        self.0.get(prefix).map(String::as_str).filter(|uri| !uri.is_empty())
    }

    /// Any non-default prefix bound to `uri`.
    pub fn prefix_for(&self, uri: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(prefix, bound)| !prefix.is_empty() && bound.as_str() == uri)
            .map(|(prefix, _)| prefix.as_str())
    }

    pub fn with_decls(&self, decls: &[(String, String)]) -> Context {
        if decls.is_empty() {
            return self.clone();
        }
        let mut bindings = (*self.0).clone();
        for (prefix, uri) in decls {
            bindings.insert(prefix.clone(), uri.clone());
        }
        Context(Arc::new(bindings))
    }

    /// Effective bindings compare equal, ignoring undeclared defaults.
    pub fn resolves_like(&self, other: &Context) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        let effective = |ctx: &Context| -> BTreeMap<String, String> {
            ctx.0
                .iter()
                .filter(|(_, uri)| !uri.is_empty())
                .map(|(p, u)| (p.clone(), u.clone()))
                .collect()
        };
        effective(self) == effective(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_shares_when_nothing_declared() {
        let root = Context::empty().with_decls(&[("a".into(), "urn:a".into())]);
        let child = root.with_decls(&[]);
        assert!(Arc::ptr_eq(&root.0, &child.0));
        assert_eq!(child.lookup("a"), Some("urn:a"));
        assert_eq!(child.lookup("xml"), Some(XML_NAMESPACE));
    }

    #[test]
    fn undeclared_default_resolves_like_empty() {
        let undeclared = Context::empty().with_decls(&[(String::new(), String::new())]);
        assert!(undeclared.resolves_like(&Context::empty()));
        assert_eq!(undeclared.lookup(""), None);
    }
}
