use std::io::{Read, Write};

use super::reader::TEXT_BOUNDARY;
use super::{Context, QName, StartTag, Token};
use crate::error::Result;

const COPY_CHUNK: usize = 64 * 1024;

/// Whether a raw range starts or ends with a text node. Text written next to
/// text needs a boundary marker, and bytes alone cannot tell: a text node
/// may be a CDATA section or end in `>`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextEdges {
    pub leading: bool,
    pub trailing: bool,
}

/// Serializes tokens, declaring namespace prefixes where the output scope
/// does not already bind them.
pub struct XmlWriter<W: Write> {
    out: W,
    scope: Context,
    saved: Vec<Context>,
    open: Vec<String>,
    start_pending: bool,
    last_was_text: bool,
    generated: u32,
    written: u64,
}

impl<W: Write> XmlWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            scope: Context::empty(),
            saved: Vec::new(),
            open: Vec::new(),
            start_pending: false,
            last_was_text: false,
            generated: 0,
            written: 0,
        }
    }

    /// Bindings in effect where the next token will be written.
    pub fn context(&self) -> &Context {
        &self.scope
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn write_token(&mut self, token: &Token) -> Result<()> {
        match token {
            Token::StartDocument => {
                self.close_start()?;
                if self.written == 0 {
                    self.emit(b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n")?;
                }
                self.last_was_text = false;
            }
            Token::EndDocument => {
                self.close_start()?;
                self.last_was_text = false;
            }
            Token::StartTag(tag) => self.write_start(tag)?,
            Token::EndTag(_) => self.write_end()?,
            Token::Text(text) => {
                if text.is_empty() {
                    return Ok(());
                }
                self.close_start()?;
                if self.last_was_text {
                    self.emit(TEXT_BOUNDARY)?;
                }
                let escaped = escape(text, false);
                self.emit(escaped.as_bytes())?;
                self.last_was_text = true;
            }
            Token::Comment(body) => {
                self.close_start()?;
                self.emit(b"<!--")?;
                self.emit(body.as_bytes())?;
                self.emit(b"-->")?;
                self.last_was_text = false;
            }
            Token::ProcessingInstruction { target, data } => {
                self.close_start()?;
                let pi = if data.is_empty() {
                    format!("<?{target}?>")
                } else {
                    format!("<?{target} {data}?>")
                };
                self.emit(pi.as_bytes())?;
                self.last_was_text = false;
            }
        }
        Ok(())
    }

    /// Copies already-serialized markup. The caller guarantees the bytes are
    /// balanced and valid under [`XmlWriter::context`], and says whether they
    /// begin or end with a text node.
    pub fn write_raw(&mut self, bytes: &[u8], edges: TextEdges) -> Result<()> {
        let mut source = bytes;
        self.copy_raw(&mut source, bytes.len() as u64, edges)
    }

    /// Streaming form of [`XmlWriter::write_raw`].
    pub fn copy_raw<R: Read>(&mut self, source: &mut R, length: u64, edges: TextEdges) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        self.close_start()?;
        if self.last_was_text && edges.leading {
            self.emit(TEXT_BOUNDARY)?;
        }
        let mut buf = vec![0u8; (length as usize).min(COPY_CHUNK)];
        let mut remaining = length;
        while remaining > 0 {
            let n = (remaining as usize).min(buf.len());
            source.read_exact(&mut buf[..n])?;
            self.emit(&buf[..n])?;
            remaining -= n as u64;
        }
        self.last_was_text = edges.trailing;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.close_start()?;
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(mut self) -> Result<W> {
        self.flush()?;
        Ok(self.out)
    }

    fn write_start(&mut self, tag: &StartTag) -> Result<()> {
        self.close_start()?;
        let parent = self.context().clone();
        let mut decls: Vec<(String, String)> = Vec::new();
        for (prefix, uri) in &tag.namespace_decls {
            if parent.lookup(prefix).unwrap_or("") != uri.as_str() {
                decls.push((prefix.clone(), uri.clone()));
            }
        }

        let element = Self::element_name(&tag.name, &parent, &mut decls);
        let mut attributes = Vec::with_capacity(tag.attributes.len());
        for attr in &tag.attributes {
            let name = self.attribute_name(&attr.name, &parent, &mut decls);
            attributes.push((name, escape(&attr.value, true)));
        }

        let mut markup = format!("<{element}");
        for (name, value) in &attributes {
            markup.push_str(&format!(" {name}=\"{value}\""));
        }
        for (prefix, uri) in &decls {
            let uri = escape(uri, true);
            if prefix.is_empty() {
                markup.push_str(&format!(" xmlns=\"{uri}\""));
            } else {
                markup.push_str(&format!(" xmlns:{prefix}=\"{uri}\""));
            }
        }
        self.emit(markup.as_bytes())?;
        let scope = parent.with_decls(&decls);
        self.saved.push(std::mem::replace(&mut self.scope, scope));
        self.open.push(element);
        self.start_pending = true;
        self.last_was_text = false;
        Ok(())
    }

    fn write_end(&mut self) -> Result<()> {
        let name = self.open.pop().unwrap_or_default();
        if self.start_pending {
            self.start_pending = false;
            self.emit(b"/>")?;
        } else {
            let markup = format!("</{name}>");
            self.emit(markup.as_bytes())?;
        }
        if let Some(previous) = self.saved.pop() {
            self.scope = previous;
        }
        self.last_was_text = false;
        Ok(())
    }

    fn element_name(
        name: &QName,
        parent: &Context,
        decls: &mut Vec<(String, String)>,
    ) -> String {
        let bound = |prefix: &str, decls: &[(String, String)]| -> Option<String> {
            decls
                .iter()
                .rev()
                .find(|(p, _)| p == prefix)
                .map(|(_, uri)| uri.clone())
                .or_else(|| parent.lookup(prefix).map(str::to_string))
                .filter(|uri| !uri.is_empty())
        };
        match (&name.namespace, &name.prefix) {
            (Some(uri), Some(prefix)) => {
                if bound(prefix, decls.as_slice()).as_deref() != Some(uri.as_str()) {
                    decls.retain(|(p, _)| p != prefix);
                    decls.push((prefix.clone(), uri.clone()));
                }
                format!("{prefix}:{}", name.local)
            }
            (Some(uri), None) => {
                if bound("", decls.as_slice()).as_deref() != Some(uri.as_str()) {
                    decls.retain(|(p, _)| !p.is_empty());
                    decls.push((String::new(), uri.clone()));
                }
                name.local.clone()
            }
            (None, _) => {
                if bound("", decls.as_slice()).is_some() {
                    decls.retain(|(p, _)| !p.is_empty());
                    decls.push((String::new(), String::new()));
                }
                name.local.clone()
            }
        }
    }

    fn attribute_name(
        &mut self,
        name: &QName,
        parent: &Context,
        decls: &mut Vec<(String, String)>,
    ) -> String {
        let Some(uri) = &name.namespace else {
            return name.local.clone();
        };
        let bound = |prefix: &str, decls: &[(String, String)]| -> Option<String> {
            decls
                .iter()
                .rev()
                .find(|(p, _)| p == prefix)
                .map(|(_, u)| u.clone())
                .or_else(|| parent.lookup(prefix).map(str::to_string))
        };
        if let Some(prefix) = &name.prefix {
            match bound(prefix, decls.as_slice()) {
                Some(existing) if existing == *uri => return format!("{prefix}:{}", name.local),
                None => {
                    decls.push((prefix.clone(), uri.clone()));
                    return format!("{prefix}:{}", name.local);
                }
                Some(_) => {}
            }
        }
        if let Some((prefix, _)) = decls.iter().find(|(p, u)| !p.is_empty() && u == uri) {
            return format!("{prefix}:{}", name.local);
        }
        if let Some(prefix) = parent.prefix_for(uri) {
            let prefix = prefix.to_string();
            if !decls.iter().any(|(p, _)| *p == prefix) {
                return format!("{prefix}:{}", name.local);
            }
        }
        let prefix = loop {
            self.generated += 1;
            let candidate = format!("ns{}", self.generated);
            if bound(&candidate, decls.as_slice()).is_none() {
                break candidate;
            }
        };
        decls.push((prefix.clone(), uri.clone()));
        format!("{prefix}:{}", name.local)
    }

    fn close_start(&mut self) -> Result<()> {
        if self.start_pending {
            self.start_pending = false;
            self.emit(b">")?;
        }
        Ok(())
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }
}

fn escape(text: &str, attribute: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            '\n' if attribute => out.push_str("&#10;"),
            '\t' if attribute => out.push_str("&#9;"),
            '\r' => out.push_str("&#13;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::{Attribute, XmlReader};

    fn render(tokens: &[Token]) -> String {
        let mut writer = XmlWriter::new(Vec::new());
        for token in tokens {
            writer.write_token(token).unwrap();
        }
        String::from_utf8(writer.into_inner().unwrap()).unwrap()
    }

    #[test]
    fn collapses_empty_elements_and_escapes() {
        let mut tag = StartTag::new(QName::local("a"));
        tag.attributes.push(Attribute::new("q", "\"<&>\""));
        let out = render(&[
            Token::StartTag(tag),
            Token::Text("1 < 2".into()),
            Token::StartTag(StartTag::new(QName::local("b"))),
            Token::EndTag(QName::local("b")),
            Token::EndTag(QName::local("a")),
        ]);
        assert_eq!(out, "<a q=\"&quot;&lt;&amp;&gt;&quot;\">1 &lt; 2<b/></a>");
    }

    #[test]
    fn declares_missing_namespaces_once() {
        let outer = StartTag::new(QName::qualified("urn:x", "x", "outer"));
        let inner = StartTag::new(QName::qualified("urn:x", "x", "inner"));
        let out = render(&[
            Token::StartTag(outer),
            Token::StartTag(inner),
            Token::EndTag(QName::local("inner")),
            Token::EndTag(QName::local("outer")),
        ]);
        assert_eq!(out, "<x:outer xmlns:x=\"urn:x\"><x:inner/></x:outer>");
    }

    #[test]
    fn adjacent_text_gets_boundary_marker() {
        let out = render(&[
            Token::StartTag(StartTag::new(QName::local("a"))),
            Token::Text("x".into()),
            Token::Text("y".into()),
            Token::EndTag(QName::local("a")),
        ]);
        assert_eq!(out, "<a>x<![CDATA[]]>y</a>");
        let texts = XmlReader::document(out.as_bytes())
            .collect_tokens()
            .unwrap()
            .into_iter()
            .filter(|s| matches!(s.token, Token::Text(_)))
            .count();
        assert_eq!(texts, 2);
    }

    #[test]
    fn default_namespace_is_undeclared_for_plain_children() {
        let out = render(&[
            Token::StartTag(StartTag::new(QName {
                namespace: Some("urn:d".into()),
                local: "a".into(),
                prefix: None,
            })),
            Token::StartTag(StartTag::new(QName::local("b"))),
            Token::EndTag(QName::local("b")),
            Token::EndTag(QName::local("a")),
        ]);
        assert_eq!(out, "<a xmlns=\"urn:d\"><b xmlns=\"\"/></a>");
    }

    #[test]
    fn raw_text_edges_come_from_the_caller() {
        let text = TextEdges {
            leading: true,
            trailing: true,
        };
        let mut writer = XmlWriter::new(Vec::new());
        writer
            .write_token(&Token::StartTag(StartTag::new(QName::local("r"))))
            .unwrap();
        writer.write_raw(b"<![CDATA[x]]>", text).unwrap();
        writer.write_token(&Token::Text("y".into())).unwrap();
        writer.write_raw(b"a>", text).unwrap();
        writer.write_raw(b"<b/>", TextEdges::default()).unwrap();
        writer.write_token(&Token::Text("z".into())).unwrap();
        writer.write_token(&Token::EndTag(QName::local("r"))).unwrap();
        let out = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert_eq!(out, "<r><![CDATA[x]]><![CDATA[]]>y<![CDATA[]]>a><b/>z</r>");

        let texts: Vec<String> = XmlReader::document(out.as_bytes())
            .collect_tokens()
            .unwrap()
            .into_iter()
            .filter_map(|s| match s.token {
                Token::Text(t) => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["x", "y", "a>", "z"]);
    }
}
