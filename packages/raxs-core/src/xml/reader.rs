use super::{Attribute, Context, QName, StartTag, Token};
use crate::error::{Error, Result};

const CDATA_OPEN: &[u8] = b"<![CDATA[";
/// Zero-length CDATA section. Writers emit it between adjacent text runs so
/// that they parse back as separate text tokens.
pub(crate) const TEXT_BOUNDARY: &[u8] = b"<![CDATA[]]>";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    /// A whole document: emits `StartDocument`/`EndDocument` and skips
    /// whitespace outside the document element.
    Document,
    /// A balanced byte range cut out of a document.
    Fragment,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenSpan {
    pub token: Token,
    /// Absolute byte offset of the first byte of the token.
    pub start: u64,
    /// Absolute byte offset one past the token.
    pub end: u64,
}

/// Pull tokenizer over an in-memory byte slice.
///
/// Offsets are reported relative to `base`, so a reader over a slice cut from
/// a file reports file offsets. Empty elements (`<a/>`) yield a start tag
/// followed by a zero-width end tag.
pub struct XmlReader<'a> {
    input: &'a [u8],
    base: u64,
    pos: usize,
    mode: ReadMode,
    started: bool,
    finished: bool,
    scopes: Vec<Context>,
    open: Vec<String>,
    pending_end: Option<QName>,
}

impl<'a> XmlReader<'a> {
    pub fn document(input: &'a [u8]) -> Self {
        Self::new(input, 0, Context::empty(), ReadMode::Document)
    }

    /// Reads a range starting at absolute offset `base`, resolving names
    /// against the bindings in effect at that offset.
    pub fn fragment(input: &'a [u8], base: u64, context: Context) -> Self {
        Self::new(input, base, context, ReadMode::Fragment)
    }

    fn new(input: &'a [u8], base: u64, context: Context, mode: ReadMode) -> Self {
        Self {
            input,
            base,
            pos: 0,
            mode,
            started: false,
            finished: false,
            scopes: vec![context],
            open: Vec::new(),
            pending_end: None,
        }
    }

    /// Bindings in effect at the current position.
    pub fn context(&self) -> Context {
        self.scopes.last().cloned().unwrap_or_default()
    }

    /// Number of open elements.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    pub fn position(&self) -> u64 {
        self.base + self.pos as u64
    }

    /// Drains the reader.
    pub fn collect_tokens(mut self) -> Result<Vec<TokenSpan>> {
        let mut out = Vec::new();
        while let Some(span) = self.next_token()? {
            out.push(span);
        }
        Ok(out)
    }

    pub fn next_token(&mut self) -> Result<Option<TokenSpan>> {
        if let Some(name) = self.pending_end.take() {
            self.close_scope();
            let at = self.position();
            return Ok(Some(TokenSpan {
                token: Token::EndTag(name),
                start: at,
                end: at,
            }));
        }
        if self.mode == ReadMode::Document && !self.started {
            self.started = true;
            self.skip_declaration()?;
            return Ok(Some(self.span(Token::StartDocument, 0)));
        }
        loop {
            if self.mode == ReadMode::Document && self.open.is_empty() {
                self.skip_whitespace();
            }
            if self.pos >= self.input.len() {
                return self.finish();
            }
            let start = self.pos;
            let rest = &self.input[self.pos..];
            if rest.starts_with(TEXT_BOUNDARY) {
                self.pos += TEXT_BOUNDARY.len();
                continue;
            }
            if rest[0] != b'<' || rest.starts_with(CDATA_OPEN) {
                if self.mode == ReadMode::Document && self.open.is_empty() {
                    return Err(self.error("text outside the document element", start));
                }
                let text = self.read_text()?;
                return Ok(Some(self.span(Token::Text(text), start)));
            }
            if rest.starts_with(b"<!--") {
                let body = self.take_until(start + 4, b"-->", "unterminated comment")?;
                return Ok(Some(self.span(Token::Comment(body), start)));
            }
            if rest.starts_with(b"<!DOCTYPE") {
                self.skip_doctype(start)?;
                continue;
            }
            if rest.starts_with(b"<?") {
                let body = self.take_until(start + 2, b"?>", "unterminated processing instruction")?;
                let (target, data) = match body.find(|c: char| c.is_ascii_whitespace()) {
                    Some(split) => (body[..split].to_string(), body[split..].trim_start().to_string()),
                    None => (body, String::new()),
                };
                return Ok(Some(self.span(
                    Token::ProcessingInstruction { target, data },
                    start,
                )));
            }
            if rest.starts_with(b"</") {
                return self.read_end_tag(start).map(Some);
            }
            return self.read_start_tag(start).map(Some);
        }
    }

    fn finish(&mut self) -> Result<Option<TokenSpan>> {
        if let Some(raw) = self.open.last() {
            let message = format!("unclosed element <{raw}>");
            return Err(self.error(message, self.input.len()));
        }
        if self.mode == ReadMode::Document && !self.finished {
            self.finished = true;
            let at = self.position();
            return Ok(Some(TokenSpan {
                token: Token::EndDocument,
                start: at,
                end: at,
            }));
        }
        Ok(None)
    }

    fn read_start_tag(&mut self, start: usize) -> Result<TokenSpan> {
        self.pos += 1;
        let raw_name = self.read_name()?;
        let mut raw_attributes: Vec<(String, String)> = Vec::new();
        let self_closing = loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'>') => {
                    self.pos += 1;
                    break false;
                }
                Some(b'/') => {
                    if self.input.get(self.pos + 1) != Some(&b'>') {
                        return Err(self.error("expected '/>'", self.pos));
                    }
                    self.pos += 2;
                    break true;
                }
                Some(_) => {
                    let name = self.read_name()?;
                    self.skip_whitespace();
                    if self.peek() != Some(b'=') {
                        return Err(self.error("expected '=' after attribute name", self.pos));
                    }
                    self.pos += 1;
                    self.skip_whitespace();
                    let quote = match self.peek() {
                        Some(q @ (b'"' | b'\'')) => q,
                        _ => return Err(self.error("expected quoted attribute value", self.pos)),
                    };
                    let value_start = self.pos + 1;
                    let len = self.input[value_start..]
                        .iter()
                        .position(|&b| b == quote)
                        .ok_or_else(|| self.error("unterminated attribute value", value_start))?;
                    let mut value = String::new();
                    self.unescape(&self.input[value_start..value_start + len], value_start, &mut value)?;
                    self.pos = value_start + len + 1;
                    raw_attributes.push((name, value));
                }
                None => return Err(self.error("unterminated start tag", start)),
            }
        };

        let mut namespace_decls = Vec::new();
        let mut plain = Vec::new();
        for (name, value) in raw_attributes {
            if name == "xmlns" {
                namespace_decls.push((String::new(), value));
            } else if let Some(prefix) = name.strip_prefix("xmlns:") {
                namespace_decls.push((prefix.to_string(), value));
            } else {
                plain.push((name, value));
            }
        }
        let scope = self.context().with_decls(&namespace_decls);
        let name = self.resolve(&raw_name, &scope, true, start)?;
        let mut attributes: Vec<Attribute> = Vec::with_capacity(plain.len());
        for (raw, value) in plain {
            let attr_name = self.resolve(&raw, &scope, false, start)?;
            if attributes
                .iter()
                .any(|a| a.name.namespace == attr_name.namespace && a.name.local == attr_name.local)
            {
                return Err(self.error(format!("duplicate attribute {raw}"), start));
            }
            attributes.push(Attribute {
                name: attr_name,
                value,
            });
        }

        self.scopes.push(scope);
        self.open.push(raw_name);
        if self_closing {
            self.pending_end = Some(name.clone());
        }
        Ok(self.span(
            Token::StartTag(StartTag {
                name,
                attributes,
                namespace_decls,
            }),
            start,
        ))
    }

    fn read_end_tag(&mut self, start: usize) -> Result<TokenSpan> {
        self.pos += 2;
        let raw = self.read_name()?;
        self.skip_whitespace();
        if self.peek() != Some(b'>') {
            return Err(self.error("expected '>' in end tag", self.pos));
        }
        self.pos += 1;
        match self.open.last() {
            Some(expected) if *expected == raw => {}
            Some(expected) => {
                let message = format!("end tag </{raw}> does not match <{expected}>");
                return Err(self.error(message, start));
            }
            None => return Err(self.error(format!("unexpected end tag </{raw}>"), start)),
        }
        let name = self.resolve(&raw, &self.context(), true, start)?;
        self.close_scope();
        Ok(self.span(Token::EndTag(name), start))
    }

    fn close_scope(&mut self) {
        self.open.pop();
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    fn resolve(&self, raw: &str, scope: &Context, element: bool, at: usize) -> Result<QName> {
        match raw.split_once(':') {
            Some((prefix, local)) => {
                let uri = scope
                    .lookup(prefix)
                    .ok_or_else(|| self.error(format!("unbound prefix {prefix:?}"), at))?;
                Ok(QName {
                    namespace: Some(uri.to_string()),
                    local: local.to_string(),
                    prefix: Some(prefix.to_string()),
                })
            }
            None => Ok(QName {
                namespace: if element {
                    scope.lookup("").map(str::to_string)
                } else {
                    None
                },
                local: raw.to_string(),
                prefix: None,
            }),
        }
    }

    fn read_text(&mut self) -> Result<String> {
        let mut out = String::new();
        loop {
            let rest = &self.input[self.pos..];
            if rest.is_empty() || rest.starts_with(TEXT_BOUNDARY) {
                break;
            }
            if rest.starts_with(CDATA_OPEN) {
                let body = self.take_until(self.pos + CDATA_OPEN.len(), b"]]>", "unterminated CDATA section")?;
                out.push_str(&body);
                continue;
            }
            if rest[0] == b'<' {
                break;
            }
            let len = rest.iter().position(|&b| b == b'<').unwrap_or(rest.len());
            let at = self.pos;
            self.unescape(&self.input[at..at + len], at, &mut out)?;
            self.pos += len;
        }
        Ok(out)
    }

    /// Returns the text between `from` and `terminator` and moves past the terminator.
    fn take_until(&mut self, from: usize, terminator: &[u8], message: &str) -> Result<String> {
        let len = find(&self.input[from.min(self.input.len())..], terminator)
            .ok_or_else(|| self.error(message, self.pos))?;
        let body = std::str::from_utf8(&self.input[from..from + len])
            .map_err(|_| self.error("invalid UTF-8", from))?
            .to_string();
        self.pos = from + len + terminator.len();
        Ok(body)
    }

    fn unescape(&self, raw: &[u8], at: usize, out: &mut String) -> Result<()> {
        let text = std::str::from_utf8(raw).map_err(|_| self.error("invalid UTF-8", at))?;
        let mut rest = text;
        while let Some(amp) = rest.find('&') {
            out.push_str(&rest[..amp]);
            let after = &rest[amp + 1..];
            let semi = after
                .find(';')
                .ok_or_else(|| self.error("unterminated entity reference", at))?;
            let entity = &after[..semi];
            let ch = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => {
                    if let Some(hex) = entity.strip_prefix("#x") {
                        u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
                    } else if let Some(dec) = entity.strip_prefix('#') {
                        dec.parse::<u32>().ok().and_then(char::from_u32)
                    } else {
                        None
                    }
                }
            };
            match ch {
                Some(ch) => out.push(ch),
                None => return Err(self.error(format!("unknown entity &{entity};"), at)),
            }
            rest = &after[semi + 1..];
        }
        out.push_str(rest);
        Ok(())
    }

    fn read_name(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() || matches!(b, b'>' | b'/' | b'=' | b'<') {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("expected a name", start));
        }
        std::str::from_utf8(&self.input[start..self.pos])
            .map(str::to_string)
            .map_err(|_| self.error("invalid UTF-8 in name", start))
    }

    fn skip_declaration(&mut self) -> Result<()> {
        if self.input.starts_with(&[0xEF, 0xBB, 0xBF]) {
            self.pos = 3;
        }
        let rest = &self.input[self.pos..];
        if rest.starts_with(b"<?xml")
            && rest
                .get(5)
                .is_some_and(|b| b.is_ascii_whitespace() || *b == b'?')
        {
            self.take_until(self.pos + 5, b"?>", "unterminated XML declaration")?;
        }
        Ok(())
    }

    fn skip_doctype(&mut self, start: usize) -> Result<()> {
        let rest = &self.input[start..];
        let close = rest.iter().position(|&b| b == b'>');
        let subset = rest.iter().position(|&b| b == b'[');
        let end = match (subset, close) {
            (Some(open), Some(close)) if open < close => {
                find(&rest[open..], b"]>").map(|i| open + i + 2)
            }
            (_, Some(close)) => Some(close + 1),
            _ => None,
        };
        let end = end.ok_or_else(|| self.error("unterminated DOCTYPE", start))?;
        self.pos = start + end;
        Ok(())
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn span(&self, token: Token, start: usize) -> TokenSpan {
        TokenSpan {
            token,
            start: self.base + start as u64,
            end: self.base + self.pos as u64,
        }
    }

    fn error(&self, message: impl Into<String>, at: usize) -> Error {
        let at = at.min(self.input.len());
        Error::parse(message, self.base + at as u64, &self.input[at..])
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
