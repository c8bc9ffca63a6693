use super::{QName, StartTag, Token};

pub const SAFE_NAMESPACE: &str = "urn:raxs:safe";
const SAFE_PREFIX: &str = "xas";
const START_DOCUMENT: &str = "sd";
const END_DOCUMENT: &str = "ed";

/// Token-to-token rewrite applied while writing or reading a stream.
pub trait TokenTransform {
    fn transform(&mut self, token: Token, out: &mut Vec<Token>);
}

fn marker(local: &str) -> [Token; 2] {
    let name = QName::qualified(SAFE_NAMESPACE, SAFE_PREFIX, local);
    [Token::StartTag(StartTag::new(name.clone())), Token::EndTag(name)]
}

/// Wraps document tokens nested inside an outer document as marker elements,
/// so a delta can carry a whole-document node inside its own document.
#[derive(Debug)]
pub struct SafeEncoder {
    depth: i64,
}

impl Default for SafeEncoder {
    fn default() -> Self {
        Self { depth: -1 }
    }
}

impl TokenTransform for SafeEncoder {
    fn transform(&mut self, token: Token, out: &mut Vec<Token>) {
        match token {
            Token::StartDocument => {
                self.depth += 1;
                if self.depth > 0 {
                    out.extend(marker(START_DOCUMENT));
                } else {
                    out.push(Token::StartDocument);
                }
            }
            Token::EndDocument => {
                if self.depth > 0 {
                    out.extend(marker(END_DOCUMENT));
                } else {
                    out.push(Token::EndDocument);
                }
                self.depth -= 1;
            }
            Token::StartTag(tag) => {
                self.depth += 1;
                out.push(Token::StartTag(tag));
            }
            Token::EndTag(name) => {
                self.depth -= 1;
                out.push(Token::EndTag(name));
            }
            other => out.push(other),
        }
    }
}

/// Inverse of [`SafeEncoder`].
#[derive(Debug, Default)]
pub struct SafeDecoder;

impl TokenTransform for SafeDecoder {
    fn transform(&mut self, token: Token, out: &mut Vec<Token>) {
        match token {
            Token::StartTag(tag) if tag.name.is(SAFE_NAMESPACE, START_DOCUMENT) => {
                out.push(Token::StartDocument)
            }
            Token::StartTag(tag) if tag.name.is(SAFE_NAMESPACE, END_DOCUMENT) => {
                out.push(Token::EndDocument)
            }
            Token::EndTag(name)
                if name.is(SAFE_NAMESPACE, START_DOCUMENT) || name.is(SAFE_NAMESPACE, END_DOCUMENT) => {}
            other => out.push(other),
        }
    }
}
