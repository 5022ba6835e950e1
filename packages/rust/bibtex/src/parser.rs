//! Lossless low-level BibTeX parser.
//!
//! Splits a bibliography into blanks, comments and entries while keeping
//! every byte of the source, so untouched items can be written back
//! verbatim:
//! - Blank: text up to the next `@`
//! - Comment: `@comment{...}` (or `(...)`), brace-balanced
//! - Entry: `@type{key, name = value # value, ...}`
//!
//! `@string` and `@preamble` are not supported.

use bibsync_shared::{BibsyncError, Result};

use crate::entry::{Entry, Field, Fields, Item, ItemKey};
use crate::map::OrderedMap;

/// Items keyed for merging, in file order.
pub type Bibliography = OrderedMap<ItemKey, Item>;

/// Parse `text` into keyed items.
///
/// `new` marks every entry as originating from the scraped side.
pub fn parse_bibliography(text: &str, new: bool) -> Result<Bibliography> {
    let items = Parser::new(text).parse()?;

    let mut bib = Bibliography::new();
    for (i, mut item) in items.into_iter().enumerate() {
        let key = match &mut item {
            Item::Blank(_) | Item::Separator(_) => ItemKey::Blank(i),
            Item::Comment(raw) => ItemKey::Raw(raw.clone()),
            Item::Entry(entry) => {
                entry.is_new = new;
                ItemKey::Id(entry.key.clone())
            }
        };
        bib.insert(key, item);
    }
    Ok(bib)
}

/// Characters allowed in command and field names.
fn is_name_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '"' | '#' | '%' | '\'' | '(' | ')' | ',' | '=' | '{' | '}')
}

pub(crate) struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    pub(crate) fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    /// Parse the whole text into items in source order.
    pub(crate) fn parse(mut self) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        loop {
            let start = self.pos;
            let Some(offset) = self.text[start..].find('@') else {
                items.push(Item::Blank(self.text[start..].to_string()));
                return Ok(items);
            };
            let at = start + offset;
            items.push(Item::Blank(self.text[start..at].to_string()));
            self.pos = at + 1;
            items.push(self.parse_command(at)?);
        }
    }

    fn parse_command(&mut self, at: usize) -> Result<Item> {
        self.skip_whitespace();
        let name = self.take_while(is_name_char);
        if name.is_empty() {
            return Err(self.error("expected command name after `@`"));
        }

        self.skip_whitespace();
        let body_end = match self.peek() {
            Some('{') => '}',
            Some('(') => ')',
            _ => return Err(self.error(format!("expected `{{` or `(` after `@{name}`"))),
        };
        self.pos += 1;

        match name.to_lowercase().as_str() {
            "string" | "preamble" => Err(self.error(format!("`@{name}` is not supported"))),
            "comment" => {
                self.parse_delimited(body_end)?;
                Ok(Item::Comment(self.text[at..self.pos].to_string()))
            }
            _ => {
                let (key, fields) = self.parse_entry_body(body_end)?;
                let raw = &self.text[at..self.pos];
                Ok(Item::Entry(Entry::new(name, key, raw, fields)))
            }
        }
    }

    fn parse_entry_body(&mut self, body_end: char) -> Result<(String, Fields)> {
        self.skip_whitespace();
        let key = self
            .take_while(|c| !c.is_whitespace() && c != ',' && (body_end == ')' || c != '}'))
            .to_string();
        if key.is_empty() {
            return Err(self.error("expected entry key"));
        }

        let mut fields = Fields::new();
        loop {
            let field_start = self.pos;
            self.skip_whitespace();
            let name = self.take_while(is_name_char);
            let mut value = None;
            if !name.is_empty() {
                self.skip_whitespace();
                self.expect('=')?;
                value = Some(self.parse_value()?.join("#"));
            }

            self.skip_whitespace();
            let comma = self.peek() == Some(',');
            if comma {
                self.pos += 1;
            }

            if let Some(value) = value {
                fields.insert(
                    name.to_lowercase(),
                    Field {
                        name: name.to_string(),
                        value,
                        raw: self.text[field_start..self.pos].to_string(),
                    },
                );
            }
            if !comma {
                break;
            }
        }

        self.skip_whitespace();
        self.expect(body_end)?;
        Ok((key, fields))
    }

    /// Parse `part # part # ...`, returning each part without delimiters.
    fn parse_value(&mut self) -> Result<Vec<String>> {
        let mut parts = Vec::new();
        loop {
            self.skip_whitespace();
            let part = match self.peek() {
                Some('"') => {
                    self.pos += 1;
                    self.parse_delimited('"')?
                }
                Some('{') => {
                    self.pos += 1;
                    self.parse_delimited('}')?
                }
                Some(c) if c.is_ascii_digit() => self.take_while(|c| c.is_ascii_digit()),
                _ => {
                    let name = self.take_while(is_name_char);
                    if name.is_empty() {
                        return Err(self.error("expected field value"));
                    }
                    name
                }
            };
            parts.push(part.to_string());

            self.skip_whitespace();
            if self.peek() != Some('#') {
                return Ok(parts);
            }
            self.pos += 1;
        }
    }

    /// Consume up to and including `end` at brace depth zero, returning the
    /// text in between. The opening delimiter must already be consumed.
    fn parse_delimited(&mut self, end: char) -> Result<&'a str> {
        let text = self.text;
        let start = self.pos;
        let mut depth = 0usize;
        for (offset, c) in text[start..].char_indices() {
            if c == end && depth == 0 {
                self.pos = start + offset + c.len_utf8();
                return Ok(&text[start..start + offset]);
            }
            match c {
                '{' => depth += 1,
                '}' if depth == 0 => {
                    self.pos = start + offset;
                    return Err(self.error("unbalanced `}`"));
                }
                '}' => depth -= 1,
                _ => {}
            }
        }
        self.pos = start;
        Err(self.error(format!("unterminated value, expected `{end}`")))
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.peek() != Some(c) {
            let found = self
                .peek()
                .map_or_else(|| "end of input".to_string(), |f| format!("`{f}`"));
            return Err(self.error(format!("expected `{c}`, found {found}")));
        }
        self.pos += c.len_utf8();
        Ok(())
    }

    fn skip_whitespace(&mut self) {
        self.take_while(char::is_whitespace);
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let text = self.text;
        let rest = &text[self.pos..];
        let len = rest.find(|c: char| !pred(c)).unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn error(&self, message: impl Into<String>) -> BibsyncError {
        let line = self.text[..self.pos].matches('\n').count() + 1;
        BibsyncError::parse(line, message)
    }
}
