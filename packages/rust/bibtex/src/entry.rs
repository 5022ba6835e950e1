//! Bibliography items as they appear in a `.bib` file.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::map::OrderedMap;

/// Whitespace runs ending a line, collapsed to a bare newline.
static TRAILING_LINE_WS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+\n").expect("trailing line whitespace regex"));

/// Whitespace before a newline or the end of a value.
static TRAILING_VALUE_WS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+(\n|$)").expect("trailing value whitespace regex"));

/// Whitespace right before a field's closing delimiter.
static BEFORE_CLOSER_WS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\s+("|\})(\s*,?\s*)$"#).expect("closing delimiter regex")
});

/// One `name = value` pair of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field name as written in the source.
    pub name: String,
    /// Value parts joined with `#`, outer delimiters removed.
    pub value: String,
    /// Source text from after the preceding comma through this field's own
    /// trailing comma (if any).
    pub raw: String,
}

/// Fields keyed by lowercased name.
pub type Fields = OrderedMap<String, Field>;

/// A regular `@type{key, ...}` entry.
#[derive(Debug, Clone)]
pub struct Entry {
    pub entry_type: String,
    pub key: String,
    pub raw: String,
    pub fields: Fields,
    /// Rendered from `fields` instead of `raw`.
    pub updated: bool,
    pub updated_abstract: bool,
    pub updated_files: bool,
    pub updated_title: bool,
    /// Came from the scraped file and had no counterpart in the main one.
    pub is_new: bool,
}

impl Entry {
    pub fn new(
        entry_type: impl Into<String>,
        key: impl Into<String>,
        raw: impl Into<String>,
        fields: Fields,
    ) -> Self {
        Self {
            entry_type: entry_type.into(),
            key: key.into(),
            raw: raw.into(),
            fields,
            updated: false,
            updated_abstract: false,
            updated_files: false,
            updated_title: false,
            is_new: true,
        }
    }

    /// Value of the field `name` (lowercase), if present.
    pub fn field_value(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|f| f.value.as_str())
    }

    /// Strip trailing whitespace from the raw text and from field values.
    ///
    /// An entry whose values changed is marked updated so that it renders
    /// from its cleaned fields.
    pub fn strip_trailing_whitespace(&mut self) {
        self.raw = TRAILING_LINE_WS_RE.replace_all(&self.raw, "\n").into_owned();

        for field in self.fields.values_mut() {
            field.raw = TRAILING_LINE_WS_RE
                .replace_all(&field.raw, "\n")
                .into_owned();
            let clean = TRAILING_VALUE_WS_RE
                .replace_all(&field.value, "$1")
                .into_owned();
            if clean == field.value {
                continue;
            }
            self.updated = true;
            field.value = clean;
            field.raw = BEFORE_CLOSER_WS_RE
                .replace_all(&field.raw, "$1$2")
                .into_owned();
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.updated {
            return f.write_str(&self.raw);
        }

        let mut out = format!("@{}{{{},", self.entry_type, self.key);
        for field in self.fields.values() {
            out.push_str(&field.raw);
        }
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push('}');
        f.write_str(&out)
    }
}

/// Anything that can appear in a bibliography file, in order.
#[derive(Debug, Clone)]
pub enum Item {
    /// Text between commands, kept verbatim.
    Blank(String),
    /// An `@comment{...}` command, kept verbatim.
    Comment(String),
    Entry(Entry),
    /// Spacing inserted around merged-in entries.
    Separator(String),
}

impl Item {
    pub fn as_entry(&self) -> Option<&Entry> {
        match self {
            Self::Entry(entry) => Some(entry),
            _ => None,
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blank(raw) | Self::Comment(raw) | Self::Separator(raw) => f.write_str(raw),
            Self::Entry(entry) => entry.fmt(f),
        }
    }
}

/// Identity of an item within one file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemKey {
    /// Blank text, by position.
    Blank(usize),
    /// Comment, by its full text; identical comments collapse.
    Raw(String),
    /// Entry, by citation key.
    Id(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, value: &str, raw: &str) -> (String, Field) {
        (
            name.to_lowercase(),
            Field {
                name: name.into(),
                value: value.into(),
                raw: raw.into(),
            },
        )
    }

    #[test]
    fn unchanged_entry_renders_raw() {
        let raw = "@article{k,\n  title = {T}\n}";
        let entry = Entry::new("article", "k", raw, Fields::new());
        assert_eq!(entry.to_string(), raw);
    }

    #[test]
    fn updated_entry_renders_fields() {
        let fields: Fields = [
            field("title", "T", "\n  title = {T},"),
            field("year", "2024", "\n  year = {2024},"),
        ]
        .into_iter()
        .collect();
        let mut entry = Entry::new("inproceedings", "key", "", fields);
        entry.updated = true;
        assert_eq!(
            entry.to_string(),
            "@inproceedings{key,\n  title = {T},\n  year = {2024},\n}"
        );
    }

    #[test]
    fn trailing_whitespace_in_value_marks_update() {
        let fields: Fields = [field("title", "Hello  ", "\n  title = {Hello  },")]
            .into_iter()
            .collect();
        let mut entry = Entry::new("misc", "k", "@misc{k,\n  title = {Hello  },\n}", fields);
        entry.strip_trailing_whitespace();

        assert!(entry.updated);
        let title = entry.fields.get("title").expect("title");
        assert_eq!(title.value, "Hello");
        assert_eq!(title.raw, "\n  title = {Hello},");
    }

    #[test]
    fn trailing_line_whitespace_only_touches_raw() {
        let fields: Fields = [field("title", "Hi", "\n  title = {Hi},   \n")]
            .into_iter()
            .collect();
        let mut entry = Entry::new("misc", "k", "@misc{k,   \n  title = {Hi},\n}", fields);
        entry.strip_trailing_whitespace();

        assert!(!entry.updated);
        assert_eq!(entry.raw, "@misc{k,\n  title = {Hi},\n}");
        assert_eq!(entry.fields.get("title").expect("title").raw, "\n  title = {Hi},\n");
    }
}
