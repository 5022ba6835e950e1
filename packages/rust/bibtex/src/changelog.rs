//! Markdown changelog of new and notably updated entries, grouped by venue.

use crate::entry::{Entry, Item};
use crate::map::OrderedMap;

/// Groups longer than this are folded into a `<details>` block.
const DETAILS_THRESHOLD: usize = 8;

/// Changelog lines grouped by source venue, in first-seen order.
#[derive(Debug, Default)]
pub struct Changelog {
    groups: OrderedMap<String, Vec<String>>,
}

impl Changelog {
    /// Build the changelog for the merged `items`.
    pub fn from_items(items: &[Item]) -> Self {
        let mut changelog = Self::default();
        for entry in items.iter().filter_map(Item::as_entry) {
            changelog.record(entry);
        }
        changelog
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of logged entries across all groups.
    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    fn record(&mut self, entry: &Entry) {
        let source = entry
            .field_value("booktitle")
            .or_else(|| entry.field_value("journaltitle"))
            .unwrap_or("Unknown");

        let mut title = entry.field_value("title").unwrap_or("No Title").to_string();
        if let Some(url) = entry.field_value("url").filter(|u| !u.is_empty()) {
            title = format!("[{title}]({url})");
        }

        let line = if entry.is_new {
            format!("- {title}  \n  _New entry_\n")
        } else if entry.updated {
            let mut what = Vec::new();
            if entry.updated_abstract {
                what.push("abstract");
            }
            if entry.updated_files {
                what.push("files");
            }
            if entry.updated_title {
                what.push("title");
            }
            let Some(summary) = join_changes(&what) else {
                return;
            };
            format!("- {title}  \n  _Updated {summary}_\n")
        } else {
            return;
        };

        match self.groups.get_mut(source) {
            Some(lines) => lines.push(line),
            None => {
                self.groups.insert(source.to_string(), vec![line]);
            }
        }
    }

    /// Render as Markdown, one section per source.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (source, lines) in self.groups.iter() {
            out.push_str(&format!("\n# {source}\n\n"));
            out.push_str(&format!("**{}** new or updated entries\n\n", lines.len()));
            let details = lines.len() > DETAILS_THRESHOLD;
            if details {
                out.push_str("<details>\n\n");
            }
            out.push_str(&lines.concat());
            out.push('\n');
            if details {
                out.push_str("</details>\n");
            }
            out.push('\n');
        }
        out
    }
}

/// `a`, `a and b`, `a, b, and c`.
fn join_changes(what: &[&str]) -> Option<String> {
    match what {
        [] => None,
        [one] => Some((*one).to_string()),
        [first, second] => Some(format!("{first} and {second}")),
        [init @ .., last] => Some(format!("{}, and {last}", init.join(", "))),
    }
}
