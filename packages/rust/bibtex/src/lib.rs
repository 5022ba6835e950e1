//! BibTeX merge engine for bibsync.
//!
//! Merges freshly scraped entries into a long-lived bibliography while
//! preserving the original file byte for byte wherever nothing changed.
//! The entry point is [`merge_files`]; the building blocks are public for
//! callers that work on text directly.

pub mod changelog;
pub mod entry;
pub mod map;
pub mod merge;
pub mod parser;
pub mod similarity;

use std::path::Path;

use tracing::{info, instrument};

use bibsync_shared::{BibsyncError, Result};

pub use changelog::Changelog;
pub use entry::{Entry, Field, Item, ItemKey};
pub use merge::{IGNORED_FIELDS, KeyFixes, fix_duplicate_ids, merge};
pub use parser::{Bibliography, parse_bibliography};

/// Outcome of merging one scraped file.
#[derive(Debug)]
pub struct MergeReport {
    /// Entries in the written bibliography.
    pub entries: usize,
    /// Entries added from the scraped file.
    pub added: usize,
    /// Existing entries rewritten with scraped fields.
    pub updated: usize,
    /// Scraped keys replaced by the existing key sharing their URL.
    pub renamed: Vec<(String, String)>,
    /// URLs ignored for re-keying because several entries carry them.
    pub duplicate_urls: Vec<String>,
    pub changelog: Changelog,
}

impl MergeReport {
    /// One-line human summary.
    pub fn summary(&self) -> String {
        format!(
            "{} entries: {} new, {} updated, {} re-keyed",
            self.entries,
            self.added,
            self.updated,
            self.renamed.len()
        )
    }
}

/// Merge the scraped `text` into the bibliography `main`, returning the new
/// bibliography text and a report.
pub fn merge_text(main: &str, scraped: &str) -> Result<(String, MergeReport)> {
    let main = parse_bibliography(main, false)?;
    let scraped = parse_bibliography(scraped, true)?;

    let (scraped, fixes) = fix_duplicate_ids(&main, scraped);
    let items = merge(main, scraped);

    let entries: Vec<&Entry> = items.iter().filter_map(Item::as_entry).collect();
    let report = MergeReport {
        entries: entries.len(),
        added: entries.iter().filter(|e| e.is_new).count(),
        updated: entries.iter().filter(|e| e.updated && !e.is_new).count(),
        renamed: fixes.renamed,
        duplicate_urls: fixes.duplicate_urls,
        changelog: Changelog::from_items(&items),
    };

    let text: String = items.iter().map(ToString::to_string).collect();
    Ok((text, report))
}

/// Merge `scraped` into `source` and write the result to `destination`.
///
/// `destination` may equal `source`. It is replaced atomically, so a failed
/// merge never leaves a half-written bibliography.
#[instrument(skip_all, fields(source = %source.display(), destination = %destination.display()))]
pub fn merge_files(source: &Path, destination: &Path, scraped: &Path) -> Result<MergeReport> {
    let main_text = read_bib(source)?;
    let scraped_text = read_bib(scraped)?;

    let (text, report) = merge_text(&main_text, &scraped_text)?;
    write_atomic(destination, &text)?;

    info!(
        entries = report.entries,
        added = report.added,
        updated = report.updated,
        renamed = report.renamed.len(),
        "bibliography merged"
    );
    Ok(report)
}

fn read_bib(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| BibsyncError::io(path, e))
}

/// Write to a sibling temp file, then rename over `path`.
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| BibsyncError::config(format!("{} is not a file path", path.display())))?;
    let temp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    std::fs::write(&temp, content).map_err(|e| BibsyncError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| BibsyncError::io(path, e))?;
    Ok(())
}
