//! Merge scraped entries into an existing bibliography.
//!
//! Existing entries keep their position and formatting unless a scraped
//! counterpart changes a field outside [`IGNORED_FIELDS`]. New entries are
//! slotted in case-insensitive key order between the entries of the
//! bibliography that are already sorted, so a mostly-sorted file stays
//! mostly sorted.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use tracing::info;

use crate::entry::{Entry, Field, Fields, Item, ItemKey};
use crate::parser::Bibliography;
use crate::similarity::prose_similarity;

/// Fields whose changes alone never rewrite an existing entry.
pub const IGNORED_FIELDS: [&str; 4] = ["date", "urldate", "year", "yearmonth"];

/// Spacing placed around inserted entries.
const SEPARATOR: &str = "\n\n";

/// Abstracts less similar than this count as rewritten.
const ABSTRACT_SIMILARITY: f64 = 0.5;

/// Titles less similar than this count as rewritten.
const TITLE_SIMILARITY: f64 = 0.8;

/// Last non-comma character of a field followed by trailing whitespace.
static LAST_FIELD_END_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^,])(\s*)$").expect("last field regex"));

/// Key changes made by [`fix_duplicate_ids`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyFixes {
    /// `(scraped key, existing key)` pairs.
    pub renamed: Vec<(String, String)>,
    /// URLs carried by several existing entries, sorted. Never used for
    /// matching.
    pub duplicate_urls: Vec<String>,
}

/// Re-key scraped entries that share a unique `url` with an existing entry.
pub fn fix_duplicate_ids(main: &Bibliography, update: Bibliography) -> (Bibliography, KeyFixes) {
    let mut url_to_key: HashMap<&str, &str> = HashMap::new();
    let mut duplicate_urls: HashSet<&str> = HashSet::new();

    for entry in main.values().filter_map(Item::as_entry) {
        let Some(url) = entry.field_value("url") else {
            continue;
        };
        if duplicate_urls.contains(url) {
            continue;
        }
        if url_to_key.remove(url).is_some() {
            duplicate_urls.insert(url);
            continue;
        }
        url_to_key.insert(url, &entry.key);
    }

    let mut duplicate_urls: Vec<String> = duplicate_urls.into_iter().map(str::to_string).collect();
    duplicate_urls.sort();
    if !duplicate_urls.is_empty() {
        info!(?duplicate_urls, "urls shared by several entries are not used for matching");
    }

    let mut renamed = Vec::new();
    let mut output = Bibliography::new();
    for (key, mut item) in update {
        let target = match &item {
            Item::Entry(entry) => entry
                .field_value("url")
                .and_then(|url| url_to_key.get(url))
                .filter(|&&main_key| main_key != entry.key)
                .map(|&main_key| main_key.to_string()),
            _ => None,
        };

        let key = match (target, &mut item) {
            (Some(main_key), Item::Entry(entry)) => {
                info!(from = %entry.key, to = %main_key, "fixing entry key");
                let old_key = std::mem::replace(&mut entry.key, main_key.clone());
                renamed.push((old_key, main_key.clone()));
                ItemKey::Id(main_key)
            }
            _ => key,
        };
        output.insert(key, item);
    }

    (
        output,
        KeyFixes {
            renamed,
            duplicate_urls,
        },
    )
}

/// Merge `update` into `main`, returning the resulting items in file order.
pub fn merge(mut main: Bibliography, update: Bibliography) -> Vec<Item> {
    // Only entries take part; trailing whitespace is normalised first.
    let mut updates: HashMap<String, Entry> = HashMap::new();
    let mut update_order: Vec<String> = Vec::new();
    for (key, item) in update {
        if let (ItemKey::Id(id), Item::Entry(mut entry)) = (key, item) {
            entry.strip_trailing_whitespace();
            if updates.insert(id.clone(), entry).is_none() {
                update_order.push(id);
            }
        }
    }

    for item in main.values_mut() {
        if let Item::Entry(target) = item {
            if let Some(source) = updates.get(&target.key) {
                update_entry(target, source, &IGNORED_FIELDS);
            }
        }
    }

    let mut new_keys: Vec<String> = update_order
        .into_iter()
        .filter(|id| !main.contains_key(&ItemKey::Id(id.clone())))
        .collect();
    new_keys.sort_by_cached_key(|id| id.to_lowercase());

    let old_keys: Vec<String> = main
        .keys()
        .filter_map(|key| match key {
            ItemKey::Id(id) => Some(id.to_lowercase()),
            _ => None,
        })
        .collect();
    let anchors: Vec<String> = longest_non_decreasing_subsequence(&old_keys)
        .into_iter()
        .map(|i| old_keys[i].clone())
        .collect();

    let mut take = |id: &str| updates.remove(id).map(Item::Entry);

    let mut result = Vec::new();
    let mut pending = new_keys.iter().peekable();
    let mut anchor_idx = 0;

    for (key, item) in main {
        let ItemKey::Id(id) = &key else {
            result.push(item);
            continue;
        };
        let lower = id.to_lowercase();
        if anchor_idx == anchors.len() || lower != anchors[anchor_idx] {
            // Out of order, left where it is.
            result.push(item);
            continue;
        }

        while let Some(new_id) = pending.next_if(|n| n.to_lowercase() < lower) {
            result.extend(take(new_id.as_str()));
            result.push(Item::Separator(SEPARATOR.into()));
        }

        result.push(item);
        anchor_idx += 1;

        if anchor_idx == anchors.len() {
            for new_id in pending.by_ref() {
                result.push(Item::Separator(SEPARATOR.into()));
                result.extend(take(new_id.as_str()));
            }
        }
    }

    // Only reached when the main bibliography had no entries.
    for new_id in pending {
        result.extend(take(new_id.as_str()));
        result.push(Item::Separator(SEPARATOR.into()));
    }

    if let Some(Item::Separator(last)) = result.last_mut() {
        *last = "\n".into();
    }

    result
}

/// Apply the scraped `source` to the existing `target` entry.
fn update_entry(target: &mut Entry, source: &Entry, ignore: &[&str]) {
    target.is_new = false;

    if target.raw == source.raw {
        return;
    }

    let old_abstract = target.field_value("abstract").unwrap_or_default().to_string();
    let old_files = target.field_value("file").unwrap_or_default().to_string();
    let old_title = target.field_value("title").unwrap_or_default().to_string();

    let (new_fields, changed_fields) = collect_field_changes(&target.fields, &source.fields);

    let ignorable =
        |fields: &[(String, Field)]| fields.iter().all(|(k, _)| ignore.contains(&k.as_str()));
    if ignorable(new_fields.as_slice()) && ignorable(changed_fields.as_slice()) {
        return;
    }

    apply_field_changes(target, new_fields, changed_fields);
    flag_notable_changes(target, &old_abstract, &old_files, &old_title);
}

/// Split `update` fields into those `target` lacks and those whose value differs.
fn collect_field_changes(
    target: &Fields,
    update: &Fields,
) -> (Vec<(String, Field)>, Vec<(String, Field)>) {
    let mut new_fields = Vec::new();
    let mut changed_fields = Vec::new();

    for (key, field) in update.iter() {
        match target.get(key) {
            None => new_fields.push((key.clone(), field.clone())),
            Some(old) if old.value == field.value => {}
            Some(_) => changed_fields.push((key.clone(), field.clone())),
        }
    }

    (new_fields, changed_fields)
}

fn apply_field_changes(
    target: &mut Entry,
    new_fields: Vec<(String, Field)>,
    changed_fields: Vec<(String, Field)>,
) {
    target.updated = true;

    for (key, field) in changed_fields {
        if let Some(existing) = target.fields.get_mut(&key) {
            existing.raw = field.raw;
            existing.value = field.value;
        }
    }

    // Appended fields need a comma after the current last one.
    if let Some((last_key, mut last_field)) = target.fields.pop_last() {
        last_field.raw = LAST_FIELD_END_RE
            .replace(&last_field.raw, "$1,")
            .into_owned();
        target.fields.insert(last_key, last_field);
    }

    for (key, field) in new_fields {
        target.fields.insert(key, field);
    }
}

fn flag_notable_changes(target: &mut Entry, old_abstract: &str, old_files: &str, old_title: &str) {
    if let Some(abstract_) = target.field_value("abstract") {
        if prose_similarity(abstract_, old_abstract) < ABSTRACT_SIMILARITY {
            target.updated_abstract = true;
        }
    }

    if let Some(files) = target.field_value("file") {
        let new: HashSet<&str> = files.split(';').collect();
        let old: HashSet<&str> = old_files.split(';').collect();
        if new != old {
            target.updated_files = true;
        }
    }

    if let Some(title) = target.field_value("title") {
        if prose_similarity(title, old_title) < TITLE_SIMILARITY {
            target.updated_title = true;
        }
    }
}

/// Indices of a longest non-decreasing subsequence of `keys`.
pub fn longest_non_decreasing_subsequence<T: Ord>(keys: &[T]) -> Vec<usize> {
    let mut predecessor: Vec<Option<usize>> = vec![None; keys.len()];
    // tails[l] is the index ending the best subsequence of length l + 1.
    let mut tails: Vec<usize> = Vec::new();

    for i in 0..keys.len() {
        let len = tails.partition_point(|&t| keys[t] <= keys[i]);
        predecessor[i] = len.checked_sub(1).map(|l| tails[l]);
        if len == tails.len() {
            tails.push(i);
        } else {
            tails[len] = i;
        }
    }

    let mut sequence = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        sequence.push(i);
        cursor = predecessor[i];
    }
    sequence.reverse();
    sequence
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_bibliography;

    fn render(items: &[Item]) -> String {
        items.iter().map(ToString::to_string).collect()
    }

    fn main_bib(text: &str) -> Bibliography {
        parse_bibliography(text, false).expect("parse main")
    }

    fn update_bib(text: &str) -> Bibliography {
        parse_bibliography(text, true).expect("parse update")
    }

    fn entry<'a>(items: &'a [Item], key: &str) -> &'a Entry {
        items
            .iter()
            .filter_map(Item::as_entry)
            .find(|e| e.key == key)
            .expect("entry present")
    }

    #[test]
    fn lis_of_sorted_input_is_everything() {
        assert_eq!(longest_non_decreasing_subsequence(&["a", "b", "c"]), vec![0, 1, 2]);
    }

    #[test]
    fn lis_skips_out_of_order_keys() {
        let keys = ["a", "z", "b", "c", "y"];
        let lis = longest_non_decreasing_subsequence(&keys);
        let picked: Vec<&str> = lis.iter().map(|&i| keys[i]).collect();
        assert_eq!(picked, vec!["a", "b", "c", "y"]);
    }

    #[test]
    fn lis_keeps_equal_keys() {
        assert_eq!(longest_non_decreasing_subsequence(&[2, 2, 1, 2]), vec![0, 1, 3]);
        assert!(longest_non_decreasing_subsequence::<u8>(&[]).is_empty());
    }

    #[test]
    fn identical_update_changes_nothing() {
        let text = "@misc{a,\n  title = {A},\n}\n";
        let items = merge(main_bib(text), update_bib(text));
        assert_eq!(render(&items), text);
        let a = entry(&items, "a");
        assert!(!a.updated);
        assert!(!a.is_new);
    }

    #[test]
    fn ignored_field_changes_are_dropped() {
        let main = "@misc{a,\n  title = {A},\n  year = {2023},\n}\n";
        let update = "@misc{a,\n  title = {A},\n  year = {2024},\n  urldate = {2024-05-01},\n}\n";
        let items = merge(main_bib(main), update_bib(update));
        assert_eq!(render(&items), main);
    }

    #[test]
    fn changed_field_rewrites_entry_and_appends_new_fields() {
        let main = "@misc{a,\n  title = {Old Title},\n  year = {2023}\n}\n";
        let update = "@misc{a,\n  title = {Old Title v2},\n  year = {2024},\n  \
                      url = {https://x.org/a},\n}\n";
        let items = merge(main_bib(main), update_bib(update));

        assert_eq!(render(&items), update);
        let a = entry(&items, "a");
        assert!(a.updated);
        assert!(!a.updated_title, "small title edit is not notable");
    }

    #[test]
    fn last_field_gets_comma_before_new_fields() {
        let main = "@misc{a,\n  title = {A}\n}";
        let update = "@misc{a,\n  title = {A},\n  note = {n}}";
        let items = merge(main_bib(main), update_bib(update));
        assert_eq!(render(&items), "@misc{a,\n  title = {A},\n  note = {n}\n}");
    }

    #[test]
    fn new_entries_slot_between_sorted_anchors() {
        let main = "@misc{alpha,\n  title = {A},\n}\n\n@misc{delta,\n  title = {D},\n}\n";
        let update = "@misc{Charlie,\n  title = {C},\n}\n\
                      @misc{zulu,\n  title = {Z},\n}\n\
                      @misc{bravo,\n  title = {B},\n}\n";
        let items = merge(main_bib(main), update_bib(update));

        let order: Vec<&str> = items
            .iter()
            .filter_map(Item::as_entry)
            .map(|e| e.key.as_str())
            .collect();
        assert_eq!(order, vec!["alpha", "bravo", "Charlie", "delta", "zulu"]);

        let text = render(&items);
        assert!(text.starts_with("@misc{alpha,\n  title = {A},\n}\n\n@misc{bravo,"));
        assert!(text.ends_with("@misc{zulu,\n  title = {Z},\n}\n"));
        assert!(items.iter().filter_map(Item::as_entry).filter(|e| e.is_new).count() == 3);
    }

    #[test]
    fn out_of_order_entries_keep_their_position() {
        let main =
            "@misc{b,title={B}}\n@misc{z,title={Z}}\n@misc{c,title={C}}\n@misc{d,title={D}}\n";
        let update = "@misc{y,title={Y}}\n";
        let items = merge(main_bib(main), update_bib(update));

        let order: Vec<&str> = items
            .iter()
            .filter_map(Item::as_entry)
            .map(|e| e.key.as_str())
            .collect();
        assert_eq!(order, vec!["b", "z", "c", "d", "y"]);
    }

    #[test]
    fn empty_main_gets_sorted_entries() {
        let update = "@misc{b,title={B}}@misc{a,title={A}}";
        let items = merge(main_bib(""), update_bib(update));
        assert_eq!(render(&items), "@misc{a,title={A}}\n\n@misc{b,title={B}}\n");
    }

    #[test]
    fn comments_and_blanks_of_update_are_ignored() {
        let main = "@misc{a,title={A}}\n";
        let update = "junk\n@comment{jabref-meta: x}\n@misc{a,title={A}}\n";
        let items = merge(main_bib(main), update_bib(update));
        assert_eq!(render(&items), main);
    }

    #[test]
    fn notable_title_and_file_changes_are_flagged() {
        let main = "@misc{a,\n  title = {Completely Different},\n  file = {a.pdf},\n}";
        let update = "@misc{a,\n  title = {Keynote},\n  file = {a.pdf;b.pdf},\n}";
        let items = merge(main_bib(main), update_bib(update));
        let a = entry(&items, "a");
        assert!(a.updated_title);
        assert!(a.updated_files);
        assert!(!a.updated_abstract);
    }

    #[test]
    fn rewritten_abstract_is_flagged() {
        let main = "@misc{a,\n  title = {A},\n  abstract = {We fuzz network protocol stacks.},\n}";
        let update = "@misc{a,\n  title = {A},\n  abstract = {Keynote on hiring.},\n}";
        let items = merge(main_bib(main), update_bib(update));
        let a = entry(&items, "a");
        assert!(a.updated);
        assert!(a.updated_abstract);
        assert!(!a.updated_title);
        assert!(!a.updated_files);

        let changelog = crate::Changelog::from_items(&items).render();
        assert!(changelog.contains("- A  \n  _Updated abstract_\n"));
    }

    #[test]
    fn lightly_edited_abstract_is_not_flagged() {
        let main = "@misc{a,\n  abstract = {We fuzz network protocol stacks quickly.},\n}";
        let update = "@misc{a,\n  abstract = {We fuzz network protocol stacks very quickly.},\n}";
        let items = merge(main_bib(main), update_bib(update));
        let a = entry(&items, "a");
        assert!(a.updated);
        assert!(!a.updated_abstract);
    }

    #[test]
    fn duplicate_ids_follow_unique_urls() {
        let main = main_bib(
            "@misc{kept,url={https://x.org/1}}\n\
             @misc{d1,url={https://dup}}\n\
             @misc{d2,url={https://dup}}\n",
        );
        let update =
            update_bib("@misc{renamed,url={https://x.org/1}}\n@misc{other,url={https://dup}}\n");

        let (fixed, fixes) = fix_duplicate_ids(&main, update);
        assert_eq!(fixes.renamed, vec![("renamed".to_string(), "kept".to_string())]);
        assert_eq!(fixes.duplicate_urls, vec!["https://dup".to_string()]);
        assert!(fixed.contains_key(&ItemKey::Id("kept".into())));
        assert!(fixed.contains_key(&ItemKey::Id("other".into())));
        assert!(!fixed.contains_key(&ItemKey::Id("renamed".into())));
    }
}
