//! Ratcliff/Obershelp similarity over characters.
//!
//! Follows the classic "gestalt pattern matching" recipe: find the longest
//! common block, recurse on both sides, and score `2 * matched / total`.
//! Junk characters never start a match but may extend one, and in long
//! inputs characters occurring in more than 1% of positions are ignored as
//! match seeds.

use std::collections::{HashMap, HashSet};

/// Characters that never seed a match when comparing prose.
pub const PROSE_JUNK: &str = " \t\n,.:;!?";

/// Inputs at least this long get popular-character pruning.
const AUTOJUNK_MIN_LEN: usize = 200;

/// Similarity ratio in `[0, 1]` between `a` and `b`.
///
/// Two empty strings are identical (`1.0`).
pub fn similarity(a: &str, b: &str, is_junk: impl Fn(char) -> bool) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let matcher = Matcher::new(&a, &b, is_junk);
    2.0 * matcher.matched() as f64 / total as f64
}

/// Similarity treating whitespace and punctuation as junk.
pub fn prose_similarity(a: &str, b: &str) -> f64 {
    similarity(a, b, |c| PROSE_JUNK.contains(c))
}

struct Matcher<'s> {
    a: &'s [char],
    b: &'s [char],
    /// Positions in `b` of every usable match seed.
    b2j: HashMap<char, Vec<usize>>,
    junk: HashSet<char>,
}

impl<'s> Matcher<'s> {
    fn new(a: &'s [char], b: &'s [char], is_junk: impl Fn(char) -> bool) -> Self {
        let mut b2j: HashMap<char, Vec<usize>> = HashMap::new();
        for (j, &c) in b.iter().enumerate() {
            b2j.entry(c).or_default().push(j);
        }

        let junk: HashSet<char> = b2j.keys().copied().filter(|&c| is_junk(c)).collect();
        b2j.retain(|c, _| !junk.contains(c));

        if b.len() >= AUTOJUNK_MIN_LEN {
            let limit = b.len() / 100 + 1;
            b2j.retain(|_, positions| positions.len() <= limit);
        }

        Self { a, b, b2j, junk }
    }

    fn is_b_junk(&self, c: char) -> bool {
        self.junk.contains(&c)
    }

    /// Longest matching block in `a[alo..ahi]` and `b[blo..bhi]` as
    /// `(i, j, size)`.
    fn longest_match(
        &self,
        alo: usize,
        ahi: usize,
        blo: usize,
        bhi: usize,
    ) -> (usize, usize, usize) {
        let (a, b) = (self.a, self.b);
        let (mut best_i, mut best_j, mut best_size) = (alo, blo, 0);

        let mut j2len: HashMap<usize, usize> = HashMap::new();
        for (i, c) in a.iter().enumerate().take(ahi).skip(alo) {
            let mut next_j2len = HashMap::new();
            if let Some(positions) = self.b2j.get(c) {
                for &j in positions {
                    if j < blo {
                        continue;
                    }
                    if j >= bhi {
                        break;
                    }
                    let k = j.checked_sub(1).and_then(|p| j2len.get(&p)).copied().unwrap_or(0) + 1;
                    next_j2len.insert(j, k);
                    if k > best_size {
                        best_i = i + 1 - k;
                        best_j = j + 1 - k;
                        best_size = k;
                    }
                }
            }
            j2len = next_j2len;
        }

        // Extend with popular characters first, then with junk.
        for junk_pass in [false, true] {
            while best_i > alo
                && best_j > blo
                && self.is_b_junk(b[best_j - 1]) == junk_pass
                && a[best_i - 1] == b[best_j - 1]
            {
                best_i -= 1;
                best_j -= 1;
                best_size += 1;
            }
            while best_i + best_size < ahi
                && best_j + best_size < bhi
                && self.is_b_junk(b[best_j + best_size]) == junk_pass
                && a[best_i + best_size] == b[best_j + best_size]
            {
                best_size += 1;
            }
        }

        (best_i, best_j, best_size)
    }

    /// Total size of all matching blocks.
    fn matched(&self) -> usize {
        let mut total = 0;
        let mut queue = vec![(0, self.a.len(), 0, self.b.len())];
        while let Some((alo, ahi, blo, bhi)) = queue.pop() {
            let (i, j, k) = self.longest_match(alo, ahi, blo, bhi);
            if k == 0 {
                continue;
            }
            total += k;
            if alo < i && blo < j {
                queue.push((alo, i, blo, j));
            }
            if i + k < ahi && j + k < bhi {
                queue.push((i + k, ahi, j + k, bhi));
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_junk(_: char) -> bool {
        false
    }

    #[test]
    fn identical_strings_score_one() {
        assert_eq!(similarity("abcd", "abcd", no_junk), 1.0);
        assert_eq!(similarity("", "", no_junk), 1.0);
    }

    #[test]
    fn disjoint_strings_score_zero() {
        assert_eq!(similarity("abc", "xyz", no_junk), 0.0);
        assert_eq!(similarity("abc", "", no_junk), 0.0);
    }

    #[test]
    fn classic_example() {
        // "abcd" vs "bcde": one block "bcd" of 3 → 6 / 8.
        assert!((similarity("abcd", "bcde", no_junk) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn blocks_on_both_sides_are_counted() {
        // "qabxcd" vs "abycdf": blocks "ab" and "cd" → 8 / 12.
        let ratio = similarity("qabxcd", "abycdf", no_junk);
        assert!((ratio - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn junk_extends_but_does_not_seed() {
        // Only spaces in common: they cannot seed a match.
        assert_eq!(prose_similarity("a b", "x y"), 0.0);
        // Junk adjacent to a real match is absorbed into it.
        assert_eq!(prose_similarity("ab, cd", "ab, cd"), 1.0);
    }

    #[test]
    fn small_title_edit_stays_similar() {
        let old = "Fast and Precise Fuzzing of Network Protocols";
        let new = "Fast and Precise Fuzzing of Network Protocol Stacks";
        assert!(prose_similarity(new, old) > 0.8);
    }

    #[test]
    fn rewritten_title_is_dissimilar() {
        let old = "Fast and Precise Fuzzing of Network Protocols";
        let new = "Keynote";
        assert!(prose_similarity(new, old) < 0.8);
    }
}
