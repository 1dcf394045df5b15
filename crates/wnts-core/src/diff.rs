// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Demonstration text diff/patch helper.
//!
//! Character-level hunks with positions in both the original and changed
//! texts, so a hunk list can be applied forward (`apply_diff`) or rolled
//! back (`undo_diff`). Laws:
//! `apply_diff(a, extract_diff(a, b)) == b` and
//! `undo_diff(b, extract_diff(a, b)) == a` for all text pairs.

use anyhow::bail;

/// One contiguous edit: at byte `a_pos` of the original (`b_pos` of the
/// changed text), `removed` is replaced by `inserted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub a_pos: usize,
    pub b_pos: usize,
    pub removed: Vec<u8>,
    pub inserted: Vec<u8>,
}

/// Cap on the LCS table size; beyond it the diff degrades to one
/// whole-text hunk, which still satisfies both laws.
const MAX_TABLE_CELLS: usize = 16 * 1024 * 1024;

/// Compute the hunks turning `original` into `changed`.
pub fn extract_diff(original: &str, changed: &str) -> Vec<Hunk> {
    let a = original.as_bytes();
    let b = changed.as_bytes();

    // Shared prefix and suffix never appear in hunks.
    let prefix = a
        .iter()
        .zip(b.iter())
        .take_while(|(x, y)| x == y)
        .count();
    let max_suffix = a.len().min(b.len()) - prefix;
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
        .min(max_suffix);

    let mid_a = &a[prefix..a.len() - suffix];
    let mid_b = &b[prefix..b.len() - suffix];
    if mid_a.is_empty() && mid_b.is_empty() {
        return vec![];
    }
    if mid_a.is_empty() || mid_b.is_empty() || mid_a.len() * mid_b.len() > MAX_TABLE_CELLS {
        return vec![Hunk {
            a_pos: prefix,
            b_pos: prefix,
            removed: mid_a.to_vec(),
            inserted: mid_b.to_vec(),
        }];
    }

    hunks_from_lcs(mid_a, mid_b, prefix)
}

/// Longest-common-subsequence walk over the differing middles, grouping
/// consecutive non-common edits into hunks.
fn hunks_from_lcs(a: &[u8], b: &[u8], offset: usize) -> Vec<Hunk> {
    let n = a.len();
    let m = b.len();
    let mut table = vec![0u32; (n + 1) * (m + 1)];
    let idx = |i: usize, j: usize| i * (m + 1) + j;
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[idx(i, j)] = if a[i] == b[j] {
                table[idx(i + 1, j + 1)] + 1
            } else {
                table[idx(i + 1, j)].max(table[idx(i, j + 1)])
            };
        }
    }

    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;
    let (mut i, mut j) = (0usize, 0usize);
    while i < n || j < m {
        if i < n && j < m && a[i] == b[j] {
            if let Some(hunk) = current.take() {
                hunks.push(hunk);
            }
            i += 1;
            j += 1;
            continue;
        }
        let hunk = current.get_or_insert_with(|| Hunk {
            a_pos: offset + i,
            b_pos: offset + j,
            removed: Vec::new(),
            inserted: Vec::new(),
        });
        if j >= m || (i < n && table[idx(i + 1, j)] >= table[idx(i, j + 1)]) {
            hunk.removed.push(a[i]);
            i += 1;
        } else {
            hunk.inserted.push(b[j]);
            j += 1;
        }
    }
    if let Some(hunk) = current {
        hunks.push(hunk);
    }
    hunks
}

/// Swap the direction of every hunk.
pub fn invert(hunks: &[Hunk]) -> Vec<Hunk> {
    hunks
        .iter()
        .map(|h| Hunk {
            a_pos: h.b_pos,
            b_pos: h.a_pos,
            removed: h.inserted.clone(),
            inserted: h.removed.clone(),
        })
        .collect()
}

/// Apply hunks extracted from `(original, changed)` to `original`,
/// producing `changed`. Fails when the hunk context does not match.
pub fn apply_diff(original: &str, hunks: &[Hunk]) -> anyhow::Result<String> {
    let a = original.as_bytes();
    let mut out = Vec::with_capacity(a.len());
    let mut cursor = 0usize;

    for hunk in hunks {
        if hunk.a_pos < cursor || hunk.a_pos + hunk.removed.len() > a.len() {
            bail!("hunk at byte {} does not fit the text", hunk.a_pos);
        }
        out.extend_from_slice(&a[cursor..hunk.a_pos]);
        let found = &a[hunk.a_pos..hunk.a_pos + hunk.removed.len()];
        if found != hunk.removed.as_slice() {
            bail!("hunk context mismatch at byte {}", hunk.a_pos);
        }
        out.extend_from_slice(&hunk.inserted);
        cursor = hunk.a_pos + hunk.removed.len();
    }
    out.extend_from_slice(&a[cursor..]);

    String::from_utf8(out).map_err(|_| anyhow::anyhow!("patched text is not valid utf-8"))
}

/// Roll `changed` back to the original the hunks were extracted from.
pub fn undo_diff(changed: &str, hunks: &[Hunk]) -> anyhow::Result<String> {
    apply_diff(changed, &invert(hunks))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_laws(a: &str, b: &str) {
        let hunks = extract_diff(a, b);
        assert_eq!(apply_diff(a, &hunks).expect("apply"), b, "{a:?} -> {b:?}");
        assert_eq!(undo_diff(b, &hunks).expect("undo"), a, "{b:?} -> {a:?}");
    }

    #[test]
    fn laws_hold_for_assorted_pairs() {
        check_laws("", "");
        check_laws("", "hello");
        check_laws("hello", "");
        check_laws("hello", "hello");
        check_laws("hello world", "hello brave world");
        check_laws("the quick brown fox", "the slow brown dog");
        check_laws("aaaa", "aabaa");
        check_laws("abcdef", "xbcdz");
        check_laws("line one\nline two\n", "line one\nline 2\nline three\n");
        check_laws("naïve café", "naive cafe");
    }

    #[test]
    fn identical_texts_produce_no_hunks() {
        assert!(extract_diff("same", "same").is_empty());
    }

    #[test]
    fn single_insertion_is_one_hunk() {
        let hunks = extract_diff("ac", "abc");
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].removed, b"");
        assert_eq!(hunks[0].inserted, b"b");
    }

    #[test]
    fn invert_is_involutive() {
        let hunks = extract_diff("old text", "new text!");
        assert_eq!(invert(&invert(&hunks)), hunks);
    }

    #[test]
    fn mismatched_context_is_rejected() {
        let hunks = extract_diff("abc", "axc");
        assert!(apply_diff("zzz", &hunks).is_err());
    }
}
