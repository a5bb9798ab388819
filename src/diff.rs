/// Semantic diff between two summarized states.
///
/// The diff is pure and fully deterministic: no I/O, no model calls. Items
/// compare equal after trimming and case-folding. "Changed" detection is a
/// handle heuristic: the leading five tokens of an item (split on
/// whitespace and punctuation) act as its identity; when a base item and a
/// side item share a handle but differ in full text, the pair is reported
/// as changed rather than as an unrelated remove + add.
use crate::types::{Category, ChangedItem, StateDiff, StateRecord};
use std::collections::HashSet;

/// Number of leading tokens that form an item's handle.
const HANDLE_TOKENS: usize = 5;

/// Canonical form used for equality: trimmed and case-folded.
pub fn normalize(item: &str) -> String {
    item.trim().to_lowercase()
}

/// The identity handle of an item: its leading five tokens, case-folded.
///
/// Tokenization splits on anything that is not alphanumeric, so
/// punctuation never participates in identity.
pub fn handle(item: &str) -> String {
    item.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .take(HANDLE_TOKENS)
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compute added/removed/changed items of `side` relative to `base`.
///
/// Per category: **added** are side items equal to no base item; **removed**
/// are base items equal to no side item; **changed** are base/side pairs
/// that share a handle but differ in full text. A pair reported as changed
/// is excluded from added and removed, so one evolution of an item is
/// reported exactly once.
pub fn diff(base: &StateRecord, side: &StateRecord) -> StateDiff {
    let mut result = StateDiff::default();

    for category in Category::ALL {
        let base_items = base.items(category);
        let side_items = side.items(category);

        let base_norms: Vec<String> = base_items.iter().map(|i| normalize(i)).collect();
        let side_norms: Vec<String> = side_items.iter().map(|i| normalize(i)).collect();
        let base_set: HashSet<&str> = base_norms.iter().map(String::as_str).collect();
        let side_set: HashSet<&str> = side_norms.iter().map(String::as_str).collect();

        // Pair up handle matches first.
        let mut changed = Vec::new();
        let mut paired_base = HashSet::new();
        let mut paired_side = HashSet::new();
        for (i, base_item) in base_items.iter().enumerate() {
            if side_set.contains(base_norms[i].as_str()) {
                continue; // survived unchanged
            }
            let base_handle = handle(base_item);
            if base_handle.is_empty() {
                continue;
            }
            for (j, side_item) in side_items.iter().enumerate() {
                if paired_side.contains(&j) || base_set.contains(side_norms[j].as_str()) {
                    continue;
                }
                if handle(side_item) == base_handle && side_norms[j] != base_norms[i] {
                    changed.push(ChangedItem {
                        before: base_item.clone(),
                        after: side_item.clone(),
                    });
                    paired_base.insert(i);
                    paired_side.insert(j);
                    break;
                }
            }
        }

        let added: Vec<String> = side_items
            .iter()
            .enumerate()
            .filter(|(j, _)| {
                !paired_side.contains(j) && !base_set.contains(side_norms[*j].as_str())
            })
            .map(|(_, item)| item.clone())
            .collect();

        let removed: Vec<String> = base_items
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                !paired_base.contains(i) && !side_set.contains(base_norms[*i].as_str())
            })
            .map(|(_, item)| item.clone())
            .collect();

        if !added.is_empty() {
            result.added.insert(category, added);
        }
        if !removed.is_empty() {
            result.removed.insert(category, removed);
        }
        if !changed.is_empty() {
            result.changed.insert(category, changed);
        }
    }

    result
}
