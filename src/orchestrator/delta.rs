//! Cross-run vulnerability delta. Vulnerabilities are keyed by their content
//! fingerprint, so the comparison survives re-analysis instead of treating
//! every run's findings as brand new.

use std::collections::HashSet;

use crate::models::Vulnerability;

/// (new, resolved) counts: ids present now but not before, and ids present
/// before but absent now.
pub fn diff_counts(current: &[Vulnerability], previous: &[Vulnerability]) -> (u32, u32) {
    let prev_ids: HashSet<&str> = previous.iter().map(|v| v.id.as_str()).collect();
    let curr_ids: HashSet<&str> = current.iter().map(|v| v.id.as_str()).collect();
    let new = curr_ids.difference(&prev_ids).count() as u32;
    let resolved = prev_ids.difference(&curr_ids).count() as u32;
    (new, resolved)
}
