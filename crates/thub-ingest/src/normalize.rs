//! Raw items to storable records: fingerprinting, first-wins dedup, text
//! cleanup and description truncation.

use std::collections::HashSet;

use thub_core::{civil_day_string, fingerprint, NormalizedRecord, RawItem};

pub const DEFAULT_DESCRIPTION_LIMIT: usize = 600;
pub const ELLIPSIS: char = '…';

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizeOutcome {
    pub records: Vec<NormalizedRecord>,
    /// Items whose fingerprint was already seen earlier in the batch.
    pub duplicates: usize,
    /// Items without a usable link.
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    description_limit: usize,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_DESCRIPTION_LIMIT)
    }
}

impl Normalizer {
    pub fn new(description_limit: usize) -> Self {
        Self { description_limit }
    }

    /// Order preserving; the first occurrence of a link wins.
    pub fn normalize(&self, items: Vec<RawItem>) -> NormalizeOutcome {
        let mut seen = HashSet::with_capacity(items.len());
        let mut outcome = NormalizeOutcome {
            records: Vec::with_capacity(items.len()),
            ..Default::default()
        };

        for item in items {
            let link = item.link.trim();
            if link.is_empty() {
                outcome.dropped += 1;
                continue;
            }
            let id = fingerprint(link);
            if !seen.insert(id) {
                outcome.duplicates += 1;
                continue;
            }

            let title = sanitize_text(&item.title);
            let description = item
                .description
                .as_deref()
                .map(sanitize_text)
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| title.clone());

            outcome.records.push(NormalizedRecord {
                id,
                link: link.to_string(),
                channel: item.channel,
                description: truncate_chars(&description, self.description_limit),
                published_at: item.published_at,
                published_date: civil_day_string(item.published_at),
                hot_score: item.hot_score,
                extra: item.extra,
                title,
            });
        }
        outcome
    }
}

/// Trims and replaces NUL, which text columns cannot hold, with U+FFFD.
pub fn sanitize_text(value: &str) -> String {
    value.trim().replace('\0', "\u{FFFD}")
}

/// Cuts `value` to at most `limit` characters; when cut, the last kept
/// character is the ellipsis.
pub fn truncate_chars(value: &str, limit: usize) -> String {
    if limit == 0 {
        return String::new();
    }
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let mut out: String = value.chars().take(limit - 1).collect();
    out.push(ELLIPSIS);
    out
}
