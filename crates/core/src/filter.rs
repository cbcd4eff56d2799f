//! Subscription filters and the filter merge.
//!
//! A filter maps query dimensions to constraint values; values within one
//! dimension are OR-combined by the relay. Tag-indexed dimensions use keys
//! prefixed with `#`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Filter for subscription requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (pubkeys)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events at or after this timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events before this timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Tag-indexed dimensions. Keys carry the `#` prefix (e.g. `#d`, `#e`).
    #[serde(flatten, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event IDs.
    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Filter by authors.
    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    /// Filter by kinds.
    pub fn kinds(mut self, kinds: Vec<u16>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Filter by events since timestamp.
    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Filter by events until timestamp.
    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Limit number of results.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag dimension. The key is the tag letter without `#`.
    pub fn tag(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", key.into()), values);
        self
    }

    /// Merge another filter into this one, in place. See [`combine_filters`]
    /// for the per-field rules.
    pub fn merge(&mut self, other: Filter) {
        merge_vec(&mut self.ids, other.ids);
        merge_vec(&mut self.authors, other.authors);
        merge_vec(&mut self.kinds, other.kinds);

        // since tightens upward, until tightens downward.
        self.since = merge_opt(self.since, other.since, u64::max);
        self.until = merge_opt(self.until, other.until, u64::min);
        // limit broadens: composing a narrow recency filter with a broader
        // structural filter must never truncate below either side's intent.
        self.limit = merge_opt(self.limit, other.limit, u64::max);

        for (key, values) in other.tags {
            self.tags.entry(key).or_default().extend(values);
        }
    }
}

fn merge_vec<T>(acc: &mut Option<Vec<T>>, other: Option<Vec<T>>) {
    match (acc.as_mut(), other) {
        (Some(a), Some(b)) => a.extend(b),
        (None, Some(b)) => *acc = Some(b),
        _ => {}
    }
}

fn merge_opt<T: Copy>(a: Option<T>, b: Option<T>, pick: fn(T, T) -> T) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        (a, b) => a.or(b),
    }
}

/// Combine filters left to right: absent fields are adopted, array-valued
/// fields concatenate, `since` takes the max, `until` the min, and `limit`
/// the max of both sides.
pub fn combine_filters(filters: impl IntoIterator<Item = Filter>) -> Filter {
    let mut iter = filters.into_iter();
    let mut result = iter.next().unwrap_or_default();
    for filter in iter {
        result.merge(filter);
    }
    result
}
