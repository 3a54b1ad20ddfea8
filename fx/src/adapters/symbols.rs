//! Vendor symbol normalization with a per-adapter skip list.

use dashmap::DashSet;
use ratebridge_common::CurrencyPair;
use tracing::debug;

/// Raw symbols an adapter failed to normalize.
///
/// Once a symbol lands here it is ignored on later polls without running the
/// parser again.
#[derive(Debug, Default)]
pub struct SkipList {
    skipped: DashSet<String>,
}

impl SkipList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize `raw` with `parse`, or `None` if it is (or becomes) skipped.
    pub fn normalize<F>(&self, raw: &str, parse: F) -> Option<CurrencyPair>
    where
        F: FnOnce(&str) -> Option<CurrencyPair>,
    {
        if self.skipped.contains(raw) {
            return None;
        }
        let pair = parse(raw);
        if pair.is_none() {
            debug!(symbol = raw, "Skipping unrecognized symbol");
            self.skipped.insert(raw.to_string());
        }
        pair
    }

    pub fn contains(&self, raw: &str) -> bool {
        self.skipped.contains(raw)
    }

    pub fn len(&self) -> usize {
        self.skipped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skipped.is_empty()
    }
}
