//! Version vectors

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Site identifier inside a version vector
pub type SiteId = String;

/// Per-site logical clock.
///
/// A missing site is equivalent to a counter of zero, so zero entries are
/// never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector(BTreeMap<SiteId, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a site (0 when absent)
    pub fn get(&self, site: &str) -> u64 {
        self.0.get(site).copied().unwrap_or(0)
    }

    /// Set the counter for a site
    pub fn set(&mut self, site: impl Into<SiteId>, counter: u64) {
        let site = site.into();
        if counter == 0 {
            self.0.remove(&site);
        } else {
            self.0.insert(site, counter);
        }
    }

    /// Component-wise maximum of two vectors
    pub fn merge(&self, other: &VersionVector) -> VersionVector {
        let mut merged = self.clone();
        merged.merge_in_place(other);
        merged
    }

    pub fn merge_in_place(&mut self, other: &VersionVector) {
        for (site, &counter) in &other.0 {
            let entry = self.0.entry(site.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }
}

impl<S: Into<SiteId>> FromIterator<(S, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        let mut version = VersionVector::new();
        for (site, counter) in iter {
            version.set(site, counter);
        }
        version
    }
}

impl<S: Into<SiteId>, const N: usize> From<[(S, u64); N]> for VersionVector {
    fn from(entries: [(S, u64); N]) -> Self {
        entries.into_iter().collect()
    }
}
