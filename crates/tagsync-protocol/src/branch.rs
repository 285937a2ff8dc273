//! Branch identity

use serde::{Deserialize, Serialize};

/// Branch used when none is given
pub const DEFAULT_BRANCH: &str = "default";

/// Identifies a branch: `(recordName, inst, branch)`.
///
/// Serializes as `{"recordName": .., "inst": .., "branch": ..}` with a null
/// record name for public insts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchKey {
    pub record_name: Option<String>,
    pub inst: String,
    pub branch: String,
}

impl BranchKey {
    pub fn new(record_name: Option<String>, inst: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            record_name,
            inst: inst.into(),
            branch: branch.into(),
        }
    }

    /// The default branch of a public inst
    pub fn for_inst(inst: impl Into<String>) -> Self {
        Self::new(None, inst, DEFAULT_BRANCH)
    }

    pub fn matches(&self, record_name: Option<&str>, inst: &str, branch: &str) -> bool {
        self.record_name.as_deref() == record_name && self.inst == inst && self.branch == branch
    }
}

impl std::fmt::Display for BranchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.record_name.as_deref().unwrap_or(""),
            self.inst,
            self.branch
        )
    }
}

/// A message addressed to a single branch
pub trait Addressed {
    fn record_name(&self) -> Option<&str>;
    fn inst(&self) -> &str;
    fn branch(&self) -> &str;

    /// Exact `(recordName, inst, branch)` match
    fn is_for(&self, key: &BranchKey) -> bool {
        key.matches(self.record_name(), self.inst(), self.branch())
    }

    fn branch_key(&self) -> BranchKey {
        BranchKey::new(
            self.record_name().map(str::to_string),
            self.inst(),
            self.branch(),
        )
    }
}

impl Addressed for BranchKey {
    fn record_name(&self) -> Option<&str> {
        self.record_name.as_deref()
    }

    fn inst(&self) -> &str {
        &self.inst
    }

    fn branch(&self) -> &str {
        &self.branch
    }
}

/// Implements [`Addressed`] for structs with `record_name`, `inst` and
/// `branch` fields.
macro_rules! impl_addressed {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::branch::Addressed for $ty {
                fn record_name(&self) -> Option<&str> {
                    self.record_name.as_deref()
                }

                fn inst(&self) -> &str {
                    &self.inst
                }

                fn branch(&self) -> &str {
                    &self.branch
                }
            }
        )*
    };
}

pub(crate) use impl_addressed;
