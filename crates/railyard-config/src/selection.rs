//! The resolved form of the user's package-selection flags.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Which packages a build should operate on. Produced by the CLI layer from
/// the user's flags; consumed by the scope resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SelectionCriteria {
    /// Include standalone packages that version independently.
    #[serde(default)]
    pub independent_packages: bool,
    /// Include every child package of each listed release group.
    #[serde(default)]
    pub release_groups: Vec<String>,
    /// Include only the root package of each listed release group.
    #[serde(default)]
    pub release_group_roots: Vec<String>,
    /// Include the package rooted in each listed directory.
    #[serde(default)]
    pub directory: Vec<Utf8PathBuf>,
    /// Include every package with a file modified relative to this branch.
    #[serde(default)]
    pub changed_since_branch: Option<String>,
    /// Keep only packages whose name starts with one of these prefixes.
    #[serde(default)]
    pub scope: Vec<String>,
    /// Drop packages whose name starts with one of these prefixes.
    #[serde(default)]
    pub skip_scope: Vec<String>,
    #[serde(default)]
    pub private: PrivateFilter,
}

impl SelectionCriteria {
    /// True when no positive selection criterion is present. Callers treat
    /// this as "nothing matched" rather than "everything matched".
    pub fn is_empty(&self) -> bool {
        !self.independent_packages
            && self.release_groups.is_empty()
            && self.release_group_roots.is_empty()
            && self.directory.is_empty()
            && self.changed_since_branch.is_none()
    }
}

/// Tri-state filter on the `private` manifest flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrivateFilter {
    #[default]
    Either,
    OnlyPrivate,
    OnlyPublic,
}

impl PrivateFilter {
    pub fn admits(&self, private: bool) -> bool {
        match self {
            PrivateFilter::Either => true,
            PrivateFilter::OnlyPrivate => private,
            PrivateFilter::OnlyPublic => !private,
        }
    }
}
