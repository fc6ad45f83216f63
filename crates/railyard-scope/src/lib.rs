//! Turns the user's package-selection criteria into the set of matched
//! packages.

mod scm;

use std::collections::HashSet;

use camino::Utf8PathBuf;
use railyard_config::SelectionCriteria;
use railyard_repository::package_graph::{PackageGraph, PackageName};
use tracing::{debug, warn};

pub use crate::scm::{Scm, ScmError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown release group '{name}'")]
    UnknownReleaseGroup { name: String },
    #[error("--changed-since requires a git repository")]
    ScmUnavailable,
    #[error(transparent)]
    Scm(#[from] ScmError),
}

pub struct ScopeResolver<'a> {
    pkg_graph: &'a PackageGraph,
    scm: Option<&'a dyn Scm>,
}

impl<'a> ScopeResolver<'a> {
    pub fn new(pkg_graph: &'a PackageGraph) -> Self {
        Self {
            pkg_graph,
            scm: None,
        }
    }

    pub fn with_scm(mut self, scm: &'a dyn Scm) -> Self {
        self.scm = Some(scm);
        self
    }

    /// Resolves the criteria to the matched package set. An empty result is
    /// not an error here; callers decide how to report it.
    pub fn resolve(&self, criteria: &SelectionCriteria) -> Result<HashSet<PackageName>, Error> {
        let mut matched = HashSet::new();

        if criteria.independent_packages {
            for (name, info) in self.pkg_graph.packages() {
                if info.release_group.is_none() {
                    matched.insert(name.clone());
                }
            }
        }

        for group_name in &criteria.release_groups {
            let group = self.pkg_graph.release_group(group_name).ok_or_else(|| {
                Error::UnknownReleaseGroup {
                    name: group_name.clone(),
                }
            })?;
            matched.extend(group.child_packages().cloned());
        }

        for group_name in &criteria.release_group_roots {
            let group = self.pkg_graph.release_group(group_name).ok_or_else(|| {
                Error::UnknownReleaseGroup {
                    name: group_name.clone(),
                }
            })?;
            match group.root_package() {
                Some(root) => {
                    matched.insert(root.clone());
                }
                None => warn!("release group '{group_name}' has no root package"),
            }
        }

        for directory in &criteria.directory {
            match self.package_in_directory(directory) {
                Some(name) => {
                    matched.insert(name);
                }
                None => warn!("no package rooted at '{directory}'"),
            }
        }

        if let Some(branch) = &criteria.changed_since_branch {
            let scm = self.scm.ok_or(Error::ScmUnavailable)?;
            matched.extend(self.changed_packages(scm, branch)?);
        }

        Ok(apply_filters(self.pkg_graph, matched, criteria))
    }

    fn package_in_directory(&self, directory: &Utf8PathBuf) -> Option<PackageName> {
        let resolved = if directory.is_absolute() {
            directory.clone()
        } else {
            self.pkg_graph.repo_root().join(directory)
        };
        self.pkg_graph
            .packages()
            .find(|(_, info)| info.package_dir == resolved)
            .map(|(name, _)| name.clone())
    }

    /// Maps each changed file to the deepest package directory containing it.
    fn changed_packages(
        &self,
        scm: &dyn Scm,
        branch: &str,
    ) -> Result<HashSet<PackageName>, Error> {
        let changed_files = scm.changed_files_since(branch, None)?;
        debug!("{} files changed since {branch}", changed_files.len());

        let mut changed = HashSet::new();
        for file in changed_files {
            let file = if file.is_absolute() {
                file
            } else {
                self.pkg_graph.repo_root().join(file)
            };
            let owner = self
                .pkg_graph
                .packages()
                .filter(|(_, info)| file.starts_with(&info.package_dir))
                .max_by_key(|(_, info)| info.package_dir.as_str().len());
            if let Some((name, _)) = owner {
                changed.insert(name.clone());
            }
        }
        Ok(changed)
    }
}

/// Layers the scope / skip-scope prefixes and the private tri-state on top of
/// the matched set.
fn apply_filters(
    pkg_graph: &PackageGraph,
    matched: HashSet<PackageName>,
    criteria: &SelectionCriteria,
) -> HashSet<PackageName> {
    matched
        .into_iter()
        .filter(|name| {
            if !criteria.scope.is_empty()
                && !criteria
                    .scope
                    .iter()
                    .any(|prefix| name.as_str().starts_with(prefix))
            {
                return false;
            }
            if criteria
                .skip_scope
                .iter()
                .any(|prefix| name.as_str().starts_with(prefix))
            {
                return false;
            }
            let private = pkg_graph
                .package_json(name)
                .map(|json| json.private)
                .unwrap_or(false);
            criteria.private.admits(private)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use camino::Utf8Path;
    use pretty_assertions::assert_eq;
    use railyard_config::{BuildConfig, PrivateFilter};
    use railyard_repository::{
        package_graph::{PackageGraphBuilder, PackageInfo},
        package_json::PackageJson,
    };

    use super::*;

    struct StubScm {
        changed: Vec<Utf8PathBuf>,
    }

    impl Scm for StubScm {
        fn current_branch(&self) -> Result<String, ScmError> {
            Ok("main".to_string())
        }
        fn remote(&self, _partial_url: &str) -> Result<Option<String>, ScmError> {
            Ok(None)
        }
        fn changed_files_since(
            &self,
            _reference: &str,
            _remote: Option<&str>,
        ) -> Result<Vec<Utf8PathBuf>, ScmError> {
            Ok(self.changed.clone())
        }
        fn fetch_tags(&self) -> Result<(), ScmError> {
            Ok(())
        }
        fn tags_matching(&self, _prefix: &str) -> Result<Vec<String>, ScmError> {
            Ok(Vec::new())
        }
        fn commit_date(&self, _tag: &str) -> Result<Option<String>, ScmError> {
            Ok(None)
        }
    }

    fn package(name: &str, dir: &str, private: bool) -> PackageInfo {
        PackageInfo {
            package_json: PackageJson {
                name: name.to_string(),
                private,
                ..Default::default()
            },
            package_dir: Utf8PathBuf::from(dir),
            release_group: None,
            is_release_group_root: false,
        }
    }

    fn graph(packages: Vec<PackageInfo>) -> PackageGraph {
        let config = BuildConfig::default();
        PackageGraphBuilder::from_packages(
            Utf8Path::new("/repo"),
            &config,
            packages,
            BTreeMap::new(),
        )
        .build()
        .expect("test graph builds")
    }

    fn names(set: &HashSet<PackageName>) -> Vec<&str> {
        let mut names: Vec<_> = set.iter().map(|name| name.as_str()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_independent_packages() {
        let graph = graph(vec![
            package("a", "/repo/tools/a", false),
            package("b", "/repo/tools/b", false),
        ]);
        let criteria = SelectionCriteria {
            independent_packages: true,
            ..Default::default()
        };
        let matched = ScopeResolver::new(&graph).resolve(&criteria).unwrap();
        assert_eq!(names(&matched), ["a", "b"]);
    }

    #[test]
    fn test_directory_selection() {
        let graph = graph(vec![
            package("a", "/repo/tools/a", false),
            package("b", "/repo/tools/b", false),
        ]);
        let criteria = SelectionCriteria {
            directory: vec![Utf8PathBuf::from("tools/b")],
            ..Default::default()
        };
        let matched = ScopeResolver::new(&graph).resolve(&criteria).unwrap();
        assert_eq!(names(&matched), ["b"]);
    }

    #[test]
    fn test_changed_since_maps_files_to_deepest_package() {
        let graph = graph(vec![
            package("outer", "/repo/pkg", false),
            package("inner", "/repo/pkg/nested", false),
        ]);
        let scm = StubScm {
            changed: vec![Utf8PathBuf::from("pkg/nested/src/x.ts")],
        };
        let criteria = SelectionCriteria {
            changed_since_branch: Some("main".to_string()),
            ..Default::default()
        };
        let matched = ScopeResolver::new(&graph)
            .with_scm(&scm)
            .resolve(&criteria)
            .unwrap();
        assert_eq!(names(&matched), ["inner"]);
    }

    #[test]
    fn test_changed_since_without_scm_is_an_error() {
        let graph = graph(vec![package("a", "/repo/a", false)]);
        let criteria = SelectionCriteria {
            changed_since_branch: Some("main".to_string()),
            ..Default::default()
        };
        let err = ScopeResolver::new(&graph).resolve(&criteria).unwrap_err();
        assert!(matches!(err, Error::ScmUnavailable));
    }

    #[test]
    fn test_scope_and_skip_scope_prefixes() {
        let graph = graph(vec![
            package("@scope/a", "/repo/a", false),
            package("@scope/a-test", "/repo/at", false),
            package("@other/b", "/repo/b", false),
        ]);
        let criteria = SelectionCriteria {
            independent_packages: true,
            scope: vec!["@scope/".to_string()],
            skip_scope: vec!["@scope/a-test".to_string()],
            ..Default::default()
        };
        let matched = ScopeResolver::new(&graph).resolve(&criteria).unwrap();
        assert_eq!(names(&matched), ["@scope/a"]);
    }

    #[test]
    fn test_private_filter() {
        let graph = graph(vec![
            package("open", "/repo/open", false),
            package("secret", "/repo/secret", true),
        ]);
        let criteria = SelectionCriteria {
            independent_packages: true,
            private: PrivateFilter::OnlyPrivate,
            ..Default::default()
        };
        let matched = ScopeResolver::new(&graph).resolve(&criteria).unwrap();
        assert_eq!(names(&matched), ["secret"]);
    }

    #[test]
    fn test_unknown_release_group() {
        let graph = graph(vec![package("a", "/repo/a", false)]);
        let criteria = SelectionCriteria {
            release_groups: vec!["nope".to_string()],
            ..Default::default()
        };
        let err = ScopeResolver::new(&graph).resolve(&criteria).unwrap_err();
        assert!(matches!(err, Error::UnknownReleaseGroup { name } if name == "nope"));
    }
}
