//! The package graph: every package in the repo, keyed by name, with edges to
//! the packages it depends on.

mod builder;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::prelude::*;
use serde::{Deserialize, Serialize};

pub use crate::package_graph::builder::PackageGraphBuilder;
use crate::{package_json::PackageJson, release_group::ReleaseGroup};

/// Sentinel level marking a package whose depth-first visit is still on the
/// stack. Revisiting one means the package graph has a cycle.
const LEVEL_IN_PROGRESS: i64 = -2;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageName(String);

impl PackageName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PackageName {
    fn from(name: &str) -> Self {
        PackageName(name.to_string())
    }
}

impl From<String> for PackageName {
    fn from(name: String) -> Self {
        PackageName(name)
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for PackageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub package_json: PackageJson,
    /// Absolute directory the manifest was loaded from.
    pub package_dir: Utf8PathBuf,
    pub release_group: Option<String>,
    pub is_release_group_root: bool,
}

impl PackageInfo {
    pub fn name(&self) -> PackageName {
        PackageName::from(self.package_json.name.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    PackageJson(#[from] crate::package_json::Error),
    #[error("duplicate package name '{name}' (in {first} and {second})")]
    DuplicatePackage {
        name: String,
        first: String,
        second: String,
    },
    #[error("release group '{group}' has no package.json at {dir}")]
    MissingGroupManifest { group: String, dir: String },
    #[error("invalid workspace glob '{glob}': {reason}")]
    InvalidWorkspaceGlob { glob: String, reason: String },
    #[error("package dependency cycle detected between '{from}' and '{to}'")]
    PackageCycle { from: PackageName, to: PackageName },
}

#[derive(Debug)]
pub struct PackageGraph {
    graph: Graph<PackageName, ()>,
    node_lookup: HashMap<PackageName, NodeIndex>,
    packages: HashMap<PackageName, PackageInfo>,
    release_groups: BTreeMap<String, ReleaseGroup>,
    repo_root: Utf8PathBuf,
}

impl PackageGraph {
    pub fn builder<'a>(
        repo_root: &'a Utf8Path,
        config: &'a railyard_config::BuildConfig,
    ) -> PackageGraphBuilder<'a> {
        PackageGraphBuilder::new(repo_root, config)
    }

    pub fn repo_root(&self) -> &Utf8Path {
        &self.repo_root
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn packages(&self) -> impl Iterator<Item = (&PackageName, &PackageInfo)> {
        self.packages.iter()
    }

    pub fn package_info(&self, name: &PackageName) -> Option<&PackageInfo> {
        self.packages.get(name)
    }

    pub fn package_json(&self, name: &PackageName) -> Option<&PackageJson> {
        self.package_info(name).map(|info| &info.package_json)
    }

    pub fn package_dir(&self, name: &PackageName) -> Option<&Utf8Path> {
        self.package_info(name)
            .map(|info| info.package_dir.as_path())
    }

    pub fn release_groups(&self) -> impl Iterator<Item = &ReleaseGroup> {
        self.release_groups.values()
    }

    pub fn release_group(&self, name: &str) -> Option<&ReleaseGroup> {
        self.release_groups.get(name)
    }

    /// The packages `name` directly depends on.
    pub fn immediate_dependencies(&self, name: &PackageName) -> Option<HashSet<&PackageName>> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// The packages that directly depend on `name`.
    pub fn immediate_dependents(&self, name: &PackageName) -> Option<HashSet<&PackageName>> {
        self.neighbors(name, Direction::Incoming)
    }

    fn neighbors(
        &self,
        name: &PackageName,
        direction: Direction,
    ) -> Option<HashSet<&PackageName>> {
        let index = self.node_lookup.get(name)?;
        Some(
            self.graph
                .neighbors_directed(*index, direction)
                .map(|index| {
                    self.graph
                        .node_weight(index)
                        .expect("node index should be present")
                })
                .collect(),
        )
    }

    /// Assigns each package its level: the length of the longest path from it
    /// to a leaf package. A cycle is reported as the pair of packages on the
    /// back edge.
    pub fn package_levels(&self) -> Result<HashMap<PackageName, u32>, Error> {
        let mut levels: HashMap<NodeIndex, i64> = HashMap::with_capacity(self.graph.node_count());
        for index in self.graph.node_indices() {
            self.level_of(index, &mut levels)?;
        }
        Ok(levels
            .into_iter()
            .map(|(index, level)| {
                let name = self
                    .graph
                    .node_weight(index)
                    .expect("level computed for missing node")
                    .clone();
                (name, u32::try_from(level).expect("levels are non-negative"))
            })
            .collect())
    }

    fn level_of(
        &self,
        index: NodeIndex,
        levels: &mut HashMap<NodeIndex, i64>,
    ) -> Result<i64, Error> {
        if let Some(&level) = levels.get(&index) {
            return Ok(level);
        }
        levels.insert(index, LEVEL_IN_PROGRESS);

        let mut level = 0;
        for dep in self.graph.neighbors_directed(index, Direction::Outgoing) {
            if levels.get(&dep) == Some(&LEVEL_IN_PROGRESS) {
                return Err(Error::PackageCycle {
                    from: self.graph[index].clone(),
                    to: self.graph[dep].clone(),
                });
            }
            level = level.max(self.level_of(dep, levels)? + 1);
        }
        levels.insert(index, level);
        Ok(level)
    }

    /// Validates that the package graph is acyclic.
    pub fn validate(&self) -> Result<(), Error> {
        self.package_levels().map(|_| ())
    }
}
