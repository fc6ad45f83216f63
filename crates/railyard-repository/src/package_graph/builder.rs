//! Discovery of the repo's packages and construction of the package graph.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::prelude::*;
use railyard_config::{BuildConfig, RepoPackagesEntry};
use tracing::{debug, warn};
use wax::Pattern;

use super::{Error, PackageGraph, PackageInfo, PackageName};
use crate::{package_json::PackageJson, release_group::ReleaseGroup};

type DepFilter<'a> = Box<dyn Fn(&PackageName, &PackageName) -> bool + 'a>;

pub struct PackageGraphBuilder<'a> {
    repo_root: &'a Utf8Path,
    config: &'a BuildConfig,
    packages: Option<Vec<PackageInfo>>,
    release_groups: Option<BTreeMap<String, ReleaseGroup>>,
    dep_filter: Option<DepFilter<'a>>,
}

impl<'a> PackageGraphBuilder<'a> {
    pub fn new(repo_root: &'a Utf8Path, config: &'a BuildConfig) -> Self {
        Self {
            repo_root,
            config,
            packages: None,
            release_groups: None,
            dep_filter: None,
        }
    }

    /// Builds from an already-discovered package set instead of reading the
    /// filesystem. Used by tests and by callers re-projecting a graph.
    pub fn from_packages(
        repo_root: &'a Utf8Path,
        config: &'a BuildConfig,
        packages: Vec<PackageInfo>,
        release_groups: BTreeMap<String, ReleaseGroup>,
    ) -> Self {
        Self {
            repo_root,
            config,
            packages: Some(packages),
            release_groups: Some(release_groups),
            dep_filter: None,
        }
    }

    /// Suppresses individual dependency edges. Used to project the graph down
    /// to a release group.
    pub fn with_dep_filter<F: Fn(&PackageName, &PackageName) -> bool + 'a>(
        mut self,
        filter: F,
    ) -> Self {
        self.dep_filter = Some(Box::new(filter));
        self
    }

    pub fn build(self) -> Result<PackageGraph, Error> {
        let Self {
            repo_root,
            config,
            packages,
            release_groups,
            dep_filter,
        } = self;

        let (packages, release_groups) = match (packages, release_groups) {
            (Some(packages), Some(release_groups)) => (packages, release_groups),
            _ => discover(repo_root, config)?,
        };

        let mut graph = Graph::new();
        let mut node_lookup = std::collections::HashMap::new();
        let mut by_name = std::collections::HashMap::new();

        for info in packages {
            let name = info.name();
            if let Some(previous) = by_name.insert(name.clone(), info) {
                let info = &by_name[&name];
                return Err(Error::DuplicatePackage {
                    name: name.to_string(),
                    first: previous.package_dir.to_string(),
                    second: info.package_dir.to_string(),
                });
            }
            let index = graph.add_node(name.clone());
            node_lookup.insert(name, index);
        }

        for (name, info) in &by_name {
            let from = node_lookup[name];
            for (dep_name, range) in info.package_json.all_dependencies() {
                let dep = PackageName::from(dep_name.as_str());
                let Some(dep_info) = by_name.get(&dep) else {
                    continue;
                };
                if !range_satisfied(range, dep_info.package_json.version.as_deref()) {
                    warn!(
                        "{name} depends on {dep_name}@{range} but the repo has \
                         {dep_name}@{version}; skipping edge",
                        version = dep_info.package_json.version.as_deref().unwrap_or("unknown"),
                    );
                    continue;
                }
                if let Some(filter) = &dep_filter {
                    if !filter(name, &dep) {
                        debug!("dep filter suppressed edge {name} -> {dep}");
                        continue;
                    }
                }
                graph.update_edge(from, node_lookup[&dep], ());
            }
        }

        // A release-group root implicitly depends on every member, so a
        // root-level fan-out task reaches members the root manifest never
        // names.
        for group in release_groups.values() {
            let Some(root) = group.root_package() else {
                continue;
            };
            let Some(&root_index) = node_lookup.get(root) else {
                continue;
            };
            for member in group.child_packages() {
                if let Some(&member_index) = node_lookup.get(member) {
                    if let Some(filter) = &dep_filter {
                        if !filter(root, member) {
                            continue;
                        }
                    }
                    graph.update_edge(root_index, member_index, ());
                }
            }
        }

        Ok(PackageGraph {
            graph,
            node_lookup,
            packages: by_name,
            release_groups,
            repo_root: repo_root.to_owned(),
        })
    }
}

/// A `workspace:` range is satisfied by definition; anything else must parse
/// as a semver range matched by the dependency's actual version.
fn range_satisfied(range: &str, version: Option<&str>) -> bool {
    if range.starts_with("workspace:") {
        return true;
    }
    let Some(version) = version else {
        return false;
    };
    let Ok(version) = node_semver::Version::parse(version) else {
        return false;
    };
    match node_semver::Range::parse(range) {
        Ok(range) => version.satisfies(&range),
        Err(_) => false,
    }
}

fn discover(
    repo_root: &Utf8Path,
    config: &BuildConfig,
) -> Result<(Vec<PackageInfo>, BTreeMap<String, ReleaseGroup>), Error> {
    let mut packages = Vec::new();
    let mut release_groups = BTreeMap::new();

    for (group_name, entry) in &config.repo_packages {
        match entry {
            RepoPackagesEntry::Directory(dir) => {
                discover_independent(&repo_root.join(dir), &mut packages)?;
            }
            RepoPackagesEntry::Group(group_config) => {
                let group_dir = repo_root.join(&group_config.directory);
                let group = discover_group(
                    group_name,
                    &group_dir,
                    &group_config.ignored_dirs,
                    group_config.default_interdependency_range.clone(),
                    &mut packages,
                )?;
                release_groups.insert(group_name.clone(), group);
            }
        }
    }

    Ok((packages, release_groups))
}

/// A directory entry holds either a single package or a flat set of
/// independently-versioned packages.
fn discover_independent(dir: &Utf8Path, packages: &mut Vec<PackageInfo>) -> Result<(), Error> {
    let manifest = dir.join("package.json");
    if manifest.is_file() {
        packages.push(load_package(dir, None, false)?);
        return Ok(());
    }
    let Ok(entries) = dir.read_dir_utf8() else {
        debug!("skipping unreadable package directory {dir}");
        return Ok(());
    };
    for entry in entries.flatten() {
        let child = entry.path();
        if child.join("package.json").is_file() {
            packages.push(load_package(child, None, false)?);
        }
    }
    Ok(())
}

fn discover_group(
    name: &str,
    group_dir: &Utf8Path,
    ignored_dirs: &[Utf8PathBuf],
    interdependency_range: Option<String>,
    packages: &mut Vec<PackageInfo>,
) -> Result<ReleaseGroup, Error> {
    if !group_dir.join("package.json").is_file() {
        return Err(Error::MissingGroupManifest {
            group: name.to_string(),
            dir: group_dir.to_string(),
        });
    }
    let root = load_package(group_dir, Some(name), true)?;
    let root_name = root.name();
    let version = root.package_json.version.clone();
    let globs = root
        .package_json
        .workspaces
        .as_ref()
        .map(|workspaces| workspaces.globs().to_vec())
        .unwrap_or_default();

    let mut members = vec![root_name.clone()];
    packages.push(root);

    let matchers = globs
        .iter()
        .map(|glob| {
            wax::Glob::new(glob).map_err(|err| Error::InvalidWorkspaceGlob {
                glob: glob.clone(),
                reason: err.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    for entry in walkdir::WalkDir::new(group_dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            entry.file_type().is_dir()
                && entry.file_name() != std::ffi::OsStr::new("node_modules")
        })
        .flatten()
    {
        let Some(dir) = Utf8Path::from_path(entry.path()) else {
            continue;
        };
        let Ok(relative) = dir.strip_prefix(group_dir) else {
            continue;
        };
        if ignored_dirs
            .iter()
            .any(|ignored| relative.starts_with(ignored))
        {
            continue;
        }
        if !matchers.iter().any(|glob| glob.is_match(relative.as_str())) {
            continue;
        }
        if !dir.join("package.json").is_file() {
            continue;
        }
        let member = load_package(dir, Some(name), false)?;
        members.push(member.name());
        packages.push(member);
    }

    Ok(ReleaseGroup::new(
        name.to_string(),
        group_dir.to_owned(),
        version,
        interdependency_range,
        Some(root_name),
        members,
    ))
}

fn load_package(
    dir: &Utf8Path,
    release_group: Option<&str>,
    is_release_group_root: bool,
) -> Result<PackageInfo, Error> {
    let package_json = PackageJson::load(&dir.join("package.json"))?;
    Ok(PackageInfo {
        package_json,
        package_dir: dir.to_owned(),
        release_group: release_group.map(|group| group.to_string()),
        is_release_group_root,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use railyard_config::BuildConfig;
    use tempfile::TempDir;

    use super::*;

    fn write_package(dir: &Utf8Path, json: &str) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("package.json"), json)?;
        Ok(())
    }

    fn repo_with_group() -> Result<(TempDir, Utf8PathBuf)> {
        let tmp = TempDir::new()?;
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");

        write_package(
            &root.join("client"),
            r#"{"name": "client-root", "version": "1.0.0", "private": true,
                "workspaces": ["packages/*"]}"#,
        )?;
        write_package(
            &root.join("client/packages/alpha"),
            r#"{"name": "alpha", "version": "1.0.0", "scripts": {"build": "tsc"}}"#,
        )?;
        write_package(
            &root.join("client/packages/beta"),
            r#"{"name": "beta", "version": "1.0.0",
                "dependencies": {"alpha": "workspace:~"},
                "scripts": {"build": "tsc"}}"#,
        )?;
        write_package(
            &root.join("tools/standalone"),
            r#"{"name": "standalone", "version": "0.1.0"}"#,
        )?;

        Ok((tmp, root))
    }

    fn config() -> BuildConfig {
        serde_json::from_str(
            r#"{
                "repoPackages": {
                    "client": {"directory": "client"},
                    "tools": "tools"
                }
            }"#,
        )
        .expect("valid test config")
    }

    #[test]
    fn test_discovers_group_and_independent_packages() -> Result<()> {
        let (_tmp, root) = repo_with_group()?;
        let config = config();
        let graph = PackageGraphBuilder::new(&root, &config).build()?;

        assert_eq!(graph.len(), 4);
        let group = graph.release_group("client").expect("group exists");
        assert_eq!(group.root_package().unwrap().as_str(), "client-root");
        let mut members: Vec<_> = group.members().iter().map(|m| m.as_str()).collect();
        members.sort();
        assert_eq!(members, ["alpha", "beta", "client-root"]);

        let standalone = graph
            .package_info(&PackageName::from("standalone"))
            .expect("standalone discovered");
        assert!(standalone.release_group.is_none());
        Ok(())
    }

    #[test]
    fn test_group_edges_and_root_flag() -> Result<()> {
        let (_tmp, root) = repo_with_group()?;
        let config = config();
        let graph = PackageGraphBuilder::new(&root, &config).build()?;

        let deps = graph
            .immediate_dependencies(&PackageName::from("beta"))
            .unwrap();
        assert_eq!(deps, [&PackageName::from("alpha")].into_iter().collect());

        let root_info = graph
            .package_info(&PackageName::from("client-root"))
            .unwrap();
        assert!(root_info.is_release_group_root);

        // The root implicitly depends on every member even though its
        // manifest names none of them.
        let root_deps = graph
            .immediate_dependencies(&PackageName::from("client-root"))
            .unwrap();
        assert_eq!(
            root_deps,
            [&PackageName::from("alpha"), &PackageName::from("beta")]
                .into_iter()
                .collect()
        );
        Ok(())
    }

    #[test]
    fn test_missing_group_manifest_is_an_error() -> Result<()> {
        let tmp = TempDir::new()?;
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
        let config: BuildConfig =
            serde_json::from_str(r#"{"repoPackages": {"client": {"directory": "client"}}}"#)?;

        let err = PackageGraphBuilder::new(&root, &config).build().unwrap_err();
        assert!(matches!(err, Error::MissingGroupManifest { .. }), "{err}");
        Ok(())
    }
}
