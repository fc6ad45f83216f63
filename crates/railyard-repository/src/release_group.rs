//! Release groups: named sets of packages sharing a workspace root and a
//! version.

use camino::Utf8PathBuf;

use crate::package_graph::PackageName;

#[derive(Debug, Clone)]
pub struct ReleaseGroup {
    name: String,
    root_dir: Utf8PathBuf,
    version: Option<String>,
    /// The range members use to depend on each other, e.g. `workspace:~`.
    interdependency_range: Option<String>,
    /// The package whose manifest lives at the workspace root, if one is
    /// designated.
    root_package: Option<PackageName>,
    members: Vec<PackageName>,
}

impl ReleaseGroup {
    pub(crate) fn new(
        name: String,
        root_dir: Utf8PathBuf,
        version: Option<String>,
        interdependency_range: Option<String>,
        root_package: Option<PackageName>,
        members: Vec<PackageName>,
    ) -> Self {
        Self {
            name,
            root_dir,
            version,
            interdependency_range,
            root_package,
            members,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_dir(&self) -> &Utf8PathBuf {
        &self.root_dir
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn interdependency_range(&self) -> Option<&str> {
        self.interdependency_range.as_deref()
    }

    pub fn root_package(&self) -> Option<&PackageName> {
        self.root_package.as_ref()
    }

    /// Every member package, the root included.
    pub fn members(&self) -> &[PackageName] {
        &self.members
    }

    /// Member packages excluding the designated root.
    pub fn child_packages(&self) -> impl Iterator<Item = &PackageName> {
        self.members
            .iter()
            .filter(|member| Some(*member) != self.root_package.as_ref())
    }
}
