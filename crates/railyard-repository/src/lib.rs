//! The in-memory model of the repository: packages, their manifests, their
//! release-group membership, and the cross-package dependency graph.
//!
//! Packages are discovered once at startup and are immutable for the rest of
//! the run.

pub mod package_graph;
pub mod package_json;
pub mod release_group;
