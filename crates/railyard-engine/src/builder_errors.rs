//! Errors surfaced while resolving definitions and constructing the graph.

use miette::Diagnostic;
use railyard_repository::package_graph::PackageName;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("Could not find script '{task}' in package '{package}'")]
    #[diagnostic(
        code(railyard::engine::missing_script),
        help("add the script to the package manifest or configure a task definition")
    )]
    MissingScript { package: PackageName, task: String },

    #[error("Task '{dependent}' depends on unknown task '{task}' in package '{package}'")]
    #[diagnostic(code(railyard::engine::missing_task))]
    MissingTask {
        package: PackageName,
        task: String,
        dependent: String,
    },

    #[error(
        "Task '{dependent}' depends on '{package}#{task}' but '{package}' is not a dependency of \
         '{owner}'"
    )]
    #[diagnostic(code(railyard::engine::package_not_a_dependency))]
    PackageNotADependency {
        owner: PackageName,
        package: String,
        task: String,
        dependent: String,
    },

    #[error("'{entry}' is not allowed in dependsOn (task '{dependent}')")]
    #[diagnostic(
        code(railyard::engine::wildcard_in_depends_on),
        help("wildcards only order existing tasks; use them in `before` or `after`")
    )]
    WildcardInDependsOn { dependent: String, entry: String },

    #[error("No package.json found for '{package}'")]
    MissingPackageJson { package: PackageName },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] railyard_config::Error),

    #[error(transparent)]
    Graph(#[from] railyard_graph_utils::Error),
}
