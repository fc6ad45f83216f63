//! End-to-end orchestration: discovery, selection, graph construction, the
//! incremental phase, execution, and the final report.

use std::{collections::HashMap, sync::Arc};

use petgraph::prelude::NodeIndex;
use railyard_engine::{Engine, EngineBuilder};
use railyard_repository::package_graph::PackageGraph;
use railyard_scope::{Scm, ScopeResolver};
use railyard_task_hash::{resolve_task_inputs, CacheStatus, FileHashes, IncrementalChecker};
use railyard_task_id::TaskName;
use tracing::debug;

use crate::{
    summary::{print_summary, SummaryState, TaskSummary},
    visitor::{LeafPlan, Visitor},
    worker_pool::WorkerPool,
    BuildContext, Error, ExitStatus,
};

#[derive(Debug)]
pub struct BuildResult {
    pub exit: ExitStatus,
    pub state: SummaryState,
    pub failures: Vec<TaskSummary>,
}

impl BuildResult {
    /// The red failure report or the success line, per the summary module.
    pub fn print(&self) {
        print_summary(&self.state, &self.failures);
    }
}

/// Runs a build without an SCM collaborator or worker pool.
pub async fn run_build(context: &BuildContext) -> Result<BuildResult, Error> {
    run_build_with(context, None, None).await
}

pub async fn run_build_with(
    context: &BuildContext,
    scm: Option<&dyn Scm>,
    worker_pool: Option<Arc<WorkerPool>>,
) -> Result<BuildResult, Error> {
    context
        .config
        .validate()
        .map_err(railyard_engine::Error::from)?;

    let package_graph = PackageGraph::builder(&context.repo_root, &context.config).build()?;
    // A package-level cycle is fatal before any task runs.
    package_graph.validate()?;

    let mut resolver = ScopeResolver::new(&package_graph);
    if let Some(scm) = scm {
        resolver = resolver.with_scm(scm);
    }
    let matched = resolver.resolve(&context.selection)?;
    if matched.is_empty() {
        return Err(Error::NoMatchedPackages);
    }
    debug!("{} packages matched", matched.len());

    let mut workspaces: Vec<_> = matched.into_iter().collect();
    workspaces.sort();
    let engine = Arc::new(
        EngineBuilder::new(&package_graph, &context.config)
            .with_workspaces(workspaces)
            .with_tasks(
                context
                    .targets
                    .iter()
                    .map(|target| TaskName::from(target.clone())),
            )
            .build()?,
    );

    let file_hashes = Arc::new(FileHashes::new());
    let plans = classify(&engine, &package_graph, context, &file_hashes).await?;
    // Outputs change under the memo once tasks start running; execution
    // re-hashes from live files.
    file_hashes.clear();

    let visitor = Visitor::new(
        engine,
        plans,
        file_hashes,
        context.repo_root.clone(),
        worker_pool,
        context.options.clone(),
    );
    let (state, failures) = visitor.visit().await?;

    let exit = if state.is_success() {
        ExitStatus::Success
    } else {
        ExitStatus::TaskFailed
    };
    Ok(BuildResult {
        exit,
        state,
        failures,
    })
}

/// The incremental phase: resolve each leaf's declared inputs, compare
/// against its donefile, then propagate — a task is up-to-date only when its
/// donefile matches *and* every dependency is itself up-to-date.
async fn classify(
    engine: &Engine,
    package_graph: &PackageGraph,
    context: &BuildContext,
    file_hashes: &FileHashes,
) -> Result<HashMap<NodeIndex, LeafPlan>, Error> {
    let checker = IncrementalChecker::new(file_hashes, &context.repo_root);
    let mut donefile_hits = HashMap::new();
    let mut plans = HashMap::new();

    for leaf in engine.leaf_tasks() {
        let task = engine.task(leaf);
        let command = task
            .command()
            .expect("leaf tasks carry a command")
            .to_string();
        let task_id = task.task_id().expect("leaf tasks are named");
        let package_dir = package_graph
            .package_dir(task.package())
            .ok_or_else(|| {
                Error::Internal(format!("no package directory for {}", task.package()))
            })?
            .to_owned();

        let spec = resolve_task_inputs(&command, &package_dir, &context.repo_root, &context.config);
        let check = checker
            .check(&task_id, &command, &package_dir, spec.as_ref())
            .await;
        debug!("{task_id}: {:?}", check.status);

        donefile_hits.insert(leaf, check.status == CacheStatus::Hit);
        plans.insert(
            leaf,
            LeafPlan {
                command,
                package_dir,
                spec,
                up_to_date: false,
            },
        );
    }

    let mut effective = HashMap::new();
    for leaf in engine.leaf_tasks() {
        effective_up_to_date(engine, leaf, &donefile_hits, &mut effective);
    }
    for (leaf, plan) in plans.iter_mut() {
        plan.up_to_date = effective.get(leaf).copied().unwrap_or(false);
    }

    Ok(plans)
}

fn effective_up_to_date(
    engine: &Engine,
    leaf: NodeIndex,
    donefile_hits: &HashMap<NodeIndex, bool>,
    memo: &mut HashMap<NodeIndex, bool>,
) -> bool {
    if let Some(&known) = memo.get(&leaf) {
        return known;
    }
    memo.insert(leaf, false);
    let up_to_date = donefile_hits.get(&leaf).copied().unwrap_or(false)
        && engine
            .leaf_dependencies(leaf)
            .into_iter()
            .all(|dep| effective_up_to_date(engine, dep, donefile_hits, memo));
    memo.insert(leaf, up_to_date);
    up_to_date
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use camino::{Utf8Path, Utf8PathBuf};
    use pretty_assertions::assert_eq;
    use railyard_config::{BuildConfig, SelectionCriteria};

    use super::*;
    use crate::BuildOptions;

    fn write_package(dir: &Utf8Path, json: &str) -> Result<()> {
        std::fs::create_dir_all(dir.join("src"))?;
        std::fs::write(dir.join("package.json"), json)?;
        std::fs::write(dir.join("src/index.ts"), "export {}")?;
        Ok(())
    }

    fn test_repo(alpha_build: &str, beta_build: &str) -> Result<(tempfile::TempDir, BuildContext)> {
        let tmp = tempfile::tempdir()?;
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");

        write_package(
            &root.join("packages/alpha"),
            &format!(
                r#"{{"name": "alpha", "version": "1.0.0", "scripts": {{"build": "{alpha_build}"}}}}"#
            ),
        )?;
        write_package(
            &root.join("packages/beta"),
            &format!(
                r#"{{"name": "beta", "version": "1.0.0",
                    "dependencies": {{"alpha": "workspace:~"}},
                    "scripts": {{"build": "{beta_build}"}}}}"#
            ),
        )?;

        let config: BuildConfig = serde_json::from_str(
            r#"{
                "tasks": {"build": ["^build"]},
                "declarativeTasks": {
                    "true": {"inputGlobs": ["src/**"]}
                }
            }"#,
        )?;

        let context = BuildContext {
            repo_root: root,
            config,
            selection: SelectionCriteria {
                independent_packages: true,
                ..Default::default()
            },
            targets: vec!["build".to_string()],
            options: BuildOptions {
                concurrency: 2,
                ..Default::default()
            },
        };
        Ok((tmp, context))
    }

    #[tokio::test]
    async fn test_build_then_up_to_date() -> Result<()> {
        let (_tmp, context) = test_repo("true", "true")?;

        let first = run_build(&context).await?;
        assert_eq!(first.exit, ExitStatus::Success);
        assert_eq!(first.state.succeeded, 2);
        assert_eq!(first.state.up_to_date, 0);

        // Unchanged inputs: the whole graph reports up-to-date.
        let second = run_build(&context).await?;
        assert_eq!(second.exit, ExitStatus::Success);
        assert_eq!(second.state.succeeded, 0);
        assert_eq!(second.state.up_to_date, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_touched_input_reruns_dependents() -> Result<()> {
        let (_tmp, context) = test_repo("true", "true")?;
        run_build(&context).await?;

        std::fs::write(
            context.repo_root.join("packages/alpha/src/index.ts"),
            "export const changed = 1;",
        )?;

        // alpha misses on its changed input; beta's donefile still matches
        // but its dependency ran, so it runs too.
        let result = run_build(&context).await?;
        assert_eq!(result.state.succeeded, 2);
        assert_eq!(result.state.up_to_date, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_skips_dependents() -> Result<()> {
        let (_tmp, context) = test_repo("false", "true")?;

        let result = run_build(&context).await?;
        assert_eq!(result.exit, ExitStatus::TaskFailed);
        assert_eq!(result.state.failed, 1);
        assert_eq!(result.state.not_run, 1);
        assert_eq!(result.state.succeeded, 0);

        let failed: Vec<_> = result
            .failures
            .iter()
            .map(|failure| (failure.task_id.to_string(), failure.outcome))
            .collect();
        assert!(failed.contains(&(
            "alpha#build".to_string(),
            crate::summary::TaskOutcome::Failed
        )));
        assert!(failed.contains(&(
            "beta#build".to_string(),
            crate::summary::TaskOutcome::NotRun
        )));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_task_keeps_output_tail() -> Result<()> {
        let (_tmp, context) = test_repo("echo boom && exit 1", "true")?;

        let result = run_build(&context).await?;
        let alpha = result
            .failures
            .iter()
            .find(|failure| failure.task_id.package() == "alpha")
            .expect("alpha failed");
        assert!(alpha.output_tail.as_deref().unwrap_or("").contains("boom"));
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_runs_nothing() -> Result<()> {
        let (_tmp, mut context) = test_repo("false", "false")?;
        context.options.dry_run = true;

        let result = run_build(&context).await?;
        assert_eq!(result.exit, ExitStatus::Success);
        assert_eq!(result.state.would_run, 2);
        assert_eq!(result.state.failed, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_no_matched_packages() -> Result<()> {
        let (_tmp, mut context) = test_repo("true", "true")?;
        context.selection = SelectionCriteria::default();

        let err = run_build(&context).await.unwrap_err();
        assert_eq!(err.exit_status(), ExitStatus::NoMatchedPackages);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_target_fails_graph_construction() -> Result<()> {
        let (_tmp, mut context) = test_repo("true", "true")?;
        context.targets = vec!["deploy".to_string()];

        let err = run_build(&context).await.unwrap_err();
        assert_eq!(err.exit_status(), ExitStatus::GraphConstructionFailed);
        Ok(())
    }
}
