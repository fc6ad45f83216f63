//! Rendering of the task graph for a `--graph`-style flag: Graphviz DOT and
//! Mermaid. Strong `dependsOn` edges render solid, weak ordering edges
//! dashed.

use std::fmt::Write;

use itertools::Itertools;
use petgraph::visit::EdgeRef;

use crate::{Built, EdgeKind, Engine};

pub fn render_dot(engine: &Engine<Built>) -> String {
    let graph = engine.task_graph();
    let mut out = String::new();
    writeln!(out, "digraph tasks {{").expect("writing to string");

    for (edge, line) in graph
        .edge_references()
        .map(|edge| {
            let source = &graph[edge.source()];
            let target = &graph[edge.target()];
            (edge, format!("\t\"{source}\" -> \"{target}\""))
        })
        .sorted_by(|(_, a), (_, b)| a.cmp(b))
    {
        let style = match edge.weight() {
            EdgeKind::Strong => "",
            EdgeKind::Weak => " [style=dashed]",
        };
        writeln!(out, "{line}{style}").expect("writing to string");
    }

    writeln!(out, "}}").expect("writing to string");
    out
}

pub fn render_mermaid(engine: &Engine<Built>) -> String {
    let graph = engine.task_graph();
    let mut out = String::new();
    writeln!(out, "graph TD").expect("writing to string");

    let lines = graph
        .edge_references()
        .map(|edge| {
            let source = &graph[edge.source()];
            let target = &graph[edge.target()];
            let arrow = match edge.weight() {
                EdgeKind::Strong => "-->",
                EdgeKind::Weak => "-.->",
            };
            format!("\t{}[\"{source}\"] {arrow} {}[\"{target}\"]", id(source.to_string()), id(target.to_string()))
        })
        .sorted()
        .collect::<Vec<_>>();
    for line in lines {
        writeln!(out, "{line}").expect("writing to string");
    }
    out
}

/// Mermaid node ids cannot contain `#` or spaces.
fn id(display: String) -> String {
    display
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use camino::{Utf8Path, Utf8PathBuf};
    use railyard_config::BuildConfig;
    use railyard_repository::{
        package_graph::{PackageGraphBuilder, PackageInfo, PackageName},
        package_json::PackageJson,
    };
    use railyard_task_id::TaskName;

    use super::*;
    use crate::EngineBuilder;

    fn engine() -> Engine<Built> {
        let config: BuildConfig =
            serde_json::from_str(r#"{"tasks": {"build": ["^build"]}}"#).unwrap();
        let alpha: PackageJson = serde_json::from_str(
            r#"{"name": "alpha", "version": "1.0.0", "scripts": {"build": "tsc"}}"#,
        )
        .unwrap();
        let beta: PackageJson = serde_json::from_str(
            r#"{"name": "beta", "version": "1.0.0",
                "dependencies": {"alpha": "workspace:~"}, "scripts": {"build": "tsc"}}"#,
        )
        .unwrap();
        let packages = vec![
            PackageInfo {
                package_json: alpha,
                package_dir: Utf8PathBuf::from("/repo/packages/alpha"),
                release_group: None,
                is_release_group_root: false,
            },
            PackageInfo {
                package_json: beta,
                package_dir: Utf8PathBuf::from("/repo/packages/beta"),
                release_group: None,
                is_release_group_root: false,
            },
        ];
        let pkg_graph = PackageGraphBuilder::from_packages(
            Utf8Path::new("/repo"),
            &config,
            packages,
            BTreeMap::new(),
        )
        .build()
        .unwrap();

        EngineBuilder::new(&pkg_graph, &config)
            .with_workspaces(vec![PackageName::from("beta")])
            .with_tasks([TaskName::from("build".to_string())])
            .build()
            .unwrap()
    }

    #[test]
    fn test_dot_lists_strong_edges() {
        let engine = engine();
        let dot = render_dot(&engine);
        assert!(dot.starts_with("digraph tasks {"));
        assert!(dot.contains("\"beta#build\" -> \"alpha#build\""));
        assert!(!dot.contains("style=dashed"));
    }

    #[test]
    fn test_mermaid_output() {
        let engine = engine();
        let mermaid = render_mermaid(&engine);
        assert!(mermaid.starts_with("graph TD"));
        assert!(mermaid.contains("beta_build[\"beta#build\"] --> alpha_build[\"alpha#build\"]"));
    }
}
