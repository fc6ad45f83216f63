//! Resolution of a leaf task's declared inputs and outputs.
//!
//! The input glob set comes from the declarative entry keyed by the command's
//! executable (plus subcommand for configured multi-command tools), with
//! native handlers contributing extra inputs for executables we understand
//! natively. A task with neither is non-incremental and always runs.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use railyard_config::BuildConfig;
use tracing::debug;
use wax::Pattern;

use crate::Error;

const REPO_ROOT_TOKEN: &str = "${repoRoot}";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskInputSpec {
    pub input_globs: Vec<String>,
    pub output_globs: Vec<String>,
    pub gitignore_inputs: bool,
    pub gitignore_outputs: bool,
    /// Task-kind-specific state folded into the environment fingerprint,
    /// e.g. normalized compiler options for a tsc task.
    pub extra_state: Option<String>,
}

/// Resolves the declared inputs for `command`, or `None` when the executable
/// has neither a declarative entry nor native support.
pub fn resolve_task_inputs(
    command: &str,
    package_dir: &Utf8Path,
    repo_root: &Utf8Path,
    config: &BuildConfig,
) -> Option<TaskInputSpec> {
    let mut tokens = command.split_whitespace();
    let executable = tokens.next()?;
    let subcommand = tokens.next();

    let key = if config
        .multi_command_executables
        .iter()
        .any(|multi| multi == executable)
    {
        subcommand.map(|sub| format!("{executable} {sub}"))
    } else {
        None
    };

    let declarative = key
        .as_deref()
        .and_then(|key| config.declarative_tasks.get(key))
        .or_else(|| config.declarative_tasks.get(executable));

    let mut spec = declarative.map(|entry| TaskInputSpec {
        input_globs: substitute_repo_root(&entry.input_globs, repo_root),
        output_globs: substitute_repo_root(&entry.output_globs, repo_root),
        gitignore_inputs: entry.gitignore_inputs(),
        gitignore_outputs: entry.gitignore_outputs(),
        extra_state: None,
    });

    if executable == "tsc" {
        if let Some((globs, extra_state)) = tsc_inputs(command, package_dir) {
            let spec = spec.get_or_insert_with(|| TaskInputSpec {
                gitignore_inputs: true,
                ..Default::default()
            });
            spec.input_globs.extend(globs);
            spec.extra_state = extra_state;
        }
    }

    spec
}

fn substitute_repo_root(globs: &[String], repo_root: &Utf8Path) -> Vec<String> {
    let root = repo_root.as_str().trim_end_matches('/');
    globs
        .iter()
        .map(|glob| glob.replace(REPO_ROOT_TOKEN, root))
        .collect()
}

/// Inputs a `tsc` invocation depends on beyond any declarative entry: the
/// resolved tsconfig and its `extends` chain, plus the configured include
/// set.
fn tsc_inputs(command: &str, package_dir: &Utf8Path) -> Option<(Vec<String>, Option<String>)> {
    let project = project_argument(command).unwrap_or("tsconfig.json");
    let mut globs = Vec::new();
    let mut compiler_options = None;

    let mut config_path = package_dir.join(project);
    if config_path.is_dir() {
        config_path = config_path.join("tsconfig.json");
    }

    // Walk the extends chain; each config file is itself an input.
    let mut guard = 0;
    while guard < 16 {
        guard += 1;
        let Ok(contents) = std::fs::read_to_string(&config_path) else {
            debug!("tsc task without readable {config_path}");
            break;
        };
        let Ok(config) = serde_json::from_str::<serde_json::Value>(&contents) else {
            debug!("unparsable tsconfig at {config_path}");
            break;
        };
        if let Ok(relative) = config_path.strip_prefix(package_dir) {
            globs.push(relative.to_string());
        }
        if compiler_options.is_none() {
            compiler_options = config
                .get("compilerOptions")
                .map(normalized_compiler_options);
        }
        if let Some(include) = config.get("include").and_then(|value| value.as_array()) {
            globs.extend(
                include
                    .iter()
                    .filter_map(|value| value.as_str())
                    .map(|glob| glob.to_string()),
            );
        }
        if let Some(files) = config.get("files").and_then(|value| value.as_array()) {
            globs.extend(
                files
                    .iter()
                    .filter_map(|value| value.as_str())
                    .map(|file| file.to_string()),
            );
        }
        match config.get("extends").and_then(|value| value.as_str()) {
            Some(extends) => {
                let base = config_path.parent().unwrap_or(package_dir);
                config_path = base.join(extends);
            }
            None => break,
        }
    }

    if globs.is_empty() {
        return None;
    }
    Some((globs, compiler_options))
}

fn project_argument(command: &str) -> Option<&str> {
    let mut tokens = command.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        if token == "--project" || token == "-p" {
            return tokens.peek().copied();
        }
    }
    None
}

/// Re-serializes compiler options with sorted keys so the fingerprint is
/// stable across formatting differences.
fn normalized_compiler_options(options: &serde_json::Value) -> String {
    match options.as_object() {
        Some(object) => {
            let sorted: BTreeMap<&String, &serde_json::Value> = object.iter().collect();
            serde_json::to_string(&sorted).expect("json value reserializes")
        }
        None => options.to_string(),
    }
}

/// Expands the spec's input globs to the concrete file set, repo-root
/// relative and sorted by path. Gitignored files are excluded when the
/// spec's gitignore setting covers inputs.
pub fn expand_input_files(
    spec: &TaskInputSpec,
    package_dir: &Utf8Path,
    repo_root: &Utf8Path,
) -> Result<Vec<Utf8PathBuf>, Error> {
    expand_files(
        &spec.input_globs,
        spec.gitignore_inputs,
        package_dir,
        repo_root,
    )
}

/// Expands the spec's output globs to the files currently on disk. Outputs
/// are only gitignore-filtered when the spec's gitignore setting covers
/// outputs, so (typically gitignored) build artifacts stay visible by
/// default.
pub fn expand_output_files(
    spec: &TaskInputSpec,
    package_dir: &Utf8Path,
    repo_root: &Utf8Path,
) -> Result<Vec<Utf8PathBuf>, Error> {
    expand_files(
        &spec.output_globs,
        spec.gitignore_outputs,
        package_dir,
        repo_root,
    )
}

fn expand_files(
    globs: &[String],
    gitignore: bool,
    package_dir: &Utf8Path,
    repo_root: &Utf8Path,
) -> Result<Vec<Utf8PathBuf>, Error> {
    let matcher = gitignore.then(|| gitignore_matcher(repo_root, package_dir));

    let mut files = Vec::new();
    for glob in globs {
        let (base, pattern) = match glob.strip_prefix(repo_root.as_str()) {
            Some(stripped) => (repo_root, stripped.trim_start_matches('/')),
            None => (package_dir, glob.as_str()),
        };
        let compiled = wax::Glob::new(pattern).map_err(|err| Error::InvalidGlob {
            glob: glob.clone(),
            reason: err.to_string(),
        })?;

        for entry in walkdir::WalkDir::new(base)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| entry.file_name() != std::ffi::OsStr::new("node_modules"))
            .flatten()
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(path) = Utf8Path::from_path(entry.path()) else {
                continue;
            };
            let Ok(relative) = path.strip_prefix(base) else {
                continue;
            };
            if !compiled.is_match(relative.as_str()) {
                continue;
            }
            if let Some(matcher) = &matcher {
                if matcher
                    .matched_path_or_any_parents(path.as_std_path(), false)
                    .is_ignore()
                {
                    continue;
                }
            }
            let repo_relative = path.strip_prefix(repo_root).unwrap_or(relative);
            files.push(repo_relative.to_owned());
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}

fn gitignore_matcher(repo_root: &Utf8Path, package_dir: &Utf8Path) -> Gitignore {
    let mut builder = GitignoreBuilder::new(repo_root);
    builder.add(repo_root.join(".gitignore"));
    if package_dir != repo_root {
        builder.add(package_dir.join(".gitignore"));
    }
    builder.build().unwrap_or_else(|err| {
        debug!("unable to build gitignore matcher: {err}");
        Gitignore::empty()
    })
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use pretty_assertions::assert_eq;

    use super::*;

    fn config(json: &str) -> BuildConfig {
        serde_json::from_str(json).expect("valid test config")
    }

    fn temp_repo() -> Result<(tempfile::TempDir, Utf8PathBuf)> {
        let tmp = tempfile::tempdir()?;
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
        Ok((tmp, root))
    }

    #[test]
    fn test_declarative_lookup_by_executable() {
        let config = config(
            r#"{"declarativeTasks": {
                "biome": {"inputGlobs": ["src/**"], "outputGlobs": []}
            }}"#,
        );
        let spec = resolve_task_inputs(
            "biome check .",
            Utf8Path::new("/repo/pkg"),
            Utf8Path::new("/repo"),
            &config,
        )
        .expect("declarative entry applies");
        assert_eq!(spec.input_globs, ["src/**"]);
        assert!(spec.gitignore_inputs);
        assert!(!spec.gitignore_outputs);
    }

    #[test]
    fn test_multi_command_executable_uses_subcommand_key() {
        let config = config(
            r#"{
                "multiCommandExecutables": ["flub"],
                "declarativeTasks": {
                    "flub check": {"inputGlobs": ["**/*.ts"]},
                    "flub": {"inputGlobs": ["never-used/**"]}
                }
            }"#,
        );
        let spec = resolve_task_inputs(
            "flub check --all",
            Utf8Path::new("/repo/pkg"),
            Utf8Path::new("/repo"),
            &config,
        )
        .expect("subcommand entry applies");
        assert_eq!(spec.input_globs, ["**/*.ts"]);
    }

    #[test]
    fn test_unknown_executable_is_non_incremental() {
        let config = BuildConfig::default();
        assert!(resolve_task_inputs(
            "some-custom-tool --flag",
            Utf8Path::new("/repo/pkg"),
            Utf8Path::new("/repo"),
            &config,
        )
        .is_none());
    }

    #[test]
    fn test_repo_root_substitution() {
        let config = config(
            r#"{"declarativeTasks": {
                "lint": {"inputGlobs": ["${repoRoot}/eslint.config.js", "src/**"]}
            }}"#,
        );
        let spec = resolve_task_inputs(
            "lint",
            Utf8Path::new("/repo/pkg"),
            Utf8Path::new("/repo/"),
            &config,
        )
        .unwrap();
        assert_eq!(spec.input_globs, ["/repo/eslint.config.js", "src/**"]);
    }

    #[test]
    fn test_tsc_contributes_tsconfig_chain() -> Result<()> {
        let (_tmp, root) = temp_repo()?;
        let pkg = root.join("pkg");
        std::fs::create_dir_all(&pkg)?;
        std::fs::write(
            pkg.join("tsconfig.json"),
            r#"{"extends": "./tsconfig.base.json", "include": ["src/**/*.ts"]}"#,
        )?;
        std::fs::write(
            pkg.join("tsconfig.base.json"),
            r#"{"compilerOptions": {"strict": true, "outDir": "dist"}}"#,
        )?;

        let spec = resolve_task_inputs("tsc", &pkg, &root, &BuildConfig::default())
            .expect("tsc has native support");
        assert!(spec.input_globs.contains(&"tsconfig.json".to_string()));
        assert!(spec.input_globs.contains(&"tsconfig.base.json".to_string()));
        assert!(spec.input_globs.contains(&"src/**/*.ts".to_string()));
        let extra = spec.extra_state.expect("compiler options captured");
        assert!(extra.contains("outDir"));
        Ok(())
    }

    #[test]
    fn test_expand_respects_gitignore_for_inputs_only() -> Result<()> {
        let (_tmp, root) = temp_repo()?;
        let pkg = root.join("pkg");
        std::fs::create_dir_all(pkg.join("src"))?;
        std::fs::create_dir_all(pkg.join("dist"))?;
        std::fs::write(root.join(".gitignore"), "dist/\n")?;
        std::fs::write(pkg.join("src/index.ts"), "export {}")?;
        std::fs::write(pkg.join("dist/index.js"), "generated")?;

        let spec = TaskInputSpec {
            input_globs: vec!["src/**".to_string(), "dist/**".to_string()],
            gitignore_inputs: true,
            ..Default::default()
        };
        let files = expand_input_files(&spec, &pkg, &root)?;
        assert_eq!(files, [Utf8PathBuf::from("pkg/src/index.ts")]);

        let unfiltered = TaskInputSpec {
            gitignore_inputs: false,
            ..spec
        };
        let files = expand_input_files(&unfiltered, &pkg, &root)?;
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn test_output_expansion_keeps_gitignored_artifacts_by_default() -> Result<()> {
        let (_tmp, root) = temp_repo()?;
        let pkg = root.join("pkg");
        std::fs::create_dir_all(pkg.join("dist"))?;
        std::fs::write(root.join(".gitignore"), "dist/\n")?;
        std::fs::write(pkg.join("dist/index.js"), "generated")?;

        // Default gitignore setting filters inputs only: the gitignored
        // build artifact still shows up as an output.
        let spec = TaskInputSpec {
            output_globs: vec!["dist/**".to_string()],
            gitignore_inputs: true,
            gitignore_outputs: false,
            ..Default::default()
        };
        let outputs = expand_output_files(&spec, &pkg, &root)?;
        assert_eq!(outputs, [Utf8PathBuf::from("pkg/dist/index.js")]);

        // An explicit `{output}` member filters them away.
        let filtered = TaskInputSpec {
            gitignore_outputs: true,
            ..spec
        };
        let outputs = expand_output_files(&filtered, &pkg, &root)?;
        assert!(outputs.is_empty());
        Ok(())
    }

    #[test]
    fn test_expanded_files_are_sorted_and_repo_relative() -> Result<()> {
        let (_tmp, root) = temp_repo()?;
        let pkg = root.join("pkg");
        std::fs::create_dir_all(pkg.join("src"))?;
        std::fs::write(pkg.join("src/b.ts"), "b")?;
        std::fs::write(pkg.join("src/a.ts"), "a")?;

        let spec = TaskInputSpec {
            input_globs: vec!["src/**/*.ts".to_string()],
            ..Default::default()
        };
        let files = expand_input_files(&spec, &pkg, &root)?;
        assert_eq!(
            files,
            [
                Utf8PathBuf::from("pkg/src/a.ts"),
                Utf8PathBuf::from("pkg/src/b.ts")
            ]
        );
        Ok(())
    }
}
