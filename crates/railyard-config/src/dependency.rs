//! Parsing of task dependency strings.
//!
//! Dependency strings take four forms: a bare task name, `^task` (the task in
//! each package the owner depends on), `pkg#task` (a task in a named
//! dependency package), and the wildcards `*` / `^*` which are only legal in
//! `before`/`after` lists.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Error;

/// The unexpanded default marker. Config loading must substitute it before
/// the table reaches the core.
pub(crate) const PLACEHOLDER: &str = "...";

const UPSTREAM_PREFIX: char = '^';
const PACKAGE_DELIMITER: char = '#';
const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DependencySpec {
    /// A task in the same package.
    Task(String),
    /// `^task`: the same-named task in each package the owner depends on.
    Upstream(String),
    /// `pkg#task`: a task in a specific dependency package.
    Package { package: String, task: String },
    /// `*`: every other task in the same package. `before`/`after` only.
    All,
    /// `^*`: every task in each dependency package. `before`/`after` only.
    UpstreamAll,
}

impl DependencySpec {
    pub fn parse(task: &str, entry: &str) -> Result<Self, Error> {
        if entry == PLACEHOLDER {
            return Err(Error::UnexpandedPlaceholder {
                task: task.to_string(),
            });
        }
        if entry == WILDCARD {
            return Ok(DependencySpec::All);
        }
        if let Some(rest) = entry.strip_prefix(UPSTREAM_PREFIX) {
            if rest == WILDCARD {
                return Ok(DependencySpec::UpstreamAll);
            }
            if rest.is_empty() {
                return Err(invalid(task, entry, "missing task name after '^'"));
            }
            return Ok(DependencySpec::Upstream(rest.to_string()));
        }
        if let Some((package, dep_task)) = entry.split_once(PACKAGE_DELIMITER) {
            if package.is_empty() || dep_task.is_empty() {
                return Err(invalid(task, entry, "expected 'package#task'"));
            }
            return Ok(DependencySpec::Package {
                package: package.to_string(),
                task: dep_task.to_string(),
            });
        }
        Ok(DependencySpec::Task(entry.to_string()))
    }

    pub fn parse_all(task: &str, entries: &[String]) -> Result<Vec<Self>, Error> {
        entries
            .iter()
            .map(|entry| DependencySpec::parse(task, entry))
            .collect()
    }

    /// Wildcards never instantiate tasks and are only meaningful once the
    /// reachable task set is frozen.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, DependencySpec::All | DependencySpec::UpstreamAll)
    }
}

fn invalid(task: &str, entry: &str, reason: &str) -> Error {
    Error::InvalidDependency {
        task: task.to_string(),
        entry: entry.to_string(),
        reason: reason.to_string(),
    }
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencySpec::Task(task) => f.write_str(task),
            DependencySpec::Upstream(task) => write!(f, "{UPSTREAM_PREFIX}{task}"),
            DependencySpec::Package { package, task } => {
                write!(f, "{package}{PACKAGE_DELIMITER}{task}")
            }
            DependencySpec::All => f.write_str(WILDCARD),
            DependencySpec::UpstreamAll => write!(f, "{UPSTREAM_PREFIX}{WILDCARD}"),
        }
    }
}

impl Serialize for DependencySpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DependencySpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entry = String::deserialize(deserializer)?;
        DependencySpec::parse("", &entry).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("build", DependencySpec::Task("build".to_string()) ; "bare name")]
    #[test_case("^build", DependencySpec::Upstream("build".to_string()) ; "upstream")]
    #[test_case("pkg-a#lint", DependencySpec::Package { package: "pkg-a".to_string(), task: "lint".to_string() } ; "package task")]
    #[test_case("*", DependencySpec::All ; "wildcard")]
    #[test_case("^*", DependencySpec::UpstreamAll ; "upstream wildcard")]
    fn test_parse(entry: &str, expected: DependencySpec) {
        assert_eq!(DependencySpec::parse("t", entry).unwrap(), expected);
    }

    #[test_case("..." ; "placeholder")]
    #[test_case("^" ; "dangling caret")]
    #[test_case("#build" ; "empty package")]
    #[test_case("pkg#" ; "empty task")]
    fn test_parse_errors(entry: &str) {
        assert!(DependencySpec::parse("t", entry).is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for entry in ["build", "^build", "pkg-a#lint", "*", "^*"] {
            let spec = DependencySpec::parse("t", entry).unwrap();
            assert_eq!(spec.to_string(), entry);
        }
    }
}
