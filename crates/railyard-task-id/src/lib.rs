//! Task identifier types shared across the railyard workspace.
//!
//! A `TaskName` is what appears in configuration: either a bare task name
//! (`build`) or a package-qualified one (`pkg-a#build`). A `TaskId` is always
//! package-qualified and identifies a concrete task instance in the build
//! graph.

use std::{borrow::Cow, fmt};

use serde::{Deserialize, Serialize};

pub const TASK_DELIMITER: &str = "#";
pub const ROOT_PKG_NAME: &str = "//";

/// A task identifier in configuration, which may or may not be qualified with
/// a package name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskName<'a> {
    package: Option<Cow<'a, str>>,
    task: Cow<'a, str>,
}

/// A concrete `package#task` pair identifying a task instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId<'a> {
    package: Cow<'a, str>,
    task: Cow<'a, str>,
}

#[derive(Debug, thiserror::Error)]
#[error("'{input}' is not a package task (package#task)")]
pub struct TaskIdError {
    input: String,
}

impl<'a> TaskId<'a> {
    pub fn new(package: &'a str, task: &'a str) -> Self {
        TaskId {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn from_owned(package: String, task: String) -> TaskId<'static> {
        TaskId {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn as_task_name(&self) -> TaskName<'_> {
        TaskName {
            package: Some(self.package.as_ref().into()),
            task: self.task.as_ref().into(),
        }
    }

    /// The unqualified name of this task, e.g. `build` for `pkg-a#build`.
    pub fn as_non_workspace_task_name(&self) -> TaskName<'_> {
        TaskName {
            package: None,
            task: self.task.as_ref().into(),
        }
    }

    pub fn into_owned(self) -> TaskId<'static> {
        let TaskId { package, task } = self;
        TaskId {
            package: package.into_owned().into(),
            task: task.into_owned().into(),
        }
    }
}

impl<'a> TryFrom<&'a str> for TaskId<'a> {
    type Error = TaskIdError;

    fn try_from(input: &'a str) -> Result<Self, Self::Error> {
        match TaskName::from(input).split() {
            (Some(package), task) => Ok(TaskId { package, task }),
            (None, _) => Err(TaskIdError {
                input: input.to_string(),
            }),
        }
    }
}

impl<'a> TaskName<'a> {
    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    pub fn is_package_qualified(&self) -> bool {
        self.package.is_some()
    }

    /// Returns the concrete task id if this name is package qualified.
    pub fn task_id(&self) -> Option<TaskId<'_>> {
        let package: &str = self.package.as_deref()?;
        let task: &str = &self.task;
        Some(TaskId {
            package: package.into(),
            task: task.into(),
        })
    }

    /// Produces the task id this name refers to when used by `package`.
    /// A package-qualified name keeps its own package.
    pub fn task_id_for_package(&self, package: &str) -> TaskId<'static> {
        match self.task_id() {
            Some(task_id) => task_id.into_owned(),
            None => TaskId::from_owned(package.to_string(), self.task.to_string()),
        }
    }

    pub fn into_non_workspace_task(self) -> TaskName<'a> {
        let TaskName { task, .. } = self;
        TaskName {
            package: None,
            task,
        }
    }

    pub fn into_owned(self) -> TaskName<'static> {
        let TaskName { package, task } = self;
        TaskName {
            package: package.map(|p| p.into_owned().into()),
            task: task.into_owned().into(),
        }
    }

    fn split(self) -> (Option<Cow<'a, str>>, Cow<'a, str>) {
        (self.package, self.task)
    }
}

impl<'a> From<&'a str> for TaskName<'a> {
    fn from(input: &'a str) -> Self {
        // A leading delimiter is part of the task name, not a package qualifier.
        match input.split_once(TASK_DELIMITER) {
            Some((package, task)) if !package.is_empty() => TaskName {
                package: Some(package.into()),
                task: task.into(),
            },
            _ => TaskName {
                package: None,
                task: input.into(),
            },
        }
    }
}

impl From<String> for TaskName<'static> {
    fn from(input: String) -> Self {
        TaskName::from(input.as_str()).into_owned()
    }
}

impl fmt::Display for TaskId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.package, TASK_DELIMITER, self.task)
    }
}

impl fmt::Display for TaskName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.package {
            Some(package) => write!(f, "{}{}{}", package, TASK_DELIMITER, self.task),
            None => self.task.fmt(f),
        }
    }
}

impl Serialize for TaskId<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TaskId<'static> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let input = String::deserialize(deserializer)?;
        TaskId::try_from(input.as_str())
            .map(TaskId::into_owned)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("build", None, "build" ; "bare task name")]
    #[test_case("pkg-a#build", Some("pkg-a"), "build" ; "package task")]
    #[test_case("//#build", Some("//"), "build" ; "root task")]
    #[test_case("#build", None, "#build" ; "leading delimiter is not a package")]
    fn test_task_name_parsing(input: &str, package: Option<&str>, task: &str) {
        let name = TaskName::from(input);
        assert_eq!(name.package(), package);
        assert_eq!(name.task(), task);
    }

    #[test]
    fn test_task_id_display_roundtrip() {
        let id = TaskId::new("pkg-a", "build");
        assert_eq!(id.to_string(), "pkg-a#build");
        let parsed = TaskId::try_from("pkg-a#build").unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_task_id_for_package() {
        let bare = TaskName::from("build");
        assert_eq!(bare.task_id_for_package("pkg-a"), TaskId::new("pkg-a", "build"));

        let qualified = TaskName::from("pkg-b#lint");
        assert_eq!(
            qualified.task_id_for_package("pkg-a"),
            TaskId::new("pkg-b", "lint")
        );
    }

    #[test]
    fn test_bare_name_has_no_task_id() {
        assert!(TaskName::from("build").task_id().is_none());
        assert!(TaskId::try_from("build").is_err());
    }
}
