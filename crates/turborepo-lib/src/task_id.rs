use std::{borrow::Cow, fmt};

use serde::{Deserialize, Serialize};

pub const TASK_DELIMITER: &str = "#";
pub const ROOT_PKG_NAME: &str = "//";

/// A task identifier with the package fully resolved: `package#task`.
/// Unique within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId<'a> {
    package: Cow<'a, str>,
    task: Cow<'a, str>,
}

/// A task name as written in configuration. May be qualified with a
/// package (`web#build`) or apply to every package that defines the
/// script (`build`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskName<'a> {
    package: Option<Cow<'a, str>>,
    task: Cow<'a, str>,
}

#[derive(Debug, thiserror::Error)]
#[error("'{input}' is not a task id: expected the form package{TASK_DELIMITER}task")]
pub struct TaskIdError {
    input: String,
}

impl<'a> TaskId<'a> {
    pub fn new(package: &'a str, task: &'a str) -> Self {
        debug_assert!(!task.contains(TASK_DELIMITER), "task contains delimiter");
        Self {
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

    pub fn in_workspace(&self, workspace: &str) -> bool {
        self.package == workspace
    }

    pub fn into_owned(self) -> TaskId<'static> {
        let TaskId { package, task } = self;
        TaskId {
            package: package.into_owned().into(),
            task: task.into_owned().into(),
        }
    }

    pub fn as_task_name(&self) -> TaskName<'_> {
        TaskName {
            package: None,
            task: self.task.as_ref().into(),
        }
    }
}

impl<'a> TryFrom<&'a str> for TaskId<'a> {
    type Error = TaskIdError;

    fn try_from(input: &'a str) -> Result<Self, Self::Error> {
        match input.split_once(TASK_DELIMITER) {
            Some((package, task)) if !package.is_empty() => Ok(TaskId {
                package: package.into(),
                task: task.into(),
            }),
            _ => Err(TaskIdError {
                input: input.to_string(),
            }),
        }
    }
}

impl fmt::Display for TaskId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{TASK_DELIMITER}{}", self.package, self.task)
    }
}

impl Serialize for TaskId<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'a> TaskName<'a> {
    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn is_package_task(&self) -> bool {
        self.package.is_some()
    }

    /// The fully-qualified id, when this name pins a package.
    pub fn task_id(&self) -> Option<TaskId<'_>> {
        let package = self.package.as_deref()?;
        Some(TaskId {
            package: package.into(),
            task: self.task.as_ref().into(),
        })
    }

    pub fn into_root_task(self) -> TaskName<'static> {
        TaskName {
            package: Some(ROOT_PKG_NAME.to_string().into()),
            task: self.task.into_owned().into(),
        }
    }

    pub fn into_non_workspace_task(self) -> TaskName<'static> {
        TaskName {
            package: None,
            task: self.task.into_owned().into(),
        }
    }

    pub fn into_owned(self) -> TaskName<'static> {
        let TaskName { package, task } = self;
        TaskName {
            package: package.map(|p| p.into_owned().into()),
            task: task.into_owned().into(),
        }
    }
}

impl<'a> From<&'a str> for TaskName<'a> {
    fn from(input: &'a str) -> Self {
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

impl fmt::Display for TaskName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.package {
            Some(package) => write!(f, "{package}{TASK_DELIMITER}{}", self.task),
            None => write!(f, "{}", self.task),
        }
    }
}

impl Serialize for TaskName<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TaskName<'static> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(TaskName::from(raw))
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test_case("web#build", Some(("web", "build")) ; "qualified")]
    #[test_case("build", None ; "unqualified")]
    #[test_case("#build", None ; "empty package")]
    fn test_task_id_parse(input: &str, expected: Option<(&str, &str)>) {
        let result = TaskId::try_from(input).ok();
        assert_eq!(
            result,
            expected.map(|(package, task)| TaskId::new(package, task))
        );
    }

    #[test]
    fn test_task_name_round_trip() {
        let name = TaskName::from("web#build");
        assert_eq!(name.package(), Some("web"));
        assert_eq!(name.task(), "build");
        assert_eq!(name.to_string(), "web#build");

        let plain = TaskName::from("lint");
        assert_eq!(plain.package(), None);
        assert_eq!(plain.task_id(), None);
        assert_eq!(plain.into_root_task().to_string(), "//#lint");
    }

    #[test]
    fn test_display_is_canonical() {
        let id = TaskId::new("web", "build");
        assert_eq!(id.to_string(), "web#build");
        assert_eq!(TaskId::try_from("web#build").unwrap(), id);
    }
}
