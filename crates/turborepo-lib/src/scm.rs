//! Version control collaborator.
//!
//! The core only consumes two facts from the VCS: which files are tracked
//! (the default input set for tasks) and which files changed since a ref
//! (the `[ref]` filter selectors). When the workspace is not a git repo we
//! degrade to a filesystem walk for tracked files and report "unknown" for
//! change detection, which callers treat as everything-changed.

use std::{collections::HashSet, process::Command};

use tracing::debug;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("git error: {0}")]
    Git(String),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error(transparent)]
    Walk(#[from] turborepo_globwalk::WalkError),
    #[error("unable to run git: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub enum SCM {
    Git(Git),
    /// Fallback when the workspace isn't under version control.
    Manual,
}

#[derive(Debug)]
pub struct Git {
    root: AbsoluteSystemPathBuf,
}

impl SCM {
    pub fn new(repo_root: &AbsoluteSystemPath) -> SCM {
        if repo_root.join_component(".git").exists() {
            SCM::Git(Git {
                root: repo_root.to_owned(),
            })
        } else {
            debug!("{repo_root} is not a git repository, using file walks");
            SCM::Manual
        }
    }

    /// Files tracked under `package_path`, anchored to the package.
    pub fn tracked_files(
        &self,
        repo_root: &AbsoluteSystemPath,
        package_path: &AnchoredSystemPath,
    ) -> Result<Vec<AnchoredSystemPathBuf>, Error> {
        match self {
            SCM::Git(git) => git.tracked_files(package_path),
            SCM::Manual => manual_file_walk(repo_root, package_path),
        }
    }

    /// Repo-anchored files changed between `from_ref` and the working
    /// tree (including untracked files). `None` means change information
    /// is unavailable and callers should assume everything changed.
    pub fn changed_files(
        &self,
        from_ref: &str,
        to_ref: Option<&str>,
    ) -> Result<Option<HashSet<AnchoredSystemPathBuf>>, Error> {
        match self {
            SCM::Git(git) => git.changed_files(from_ref, to_ref).map(Some),
            SCM::Manual => Ok(None),
        }
    }
}

impl Git {
    fn execute(&self, args: &[&str]) -> Result<String, Error> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.root.as_std_path())
            .output()?;
        if !output.status.success() {
            return Err(Error::Git(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn tracked_files(
        &self,
        package_path: &AnchoredSystemPath,
    ) -> Result<Vec<AnchoredSystemPathBuf>, Error> {
        let package_dir = self.root.resolve(package_path);
        let output = self.execute(&["-C", package_dir.as_str(), "ls-files"])?;
        let mut files = output
            .lines()
            .filter(|line| !line.is_empty())
            .map(AnchoredSystemPathBuf::from_raw)
            .collect::<Result<Vec<_>, _>>()?;
        files.sort();
        Ok(files)
    }

    fn changed_files(
        &self,
        from_ref: &str,
        to_ref: Option<&str>,
    ) -> Result<HashSet<AnchoredSystemPathBuf>, Error> {
        let range = match to_ref {
            Some(to_ref) => format!("{from_ref}...{to_ref}"),
            None => from_ref.to_string(),
        };
        let mut changed = HashSet::new();

        let diffed = self.execute(&["diff", "--name-only", &range])?;
        for line in diffed.lines().filter(|line| !line.is_empty()) {
            changed.insert(AnchoredSystemPathBuf::from_raw(line)?);
        }

        // Untracked files count as changes to the working tree.
        let untracked = self.execute(&["ls-files", "--others", "--exclude-standard"])?;
        for line in untracked.lines().filter(|line| !line.is_empty()) {
            changed.insert(AnchoredSystemPathBuf::from_raw(line)?);
        }

        Ok(changed)
    }
}

/// The no-VCS fallback: every file under the package except dependency
/// and cache directories counts as tracked.
fn manual_file_walk(
    repo_root: &AbsoluteSystemPath,
    package_path: &AnchoredSystemPath,
) -> Result<Vec<AnchoredSystemPathBuf>, Error> {
    let package_dir = repo_root.resolve(package_path);
    let files = turborepo_globwalk::globwalk(
        &package_dir,
        &[],
        &[
            "node_modules".to_string(),
            ".git".to_string(),
            ".turbo".to_string(),
        ],
        turborepo_globwalk::WalkType::Files,
    )?;
    let mut anchored = files
        .into_iter()
        .map(|file| package_dir.anchor(&file))
        .collect::<Result<Vec<_>, _>>()?;
    anchored.sort();
    Ok(anchored)
}

#[cfg(test)]
mod test {
    use anyhow::Result;

    use super::*;

    #[test]
    fn test_manual_walk_skips_dependency_dirs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        for file in ["src/index.ts", "package.json", "node_modules/dep/index.js"] {
            let path = root.join_components(&file.split('/').collect::<Vec<_>>());
            path.ensure_dir()?;
            path.create_with_contents("x")?;
        }

        let scm = SCM::new(&root);
        assert!(matches!(scm, SCM::Manual));

        let files = scm.tracked_files(&root, AnchoredSystemPath::empty())?;
        let names: Vec<_> = files.iter().map(|f| f.to_unix().as_str().to_string()).collect();
        assert_eq!(names, vec!["package.json", "src/index.ts"]);
        Ok(())
    }

    #[test]
    fn test_manual_changed_files_is_unknown() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let scm = SCM::new(&root);
        assert!(scm.changed_files("HEAD", None)?.is_none());
        Ok(())
    }
}
