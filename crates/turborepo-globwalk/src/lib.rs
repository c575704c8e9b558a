//! Recursive glob walking with doublestar semantics.
//!
//! `**` spans any number of directory segments, `*` matches within one
//! segment, and exclusions always win over inclusions. Patterns are
//! matched against `/`-delimited paths on every platform, so a glob list
//! behaves identically on unix and Windows.

use std::{collections::HashSet, io::ErrorKind};

use itertools::Itertools;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, PathError};
use wax::{Any, Glob, Pattern};

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum WalkType {
    Files,
    Folders,
    All,
}

impl WalkType {
    fn should_emit(&self, is_dir: bool) -> bool {
        match self {
            WalkType::Files => !is_dir,
            WalkType::Folders => is_dir,
            WalkType::All => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    // note: wax 0.5 has a lifetime in the BuildError, so we stringify it
    #[error("bad pattern {0}: {1}")]
    BadPattern(String, String),
    #[error("invalid path")]
    InvalidPath,
    #[error("walk error: {0}")]
    WalkError(#[from] walkdir::Error),
    #[error(transparent)]
    Path(#[from] PathError),
}

fn join_unix_like_paths(a: &str, b: &str) -> String {
    [a.trim_end_matches('/'), "/", b.trim_start_matches('/')].concat()
}

fn glob_with_contextual_error(raw: &str) -> Result<Glob<'static>, WalkError> {
    Glob::new(raw)
        .map(|g| g.into_owned())
        .map_err(|e| WalkError::BadPattern(raw.to_string(), e.to_string()))
}

fn any_with_contextual_error(
    precompiled: Vec<Glob<'static>>,
    text: &[String],
) -> Result<Any<'static>, WalkError> {
    wax::any::<Glob, _>(precompiled).map_err(|e| {
        let text = text.iter().join(",");
        WalkError::BadPattern(text, e.to_string())
    })
}

/// Prepends the base path to each glob and canonicalizes exclusions: an
/// exclusion of a directory excludes everything beneath it, matching the
/// behavior scripts rely on from doublestar/globby.
fn preprocess_paths_and_globs(
    base_path: &AbsoluteSystemPath,
    include: &[String],
    exclude: &[String],
) -> Result<(Vec<String>, Vec<String>), WalkError> {
    #[cfg(windows)]
    let base_path_slash = base_path.as_str().replace('\\', "/");
    #[cfg(not(windows))]
    let base_path_slash = base_path.as_str().to_string();

    let include_paths = include
        .iter()
        .map(|s| join_unix_like_paths(&base_path_slash, s))
        .collect::<Vec<_>>();

    let mut exclude_paths = Vec::new();
    for split in exclude
        .iter()
        .map(|s| join_unix_like_paths(&base_path_slash, s))
    {
        // if the glob ends with a slash we need to add a double star,
        // unless it already ends with one
        if let Some(stripped) = split.strip_suffix('/') {
            if stripped.ends_with("/**") {
                exclude_paths.push(stripped.to_string());
            } else {
                exclude_paths.push(format!("{split}**"));
            }
        } else if split.ends_with("/**") {
            exclude_paths.push(split);
        } else {
            // an exclusion without a trailing glob excludes both the entry
            // itself and anything beneath it
            exclude_paths.push(format!("{split}/**"));
            exclude_paths.push(split);
        }
    }

    Ok((include_paths, exclude_paths))
}

/// Walks `base_path`, yielding paths matched by `include` (all paths when
/// `include` is empty) and not matched by `exclude`.
pub fn globwalk(
    base_path: &AbsoluteSystemPath,
    include: &[String],
    exclude: &[String],
    walk_type: WalkType,
) -> Result<HashSet<AbsoluteSystemPathBuf>, WalkError> {
    let (include_paths, exclude_paths) =
        preprocess_paths_and_globs(base_path, include, exclude)?;

    let include_patterns = include_paths
        .iter()
        .map(|s| glob_with_contextual_error(s))
        .collect::<Result<Vec<_>, _>>()?;
    // An empty include set is "everything under base"; wax's `any` of zero
    // patterns matches nothing, so keep the Option around it.
    let include = if include_patterns.is_empty() {
        None
    } else {
        Some(any_with_contextual_error(include_patterns, &include_paths)?)
    };

    let exclude_patterns = exclude_paths
        .iter()
        .map(|s| glob_with_contextual_error(s))
        .collect::<Result<Vec<_>, _>>()?;
    let exclude = any_with_contextual_error(exclude_patterns, &exclude_paths)?;

    let walker = walkdir::WalkDir::new(base_path.as_std_path()).follow_links(false);
    let mut iter = walker.into_iter();
    let mut result = HashSet::new();

    loop {
        let Some(entry) = iter.next() else {
            break;
        };

        let (is_symlink, path) = match entry {
            Ok(entry) => (entry.path_is_symlink(), entry.into_path()),
            Err(err) => match (err.io_error(), err.path()) {
                (Some(io_err), Some(path)) if io_err.kind() == ErrorKind::NotFound => {
                    // yield broken symlinks; skip entries that vanished
                    // between listing and stat (concurrent writers)
                    if path.is_symlink() {
                        (true, path.to_owned())
                    } else {
                        continue;
                    }
                }
                _ => return Err(err.into()),
            },
        };

        let is_directory = !is_symlink && path.is_dir();

        let slash_path = path
            .to_str()
            .ok_or(WalkError::InvalidPath)?
            .to_string();
        #[cfg(windows)]
        let slash_path = slash_path.replace('\\', "/");

        if exclude.is_match(std::path::Path::new(slash_path.as_str())) {
            // no need to descend into an excluded directory
            if is_directory {
                iter.skip_current_dir();
            }
            continue;
        }

        let included = match &include {
            None => true,
            Some(any) => any.is_match(std::path::Path::new(slash_path.as_str())),
        };

        if included && walk_type.should_emit(is_directory) {
            result.insert(AbsoluteSystemPathBuf::try_from(path.as_path())?);
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use test_case::test_case;

    use super::*;

    fn setup() -> Result<(tempfile::TempDir, AbsoluteSystemPathBuf)> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        for file in [
            "package.json",
            "dist/index.js",
            "dist/assets/logo.svg",
            "dist/cache/tmp.js",
            "src/index.ts",
            "src/lib/util.ts",
        ] {
            let path = root.join_components(&file.split('/').collect::<Vec<_>>());
            path.ensure_dir()?;
            path.create_with_contents("content")?;
        }
        Ok((dir, root))
    }

    fn names(root: &AbsoluteSystemPath, paths: &HashSet<AbsoluteSystemPathBuf>) -> Vec<String> {
        let mut names: Vec<_> = paths
            .iter()
            .map(|p| root.anchor(p).unwrap().to_unix().as_str().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_doublestar_spans_directories() -> Result<()> {
        let (_dir, root) = setup()?;
        let found = globwalk(&root, &["dist/**".to_string()], &[], WalkType::Files)?;
        assert_eq!(
            names(&root, &found),
            vec!["dist/assets/logo.svg", "dist/cache/tmp.js", "dist/index.js"]
        );
        Ok(())
    }

    #[test]
    fn test_negation_excludes_subpath_of_positive() -> Result<()> {
        let (_dir, root) = setup()?;
        let found = globwalk(
            &root,
            &["dist/**".to_string()],
            &["dist/cache".to_string()],
            WalkType::Files,
        )?;
        assert_eq!(
            names(&root, &found),
            vec!["dist/assets/logo.svg", "dist/index.js"]
        );
        Ok(())
    }

    #[test]
    fn test_empty_include_matches_everything() -> Result<()> {
        let (_dir, root) = setup()?;
        let found = globwalk(&root, &[], &[], WalkType::Files)?;
        assert_eq!(found.len(), 6);
        Ok(())
    }

    #[test_case("*.json", &["package.json"] ; "star stays within one segment")]
    #[test_case("src/*/util.ts", &["src/lib/util.ts"] ; "star as a middle segment")]
    fn test_single_star(pattern: &str, expected: &[&str]) {
        let (_dir, root) = setup().unwrap();
        let found = globwalk(&root, &[pattern.to_string()], &[], WalkType::Files).unwrap();
        assert_eq!(names(&root, &found), expected);
    }

    #[test]
    fn test_bad_pattern() {
        let (_dir, root) = setup().unwrap();
        let err = globwalk(&root, &["dist/[".to_string()], &[], WalkType::Files);
        assert!(matches!(err, Err(WalkError::BadPattern(_, _))));
    }

    #[test]
    fn test_folders_walk_type() -> Result<()> {
        let (_dir, root) = setup()?;
        let found = globwalk(&root, &["dist/*".to_string()], &[], WalkType::All)?;
        let found_names = names(&root, &found);
        assert!(found_names.contains(&"dist/assets".to_string()));
        assert!(found_names.contains(&"dist/index.js".to_string()));
        Ok(())
    }
}
