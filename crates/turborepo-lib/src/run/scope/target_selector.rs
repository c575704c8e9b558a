use std::str::FromStr;

use regex::Regex;
use thiserror::Error;
use turbopath::AnchoredSystemPathBuf;

#[derive(Debug, Default, PartialEq)]
pub struct GitRange {
    pub from_ref: String,
    pub to_ref: Option<String>,
}

/// One parsed `--filter` expression. The full grammar composes, in order:
/// exclusion (`!`), dependents (`...name`), a package-name glob, an
/// optional task qualifier (`#task`), a directory restriction (`{dir}`),
/// a git range (`[ref]` / `[from...to]`), and dependencies (`name...`),
/// with `^` on either `...` excluding the named package itself.
#[derive(Debug, Default, PartialEq)]
pub struct TargetSelector {
    pub include_dependencies: bool,
    pub include_dependents: bool,
    pub exclude: bool,
    pub exclude_self: bool,
    pub parent_dir: Option<AnchoredSystemPathBuf>,
    pub name_pattern: String,
    pub git_range: Option<GitRange>,
    pub raw: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum InvalidSelectorError {
    #[error("invalid anchored path: {0}")]
    InvalidAnchoredPath(String),
    #[error("empty path specification")]
    EmptyPathSpecification,
    #[error("invalid git range selector: {0}")]
    InvalidGitRange(String),
    #[error("selector \"{0}\" must have a reference, directory, or name pattern")]
    InvalidSelector(String),
}

impl FromStr for TargetSelector {
    type Err = InvalidSelectorError;

    fn from_str(raw_selector: &str) -> Result<Self, Self::Err> {
        let (exclude, selector) = match raw_selector.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, raw_selector),
        };

        let mut exclude_self = false;

        let (include_dependencies, selector) = match selector.strip_suffix("...") {
            Some(rest) => (
                true,
                match rest.strip_suffix('^') {
                    Some(rest) => {
                        exclude_self = true;
                        rest
                    }
                    None => rest,
                },
            ),
            None => (false, selector),
        };

        let (include_dependents, selector) = match selector.strip_prefix("...") {
            Some(rest) => (
                true,
                match rest.strip_prefix('^') {
                    Some(rest) => {
                        exclude_self = true;
                        rest
                    }
                    None => rest,
                },
            ),
            None => (false, selector),
        };

        // Empty git ranges parse so we can reject them with a targeted
        // error below.
        let re = Regex::new(
            r"^(?P<name>[^.{}\[\]][^{}\[\]]*)?(\{(?P<directory>[^}]*)\})?(?P<commits>\[[^\]]*\])?$",
        )
        .expect("valid regex");

        let Some(captures) = re.captures(selector) else {
            return Err(InvalidSelectorError::InvalidSelector(
                raw_selector.to_string(),
            ));
        };

        let mut name_pattern = captures
            .name("name")
            .map_or(String::new(), |m| m.as_str().to_string());

        // A task qualifier narrows by package; C9's output is a package
        // set, so the task part only disambiguates the name glob.
        if let Some((package, _task)) = name_pattern.split_once('#') {
            name_pattern = package.to_string();
        }

        let mut parent_dir = None;
        if let Some(directory) = captures.name("directory") {
            let directory = directory.as_str().to_string();
            if directory.is_empty() {
                return Err(InvalidSelectorError::EmptyPathSpecification);
            }
            let clean_directory = path_clean::clean(std::path::Path::new(directory.as_str()))
                .into_os_string()
                .into_string()
                .expect("directory was valid utf8 before cleaning");
            parent_dir = Some(
                AnchoredSystemPathBuf::try_from(clean_directory.as_str())
                    .map_err(|_| InvalidSelectorError::InvalidAnchoredPath(directory))?,
            );
        }

        let git_range = if let Some(commits) = captures.name("commits") {
            let commits_str = commits
                .as_str()
                .strip_prefix('[')
                .and_then(|s| s.strip_suffix(']'))
                .expect("regex guarantees square brackets");
            if commits_str.is_empty() {
                return Err(InvalidSelectorError::InvalidGitRange(
                    commits_str.to_string(),
                ));
            }

            let git_range = if let Some((a, b)) = commits_str.split_once("...") {
                if a.is_empty() || b.is_empty() {
                    return Err(InvalidSelectorError::InvalidGitRange(
                        commits_str.to_string(),
                    ));
                }
                GitRange {
                    from_ref: a.to_string(),
                    to_ref: Some(b.to_string()),
                }
            } else {
                GitRange {
                    from_ref: commits_str.to_string(),
                    to_ref: None,
                }
            };
            Some(git_range)
        } else {
            None
        };

        if name_pattern.is_empty() && parent_dir.is_none() && git_range.is_none() {
            return Err(InvalidSelectorError::InvalidSelector(
                raw_selector.to_string(),
            ));
        }

        Ok(TargetSelector {
            git_range,
            exclude,
            exclude_self,
            include_dependencies,
            include_dependents,
            name_pattern,
            parent_dir,
            raw: raw_selector.to_string(),
        })
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use test_case::test_case;
    use turbopath::AnchoredSystemPathBuf;

    use super::*;

    #[test_case("foo", TargetSelector { name_pattern: "foo".to_string(), raw: "foo".to_string(), ..Default::default() }; "name")]
    #[test_case("foo...", TargetSelector { name_pattern: "foo".to_string(), raw: "foo...".to_string(), include_dependencies: true, ..Default::default() }; "dependencies")]
    #[test_case("...foo", TargetSelector { name_pattern: "foo".to_string(), raw: "...foo".to_string(), include_dependents: true, ..Default::default() }; "dependents")]
    #[test_case("...foo...", TargetSelector { name_pattern: "foo".to_string(), raw: "...foo...".to_string(), include_dependents: true, include_dependencies: true, ..Default::default() }; "both directions")]
    #[test_case("foo^...", TargetSelector { name_pattern: "foo".to_string(), raw: "foo^...".to_string(), include_dependencies: true, exclude_self: true, ..Default::default() }; "dependencies excluding self")]
    #[test_case("...^foo", TargetSelector { name_pattern: "foo".to_string(), raw: "...^foo".to_string(), include_dependents: true, exclude_self: true, ..Default::default() }; "dependents excluding self")]
    #[test_case("!foo", TargetSelector { name_pattern: "foo".to_string(), raw: "!foo".to_string(), exclude: true, ..Default::default() }; "exclusion")]
    #[test_case("web#build", TargetSelector { name_pattern: "web".to_string(), raw: "web#build".to_string(), ..Default::default() }; "task qualifier")]
    #[test_case("{packages/libs}", TargetSelector { raw: "{packages/libs}".to_string(), parent_dir: Some(AnchoredSystemPathBuf::from_raw(if cfg!(windows) { r"packages\libs" } else { "packages/libs" }).unwrap()), ..Default::default() }; "directory")]
    #[test_case("[main]", TargetSelector { raw: "[main]".to_string(), git_range: Some(GitRange { from_ref: "main".to_string(), to_ref: None }), ..Default::default() }; "git ref")]
    #[test_case("[from...to]", TargetSelector { raw: "[from...to]".to_string(), git_range: Some(GitRange { from_ref: "from".to_string(), to_ref: Some("to".to_string()) }), ..Default::default() }; "git range")]
    #[test_case("...[main]", TargetSelector { raw: "...[main]".to_string(), git_range: Some(GitRange { from_ref: "main".to_string(), to_ref: None }), include_dependents: true, ..Default::default() }; "changed and dependents")]
    #[test_case("foo{packages/foo}[main]", TargetSelector { raw: "foo{packages/foo}[main]".to_string(), name_pattern: "foo".to_string(), parent_dir: Some(AnchoredSystemPathBuf::from_raw(if cfg!(windows) { r"packages\foo" } else { "packages/foo" }).unwrap()), git_range: Some(GitRange { from_ref: "main".to_string(), to_ref: None }), ..Default::default() }; "all pieces")]
    fn test_parse_target_selector(raw_selector: &str, want: TargetSelector) {
        let result = TargetSelector::from_str(raw_selector).unwrap();
        assert_eq!(result, want);
    }

    #[test_case("{}" ; "empty directory")]
    #[test_case("[]" ; "empty git range")]
    #[test_case("[...some-ref]" ; "missing git range start")]
    #[test_case("[some-ref...]" ; "missing git range end")]
    #[test_case("" ; "empty selector")]
    fn test_parse_target_selector_invalid(raw_selector: &str) {
        assert!(TargetSelector::from_str(raw_selector).is_err());
    }
}
