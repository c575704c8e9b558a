use std::{collections::HashSet, str::FromStr};

use tracing::debug;
use turbopath::AbsoluteSystemPath;

use super::{
    change_detector::GitChangeDetector,
    simple_glob::{Match, SimpleGlob},
    target_selector::{InvalidSelectorError, TargetSelector},
};
use crate::package_graph::{PackageGraph, PackageName, PackageNode};

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error(transparent)]
    InvalidSelector(#[from] InvalidSelectorError),
    #[error("invalid name pattern: {0}")]
    NamePattern(#[from] regex::Error),
    #[error(transparent)]
    Scm(#[from] crate::scm::Error),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
}

pub struct FilterResolver<'a, T: GitChangeDetector> {
    pkg_graph: &'a PackageGraph,
    turbo_root: &'a AbsoluteSystemPath,
    change_detector: T,
}

impl<'a, T: GitChangeDetector> FilterResolver<'a, T> {
    pub fn new(
        pkg_graph: &'a PackageGraph,
        turbo_root: &'a AbsoluteSystemPath,
        change_detector: T,
    ) -> Self {
        Self {
            pkg_graph,
            turbo_root,
            change_detector,
        }
    }

    /// Resolves a set of filter patterns into a set of packages. The
    /// result is guaranteed to be a subset of the packages in the
    /// workspace. An empty pattern list selects every package (the
    /// returned flag reports that case).
    pub fn resolve(
        &self,
        patterns: &[String],
    ) -> Result<(HashSet<PackageName>, bool), ResolutionError> {
        let is_all_packages = patterns.is_empty();
        let packages = if is_all_packages {
            self.pkg_graph
                .packages()
                .filter(|(name, _)| matches!(name, PackageName::Other(_)))
                .map(|(name, _)| name.to_owned())
                .collect()
        } else {
            self.get_packages_from_patterns(patterns)?
        };

        Ok((packages, is_all_packages))
    }

    fn get_packages_from_patterns(
        &self,
        patterns: &[String],
    ) -> Result<HashSet<PackageName>, ResolutionError> {
        let selectors = patterns
            .iter()
            .map(|pattern| TargetSelector::from_str(pattern))
            .collect::<Result<Vec<_>, _>>()?;

        let (include_selectors, exclude_selectors): (Vec<_>, Vec<_>) =
            selectors.into_iter().partition(|selector| !selector.exclude);

        let mut include = if include_selectors.is_empty() {
            // an exclusion-only filter starts from everything
            self.pkg_graph
                .packages()
                .filter(|(name, _)| !matches!(name, PackageName::Root))
                .map(|(name, _)| name.to_owned())
                .collect()
        } else {
            self.filter_graph_with_selectors(&include_selectors)?
        };

        let exclude = self.filter_graph_with_selectors(&exclude_selectors)?;
        include.retain(|package| !exclude.contains(package));

        Ok(include)
    }

    fn filter_graph_with_selectors(
        &self,
        selectors: &[TargetSelector],
    ) -> Result<HashSet<PackageName>, ResolutionError> {
        let mut result = HashSet::new();
        for selector in selectors {
            result.extend(self.filter_graph_with_selector(selector)?);
        }
        Ok(result)
    }

    /// Applies one selector: match by name/path/change-set, then widen
    /// with the dependency/dependent closures the selector asks for.
    fn filter_graph_with_selector(
        &self,
        selector: &TargetSelector,
    ) -> Result<HashSet<PackageName>, ResolutionError> {
        let matched = self.match_packages(selector)?;
        debug!("selector {:?} matched {:?}", selector.raw, matched);

        let mut result = HashSet::new();

        for package in &matched {
            let node = PackageNode::Workspace(package.clone());

            if !selector.exclude_self {
                result.insert(package.clone());
            }

            if selector.include_dependencies {
                result.extend(
                    self.pkg_graph
                        .dependencies(&node)
                        .into_iter()
                        .filter(|node| !matches!(node, PackageNode::Root))
                        .map(|node| node.as_package_name().clone())
                        .filter(|name| !matches!(name, PackageName::Root)),
                );
            }

            if selector.include_dependents {
                result.extend(
                    self.pkg_graph
                        .ancestors(&node)
                        .into_iter()
                        .filter(|node| !matches!(node, PackageNode::Root))
                        .map(|node| node.as_package_name().clone())
                        .filter(|name| !matches!(name, PackageName::Root)),
                );
            }
        }

        Ok(result)
    }

    /// The base package set for a selector, before closure expansion:
    /// name glob ∩ directory restriction ∩ change set.
    fn match_packages(
        &self,
        selector: &TargetSelector,
    ) -> Result<HashSet<PackageName>, ResolutionError> {
        let name_matcher = if selector.name_pattern.is_empty() {
            None
        } else {
            Some(SimpleGlob::new(&selector.name_pattern)?)
        };

        let changed_packages = selector
            .git_range
            .as_ref()
            .map(|range| {
                self.change_detector
                    .changed_packages(&range.from_ref, range.to_ref.as_deref())
            })
            .transpose()?;

        let mut matched = HashSet::new();
        for (name, info) in self.pkg_graph.packages() {
            if matches!(name, PackageName::Root) {
                continue;
            }

            if let Some(matcher) = &name_matcher {
                if !matcher.is_match(name.as_str()) {
                    continue;
                }
            }

            if let Some(parent_dir) = &selector.parent_dir {
                let package_dir = self.turbo_root.resolve(&info.package_path);
                let parent_globs = [parent_dir.to_unix().as_str().to_string()];
                let matches_dir = {
                    // `{dir}` matches the package root itself or any glob
                    // expansion of it
                    let restriction = self.turbo_root.resolve(parent_dir);
                    restriction.contains(&package_dir)
                        || turborepo_globwalk::globwalk(
                            self.turbo_root,
                            &parent_globs,
                            &[],
                            turborepo_globwalk::WalkType::All,
                        )
                        .map(|found| found.contains(&package_dir))
                        .unwrap_or(false)
                };
                if !matches_dir {
                    continue;
                }
            }

            if let Some(changed) = &changed_packages {
                if !changed.contains(name) {
                    continue;
                }
            }

            matched.insert(name.clone());
        }

        Ok(matched)
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use turbopath::{AbsoluteSystemPathBuf, AnchoredSystemPathBuf};

    use super::*;
    use crate::package_graph::PackageJson;

    struct FixedChanges(HashSet<PackageName>);

    impl GitChangeDetector for FixedChanges {
        fn changed_packages(
            &self,
            _from_ref: &str,
            _to_ref: Option<&str>,
        ) -> Result<HashSet<PackageName>, ResolutionError> {
            Ok(self.0.clone())
        }
    }

    fn package_json(name: &str, deps: &[&str]) -> PackageJson {
        PackageJson {
            name: Some(name.to_string()),
            dependencies: deps
                .iter()
                .map(|dep| (dep.to_string(), "workspace:*".to_string()))
                .collect(),
            ..Default::default()
        }
    }

    /// app-a -> lib-b -> lib-c, docs stands alone
    fn test_graph() -> PackageGraph {
        PackageGraph::builder(PackageJson::default())
            .with_package(
                "app-a",
                AnchoredSystemPathBuf::from_raw("apps/app-a").unwrap(),
                package_json("app-a", &["lib-b"]),
                None,
            )
            .with_package(
                "lib-b",
                AnchoredSystemPathBuf::from_raw("packages/lib-b").unwrap(),
                package_json("lib-b", &["lib-c"]),
                None,
            )
            .with_package(
                "lib-c",
                AnchoredSystemPathBuf::from_raw("packages/lib-c").unwrap(),
                package_json("lib-c", &[]),
                None,
            )
            .with_package(
                "docs",
                AnchoredSystemPathBuf::from_raw("apps/docs").unwrap(),
                package_json("docs", &[]),
                None,
            )
            .build()
            .unwrap()
    }

    fn resolve(patterns: &[&str], changes: &[&str]) -> HashSet<PackageName> {
        let graph = test_graph();
        let root = AbsoluteSystemPathBuf::new(if cfg!(windows) {
            r"C:\repo"
        } else {
            "/repo"
        })
        .unwrap();
        let changes = FixedChanges(changes.iter().map(|name| PackageName::from(*name)).collect());
        let resolver = FilterResolver::new(&graph, &root, changes);
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        resolver.resolve(&patterns).unwrap().0
    }

    fn names(packages: &[&str]) -> HashSet<PackageName> {
        packages.iter().map(|name| PackageName::from(*name)).collect()
    }

    #[test]
    fn test_empty_selects_everything() {
        assert_eq!(
            resolve(&[], &[]),
            names(&["app-a", "lib-b", "lib-c", "docs"])
        );
    }

    #[test]
    fn test_by_name() {
        assert_eq!(resolve(&["app-a"], &[]), names(&["app-a"]));
    }

    #[test]
    fn test_name_glob() {
        assert_eq!(resolve(&["lib-*"], &[]), names(&["lib-b", "lib-c"]));
    }

    #[test]
    fn test_exclusion() {
        assert_eq!(
            resolve(&["!lib-b"], &[]),
            names(&["app-a", "lib-c", "docs"])
        );
    }

    #[test]
    fn test_dependencies() {
        assert_eq!(
            resolve(&["app-a..."], &[]),
            names(&["app-a", "lib-b", "lib-c"])
        );
        assert_eq!(resolve(&["app-a^..."], &[]), names(&["lib-b", "lib-c"]));
    }

    #[test]
    fn test_dependents() {
        assert_eq!(
            resolve(&["...lib-c"], &[]),
            names(&["lib-c", "lib-b", "app-a"])
        );
        assert_eq!(resolve(&["...^lib-c"], &[]), names(&["lib-b", "app-a"]));
    }

    #[test]
    fn test_directory() {
        assert_eq!(resolve(&["{apps/docs}"], &[]), names(&["docs"]));
    }

    #[test]
    fn test_changed_packages() {
        assert_eq!(resolve(&["[main]"], &["lib-b"]), names(&["lib-b"]));
        assert_eq!(
            resolve(&["...[main]"], &["lib-c"]),
            names(&["lib-c", "lib-b", "app-a"])
        );
    }

    #[test]
    fn test_compose_include_and_exclude() {
        assert_eq!(
            resolve(&["lib-*", "!lib-c"], &[]),
            names(&["lib-b"])
        );
    }
}
