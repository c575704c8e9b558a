use std::collections::HashSet;

use crate::{
    package_graph::{PackageGraph, PackageName},
    scm::SCM,
};

/// Maps a git range to the set of packages containing at least one
/// changed file. Behind a trait so the filter engine can be exercised
/// without a git repository.
pub trait GitChangeDetector {
    fn changed_packages(
        &self,
        from_ref: &str,
        to_ref: Option<&str>,
    ) -> Result<HashSet<PackageName>, super::ResolutionError>;
}

pub struct ScopeChangeDetector<'a> {
    scm: &'a SCM,
    pkg_graph: &'a PackageGraph,
}

impl<'a> ScopeChangeDetector<'a> {
    pub fn new(scm: &'a SCM, pkg_graph: &'a PackageGraph) -> Self {
        Self { scm, pkg_graph }
    }
}

impl GitChangeDetector for ScopeChangeDetector<'_> {
    fn changed_packages(
        &self,
        from_ref: &str,
        to_ref: Option<&str>,
    ) -> Result<HashSet<PackageName>, super::ResolutionError> {
        let Some(changed_files) = self.scm.changed_files(from_ref, to_ref)? else {
            // Change information is unavailable; assume everything changed.
            return Ok(self
                .pkg_graph
                .packages()
                .filter(|(name, _)| !matches!(name, PackageName::Root))
                .map(|(name, _)| name.clone())
                .collect());
        };

        // A file belongs to the deepest package whose directory contains
        // it; a change at the repo root belongs to the root package.
        let mut changed_packages = HashSet::new();
        for file in changed_files {
            let mut owner: Option<(&PackageName, usize)> = None;
            for (name, info) in self.pkg_graph.packages() {
                if matches!(name, PackageName::Root) {
                    continue;
                }
                let package_path = info.package_path.as_str();
                if file.as_str().starts_with(package_path)
                    && file
                        .as_str()
                        .as_bytes()
                        .get(package_path.len())
                        .map_or(true, |byte| *byte == std::path::MAIN_SEPARATOR as u8)
                {
                    let depth = package_path.len();
                    if owner.map_or(true, |(_, best)| depth > best) {
                        owner = Some((name, depth));
                    }
                }
            }
            match owner {
                Some((name, _)) => {
                    changed_packages.insert(name.clone());
                }
                None => {
                    changed_packages.insert(PackageName::Root);
                }
            }
        }

        Ok(changed_packages)
    }
}
