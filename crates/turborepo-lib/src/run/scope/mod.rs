mod change_detector;
mod filter;
mod simple_glob;
mod target_selector;

use std::collections::HashSet;

pub use change_detector::{GitChangeDetector, ScopeChangeDetector};
pub use filter::{FilterResolver, ResolutionError};
pub use target_selector::{InvalidSelectorError, TargetSelector};
use turbopath::AbsoluteSystemPath;

use crate::{
    opts::ScopeOpts,
    package_graph::{PackageGraph, PackageName},
    scm::SCM,
};

/// Resolves the user's `--filter` selectors into the package set fed to
/// the engine builder. The boolean is true when no filtering was applied
/// (which also pulls root tasks into consideration).
pub fn resolve_packages(
    opts: &ScopeOpts,
    turbo_root: &AbsoluteSystemPath,
    pkg_graph: &PackageGraph,
    scm: &SCM,
) -> Result<(HashSet<PackageName>, bool), ResolutionError> {
    let change_detector = ScopeChangeDetector::new(scm, pkg_graph);
    FilterResolver::new(pkg_graph, turbo_root, change_detector)
        .resolve(&opts.filter_patterns)
}
