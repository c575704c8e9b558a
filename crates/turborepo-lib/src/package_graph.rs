//! The workspace model the run engine operates on.
//!
//! Workspace discovery and lockfile parsing are collaborator concerns;
//! this module consumes their results: a set of packages (name, path,
//! manifest) and an external-dependency hash per package. A minimal
//! filesystem discovery based on the root manifest's `workspaces` globs is
//! provided for the CLI; tests assemble graphs directly through the
//! builder.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::prelude::*;
use serde::{Deserialize, Serialize};
use turbopath::{AbsoluteSystemPath, AnchoredSystemPath, AnchoredSystemPathBuf};
use turborepo_graph_utils as graph;
use turborepo_hash::TurboHash;

use crate::{
    hash::{LockFilePackages, Package},
    task_id::ROOT_PKG_NAME,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Graph(#[from] graph::Error),
    #[error(transparent)]
    Walk(#[from] turborepo_globwalk::WalkError),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error("duplicate package name: {0}")]
    DuplicatePackage(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PackageName {
    Root,
    Other(String),
}

impl PackageName {
    pub fn as_str(&self) -> &str {
        match self {
            PackageName::Root => ROOT_PKG_NAME,
            PackageName::Other(name) => name,
        }
    }
}

impl From<&str> for PackageName {
    fn from(value: &str) -> Self {
        if value == ROOT_PKG_NAME {
            PackageName::Root
        } else {
            PackageName::Other(value.to_string())
        }
    }
}

impl From<String> for PackageName {
    fn from(value: String) -> Self {
        if value == ROOT_PKG_NAME {
            PackageName::Root
        } else {
            PackageName::Other(value)
        }
    }
}

impl std::fmt::Display for PackageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PackageName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PackageNode {
    Root,
    Workspace(PackageName),
}

impl PackageNode {
    pub fn as_package_name(&self) -> &PackageName {
        static ROOT: PackageName = PackageName::Root;
        match self {
            PackageNode::Root => &ROOT,
            PackageNode::Workspace(name) => name,
        }
    }
}

impl std::fmt::Display for PackageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageNode::Root => f.write_str("___ROOT___"),
            PackageNode::Workspace(name) => name.fmt(f),
        }
    }
}

/// A parsed package manifest. Only the fields the run engine consumes.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageJson {
    pub name: Option<String>,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub workspaces: Vec<String>,
}

impl PackageJson {
    pub fn load(path: &AbsoluteSystemPath) -> Result<PackageJson, Error> {
        let contents = path.read_to_string().map_err(|source| Error::Io {
            path: path.to_string(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| Error::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn all_dependencies(&self) -> impl Iterator<Item = (&String, &String)> {
        self.dependencies
            .iter()
            .chain(self.dev_dependencies.iter())
    }
}

#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub package_json: PackageJson,
    pub package_path: AnchoredSystemPathBuf,
    /// Hash over the package's external dependency closure, as reported by
    /// the lockfile collaborator.
    pub external_deps_hash: String,
}

#[derive(Debug)]
pub struct PackageGraph {
    graph: Graph<PackageNode, ()>,
    node_lookup: HashMap<PackageNode, NodeIndex>,
    packages: HashMap<PackageName, PackageInfo>,
}

impl PackageGraph {
    pub fn builder(root_package_json: PackageJson) -> PackageGraphBuilder {
        PackageGraphBuilder::new(root_package_json)
    }

    pub fn len(&self) -> usize {
        self.packages
            .keys()
            .filter(|name| !matches!(name, PackageName::Root))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn packages(&self) -> impl Iterator<Item = (&PackageName, &PackageInfo)> {
        self.packages.iter()
    }

    pub fn package_info(&self, name: &PackageName) -> Option<&PackageInfo> {
        self.packages.get(name)
    }

    pub fn package_json(&self, name: &PackageName) -> Option<&PackageJson> {
        self.packages.get(name).map(|info| &info.package_json)
    }

    pub fn package_dir(&self, name: &PackageName) -> Option<&AnchoredSystemPath> {
        self.packages.get(name).map(|info| &*info.package_path)
    }

    pub fn root_external_deps_hash(&self) -> String {
        self.packages
            .get(&PackageName::Root)
            .map(|info| info.external_deps_hash.clone())
            .unwrap_or_default()
    }

    /// Workspace packages this node directly depends on.
    pub fn immediate_dependencies(&self, node: &PackageNode) -> Option<HashSet<&PackageNode>> {
        let index = self.node_lookup.get(node)?;
        Some(
            self.graph
                .neighbors_directed(*index, petgraph::Direction::Outgoing)
                .map(|index| {
                    self.graph
                        .node_weight(index)
                        .expect("node index should be present")
                })
                .collect(),
        )
    }

    /// All packages that transitively depend on this node.
    pub fn ancestors(&self, node: &PackageNode) -> HashSet<&PackageNode> {
        let mut ancestors = self.transitive_closure(node, petgraph::Direction::Incoming);
        ancestors.remove(node);
        ancestors
    }

    /// All packages this node transitively depends on.
    pub fn dependencies(&self, node: &PackageNode) -> HashSet<&PackageNode> {
        let mut dependencies = self.transitive_closure(node, petgraph::Direction::Outgoing);
        dependencies.remove(node);
        dependencies
    }

    fn transitive_closure(
        &self,
        node: &PackageNode,
        direction: petgraph::Direction,
    ) -> HashSet<&PackageNode> {
        let Some(index) = self.node_lookup.get(node) else {
            return HashSet::new();
        };
        graph::transitive_closure(&self.graph, Some(*index), direction)
    }

    pub fn validate(&self) -> Result<(), Error> {
        Ok(graph::validate_graph(&self.graph)?)
    }
}

pub struct PackageGraphBuilder {
    root_package_json: PackageJson,
    root_external_deps_hash: Option<String>,
    packages: Vec<(PackageName, AnchoredSystemPathBuf, PackageJson, Option<String>)>,
}

impl PackageGraphBuilder {
    fn new(root_package_json: PackageJson) -> Self {
        Self {
            root_package_json,
            root_external_deps_hash: None,
            packages: Vec::new(),
        }
    }

    /// Registers a package. `external_deps_hash` comes from the lockfile
    /// collaborator; when absent we fall back to hashing the declared
    /// dependency ranges of the manifest, which is stable and changes
    /// whenever the declared external surface changes.
    pub fn with_package(
        mut self,
        name: impl Into<PackageName>,
        path: AnchoredSystemPathBuf,
        package_json: PackageJson,
        external_deps_hash: Option<String>,
    ) -> Self {
        self.packages
            .push((name.into(), path, package_json, external_deps_hash));
        self
    }

    pub fn with_root_external_deps_hash(mut self, hash: Option<String>) -> Self {
        self.root_external_deps_hash = hash;
        self
    }

    /// Discovers packages on disk from the root manifest's `workspaces`
    /// globs.
    pub fn with_discovery(mut self, repo_root: &AbsoluteSystemPath) -> Result<Self, Error> {
        let patterns: Vec<String> = self
            .root_package_json
            .workspaces
            .iter()
            .map(|glob| format!("{}/package.json", glob.trim_end_matches('/')))
            .collect();
        if patterns.is_empty() {
            return Ok(self);
        }

        let manifests = turborepo_globwalk::globwalk(
            repo_root,
            &patterns,
            &["**/node_modules/**".to_string()],
            turborepo_globwalk::WalkType::Files,
        )?;

        let mut found: Vec<_> = manifests.into_iter().collect();
        found.sort();
        for manifest_path in found {
            let package_json = PackageJson::load(&manifest_path)?;
            let Some(name) = package_json.name.clone() else {
                continue;
            };
            let package_dir = manifest_path
                .parent()
                .expect("manifest has a parent directory");
            let package_path = repo_root.anchor(package_dir)?;
            self.packages
                .push((PackageName::from(name), package_path, package_json, None));
        }
        Ok(self)
    }

    pub fn build(self) -> Result<PackageGraph, Error> {
        let Self {
            root_package_json,
            root_external_deps_hash,
            packages,
        } = self;

        let mut graph = Graph::new();
        let mut node_lookup = HashMap::new();
        let mut infos = HashMap::new();

        let root_index = graph.add_node(PackageNode::Root);
        node_lookup.insert(PackageNode::Root, root_index);

        let root_hash = root_external_deps_hash
            .unwrap_or_else(|| external_deps_hash_from_manifest(&root_package_json));
        infos.insert(
            PackageName::Root,
            PackageInfo {
                package_json: root_package_json,
                package_path: AnchoredSystemPathBuf::default(),
                external_deps_hash: root_hash,
            },
        );
        let root_workspace_index = graph.add_node(PackageNode::Workspace(PackageName::Root));
        node_lookup.insert(PackageNode::Workspace(PackageName::Root), root_workspace_index);
        graph.add_edge(root_workspace_index, root_index, ());

        for (name, path, package_json, external_deps_hash) in &packages {
            if infos.contains_key(name) {
                return Err(Error::DuplicatePackage(name.to_string()));
            }
            let external_deps_hash = external_deps_hash
                .clone()
                .unwrap_or_else(|| external_deps_hash_from_manifest(package_json));
            infos.insert(
                name.clone(),
                PackageInfo {
                    package_json: package_json.clone(),
                    package_path: path.clone(),
                    external_deps_hash,
                },
            );
            let node = PackageNode::Workspace(name.clone());
            let index = graph.add_node(node.clone());
            node_lookup.insert(node, index);
        }

        // Workspace dependency edges: a declared dependency on another
        // workspace package wires the two packages together; everything
        // else is external and only shows up through the deps hash.
        for (name, _, package_json, _) in &packages {
            let from_index = node_lookup[&PackageNode::Workspace(name.clone())];
            let mut connected = false;
            for (dep_name, _) in package_json.all_dependencies() {
                let dep = PackageName::from(dep_name.as_str());
                if let Some(dep_index) = node_lookup.get(&PackageNode::Workspace(dep.clone())) {
                    if matches!(dep, PackageName::Root) {
                        continue;
                    }
                    graph.add_edge(from_index, *dep_index, ());
                    connected = true;
                }
            }
            if !connected {
                graph.add_edge(from_index, root_index, ());
            }
        }

        let package_graph = PackageGraph {
            graph,
            node_lookup,
            packages: infos,
        };
        package_graph.validate()?;
        Ok(package_graph)
    }
}

/// Fallback external-dependency hash over the declared dependency ranges.
fn external_deps_hash_from_manifest(package_json: &PackageJson) -> String {
    let packages = package_json
        .all_dependencies()
        .map(|(key, version)| Package {
            key: key.clone(),
            version: version.clone(),
        })
        .collect();
    LockFilePackages(packages).hash()
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

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

    fn three_package_graph() -> PackageGraph {
        // a depends on b, c stands alone
        PackageGraph::builder(PackageJson::default())
            .with_package(
                "a",
                AnchoredSystemPathBuf::from_raw("packages/a").unwrap(),
                package_json("a", &["b"]),
                None,
            )
            .with_package(
                "b",
                AnchoredSystemPathBuf::from_raw("packages/b").unwrap(),
                package_json("b", &[]),
                None,
            )
            .with_package(
                "c",
                AnchoredSystemPathBuf::from_raw("packages/c").unwrap(),
                package_json("c", &[]),
                None,
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_immediate_dependencies() {
        let graph = three_package_graph();
        let deps = graph
            .immediate_dependencies(&PackageNode::Workspace(PackageName::from("a")))
            .unwrap();
        assert_eq!(
            deps,
            [PackageNode::Workspace(PackageName::from("b"))]
                .iter()
                .collect::<HashSet<_>>()
        );
    }

    #[test]
    fn test_ancestors() {
        let graph = three_package_graph();
        let ancestors = graph.ancestors(&PackageNode::Workspace(PackageName::from("b")));
        assert_eq!(
            ancestors,
            [PackageNode::Workspace(PackageName::from("a"))]
                .iter()
                .collect::<HashSet<_>>()
        );
    }

    #[test]
    fn test_cyclic_workspace_is_rejected() {
        let result = PackageGraph::builder(PackageJson::default())
            .with_package(
                "a",
                AnchoredSystemPathBuf::from_raw("packages/a").unwrap(),
                package_json("a", &["b"]),
                None,
            )
            .with_package(
                "b",
                AnchoredSystemPathBuf::from_raw("packages/b").unwrap(),
                package_json("b", &["a"]),
                None,
            )
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_external_deps_hash_changes_with_ranges() {
        let base = package_json("a", &[]);
        let mut bumped = base.clone();
        bumped
            .dependencies
            .insert("lodash".to_string(), "^4.17.21".to_string());

        assert_ne!(
            external_deps_hash_from_manifest(&base),
            external_deps_hash_from_manifest(&bumped)
        );
    }

    #[test]
    fn test_duplicate_package_is_rejected() {
        let result = PackageGraph::builder(PackageJson::default())
            .with_package(
                "a",
                AnchoredSystemPathBuf::from_raw("packages/a").unwrap(),
                package_json("a", &[]),
                None,
            )
            .with_package(
                "a",
                AnchoredSystemPathBuf::from_raw("packages/other-a").unwrap(),
                package_json("a", &[]),
                None,
            )
            .build();
        assert!(matches!(result, Err(Error::DuplicatePackage(_))));
    }
}
