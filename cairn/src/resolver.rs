// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Package level dependency graph: virtual-name expansion, ordering,
//! reverse lookups and impact queries over the [`dag`] primitives.
//!
//! Nodes are package names only; packages never hold references to one
//! another, every relationship resolves through this graph.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

/// The dependency slice of a recipe the graph is built from
#[derive(Debug, Clone)]
pub struct Declaration {
    pub name: String,
    pub depends: Vec<String>,
    pub build_deps: Vec<String>,
    pub opt_deps: Vec<String>,
}

impl From<&metafile::Recipe> for Declaration {
    fn from(recipe: &metafile::Recipe) -> Self {
        Self {
            name: recipe.name.clone(),
            depends: recipe.depends.clone(),
            build_deps: recipe.build_deps.clone(),
            opt_deps: recipe.opt_deps.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Graph {
    dag: dag::Dag<String>,
    /// Names backed by an actual recipe
    known: HashSet<String>,
    /// `(parent, child)` pairs that resolved to nothing
    missing: Vec<(String, String)>,
    virtual_map: HashMap<String, Vec<String>>,
}

impl Graph {
    /// Build adjacency from recipe declarations.
    ///
    /// Build-only dependencies share the edge set: they must precede
    /// compilation exactly like runtime dependencies. Virtual names
    /// expand through `virtual_map` into concrete sets.
    pub fn build(
        declarations: &[Declaration],
        virtual_map: HashMap<String, Vec<String>>,
        include_optional: bool,
    ) -> Result<Self, Error> {
        let mut graph = Graph {
            known: declarations.iter().map(|d| d.name.clone()).collect(),
            virtual_map,
            ..Default::default()
        };

        for declaration in declarations {
            graph.dag.add_node_or_get_index(&declaration.name);

            let deps = declaration
                .depends
                .iter()
                .chain(&declaration.build_deps)
                .chain(include_optional.then_some(&declaration.opt_deps).into_iter().flatten());

            for dep in deps {
                for concrete in graph.expand(dep)? {
                    if !graph.known.contains(&concrete) {
                        graph.missing.push((declaration.name.clone(), concrete.clone()));
                    }
                    graph.dag.add_dependency(&declaration.name, &concrete);
                }
            }
        }

        Ok(graph)
    }

    /// Expand a possibly-virtual name into concrete names
    fn expand(&self, name: &str) -> Result<Vec<String>, Error> {
        match self.virtual_map.get(name) {
            Some(concrete) if concrete.is_empty() => Err(Error::EmptyVirtual(name.to_owned())),
            Some(concrete) => Ok(concrete.clone()),
            None => Ok(vec![name.to_owned()]),
        }
    }

    /// Dependency-first ordering for `target`.
    ///
    /// In strict mode a declared dependency with no recipe fails the
    /// resolve; otherwise it is logged and ordered as a leaf.
    pub fn resolve(&self, target: &str, strict: bool) -> Result<Vec<String>, Error> {
        self.resolve_many(std::slice::from_ref(&target.to_owned()), strict)
    }

    /// Resolve each target and merge, preserving first occurrence
    pub fn resolve_many(&self, targets: &[String], strict: bool) -> Result<Vec<String>, Error> {
        self.check_missing(strict)?;

        let mut merged = vec![];
        let mut seen = HashSet::new();

        for target in targets {
            for expanded in self.expand(target)? {
                let sequence = self.dag.dependency_order(&expanded).map_err(map_dag)?;

                for name in sequence {
                    if seen.insert(name.clone()) {
                        merged.push(name);
                    }
                }
            }
        }

        Ok(merged)
    }

    /// Dependency-first ordering of every known package
    pub fn order_all(&self, strict: bool) -> Result<Vec<String>, Error> {
        self.check_missing(strict)?;
        self.dag.dependency_order_all().map_err(map_dag)
    }

    fn check_missing(&self, strict: bool) -> Result<(), Error> {
        if let Some((parent, child)) = self.missing.first() {
            if strict {
                return Err(Error::MissingDependency {
                    parent: parent.clone(),
                    child: child.clone(),
                });
            }

            for (parent, child) in &self.missing {
                log::warn!("`{parent}` depends on `{child}` which has no recipe, treating as leaf");
            }
        }

        Ok(())
    }

    /// Direct concrete dependencies of `name`
    pub fn deps_of(&self, name: &str) -> Vec<String> {
        self.dag
            .dependencies(&name.to_owned())
            .into_iter()
            .cloned()
            .collect()
    }

    /// All names that transitively depend on `pkg`
    pub fn reverse(&self, pkg: &str) -> Vec<String> {
        self.dag.transpose().closure(&pkg.to_owned())
    }

    /// Installed names no other installed package depends upon
    pub fn orphans(&self, installed: &[String]) -> Vec<String> {
        let installed_set: HashSet<_> = installed.iter().collect();
        let reversed = self.dag.transpose();

        let mut orphans: Vec<_> = installed
            .iter()
            .filter(|name| {
                reversed
                    .dependencies(name)
                    .into_iter()
                    .filter(|dependent| *dependent != *name)
                    .all(|dependent| !installed_set.contains(dependent))
            })
            .cloned()
            .collect();

        orphans.sort();
        orphans
    }

    /// Installed packages whose transitive dependencies include any
    /// name in `changed`, in topological order
    pub fn changed_impact(
        &self,
        changed: &[String],
        installed: &[String],
    ) -> Result<Vec<String>, Error> {
        let changed: HashSet<_> = changed.iter().collect();

        let impacted: HashSet<_> = installed
            .iter()
            .filter(|name| {
                self.dag
                    .closure(name)
                    .iter()
                    .chain(std::iter::once(*name))
                    .any(|dep| changed.contains(dep))
            })
            .cloned()
            .collect();

        let order = self.dag.dependency_order_all().map_err(map_dag)?;

        Ok(order
            .into_iter()
            .filter(|name| impacted.contains(name))
            .collect())
    }

    pub fn node_exists(&self, name: &str) -> bool {
        self.dag.node_exists(&name.to_owned())
    }

    /// Render the adjacency in `dot` format for `deps graph`
    pub fn dot(&self) -> String {
        let mut out = String::from("digraph deps {\n");

        let mut nodes: Vec<_> = self.dag.iter_nodes().collect();
        nodes.sort();

        for node in &nodes {
            for dep in self.dag.dependencies(node) {
                out.push_str(&format!("    \"{node}\" -> \"{dep}\";\n"));
            }
        }

        out.push_str("}\n");
        out
    }
}

fn map_dag(error: dag::Error<String>) -> Error {
    match error {
        dag::Error::UnknownNode(name) => Error::UnknownTarget(name),
        dag::Error::Cycle(path) => Error::Cycle(path),
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no recipe or dependency named `{0}`")]
    UnknownTarget(String),
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("`{parent}` depends on `{child}` which cannot be resolved")]
    MissingDependency { parent: String, child: String },
    #[error("virtual name `{0}` expands to nothing")]
    EmptyVirtual(String),
}

#[cfg(test)]
mod test {
    use super::*;

    fn declare(name: &str, depends: &[&str], build_deps: &[&str]) -> Declaration {
        Declaration {
            name: name.to_owned(),
            depends: depends.iter().map(|s| (*s).to_owned()).collect(),
            build_deps: build_deps.iter().map(|s| (*s).to_owned()).collect(),
            opt_deps: vec![],
        }
    }

    #[test]
    fn chain_resolves_dependency_first() {
        let graph = Graph::build(
            &[
                declare("a", &["b"], &[]),
                declare("b", &["c"], &[]),
                declare("c", &[], &[]),
            ],
            HashMap::new(),
            false,
        )
        .unwrap();

        assert_eq!(graph.resolve("a", true).unwrap(), vec!["c", "b", "a"]);
    }

    #[test]
    fn build_deps_order_like_runtime_deps() {
        let graph = Graph::build(
            &[declare("app", &[], &["toolchain"]), declare("toolchain", &[], &[])],
            HashMap::new(),
            false,
        )
        .unwrap();

        assert_eq!(
            graph.resolve("app", true).unwrap(),
            vec!["toolchain", "app"]
        );
    }

    #[test]
    fn cycle_path_starts_and_ends_at_same_node() {
        let graph = Graph::build(
            &[
                declare("x", &["y"], &[]),
                declare("y", &["z"], &[]),
                declare("z", &["x"], &[]),
            ],
            HashMap::new(),
            false,
        )
        .unwrap();

        let Err(Error::Cycle(path)) = graph.resolve("x", true) else {
            panic!("expected cycle");
        };

        assert_eq!(path.first(), path.last());
        assert!(path.iter().all(|n| ["x", "y", "z"].contains(&n.as_str())));
    }

    #[test]
    fn strict_mode_rejects_missing_dependency() {
        let graph = Graph::build(
            &[declare("app", &["ghost"], &[])],
            HashMap::new(),
            false,
        )
        .unwrap();

        assert_eq!(
            graph.resolve("app", true),
            Err(Error::MissingDependency {
                parent: "app".to_owned(),
                child: "ghost".to_owned()
            })
        );

        // Lenient mode orders the ghost as a leaf
        assert_eq!(graph.resolve("app", false).unwrap(), vec!["ghost", "app"]);
    }

    #[test]
    fn virtual_names_expand() {
        let graph = Graph::build(
            &[
                declare("mta-user", &["mta"], &[]),
                declare("postfix", &[], &[]),
            ],
            HashMap::from([("mta".to_owned(), vec!["postfix".to_owned()])]),
            false,
        )
        .unwrap();

        assert_eq!(
            graph.resolve("mta-user", true).unwrap(),
            vec!["postfix", "mta-user"]
        );
    }

    #[test]
    fn resolve_many_merges_on_first_occurrence() {
        let graph = Graph::build(
            &[
                declare("a", &["shared"], &[]),
                declare("b", &["shared"], &[]),
                declare("shared", &[], &[]),
            ],
            HashMap::new(),
            false,
        )
        .unwrap();

        assert_eq!(
            graph
                .resolve_many(&["a".to_owned(), "b".to_owned()], true)
                .unwrap(),
            vec!["shared", "a", "b"]
        );
    }

    #[test]
    fn reverse_and_orphans() {
        let graph = Graph::build(
            &[
                declare("app", &["lib"], &[]),
                declare("lib", &[], &[]),
                declare("tool", &[], &[]),
            ],
            HashMap::new(),
            false,
        )
        .unwrap();

        assert_eq!(graph.reverse("lib"), vec!["app"]);

        let installed = vec!["app".to_owned(), "lib".to_owned(), "tool".to_owned()];
        assert_eq!(graph.orphans(&installed), vec!["app", "tool"]);
    }

    #[test]
    fn changed_impact_is_topological() {
        let graph = Graph::build(
            &[
                declare("app", &["lib"], &[]),
                declare("lib", &["base"], &[]),
                declare("base", &[], &[]),
                declare("other", &[], &[]),
            ],
            HashMap::new(),
            false,
        )
        .unwrap();

        let installed: Vec<String> = ["app", "lib", "base", "other"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();

        let impact = graph
            .changed_impact(&["base".to_owned()], &installed)
            .unwrap();

        assert_eq!(impact, vec!["base", "lib", "app"]);
    }
}
