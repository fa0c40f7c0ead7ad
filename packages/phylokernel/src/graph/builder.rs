use crate::graph::edge::{Edge, EdgeKey};
use crate::graph::node::{Node, NodeKey, NodeKind};
use crate::graph::tree::Tree;
use crate::make_error;
use eyre::{Report, WrapErr};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Incrementally assembles a rooted tree. Nodes are connected by undirected branches, and directions are derived
/// from the root tip when the tree is built.
#[derive(Debug, Default)]
pub struct TreeBuilder {
  nodes: Vec<Node>,
  edges: Vec<Edge>,
  root: Option<NodeKey>,
}

impl TreeBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds the root tip. There must be exactly one.
  pub fn add_root_tip(&mut self, name: impl Into<String>) -> Result<NodeKey, Report> {
    if let Some(root) = self.root {
      return make_error!("Root tip is already set to node '{}'", self.nodes[root.0].name());
    }
    let key = self.add_node(name, NodeKind::RootTip);
    self.root = Some(key);
    Ok(key)
  }

  /// Adds a leaf whose states are found in column `leaf_index` of the pattern table
  pub fn add_leaf(&mut self, name: impl Into<String>, leaf_index: usize) -> NodeKey {
    self.add_node(name, NodeKind::Leaf { leaf_index })
  }

  pub fn add_internal(&mut self, name: impl Into<String>) -> NodeKey {
    self.add_node(name, NodeKind::Internal)
  }

  fn add_node(&mut self, name: impl Into<String>, kind: NodeKind) -> NodeKey {
    let key = NodeKey(self.nodes.len());
    self.nodes.push(Node::new(key, name, kind));
    key
  }

  /// Connects two nodes by a branch of the given length
  pub fn connect(&mut self, a: NodeKey, b: NodeKey, length: f64) -> Result<(), Report> {
    if a.0 >= self.nodes.len() || b.0 >= self.nodes.len() {
      return make_error!("Cannot connect nodes {a} and {b}: there are only {} nodes", self.nodes.len());
    }
    if a == b {
      return make_error!("Cannot connect node '{}' to itself", self.nodes[a.0].name());
    }
    if !(length.is_finite() && length >= 0.0) {
      return make_error!(
        "Branch between '{}' and '{}' has invalid length {length}",
        self.nodes[a.0].name(),
        self.nodes[b.0].name()
      );
    }
    let forward = EdgeKey(self.edges.len());
    let backward = EdgeKey(self.edges.len() + 1);
    self.edges.push(Edge::new(forward, a, b, backward, length));
    self.edges.push(Edge::new(backward, b, a, forward, length));
    self.nodes[a.0].add_edge(forward);
    self.nodes[b.0].add_edge(backward);
    Ok(())
  }

  /// Validates the topology and produces the tree
  pub fn build(self) -> Result<Tree, Report> {
    self.build_impl().wrap_err("When building tree")
  }

  fn build_impl(self) -> Result<Tree, Report> {
    let Some(root) = self.root else {
      return make_error!("Tree has no root tip");
    };

    let n_branches = self.edges.len() / 2;
    if n_branches + 1 != self.nodes.len() {
      return make_error!(
        "Tree with {} nodes must have {} branches, but found {n_branches}",
        self.nodes.len(),
        self.nodes.len() - 1
      );
    }

    for node in &self.nodes {
      match node.kind() {
        NodeKind::RootTip | NodeKind::Leaf { .. } if node.degree() != 1 => {
          return make_error!("Tip '{}' must have exactly one neighbor, but has {}", node.name(), node.degree());
        }
        NodeKind::Internal if node.degree() < 3 => {
          return make_error!(
            "Internal node '{}' must have at least 3 neighbors, but has {}",
            node.name(),
            node.degree()
          );
        }
        _ => {}
      }
    }

    let top = self.edges[self.nodes[root.0].edges()[0].0].target();
    if self.nodes[top.0].is_leaf() {
      return make_error!("Root tip must be attached to an internal node");
    }

    // n - 1 branches and every node reachable from the root means no cycles
    let mut seen = vec![false; self.nodes.len()];
    let mut queue = VecDeque::from([root]);
    seen[root.0] = true;
    while let Some(node) = queue.pop_front() {
      for &edge in self.nodes[node.0].edges() {
        let target = self.edges[edge.0].target();
        if !seen[target.0] {
          seen[target.0] = true;
          queue.push_back(target);
        }
      }
    }
    if let Some(unreachable) = seen.iter().position(|&s| !s) {
      return make_error!("Node '{}' is not connected to the root", self.nodes[unreachable].name());
    }

    let leaf_indices = self.nodes.iter().filter_map(Node::leaf_index).sorted().collect_vec();
    let n_leaves = leaf_indices.len();
    if leaf_indices.iter().enumerate().any(|(i, &leaf_index)| i != leaf_index) {
      return make_error!("Leaf indices must be unique and numbered 0..{n_leaves}, but found {leaf_indices:?}");
    }

    Ok(Tree::from_parts(self.nodes, self.edges, root, n_leaves))
  }
}

/// One node of a tree given as a parent list
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParentListEntry {
  pub name: String,

  /// Index of the parent in the list, absent for the root tip
  #[serde(default)]
  pub parent: Option<usize>,

  /// Length of the branch to the parent
  #[serde(default)]
  pub length: f64,

  /// Column of the pattern table, for leaves
  #[serde(default)]
  pub leaf: Option<usize>,
}

/// Builds a tree from a parent list. The single entry without parent is the root tip.
pub fn tree_from_parent_list(entries: &[ParentListEntry]) -> Result<Tree, Report> {
  let mut builder = TreeBuilder::new();
  let keys: Vec<NodeKey> = entries
    .iter()
    .map(|entry| match (entry.parent, entry.leaf) {
      (None, None) => builder.add_root_tip(&entry.name),
      (None, Some(_)) => make_error!("Root tip '{}' cannot be a leaf of the alignment", entry.name),
      (Some(_), Some(leaf)) => Ok(builder.add_leaf(&entry.name, leaf)),
      (Some(_), None) => Ok(builder.add_internal(&entry.name)),
    })
    .try_collect()?;

  for (entry, &key) in entries.iter().zip(&keys) {
    if let Some(parent) = entry.parent {
      let Some(&parent_key) = keys.get(parent) else {
        return make_error!("Node '{}' refers to parent {parent}, which does not exist", entry.name);
      };
      builder.connect(parent_key, key, entry.length)?;
    }
  }

  builder.build()
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::graph::edge::Direction;
  use eyre::Report;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  /// `(((A:0.1,B:0.2)Z:0.05,(C:0.3,D:0.4,E:0.5)Y:0.15)X:0)root;`
  pub(crate) fn five_leaf_tree() -> Result<Tree, Report> {
    let mut builder = TreeBuilder::new();
    let root = builder.add_root_tip("root")?;
    let x = builder.add_internal("X");
    let z = builder.add_internal("Z");
    let y = builder.add_internal("Y");
    let leaves = ["A", "B", "C", "D", "E"]
      .iter()
      .enumerate()
      .map(|(i, name)| builder.add_leaf(*name, i))
      .collect_vec();
    builder.connect(root, x, 0.0)?;
    builder.connect(x, z, 0.05)?;
    builder.connect(x, y, 0.15)?;
    builder.connect(z, leaves[0], 0.1)?;
    builder.connect(z, leaves[1], 0.2)?;
    builder.connect(y, leaves[2], 0.3)?;
    builder.connect(y, leaves[3], 0.4)?;
    builder.connect(y, leaves[4], 0.5)?;
    builder.build()
  }

  #[rstest]
  fn builds_tree() -> Result<(), Report> {
    let tree = five_leaf_tree()?;
    assert_eq!(tree.n_leaves(), 5);
    assert_eq!(tree.nodes().len(), 9);
    assert_eq!(tree.edges().len(), 16);
    assert_eq!(tree.node(tree.edge(tree.root_edge()).target()).name(), "X");
    Ok(())
  }

  #[rstest]
  fn rejects_bifurcating_internal_node() -> Result<(), Report> {
    let mut builder = TreeBuilder::new();
    let root = builder.add_root_tip("root")?;
    let x = builder.add_internal("X");
    let a = builder.add_leaf("A", 0);
    builder.connect(root, x, 0.0)?;
    builder.connect(x, a, 0.1)?;
    assert!(builder.build().is_err());
    Ok(())
  }

  #[rstest]
  fn rejects_disconnected_tree() -> Result<(), Report> {
    let mut builder = TreeBuilder::new();
    let root = builder.add_root_tip("root")?;
    let x = builder.add_internal("X");
    let a = builder.add_leaf("A", 0);
    let b = builder.add_leaf("B", 1);
    let c = builder.add_leaf("C", 2);
    builder.connect(root, x, 0.0)?;
    builder.connect(x, a, 0.1)?;
    builder.connect(x, b, 0.1)?;
    builder.connect(b, c, 0.1)?;
    assert!(builder.build().is_err());
    Ok(())
  }

  #[rstest]
  fn rejects_second_root() -> Result<(), Report> {
    let mut builder = TreeBuilder::new();
    builder.add_root_tip("root")?;
    assert!(builder.add_root_tip("other").is_err());
    Ok(())
  }

  #[rstest]
  fn builds_tree_from_parent_list() -> Result<(), Report> {
    let entry = |name: &str, parent: Option<usize>, length: f64, leaf: Option<usize>| ParentListEntry {
      name: name.to_owned(),
      parent,
      length,
      leaf,
    };
    let tree = tree_from_parent_list(&[
      entry("root", None, 0.0, None),
      entry("X", Some(0), 0.0, None),
      entry("A", Some(1), 0.1, Some(0)),
      entry("B", Some(1), 0.2, Some(1)),
    ])?;
    assert_eq!(tree.to_string(), "((A:0.1,B:0.2)X:0)root;");
    let a = tree.find_node("A").unwrap();
    let x = tree.find_node("X").unwrap();
    let edge = tree.find_edge(x, a).unwrap();
    assert_eq!(tree.edge(edge).direction(), Direction::AwayFromRoot);
    Ok(())
  }
}
