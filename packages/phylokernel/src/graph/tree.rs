use crate::graph::edge::{Direction, Edge, EdgeKey};
use crate::graph::node::{Node, NodeKey};
use crate::likelihood::buffer::PartialLhBuffer;
use crate::{make_error, make_internal_error};
use eyre::Report;
use itertools::Itertools;
use log::debug;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};

/// Rooted tree stored as an arena of nodes and directed edges.
///
/// Every branch is represented by two directed edges, each owning the partial likelihoods of the subtree it points
/// into. The root is a designated tip attached to the top of the tree by a virtual branch.
#[derive(Debug)]
pub struct Tree {
  nodes: Vec<Node>,
  edges: Vec<Edge>,
  root: NodeKey,
  n_leaves: usize,
}

impl Tree {
  pub(crate) fn from_parts(nodes: Vec<Node>, edges: Vec<Edge>, root: NodeKey, n_leaves: usize) -> Self {
    let mut tree = Self {
      nodes,
      edges,
      root,
      n_leaves,
    };
    tree.assign_directions();
    tree
  }

  #[inline]
  pub fn node(&self, key: NodeKey) -> &Node {
    &self.nodes[key.0]
  }

  #[inline]
  pub fn edge(&self, key: EdgeKey) -> &Edge {
    &self.edges[key.0]
  }

  #[inline]
  pub(crate) fn edge_mut(&mut self, key: EdgeKey) -> &mut Edge {
    &mut self.edges[key.0]
  }

  pub fn nodes(&self) -> &[Node] {
    &self.nodes
  }

  pub fn edges(&self) -> &[Edge] {
    &self.edges
  }

  /// The designated root tip
  #[inline]
  pub const fn root(&self) -> NodeKey {
    self.root
  }

  /// Number of sampled leaves, excluding the root tip
  #[inline]
  pub const fn n_leaves(&self) -> usize {
    self.n_leaves
  }

  #[inline]
  pub fn is_leaf(&self, key: NodeKey) -> bool {
    self.node(key).is_leaf()
  }

  /// Virtual branch from the root tip to the top internal node
  pub fn root_edge(&self) -> EdgeKey {
    self.node(self.root).edges()[0]
  }

  pub fn find_node(&self, name: &str) -> Option<NodeKey> {
    self.nodes.iter().find(|node| node.name() == name).map(Node::key)
  }

  /// Directed edge `from -> to`, if the two nodes are adjacent
  pub fn find_edge(&self, from: NodeKey, to: NodeKey) -> Option<EdgeKey> {
    self
      .node(from)
      .edges()
      .iter()
      .copied()
      .find(|&edge| self.edge(edge).target() == to)
  }

  /// Edges pointing into `node` from all of its neighbors
  pub fn incoming_edges(&self, node: NodeKey) -> impl Iterator<Item = EdgeKey> + '_ {
    self.node(node).edges().iter().map(|&edge| self.edge(edge).reverse())
  }

  /// Edges from the target of `edge` to its neighbors other than the source of `edge`, i.e. the child subtrees
  /// summarised by `edge`
  pub fn child_edges(&self, edge: EdgeKey) -> impl Iterator<Item = EdgeKey> + '_ {
    let (source, target) = (self.edge(edge).source(), self.edge(edge).target());
    self
      .node(target)
      .edges()
      .iter()
      .copied()
      .filter(move |&child| self.edge(child).target() != source)
  }

  /// Branch edges pointing away from the root, in post-order (children before parents)
  pub fn postorder_edges(&self) -> Vec<EdgeKey> {
    let mut order = vec![];
    let mut stack = vec![(self.root_edge(), false)];
    while let Some((edge, expanded)) = stack.pop() {
      if expanded {
        order.push(edge);
      } else {
        stack.push((edge, true));
        stack.extend(self.child_edges(edge).map(|child| (child, false)));
      }
    }
    order
  }

  /// Sets length of both directions of a branch and invalidates every partial likelihood which depends on it.
  ///
  /// Those are the edges pointing, from anywhere in the tree, toward the branch.
  pub fn set_branch_length(&mut self, edge: EdgeKey, length: f64) -> Result<(), Report> {
    if !(length.is_finite() && length >= 0.0) {
      return make_error!("Branch length must be finite and non-negative, but got {length} for branch {}", self.edge(edge));
    }
    let reverse = self.edge(edge).reverse();
    self.edge_mut(edge).length = length;
    self.edge_mut(reverse).length = length;

    let n_invalidated = self.invalidate_toward(edge) + self.invalidate_toward(reverse);
    debug!(
      "Set length of branch {} to {length}, invalidated {n_invalidated} partial likelihoods",
      self.edge(edge)
    );
    Ok(())
  }

  /// Invalidates all edges pointing toward `edge.source`, starting from the neighbors of the source other than
  /// `edge.target`
  fn invalidate_toward(&mut self, edge: EdgeKey) -> usize {
    let reverse = self.edge(edge).reverse();
    let mut n_invalidated = 0;
    let mut stack = self.child_edges(reverse).collect_vec();
    while let Some(outward) = stack.pop() {
      let inward = self.edge(outward).reverse();
      if self.edge(inward).is_computed() {
        n_invalidated += 1;
      }
      self.edge_mut(inward).invalidate();
      stack.extend(self.child_edges(outward));
    }
    n_invalidated
  }

  /// Marks all partial likelihoods as stale, keeping their memory
  pub fn clear_all_partials(&mut self) {
    for edge in &mut self.edges {
      edge.invalidate();
      edge.lh_scale_factor = 0.0;
    }
  }

  /// Releases memory of all partial likelihoods
  pub fn free_all_partials(&mut self) {
    for edge in &mut self.edges {
      edge.invalidate();
      edge.partial = None;
      edge.lh_scale_factor = 0.0;
    }
  }

  /// Moves the partial likelihood buffer from one edge to another. The receiving edge must not own a buffer.
  /// Both edges are left stale.
  pub fn reorient_partial(&mut self, from: EdgeKey, to: EdgeKey) -> Result<(), Report> {
    if self.edge(to).has_partial() {
      return make_internal_error!("Cannot move partial likelihoods into edge {}: it already owns a buffer", self.edge(to));
    }
    let Some(buffer) = self.take_partial(from) else {
      return make_internal_error!("Cannot move partial likelihoods from edge {}: it owns no buffer", self.edge(from));
    };
    self.edge_mut(from).invalidate();
    let to = self.edge_mut(to);
    to.partial = Some(buffer);
    to.invalidate();
    Ok(())
  }

  pub(crate) fn take_partial(&mut self, edge: EdgeKey) -> Option<PartialLhBuffer> {
    self.edge_mut(edge).partial.take()
  }

  pub(crate) fn put_partial(&mut self, edge: EdgeKey, buffer: PartialLhBuffer) {
    self.edge_mut(edge).partial = Some(buffer);
  }

  /// Sets edge directions from the root tip: edges from parent to child point away from the root
  pub fn assign_directions(&mut self) {
    let mut queue = VecDeque::from([self.root_edge()]);
    while let Some(edge) = queue.pop_front() {
      let reverse = self.edge(edge).reverse();
      self.edge_mut(edge).direction = Direction::AwayFromRoot;
      self.edge_mut(reverse).direction = Direction::TowardRoot;
      queue.extend(self.child_edges(edge));
    }
  }

  /// Forgets edge directions, as in an unrooted analysis
  pub fn clear_directions(&mut self) {
    for edge in &mut self.edges {
      edge.direction = Direction::Undefined;
    }
  }

  fn write_subtree(&self, f: &mut Formatter<'_>, edge: EdgeKey) -> std::fmt::Result {
    let (target, length) = (self.edge(edge).target(), self.edge(edge).length());
    let children = self.child_edges(edge).collect_vec();
    if !children.is_empty() {
      write!(f, "(")?;
      for (i, &child) in children.iter().enumerate() {
        if i > 0 {
          write!(f, ",")?;
        }
        self.write_subtree(f, child)?;
      }
      write!(f, ")")?;
    }
    write!(f, "{}:{length}", self.node(target).name())
  }
}

/// Newick representation, rooted at the root tip
impl Display for Tree {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "(")?;
    self.write_subtree(f, self.root_edge())?;
    write!(f, "){};", self.node(self.root).name())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::graph::builder::tests::five_leaf_tree;
  use crate::likelihood::buffer::PartialLhBuffer;
  use eyre::Report;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn edge_between(tree: &Tree, from: &str, to: &str) -> EdgeKey {
    let from = tree.find_node(from).unwrap();
    let to = tree.find_node(to).unwrap();
    tree.find_edge(from, to).unwrap()
  }

  fn mark_all_computed(tree: &mut Tree) {
    for edge in &mut tree.edges {
      edge.computed = true;
    }
  }

  fn computed_edges(tree: &Tree) -> Vec<String> {
    tree
      .edges()
      .iter()
      .filter(|edge| edge.is_computed())
      .map(|edge| format!("{}>{}", tree.node(edge.source()).name(), tree.node(edge.target()).name()))
      .sorted()
      .collect()
  }

  #[rstest]
  fn assigns_directions() -> Result<(), Report> {
    let tree = five_leaf_tree()?;
    assert_eq!(tree.edge(edge_between(&tree, "root", "X")).direction(), Direction::AwayFromRoot);
    assert_eq!(tree.edge(edge_between(&tree, "X", "root")).direction(), Direction::TowardRoot);
    assert_eq!(tree.edge(edge_between(&tree, "Y", "C")).direction(), Direction::AwayFromRoot);
    assert_eq!(tree.edge(edge_between(&tree, "Y", "X")).direction(), Direction::TowardRoot);
    Ok(())
  }

  #[rstest]
  fn prints_newick() -> Result<(), Report> {
    let tree = five_leaf_tree()?;
    assert_eq!(
      tree.to_string(),
      "(((A:0.1,B:0.2)Z:0.05,(C:0.3,D:0.4,E:0.5)Y:0.15)X:0)root;"
    );
    Ok(())
  }

  #[rstest]
  fn lists_edges_in_postorder() -> Result<(), Report> {
    let tree = five_leaf_tree()?;
    let order = tree
      .postorder_edges()
      .into_iter()
      .map(|edge| tree.node(tree.edge(edge).target()).name().to_owned())
      .collect_vec();
    assert_eq!(order.len(), 8);
    assert_eq!(order.last().map(String::as_str), Some("X"));
    let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
    assert!(pos("A") < pos("Z"));
    assert!(pos("E") < pos("Y"));
    Ok(())
  }

  #[rstest]
  fn invalidates_partials_depending_on_branch() -> Result<(), Report> {
    let mut tree = five_leaf_tree()?;
    mark_all_computed(&mut tree);

    let branch = edge_between(&tree, "Y", "C");
    tree.set_branch_length(branch, 0.7)?;

    assert_eq!(tree.edge(branch).length(), 0.7);
    assert_eq!(tree.edge(tree.edge(branch).reverse()).length(), 0.7);

    // everything pointing toward the branch Y-C is stale, everything pointing away from it is intact
    let stale = tree
      .edges()
      .iter()
      .filter(|edge| !edge.is_computed())
      .map(|edge| format!("{}>{}", tree.node(edge.source()).name(), tree.node(edge.target()).name()))
      .sorted()
      .collect_vec();
    assert_eq!(stale, vec!["A>Z", "B>Z", "D>Y", "E>Y", "X>Y", "Z>X", "root>X"]);
    assert!(computed_edges(&tree).contains(&"Y>C".to_owned()));
    assert!(computed_edges(&tree).contains(&"C>Y".to_owned()));
    assert!(computed_edges(&tree).contains(&"X>Z".to_owned()));
    Ok(())
  }

  #[rstest]
  fn rejects_negative_length() -> Result<(), Report> {
    let mut tree = five_leaf_tree()?;
    let branch = edge_between(&tree, "Y", "C");
    assert!(tree.set_branch_length(branch, -0.1).is_err());
    assert!(tree.set_branch_length(branch, f64::NAN).is_err());
    Ok(())
  }

  #[rstest]
  fn moves_partial_between_edges() -> Result<(), Report> {
    let mut tree = five_leaf_tree()?;
    let from = edge_between(&tree, "X", "Y");
    let to = edge_between(&tree, "C", "Y");
    tree.put_partial(from, PartialLhBuffer::new(2, 4));
    tree.edge_mut(from).computed = true;

    tree.reorient_partial(from, to)?;
    assert!(!tree.edge(from).has_partial());
    assert!(!tree.edge(from).is_computed());
    assert!(tree.edge(to).has_partial());
    assert!(!tree.edge(to).is_computed());

    assert!(tree.reorient_partial(from, to).is_err());
    Ok(())
  }

  #[rstest]
  fn clears_directions() -> Result<(), Report> {
    let mut tree = five_leaf_tree()?;
    tree.clear_directions();
    assert!(tree.edges().iter().all(|edge| edge.direction() == Direction::Undefined));
    tree.assign_directions();
    assert!(tree.edges().iter().all(|edge| edge.direction() != Direction::Undefined));
    Ok(())
  }
}
