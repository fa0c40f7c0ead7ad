use crate::graph::edge::EdgeKey;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey(pub usize);

impl Display for NodeKey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
  /// Tip of the virtual branch above the real root. Its partial likelihood is the stationary distribution.
  RootTip,

  /// Sampled sequence, with the index of its column in the pattern table
  Leaf { leaf_index: usize },

  Internal,
}

#[derive(Clone, Debug)]
pub struct Node {
  key: NodeKey,
  name: String,
  kind: NodeKind,
  edges: Vec<EdgeKey>,
}

impl Node {
  pub(crate) fn new(key: NodeKey, name: impl Into<String>, kind: NodeKind) -> Self {
    Self {
      key,
      name: name.into(),
      kind,
      edges: vec![],
    }
  }

  #[inline]
  pub const fn key(&self) -> NodeKey {
    self.key
  }

  #[inline]
  pub fn name(&self) -> &str {
    &self.name
  }

  #[inline]
  pub const fn kind(&self) -> &NodeKind {
    &self.kind
  }

  /// Leaves include the root tip
  #[inline]
  pub const fn is_leaf(&self) -> bool {
    !matches!(self.kind, NodeKind::Internal)
  }

  #[inline]
  pub const fn leaf_index(&self) -> Option<usize> {
    match self.kind {
      NodeKind::Leaf { leaf_index } => Some(leaf_index),
      _ => None,
    }
  }

  /// Outgoing directed edges, one per neighbor
  #[inline]
  pub fn edges(&self) -> &[EdgeKey] {
    &self.edges
  }

  #[inline]
  pub fn degree(&self) -> usize {
    self.edges.len()
  }

  pub(crate) fn add_edge(&mut self, edge: EdgeKey) {
    self.edges.push(edge);
  }
}
