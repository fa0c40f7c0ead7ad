use crate::graph::node::NodeKey;
use crate::likelihood::buffer::PartialLhBuffer;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use strum_macros::Display as StrumDisplay;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey(pub usize);

impl Display for EdgeKey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Orientation of a directed edge relative to the root
#[derive(Copy, Clone, Debug, PartialEq, Eq, StrumDisplay)]
pub enum Direction {
  TowardRoot,
  AwayFromRoot,
  Undefined,
}

/// Directed edge `source -> target`. It owns the partial likelihoods of the subtree hanging from `target`, away from
/// `source`. Both directions of a branch share the same length.
#[derive(Debug)]
pub struct Edge {
  key: EdgeKey,
  source: NodeKey,
  target: NodeKey,
  reverse: EdgeKey,
  pub(crate) length: f64,
  pub(crate) direction: Direction,
  pub(crate) partial: Option<PartialLhBuffer>,
  pub(crate) computed: bool,
  pub(crate) lh_scale_factor: f64,
}

impl Edge {
  pub(crate) fn new(key: EdgeKey, source: NodeKey, target: NodeKey, reverse: EdgeKey, length: f64) -> Self {
    Self {
      key,
      source,
      target,
      reverse,
      length,
      direction: Direction::Undefined,
      partial: None,
      computed: false,
      lh_scale_factor: 0.0,
    }
  }

  #[inline]
  pub const fn key(&self) -> EdgeKey {
    self.key
  }

  #[inline]
  pub const fn source(&self) -> NodeKey {
    self.source
  }

  #[inline]
  pub const fn target(&self) -> NodeKey {
    self.target
  }

  /// The same branch in the opposite direction
  #[inline]
  pub const fn reverse(&self) -> EdgeKey {
    self.reverse
  }

  #[inline]
  pub const fn length(&self) -> f64 {
    self.length
  }

  #[inline]
  pub const fn direction(&self) -> Direction {
    self.direction
  }

  /// Whether the partial likelihoods owned by this edge are up to date
  #[inline]
  pub const fn is_computed(&self) -> bool {
    self.computed
  }

  #[inline]
  pub const fn partial(&self) -> Option<&PartialLhBuffer> {
    self.partial.as_ref()
  }

  #[inline]
  pub const fn has_partial(&self) -> bool {
    self.partial.is_some()
  }

  /// Frequency-weighted sum of log rescaling factors of the subtree
  #[inline]
  pub const fn lh_scale_factor(&self) -> f64 {
    self.lh_scale_factor
  }

  pub(crate) fn invalidate(&mut self) {
    self.computed = false;
  }
}

impl Display for Edge {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} -> {}", self.source, self.target)
  }
}
