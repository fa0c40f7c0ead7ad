use crate::graph::edge::{Direction, EdgeKey};
use crate::graph::node::NodeKind;
use crate::graph::tree::Tree;
use crate::make_internal_error;
use eyre::Report;
use itertools::Itertools;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildKind {
  RootTip,
  Leaf { leaf_index: usize },
  Internal,
}

impl ChildKind {
  #[inline]
  pub const fn is_tip(&self) -> bool {
    !matches!(self, Self::Internal)
  }
}

/// Child subtree of a node, reached through `edge`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildRef {
  pub edge: EdgeKey,
  pub kind: ChildKind,

  /// Whether the transition matrix must be transposed, which is the case when the child is closer to the root
  /// than the node
  pub transposed: bool,
}

/// How the partial likelihoods of a node are combined from its children
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeShape {
  /// The edge points into a leaf: nothing to combine
  Leaf,

  /// Two tip children
  Cherry { tips: [ChildRef; 2] },

  /// One tip and one internal child
  TipInternal { tip: ChildRef, internal: ChildRef },

  /// Two internal children
  InternalInternal { internals: [ChildRef; 2] },

  /// Three or more children of any kind
  Multifurcating { children: Vec<ChildRef> },
}

impl NodeShape {
  /// Classifies the target of `edge` by its children, i.e. its neighbors other than the source of `edge`
  pub fn of(tree: &Tree, edge: EdgeKey) -> Result<Self, Report> {
    let target = tree.node(tree.edge(edge).target());
    match target.kind() {
      NodeKind::RootTip | NodeKind::Leaf { .. } => return Ok(Self::Leaf),
      NodeKind::Internal if target.degree() < 3 => {
        return make_internal_error!(
          "Internal node '{}' has {} neighbors, but at least 3 are required",
          target.name(),
          target.degree()
        );
      }
      NodeKind::Internal => {}
    }

    let children: Vec<ChildRef> = tree
      .child_edges(edge)
      .map(|child| {
        let child_edge = tree.edge(child);
        let transposed = match child_edge.direction() {
          Direction::AwayFromRoot => false,
          Direction::TowardRoot => true,
          Direction::Undefined => {
            return make_internal_error!("Edge {child_edge} has no direction. Directions must be assigned from the root");
          }
        };
        let kind = match tree.node(child_edge.target()).kind() {
          NodeKind::RootTip => ChildKind::RootTip,
          NodeKind::Leaf { leaf_index } => ChildKind::Leaf {
            leaf_index: *leaf_index,
          },
          NodeKind::Internal => ChildKind::Internal,
        };
        Ok(ChildRef {
          edge: child,
          kind,
          transposed,
        })
      })
      .try_collect()?;

    Ok(match children.as_slice() {
      [a, b] => match (a.kind.is_tip(), b.kind.is_tip()) {
        (true, true) => Self::Cherry { tips: [*a, *b] },
        (true, false) => Self::TipInternal { tip: *a, internal: *b },
        (false, true) => Self::TipInternal { tip: *b, internal: *a },
        (false, false) => Self::InternalInternal { internals: [*a, *b] },
      },
      _ => Self::Multifurcating { children },
    })
  }

  /// Children in the order in which they are combined. Tips come first in the two-child shapes.
  pub fn children(&self) -> Vec<ChildRef> {
    match self {
      Self::Leaf => vec![],
      Self::Cherry { tips } => tips.to_vec(),
      Self::TipInternal { tip, internal } => vec![*tip, *internal],
      Self::InternalInternal { internals } => internals.to_vec(),
      Self::Multifurcating { children } => children.clone(),
    }
  }
}
