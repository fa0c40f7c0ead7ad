use crate::constants::{LOG_SCALING_THRESHOLD, LOG_UNDERFLOW_FLOOR, SCALING_THRESHOLD, SCALING_THRESHOLD_INVER};
use crate::graph::edge::{Direction, EdgeKey};
use crate::graph::node::NodeKind;
use crate::graph::tree::Tree;
use crate::likelihood::buffer::PartialLhBuffer;
use crate::likelihood::context::KernelContext;
use crate::likelihood::scratch::{zeroed, ScratchArena};
use crate::likelihood::tip::condense_tip_vectors;
use crate::utils::ndarray::write_flat;
use crate::make_internal_error;
use eyre::Report;
use rayon::prelude::*;

/// Position of a branch relative to the root, which decides how its two sides are combined
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchKind {
  /// Virtual branch between the root tip and the top of the tree
  Root,

  /// Terminal branch: the child is a sampled leaf
  Leaf { leaf_index: usize },

  /// Both ends are internal nodes
  Internal,
}

/// A branch, oriented from parent to child regardless of which of its two directed edges was given
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BranchOrientation {
  /// Edge parent -> child, owning the partial likelihoods of the subtree below the branch
  pub down: EdgeKey,

  /// Edge child -> parent, owning the partial likelihoods of the rest of the tree
  pub up: EdgeKey,

  pub kind: BranchKind,
}

impl BranchOrientation {
  pub fn of(tree: &Tree, edge: EdgeKey) -> Result<Self, Report> {
    let (down, up) = match tree.edge(edge).direction() {
      Direction::AwayFromRoot => (edge, tree.edge(edge).reverse()),
      Direction::TowardRoot => (tree.edge(edge).reverse(), edge),
      Direction::Undefined => {
        return make_internal_error!(
          "Edge {} has no direction. Directions must be assigned from the root",
          tree.edge(edge)
        );
      }
    };
    let parent = tree.node(tree.edge(down).source());
    let child = tree.node(tree.edge(down).target());
    let kind = match (parent.kind(), child.kind()) {
      (NodeKind::RootTip, NodeKind::Internal) => BranchKind::Root,
      (NodeKind::Internal, NodeKind::Leaf { leaf_index }) => BranchKind::Leaf {
        leaf_index: *leaf_index,
      },
      (NodeKind::Internal, NodeKind::Internal) => BranchKind::Internal,
      _ => {
        return make_internal_error!(
          "Branch between '{}' and '{}' is not a valid tree branch",
          parent.name(),
          child.name()
        )
      }
    };
    Ok(Self { down, up, kind })
  }

  /// Edges whose partial likelihoods are needed to evaluate the branch. Edges into tips have none.
  pub fn required_partials(&self) -> Vec<EdgeKey> {
    match self.kind {
      BranchKind::Root => vec![self.down],
      BranchKind::Leaf { .. } => vec![self.up],
      BranchKind::Internal => vec![self.up, self.down],
    }
  }
}

/// Partial likelihoods on both sides of a branch
pub(crate) struct BranchSides<'a> {
  /// Rest of the tree, seen from the parent. Absent on the root branch, where the stationary distribution is used.
  pub root_side: Option<&'a PartialLhBuffer>,

  /// Subtree below the branch. Absent on terminal branches, where the leaf states are used.
  pub child_side: Option<&'a PartialLhBuffer>,
}

impl<'a> BranchSides<'a> {
  pub fn of(ctx: &KernelContext<'a>, branch: &BranchOrientation) -> Result<Self, Report> {
    let partial_of = |edge: EdgeKey| -> Result<&'a PartialLhBuffer, Report> {
      let edge = ctx.tree.edge(edge);
      match edge.partial() {
        Some(partial) if edge.is_computed() && partial.fits(ctx.nptn(), ctx.block()) => Ok(partial),
        _ => make_internal_error!("Partial likelihoods of edge {edge} are required, but not computed"),
      }
    };
    let root_side = match branch.kind {
      BranchKind::Root => None,
      _ => Some(partial_of(branch.up)?),
    };
    let child_side = match branch.kind {
      BranchKind::Leaf { .. } => None,
      _ => Some(partial_of(branch.down)?),
    };
    Ok(Self { root_side, child_side })
  }

  /// Number of rescalings of a pattern, summed over both sides
  #[inline]
  pub fn scale_num(&self, ptn: usize) -> u16 {
    let root = self.root_side.map_or(0, |p| p.scale_num(ptn));
    let child = self.child_side.map_or(0, |p| p.scale_num(ptn));
    root.saturating_add(child)
  }

  /// Sum of frequency-weighted log rescaling factors of both sides
  pub fn lh_scale_factor(&self, ctx: &KernelContext, branch: &BranchOrientation) -> f64 {
    let root = self.root_side.map_or(0.0, |_| ctx.tree.edge(branch.up).lh_scale_factor());
    let child = self.child_side.map_or(0.0, |_| ctx.tree.edge(branch.down).lh_scale_factor());
    root + child
  }
}

/// Fills the scratch blocks needed to evaluate a branch: the transition blocks `[category][from][to]`, scaled by
/// category proportion (and by rate and squared rate for the derivatives), and for a terminal branch their
/// condensation into the tip vectors of the leaf. On the root branch, `trans` holds `proportion * pi` per category.
pub(crate) fn prepare_branch_blocks(
  ctx: &KernelContext,
  branch: &BranchOrientation,
  scratch: &mut ScratchArena,
  with_derivatives: bool,
) -> Result<(), Report> {
  let n = ctx.n_states();
  let ncat = ctx.n_categories();
  let nn = n * n;

  if branch.kind == BranchKind::Root {
    let pi = ctx.model.stationary_frequencies();
    let root = zeroed(&mut scratch.trans, ncat * n);
    for c in 0..ncat {
      let prop = ctx.rates.proportion(c);
      for (x, &p) in pi.iter().enumerate() {
        root[c * n + x] = prop * p;
      }
    }
    return Ok(());
  }

  let length = ctx.tree.edge(branch.down).length();
  let trans = zeroed(&mut scratch.trans, ncat * nn);
  let derv1 = zeroed(&mut scratch.derv1, if with_derivatives { ncat * nn } else { 0 });
  let derv2 = zeroed(&mut scratch.derv2, if with_derivatives { ncat * nn } else { 0 });
  for c in 0..ncat {
    let rate = ctx.rates.rate(c);
    let prop = ctx.rates.proportion(c);
    let range = c * nn..(c + 1) * nn;
    if with_derivatives {
      let (p, dp, ddp) = ctx.model.transition_matrix_derivatives(rate * length);
      write_flat(&p, false, prop, &mut trans[range.clone()]);
      write_flat(&dp, false, prop * rate, &mut derv1[range.clone()]);
      write_flat(&ddp, false, prop * rate * rate, &mut derv2[range]);
    } else {
      let p = ctx.model.transition_matrix(rate * length);
      write_flat(&p, false, prop, &mut trans[range]);
    }
  }

  if let BranchKind::Leaf { leaf_index } = branch.kind {
    let codes = ctx.patterns.leaf_states(leaf_index)?;
    let tip_len = ctx.patterns.alphabet().n_codes() * ctx.block();
    let tip_lh = zeroed(&mut scratch.tip_lh, tip_len);
    condense_tip_vectors(ctx.tips, trans, ncat, codes.iter().copied(), tip_lh);
    if with_derivatives {
      let tip_derv1 = zeroed(&mut scratch.tip_derv1, tip_len);
      condense_tip_vectors(ctx.tips, derv1, ncat, codes.iter().copied(), tip_derv1);
      let tip_derv2 = zeroed(&mut scratch.tip_derv2, tip_len);
      condense_tip_vectors(ctx.tips, derv2, ncat, codes.iter().copied(), tip_derv2);
    }
  }
  Ok(())
}

/// Invariable-site term of a pattern, in the units of partial likelihoods rescaled `scale_num` times
#[inline]
pub(crate) fn scaled_invariant_term(ptn_invar: f64, scale_num: u16) -> f64 {
  if ptn_invar == 0.0 {
    0.0
  } else {
    ptn_invar * SCALING_THRESHOLD_INVER.powi(i32::from(scale_num))
  }
}

/// Likelihood of one pattern and one category, with the category proportion applied
#[inline]
pub(crate) fn category_likelihood(
  ctx: &KernelContext,
  branch: &BranchOrientation,
  sides: &BranchSides,
  blocks: &[f64],
  tip_blocks: &[f64],
  ptn: usize,
  c: usize,
) -> f64 {
  let n = ctx.n_states();
  let cat = c * n..(c + 1) * n;
  match branch.kind {
    BranchKind::Root => {
      let child = sides.child_side.map_or(&[][..], |p| &p.pattern(ptn)[cat.clone()]);
      blocks[cat].iter().zip(child).map(|(r, v)| r * v).sum()
    }
    BranchKind::Leaf { leaf_index } => {
      let root = sides.root_side.map_or(&[][..], |p| &p.pattern(ptn)[cat.clone()]);
      let code = ctx.patterns.state_at(ptn, leaf_index) as usize;
      let tip = &tip_blocks[code * ctx.block()..(code + 1) * ctx.block()];
      root.iter().zip(&tip[cat]).map(|(r, v)| r * v).sum()
    }
    BranchKind::Internal => {
      let root = sides.root_side.map_or(&[][..], |p| &p.pattern(ptn)[cat.clone()]);
      let child = sides.child_side.map_or(&[][..], |p| &p.pattern(ptn)[cat]);
      root
        .iter()
        .enumerate()
        .map(|(i, r)| {
          let row = &blocks[(c * n + i) * n..(c * n + i + 1) * n];
          r * row.iter().zip(child).map(|(p, v)| p * v).sum::<f64>()
        })
        .sum()
    }
  }
}

/// Log-likelihood of the tree evaluated at a branch, before ascertainment correction
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct BranchLikelihood {
  pub log_likelihood: f64,

  /// Total probability of the unobservable patterns
  pub prob_const: f64,

  /// Observed patterns whose log-likelihood was not finite and was replaced by the underflow floor
  pub non_finite: Vec<usize>,
}

/// Evaluates the log-likelihood of the tree across one branch.
///
/// Fills `pattern_lh` (log-likelihood per pattern, rescaling excluded) and `pattern_lh_cat` (likelihood per pattern
/// and category, in rescaled units).
pub(crate) fn branch_log_likelihood(
  ctx: &KernelContext,
  branch: &BranchOrientation,
  scratch: &mut ScratchArena,
  pattern_lh: &mut [f64],
  pattern_lh_cat: &mut [f64],
) -> Result<BranchLikelihood, Report> {
  prepare_branch_blocks(ctx, branch, scratch, false)?;
  let sides = BranchSides::of(ctx, branch)?;
  let ncat = ctx.n_categories();
  let (blocks, tip_blocks) = (&scratch.trans[..], &scratch.tip_lh[..]);

  // (frequency-weighted log-likelihood, probability of an unobservable pattern)
  let contributions: Vec<(f64, f64)> = pattern_lh
    .par_iter_mut()
    .zip(pattern_lh_cat.par_chunks_mut(ncat))
    .enumerate()
    .map(|(ptn, (lh_out, cat_out))| {
      let mut lh: f64 = 0.0;
      for (c, out) in cat_out.iter_mut().enumerate() {
        *out = category_likelihood(ctx, branch, &sides, blocks, tip_blocks, ptn, c);
        lh += *out;
      }
      let scale_num = sides.scale_num(ptn);
      let ptn_invar = ctx.ptn_invar[ptn];

      if ctx.patterns.is_unobserved(ptn) {
        if scale_num >= 1 {
          lh *= SCALING_THRESHOLD;
        }
        let prob = lh + ptn_invar;
        *lh_out = prob.ln();
        (0.0, prob)
      } else {
        let invar = scaled_invariant_term(ptn_invar, scale_num);
        *lh_out = if invar.is_finite() {
          (lh + invar).abs().ln()
        } else {
          ptn_invar.ln() - f64::from(scale_num) * LOG_SCALING_THRESHOLD
        };
        (ctx.frequencies[ptn] * *lh_out, 0.0)
      }
    })
    .collect();

  let lh_scale_factor = sides.lh_scale_factor(ctx, branch);
  let mut log_likelihood = lh_scale_factor;
  let mut prob_const = 0.0;
  for (lh, prob) in contributions {
    log_likelihood += lh;
    prob_const += prob;
  }

  let mut non_finite = vec![];
  if !log_likelihood.is_finite() {
    log_likelihood = lh_scale_factor;
    for (ptn, lh) in pattern_lh.iter_mut().enumerate().take(ctx.patterns.n_observed()) {
      if !lh.is_finite() {
        *lh = LOG_UNDERFLOW_FLOOR;
        non_finite.push(ptn);
      }
      log_likelihood += ctx.frequencies[ptn] * *lh;
    }
  }

  Ok(BranchLikelihood {
    log_likelihood,
    prob_const,
    non_finite,
  })
}
