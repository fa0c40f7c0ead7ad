use crate::constants::{LOG_SCALING_THRESHOLD, SCALING_THRESHOLD, SCALING_THRESHOLD_INVER, UNDERFLOW_SCALE_UNITS};
use crate::likelihood::buffer::PartialLhBuffer;
use crate::likelihood::context::KernelContext;
use crate::likelihood::scratch::{zeroed, ScratchArena};
use crate::likelihood::shape::{ChildKind, ChildRef, NodeShape};
use crate::likelihood::tip::condense_tip_vectors;
use crate::utils::ndarray::write_flat;
use crate::make_internal_error;
use eyre::Report;
use rayon::prelude::*;

/// Result of combining the children of one node
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PartialOutcome {
  /// Log rescaling of the whole subtree, weighted by pattern frequencies
  pub lh_scale_factor: f64,

  /// Observed patterns whose partial likelihoods underflowed to zero
  pub underflow: Vec<usize>,
}

/// Where the contribution of one child comes from
enum ChildSource<'a> {
  /// Condensed tip vectors, one `[category][state]` block per state code. The root tip always reads code 0.
  Tip { vectors: &'a [f64], leaf: Option<usize> },

  /// Transition blocks `[category][from][to]` and the partial likelihoods of the child subtree
  Internal {
    trans: &'a [f64],
    partial: &'a PartialLhBuffer,
  },
}

impl ChildSource<'_> {
  fn scale_num(&self, ptn: usize) -> u16 {
    match self {
      ChildSource::Tip { .. } => 0,
      ChildSource::Internal { partial, .. } => partial.scale_num(ptn),
    }
  }

  /// Multiplies (or, with `assign`, overwrites) `out[c][x]` by the likelihood of the child subtree given state `x`
  fn propagate(&self, ctx: &KernelContext, ptn: usize, out: &mut [f64], assign: bool) {
    let n = ctx.n_states();
    match self {
      ChildSource::Tip { vectors, leaf } => {
        let tip = tip_vector(vectors, *leaf, ctx, ptn);
        for (o, &t) in out.iter_mut().zip(tip) {
          *o = if assign { t } else { *o * t };
        }
      }
      ChildSource::Internal { trans, partial } => {
        let child = partial.pattern(ptn);
        for (cx, o) in out.iter_mut().enumerate() {
          let c = cx / n;
          let value = row_dot(trans, cx, n, &child[c * n..(c + 1) * n]);
          *o = if assign { value } else { *o * value };
        }
      }
    }
  }
}

/// Tip vector of the state code found at pattern `ptn`
#[inline]
fn tip_vector<'a>(vectors: &'a [f64], leaf: Option<usize>, ctx: &KernelContext, ptn: usize) -> &'a [f64] {
  let block = ctx.block();
  let code = leaf.map_or(0, |leaf| ctx.patterns.state_at(ptn, leaf) as usize);
  &vectors[code * block..(code + 1) * block]
}

/// Dot product of row `cx` (category and `from` state flattened) of a transition block with a child vector
#[inline]
fn row_dot(trans: &[f64], cx: usize, n: usize, child: &[f64]) -> f64 {
  trans[cx * n..(cx + 1) * n].iter().zip(child).map(|(p, v)| p * v).sum()
}

/// Writes the transition blocks of one child edge, `[category][from][to]`, transposed if the child is the parent
fn fill_transition_blocks(ctx: &KernelContext, child: &ChildRef, out: &mut [f64]) {
  let n = ctx.n_states();
  let length = ctx.tree.edge(child.edge).length();
  for (c, block) in out.chunks_exact_mut(n * n).enumerate() {
    let p = ctx.model.transition_matrix(ctx.rates.rate(c) * length);
    write_flat(&p, child.transposed, 1.0, block);
  }
}

/// Computes the partial likelihoods of the node at the end of an edge, from the already computed partial likelihoods
/// of its children, and rescales patterns which approach underflow.
pub(crate) fn compute_node_partial(
  ctx: &KernelContext,
  shape: &NodeShape,
  buffer: &mut PartialLhBuffer,
  scratch: &mut ScratchArena,
) -> Result<PartialOutcome, Report> {
  let children = shape.children();
  if children.is_empty() {
    return make_internal_error!("Partial likelihoods of a leaf cannot be computed");
  }

  let n = ctx.n_states();
  let ncat = ctx.n_categories();
  let block = ctx.block();
  let nptn = ctx.nptn();
  if !buffer.fits(nptn, block) {
    return make_internal_error!(
      "Partial likelihood buffer has {} patterns of {} values, but {nptn} patterns of {block} values are required",
      buffer.nptn(),
      buffer.block()
    );
  }

  let alphabet = ctx.patterns.alphabet();
  let unknown = alphabet.unknown();
  let trans_len = ncat * n * n;
  let tip_len = alphabet.n_codes() * block;

  let trans = zeroed(&mut scratch.trans, children.len() * trans_len);
  let tip_lh = zeroed(&mut scratch.tip_lh, children.len() * tip_len);
  for (k, child) in children.iter().enumerate() {
    let child_trans = &mut trans[k * trans_len..(k + 1) * trans_len];
    let vectors = &mut tip_lh[k * tip_len..(k + 1) * tip_len];
    match child.kind {
      ChildKind::RootTip => {
        let pi = ctx.model.stationary_frequencies();
        for c in 0..ncat {
          for (x, &p) in pi.iter().enumerate() {
            vectors[c * n + x] = p;
          }
        }
      }
      ChildKind::Leaf { leaf_index } => {
        fill_transition_blocks(ctx, child, child_trans);
        let codes = ctx.patterns.leaf_states(leaf_index)?;
        condense_tip_vectors(
          ctx.tips,
          child_trans,
          ncat,
          codes.into_iter().filter(|&code| code != unknown),
          vectors,
        );
        vectors[unknown as usize * block..(unknown as usize + 1) * block].fill(1.0);
      }
      ChildKind::Internal => fill_transition_blocks(ctx, child, child_trans),
    }
  }
  let (trans, tip_lh) = (&*trans, &*tip_lh);

  let sources: Vec<ChildSource> = children
    .iter()
    .enumerate()
    .map(|(k, child)| match child.kind {
      ChildKind::RootTip => Ok(ChildSource::Tip {
        vectors: &tip_lh[k * tip_len..(k + 1) * tip_len],
        leaf: None,
      }),
      ChildKind::Leaf { leaf_index } => Ok(ChildSource::Tip {
        vectors: &tip_lh[k * tip_len..(k + 1) * tip_len],
        leaf: Some(leaf_index),
      }),
      ChildKind::Internal => {
        let edge = ctx.tree.edge(child.edge);
        match edge.partial() {
          Some(partial) if edge.is_computed() && partial.fits(nptn, block) => Ok(ChildSource::Internal {
            trans: &trans[k * trans_len..(k + 1) * trans_len],
            partial,
          }),
          _ => make_internal_error!("Partial likelihoods of edge {edge} are required, but not computed"),
        }
      }
    })
    .collect::<Result<_, Report>>()?;

  let unknown_tip = ctx.tips.unknown();
  let (values, scale_num) = buffer.parts_mut();
  let corrections: Vec<(f64, bool)> = values
    .par_chunks_mut(block)
    .zip(scale_num.par_iter_mut())
    .enumerate()
    .map(|(ptn, (out, scale))| {
      *scale = combine_children(ctx, shape, &sources, ptn, out);
      rescale_pattern(out, scale, unknown_tip, ctx.frequencies[ptn])
    })
    .collect();

  let mut lh_scale_factor: f64 = children
    .iter()
    .filter(|child| child.kind == ChildKind::Internal)
    .map(|child| ctx.tree.edge(child.edge).lh_scale_factor())
    .sum();
  let mut underflow = vec![];
  for (ptn, (correction, underflowed)) in corrections.into_iter().enumerate() {
    lh_scale_factor += correction;
    if underflowed && !ctx.patterns.is_unobserved(ptn) {
      underflow.push(ptn);
    }
  }

  Ok(PartialOutcome {
    lh_scale_factor,
    underflow,
  })
}

/// Fills `out` with the product of the children contributions and returns the scale counter it inherits
fn combine_children(ctx: &KernelContext, shape: &NodeShape, sources: &[ChildSource], ptn: usize, out: &mut [f64]) -> u16 {
  let n = ctx.n_states();
  match (shape, sources) {
    (NodeShape::Cherry { .. }, [ChildSource::Tip { vectors: v1, leaf: l1 }, ChildSource::Tip { vectors: v2, leaf: l2 }]) => {
      let tip1 = tip_vector(v1, *l1, ctx, ptn);
      let tip2 = tip_vector(v2, *l2, ctx, ptn);
      for ((o, &a), &b) in out.iter_mut().zip(tip1).zip(tip2) {
        *o = a * b;
      }
      0
    }
    (
      NodeShape::TipInternal { .. },
      [ChildSource::Tip { vectors, leaf }, ChildSource::Internal { trans, partial }],
    ) => {
      let tip = tip_vector(vectors, *leaf, ctx, ptn);
      let child = partial.pattern(ptn);
      for (cx, o) in out.iter_mut().enumerate() {
        let c = cx / n;
        *o = tip[cx] * row_dot(trans, cx, n, &child[c * n..(c + 1) * n]);
      }
      partial.scale_num(ptn)
    }
    (
      NodeShape::InternalInternal { .. },
      [ChildSource::Internal { trans: t1, partial: p1 }, ChildSource::Internal { trans: t2, partial: p2 }],
    ) => {
      let (child1, child2) = (p1.pattern(ptn), p2.pattern(ptn));
      for (cx, o) in out.iter_mut().enumerate() {
        let c = cx / n;
        let lh1 = row_dot(t1, cx, n, &child1[c * n..(c + 1) * n]);
        let lh2 = row_dot(t2, cx, n, &child2[c * n..(c + 1) * n]);
        *o = lh1 * lh2;
      }
      p1.scale_num(ptn).saturating_add(p2.scale_num(ptn))
    }
    _ => {
      let mut scale = 0_u16;
      for (k, source) in sources.iter().enumerate() {
        source.propagate(ctx, ptn, out, k == 0);
        scale = scale.saturating_add(source.scale_num(ptn));
      }
      scale
    }
  }
}

/// Rescales the partial likelihoods of one pattern if its largest entry is below the scaling threshold.
///
/// Returns the log correction, weighted by the pattern frequency, and whether the pattern had underflowed to zero, in
/// which case it is reset to the unknown state.
pub(crate) fn rescale_pattern(out: &mut [f64], scale: &mut u16, unknown_tip: &[f64], frequency: f64) -> (f64, bool) {
  let lh_max = out.iter().copied().fold(0.0, f64::max);
  if lh_max == 0.0 {
    for cat in out.chunks_exact_mut(unknown_tip.len()) {
      cat.copy_from_slice(unknown_tip);
    }
    *scale = scale.saturating_add(UNDERFLOW_SCALE_UNITS);
    (f64::from(UNDERFLOW_SCALE_UNITS) * LOG_SCALING_THRESHOLD * frequency, true)
  } else if lh_max < SCALING_THRESHOLD {
    for value in out.iter_mut() {
      *value *= SCALING_THRESHOLD_INVER;
    }
    *scale = scale.saturating_add(1);
    (LOG_SCALING_THRESHOLD * frequency, false)
  } else {
    (0.0, false)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::constants::LOG_UNDERFLOW_FLOOR;
  use approx::assert_ulps_eq;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  fn leaves_regular_pattern_alone() {
    let mut out = vec![0.25, 0.5, 1e-3, 0.0];
    let mut scale = 2;
    let (correction, underflow) = rescale_pattern(&mut out, &mut scale, &[1.0; 2], 3.0);
    assert_eq!(out, vec![0.25, 0.5, 1e-3, 0.0]);
    assert_eq!((correction, underflow, scale), (0.0, false, 2));
  }

  #[rstest]
  fn rescales_small_pattern() {
    let tiny = SCALING_THRESHOLD * 0.5;
    let mut out = vec![tiny, tiny * 0.25];
    let mut scale = 0;
    let (correction, underflow) = rescale_pattern(&mut out, &mut scale, &[1.0; 2], 2.0);
    assert_eq!(out, vec![0.5, 0.125]);
    assert_eq!(scale, 1);
    assert!(!underflow);
    assert_ulps_eq!(correction, 2.0 * LOG_SCALING_THRESHOLD);
  }

  #[rstest]
  fn resets_underflowed_pattern() {
    let mut out = vec![0.0; 4];
    let mut scale = 1;
    let (correction, underflow) = rescale_pattern(&mut out, &mut scale, &[1.0; 2], 1.0);
    assert_eq!(out, vec![1.0; 4]);
    assert_eq!(scale, 5);
    assert!(underflow);
    assert_ulps_eq!(correction, LOG_UNDERFLOW_FLOOR);
  }
}
