use crate::constants::SCALING_THRESHOLD;
use crate::likelihood::branch::{prepare_branch_blocks, scaled_invariant_term, BranchKind, BranchOrientation, BranchSides};
use crate::likelihood::context::KernelContext;
use crate::likelihood::scratch::ScratchArena;
use crate::make_internal_error;
use eyre::Report;
use rayon::prelude::*;

/// First and second derivatives of the log-likelihood with respect to the length of a branch, before
/// ascertainment correction
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct BranchDerivatives {
  pub df: f64,
  pub ddf: f64,

  /// Probability of the unobservable patterns and its derivatives
  pub prob_const: f64,
  pub df_const: f64,
  pub ddf_const: f64,

  /// Observed patterns whose likelihood vanished, making the derivatives undefined
  pub vanishing: Vec<usize>,
}

/// Likelihood of one pattern and its first and second derivatives, in rescaled units
fn pattern_derivatives(
  ctx: &KernelContext,
  branch: &BranchOrientation,
  sides: &BranchSides,
  scratch: &ScratchArena,
  ptn: usize,
) -> (f64, f64, f64) {
  let n = ctx.n_states();
  let block = ctx.block();
  let (mut lh, mut df, mut ddf) = (0.0, 0.0, 0.0);
  let Some(root_side) = sides.root_side else {
    return (lh, df, ddf);
  };
  let root = root_side.pattern(ptn);

  match branch.kind {
    BranchKind::Leaf { leaf_index } => {
      let code = ctx.patterns.state_at(ptn, leaf_index) as usize;
      let tip = code * block..(code + 1) * block;
      let (tip_lh, tip_derv1, tip_derv2) = (
        &scratch.tip_lh[tip.clone()],
        &scratch.tip_derv1[tip.clone()],
        &scratch.tip_derv2[tip],
      );
      for i in 0..block {
        lh += root[i] * tip_lh[i];
        df += root[i] * tip_derv1[i];
        ddf += root[i] * tip_derv2[i];
      }
    }
    BranchKind::Internal => {
      let Some(child_side) = sides.child_side else {
        return (lh, df, ddf);
      };
      let child = child_side.pattern(ptn);
      for ci in 0..block {
        let c = ci / n;
        let child = &child[c * n..(c + 1) * n];
        let row = ci * n..(ci + 1) * n;
        let (mut lh_state, mut lh_derv1, mut lh_derv2) = (0.0, 0.0, 0.0);
        for (x, &v) in child.iter().enumerate() {
          lh_state += scratch.trans[row.start + x] * v;
          lh_derv1 += scratch.derv1[row.start + x] * v;
          lh_derv2 += scratch.derv2[row.start + x] * v;
        }
        lh += root[ci] * lh_state;
        df += root[ci] * lh_derv1;
        ddf += root[ci] * lh_derv2;
      }
    }
    BranchKind::Root => {}
  }
  (lh, df, ddf)
}

/// Evaluates the first and second derivatives of the log-likelihood with respect to the length of one branch
pub(crate) fn branch_derivatives(
  ctx: &KernelContext,
  branch: &BranchOrientation,
  scratch: &mut ScratchArena,
) -> Result<BranchDerivatives, Report> {
  if branch.kind == BranchKind::Root {
    return make_internal_error!("The branch above the root is virtual: its length cannot be optimized");
  }
  prepare_branch_blocks(ctx, branch, scratch, true)?;
  let sides = BranchSides::of(ctx, branch)?;
  let scratch = &*scratch;

  // (likelihood, first derivative, second derivative, scale count) of every pattern
  let terms: Vec<(f64, f64, f64, u16)> = (0..ctx.nptn())
    .into_par_iter()
    .map(|ptn| {
      let (lh, df, ddf) = pattern_derivatives(ctx, branch, &sides, scratch, ptn);
      (lh, df, ddf, sides.scale_num(ptn))
    })
    .collect();

  let mut result = BranchDerivatives::default();
  for (ptn, (mut lh, mut df, mut ddf, scale_num)) in terms.into_iter().enumerate() {
    let ptn_invar = ctx.ptn_invar[ptn];
    if ctx.patterns.is_unobserved(ptn) {
      if scale_num >= 1 {
        lh *= SCALING_THRESHOLD;
        df *= SCALING_THRESHOLD;
        ddf *= SCALING_THRESHOLD;
      }
      result.prob_const += lh + ptn_invar;
      result.df_const += df;
      result.ddf_const += ddf;
    } else {
      let lh_total = lh + scaled_invariant_term(ptn_invar, scale_num);
      if lh_total.is_nan() || lh_total <= 0.0 {
        result.vanishing.push(ptn);
        continue;
      }
      let df_frac = df / lh_total;
      let ddf_frac = ddf / lh_total;
      let freq = ctx.frequencies[ptn];
      result.df += freq * df_frac;
      result.ddf += freq * ddf_frac - freq * df_frac * df_frac;
    }
  }
  Ok(result)
}
