//! Conditioning of the likelihood on the absence of unobservable (constant) patterns.
//!
//! The probability mass of the synthetic patterns, `prob_const`, is removed from every observed site:
//! `lnL' = lnL - nsites * ln(1 - prob_const)`.

use thiserror::Error;

/// The total probability of the unobservable patterns is not a valid probability below one, so the likelihood
/// cannot be conditioned on their absence.
#[derive(Clone, Copy, Debug, Error, PartialEq)]
#[error(
  "Ascertainment bias correction is numerically degenerate: probability of unobservable patterns is {prob_const}, \
   but it must be in [0, 1)"
)]
pub struct NumericallyDegenerate {
  pub prob_const: f64,
}

fn check_prob_const(prob_const: f64) -> Result<(), NumericallyDegenerate> {
  if (0.0..1.0).contains(&prob_const) {
    Ok(())
  } else {
    Err(NumericallyDegenerate { prob_const })
  }
}

/// Corrects the log-likelihood of the tree and of every observed pattern
pub fn correct_log_likelihood(
  log_likelihood: f64,
  prob_const: f64,
  nsites: usize,
  observed_pattern_lh: &mut [f64],
) -> Result<f64, NumericallyDegenerate> {
  check_prob_const(prob_const)?;
  let log_observable = (1.0 - prob_const).ln();
  for lh in observed_pattern_lh {
    *lh -= log_observable;
  }
  Ok(log_likelihood - nsites as f64 * log_observable)
}

/// Corrects the first and second derivatives of the log-likelihood with respect to a branch length
pub fn correct_derivatives(
  (df, ddf): (f64, f64),
  (prob_const, df_const, ddf_const): (f64, f64, f64),
  nsites: usize,
) -> Result<(f64, f64), NumericallyDegenerate> {
  check_prob_const(prob_const)?;
  let observable = 1.0 - prob_const;
  let df_frac = df_const / observable;
  let ddf_frac = ddf_const / observable;
  let nsites = nsites as f64;
  Ok((df + nsites * df_frac, ddf + nsites * (ddf_frac + df_frac * df_frac)))
}
