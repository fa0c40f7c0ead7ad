use crate::{make_error, make_report};
use crate::rates::rate_heterogeneity::{validate_p_invar, RateHeterogeneity};
use eyre::Report;
use itertools::Itertools;
use statrs::distribution::{ContinuousCDF, Gamma};
use std::fmt::Display;

/// Discrete Gamma model of rate variation (Yang 1994), with rates taken at the medians of equiprobable
/// categories of a mean-one Gamma distribution, then rescaled to mean one.
///
/// See: Yang (1994), J. Mol. Evol. 39 (3): 306–314. doi:10.1007/BF00160154
#[derive(Clone, Debug)]
pub struct GammaRates {
  alpha: f64,
  rates: Vec<f64>,
  p_invar: f64,
}

impl GammaRates {
  pub fn new(alpha: f64, n_categories: usize, p_invar: f64) -> Result<Self, Report> {
    validate_p_invar(p_invar)?;
    if n_categories == 0 {
      return make_error!("Gamma rate model needs at least one category");
    }
    if !(alpha.is_finite() && alpha > 0.0) {
      return make_error!("Gamma shape parameter must be positive, but found {alpha}");
    }

    let dist = Gamma::new(alpha, alpha)
      .map_err(|err| make_report!("When creating Gamma distribution with shape {alpha}: {err}"))?;

    let medians = (0..n_categories)
      .map(|c| dist.inverse_cdf((2 * c + 1) as f64 / (2 * n_categories) as f64))
      .collect_vec();

    let sum: f64 = medians.iter().sum();
    if !(sum.is_finite() && sum > 0.0) {
      return make_error!("Gamma rate model with shape {alpha} has degenerate category rates: {medians:?}");
    }

    // mean over categories is one, and one over the variable sites when some are invariable
    let scale = n_categories as f64 / sum / (1.0 - p_invar);
    let rates = medians.iter().map(|r| r * scale).collect_vec();

    Ok(Self { alpha, rates, p_invar })
  }

  #[inline]
  pub const fn alpha(&self) -> f64 {
    self.alpha
  }
}

impl RateHeterogeneity for GammaRates {
  fn n_categories(&self) -> usize {
    self.rates.len()
  }

  fn rate(&self, cat: usize) -> f64 {
    self.rates[cat]
  }

  fn proportion(&self, _: usize) -> f64 {
    (1.0 - self.p_invar) / self.rates.len() as f64
  }

  fn p_invar(&self) -> f64 {
    self.p_invar
  }
}

impl Display for GammaRates {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "Gamma{} (alpha = {:.4}", self.rates.len(), self.alpha)?;
    if self.p_invar > 0.0 {
      write!(f, ", p_invar = {:.4}", self.p_invar)?;
    }
    write!(f, "): {}", self.rates.iter().map(|r| format!("{r:.4}")).join(" "))
  }
}
