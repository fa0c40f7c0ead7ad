use crate::make_error;
use eyre::Report;
use itertools::Itertools;
use std::fmt::{Debug, Display};

/// Among-site rate variation: a fixed set of categories with relative rates and prior proportions, plus an
/// optional class of invariable sites.
///
/// Category proportions sum to `1 - p_invar`, and the mean rate over all sites (invariable ones included) is one.
pub trait RateHeterogeneity: Debug + Display + Send + Sync {
  fn n_categories(&self) -> usize;

  fn rate(&self, cat: usize) -> f64;

  fn proportion(&self, cat: usize) -> f64;

  /// Proportion of invariable sites
  fn p_invar(&self) -> f64 {
    0.0
  }
}

pub(crate) fn validate_p_invar(p_invar: f64) -> Result<(), Report> {
  if !(0.0..1.0).contains(&p_invar) {
    return make_error!("Proportion of invariable sites must be in [0, 1), but found {p_invar}");
  }
  Ok(())
}

/// All sites evolve at the same rate
#[derive(Clone, Debug, Default)]
pub struct UniformRate {
  p_invar: f64,
}

impl UniformRate {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_invariant_sites(p_invar: f64) -> Result<Self, Report> {
    validate_p_invar(p_invar)?;
    Ok(Self { p_invar })
  }
}

impl RateHeterogeneity for UniformRate {
  fn n_categories(&self) -> usize {
    1
  }

  fn rate(&self, _: usize) -> f64 {
    1.0 / (1.0 - self.p_invar)
  }

  fn proportion(&self, _: usize) -> f64 {
    1.0 - self.p_invar
  }

  fn p_invar(&self) -> f64 {
    self.p_invar
  }
}

impl Display for UniformRate {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.p_invar > 0.0 {
      write!(f, "Uniform+I (p_invar = {:.4})", self.p_invar)
    } else {
      write!(f, "Uniform")
    }
  }
}

/// Free-rate model: categories with arbitrary rates and proportions
#[derive(Clone, Debug)]
pub struct FreeRates {
  rates: Vec<f64>,
  proportions: Vec<f64>,
  p_invar: f64,
}

impl FreeRates {
  /// Proportions are rescaled to sum to `1 - p_invar`, and rates are rescaled so that the mean rate is one.
  pub fn new(rates: Vec<f64>, proportions: Vec<f64>, p_invar: f64) -> Result<Self, Report> {
    validate_p_invar(p_invar)?;
    if rates.is_empty() || rates.len() != proportions.len() {
      return make_error!(
        "Free-rate model needs the same non-zero number of rates and proportions, but found {} and {}",
        rates.len(),
        proportions.len()
      );
    }
    if rates.iter().any(|&r| !(r.is_finite() && r >= 0.0)) {
      return make_error!("Free-rate model rates must be finite and non-negative, but found {rates:?}");
    }
    if proportions.iter().any(|&p| !(p.is_finite() && p > 0.0)) {
      return make_error!("Free-rate model proportions must be positive, but found {proportions:?}");
    }

    let prop_sum: f64 = proportions.iter().sum();
    let proportions = proportions.iter().map(|p| p / prop_sum * (1.0 - p_invar)).collect_vec();

    let mean_rate: f64 = rates.iter().zip(&proportions).map(|(r, p)| r * p).sum();
    if mean_rate <= 0.0 {
      return make_error!("Free-rate model has zero mean rate");
    }
    let rates = rates.iter().map(|r| r / mean_rate).collect_vec();

    Ok(Self {
      rates,
      proportions,
      p_invar,
    })
  }
}

impl RateHeterogeneity for FreeRates {
  fn n_categories(&self) -> usize {
    self.rates.len()
  }

  fn rate(&self, cat: usize) -> f64 {
    self.rates[cat]
  }

  fn proportion(&self, cat: usize) -> f64 {
    self.proportions[cat]
  }

  fn p_invar(&self) -> f64 {
    self.p_invar
  }
}

impl Display for FreeRates {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "FreeRate ({} categories", self.rates.len())?;
    if self.p_invar > 0.0 {
      write!(f, ", p_invar = {:.4}", self.p_invar)?;
    }
    write!(
      f,
      "): {}",
      self
        .rates
        .iter()
        .zip(&self.proportions)
        .map(|(r, p)| format!("{r:.4}@{p:.4}"))
        .join(" ")
    )
  }
}
