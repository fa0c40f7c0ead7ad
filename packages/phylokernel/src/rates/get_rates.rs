use crate::rates::gamma::GammaRates;
use crate::rates::rate_heterogeneity::{FreeRates, RateHeterogeneity, UniformRate};
use eyre::{Report, WrapErr};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// Rate heterogeneity choice, as found in a problem description
#[derive(Clone, Debug, SmartDefault, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RatesParams {
  #[default]
  Uniform {
    #[serde(default)]
    p_invar: f64,
  },
  Gamma {
    alpha: f64,
    #[serde(default = "default_gamma_categories")]
    n_categories: usize,
    #[serde(default)]
    p_invar: f64,
  },
  Free {
    rates: Vec<f64>,
    proportions: Vec<f64>,
    #[serde(default)]
    p_invar: f64,
  },
}

const fn default_gamma_categories() -> usize {
  4
}

pub fn get_rates(params: &RatesParams) -> Result<Box<dyn RateHeterogeneity>, Report> {
  get_rates_impl(params).wrap_err_with(|| format!("When creating rate heterogeneity model {params:?}"))
}

fn get_rates_impl(params: &RatesParams) -> Result<Box<dyn RateHeterogeneity>, Report> {
  let rates: Box<dyn RateHeterogeneity> = match params {
    RatesParams::Uniform { p_invar } => Box::new(UniformRate::with_invariant_sites(*p_invar)?),
    RatesParams::Gamma {
      alpha,
      n_categories,
      p_invar,
    } => Box::new(GammaRates::new(*alpha, *n_categories, *p_invar)?),
    RatesParams::Free {
      rates,
      proportions,
      p_invar,
    } => Box::new(FreeRates::new(rates.clone(), proportions.clone(), *p_invar)?),
  };
  Ok(rates)
}
