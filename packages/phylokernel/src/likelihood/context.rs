use crate::graph::tree::Tree;
use crate::likelihood::tip::TipTable;
use crate::model::rate_matrix_model::SubstitutionModel;
use crate::patterns::pattern_table::PatternTable;
use crate::rates::rate_heterogeneity::RateHeterogeneity;

/// Read-only inputs shared by all kernels of one call
#[derive(Clone, Copy)]
pub(crate) struct KernelContext<'a> {
  pub tree: &'a Tree,
  pub patterns: &'a PatternTable,
  pub model: &'a dyn SubstitutionModel,
  pub rates: &'a dyn RateHeterogeneity,
  pub tips: &'a TipTable,
  pub frequencies: &'a [f64],
  pub ptn_invar: &'a [f64],
}

impl KernelContext<'_> {
  #[inline]
  pub fn n_states(&self) -> usize {
    self.model.n_states()
  }

  #[inline]
  pub fn n_categories(&self) -> usize {
    self.rates.n_categories()
  }

  /// Number of values per pattern in a partial likelihood buffer
  #[inline]
  pub fn block(&self) -> usize {
    self.n_categories() * self.n_states()
  }

  #[inline]
  pub fn nptn(&self) -> usize {
    self.patterns.nptn()
  }
}
