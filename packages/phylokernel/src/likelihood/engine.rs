use crate::graph::edge::EdgeKey;
use crate::graph::tree::Tree;
use crate::likelihood::ascertainment::{correct_derivatives, correct_log_likelihood, NumericallyDegenerate};
use crate::likelihood::branch::{self, BranchLikelihood, BranchOrientation};
use crate::likelihood::buffer::PartialLhBuffer;
use crate::likelihood::context::KernelContext;
use crate::likelihood::derivative;
use crate::likelihood::diagnostics::{Diagnostic, DiagnosticsSink};
use crate::likelihood::partial::compute_node_partial;
use crate::likelihood::scratch::ScratchArena;
use crate::likelihood::shape::NodeShape;
use crate::likelihood::tip::TipTable;
use crate::model::rate_matrix_model::SubstitutionModel;
use crate::patterns::pattern_table::{common_states, PatternTable};
use crate::rates::rate_heterogeneity::RateHeterogeneity;
use crate::{make_error, make_internal_error, make_internal_report};
use eyre::{Report, WrapErr};
use itertools::Itertools;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use std::mem;
use strum_macros::Display;

/// How partial likelihood buffers are allocated
#[derive(Copy, Clone, Debug, PartialEq, Eq, SmartDefault, Display, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryMode {
  /// Every edge pointing into an internal node keeps its own buffer
  #[default]
  Full,

  /// One buffer per internal node, moved to whichever of its incoming edges is being computed
  PerNode,
}

#[derive(Clone, Debug, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelOptions {
  pub memory_mode: MemoryMode,
}

/// Inputs of the kernels, borrowed field by field so that the output vectors of the engine stay mutable
macro_rules! kernel_context {
  ($engine:expr) => {
    KernelContext {
      tree: &$engine.tree,
      patterns: &$engine.patterns,
      model: $engine.model.as_ref(),
      rates: $engine.rates.as_ref(),
      tips: &$engine.tips,
      frequencies: &$engine.frequencies,
      ptn_invar: &$engine.ptn_invar,
    }
  };
}

/// Phylogenetic likelihood of a rooted tree under a (possibly non-reversible) substitution model with among-site rate
/// heterogeneity.
///
/// Partial likelihoods live on the directed edges of the tree and are computed lazily. The log-likelihood and its
/// derivatives with respect to a branch length are evaluated across any branch.
pub struct PhyloLikelihood {
  tree: Tree,
  patterns: PatternTable,
  model: Box<dyn SubstitutionModel>,
  rates: Box<dyn RateHeterogeneity>,
  options: KernelOptions,
  tips: TipTable,
  frequencies: Vec<f64>,
  ptn_invar: Vec<f64>,
  pattern_lh: Vec<f64>,
  pattern_lh_cat: Vec<f64>,
  scratch: ScratchArena,
}

impl PhyloLikelihood {
  pub fn new(
    mut tree: Tree,
    patterns: PatternTable,
    model: Box<dyn SubstitutionModel>,
    rates: Box<dyn RateHeterogeneity>,
    options: KernelOptions,
  ) -> Result<Self, Report> {
    validate_inputs(&tree, &patterns, model.as_ref()).wrap_err("When setting up likelihood computation")?;
    tree.free_all_partials();

    let tips = TipTable::new(patterns.alphabet());
    let frequencies = patterns.frequencies();
    let ptn_invar = compute_ptn_invar(&patterns, model.as_ref(), rates.as_ref());
    let pattern_lh = vec![0.0; patterns.nptn()];
    let pattern_lh_cat = vec![0.0; patterns.nptn() * rates.n_categories()];

    debug!(
      "Likelihood of {} leaves, {} patterns ({} unobservable) and {} sites, model {model}, rates {rates}, memory mode {}",
      tree.n_leaves(),
      patterns.nptn(),
      patterns.n_unobserved(),
      patterns.nsites(),
      options.memory_mode
    );

    Ok(Self {
      tree,
      patterns,
      model,
      rates,
      options,
      tips,
      frequencies,
      ptn_invar,
      pattern_lh,
      pattern_lh_cat,
      scratch: ScratchArena::default(),
    })
  }

  pub const fn tree(&self) -> &Tree {
    &self.tree
  }

  pub const fn patterns(&self) -> &PatternTable {
    &self.patterns
  }

  pub fn model(&self) -> &dyn SubstitutionModel {
    self.model.as_ref()
  }

  pub fn rates(&self) -> &dyn RateHeterogeneity {
    self.rates.as_ref()
  }

  pub const fn options(&self) -> &KernelOptions {
    &self.options
  }

  pub const fn tips(&self) -> &TipTable {
    &self.tips
  }

  /// Log-likelihood of every pattern from the last evaluation, without rescaling factors. For unobservable patterns,
  /// the log of their probability.
  pub fn pattern_lh(&self) -> &[f64] {
    &self.pattern_lh
  }

  /// Likelihood of every pattern and rate category from the last evaluation, `[pattern][category]`, in rescaled units
  pub fn pattern_lh_cat(&self) -> &[f64] {
    &self.pattern_lh_cat
  }

  /// Likelihood contribution of invariable sites to every pattern
  pub fn ptn_invar(&self) -> &[f64] {
    &self.ptn_invar
  }

  /// Replaces the substitution model. All partial likelihoods become stale.
  pub fn set_model(&mut self, model: Box<dyn SubstitutionModel>) -> Result<(), Report> {
    validate_inputs(&self.tree, &self.patterns, model.as_ref()).wrap_err("When replacing substitution model")?;
    self.tips = TipTable::new(self.patterns.alphabet());
    self.ptn_invar = compute_ptn_invar(&self.patterns, model.as_ref(), self.rates.as_ref());
    self.model = model;
    self.tree.clear_all_partials();
    debug!("Substitution model set to {}", self.model);
    Ok(())
  }

  /// Replaces the rate heterogeneity model. The layout of partial likelihoods changes, so they are released.
  pub fn set_rates(&mut self, rates: Box<dyn RateHeterogeneity>) {
    self.ptn_invar = compute_ptn_invar(&self.patterns, self.model.as_ref(), rates.as_ref());
    self.pattern_lh_cat = vec![0.0; self.patterns.nptn() * rates.n_categories()];
    self.rates = rates;
    self.tree.free_all_partials();
    debug!("Rate heterogeneity set to {}", self.rates);
  }

  /// Sets the length of a branch, given by either of its directed edges
  pub fn set_branch_length(&mut self, edge: EdgeKey, length: f64) -> Result<(), Report> {
    self.tree.set_branch_length(edge, length)
  }

  /// Brings the partial likelihoods owned by `edge` up to date, computing stale subtrees first
  pub fn compute_partial_likelihood(&mut self, edge: EdgeKey, sink: &mut dyn DiagnosticsSink) -> Result<(), Report> {
    for stale in self.stale_edges_below(edge) {
      self.compute_node(stale, sink)?;
    }
    Ok(())
  }

  /// Edges in the subtree of `edge` whose partial likelihoods need computing, children before parents
  fn stale_edges_below(&self, edge: EdgeKey) -> Vec<EdgeKey> {
    let mut order = vec![];
    let mut stack = vec![(edge, false)];
    while let Some((edge, expanded)) = stack.pop() {
      if expanded {
        order.push(edge);
        continue;
      }
      let current = self.tree.edge(edge);
      if current.is_computed() || self.tree.is_leaf(current.target()) {
        continue;
      }
      stack.push((edge, true));
      stack.extend(self.tree.child_edges(edge).map(|child| (child, false)));
    }
    order
  }

  /// Combines the children of the target of `edge`, which must be up to date
  fn compute_node(&mut self, edge: EdgeKey, sink: &mut dyn DiagnosticsSink) -> Result<(), Report> {
    let shape = NodeShape::of(&self.tree, edge)?;
    self.acquire_buffer(edge)?;
    let mut buffer = self
      .tree
      .take_partial(edge)
      .ok_or_else(|| make_internal_report!("Edge {} has no partial likelihood buffer", self.tree.edge(edge)))?;
    let mut scratch = mem::take(&mut self.scratch);

    let outcome = compute_node_partial(&kernel_context!(self), &shape, &mut buffer, &mut scratch);

    self.scratch = scratch;
    self.tree.put_partial(edge, buffer);
    let outcome =
      outcome.wrap_err_with(|| format!("When computing partial likelihoods of edge {}", self.tree.edge(edge)))?;

    let current = self.tree.edge_mut(edge);
    current.computed = true;
    current.lh_scale_factor = outcome.lh_scale_factor;

    if let Some(diagnostic) = Diagnostic::pattern_underflow(&self.patterns, &outcome.underflow) {
      sink.report(diagnostic);
    }
    Ok(())
  }

  /// Makes sure `edge` owns a buffer of the right layout. Under the per-node policy, the buffer of another edge
  /// pointing into the same node is taken over, if there is one.
  fn acquire_buffer(&mut self, edge: EdgeKey) -> Result<(), Report> {
    let (nptn, block) = (self.patterns.nptn(), self.rates.n_categories() * self.model.n_states());
    let fits = |tree: &Tree, edge: EdgeKey| tree.edge(edge).partial().is_some_and(|p| p.fits(nptn, block));
    if fits(&self.tree, edge) {
      return Ok(());
    }
    self.tree.take_partial(edge);

    if self.options.memory_mode == MemoryMode::PerNode {
      let target = self.tree.edge(edge).target();
      let donor = self
        .tree
        .incoming_edges(target)
        .find(|&other| other != edge && fits(&self.tree, other));
      if let Some(donor) = donor {
        debug!(
          "Moving partial likelihood buffer from edge {} to edge {}",
          self.tree.edge(donor),
          self.tree.edge(edge)
        );
        return self.tree.reorient_partial(donor, edge);
      }
    }

    self.tree.put_partial(edge, PartialLhBuffer::new(nptn, block));
    Ok(())
  }

  /// Log-likelihood of the tree, evaluated across the given branch
  pub fn branch_log_likelihood(&mut self, edge: EdgeKey, sink: &mut dyn DiagnosticsSink) -> Result<f64, Report> {
    let branch = BranchOrientation::of(&self.tree, edge)?;
    for required in branch.required_partials() {
      self.compute_partial_likelihood(required, sink)?;
    }

    let mut scratch = mem::take(&mut self.scratch);
    let result = branch::branch_log_likelihood(
      &kernel_context!(self),
      &branch,
      &mut scratch,
      &mut self.pattern_lh,
      &mut self.pattern_lh_cat,
    );
    self.scratch = scratch;

    let BranchLikelihood {
      mut log_likelihood,
      prob_const,
      non_finite,
    } = result.wrap_err_with(|| format!("When computing likelihood across branch {}", self.tree.edge(edge)))?;

    if let Some(diagnostic) = Diagnostic::non_finite_likelihood(&self.patterns, &non_finite) {
      sink.report(diagnostic);
    }

    if self.patterns.n_unobserved() > 0 {
      let n_observed = self.patterns.n_observed();
      log_likelihood = correct_log_likelihood(
        log_likelihood,
        prob_const,
        self.patterns.nsites(),
        &mut self.pattern_lh[..n_observed],
      )
      .map_err(|err| self.degenerate(err))?;
    }

    if !log_likelihood.is_finite() {
      return make_error!(
        "Log-likelihood across branch {} is not finite: {log_likelihood}",
        self.tree.edge(edge)
      );
    }
    Ok(log_likelihood)
  }

  /// Log-likelihood of the tree, evaluated across the branch above the root
  pub fn log_likelihood(&mut self, sink: &mut dyn DiagnosticsSink) -> Result<f64, Report> {
    self.branch_log_likelihood(self.tree.root_edge(), sink)
  }

  /// First and second derivatives of the log-likelihood with respect to the length of the given branch
  pub fn branch_derivatives(
    &mut self,
    edge: EdgeKey,
    sink: &mut dyn DiagnosticsSink,
  ) -> Result<(f64, f64), Report> {
    let branch = BranchOrientation::of(&self.tree, edge)?;
    for required in branch.required_partials() {
      self.compute_partial_likelihood(required, sink)?;
    }

    let mut scratch = mem::take(&mut self.scratch);
    let result = derivative::branch_derivatives(&kernel_context!(self), &branch, &mut scratch);
    self.scratch = scratch;
    let derivatives =
      result.wrap_err_with(|| format!("When computing derivatives along branch {}", self.tree.edge(edge)))?;

    if !derivatives.vanishing.is_empty() {
      let sites = self
        .patterns
        .sites_of_patterns(&derivatives.vanishing, crate::constants::MAX_REPORTED_SITES);
      return make_error!(
        "Likelihood vanishes at alignment sites {}: derivatives along branch {} are undefined",
        sites.iter().join(" "),
        self.tree.edge(edge)
      );
    }

    let (mut df, mut ddf) = (derivatives.df, derivatives.ddf);
    if self.patterns.n_unobserved() > 0 {
      (df, ddf) = correct_derivatives(
        (df, ddf),
        (derivatives.prob_const, derivatives.df_const, derivatives.ddf_const),
        self.patterns.nsites(),
      )
      .map_err(|err| self.degenerate(err))?;
    }

    if !(df.is_finite() && ddf.is_finite()) {
      return make_internal_error!(
        "Derivatives along branch {} are not finite: df = {df}, ddf = {ddf}",
        self.tree.edge(edge)
      );
    }
    Ok((df, ddf))
  }

  /// Dumps the tree and the model before failing on an invalid probability of unobservable patterns
  fn degenerate(&self, err: NumericallyDegenerate) -> Report {
    error!("{err}");
    error!("Tree: {}", self.tree);
    error!("Substitution model: {}", self.model);
    error!("Rate heterogeneity: {}", self.rates);
    Report::from(err)
  }
}

fn validate_inputs(tree: &Tree, patterns: &PatternTable, model: &dyn SubstitutionModel) -> Result<(), Report> {
  if tree.n_leaves() != patterns.n_leaves() {
    return make_error!(
      "Tree has {} leaves, but the alignment has {}",
      tree.n_leaves(),
      patterns.n_leaves()
    );
  }
  if model.n_states() != patterns.n_states() {
    return make_error!(
      "Substitution model '{}' has {} states, but the alignment has {}",
      model.name(),
      model.n_states(),
      patterns.n_states()
    );
  }
  let observed_sites: usize = patterns.observed().map(|p| p.frequency).sum();
  if observed_sites != patterns.nsites() {
    return make_internal_error!(
      "Pattern frequencies add up to {observed_sites}, but the alignment has {} sites",
      patterns.nsites()
    );
  }
  Ok(())
}

/// Likelihood of every pattern under the invariable-sites class: `p_invar * sum of pi(s)` over the states allowed at
/// every leaf
fn compute_ptn_invar(patterns: &PatternTable, model: &dyn SubstitutionModel, rates: &dyn RateHeterogeneity) -> Vec<f64> {
  let p_invar = rates.p_invar();
  let pi = model.stationary_frequencies();
  patterns
    .patterns()
    .iter()
    .map(|pattern| {
      if p_invar == 0.0 {
        return 0.0;
      }
      let constant: f64 = common_states(patterns.alphabet(), &pattern.states)
        .into_iter()
        .map(|s| pi[s])
        .sum();
      p_invar * constant
    })
    .collect()
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::alphabet::alphabet::{Alphabet, SeqType, StateCode};
  use crate::constants::LOG_UNDERFLOW_FLOOR;
  use crate::graph::builder::tests::five_leaf_tree;
  use crate::graph::builder::TreeBuilder;
  use crate::graph::node::NodeKind;
  use crate::likelihood::diagnostics::CollectDiagnostics;
  use crate::model::get_model::{jc69, JC69Params};
  use crate::model::rate_matrix_model::RateMatrixModel;
  use crate::rates::gamma::GammaRates;
  use crate::rates::rate_heterogeneity::UniformRate;
  use approx::{assert_abs_diff_eq, assert_ulps_eq};
  use eyre::Report;
  use lazy_static::lazy_static;
  use ndarray::{array, Array1, Array2};
  use pretty_assertions::assert_eq;
  use rstest::rstest;
  use std::fmt::{Display, Formatter};

  lazy_static! {
    static ref NONREVERSIBLE_RATES: Array2<f64> = array![
      [0.0, 0.3, 1.2, 0.4],
      [0.6, 0.0, 0.2, 1.5],
      [0.9, 0.5, 0.0, 0.3],
      [0.2, 1.1, 0.7, 0.0],
    ];
  }

  pub(crate) fn nonreversible_model() -> Result<RateMatrixModel, Report> {
    RateMatrixModel::new("test", Alphabet::new(SeqType::Dna)?, &NONREVERSIBLE_RATES)
  }

  fn five_leaf_patterns() -> Result<PatternTable, Report> {
    PatternTable::from_sequences(
      Alphabet::new(SeqType::Dna)?,
      &["ACGTRAC-AT", "ACGTAAGTNT", "AGGCTCGTAC", "TCGAYACTAG", "ACTTGAGTCT"],
    )
  }

  pub(crate) fn five_leaf_engine(
    rates: Box<dyn RateHeterogeneity>,
    options: KernelOptions,
  ) -> Result<PhyloLikelihood, Report> {
    PhyloLikelihood::new(
      five_leaf_tree()?,
      five_leaf_patterns()?,
      Box::new(nonreversible_model()?),
      rates,
      options,
    )
  }

  /// Root tip above node X, with leaves A and B at distances `t1` and `t2`
  pub(crate) fn cherry_engine(
    t1: f64,
    t2: f64,
    patterns: PatternTable,
    model: Box<dyn SubstitutionModel>,
  ) -> Result<PhyloLikelihood, Report> {
    let mut builder = TreeBuilder::new();
    let root = builder.add_root_tip("root")?;
    let x = builder.add_internal("X");
    let a = builder.add_leaf("A", 0);
    let b = builder.add_leaf("B", 1);
    builder.connect(root, x, 0.0)?;
    builder.connect(x, a, t1)?;
    builder.connect(x, b, t2)?;
    PhyloLikelihood::new(
      builder.build()?,
      patterns,
      model,
      Box::new(UniformRate::new()),
      KernelOptions::default(),
    )
  }

  pub(crate) fn edge_between(tree: &Tree, from: &str, to: &str) -> EdgeKey {
    tree
      .find_edge(tree.find_node(from).unwrap(), tree.find_node(to).unwrap())
      .unwrap()
  }

  /// Branches of the tree, one directed edge each
  fn branches(tree: &Tree) -> Vec<EdgeKey> {
    tree.postorder_edges()
  }

  fn log_add_exp(a: f64, b: f64) -> f64 {
    let m = a.max(b);
    if m == f64::NEG_INFINITY {
      return m;
    }
    m + ((a - m).exp() + (b - m).exp()).ln()
  }

  /// Partial likelihoods of the subtree below `edge` for one pattern: per category, a vector normalised to a maximum
  /// of one and the log of the normalisation
  fn reference_partial(engine: &PhyloLikelihood, edge: EdgeKey, ptn: usize) -> Vec<(Array1<f64>, f64)> {
    let tree = engine.tree();
    let ncat = engine.rates().n_categories();
    if let NodeKind::Leaf { leaf_index } = tree.node(tree.edge(edge).target()).kind() {
      let code = engine.patterns().state_at(ptn, *leaf_index);
      let profile = engine.patterns().alphabet().tip_profile(code);
      return vec![(profile, 0.0); ncat];
    }

    let n = engine.model().n_states();
    let mut result = vec![(Array1::<f64>::ones(n), 0.0); ncat];
    for child in tree.child_edges(edge) {
      let length = tree.edge(child).length();
      let below = reference_partial(engine, child, ptn);
      for (c, ((acc, log_scale), (vector, child_scale))) in result.iter_mut().zip(below).enumerate() {
        let p = engine.model().transition_matrix(engine.rates().rate(c) * length);
        *acc = &*acc * &p.dot(&vector);
        *log_scale += child_scale;
      }
    }
    for (vector, log_scale) in &mut result {
      let max = vector.fold(0.0, |m: f64, &v| m.max(v));
      *vector /= max;
      *log_scale += max.ln();
    }
    result
  }

  /// Log-likelihood of one pattern by plain pruning over the rooted tree, in log space
  fn reference_pattern_lh(engine: &PhyloLikelihood, ptn: usize) -> f64 {
    let pi = engine.model().stationary_frequencies();
    let top = reference_partial(engine, engine.tree().root_edge(), ptn);
    let lh = top
      .iter()
      .enumerate()
      .map(|(c, (vector, log_scale))| engine.rates().proportion(c).ln() + pi.dot(vector).ln() + log_scale)
      .fold(f64::NEG_INFINITY, log_add_exp);
    log_add_exp(lh, engine.ptn_invar()[ptn].ln())
  }

  fn reference_log_likelihood(engine: &PhyloLikelihood) -> f64 {
    let patterns = engine.patterns();
    let lnl: f64 = (0..patterns.n_observed())
      .map(|ptn| patterns.frequency(ptn) as f64 * reference_pattern_lh(engine, ptn))
      .sum();
    if patterns.n_unobserved() == 0 {
      return lnl;
    }
    let prob_const: f64 = (patterns.n_observed()..patterns.nptn())
      .map(|ptn| reference_pattern_lh(engine, ptn).exp())
      .sum();
    lnl - patterns.nsites() as f64 * (1.0 - prob_const).ln()
  }

  #[rstest]
  fn matches_cherry_closed_form() -> Result<(), Report> {
    let model = nonreversible_model()?;
    let patterns =
      PatternTable::from_patterns(model.alphabet().clone(), 2, [(vec![0, 1], 1), (vec![2, 2], 2), (vec![3, 0], 1)])?;
    let (t1, t2) = (0.13, 0.42);
    let mut engine = cherry_engine(t1, t2, patterns, Box::new(model.clone()))?;

    let p1 = model.transition_matrix(t1);
    let p2 = model.transition_matrix(t2);
    let pi = model.stationary_frequencies();
    let expected: f64 = [((0, 1), 1.0), ((2, 2), 2.0), ((3, 0), 1.0)]
      .iter()
      .map(|&((a, b), freq)| freq * (0..4).map(|s| pi[s] * p1[[s, a]] * p2[[s, b]]).sum::<f64>().ln())
      .sum();

    let mut sink = CollectDiagnostics::default();
    for edge in branches(engine.tree()) {
      let lnl = engine.branch_log_likelihood(edge, &mut sink)?;
      assert_abs_diff_eq!(lnl, expected, epsilon = 1e-12);
    }
    assert_eq!(sink.diagnostics, vec![]);
    Ok(())
  }

  #[rstest]
  fn collapses_to_reverse_transition_on_zero_branch() -> Result<(), Report> {
    let model = nonreversible_model()?;
    let patterns = PatternTable::from_patterns(model.alphabet().clone(), 2, [(vec![0, 1], 1)])?;
    let t = 0.3;
    let mut engine = cherry_engine(t, 0.0, patterns, Box::new(model.clone()))?;
    let lnl = engine.log_likelihood(&mut CollectDiagnostics::default())?;
    let expected = (model.stationary_frequencies()[1] * model.transition_matrix(t)[[1, 0]]).ln();
    assert_abs_diff_eq!(lnl, expected, epsilon = 1e-12);
    Ok(())
  }

  #[rstest]
  #[case(MemoryMode::Full)]
  #[case(MemoryMode::PerNode)]
  fn agrees_across_branches_and_with_reference(#[case] memory_mode: MemoryMode) -> Result<(), Report> {
    let rates = Box::new(GammaRates::new(0.7, 4, 0.0)?);
    let mut engine = five_leaf_engine(rates, KernelOptions { memory_mode })?;
    let expected = reference_log_likelihood(&engine);

    let mut sink = CollectDiagnostics::default();
    for edge in branches(engine.tree()) {
      let lnl = engine.branch_log_likelihood(edge, &mut sink)?;
      assert_abs_diff_eq!(lnl, expected, epsilon = 1e-10);
      let reverse = engine.tree().edge(edge).reverse();
      assert_abs_diff_eq!(engine.branch_log_likelihood(reverse, &mut sink)?, expected, epsilon = 1e-10);
    }
    Ok(())
  }

  #[rstest]
  fn keeps_one_buffer_per_node() -> Result<(), Report> {
    let count_buffers = |engine: &PhyloLikelihood| engine.tree().edges().iter().filter(|e| e.has_partial()).count();

    let mut full = five_leaf_engine(Box::new(UniformRate::new()), KernelOptions::default())?;
    let mut per_node = five_leaf_engine(
      Box::new(UniformRate::new()),
      KernelOptions {
        memory_mode: MemoryMode::PerNode,
      },
    )?;
    let mut sink = CollectDiagnostics::default();
    for edge in branches(full.tree()) {
      let expected = full.branch_log_likelihood(edge, &mut sink)?;
      assert_ulps_eq!(per_node.branch_log_likelihood(edge, &mut sink)?, expected);
    }

    // edges into X, Y and Z
    assert_eq!(count_buffers(&full), 10);
    assert_eq!(count_buffers(&per_node), 3);
    Ok(())
  }

  #[rstest]
  fn includes_invariant_sites() -> Result<(), Report> {
    let rates = Box::new(GammaRates::new(1.3, 3, 0.2)?);
    let mut engine = five_leaf_engine(rates, KernelOptions::default())?;

    // only the eighth column ("-TTTT") is constant
    assert!(engine.ptn_invar().iter().any(|&p| p > 0.0));
    assert!(engine.ptn_invar().iter().any(|&p| p == 0.0));

    let expected = reference_log_likelihood(&engine);
    let lnl = engine.log_likelihood(&mut CollectDiagnostics::default())?;
    assert_abs_diff_eq!(lnl, expected, epsilon = 1e-10);
    Ok(())
  }

  #[rstest]
  fn frequencies_add_up_to_sites() -> Result<(), Report> {
    let engine = five_leaf_engine(Box::new(UniformRate::new()), KernelOptions::default())?;
    let total: f64 = engine.frequencies.iter().sum();
    assert_eq!(total, engine.patterns().nsites() as f64);
    assert_eq!(engine.patterns().nsites(), 10);
    Ok(())
  }

  #[rstest]
  fn updates_after_branch_length_change() -> Result<(), Report> {
    let mut engine = five_leaf_engine(Box::new(UniformRate::new()), KernelOptions::default())?;
    let mut sink = CollectDiagnostics::default();
    let before = engine.log_likelihood(&mut sink)?;

    let branch = edge_between(engine.tree(), "Y", "C");
    engine.set_branch_length(branch, 0.9)?;
    let after = engine.log_likelihood(&mut sink)?;
    assert!((after - before).abs() > 1e-6);
    assert_abs_diff_eq!(after, reference_log_likelihood(&engine), epsilon = 1e-10);

    let mut fresh = five_leaf_engine(Box::new(UniformRate::new()), KernelOptions::default())?;
    fresh.set_branch_length(edge_between(fresh.tree(), "C", "Y"), 0.9)?;
    assert_ulps_eq!(fresh.log_likelihood(&mut sink)?, after);
    Ok(())
  }

  #[rstest]
  fn recomputes_after_model_change() -> Result<(), Report> {
    let mut engine = five_leaf_engine(Box::new(UniformRate::new()), KernelOptions::default())?;
    let mut sink = CollectDiagnostics::default();
    engine.log_likelihood(&mut sink)?;

    engine.set_model(Box::new(jc69(JC69Params::default())?))?;
    let lnl = engine.log_likelihood(&mut sink)?;
    assert_abs_diff_eq!(lnl, reference_log_likelihood(&engine), epsilon = 1e-10);

    engine.set_rates(Box::new(GammaRates::new(0.5, 4, 0.0)?));
    let lnl = engine.log_likelihood(&mut sink)?;
    assert_abs_diff_eq!(lnl, reference_log_likelihood(&engine), epsilon = 1e-10);
    assert_eq!(engine.pattern_lh_cat().len(), engine.patterns().nptn() * 4);
    Ok(())
  }

  #[rstest]
  fn rejects_mismatched_inputs() -> Result<(), Report> {
    let patterns = PatternTable::from_sequences(Alphabet::new(SeqType::Dna)?, &["AC", "AG", "TT"])?;
    let result = PhyloLikelihood::new(
      five_leaf_tree()?,
      patterns,
      Box::new(nonreversible_model()?),
      Box::new(UniformRate::new()),
      KernelOptions::default(),
    );
    assert!(result.is_err());
    Ok(())
  }

  /// Caterpillar tree: each internal node carries one leaf and the next internal node, the last one two leaves
  fn caterpillar_engine(n_leaves: usize, length: f64) -> Result<PhyloLikelihood, Report> {
    let mut builder = TreeBuilder::new();
    let mut parent = builder.add_root_tip("root")?;
    let mut parent_length = 0.0;
    for i in 0..n_leaves - 1 {
      let internal = builder.add_internal(format!("I{i}"));
      builder.connect(parent, internal, parent_length)?;
      let leaf = builder.add_leaf(format!("L{i}"), i);
      builder.connect(internal, leaf, length)?;
      parent = internal;
      parent_length = length;
    }
    let last = builder.add_leaf(format!("L{}", n_leaves - 1), n_leaves - 1);
    builder.connect(parent, last, length)?;

    let column = |shift: usize| (0..n_leaves).map(|i| ((i * 7 + shift) % 4) as StateCode).collect_vec();
    let patterns = PatternTable::from_sites(
      Alphabet::new(SeqType::Dna)?,
      n_leaves,
      &[column(0), column(1), column(0)],
    )?;
    PhyloLikelihood::new(
      builder.build()?,
      patterns,
      Box::new(nonreversible_model()?),
      Box::new(UniformRate::new()),
      KernelOptions::default(),
    )
  }

  #[rstest]
  fn rescales_deep_trees() -> Result<(), Report> {
    let mut engine = caterpillar_engine(800, 1.0)?;
    let mut sink = CollectDiagnostics::default();
    let lnl = engine.log_likelihood(&mut sink)?;

    // far below the smallest double
    let per_site = reference_pattern_lh(&engine, 0);
    assert!(per_site < (1e-300_f64).ln());

    let expected = reference_log_likelihood(&engine);
    assert_abs_diff_eq!(lnl, expected, epsilon = 1e-9 * expected.abs());
    assert!(engine.tree().edge(engine.tree().root_edge()).lh_scale_factor() < 0.0);
    assert_eq!(sink.diagnostics, vec![]);

    let terminal = edge_between(engine.tree(), "I400", "L400");
    assert_abs_diff_eq!(
      engine.branch_log_likelihood(terminal, &mut sink)?,
      expected,
      epsilon = 1e-9 * expected.abs()
    );
    Ok(())
  }

  fn star_engine(states: [StateCode; 3]) -> Result<PhyloLikelihood, Report> {
    let mut builder = TreeBuilder::new();
    let root = builder.add_root_tip("root")?;
    let x = builder.add_internal("X");
    builder.connect(root, x, 0.0)?;
    for (i, name) in ["A", "B", "C"].iter().enumerate() {
      let leaf = builder.add_leaf(*name, i);
      builder.connect(x, leaf, 0.0)?;
    }
    let patterns = PatternTable::from_patterns(Alphabet::new(SeqType::Dna)?, 3, [(states.to_vec(), 1)])?;
    PhyloLikelihood::new(
      builder.build()?,
      patterns,
      Box::new(jc69(JC69Params::default())?),
      Box::new(UniformRate::new()),
      KernelOptions::default(),
    )
  }

  #[rstest]
  fn star_with_identical_leaves() -> Result<(), Report> {
    let mut engine = star_engine([2, 2, 2])?;
    let mut sink = CollectDiagnostics::default();
    for edge in branches(engine.tree()) {
      assert_ulps_eq!(engine.branch_log_likelihood(edge, &mut sink)?, 0.25_f64.ln(), max_ulps = 8);
    }
    assert_eq!(sink.diagnostics, vec![]);
    Ok(())
  }

  #[rstest]
  fn star_with_mismatch_hits_underflow_floor() -> Result<(), Report> {
    let mut engine = star_engine([0, 1, 1])?;

    let mut sink = CollectDiagnostics::default();
    let lnl = engine.log_likelihood(&mut sink)?;
    assert_abs_diff_eq!(lnl, LOG_UNDERFLOW_FLOOR, epsilon = 1e-9);
    assert_eq!(
      sink.diagnostics,
      vec![Diagnostic::PatternUnderflow {
        sites: vec![1],
        truncated: false
      }]
    );

    let mut sink = CollectDiagnostics::default();
    let terminal = edge_between(engine.tree(), "X", "A");
    let lnl = engine.branch_log_likelihood(terminal, &mut sink)?;
    assert_abs_diff_eq!(lnl, LOG_UNDERFLOW_FLOOR, epsilon = 1e-9);
    assert_eq!(engine.pattern_lh()[0], LOG_UNDERFLOW_FLOOR);
    assert_eq!(
      sink.diagnostics,
      vec![Diagnostic::NonFiniteLikelihood {
        sites: vec![1],
        truncated: false
      }]
    );
    Ok(())
  }

  fn variable_patterns() -> Result<PatternTable, Report> {
    let mut patterns = PatternTable::from_sequences(
      Alphabet::new(SeqType::Dna)?,
      &["ACGTACGTAC", "CAGTTCGAAC", "AGCCTAGTCA", "TCGAGACTAG", "ACTTGAGTCT"],
    )?;
    patterns.add_unobserved_constant_patterns()?;
    Ok(patterns)
  }

  #[rstest]
  fn corrects_for_unobservable_patterns() -> Result<(), Report> {
    let mut engine = PhyloLikelihood::new(
      five_leaf_tree()?,
      variable_patterns()?,
      Box::new(nonreversible_model()?),
      Box::new(GammaRates::new(0.8, 2, 0.0)?),
      KernelOptions::default(),
    )?;
    assert_eq!(engine.patterns().n_unobserved(), 4);

    let expected = reference_log_likelihood(&engine);
    let mut sink = CollectDiagnostics::default();
    for edge in branches(engine.tree()) {
      assert_abs_diff_eq!(engine.branch_log_likelihood(edge, &mut sink)?, expected, epsilon = 1e-10);
    }

    // corrected pattern log-likelihoods add up to the corrected total
    let patterns = engine.patterns();
    let total: f64 = (0..patterns.n_observed())
      .map(|ptn| patterns.frequency(ptn) as f64 * engine.pattern_lh()[ptn])
      .sum();
    assert_abs_diff_eq!(total, expected, epsilon = 1e-10);
    Ok(())
  }

  #[rstest]
  fn correction_is_noop_without_unobservable_patterns() -> Result<(), Report> {
    let model = nonreversible_model()?;
    let patterns = PatternTable::from_patterns(model.alphabet().clone(), 2, [(vec![0, 1], 3)])?;
    let mut engine = cherry_engine(0.2, 0.3, patterns, Box::new(model.clone()))?;
    let lnl = engine.log_likelihood(&mut CollectDiagnostics::default())?;
    let raw: f64 = (0..4)
      .map(|s| model.stationary_frequencies()[s] * model.transition_matrix(0.2)[[s, 0]] * model.transition_matrix(0.3)[[s, 1]])
      .sum();
    assert_eq!(lnl, 3.0 * engine.pattern_lh()[0]);
    assert_abs_diff_eq!(lnl, 3.0 * raw.ln(), epsilon = 1e-12);
    Ok(())
  }

  #[rstest]
  fn reports_degenerate_correction() -> Result<(), Report> {
    let engine = PhyloLikelihood::new(
      five_leaf_tree()?,
      variable_patterns()?,
      Box::new(nonreversible_model()?),
      Box::new(UniformRate::new()),
      KernelOptions::default(),
    )?;
    let report = engine.degenerate(NumericallyDegenerate { prob_const: 1.0 });
    assert_eq!(
      report.downcast_ref::<NumericallyDegenerate>(),
      Some(&NumericallyDegenerate { prob_const: 1.0 })
    );
    Ok(())
  }

  /// Transition weights of one between all states. Every unobservable constant pattern then has a likelihood of at
  /// least one.
  #[derive(Debug)]
  struct SaturatedModel {
    pi: Array1<f64>,
  }

  impl Display for SaturatedModel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
      write!(f, "saturated, pi = {}", self.pi)
    }
  }

  impl SubstitutionModel for SaturatedModel {
    fn name(&self) -> &str {
      "saturated"
    }

    fn n_states(&self) -> usize {
      self.pi.len()
    }

    fn transition_matrix(&self, _t: f64) -> Array2<f64> {
      Array2::ones((self.n_states(), self.n_states()))
    }

    fn transition_matrix_derivatives(&self, t: f64) -> (Array2<f64>, Array2<f64>, Array2<f64>) {
      let n = self.n_states();
      (self.transition_matrix(t), Array2::zeros((n, n)), Array2::zeros((n, n)))
    }

    fn stationary_frequencies(&self) -> &Array1<f64> {
      &self.pi
    }
  }

  #[rstest]
  fn fails_when_unobservable_patterns_take_all_mass() -> Result<(), Report> {
    let mut engine = PhyloLikelihood::new(
      five_leaf_tree()?,
      variable_patterns()?,
      Box::new(SaturatedModel {
        pi: Array1::from_elem(4, 0.25),
      }),
      Box::new(UniformRate::new()),
      KernelOptions::default(),
    )?;
    let mut sink = CollectDiagnostics::default();
    let is_degenerate = |result: &Result<_, Report>| {
      result
        .as_ref()
        .err()
        .and_then(|report| report.downcast_ref::<NumericallyDegenerate>())
        .is_some_and(|err| err.prob_const >= 1.0)
    };

    assert!(is_degenerate(&engine.log_likelihood(&mut sink)));

    let edge = edge_between(engine.tree(), "Y", "C");
    assert!(is_degenerate(&engine.branch_log_likelihood(edge, &mut sink)));
    assert!(is_degenerate(&engine.branch_derivatives(edge, &mut sink).map(|(df, _)| df)));
    Ok(())
  }

  /// Log-likelihood after moving one branch to `length`
  fn lnl_at(engine: &mut PhyloLikelihood, edge: EdgeKey, length: f64) -> Result<f64, Report> {
    engine.set_branch_length(edge, length)?;
    engine.branch_log_likelihood(edge, &mut CollectDiagnostics::default())
  }

  fn derivatives_at(engine: &mut PhyloLikelihood, edge: EdgeKey, length: f64) -> Result<(f64, f64), Report> {
    engine.set_branch_length(edge, length)?;
    engine.branch_derivatives(edge, &mut CollectDiagnostics::default())
  }

  #[rstest]
  #[case("Y", "C", false)]
  #[case("X", "Y", false)]
  #[case("Z", "X", false)]
  #[case("Y", "C", true)]
  #[case("X", "Z", true)]
  fn derivatives_match_finite_differences(
    #[case] from: &str,
    #[case] to: &str,
    #[case] unobservable: bool,
  ) -> Result<(), Report> {
    let patterns = if unobservable {
      variable_patterns()?
    } else {
      five_leaf_patterns()?
    };
    let mut engine = PhyloLikelihood::new(
      five_leaf_tree()?,
      patterns,
      Box::new(nonreversible_model()?),
      Box::new(GammaRates::new(0.9, 4, 0.15)?),
      KernelOptions::default(),
    )?;
    let edge = edge_between(engine.tree(), from, to);
    let t = engine.tree().edge(edge).length();
    let h = 1e-5;

    let (df, ddf) = derivatives_at(&mut engine, edge, t)?;
    let df_numeric = (lnl_at(&mut engine, edge, t + h)? - lnl_at(&mut engine, edge, t - h)?) / (2.0 * h);
    let ddf_numeric =
      (derivatives_at(&mut engine, edge, t + h)?.0 - derivatives_at(&mut engine, edge, t - h)?.0) / (2.0 * h);

    assert_abs_diff_eq!(df, df_numeric, epsilon = 1e-5 * df.abs().max(1.0));
    assert_abs_diff_eq!(ddf, ddf_numeric, epsilon = 1e-5 * ddf.abs().max(1.0));
    Ok(())
  }

  #[rstest]
  fn refuses_derivatives_of_root_branch() -> Result<(), Report> {
    let mut engine = five_leaf_engine(Box::new(UniformRate::new()), KernelOptions::default())?;
    let root_edge = engine.tree().root_edge();
    assert!(engine
      .branch_derivatives(root_edge, &mut CollectDiagnostics::default())
      .is_err());
    Ok(())
  }

  #[rstest]
  fn refuses_undirected_tree() -> Result<(), Report> {
    let mut tree = five_leaf_tree()?;
    tree.clear_directions();
    let mut engine = PhyloLikelihood::new(
      tree,
      five_leaf_patterns()?,
      Box::new(nonreversible_model()?),
      Box::new(UniformRate::new()),
      KernelOptions::default(),
    )?;
    assert!(engine.log_likelihood(&mut CollectDiagnostics::default()).is_err());
    Ok(())
  }

  #[rstest]
  fn is_deterministic_across_thread_counts() -> Result<(), Report> {
    let evaluate = |threads: usize| -> Result<(f64, (f64, f64)), Report> {
      let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
      pool.install(|| {
        let mut engine = caterpillar_engine(300, 0.4)?;
        let mut sink = CollectDiagnostics::default();
        let lnl = engine.log_likelihood(&mut sink)?;
        let edge = edge_between(engine.tree(), "I100", "I101");
        let derivatives = engine.branch_derivatives(edge, &mut sink)?;
        Ok((lnl, derivatives))
      })
    };
    let single = evaluate(1)?;
    assert_eq!(evaluate(4)?, single);
    assert_eq!(evaluate(3)?, single);
    Ok(())
  }
}
