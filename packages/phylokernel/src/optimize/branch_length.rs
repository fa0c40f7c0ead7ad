use crate::constants::{MAX_BRANCH_LENGTH, MIN_BRANCH_LENGTH};
use crate::graph::edge::EdgeKey;
use crate::likelihood::diagnostics::DiagnosticsSink;
use crate::likelihood::engine::PhyloLikelihood;
use crate::utils::error::report_to_string;
use crate::{make_error, make_report};
use argmin::core::observers::{Observe, ObserverMode};
use argmin::core::{CostFunction, Error, Executor, State, KV};
use argmin::solver::brent::BrentOpt;
use eyre::{Report, WrapErr};
use log::{debug, log_enabled};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use std::cell::RefCell;

#[derive(Clone, Debug, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchLengthOptions {
  /// Iterations of the bracketing search
  #[default = 100]
  pub max_iters: u64,

  /// Absolute tolerance of the bracketing search on the branch length
  #[default = 1e-8]
  pub tolerance: f64,

  /// Newton steps taken from the bracketed optimum
  #[default = 5]
  pub newton_steps: usize,

  /// Newton steps stop once the first derivative of the log-likelihood is smaller than this
  #[default = 1e-6]
  pub gradient_tolerance: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OptimizedBranch {
  pub edge: EdgeKey,
  pub initial_length: f64,
  pub length: f64,
  pub log_likelihood: f64,
}

/// Negative log-likelihood as a function of one branch length
struct BranchLengthCost<'a, 'b, 'c> {
  engine: RefCell<&'a mut PhyloLikelihood>,
  sink: RefCell<&'b mut dyn DiagnosticsSink>,
  edge: EdgeKey,

  /// Error of the likelihood engine, kept to be returned unchanged after the solver stops
  failure: &'c RefCell<Option<Report>>,
}

impl CostFunction for BranchLengthCost<'_, '_, '_> {
  type Param = f64;
  type Output = f64;

  fn cost(&self, x: &Self::Param) -> Result<Self::Output, Error> {
    let result = {
      let mut engine = self.engine.borrow_mut();
      let mut sink = self.sink.borrow_mut();
      log_likelihood_at(&mut **engine, self.edge, *x, &mut **sink)
    };
    match result {
      Ok(log_likelihood) => Ok(-log_likelihood),
      Err(report) => {
        let error = Error::msg(report_to_string(&report));
        *self.failure.borrow_mut() = Some(report);
        Err(error)
      }
    }
  }
}

/// Logs the branch length on every iteration
#[derive(Debug)]
struct BranchLengthObserver {
  edge: EdgeKey,
}

impl<I> Observe<I> for BranchLengthObserver
where
  I: State<Param = f64>,
{
  fn observe_init(&mut self, name: &str, state: &I, kv: &KV) -> Result<(), Error> {
    debug!("Optimizing length of branch {} with {name}", self.edge);
    self.observe_iter(state, kv)
  }

  fn observe_iter(&mut self, state: &I, _kv: &KV) -> Result<(), Error> {
    if let Some(param) = state.get_param() {
      debug!("Branch {}: iteration {}, length={param:.9}", self.edge, state.get_iter());
    }
    Ok(())
  }
}

fn log_likelihood_at(
  engine: &mut PhyloLikelihood,
  edge: EdgeKey,
  length: f64,
  sink: &mut dyn DiagnosticsSink,
) -> Result<f64, Report> {
  engine.set_branch_length(edge, length)?;
  engine.branch_log_likelihood(edge, sink)
}

/// Maximizes the log-likelihood over the length of one branch, within `[MIN_BRANCH_LENGTH, MAX_BRANCH_LENGTH]`.
///
/// Brent's method brackets the optimum, the bounds themselves are then compared against it, and Newton steps on the
/// analytic derivatives refine the result. The branch keeps the optimized length, unless the search ends at a worse
/// likelihood than it started from.
pub fn optimize_branch(
  engine: &mut PhyloLikelihood,
  edge: EdgeKey,
  options: &BranchLengthOptions,
  sink: &mut dyn DiagnosticsSink,
) -> Result<OptimizedBranch, Report> {
  let root_edge = engine.tree().root_edge();
  if edge == root_edge || engine.tree().edge(edge).reverse() == root_edge {
    return make_error!(
      "Branch {} leads to the root tip: its length is not a parameter of the likelihood",
      engine.tree().edge(edge)
    );
  }

  let initial_length = engine.tree().edge(edge).length();
  let edge_name = engine.tree().edge(edge).to_string();
  let initial_log_likelihood = engine.branch_log_likelihood(edge, sink)?;

  let (mut length, mut log_likelihood) = brent_search(engine, edge, options, sink)
    .wrap_err_with(|| format!("When optimizing length of branch {edge_name}"))?;

  // Brent's method never evaluates the ends of the interval, where the optimum often is
  for bound in [MIN_BRANCH_LENGTH, MAX_BRANCH_LENGTH] {
    let bound_log_likelihood = log_likelihood_at(engine, edge, bound, sink)?;
    if bound_log_likelihood >= log_likelihood {
      (length, log_likelihood) = (bound, bound_log_likelihood);
    }
  }

  (length, log_likelihood) = refine_newton(engine, edge, (length, log_likelihood), options, sink)
    .wrap_err_with(|| format!("When refining length of branch {edge_name}"))?;

  if log_likelihood < initial_log_likelihood {
    debug!("Branch {edge_name}: search ended at a lower log-likelihood, keeping length {initial_length}");
    length = initial_length;
    log_likelihood = initial_log_likelihood;
  }
  engine.set_branch_length(edge, length)?;
  debug!("Branch {edge_name}: length {initial_length} -> {length}, log-likelihood {log_likelihood}");

  Ok(OptimizedBranch {
    edge,
    initial_length,
    length,
    log_likelihood,
  })
}

/// Bounded Brent minimization of the negative log-likelihood. Returns the best length and its log-likelihood.
fn brent_search(
  engine: &mut PhyloLikelihood,
  edge: EdgeKey,
  options: &BranchLengthOptions,
  sink: &mut dyn DiagnosticsSink,
) -> Result<(f64, f64), Report> {
  let failure = RefCell::new(None);
  let problem = BranchLengthCost {
    engine: RefCell::new(engine),
    sink: RefCell::new(sink),
    edge,
    failure: &failure,
  };

  let solver =
    BrentOpt::new(MIN_BRANCH_LENGTH, MAX_BRANCH_LENGTH).set_tolerance(f64::EPSILON.sqrt(), options.tolerance);
  let max_iters = options.max_iters;
  let mut executor = Executor::new(problem, solver).configure(|state| state.max_iters(max_iters));
  if log_enabled!(log::Level::Debug) {
    executor = executor.add_observer(BranchLengthObserver { edge }, ObserverMode::Always);
  }

  let result = executor.run();
  if let Some(report) = failure.take() {
    return Err(report);
  }
  let result = result.map_err(|err| make_report!("{err}"))?;

  let length = result
    .state()
    .get_best_param()
    .copied()
    .ok_or_else(|| make_report!("Brent solver returned no branch length"))?;
  let log_likelihood = -result.state().get_best_cost();
  Ok((length, log_likelihood))
}

/// Newton-Raphson steps from a bracketed optimum. A step is taken only where the log-likelihood is concave, is clamped
/// to the allowed lengths, and is kept only if it increases the log-likelihood.
fn refine_newton(
  engine: &mut PhyloLikelihood,
  edge: EdgeKey,
  (mut length, mut log_likelihood): (f64, f64),
  options: &BranchLengthOptions,
  sink: &mut dyn DiagnosticsSink,
) -> Result<(f64, f64), Report> {
  for _ in 0..options.newton_steps {
    engine.set_branch_length(edge, length)?;
    let (df, ddf) = engine.branch_derivatives(edge, sink)?;
    if df.abs() < options.gradient_tolerance || ddf >= 0.0 {
      break;
    }

    let next = (length - df / ddf).clamp(MIN_BRANCH_LENGTH, MAX_BRANCH_LENGTH);
    let next_log_likelihood = log_likelihood_at(engine, edge, next, sink)?;
    if next_log_likelihood <= log_likelihood {
      break;
    }
    (length, log_likelihood) = (next, next_log_likelihood);
  }
  Ok((length, log_likelihood))
}

/// Optimizes every branch once, in post-order. The virtual branch above the root is left alone.
pub fn optimize_all_branches(
  engine: &mut PhyloLikelihood,
  options: &BranchLengthOptions,
  sink: &mut dyn DiagnosticsSink,
) -> Result<Vec<OptimizedBranch>, Report> {
  let root_edge = engine.tree().root_edge();
  let edges = engine
    .tree()
    .postorder_edges()
    .into_iter()
    .filter(|&edge| edge != root_edge)
    .collect::<Vec<_>>();
  edges
    .into_iter()
    .map(|edge| optimize_branch(engine, edge, options, sink))
    .collect()
}
