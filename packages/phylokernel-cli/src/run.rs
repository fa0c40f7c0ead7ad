use crate::problem::Problem;
use eyre::{Report, WrapErr};
use log::{info, warn};
use phylokernel::graph::builder::tree_from_parent_list;
use phylokernel::graph::edge::EdgeKey;
use phylokernel::graph::tree::Tree;
use phylokernel::likelihood::diagnostics::{Diagnostic, DiagnosticsSink};
use phylokernel::likelihood::engine::PhyloLikelihood;
use phylokernel::model::get_model::get_model;
use phylokernel::optimize::branch_length::optimize_all_branches;
use phylokernel::rates::get_rates::get_rates;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchResult {
  /// Directed edge the values were evaluated on, "parent -> child"
  pub branch: String,
  pub length: f64,
  pub log_likelihood: f64,

  /// First and second derivatives with respect to the branch length. Absent for the branch above the root.
  pub df: Option<f64>,
  pub ddf: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimizedBranchResult {
  pub branch: String,
  pub initial_length: f64,
  pub length: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResult {
  pub model: String,
  pub rates: String,
  pub n_patterns: usize,
  pub n_sites: usize,
  pub frac_const_sites: f64,
  pub log_likelihood: f64,

  /// Log-likelihood of the multinomial model where every pattern has its own probability, an upper bound of
  /// `log_likelihood`
  pub unconstrained_log_likelihood: f64,
  pub branches: Vec<BranchResult>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub optimized: Option<OptimizationResult>,

  /// Numerical events the kernels recovered from
  pub warnings: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimizationResult {
  pub log_likelihood: f64,
  pub branches: Vec<OptimizedBranchResult>,
  pub tree: String,
}

/// Collects diagnostics and logs each of them as a warning
#[derive(Debug, Default)]
struct WarningSink {
  diagnostics: Vec<Diagnostic>,
}

impl DiagnosticsSink for WarningSink {
  fn report(&mut self, diagnostic: Diagnostic) {
    warn!("{diagnostic}");
    self.diagnostics.push(diagnostic);
  }
}

/// Names of the end nodes of a directed edge, "source -> target"
fn branch_name(tree: &Tree, edge: EdgeKey) -> String {
  let edge = tree.edge(edge);
  format!("{} -> {}", tree.node(edge.source()).name(), tree.node(edge.target()).name())
}

pub fn run_problem(problem: &Problem) -> Result<RunResult, Report> {
  let patterns = problem.pattern_table().wrap_err("When reading alignment")?;
  let tree = tree_from_parent_list(&problem.tree)?;
  let model = get_model(&problem.model_params(&patterns)?)?;
  let rates = get_rates(&problem.rates)?;
  let mut engine = PhyloLikelihood::new(tree, patterns, Box::new(model), rates, problem.kernel.clone())?;
  let mut sink = WarningSink::default();

  let log_likelihood = engine.log_likelihood(&mut sink)?;
  info!("Log-likelihood: {log_likelihood}");

  let root_edge = engine.tree().root_edge();
  let mut branches = vec![];
  for edge in engine.tree().postorder_edges() {
    let branch_lh = engine.branch_log_likelihood(edge, &mut sink)?;
    let (df, ddf) = if edge == root_edge {
      (None, None)
    } else {
      let (df, ddf) = engine.branch_derivatives(edge, &mut sink)?;
      (Some(df), Some(ddf))
    };
    branches.push(BranchResult {
      branch: branch_name(engine.tree(), edge),
      length: engine.tree().edge(edge).length(),
      log_likelihood: branch_lh,
      df,
      ddf,
    });
  }

  let optimized = match &problem.optimize {
    None => None,
    Some(options) => {
      let optimized = optimize_all_branches(&mut engine, options, &mut sink)?;
      let log_likelihood = engine.log_likelihood(&mut sink)?;
      info!("Log-likelihood after branch length optimization: {log_likelihood}");
      let branches = optimized
        .iter()
        .map(|branch| OptimizedBranchResult {
          branch: branch_name(engine.tree(), branch.edge),
          initial_length: branch.initial_length,
          length: branch.length,
        })
        .collect();
      Some(OptimizationResult {
        log_likelihood,
        branches,
        tree: engine.tree().to_string(),
      })
    }
  };

  Ok(RunResult {
    model: engine.model().to_string(),
    rates: engine.rates().to_string(),
    n_patterns: engine.patterns().nptn(),
    n_sites: engine.patterns().nsites(),
    frac_const_sites: engine.patterns().frac_const_sites(),
    log_likelihood,
    unconstrained_log_likelihood: engine.patterns().unconstrained_log_likelihood(),
    branches,
    optimized,
    warnings: sink.diagnostics.iter().map(ToString::to_string).collect(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;
  use indoc::indoc;
  use phylokernel::io::json::json_read_str;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  const PROBLEM: &str = indoc! {r#"
    {
      "alignment": { "sequences": ["ACGTTGCA", "ACGTAGCA", "TCGAAGCT", "TCCAAGGT"] },
      "tree": [
        { "name": "root" },
        { "name": "X", "parent": 0 },
        { "name": "Y", "parent": 1, "length": 0.05 },
        { "name": "A", "parent": 1, "length": 0.1, "leaf": 0 },
        { "name": "B", "parent": 1, "length": 0.2, "leaf": 1 },
        { "name": "C", "parent": 2, "length": 0.3, "leaf": 2 },
        { "name": "D", "parent": 2, "length": 0.4, "leaf": 3 }
      ],
      "model": { "name": "UNREST", "rates": [0.3, 1.2, 0.4, 0.6, 0.2, 1.5, 0.9, 0.5, 0.3, 0.2, 1.1, 0.7] },
      "rates": { "kind": "gamma", "alpha": 0.8, "n_categories": 4 }
    }
  "#};

  #[rstest]
  fn evaluates_every_branch() -> Result<(), Report> {
    let problem: Problem = json_read_str(PROBLEM)?;
    let result = run_problem(&problem)?;

    assert_eq!(result.n_sites, 8);
    assert!(result.log_likelihood < result.unconstrained_log_likelihood);
    assert_abs_diff_eq!(result.frac_const_sites, 0.25);
    assert_eq!(result.branches.len(), 6);
    assert!(result.optimized.is_none());
    assert_eq!(result.warnings, Vec::<String>::new());

    for branch in &result.branches {
      assert_abs_diff_eq!(branch.log_likelihood, result.log_likelihood, epsilon = 1e-10);
    }

    let root_branch = result.branches.last().map(|b| (b.branch.as_str(), b.df));
    assert_eq!(root_branch, Some(("root -> X", None)));
    assert!(result.branches[..5].iter().all(|b| b.df.is_some() && b.ddf.is_some()));
    Ok(())
  }

  #[rstest]
  fn optimizes_branches() -> Result<(), Report> {
    let mut problem: Problem = json_read_str(PROBLEM)?;
    problem.optimize = Some(Default::default());
    let result = run_problem(&problem)?;

    let optimized = result.optimized.as_ref().map(|o| (o.branches.len(), o.log_likelihood));
    let (n_branches, log_likelihood) = optimized.unwrap_or_default();
    assert_eq!(n_branches, 5);
    assert!(log_likelihood >= result.log_likelihood - 1e-9);
    Ok(())
  }

  #[rstest]
  fn fails_on_leaf_count_mismatch() -> Result<(), Report> {
    let mut problem: Problem = json_read_str(PROBLEM)?;
    problem.tree.truncate(5);
    problem.tree[2].leaf = Some(2);
    assert!(run_problem(&problem).is_err());
    Ok(())
  }
}
