use crate::constants::MAX_REPORTED_SITES;
use crate::patterns::pattern_table::PatternTable;
use itertools::Itertools;
use log::warn;
use std::fmt::{Display, Formatter};

/// Numerical event worth reporting, which the kernels recovered from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Diagnostic {
  /// Partial likelihoods of whole patterns underflowed to zero and were reset
  PatternUnderflow { sites: Vec<usize>, truncated: bool },

  /// The log-likelihood was not finite and was recovered pattern by pattern
  NonFiniteLikelihood { sites: Vec<usize>, truncated: bool },
}

impl Diagnostic {
  pub fn pattern_underflow(patterns: &PatternTable, ptns: &[usize]) -> Option<Self> {
    let (sites, truncated) = affected_sites(patterns, ptns)?;
    Some(Self::PatternUnderflow { sites, truncated })
  }

  pub fn non_finite_likelihood(patterns: &PatternTable, ptns: &[usize]) -> Option<Self> {
    let (sites, truncated) = affected_sites(patterns, ptns)?;
    Some(Self::NonFiniteLikelihood { sites, truncated })
  }
}

/// First one-based alignment sites of the given patterns, and whether there were more
fn affected_sites(patterns: &PatternTable, ptns: &[usize]) -> Option<(Vec<usize>, bool)> {
  let mut sites = patterns.sites_of_patterns(ptns, MAX_REPORTED_SITES + 1);
  if sites.is_empty() {
    return None;
  }
  let truncated = sites.len() > MAX_REPORTED_SITES;
  sites.truncate(MAX_REPORTED_SITES);
  Some((sites, truncated))
}

impl Display for Diagnostic {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let (message, sites, truncated) = match self {
      Self::PatternUnderflow { sites, truncated } => ("Numerical underflow for sites", sites, truncated),
      Self::NonFiniteLikelihood { sites, truncated } => {
        ("Numerical underflow caused by alignment sites", sites, truncated)
      }
    };
    write!(f, "{message} {}", sites.iter().join(" "))?;
    if *truncated {
      write!(f, " ...")?;
    }
    Ok(())
  }
}

/// Receives the diagnostics of a kernel call
pub trait DiagnosticsSink {
  fn report(&mut self, diagnostic: Diagnostic);
}

/// Writes diagnostics to the log as warnings
#[derive(Clone, Copy, Debug, Default)]
pub struct LogDiagnostics;

impl DiagnosticsSink for LogDiagnostics {
  fn report(&mut self, diagnostic: Diagnostic) {
    warn!("{diagnostic}");
  }
}

/// Keeps diagnostics for later inspection
#[derive(Clone, Debug, Default)]
pub struct CollectDiagnostics {
  pub diagnostics: Vec<Diagnostic>,
}

impl DiagnosticsSink for CollectDiagnostics {
  fn report(&mut self, diagnostic: Diagnostic) {
    self.diagnostics.push(diagnostic);
  }
}
