use eyre::{Report, WrapErr};
use itertools::Itertools;
use phylokernel::alphabet::alphabet::{Alphabet, StateCode};
use phylokernel::graph::builder::ParentListEntry;
use phylokernel::likelihood::engine::KernelOptions;
use phylokernel::make_error;
use phylokernel::model::get_model::{ModelName, ModelParams};
use phylokernel::optimize::branch_length::BranchLengthOptions;
use phylokernel::patterns::pattern_table::PatternTable;
use phylokernel::rates::get_rates::RatesParams;
use serde::{Deserialize, Serialize};

/// Everything needed to evaluate the likelihood of one tree
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Problem {
  pub alignment: AlignmentInput,

  /// Nodes of the rooted tree, each referring to its parent by position in this list
  pub tree: Vec<ParentListEntry>,

  #[serde(default)]
  pub model: ModelParams,

  /// Use the state frequencies counted in the alignment as equilibrium frequencies of the model
  #[serde(default)]
  pub empirical_frequencies: bool,

  #[serde(default)]
  pub rates: RatesParams,

  /// Condition the likelihood on the absence of constant sites
  #[serde(default)]
  pub ascertainment: bool,

  #[serde(default)]
  pub kernel: KernelOptions,

  /// Optimize every branch length once, with these settings
  #[serde(default)]
  pub optimize: Option<BranchLengthOptions>,
}

/// Aligned sequences, one per leaf in the order of leaf indices, or already compressed patterns
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AlignmentInput {
  Sequences { sequences: Vec<String> },
  Patterns { patterns: Vec<PatternInput> },
}

/// One column: a character per leaf, in the order of leaf indices
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatternInput {
  pub states: String,
  pub frequency: usize,
}

impl Problem {
  pub fn pattern_table(&self) -> Result<PatternTable, Report> {
    let alphabet = Alphabet::new(self.model.seq_type)?;
    let mut patterns = match &self.alignment {
      AlignmentInput::Sequences { sequences } => PatternTable::from_sequences(alphabet, sequences)?,
      AlignmentInput::Patterns { patterns } => {
        let Some(n_leaves) = patterns.first().map(|p| p.states.chars().count()) else {
          return make_error!("Problem contains no site patterns");
        };
        let encoded: Vec<(Vec<StateCode>, usize)> = patterns
          .iter()
          .enumerate()
          .map(|(i, pattern)| {
            let states = alphabet
              .encode(&pattern.states)
              .wrap_err_with(|| format!("When reading site pattern {i} '{}'", pattern.states))?;
            Ok::<_, Report>((states, pattern.frequency))
          })
          .try_collect()?;
        PatternTable::from_patterns(alphabet, n_leaves, encoded)?
      }
    };
    if self.ascertainment {
      patterns.add_unobserved_constant_patterns()?;
    }
    Ok(patterns)
  }

  /// Model parameters, with equilibrium frequencies counted in the alignment if requested
  pub fn model_params(&self, patterns: &PatternTable) -> Result<ModelParams, Report> {
    if !self.empirical_frequencies {
      return Ok(self.model.clone());
    }
    match self.model.name {
      ModelName::F81 | ModelName::HKY85 | ModelName::GTR => Ok(ModelParams {
        pi: Some(patterns.empirical_state_frequencies().to_vec()),
        ..self.model.clone()
      }),
      name => make_error!("Model '{name}' has no equilibrium frequencies to set from the alignment"),
    }
  }
}
