use crate::alphabet::alphabet::{Alphabet, StateCode};
use crate::{make_error, make_internal_error};
use eyre::{Report, WrapErr};
use indexmap::IndexMap;
use itertools::Itertools;
use log::debug;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Number of refinement rounds for ambiguity-aware empirical state frequencies
const EMPIRICAL_FREQ_ROUNDS: usize = 8;

/// One distinct alignment column: the state of every leaf, and how many sites share it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
  pub states: Vec<StateCode>,
  pub frequency: usize,
  pub is_constant: bool,
}

impl Pattern {
  pub fn new(alphabet: &Alphabet, states: Vec<StateCode>, frequency: usize) -> Self {
    let is_constant = !common_states(alphabet, &states).is_empty();
    Self {
      states,
      frequency,
      is_constant,
    }
  }
}

/// States compatible with every leaf of a column
pub fn common_states(alphabet: &Alphabet, states: &[StateCode]) -> Vec<usize> {
  (0..alphabet.n_states())
    .filter(|&s| states.iter().all(|&code| alphabet.allowed_states(code).contains(&s)))
    .collect()
}

/// Compressed alignment: distinct columns with frequencies, followed by an optional tail of synthetic
/// patterns which cannot be observed (used for ascertainment-bias correction).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatternTable {
  alphabet: Alphabet,
  n_leaves: usize,
  patterns: Vec<Pattern>,
  n_unobserved: usize,
  site_pattern: Vec<usize>,
}

impl PatternTable {
  /// Compresses per-site columns. Each column holds one state code per leaf.
  pub fn from_sites(alphabet: Alphabet, n_leaves: usize, columns: &[Vec<StateCode>]) -> Result<Self, Report> {
    let mut index = IndexMap::<&[StateCode], usize>::new();
    let mut site_pattern = Vec::with_capacity(columns.len());
    for (site, column) in columns.iter().enumerate() {
      if column.len() != n_leaves {
        return make_error!(
          "When compressing alignment: site {} has {} states, but there are {n_leaves} leaves",
          site + 1,
          column.len()
        );
      }
      for &code in column {
        alphabet
          .validate(code)
          .wrap_err_with(|| format!("When compressing alignment: at site {}", site + 1))?;
      }
      let n_distinct = index.len();
      let ptn = *index.entry(column.as_slice()).or_insert(n_distinct);
      site_pattern.push(ptn);
    }

    let mut frequencies = vec![0_usize; index.len()];
    for &ptn in &site_pattern {
      frequencies[ptn] += 1;
    }

    let patterns = index
      .into_keys()
      .zip(frequencies)
      .map(|(states, frequency)| Pattern::new(&alphabet, states.to_vec(), frequency))
      .collect_vec();

    debug!(
      "Compressed {} sites of {n_leaves} leaves into {} patterns",
      site_pattern.len(),
      patterns.len()
    );

    Ok(Self {
      alphabet,
      n_leaves,
      patterns,
      n_unobserved: 0,
      site_pattern,
    })
  }

  /// Compresses aligned character rows, one row per leaf
  pub fn from_sequences<S: AsRef<str>>(alphabet: Alphabet, sequences: &[S]) -> Result<Self, Report> {
    let rows: Vec<Vec<StateCode>> = sequences
      .iter()
      .enumerate()
      .map(|(leaf, seq)| {
        alphabet
          .encode(seq.as_ref())
          .wrap_err_with(|| format!("When encoding sequence of leaf {leaf}"))
      })
      .try_collect()?;

    let n_sites = rows.first().map_or(0, Vec::len);
    if let Some((leaf, row)) = rows.iter().find_position(|row| row.len() != n_sites) {
      return make_error!(
        "When compressing alignment: sequence of leaf {leaf} has length {}, but expected {n_sites}",
        row.len()
      );
    }

    let columns = (0..n_sites)
      .map(|site| rows.iter().map(|row| row[site]).collect_vec())
      .collect_vec();

    Self::from_sites(alphabet, rows.len(), &columns)
  }

  /// Builds a table from already compressed patterns. Sites are numbered pattern after pattern.
  pub fn from_patterns(
    alphabet: Alphabet,
    n_leaves: usize,
    patterns: impl IntoIterator<Item = (Vec<StateCode>, usize)>,
  ) -> Result<Self, Report> {
    let mut site_pattern = vec![];
    let patterns: Vec<Pattern> = patterns
      .into_iter()
      .enumerate()
      .map(|(ptn, (states, frequency))| {
        if states.len() != n_leaves {
          return make_error!(
            "Pattern {ptn} has {} states, but there are {n_leaves} leaves",
            states.len()
          );
        }
        if frequency == 0 {
          return make_error!("Pattern {ptn} has zero frequency");
        }
        for &code in &states {
          alphabet.validate(code).wrap_err_with(|| format!("In pattern {ptn}"))?;
        }
        site_pattern.extend(std::iter::repeat(ptn).take(frequency));
        Ok(Pattern::new(&alphabet, states, frequency))
      })
      .try_collect()?;

    Ok(Self {
      alphabet,
      n_leaves,
      patterns,
      n_unobserved: 0,
      site_pattern,
    })
  }

  /// Appends one synthetic constant pattern per state ("every leaf shows state k").
  ///
  /// These columns are excluded from the data by construction, so the likelihood is conditioned on their absence.
  /// Refused if the data contains constant columns, for which such a correction is invalid.
  pub fn add_unobserved_constant_patterns(&mut self) -> Result<(), Report> {
    if self.n_unobserved > 0 {
      return make_error!("Unobserved constant patterns were already added");
    }
    let constant_sites: usize = self.observed().filter(|p| p.is_constant).map(|p| p.frequency).sum();
    if constant_sites > 0 {
      return make_error!(
        "Cannot apply ascertainment-bias correction: the alignment contains {constant_sites} constant sites. Remove them or disable the correction."
      );
    }
    for state in 0..self.alphabet.n_states() {
      let states = vec![state as StateCode; self.n_leaves];
      self.patterns.push(Pattern {
        states,
        frequency: 0,
        is_constant: true,
      });
    }
    self.n_unobserved = self.alphabet.n_states();
    Ok(())
  }

  #[inline]
  pub const fn alphabet(&self) -> &Alphabet {
    &self.alphabet
  }

  #[inline]
  pub fn n_states(&self) -> usize {
    self.alphabet.n_states()
  }

  #[inline]
  pub const fn n_leaves(&self) -> usize {
    self.n_leaves
  }

  /// Total number of patterns, observed and synthetic
  #[inline]
  pub fn nptn(&self) -> usize {
    self.patterns.len()
  }

  #[inline]
  pub fn n_observed(&self) -> usize {
    self.patterns.len() - self.n_unobserved
  }

  #[inline]
  pub const fn n_unobserved(&self) -> usize {
    self.n_unobserved
  }

  /// Number of alignment sites, the sum of observed pattern frequencies
  #[inline]
  pub fn nsites(&self) -> usize {
    self.site_pattern.len()
  }

  #[inline]
  pub fn is_unobserved(&self, ptn: usize) -> bool {
    ptn >= self.n_observed()
  }

  #[inline]
  pub fn pattern(&self, ptn: usize) -> &Pattern {
    &self.patterns[ptn]
  }

  #[inline]
  pub fn frequency(&self, ptn: usize) -> usize {
    self.patterns[ptn].frequency
  }

  #[inline]
  pub fn is_constant(&self, ptn: usize) -> bool {
    self.patterns[ptn].is_constant
  }

  #[inline]
  pub fn state_at(&self, ptn: usize, leaf: usize) -> StateCode {
    self.patterns[ptn].states[leaf]
  }

  pub fn patterns(&self) -> &[Pattern] {
    &self.patterns
  }

  pub fn observed(&self) -> impl Iterator<Item = &Pattern> {
    self.patterns[..self.n_observed()].iter()
  }

  /// Pattern index of every site
  pub fn site_pattern(&self) -> &[usize] {
    &self.site_pattern
  }

  /// Frequencies of all patterns as floats, zero for the synthetic tail
  pub fn frequencies(&self) -> Vec<f64> {
    self.patterns.iter().map(|p| p.frequency as f64).collect()
  }

  /// Fraction of sites which are constant
  pub fn frac_const_sites(&self) -> f64 {
    let n_const: usize = self.observed().filter(|p| p.is_constant).map(|p| p.frequency).sum();
    n_const as f64 / self.nsites().max(1) as f64
  }

  /// Distinct state codes observed at a leaf, in ascending order
  pub fn leaf_states(&self, leaf: usize) -> Result<Vec<StateCode>, Report> {
    if leaf >= self.n_leaves {
      return make_internal_error!("Leaf index {leaf} is out of range (there are {} leaves)", self.n_leaves);
    }
    Ok(self.patterns.iter().map(|p| p.states[leaf]).sorted().dedup().collect())
  }

  /// One-based positions of the first `limit` alignment sites which map to any of the given patterns
  pub fn sites_of_patterns(&self, ptns: &[usize], limit: usize) -> Vec<usize> {
    let mut selected = vec![false; self.nptn()];
    for &ptn in ptns {
      if let Some(s) = selected.get_mut(ptn) {
        *s = true;
      }
    }
    self
      .site_pattern
      .iter()
      .enumerate()
      .filter(|&(_, &ptn)| selected[ptn])
      .map(|(site, _)| site + 1)
      .take(limit)
      .collect()
  }

  /// State frequencies counted over all leaves and sites. Ambiguous characters are distributed among their states
  /// in proportion to the current estimate, which is refined over a few rounds.
  pub fn empirical_state_frequencies(&self) -> Array1<f64> {
    let n_states = self.n_states();
    let profiles = (0..self.alphabet.n_codes())
      .map(|code| self.alphabet.tip_profile(code as StateCode))
      .collect_vec();

    let mut freqs = Array1::from_elem(n_states, 1.0 / n_states as f64);
    for _ in 0..EMPIRICAL_FREQ_ROUNDS {
      let mut counts = Array1::<f64>::zeros(n_states);
      for pattern in self.observed() {
        for &code in &pattern.states {
          let weighted = &profiles[code as usize] * &freqs;
          let total = weighted.sum();
          if total > 0.0 {
            counts.scaled_add(pattern.frequency as f64 / total, &weighted);
          }
        }
      }
      let total = counts.sum();
      if total <= 0.0 {
        break;
      }
      freqs = counts / total;
    }
    freqs
  }

  /// Log-likelihood of the multinomial model where every observed pattern has its own probability
  pub fn unconstrained_log_likelihood(&self) -> f64 {
    let ln_nsites = (self.nsites() as f64).ln();
    self
      .observed()
      .map(|p| {
        let freq = p.frequency as f64;
        (freq.ln() - ln_nsites) * freq
      })
      .sum()
  }
}
