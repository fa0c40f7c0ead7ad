use crate::alphabet::alphabet::{Alphabet, SeqType};
use crate::make_error;
use crate::model::rate_matrix_model::RateMatrixModel;
use eyre::{Report, WrapErr};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use strum_macros::Display;

#[derive(Copy, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, SmartDefault, Display, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelName {
  #[default]
  JC69,
  F81,
  K80,
  HKY85,
  GTR,
  UNREST,
}

/// Model choice and parameters, as found in a problem description
#[derive(Clone, Debug, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
  pub name: ModelName,

  #[default(SeqType::Dna)]
  pub seq_type: SeqType,

  /// Transition/transversion rate ratio (K80, HKY85)
  #[default = 2.0]
  pub kappa: f64,

  /// Equilibrium frequencies (F81, HKY85, GTR)
  pub pi: Option<Vec<f64>>,

  /// Exchangeabilities in upper-triangle order (GTR) or all off-diagonal rates in row order (UNREST)
  pub rates: Option<Vec<f64>>,
}

pub fn get_model(params: &ModelParams) -> Result<RateMatrixModel, Report> {
  let ModelParams {
    name,
    seq_type,
    kappa,
    pi,
    rates,
  } = params.clone();

  match name {
    ModelName::JC69 => jc69(JC69Params { seq_type }),
    ModelName::F81 => f81(F81Params { seq_type, pi }),
    ModelName::K80 => k80(K80Params { kappa }),
    ModelName::HKY85 => hky85(HKY85Params { kappa, pi }),
    ModelName::GTR => gtr(GTRParams {
      seq_type,
      exchangeabilities: rates,
      pi,
    }),
    ModelName::UNREST => unrest(UnrestParams { seq_type, rates }),
  }
  .wrap_err_with(|| format!("When creating model '{name}' for {seq_type} data"))
}

#[derive(Copy, Clone, Debug, SmartDefault)]
pub struct JC69Params {
  #[default(SeqType::Dna)]
  pub seq_type: SeqType,
}

/// Jukes-Cantor 1969 model: equal frequencies and equal rates between all states.
///
/// See: Jukes and Cantor (1969). Evolution of Protein Molecules. New York: Academic Press. pp. 21–132
pub fn jc69(JC69Params { seq_type }: JC69Params) -> Result<RateMatrixModel, Report> {
  let alphabet = Alphabet::new(seq_type)?;
  let n = alphabet.n_states();
  let pi = Array1::from_elem(n, 1.0 / n as f64);
  let w = Array2::<f64>::ones((n, n));
  RateMatrixModel::new("JC69", alphabet, &reversible_rates(&w, &pi))
}

#[derive(Clone, Debug, SmartDefault)]
pub struct F81Params {
  #[default(SeqType::Dna)]
  pub seq_type: SeqType,

  /// Equilibrium frequencies, uniform if not given
  pub pi: Option<Vec<f64>>,
}

/// Felsenstein 1981 model: arbitrary frequencies, equal exchangeabilities.
///
/// See: Felsenstein (1981), J. Mol. Evol. 17 (6): 368–376. doi:10.1007/BF01734359
pub fn f81(F81Params { seq_type, pi }: F81Params) -> Result<RateMatrixModel, Report> {
  let alphabet = Alphabet::new(seq_type)?;
  let n = alphabet.n_states();
  let pi = frequencies_or_uniform(pi, n)?;
  let w = Array2::<f64>::ones((n, n));
  RateMatrixModel::new("F81", alphabet, &reversible_rates(&w, &pi))
}

#[derive(Copy, Clone, Debug, SmartDefault)]
pub struct K80Params {
  /// Ratio of transition/transversion rates
  #[default = 2.0]
  pub kappa: f64,
}

/// Kimura 1980 model: equal nucleotide frequencies, distinct transition and transversion rates.
///
/// See: Kimura (1980), J. Mol. Evol. 16 (2): 111–120. doi:10.1007/BF01731581.
pub fn k80(K80Params { kappa }: K80Params) -> Result<RateMatrixModel, Report> {
  let alphabet = Alphabet::new(SeqType::Dna)?;
  let pi = Array1::from_elem(4, 0.25);
  let w = transition_transversion_exchangeabilities(kappa)?;
  RateMatrixModel::new("K80", alphabet, &reversible_rates(&w, &pi))
}

#[derive(Clone, Debug, SmartDefault)]
pub struct HKY85Params {
  /// Ratio of transition/transversion rates
  #[default = 2.0]
  pub kappa: f64,

  /// Equilibrium frequencies, uniform if not given
  pub pi: Option<Vec<f64>>,
}

/// Hasegawa, Kishino and Yano 1985 model: arbitrary nucleotide frequencies (as in F81) and distinct
/// transition and transversion rates (as in K80).
///
/// See: Hasegawa, Kishino, Yano (1985), J. Mol. Evol. 22 (2): 160–174. doi:10.1007/BF02101694
pub fn hky85(HKY85Params { kappa, pi }: HKY85Params) -> Result<RateMatrixModel, Report> {
  let alphabet = Alphabet::new(SeqType::Dna)?;
  let pi = frequencies_or_uniform(pi, 4)?;
  let w = transition_transversion_exchangeabilities(kappa)?;
  RateMatrixModel::new("HKY85", alphabet, &reversible_rates(&w, &pi))
}

#[derive(Clone, Debug, SmartDefault)]
pub struct GTRParams {
  #[default(SeqType::Dna)]
  pub seq_type: SeqType,

  /// Symmetric exchangeabilities `w[i][j]` for `i < j`, in row order. All ones if not given.
  pub exchangeabilities: Option<Vec<f64>>,

  /// Equilibrium frequencies, uniform if not given
  pub pi: Option<Vec<f64>>,
}

/// General time-reversible model: `Q[i][j] = w[i][j] * pi[j]` with symmetric `w`.
///
/// See: Tavaré (1986), Lectures on Mathematics in the Life Sciences 17: 57–86
pub fn gtr(
  GTRParams {
    seq_type,
    exchangeabilities,
    pi,
  }: GTRParams,
) -> Result<RateMatrixModel, Report> {
  let alphabet = Alphabet::new(seq_type)?;
  let n = alphabet.n_states();
  let pi = frequencies_or_uniform(pi, n)?;

  let mut w = Array2::<f64>::ones((n, n));
  if let Some(exchangeabilities) = exchangeabilities {
    let n_pairs = n * (n - 1) / 2;
    if exchangeabilities.len() != n_pairs {
      return make_error!(
        "Expected {n_pairs} exchangeabilities for {n} states, but found {}",
        exchangeabilities.len()
      );
    }
    let mut values = exchangeabilities.into_iter();
    for i in 0..n {
      for j in (i + 1)..n {
        let value = values.next().unwrap_or_default();
        w[[i, j]] = value;
        w[[j, i]] = value;
      }
    }
  }

  RateMatrixModel::new("GTR", alphabet, &reversible_rates(&w, &pi))
}

#[derive(Clone, Debug, SmartDefault)]
pub struct UnrestParams {
  #[default(SeqType::Dna)]
  pub seq_type: SeqType,

  /// All off-diagonal rates `Q[i][j]`, `i != j`, in row order. All ones if not given.
  pub rates: Option<Vec<f64>>,
}

/// Unrestricted model: every off-diagonal rate is a free parameter and the process need not be reversible.
/// Stationary frequencies follow from the rates.
pub fn unrest(UnrestParams { seq_type, rates }: UnrestParams) -> Result<RateMatrixModel, Report> {
  let alphabet = Alphabet::new(seq_type)?;
  let n = alphabet.n_states();

  let mut q = Array2::<f64>::ones((n, n));
  if let Some(rates) = rates {
    let n_rates = n * (n - 1);
    if rates.len() != n_rates {
      return make_error!("Expected {n_rates} rates for {n} states, but found {}", rates.len());
    }
    let mut values = rates.into_iter();
    for i in 0..n {
      for j in (0..n).filter(|&j| j != i) {
        q[[i, j]] = values.next().unwrap_or_default();
      }
    }
  }

  RateMatrixModel::new("UNREST", alphabet, &q)
}

/// Off-diagonal rates `w[i][j] * pi[j]`
fn reversible_rates(w: &Array2<f64>, pi: &Array1<f64>) -> Array2<f64> {
  w * pi
}

/// Nucleotide exchangeabilities with transitions (A<->G, C<->T) weighted by `kappa`
fn transition_transversion_exchangeabilities(kappa: f64) -> Result<Array2<f64>, Report> {
  if !(kappa.is_finite() && kappa > 0.0) {
    return make_error!("Transition/transversion ratio must be positive, but found {kappa}");
  }
  let mut w = Array2::<f64>::ones((4, 4));
  for (i, j) in [(0, 2), (2, 0), (1, 3), (3, 1)] {
    w[[i, j]] = kappa;
  }
  Ok(w)
}

fn frequencies_or_uniform(pi: Option<Vec<f64>>, n: usize) -> Result<Array1<f64>, Report> {
  let Some(pi) = pi else {
    return Ok(Array1::from_elem(n, 1.0 / n as f64));
  };
  if pi.len() != n {
    return make_error!("Expected {n} equilibrium frequencies, but found {}", pi.len());
  }
  if pi.iter().any(|&p| !(p.is_finite() && p > 0.0)) {
    return make_error!("Equilibrium frequencies must be positive, but found {pi:?}");
  }
  let pi = Array1::from(pi);
  let sum = pi.sum();
  Ok(pi / sum)
}
