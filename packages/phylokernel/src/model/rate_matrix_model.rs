use crate::alphabet::alphabet::Alphabet;
use crate::make_error;
use crate::utils::linalg::{expm, stationary_distribution};
use crate::utils::ndarray::clamp_min;
use eyre::{Report, WrapErr};
use itertools::Itertools;
use ndarray::{Array1, Array2, Axis};
use std::fmt::{Debug, Display};
use std::io::Write;

/// Tolerance for slightly negative stationary frequencies produced by the linear solve
const STATIONARY_NEGATIVE_TOLERANCE: f64 = 1e-10;

/// Continuous-time Markov model of character substitution, as seen by the likelihood kernels.
///
/// Matrices are indexed `[from][to]`, so that rows of a transition matrix sum to one.
pub trait SubstitutionModel: Debug + Display + Send + Sync {
  fn name(&self) -> &str;

  fn n_states(&self) -> usize;

  /// Transition probabilities `P(t) = exp(Qt)`
  fn transition_matrix(&self, t: f64) -> Array2<f64>;

  /// `P(t)` together with its first and second derivatives with respect to `t`
  fn transition_matrix_derivatives(&self, t: f64) -> (Array2<f64>, Array2<f64>, Array2<f64>);

  fn stationary_frequencies(&self) -> &Array1<f64>;
}

/// Substitution model defined by an arbitrary, possibly non-reversible, rate matrix.
///
/// The matrix is normalised to one expected substitution per unit time at stationarity.
#[derive(Clone, Debug)]
pub struct RateMatrixModel {
  name: String,
  alphabet: Alphabet,
  q: Array2<f64>,
  q2: Array2<f64>,
  pi: Array1<f64>,
  is_reversible: bool,
}

impl RateMatrixModel {
  /// Creates the model from off-diagonal rates `rates[from][to]`. The diagonal of the input is ignored.
  pub fn new(name: impl Into<String>, alphabet: Alphabet, rates: &Array2<f64>) -> Result<Self, Report> {
    let name = name.into();
    Self::new_impl(&name, alphabet, rates).wrap_err_with(|| format!("When creating substitution model '{name}'"))
  }

  fn new_impl(name: &str, alphabet: Alphabet, rates: &Array2<f64>) -> Result<Self, Report> {
    let n = alphabet.n_states();
    if rates.shape() != [n, n] {
      return make_error!(
        "Rate matrix has shape {:?}, but the alphabet has {n} states",
        rates.shape()
      );
    }

    let mut q = rates.to_owned();
    for ((i, j), &r) in q.indexed_iter() {
      if i != j && !(r.is_finite() && r >= 0.0) {
        return make_error!("Rate from state {i} to state {j} must be finite and non-negative, but found {r}");
      }
    }
    q.diag_mut().fill(0.0);
    let diag = -q.sum_axis(Axis(1));
    q.diag_mut().assign(&diag);

    let pi = stationary_distribution(&q).wrap_err("When computing stationary frequencies")?;
    if pi.iter().any(|&p| !p.is_finite() || p < -STATIONARY_NEGATIVE_TOLERANCE) {
      return make_error!(
        "Rate matrix has no valid stationary distribution (found {pi}). Is the chain irreducible?"
      );
    }
    let pi = clamp_min(&pi, 0.0);
    let pi = &pi / pi.sum();

    let total_rate = -(&pi * &q.diag()).sum();
    if total_rate <= 0.0 {
      return make_error!("Rate matrix has zero total substitution rate");
    }
    let q = q / total_rate;
    let q2 = q.dot(&q);

    let flux = &q * &pi.view().insert_axis(Axis(1));
    let is_reversible = flux.iter().zip(flux.t().iter()).all(|(a, b)| (a - b).abs() < 1e-12);

    Ok(Self {
      name: name.to_owned(),
      alphabet,
      q,
      q2,
      pi,
      is_reversible,
    })
  }

  #[inline]
  pub const fn alphabet(&self) -> &Alphabet {
    &self.alphabet
  }

  /// Normalised rate matrix, rows sum to zero
  #[inline]
  pub const fn rate_matrix(&self) -> &Array2<f64> {
    &self.q
  }

  /// Whether the model satisfies detailed balance
  #[inline]
  pub const fn is_reversible(&self) -> bool {
    self.is_reversible
  }

  pub fn print<W: Write>(&self, w: &mut W) -> Result<(), Report> {
    writeln!(w, "Model: {} ({} states)", self.name, self.alphabet.n_states())?;
    writeln!(w, "Stationary frequencies: {}", self.pi.iter().map(|p| format!("{p:.6}")).join(" "))?;
    writeln!(w, "Rate matrix (from -> to):")?;
    for row in self.q.rows() {
      writeln!(w, "  {}", row.iter().map(|x| format!("{x:>10.6}")).join(" "))?;
    }
    Ok(())
  }
}

impl SubstitutionModel for RateMatrixModel {
  fn name(&self) -> &str {
    &self.name
  }

  fn n_states(&self) -> usize {
    self.alphabet.n_states()
  }

  fn transition_matrix(&self, t: f64) -> Array2<f64> {
    clamp_min(&expm(&(&self.q * t)), 0.0)
  }

  fn transition_matrix_derivatives(&self, t: f64) -> (Array2<f64>, Array2<f64>, Array2<f64>) {
    let p = clamp_min(&expm(&(&self.q * t)), 0.0);
    let dp = self.q.dot(&p);
    let ddp = self.q2.dot(&p);
    (p, dp, ddp)
  }

  fn stationary_frequencies(&self) -> &Array1<f64> {
    &self.pi
  }
}

impl Display for RateMatrixModel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut buf = vec![];
    self.print(&mut buf).map_err(|_| std::fmt::Error)?;
    write!(f, "{}", String::from_utf8_lossy(&buf))
  }
}
