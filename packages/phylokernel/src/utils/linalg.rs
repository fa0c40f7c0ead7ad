use crate::make_error;
use crate::utils::ndarray::inf_norm;
use eyre::Report;
use ndarray::{Array1, Array2};

const EXPM_MAX_TAYLOR_TERMS: usize = 30;
const EXPM_SCALED_NORM: f64 = 0.5;

/// Matrix exponential by scaling and squaring with a truncated Taylor series.
///
/// The argument is scaled by `2^-s` until its infinity norm is at most 0.5, at which point
/// the Taylor series converges to machine precision within a couple dozen terms.
pub fn expm(a: &Array2<f64>) -> Array2<f64> {
  let n = a.nrows();
  let norm = inf_norm(&a.view());

  let squarings = if norm > EXPM_SCALED_NORM {
    (norm / EXPM_SCALED_NORM).log2().ceil() as i32
  } else {
    0
  };
  let scaled = a / 2.0_f64.powi(squarings);

  let mut result = Array2::<f64>::eye(n);
  let mut term = Array2::<f64>::eye(n);
  for k in 1..=EXPM_MAX_TAYLOR_TERMS {
    term = term.dot(&scaled) / k as f64;
    result += &term;
    if inf_norm(&term.view()) <= f64::EPSILON * inf_norm(&result.view()) {
      break;
    }
  }

  for _ in 0..squarings {
    result = result.dot(&result);
  }
  result
}

/// Solves `a x = b` by Gaussian elimination with partial pivoting
pub fn solve(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, Report> {
  let n = a.nrows();
  if a.ncols() != n || b.len() != n {
    return make_error!(
      "Linear system dimensions mismatch: matrix is {}x{}, right-hand side has length {}",
      a.nrows(),
      a.ncols(),
      b.len()
    );
  }

  let mut m = a.to_owned();
  let mut x = b.to_owned();

  for col in 0..n {
    let pivot = (col..n)
      .max_by(|&i, &j| m[[i, col]].abs().total_cmp(&m[[j, col]].abs()))
      .unwrap_or(col);

    if m[[pivot, col]].abs() < f64::EPSILON {
      return make_error!("Linear system is singular (column {col} has no usable pivot)");
    }

    if pivot != col {
      for k in 0..n {
        m.swap([pivot, k], [col, k]);
      }
      x.swap(pivot, col);
    }

    for row in (col + 1)..n {
      let factor = m[[row, col]] / m[[col, col]];
      if factor == 0.0 {
        continue;
      }
      for k in col..n {
        m[[row, k]] -= factor * m[[col, k]];
      }
      x[row] -= factor * x[col];
    }
  }

  for row in (0..n).rev() {
    let tail: f64 = ((row + 1)..n).map(|k| m[[row, k]] * x[k]).sum();
    x[row] = (x[row] - tail) / m[[row, row]];
  }

  Ok(x)
}

/// Stationary distribution `pi` of a rate matrix: `pi Q = 0`, `sum(pi) = 1`
pub fn stationary_distribution(q: &Array2<f64>) -> Result<Array1<f64>, Report> {
  let n = q.nrows();
  let mut a = q.t().to_owned();
  a.row_mut(n - 1).fill(1.0);
  let mut b = Array1::<f64>::zeros(n);
  b[n - 1] = 1.0;
  solve(&a, &b)
}
