use ndarray::{Array, Array2, ArrayView2, Axis, Dimension, Zip};

/// Clamp each element to at least `lower`
pub fn clamp_min<D: Dimension>(a: &Array<f64, D>, lower: f64) -> Array<f64, D> {
  a.mapv(|x| num_traits::clamp_min(x, lower))
}

/// Maximum absolute row sum (induced infinity norm)
pub fn inf_norm(a: &ArrayView2<f64>) -> f64 {
  a.map_axis(Axis(1), |row| row.iter().map(|x| x.abs()).sum::<f64>())
    .fold(0.0, |acc, &x| acc.max(x))
}

/// Writes `m` (or its transpose) into a flat row-major slice of length `n*n`
pub fn write_flat(m: &Array2<f64>, transpose: bool, scale: f64, out: &mut [f64]) {
  let n = m.nrows();
  debug_assert_eq!(out.len(), n * n);
  let view = if transpose { m.t() } else { m.view() };
  Zip::indexed(&view).for_each(|(i, j), &x| out[i * n + j] = x * scale);
}
