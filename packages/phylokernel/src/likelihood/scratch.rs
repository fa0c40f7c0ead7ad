/// Reusable working memory of the kernels: transition blocks and condensed tip vectors.
///
/// The engine owns one arena. A kernel takes it for the duration of the call and hands it back, so the vectors keep
/// their capacity across calls.
#[derive(Debug, Default)]
pub struct ScratchArena {
  pub(crate) trans: Vec<f64>,
  pub(crate) derv1: Vec<f64>,
  pub(crate) derv2: Vec<f64>,
  pub(crate) tip_lh: Vec<f64>,
  pub(crate) tip_derv1: Vec<f64>,
  pub(crate) tip_derv2: Vec<f64>,
}

impl ScratchArena {
  /// Number of floats currently reserved
  pub fn capacity(&self) -> usize {
    [
      &self.trans,
      &self.derv1,
      &self.derv2,
      &self.tip_lh,
      &self.tip_derv1,
      &self.tip_derv2,
    ]
    .iter()
    .map(|v| v.capacity())
    .sum()
  }
}

/// Resizes `v` to `len` zeros and returns it as a slice
pub(crate) fn zeroed(v: &mut Vec<f64>, len: usize) -> &mut [f64] {
  v.clear();
  v.resize(len, 0.0);
  v.as_mut_slice()
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn keeps_capacity_between_uses() {
    let mut arena = ScratchArena::default();
    zeroed(&mut arena.trans, 64)[3] = 1.0;
    let capacity = arena.capacity();
    assert!(capacity >= 64);

    let trans = zeroed(&mut arena.trans, 16);
    assert_eq!(trans, &[0.0; 16]);
    assert_eq!(arena.capacity(), capacity);
  }
}
