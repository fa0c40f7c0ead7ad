/// Partial likelihoods of one subtree, laid out as `[pattern][category][state]`, together with the number of
/// times each pattern was rescaled by `SCALING_THRESHOLD_INVER`.
///
/// A buffer is owned by exactly one directed edge at a time and is moved, never copied, between edges.
#[derive(Debug, Default, PartialEq)]
pub struct PartialLhBuffer {
  values: Vec<f64>,
  scale_num: Vec<u16>,
  block: usize,
}

impl PartialLhBuffer {
  pub fn new(nptn: usize, block: usize) -> Self {
    Self {
      values: vec![0.0; nptn * block],
      scale_num: vec![0; nptn],
      block,
    }
  }

  /// Whether the buffer has the layout required for the given dimensions
  #[inline]
  pub fn fits(&self, nptn: usize, block: usize) -> bool {
    self.block == block && self.scale_num.len() == nptn
  }

  /// Number of values per pattern, `n_categories * n_states`
  #[inline]
  pub const fn block(&self) -> usize {
    self.block
  }

  #[inline]
  pub fn nptn(&self) -> usize {
    self.scale_num.len()
  }

  /// Values of one pattern, `[category][state]`
  #[inline]
  pub fn pattern(&self, ptn: usize) -> &[f64] {
    &self.values[ptn * self.block..(ptn + 1) * self.block]
  }

  #[inline]
  pub fn scale_num(&self, ptn: usize) -> u16 {
    self.scale_num[ptn]
  }

  /// Mutable access to the values and the scale counters, for kernels which fill the buffer
  pub fn parts_mut(&mut self) -> (&mut [f64], &mut [u16]) {
    (&mut self.values, &mut self.scale_num)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn slices_patterns() {
    let mut buffer = PartialLhBuffer::new(3, 2);
    let (values, scale_num) = buffer.parts_mut();
    values.copy_from_slice(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    scale_num[1] = 4;

    assert_eq!(buffer.pattern(1), &[2.0, 3.0]);
    assert_eq!(buffer.scale_num(1), 4);
    assert_eq!(buffer.nptn(), 3);
    assert!(buffer.fits(3, 2));
    assert!(!buffer.fits(3, 4));
  }
}
