use crate::alphabet::alphabet::{Alphabet, StateCode};

/// Partial likelihoods of leaves: for every state code, the indicator of the states it allows.
///
/// Layout is `[code][state]`. The unknown code allows every state.
#[derive(Clone, Debug, PartialEq)]
pub struct TipTable {
  n_states: usize,
  unknown: StateCode,
  values: Vec<f64>,
}

impl TipTable {
  pub fn new(alphabet: &Alphabet) -> Self {
    let values = (0..alphabet.n_codes())
      .flat_map(|code| alphabet.tip_profile(code as StateCode).into_iter())
      .collect();
    Self {
      n_states: alphabet.n_states(),
      unknown: alphabet.unknown(),
      values,
    }
  }

  #[inline]
  pub fn get(&self, code: StateCode) -> &[f64] {
    let start = code as usize * self.n_states;
    &self.values[start..start + self.n_states]
  }

  #[inline]
  pub fn unknown(&self) -> &[f64] {
    self.get(self.unknown)
  }

  #[inline]
  pub const fn n_states(&self) -> usize {
    self.n_states
  }

  #[inline]
  pub fn n_codes(&self) -> usize {
    self.values.len() / self.n_states
  }
}

/// Folds a transition block into the tip vectors of the given codes:
/// `out[code][c][x] = sum_y trans[c][x][y] * tip[code][y]`.
///
/// `trans` is laid out `[category][from][to]` and `out` holds one `[category][state]` block per code of the alphabet.
/// Entries of codes which are not listed are left untouched.
pub(crate) fn condense_tip_vectors(
  tips: &TipTable,
  trans: &[f64],
  n_categories: usize,
  codes: impl IntoIterator<Item = StateCode>,
  out: &mut [f64],
) {
  let n = tips.n_states();
  let block = n_categories * n;
  for code in codes {
    let tip = tips.get(code);
    let vector = &mut out[code as usize * block..(code as usize + 1) * block];
    for c in 0..n_categories {
      for x in 0..n {
        let row = &trans[(c * n + x) * n..(c * n + x + 1) * n];
        vector[c * n + x] = row.iter().zip(tip).map(|(p, t)| p * t).sum();
      }
    }
  }
}
