use crate::make_error;
use eyre::Report;
use itertools::Itertools;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use strum_macros::Display;

/// Encoded character state of one leaf at one site.
///
/// Codes `0..n_states` are exact states. For nucleotides, codes from `n_states` upwards are
/// ambiguity codes, encoded as `bitmask + (n_states - 1)`. The largest code is "unknown"
/// (gap, `?`, `N`, `X`), which is compatible with every state.
pub type StateCode = u8;

const PROTEIN_SYMBOLS: &[char] = &[
  'A', 'R', 'N', 'D', 'C', 'Q', 'E', 'G', 'H', 'I', 'L', 'K', 'M', 'F', 'P', 'S', 'T', 'W', 'Y', 'V',
];

const DNA_AMBIGUITIES: &[(char, &[usize])] = &[
  ('R', &[0, 2]),
  ('Y', &[1, 3]),
  ('W', &[0, 3]),
  ('S', &[1, 2]),
  ('M', &[0, 1]),
  ('K', &[2, 3]),
  ('B', &[1, 2, 3]),
  ('H', &[0, 1, 3]),
  ('D', &[0, 2, 3]),
  ('V', &[0, 1, 2]),
];

#[derive(Copy, Clone, Debug, PartialEq, Eq, SmartDefault, Display, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeqType {
  Binary,
  #[default]
  Dna,
  Protein,
  Multistate(u8),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alphabet {
  seq_type: SeqType,
  n_states: usize,
  unknown: StateCode,
}

impl Default for Alphabet {
  fn default() -> Self {
    Self {
      seq_type: SeqType::Dna,
      n_states: 4,
      unknown: 18,
    }
  }
}

impl Alphabet {
  pub fn new(seq_type: SeqType) -> Result<Self, Report> {
    let (n_states, unknown) = match seq_type {
      SeqType::Binary => (2, 2),
      SeqType::Dna => (4, 4 + (1 << 4) - 2),
      SeqType::Protein => (20, 20),
      SeqType::Multistate(n) => {
        if n < 2 || n == StateCode::MAX {
          return make_error!("When creating alphabet: multistate data requires between 2 and 254 states, but got {n}");
        }
        (n as usize, n)
      }
    };
    Ok(Self {
      seq_type,
      n_states,
      unknown,
    })
  }

  #[inline]
  pub const fn seq_type(&self) -> SeqType {
    self.seq_type
  }

  #[inline]
  pub const fn n_states(&self) -> usize {
    self.n_states
  }

  /// Code of the "unknown" state (gap or fully ambiguous character)
  #[inline]
  pub const fn unknown(&self) -> StateCode {
    self.unknown
  }

  /// Total number of distinct codes, `0..=unknown`
  #[inline]
  pub const fn n_codes(&self) -> usize {
    self.unknown as usize + 1
  }

  #[inline]
  pub fn is_exact(&self, code: StateCode) -> bool {
    (code as usize) < self.n_states
  }

  #[inline]
  pub fn is_unknown(&self, code: StateCode) -> bool {
    code == self.unknown
  }

  /// Convert a raw alignment character to its state code
  pub fn state_code(&self, c: char) -> Result<StateCode, Report> {
    if matches!(c, '?' | '-' | '.') {
      return Ok(self.unknown);
    }
    let c = c.to_ascii_uppercase();
    let code = match self.seq_type {
      SeqType::Binary => match c {
        '0' => Some(0),
        '1' => Some(1),
        _ => None,
      },
      SeqType::Dna => match c {
        'A' => Some(0),
        'C' => Some(1),
        'G' => Some(2),
        'T' | 'U' => Some(3),
        'N' => Some(self.unknown),
        _ => DNA_AMBIGUITIES
          .iter()
          .find(|(symbol, _)| *symbol == c)
          .map(|(_, states)| dna_ambiguity_code(states)),
      },
      SeqType::Protein => match c {
        'X' => Some(self.unknown),
        _ => PROTEIN_SYMBOLS.iter().position(|&s| s == c).map(|i| i as StateCode),
      },
      SeqType::Multistate(_) => c
        .to_digit(36)
        .filter(|&d| (d as usize) < self.n_states)
        .map(|d| d as StateCode),
    };
    match code {
      Some(code) => Ok(code),
      None => make_error!("Character '{c}' is not valid for {} data", self.seq_type),
    }
  }

  /// States compatible with the given code
  pub fn allowed_states(&self, code: StateCode) -> Vec<usize> {
    if self.is_unknown(code) {
      return (0..self.n_states).collect();
    }
    if self.is_exact(code) {
      return vec![code as usize];
    }
    let mask = code as usize - (self.n_states - 1);
    (0..self.n_states).filter(|i| mask & (1 << i) != 0).collect()
  }

  /// Indicator vector of the states compatible with the given code
  pub fn tip_profile(&self, code: StateCode) -> Array1<f64> {
    let mut profile = Array1::<f64>::zeros(self.n_states);
    for state in self.allowed_states(code) {
      profile[state] = 1.0;
    }
    profile
  }

  /// Check that a code is representable in this alphabet
  pub fn validate(&self, code: StateCode) -> Result<(), Report> {
    let valid = if self.seq_type == SeqType::Dna {
      // single-bit masks alias exact states and are never produced
      code <= self.unknown && (self.is_exact(code) || self.allowed_states(code).len() >= 2)
    } else {
      self.is_exact(code) || self.is_unknown(code)
    };
    if !valid {
      return make_error!(
        "State code {code} is not valid for {} data (valid: 0..{}, unknown = {})",
        self.seq_type,
        self.n_states,
        self.unknown
      );
    }
    Ok(())
  }

  /// Encode a whole character row into state codes
  pub fn encode(&self, chars: &str) -> Result<Vec<StateCode>, Report> {
    chars.chars().map(|c| self.state_code(c)).try_collect()
  }
}

fn dna_ambiguity_code(states: &[usize]) -> StateCode {
  let mask: usize = states.iter().map(|s| 1 << s).sum();
  (mask + 3) as StateCode
}
