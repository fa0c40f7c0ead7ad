use std::f64::consts::LN_2;

/// Partial likelihood vectors whose largest entry falls below this value are rescaled. Equals 2^-256.
pub const SCALING_THRESHOLD: f64 = 1.0 / SCALING_THRESHOLD_INVER;

/// Factor applied to a rescaled partial likelihood vector. Equals 2^256.
#[allow(clippy::excessive_precision)]
pub const SCALING_THRESHOLD_INVER: f64 = 1.157_920_892_373_161_954_235_709_850_086_879e77;

/// Natural log of `SCALING_THRESHOLD`, i.e. -256 ln 2
pub const LOG_SCALING_THRESHOLD: f64 = -256.0 * LN_2;

/// Number of threshold units charged to a pattern whose partial likelihood underflowed to exactly zero
pub const UNDERFLOW_SCALE_UNITS: u16 = 4;

/// Log-likelihood floor for a pattern that underflowed completely, 4 ln(2^-256) = ln(2^-1024)
pub const LOG_UNDERFLOW_FLOOR: f64 = UNDERFLOW_SCALE_UNITS as f64 * LOG_SCALING_THRESHOLD;

pub const MIN_BRANCH_LENGTH: f64 = 1e-6;
pub const MAX_BRANCH_LENGTH: f64 = 10.0;

/// Number of affected sites listed in a numerical warning before it is truncated with "..."
pub const MAX_REPORTED_SITES: usize = 10;
