//! Inspired by clap-verbosity-flag:
//! https://github.com/rust-cli/clap-verbosity-flag
use clap::builder::{PossibleValuesParser, TypedValueParser};
use clap::{ArgAction, Args};
use log::LevelFilter;

#[derive(Args, Debug, Clone)]
pub struct Verbosity {
  /// Set verbosity level of console output
  #[clap(long, global = true, value_parser = PossibleValuesParser::new(["off", "error", "warn", "info", "debug", "trace"])
      .map(|s| s.parse::<LevelFilter>().unwrap_or(LevelFilter::Warn)))]
  #[clap(conflicts_with = "quiet", conflicts_with = "verbose", conflicts_with = "silent")]
  #[clap(default_value = "warn")]
  #[clap(display_order = 95)]
  pub verbosity: LevelFilter,

  /// Disable all console output. Same as `--verbosity=off`
  #[clap(long, global = true)]
  #[clap(conflicts_with = "quiet", conflicts_with = "verbose", conflicts_with = "verbosity")]
  #[clap(display_order = 96)]
  pub silent: bool,

  /// Make console output more verbose. Add multiple occurrences to increase verbosity further.
  #[clap(long, short = 'v', action = ArgAction::Count, global = true)]
  #[clap(conflicts_with = "quiet", conflicts_with = "verbosity", conflicts_with = "silent")]
  #[clap(display_order = 97)]
  pub verbose: u8,

  /// Make console output more quiet. Add multiple occurrences to make output even more quiet.
  #[clap(long, short = 'q', action = ArgAction::Count, global = true)]
  #[clap(conflicts_with = "verbose", conflicts_with = "verbosity")]
  #[clap(display_order = 98)]
  pub quiet: u8,
}

impl Verbosity {
  pub const fn get_filter_level(&self) -> LevelFilter {
    if self.silent {
      // --silent takes priority over -v and -q
      LevelFilter::Off
    } else {
      let ilevel = level_to_int(self.verbosity);
      let ilevel = ilevel.saturating_add(self.verbose);
      let ilevel = ilevel.saturating_sub(self.quiet);
      level_from_int(ilevel)
    }
  }
}

const fn level_to_int(level: LevelFilter) -> u8 {
  match level {
    LevelFilter::Off => 0,
    LevelFilter::Error => 1,
    LevelFilter::Warn => 2,
    LevelFilter::Info => 3,
    LevelFilter::Debug => 4,
    LevelFilter::Trace => 5,
  }
}

const fn level_from_int(verbosity: u8) -> LevelFilter {
  match verbosity {
    0 => LevelFilter::Off,
    1 => LevelFilter::Error,
    2 => LevelFilter::Warn,
    3 => LevelFilter::Info,
    4 => LevelFilter::Debug,
    5.. => LevelFilter::Trace,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn verbosity(verbosity: LevelFilter, verbose: u8, quiet: u8, silent: bool) -> Verbosity {
    Verbosity {
      verbosity,
      silent,
      verbose,
      quiet,
    }
  }

  #[rstest]
  #[case(verbosity(LevelFilter::Warn, 0, 0, false), LevelFilter::Warn)]
  #[case(verbosity(LevelFilter::Warn, 2, 0, false), LevelFilter::Debug)]
  #[case(verbosity(LevelFilter::Warn, 9, 0, false), LevelFilter::Trace)]
  #[case(verbosity(LevelFilter::Warn, 0, 1, false), LevelFilter::Error)]
  #[case(verbosity(LevelFilter::Error, 0, 5, false), LevelFilter::Off)]
  #[case(verbosity(LevelFilter::Trace, 0, 0, true), LevelFilter::Off)]
  fn combines_verbosity_flags(#[case] input: Verbosity, #[case] expected: LevelFilter) {
    assert_eq!(input.get_filter_level(), expected);
  }
}
