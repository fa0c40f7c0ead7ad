use crate::cli::jobs::Jobs;
use crate::cli::verbosity::Verbosity;
use clap::{Parser, ValueHint};
use eyre::Report;
use phylokernel::likelihood::engine::MemoryMode;
use phylokernel::utils::global_init::setup_logger;
use std::fmt::Debug;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "phylokernel")]
#[clap(author, version)]
#[clap(verbatim_doc_comment)]
/// Log-likelihood of a rooted phylogeny under non-reversible substitution models, and its derivatives with respect
/// to branch lengths
///
/// The problem (alignment or site patterns, tree, model, rate heterogeneity) is read as JSON. The results are
/// written as JSON.
pub struct PhylokernelArgs {
  /// Path to the JSON problem description. If not provided, it is read from standard input (stdin).
  #[clap(value_hint = ValueHint::FilePath)]
  #[clap(display_order = 1)]
  pub input: Option<PathBuf>,

  /// Path to the output JSON file. If not provided, the results are written to standard output (stdout).
  #[clap(long, short = 'o')]
  #[clap(value_hint = ValueHint::AnyPath)]
  #[clap(display_order = 2)]
  pub output: Option<PathBuf>,

  /// Optimize the length of every branch once, overriding the problem description
  #[clap(long)]
  #[clap(display_order = 3)]
  pub optimize: bool,

  /// Condition the likelihood on the absence of constant sites, overriding the problem description
  #[clap(long)]
  #[clap(display_order = 4)]
  pub ascertainment: bool,

  /// Use the state frequencies counted in the alignment as equilibrium frequencies (F81, HKY85, GTR), overriding the
  /// problem description
  #[clap(long)]
  #[clap(display_order = 5)]
  pub empirical_frequencies: bool,

  /// Allocation of partial likelihood buffers, overriding the problem description
  #[clap(long, value_enum)]
  #[clap(display_order = 6)]
  pub memory_mode: Option<MemoryModeArg>,

  /// Write indented JSON
  #[clap(long)]
  #[clap(display_order = 7)]
  pub pretty: bool,

  #[clap(flatten)]
  pub verbosity: Verbosity,

  #[clap(flatten)]
  pub jobs: Jobs,
}

#[derive(clap::ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryModeArg {
  Full,
  PerNode,
}

impl From<MemoryModeArg> for MemoryMode {
  fn from(arg: MemoryModeArg) -> Self {
    match arg {
      MemoryModeArg::Full => Self::Full,
      MemoryModeArg::PerNode => Self::PerNode,
    }
  }
}

pub fn phylokernel_parse_cli_args() -> Result<PhylokernelArgs, Report> {
  let args = PhylokernelArgs::parse();
  setup_logger(args.verbosity.get_filter_level());
  Ok(args)
}
