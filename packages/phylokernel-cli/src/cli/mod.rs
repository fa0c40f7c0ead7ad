pub mod jobs;
pub mod phylokernel_cli;
pub mod verbosity;
