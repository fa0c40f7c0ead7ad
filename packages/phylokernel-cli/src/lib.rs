pub mod cli;
pub mod problem;
pub mod run;
