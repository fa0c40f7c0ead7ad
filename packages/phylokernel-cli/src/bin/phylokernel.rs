use ctor::ctor;
use eyre::{Report, WrapErr};
use log::info;
use phylokernel::io::json::{json_read, json_read_file, json_write, JsonPretty};
use phylokernel::utils::global_init::global_init;
use phylokernel_cli::cli::phylokernel_cli::phylokernel_parse_cli_args;
use phylokernel_cli::problem::Problem;
use phylokernel_cli::run::run_problem;
use std::fs::File;
use std::io::{stdin, stdout, BufWriter};

#[ctor]
fn init() {
  global_init();
}

fn main() -> Result<(), Report> {
  let args = phylokernel_parse_cli_args()?;

  info!("{:#?}", &args);

  args.jobs.install()?;

  let mut problem: Problem = match &args.input {
    Some(input) => json_read_file(input)?,
    None => json_read(stdin().lock()).wrap_err("When reading problem from standard input")?,
  };

  if args.optimize && problem.optimize.is_none() {
    problem.optimize = Some(Default::default());
  }
  if args.ascertainment {
    problem.ascertainment = true;
  }
  if args.empirical_frequencies {
    problem.empirical_frequencies = true;
  }
  if let Some(memory_mode) = args.memory_mode {
    problem.kernel.memory_mode = memory_mode.into();
  }

  let result = run_problem(&problem)?;

  let pretty = JsonPretty(args.pretty);
  match &args.output {
    Some(output) => {
      let file = File::create(output).wrap_err_with(|| format!("When creating file '{}'", output.display()))?;
      json_write(BufWriter::new(file), &result, pretty)?;
    }
    None => {
      json_write(stdout().lock(), &result, pretty)?;
      println!();
    }
  }

  Ok(())
}
