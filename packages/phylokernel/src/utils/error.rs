use eyre::Report;

/// Flattens the chain of causes of a report into a single line
pub fn report_to_string(report: &Report) -> String {
  report.chain().map(ToString::to_string).collect::<Vec<_>>().join(": ")
}

#[macro_export(local_inner_macros)]
macro_rules! make_error {
  ($($arg:tt)*) => {
    {
      Err(eyre::eyre!(std::format!($($arg)*)))
    }
  };
}

pub use make_error;

#[macro_export(local_inner_macros)]
macro_rules! make_report {
  ($($arg:tt)*) => {
    {
      eyre::eyre!($($arg)*)
    }
  };
}

pub use make_report;

/// Error for broken caller contracts (stale buffers, missing orientation, etc.), as opposed to bad input data
#[macro_export(local_inner_macros)]
macro_rules! make_internal_error {
  ($($arg:tt)*) => {
    {
      let msg_external = std::format!($($arg)*);
      let msg = std::format!("{msg_external}. This is an internal error. Please report it to developers.");
      Err(eyre::eyre!(msg))
    }
  };
}

pub use make_internal_error;

#[macro_export(local_inner_macros)]
macro_rules! make_internal_report {
  ($($arg:tt)*) => {
    {
      let msg_external = std::format!($($arg)*);
      let msg = std::format!("{msg_external}. This is an internal error. Please report it to developers.");
      eyre::eyre!(msg)
    }
  };
}

pub use make_internal_report;
