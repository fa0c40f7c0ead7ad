use clap::Args;

#[derive(Args, Debug, Clone)]
pub struct Jobs {
  /// Number of threads evaluating site patterns in parallel. If not specified, all available CPU threads will be used.
  #[clap(global = true, display_order = 90, long, short = 'j', default_value_t = num_cpus::get())]
  pub jobs: usize,
}

impl Jobs {
  /// Configures the global thread pool
  pub fn install(&self) -> Result<(), rayon::ThreadPoolBuildError> {
    let builder = rayon::ThreadPoolBuilder::new().num_threads(self.jobs.max(1));
    if self.jobs <= 1 {
      builder.use_current_thread().build_global()
    } else {
      builder.build_global()
    }
  }
}
