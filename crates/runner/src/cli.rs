use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use ensrun_engine::{RunModelConfig, SchedulerConfig};

pub fn default_max_running() -> u16 {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(512) as u16
}

fn parse_named_file(input: &str) -> Result<(String, String), String> {
    let Some((name, file)) = input.split_once('=') else {
        return Err(format!("expected NAME=FILE, got {input:?}"));
    };
    let name = name.trim();
    let file = file.trim();
    if name.is_empty() || file.is_empty() {
        return Err(format!("expected NAME=FILE, got {input:?}"));
    }
    Ok((name.to_string(), file.to_string()))
}

#[derive(Debug, Clone, Parser)]
#[command(name = "ensrun", version, about = "Ensemble evaluation runner")]
pub struct Cli {
    /// Forward model executable run once per realization, in its runpath.
    #[arg(long, env = "ENSRUN_JOB_SCRIPT")]
    pub job_script: PathBuf,

    /// Number of realizations in the ensemble.
    #[arg(
        short = 'n',
        long,
        env = "ENSRUN_ENSEMBLE_SIZE",
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub ensemble_size: u32,

    /// Directory the per-realization runpaths are created under.
    #[arg(long, env = "ENSRUN_RUNPATH_ROOT", default_value = "simulations")]
    pub runpath_root: PathBuf,

    /// Maximum realizations submitting or running at once.
    #[arg(
        long,
        env = "ENSRUN_MAX_RUNNING",
        default_value_t = default_max_running(),
        value_parser = clap::value_parser!(u16).range(1..=512)
    )]
    pub max_running: u16,

    /// Submission attempts per realization.
    #[arg(
        long,
        env = "ENSRUN_MAX_SUBMIT",
        default_value_t = SchedulerConfig::DEFAULT_MAX_SUBMIT as u16,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub max_submit: u16,

    /// Wall-clock cap per realization, in seconds. 0 disables the cap.
    #[arg(long = "max-runtime", env = "ENSRUN_MAX_RUNTIME", default_value_t = 0)]
    pub max_runtime_secs: u64,

    /// Minimum successful realizations for the experiment to succeed.
    #[arg(long, env = "ENSRUN_MIN_REALIZATIONS", default_value_t = 0)]
    pub min_realizations: u32,

    /// Smoother iterations after the prior; 0 runs a single evaluation.
    #[arg(long, env = "ENSRUN_ITERATIONS", default_value_t = 0)]
    pub iterations: u32,

    /// Analysis attempts per iteration before the experiment fails.
    #[arg(
        long,
        env = "ENSRUN_ANALYSIS_RETRIES",
        default_value_t = RunModelConfig::DEFAULT_NUM_RETRIES_PER_ITER as u32,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub analysis_retries: u32,

    /// Forward-initialized parameter read back from the runpath, as
    /// `NAME=FILE` with `FILE` relative to the runpath. Repeatable.
    #[arg(long = "parameter", value_name = "NAME=FILE", value_parser = parse_named_file)]
    pub parameters: Vec<(String, String)>,

    /// Response read from the runpath, as `NAME=FILE` with `FILE` relative
    /// to the runpath. Repeatable.
    #[arg(long = "response", value_name = "NAME=FILE", value_parser = parse_named_file)]
    pub responses: Vec<(String, String)>,

    /// Realization indices to leave out of the evaluation. Repeatable.
    #[arg(long = "deactivate", value_name = "IENS")]
    pub deactivate: Vec<usize>,

    /// Identifier used as the event-source prefix.
    #[arg(long, env = "ENSRUN_EXPERIMENT_ID", default_value = "ensemble-experiment")]
    pub experiment_id: String,

    /// Print plain status lines instead of progress bars.
    #[arg(long, env = "ENSRUN_NO_PROGRESS", default_value_t = false)]
    pub no_progress: bool,
}

impl Cli {
    pub fn max_runtime(&self) -> Option<Duration> {
        (self.max_runtime_secs > 0).then(|| Duration::from_secs(self.max_runtime_secs))
    }
}
