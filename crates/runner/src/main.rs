mod cli;
mod monitor;
mod shutdown;

use std::io::IsTerminal;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ensrun_core::config::{
    JsonParameterConfig, JsonResponseConfig, ParameterConfig, ResponseConfig,
};
use ensrun_core::{Ensemble, Experiment, MemoryStorage, RealizationState, Storage};
use ensrun_engine::{
    EnsembleExperiment, IteratedEnsembleSmoother, LocalDriver, PassThroughAnalysis,
    RunModelConfig, RunModelError, Runpaths,
};

use crate::cli::Cli;
use crate::monitor::Monitor;
use crate::shutdown::spawn_ctrl_c_handler;

/// Poll the run model while rendering the events it forwards.
async fn drive_with_monitor<F>(
    run: F,
    monitor_rx: &mut mpsc::UnboundedReceiver<String>,
    monitor: &mut Monitor,
) -> Result<Arc<dyn Ensemble>, RunModelError>
where
    F: Future<Output = Result<Arc<dyn Ensemble>, RunModelError>>,
{
    tokio::pin!(run);
    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            event = monitor_rx.recv() => {
                if let Some(event) = event {
                    monitor.handle(&event);
                }
            }
        }
    };
    while let Ok(event) = monitor_rx.try_recv() {
        monitor.handle(&event);
    }
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let parameters: Vec<Arc<dyn ParameterConfig>> = cli
        .parameters
        .iter()
        .map(|(name, file)| {
            Arc::new(JsonParameterConfig::new(name, true, file)) as Arc<dyn ParameterConfig>
        })
        .collect();
    let responses: Vec<Arc<dyn ResponseConfig>> = cli
        .responses
        .iter()
        .map(|(name, file)| {
            Arc::new(JsonResponseConfig::new(name, file)) as Arc<dyn ResponseConfig>
        })
        .collect();

    let storage: Arc<dyn Storage> =
        Arc::new(MemoryStorage::new(Experiment::new(parameters, responses)));
    let driver = Arc::new(LocalDriver::new());
    let runpaths = Runpaths::new(&cli.runpath_root);

    let ensemble_size = cli.ensemble_size as usize;
    let mut active_realizations = vec![true; ensemble_size];
    for iens in &cli.deactivate {
        match active_realizations.get_mut(*iens) {
            Some(slot) => *slot = false,
            None => anyhow::bail!(
                "--deactivate {iens} is outside the ensemble (size {ensemble_size})"
            ),
        }
    }

    let config = RunModelConfig {
        experiment_id: cli.experiment_id.clone(),
        ensemble_size,
        active_realizations,
        min_realizations: cli.min_realizations as usize,
        max_running: cli.max_running as usize,
        max_submit: cli.max_submit as usize,
        max_runtime: cli.max_runtime(),
        job_script: cli.job_script.clone(),
        num_iterations: cli.iterations as usize,
        num_retries_per_iter: cli.analysis_retries as usize,
    };
    info!(
        ensemble_size,
        max_running = config.max_running,
        iterations = config.num_iterations,
        "starting ensemble experiment"
    );

    let show_progress = !cli.no_progress && std::io::stdout().is_terminal();
    let mut monitor = Monitor::new(show_progress);
    let (monitor_tx, mut monitor_rx) = mpsc::unbounded_channel::<String>();

    let ensemble = if cli.iterations == 0 {
        let experiment = EnsembleExperiment::new(config, storage, driver, runpaths)
            .with_monitor(monitor_tx.clone());
        spawn_ctrl_c_handler(experiment.cancellation_token());
        drive_with_monitor(experiment.run(), &mut monitor_rx, &mut monitor).await?
    } else {
        let mut smoother = IteratedEnsembleSmoother::new(
            config,
            storage,
            driver,
            runpaths,
            Box::new(PassThroughAnalysis),
        )
        .with_monitor(monitor_tx.clone());
        spawn_ctrl_c_handler(smoother.cancellation_token());
        drive_with_monitor(smoother.run(), &mut monitor_rx, &mut monitor).await?
    };

    let succeeded = (0..ensemble_size)
        .filter(|iens| ensemble.state(*iens) == RealizationState::HasData)
        .count();
    println!("{succeeded}/{ensemble_size} realizations succeeded");
    Ok(())
}
