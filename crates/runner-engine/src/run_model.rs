//! Phase-level experiment loops.
//!
//! A run model builds a [`RunContext`] per iteration, hands it to a
//! [`Scheduler`], waits for every realization to reach a terminal state, and
//! decides whether the phase succeeded. The iterated smoother variant runs
//! the analysis update between iterations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ensrun_core::{Ensemble, RealizationState, RunArg, Storage};

use crate::driver::Driver;
use crate::job::{Realization, State};
use crate::scheduler::{Scheduler, SchedulerConfig};

/// Hook points invoked at run-model boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookRuntime {
    /// Before an evaluation phase starts.
    PreSimulation,
    /// After an evaluation phase completes.
    PostSimulation,
    /// Once, before the first analysis update.
    PreFirstUpdate,
    /// Before each analysis update.
    PreUpdate,
    /// After each successful analysis update.
    PostUpdate,
}

/// Runs whatever workflows are registered for a hook point.
pub trait WorkflowRunner: Send + Sync {
    /// Run the workflows for `hook`.
    fn run(&self, hook: HookRuntime) -> anyhow::Result<()>;
}

/// Workflow runner with nothing registered.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWorkflows;

impl WorkflowRunner for NoWorkflows {
    fn run(&self, _hook: HookRuntime) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The analysis step run between smoother iterations.
///
/// The mathematics live behind this seam; the run model only needs to know
/// whether conditioning the posterior on the prior worked.
pub trait AnalysisModule: Send {
    /// Condition `posterior` on `prior` for the given update index.
    fn update(
        &mut self,
        prior: &dyn Ensemble,
        posterior: &dyn Ensemble,
        iteration: usize,
    ) -> anyhow::Result<()>;
}

/// Analysis stand-in that copies the prior's parameters into the posterior
/// unchanged. Useful for plumbing tests and dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughAnalysis;

impl AnalysisModule for PassThroughAnalysis {
    fn update(
        &mut self,
        prior: &dyn Ensemble,
        posterior: &dyn Ensemble,
        _iteration: usize,
    ) -> anyhow::Result<()> {
        for config in prior.experiment().parameter_configuration() {
            for iens in 0..prior.ensemble_size() {
                if let Some(dataset) = prior.parameters(config.name(), iens) {
                    posterior.save_parameters(config.name(), iens, dataset)?;
                }
            }
        }
        Ok(())
    }
}

/// Failures that end an experiment phase.
#[derive(Debug, thiserror::Error)]
pub enum RunModelError {
    /// Fewer realizations succeeded than the experiment requires.
    #[error("{completed} realization(s) succeeded, {minimum} required")]
    InsufficientRealizations {
        /// Realizations that completed with loaded results.
        completed: usize,
        /// Configured minimum.
        minimum: usize,
    },
    /// The analysis update kept failing.
    #[error("analysis update failed for iteration {iteration} after {retries} attempt(s): {source}")]
    AnalysisFailed {
        /// Iteration whose update failed.
        iteration: usize,
        /// Attempts made.
        retries: usize,
        /// Last analysis error.
        source: anyhow::Error,
    },
    /// A workflow hook failed.
    #[error("workflow hook {hook:?} failed: {source}")]
    Hook {
        /// The hook that failed.
        hook: HookRuntime,
        /// Underlying workflow error.
        source: anyhow::Error,
    },
    /// Storage refused an operation.
    #[error(transparent)]
    Storage(#[from] ensrun_core::StorageError),
    /// Runpath directories could not be created.
    #[error("failed to materialize runpaths: {0}")]
    Runpaths(#[from] std::io::Error),
}

/// Filesystem layout of per-realization working directories.
#[derive(Debug, Clone)]
pub struct Runpaths {
    base: PathBuf,
}

impl Runpaths {
    /// Runpaths rooted at `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Working directory for one realization at one iteration.
    pub fn path(&self, iens: usize, iteration: usize) -> PathBuf {
        self.base
            .join(format!("realization-{iens}"))
            .join(format!("iter-{iteration}"))
    }

    /// Create the working directories for every active realization.
    pub fn materialize(&self, active: &[bool], iteration: usize) -> std::io::Result<()> {
        for (iens, active) in active.iter().enumerate() {
            if *active {
                std::fs::create_dir_all(self.path(iens, iteration))?;
            }
        }
        Ok(())
    }
}

/// Which realizations to evaluate, and against which ensemble, for one
/// iteration.
pub struct RunContext {
    /// Storage accessor for the ensemble being evaluated.
    pub sim_fs: Arc<dyn Ensemble>,
    /// Mask over realization indices; inactive realizations are skipped.
    pub active_realizations: Vec<bool>,
    /// Iteration number; 0 is the prior.
    pub iteration: usize,
}

/// Configuration shared by the run models.
#[derive(Debug, Clone)]
pub struct RunModelConfig {
    /// Experiment identifier; phase event sources are derived from it.
    pub experiment_id: String,
    /// Number of realizations in each ensemble.
    pub ensemble_size: usize,
    /// Initially active realizations. Shorter masks are padded with `false`.
    pub active_realizations: Vec<bool>,
    /// Minimum successful realizations for a phase to count as a success.
    pub min_realizations: usize,
    /// Concurrency cap handed to the scheduler.
    pub max_running: usize,
    /// Submission attempts per realization.
    pub max_submit: usize,
    /// Per-realization wall-clock cap; `None` or zero means unbounded.
    pub max_runtime: Option<Duration>,
    /// Forward model executable.
    pub job_script: PathBuf,
    /// Number of smoother iterations after the prior.
    pub num_iterations: usize,
    /// Analysis attempts per iteration before the phase fails.
    pub num_retries_per_iter: usize,
}

impl RunModelConfig {
    /// Default analysis retry budget per iteration.
    pub const DEFAULT_NUM_RETRIES_PER_ITER: usize = 4;

    fn initial_mask(&self) -> Vec<bool> {
        let mut mask = self.active_realizations.clone();
        mask.resize(self.ensemble_size, false);
        mask
    }
}

struct PhaseRunner {
    config: RunModelConfig,
    storage: Arc<dyn Storage>,
    driver: Arc<dyn Driver>,
    runpaths: Runpaths,
    workflows: Arc<dyn WorkflowRunner>,
    monitor: Option<mpsc::UnboundedSender<String>>,
    cancel: CancellationToken,
}

impl PhaseRunner {
    fn run_hook(&self, hook: HookRuntime) -> Result<(), RunModelError> {
        self.workflows
            .run(hook)
            .map_err(|source| RunModelError::Hook { hook, source })
    }

    fn build_realizations(&self, context: &RunContext) -> Vec<Realization> {
        context
            .active_realizations
            .iter()
            .enumerate()
            .filter(|(_, active)| **active)
            .map(|(iens, _)| {
                let runpath = self.runpaths.path(iens, context.iteration);
                Realization {
                    iens,
                    job_script: self.config.job_script.clone(),
                    runpath: runpath.clone(),
                    max_runtime: self.config.max_runtime,
                    run_arg: RunArg {
                        iens,
                        itr: context.iteration,
                        runpath,
                        ensemble: context.sim_fs.clone(),
                    },
                }
            })
            .collect()
    }

    /// Evaluate one iteration: hooks, runpaths, scheduler, success counting.
    async fn evaluate_and_postprocess(&self, context: &RunContext) -> Result<usize, RunModelError> {
        self.run_hook(HookRuntime::PreSimulation)?;
        self.runpaths
            .materialize(&context.active_realizations, context.iteration)?;

        let scheduler_config = SchedulerConfig {
            ens_id: format!("{}-{}", self.config.experiment_id, context.iteration),
            max_running: self.config.max_running,
            max_submit: self.config.max_submit,
        };
        let (scheduler, mut events) = Scheduler::new(
            self.driver.clone(),
            self.build_realizations(context),
            scheduler_config,
        );
        let scheduler_cancel = scheduler.cancellation_token();

        let monitor = self.monitor.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Some(monitor) = &monitor {
                    let _ = monitor.send(event);
                }
            }
        });

        let execute = scheduler.execute();
        tokio::pin!(execute);
        let summary = tokio::select! {
            summary = &mut execute => summary,
            _ = self.cancel.cancelled() => {
                scheduler_cancel.cancel();
                execute.await
            }
        };
        let _ = forwarder.await;

        self.run_hook(HookRuntime::PostSimulation)?;

        let successes = context
            .active_realizations
            .iter()
            .enumerate()
            .filter(|(iens, active)| {
                **active
                    && summary.state(*iens) == Some(State::Completed)
                    && context.sim_fs.state(*iens) == RealizationState::HasData
            })
            .count();

        if successes < self.config.min_realizations {
            return Err(RunModelError::InsufficientRealizations {
                completed: successes,
                minimum: self.config.min_realizations,
            });
        }
        info!(
            iteration = context.iteration,
            successes, "evaluation phase completed"
        );
        Ok(successes)
    }
}

/// Single-phase ensemble experiment: evaluate every active realization once.
pub struct EnsembleExperiment {
    runner: PhaseRunner,
}

impl EnsembleExperiment {
    /// Build an experiment over `storage`, submitting through `driver`.
    pub fn new(
        config: RunModelConfig,
        storage: Arc<dyn Storage>,
        driver: Arc<dyn Driver>,
        runpaths: Runpaths,
    ) -> Self {
        Self {
            runner: PhaseRunner {
                config,
                storage,
                driver,
                runpaths,
                workflows: Arc::new(NoWorkflows),
                monitor: None,
                cancel: CancellationToken::new(),
            },
        }
    }

    /// Attach a workflow runner for the hook points.
    pub fn with_workflows(mut self, workflows: Arc<dyn WorkflowRunner>) -> Self {
        self.runner.workflows = workflows;
        self
    }

    /// Forward every scheduler event to `monitor`.
    pub fn with_monitor(mut self, monitor: mpsc::UnboundedSender<String>) -> Self {
        self.runner.monitor = Some(monitor);
        self
    }

    /// Token that cancels the running phase.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.runner.cancel.clone()
    }

    /// Run the experiment and return the evaluated ensemble.
    pub async fn run(&self) -> Result<Arc<dyn Ensemble>, RunModelError> {
        let runner = &self.runner;
        let ensemble =
            runner
                .storage
                .create_ensemble("iter-0", 0, runner.config.ensemble_size)?;
        let context = RunContext {
            sim_fs: ensemble.clone(),
            active_realizations: runner.config.initial_mask(),
            iteration: 0,
        };
        runner.evaluate_and_postprocess(&context).await?;
        Ok(ensemble)
    }
}

/// Iterated ensemble smoother: evaluate the prior, then alternate analysis
/// updates and re-evaluations for the configured number of iterations.
pub struct IteratedEnsembleSmoother {
    runner: PhaseRunner,
    analysis: Box<dyn AnalysisModule>,
}

impl IteratedEnsembleSmoother {
    /// Build a smoother run over `storage`, updating through `analysis`.
    pub fn new(
        config: RunModelConfig,
        storage: Arc<dyn Storage>,
        driver: Arc<dyn Driver>,
        runpaths: Runpaths,
        analysis: Box<dyn AnalysisModule>,
    ) -> Self {
        Self {
            runner: PhaseRunner {
                config,
                storage,
                driver,
                runpaths,
                workflows: Arc::new(NoWorkflows),
                monitor: None,
                cancel: CancellationToken::new(),
            },
            analysis,
        }
    }

    /// Attach a workflow runner for the hook points.
    pub fn with_workflows(mut self, workflows: Arc<dyn WorkflowRunner>) -> Self {
        self.runner.workflows = workflows;
        self
    }

    /// Forward every scheduler event to `monitor`.
    pub fn with_monitor(mut self, monitor: mpsc::UnboundedSender<String>) -> Self {
        self.runner.monitor = Some(monitor);
        self
    }

    /// Token that cancels the running phase.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.runner.cancel.clone()
    }

    /// Run all iterations and return the final posterior ensemble.
    pub async fn run(&mut self) -> Result<Arc<dyn Ensemble>, RunModelError> {
        let runner = &self.runner;
        let size = runner.config.ensemble_size;
        let initial_mask = runner.config.initial_mask();
        info!(
            iterations = runner.config.num_iterations,
            "running iterated ensemble smoother"
        );

        let prior = runner.storage.create_ensemble("iter-0", 0, size)?;
        let mut prior_context = RunContext {
            sim_fs: prior,
            active_realizations: initial_mask.clone(),
            iteration: 0,
        };
        runner.evaluate_and_postprocess(&prior_context).await?;
        runner.run_hook(HookRuntime::PreFirstUpdate)?;

        for current_iter in 1..=runner.config.num_iterations {
            let posterior =
                runner
                    .storage
                    .create_ensemble(&format!("iter-{current_iter}"), current_iter, size)?;

            // Realizations that failed to produce data drop out of the
            // update and all later evaluations.
            let active: Vec<bool> = (0..size)
                .map(|iens| {
                    initial_mask[iens]
                        && matches!(
                            prior_context.sim_fs.state(iens),
                            RealizationState::Initialized | RealizationState::HasData
                        )
                })
                .collect();
            let posterior_context = RunContext {
                sim_fs: posterior,
                active_realizations: active,
                iteration: current_iter,
            };

            let retries = runner.config.num_retries_per_iter.max(1);
            let mut last_error: Option<anyhow::Error> = None;
            for retry in 0..retries {
                runner.run_hook(HookRuntime::PreUpdate)?;
                match self.analysis.update(
                    prior_context.sim_fs.as_ref(),
                    posterior_context.sim_fs.as_ref(),
                    current_iter - 1,
                ) {
                    Ok(()) => {
                        runner.run_hook(HookRuntime::PostUpdate)?;
                        last_error = None;
                        break;
                    }
                    Err(err) => {
                        warn!(iteration = current_iter, retry, %err, "analysis update failed");
                        last_error = Some(err);
                    }
                }
            }
            if let Some(source) = last_error {
                return Err(RunModelError::AnalysisFailed {
                    iteration: current_iter,
                    retries,
                    source,
                });
            }

            runner.evaluate_and_postprocess(&posterior_context).await?;
            prior_context = posterior_context;
        }

        info!("experiment completed");
        Ok(prior_context.sim_fs)
    }
}
