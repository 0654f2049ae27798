#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Ensemble scheduler engine: the driver contract, the per-realization job
//! lifecycle, the bounded scheduler, and the phase-level run models.

pub mod driver;
pub mod events;
pub mod job;
pub mod local;
pub mod run_model;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use driver::{Driver, DriverEvent, SubmitError};
pub use events::{CloudEvent, EVTYPE_REALIZATION_TIMEOUT};
pub use job::{Realization, State};
pub use local::LocalDriver;
pub use run_model::{
    AnalysisModule, EnsembleExperiment, HookRuntime, IteratedEnsembleSmoother, NoWorkflows,
    PassThroughAnalysis, RunContext, RunModelConfig, RunModelError, Runpaths, WorkflowRunner,
};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerSummary};
