//! The realization scheduler.
//!
//! One [`Scheduler`] drives one ensemble evaluation: it owns a job per
//! realization, the bounded submission semaphore, the serialized-event queue,
//! and the cancellation signal. All jobs, the driver-event dispatcher, and
//! the per-job timeout timers run as cooperative tasks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::driver::{Driver, DriverEvent};
use crate::events::EventPublisher;
use crate::job::{Job, JobHandle, Realization, State};

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Opaque id of this ensemble evaluation; becomes the event source
    /// prefix.
    pub ens_id: String,
    /// Maximum number of realizations simultaneously submitting or running.
    pub max_running: usize,
    /// Submission attempts allowed per realization.
    pub max_submit: usize,
}

impl SchedulerConfig {
    /// Default per-realization attempt budget.
    pub const DEFAULT_MAX_SUBMIT: usize = 2;
}

/// Terminal states per realization after [`Scheduler::execute`] returns.
#[derive(Debug, Clone, Default)]
pub struct SchedulerSummary {
    /// Terminal state per realization index.
    pub states: BTreeMap<usize, State>,
}

impl SchedulerSummary {
    /// Terminal state of one realization, if it was scheduled.
    pub fn state(&self, iens: usize) -> Option<State> {
        self.states.get(&iens).copied()
    }

    /// Number of realizations that completed successfully.
    pub fn completed(&self) -> usize {
        self.states
            .values()
            .filter(|state| **state == State::Completed)
            .count()
    }
}

/// Orchestrates one ensemble evaluation.
pub struct Scheduler {
    driver: Arc<dyn Driver>,
    jobs: Vec<Job>,
    handles: HashMap<usize, Arc<JobHandle>>,
    cancel: CancellationToken,
    config: SchedulerConfig,
    // Keeps the event stream open for the scheduler's own lifetime; jobs hold
    // their own clones through their publisher.
    _events_tx: mpsc::UnboundedSender<String>,
}

impl Scheduler {
    /// Build one job per realization and the serialized-event stream the
    /// caller consumes.
    pub fn new(
        driver: Arc<dyn Driver>,
        realizations: Vec<Realization>,
        config: SchedulerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let publisher = EventPublisher::new(config.ens_id.clone(), events_tx.clone());

        let mut jobs = Vec::with_capacity(realizations.len());
        let mut handles = HashMap::with_capacity(realizations.len());
        for real in realizations {
            let handle = Arc::new(JobHandle::new(real.iens));
            if handles.insert(real.iens, handle.clone()).is_some() {
                warn!(iens = real.iens, "duplicate realization index; keeping the last");
                jobs.retain(|job: &Job| job.iens() != real.iens);
            }
            jobs.push(Job::new(real, driver.clone(), publisher.clone(), handle));
        }

        let scheduler = Self {
            driver,
            jobs,
            handles,
            cancel: CancellationToken::new(),
            config,
            _events_tx: events_tx,
        };
        (scheduler, events_rx)
    }

    /// Handle for cancelling this evaluation; every non-terminal job will run
    /// its ABORTING → ABORTED path.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every job to a terminal state and report the result.
    ///
    /// Does not return until all jobs are terminal, including jobs that have
    /// to be killed after cancellation.
    pub async fn execute(self) -> SchedulerSummary {
        let Self {
            driver,
            jobs,
            handles,
            cancel,
            config,
            _events_tx,
        } = self;

        let mut summary = SchedulerSummary::default();
        if jobs.is_empty() {
            return summary;
        }

        let dispatcher = tokio::spawn(dispatch_driver_events(driver.take_events(), handles));

        let semaphore = Arc::new(Semaphore::new(config.max_running.max(1)));
        let (start_tx, start_rx) = watch::channel(false);

        let mut tasks = JoinSet::new();
        for job in jobs {
            tasks.spawn(job.run(
                start_rx.clone(),
                semaphore.clone(),
                cancel.clone(),
                config.max_submit.max(1),
            ));
        }
        let _ = start_tx.send(true);

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((iens, state)) => {
                    summary.states.insert(iens, state);
                }
                Err(err) => error!(%err, "job task failed to join"),
            }
        }

        dispatcher.abort();
        summary
    }
}

/// Forward each driver event to the matching job's one-shot signal slot.
/// In-order dispatch per realization is what guarantees `returncode` is never
/// resolved before `started` within an attempt.
async fn dispatch_driver_events(
    mut events: mpsc::UnboundedReceiver<DriverEvent>,
    handles: HashMap<usize, Arc<JobHandle>>,
) {
    while let Some(event) = events.recv().await {
        match handles.get(&event.iens()) {
            Some(handle) => handle.dispatch(event),
            None => warn!(iens = event.iens(), "driver event for unknown realization"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use ensrun_core::{Ensemble, RealizationState};

    use crate::events::EVTYPE_REALIZATION_TIMEOUT;
    use crate::testing::{
        AttemptScript, QueueEvent, ScriptedDriver, collect_until_idle, drain_events,
        empty_ensemble, failing_ensemble, legacy_sequence, parse_event, realizations,
    };

    fn config(max_running: usize, max_submit: usize) -> SchedulerConfig {
        SchedulerConfig {
            ens_id: "ee-test".to_string(),
            max_running,
            max_submit,
        }
    }

    async fn run_to_summary(
        driver: &Arc<ScriptedDriver>,
        ensemble: &Arc<dyn Ensemble>,
        count: usize,
        max_runtime: Option<Duration>,
        cfg: SchedulerConfig,
    ) -> (SchedulerSummary, Vec<QueueEvent>) {
        let reals = realizations(count, ensemble, max_runtime);
        let (scheduler, mut events) = Scheduler::new(driver.clone(), reals, cfg);
        let summary = scheduler.execute().await;
        (summary, drain_events(&mut events))
    }

    #[test_log::test(tokio::test)]
    async fn happy_path_completes_every_realization() {
        let driver = ScriptedDriver::new();
        for iens in 0..3 {
            driver.script(iens, vec![AttemptScript::Exit(0)]);
        }
        let ensemble = empty_ensemble(3);

        let (summary, events) =
            run_to_summary(&driver, &ensemble, 3, None, config(2, 2)).await;

        for iens in 0..3 {
            assert_eq!(summary.state(iens), Some(State::Completed));
            assert_eq!(ensemble.state(iens), RealizationState::HasData);
            assert_eq!(
                legacy_sequence(&events, iens),
                ["SUBMITTED", "PENDING", "RUNNING", "SUCCESS"]
            );
        }
        assert_eq!(summary.completed(), 3);
        assert!(driver.kill_calls().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn failed_attempt_is_resubmitted_until_success() {
        let driver = ScriptedDriver::new();
        driver.script(0, vec![AttemptScript::Exit(1), AttemptScript::Exit(0)]);
        let ensemble = empty_ensemble(1);

        let (summary, events) =
            run_to_summary(&driver, &ensemble, 1, None, config(1, 2)).await;

        assert_eq!(summary.state(0), Some(State::Completed));
        assert_eq!(
            legacy_sequence(&events, 0),
            [
                "SUBMITTED", "PENDING", "RUNNING", "FAILED",
                "SUBMITTED", "PENDING", "RUNNING", "SUCCESS",
            ]
        );
        // The eventual success overrides the interim load-failure mark.
        assert_eq!(ensemble.state(0), RealizationState::HasData);
    }

    #[test_log::test(tokio::test)]
    async fn exhausted_retries_leave_the_realization_failed() {
        let driver = ScriptedDriver::new();
        driver.script(0, vec![AttemptScript::Exit(1), AttemptScript::Exit(1)]);
        let ensemble = empty_ensemble(1);

        let (summary, events) =
            run_to_summary(&driver, &ensemble, 1, None, config(1, 2)).await;

        assert_eq!(summary.state(0), Some(State::Failed));
        assert_eq!(ensemble.state(0), RealizationState::LoadFailure);
        let submitted = legacy_sequence(&events, 0)
            .iter()
            .filter(|legacy| *legacy == "SUBMITTED")
            .count();
        assert_eq!(submitted, 2);
        assert_eq!(driver.submit_calls().len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn single_attempt_budget_means_no_retries() {
        let driver = ScriptedDriver::new();
        driver.script(0, vec![AttemptScript::Exit(1), AttemptScript::Exit(0)]);
        let ensemble = empty_ensemble(1);

        let (summary, _) = run_to_summary(&driver, &ensemble, 1, None, config(1, 1)).await;

        assert_eq!(summary.state(0), Some(State::Failed));
        assert_eq!(driver.submit_calls().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn rejected_submission_counts_as_a_failed_attempt() {
        let driver = ScriptedDriver::new();
        driver.script(0, vec![AttemptScript::RejectSubmit, AttemptScript::Exit(0)]);
        let ensemble = empty_ensemble(1);

        let (summary, events) =
            run_to_summary(&driver, &ensemble, 1, None, config(1, 2)).await;

        assert_eq!(summary.state(0), Some(State::Completed));
        assert_eq!(
            legacy_sequence(&events, 0),
            ["SUBMITTED", "FAILED", "SUBMITTED", "PENDING", "RUNNING", "SUCCESS"]
        );
    }

    #[test_log::test(tokio::test)]
    async fn callback_failure_is_terminal_for_the_retry_sequence() {
        let driver = ScriptedDriver::new();
        driver.script(0, vec![AttemptScript::Exit(0), AttemptScript::Exit(0)]);
        let ensemble = failing_ensemble(1);

        let (summary, events) =
            run_to_summary(&driver, &ensemble, 1, None, config(1, 2)).await;

        assert_eq!(summary.state(0), Some(State::Failed));
        assert_eq!(ensemble.state(0), RealizationState::LoadFailure);
        assert_eq!(
            legacy_sequence(&events, 0),
            ["SUBMITTED", "PENDING", "RUNNING", "FAILED"]
        );
        assert_eq!(driver.submit_calls().len(), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn max_runtime_times_out_the_attempt_without_killing() {
        let driver = ScriptedDriver::new();
        driver.script(0, vec![AttemptScript::StartOnly]);
        let ensemble = empty_ensemble(1);

        let (summary, events) = run_to_summary(
            &driver,
            &ensemble,
            1,
            Some(Duration::from_secs(1)),
            config(1, 1),
        )
        .await;

        assert_eq!(summary.state(0), Some(State::Failed));
        assert!(driver.kill_calls().is_empty());
        let timeouts = events
            .iter()
            .filter(|event| event.event_type == EVTYPE_REALIZATION_TIMEOUT)
            .count();
        assert_eq!(timeouts, 1);
        assert_eq!(
            legacy_sequence(&events, 0),
            ["SUBMITTED", "PENDING", "RUNNING", "FAILED"]
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn timeout_only_fails_the_current_attempt() {
        let driver = ScriptedDriver::new();
        driver.script(0, vec![AttemptScript::StartOnly, AttemptScript::Exit(0)]);
        let ensemble = empty_ensemble(1);

        let (summary, events) = run_to_summary(
            &driver,
            &ensemble,
            1,
            Some(Duration::from_secs(1)),
            config(1, 2),
        )
        .await;

        assert_eq!(summary.state(0), Some(State::Completed));
        let timeouts = events
            .iter()
            .filter(|event| event.event_type == EVTYPE_REALIZATION_TIMEOUT)
            .count();
        assert_eq!(timeouts, 1);
        assert!(driver.kill_calls().is_empty());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn zero_max_runtime_means_unbounded() {
        let driver = ScriptedDriver::new();
        driver.script(0, vec![AttemptScript::Exit(0)]);
        let ensemble = empty_ensemble(1);

        let (summary, events) = run_to_summary(
            &driver,
            &ensemble,
            1,
            Some(Duration::ZERO),
            config(1, 1),
        )
        .await;

        assert_eq!(summary.state(0), Some(State::Completed));
        assert!(
            events
                .iter()
                .all(|event| event.event_type != EVTYPE_REALIZATION_TIMEOUT)
        );
    }

    #[test_log::test(tokio::test)]
    async fn cancellation_aborts_every_running_realization() {
        let driver = ScriptedDriver::new();
        for iens in 0..5 {
            driver.script(iens, vec![AttemptScript::StartOnly]);
        }
        let ensemble = empty_ensemble(5);
        let reals = realizations(5, &ensemble, None);
        let (scheduler, mut events) =
            Scheduler::new(driver.clone(), reals, config(5, 2));
        let cancel = scheduler.cancellation_token();

        let execute = scheduler.execute();
        tokio::pin!(execute);

        let mut seen = Vec::new();
        let mut running = 0;
        let summary = loop {
            tokio::select! {
                summary = &mut execute => break summary,
                raw = events.recv() => {
                    let Some(raw) = raw else { break execute.await };
                    let event = parse_event(&raw);
                    if event.legacy.as_deref() == Some("RUNNING") {
                        running += 1;
                        if running == 5 {
                            cancel.cancel();
                        }
                    }
                    seen.push(event);
                }
            }
        };
        seen.extend(drain_events(&mut events));

        let mut kills = driver.kill_calls();
        kills.sort_unstable();
        assert_eq!(kills, [0, 1, 2, 3, 4]);
        for iens in 0..5 {
            assert_eq!(summary.state(iens), Some(State::Aborted));
            assert_eq!(
                legacy_sequence(&seen, iens),
                ["SUBMITTED", "PENDING", "RUNNING", "DO_KILL", "IS_KILLED"]
            );
        }
    }

    #[test_log::test(tokio::test)]
    async fn cancellation_before_start_never_submits() {
        let driver = ScriptedDriver::new();
        let ensemble = empty_ensemble(2);
        let reals = realizations(2, &ensemble, None);
        let (scheduler, mut events) =
            Scheduler::new(driver.clone(), reals, config(2, 2));

        scheduler.cancellation_token().cancel();
        let summary = scheduler.execute().await;
        let events = drain_events(&mut events);

        assert!(driver.submit_calls().is_empty());
        for iens in 0..2 {
            assert_eq!(summary.state(iens), Some(State::Aborted));
            assert_eq!(legacy_sequence(&events, iens), ["DO_KILL", "IS_KILLED"]);
        }
    }

    #[test_log::test(tokio::test)]
    async fn empty_ensemble_returns_immediately() {
        let driver = ScriptedDriver::new();
        let (scheduler, mut events) =
            Scheduler::new(driver.clone(), Vec::new(), config(4, 2));

        let summary = scheduler.execute().await;

        assert!(summary.states.is_empty());
        assert!(drain_events(&mut events).is_empty());
        assert!(driver.submit_calls().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn submission_semaphore_bounds_in_flight_realizations() {
        let driver = ScriptedDriver::new();
        for iens in 0..3 {
            driver.script(iens, vec![AttemptScript::StartOnly]);
        }
        let ensemble = empty_ensemble(3);
        let reals = realizations(3, &ensemble, None);
        let (scheduler, mut events) =
            Scheduler::new(driver.clone(), reals, config(2, 1));

        let execute = tokio::spawn(scheduler.execute());

        collect_until_idle(&mut events).await;
        // Two slots, three jobs: the third stays WAITING with no events.
        let submitted = driver.submit_calls();
        assert_eq!(submitted.len(), 2);

        driver.finish(submitted[0], 0);
        collect_until_idle(&mut events).await;
        assert_eq!(driver.submit_calls().len(), 3);

        // Release the rest so the scheduler can wind down.
        for iens in 0..3 {
            if iens != submitted[0] {
                driver.finish(iens, 0);
            }
        }
        let summary = execute.await.expect("scheduler task panicked");
        assert_eq!(summary.completed(), 3);
    }

    #[cfg(unix)]
    #[test_log::test(tokio::test)]
    async fn local_driver_end_to_end_loads_results() {
        use std::os::unix::fs::PermissionsExt;

        use ensrun_core::config::JsonResponseConfig;
        use ensrun_core::{Experiment, MemoryStorage, RunArg, Storage};

        use crate::local::LocalDriver;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("forward_model.sh");
        std::fs::write(&script, "#!/bin/sh\necho '[1.0, 2.0]' > responses.json\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let storage = MemoryStorage::new(Experiment::new(
            Vec::new(),
            vec![Arc::new(JsonResponseConfig::new("response", "responses.json"))],
        ));
        let ensemble = storage.create_ensemble("prior", 0, 2).unwrap();
        let reals: Vec<Realization> = (0..2)
            .map(|iens| {
                let runpath = dir.path().join(format!("realization-{iens}"));
                std::fs::create_dir_all(&runpath).unwrap();
                Realization {
                    iens,
                    job_script: script.clone(),
                    runpath: runpath.clone(),
                    max_runtime: None,
                    run_arg: RunArg {
                        iens,
                        itr: 0,
                        runpath,
                        ensemble: ensemble.clone(),
                    },
                }
            })
            .collect();

        let driver = Arc::new(LocalDriver::new());
        let (scheduler, _events) = Scheduler::new(driver, reals, config(2, 2));
        let summary = scheduler.execute().await;

        for iens in 0..2 {
            assert_eq!(summary.state(iens), Some(State::Completed));
            assert_eq!(ensemble.state(iens), RealizationState::HasData);
            assert_eq!(
                ensemble.response("response", iens),
                Some(serde_json::json!([1.0, 2.0]))
            );
        }
    }

    #[test_log::test(tokio::test)]
    async fn replaying_the_same_transcript_reproduces_the_run() {
        async fn one_run() -> (Vec<Vec<String>>, Vec<Option<State>>, Vec<RealizationState>) {
            let driver = ScriptedDriver::new();
            driver.script(0, vec![AttemptScript::Exit(1), AttemptScript::Exit(0)]);
            driver.script(1, vec![AttemptScript::Exit(0)]);
            let ensemble = empty_ensemble(2);
            let (summary, events) = {
                let reals = realizations(2, &ensemble, None);
                let (scheduler, mut rx) =
                    Scheduler::new(driver.clone(), reals, config(2, 2));
                let summary = scheduler.execute().await;
                (summary, drain_events(&mut rx))
            };
            (
                (0..2).map(|iens| legacy_sequence(&events, iens)).collect(),
                (0..2).map(|iens| summary.state(iens)).collect(),
                (0..2).map(|iens| ensemble.state(iens)).collect(),
            )
        }

        let first = one_run().await;
        let second = one_run().await;
        assert_eq!(first, second);
    }
}
