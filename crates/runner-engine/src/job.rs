//! Per-realization job lifecycle.
//!
//! A [`Job`] owns one submission attempt at a time and walks the state
//! machine WAITING → SUBMITTING → PENDING → RUNNING → {COMPLETED, FAILED},
//! with ABORTING → ABORTED on external cancellation. Driver state changes
//! arrive through one-shot signals armed per attempt; the scheduler's event
//! dispatcher resolves them.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{Semaphore, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use ensrun_core::callbacks::forward_model_ok;
use ensrun_core::{LoadResult, RealizationState, RunArg};

use crate::driver::{Driver, DriverEvent};
use crate::events::EventPublisher;

/// Name of the structured error report a failing forward model leaves in its
/// runpath.
pub const ERROR_FILE: &str = "ERROR";

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    /// Created, not yet allowed to submit.
    Waiting,
    /// Submission request in flight to the driver.
    Submitting,
    /// Accepted by the backend, not yet executing.
    Pending,
    /// Executing.
    Running,
    /// Kill requested, waiting for the backend to confirm.
    Aborting,
    /// Finished and results loaded. Terminal.
    Completed,
    /// Failed; terminal once the attempt budget is spent.
    Failed,
    /// Killed on request. Terminal.
    Aborted,
}

impl State {
    /// Whether the state ends the job's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Failed | State::Aborted)
    }

    /// Legacy queue-state string carried in event bodies.
    pub fn legacy(self) -> &'static str {
        match self {
            State::Waiting => "WAITING",
            State::Submitting => "SUBMITTED",
            State::Pending => "PENDING",
            State::Running => "RUNNING",
            State::Aborting => "DO_KILL",
            State::Completed => "SUCCESS",
            State::Failed => "FAILED",
            State::Aborted => "IS_KILLED",
        }
    }

    /// Canonical CloudEvent type for the state's legacy mapping.
    pub fn event_type(self) -> &'static str {
        match self {
            State::Waiting => "com.equinor.ert.realization.waiting",
            State::Submitting => "com.equinor.ert.realization.submitted",
            State::Pending => "com.equinor.ert.realization.pending",
            State::Running => "com.equinor.ert.realization.running",
            State::Aborting => "com.equinor.ert.realization.do_kill",
            State::Completed => "com.equinor.ert.realization.success",
            State::Failed => "com.equinor.ert.realization.failed",
            State::Aborted => "com.equinor.ert.realization.is_killed",
        }
    }
}

/// One parameter sample to be evaluated: which script to run, where, and how
/// its results are ingested.
#[derive(Debug, Clone)]
pub struct Realization {
    /// Realization index, unique within the ensemble.
    pub iens: usize,
    /// Executable launched by the driver.
    pub job_script: PathBuf,
    /// Working directory; also where output files appear.
    pub runpath: PathBuf,
    /// Wall-clock cap for one attempt; `None` or zero means unbounded.
    pub max_runtime: Option<Duration>,
    /// Bundle handed to the result callback.
    pub run_arg: RunArg,
}

#[derive(Default)]
struct SignalSlots {
    started: Option<oneshot::Sender<()>>,
    returncode: Option<oneshot::Sender<i32>>,
    aborted: Option<oneshot::Sender<()>>,
}

/// Dispatcher-facing half of a job: the one-shot signal slots the scheduler's
/// event pump resolves as driver events arrive.
pub(crate) struct JobHandle {
    iens: usize,
    slots: Mutex<SignalSlots>,
}

impl JobHandle {
    pub(crate) fn new(iens: usize) -> Self {
        Self {
            iens,
            slots: Mutex::new(SignalSlots::default()),
        }
    }

    pub(crate) fn iens(&self) -> usize {
        self.iens
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SignalSlots> {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Arm fresh `started`/`returncode` signals for the next attempt,
    /// invalidating whatever a previous attempt left behind.
    fn arm_attempt(&self) -> (oneshot::Receiver<()>, oneshot::Receiver<i32>) {
        let (started_tx, started_rx) = oneshot::channel();
        let (returncode_tx, returncode_rx) = oneshot::channel();
        let mut slots = self.lock();
        slots.started = Some(started_tx);
        slots.returncode = Some(returncode_tx);
        (started_rx, returncode_rx)
    }

    /// Arm the `aborted` signal; once per job, not per attempt.
    fn arm_aborted(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.lock().aborted = Some(tx);
        rx
    }

    /// Resolve the matching one-shot signal for a driver event. Each signal
    /// fires at most once per attempt; events with no armed slot are dropped.
    pub(crate) fn dispatch(&self, event: DriverEvent) {
        let mut slots = self.lock();
        match event {
            DriverEvent::Started { .. } => {
                if let Some(tx) = slots.started.take() {
                    let _ = tx.send(());
                }
            }
            DriverEvent::Finished { exit_code, .. } => {
                if let Some(tx) = slots.returncode.take() {
                    let _ = tx.send(exit_code);
                }
            }
            DriverEvent::Aborted { .. } => {
                if let Some(tx) = slots.aborted.take() {
                    let _ = tx.send(());
                }
            }
        }
    }
}

enum Attempt {
    /// Clean exit and results loaded.
    Completed,
    /// The attempt consumed its returncode but could not load results; the
    /// retry sequence ends here.
    FailedFinal,
    /// Non-zero exit, timeout, or submission failure; the retry budget
    /// decides what happens next.
    FailedRetryable,
}

pub(crate) struct Job {
    real: Realization,
    state: State,
    handle: Arc<JobHandle>,
    driver: Arc<dyn Driver>,
    events: EventPublisher,
    callback_status_msg: String,
    requested_max_submit: usize,
}

impl Job {
    pub(crate) fn new(
        real: Realization,
        driver: Arc<dyn Driver>,
        events: EventPublisher,
        handle: Arc<JobHandle>,
    ) -> Self {
        Self {
            real,
            state: State::Waiting,
            handle,
            driver,
            events,
            callback_status_msg: String::new(),
            requested_max_submit: 0,
        }
    }

    pub(crate) fn iens(&self) -> usize {
        self.real.iens
    }

    /// Drive the job to a terminal state: gate on `start`, then attempt up to
    /// `max_submit` submissions, aborting if `cancel` fires at any suspension
    /// point.
    pub(crate) async fn run(
        mut self,
        start: watch::Receiver<bool>,
        sem: Arc<Semaphore>,
        cancel: CancellationToken,
        max_submit: usize,
    ) -> (usize, State) {
        self.requested_max_submit = max_submit;
        let aborted_rx = self.handle.arm_aborted();

        let cancelled = tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = self.run_attempts(start, &sem, max_submit) => false,
        };
        if cancelled {
            self.abort(aborted_rx).await;
        }

        (self.real.iens, self.state)
    }

    async fn run_attempts(
        &mut self,
        mut start: watch::Receiver<bool>,
        sem: &Semaphore,
        max_submit: usize,
    ) {
        if start.wait_for(|started| *started).await.is_err() {
            // The scheduler dropped the gate without opening it.
            return;
        }

        for attempt in 0..max_submit {
            match self.submit_and_run_once(sem).await {
                Attempt::Completed | Attempt::FailedFinal => return,
                Attempt::FailedRetryable => {
                    if attempt + 1 < max_submit {
                        warn!(iens = self.real.iens, "realization failed, resubmitting");
                    }
                }
            }
        }
        error!(
            iens = self.real.iens,
            attempts = max_submit,
            "realization failed after exhausting its submit budget"
        );
    }

    async fn submit_and_run_once(&mut self, sem: &Semaphore) -> Attempt {
        let _permit = sem.acquire().await.expect("submit semaphore closed");
        let (started_rx, returncode_rx) = self.handle.arm_attempt();

        self.send(State::Submitting);
        if let Err(err) = self
            .driver
            .submit(self.real.iens, &self.real.job_script, &self.real.runpath)
            .await
        {
            error!(iens = self.real.iens, %err, "driver rejected submission");
            self.send(State::Failed);
            return Attempt::FailedRetryable;
        }

        self.send(State::Pending);
        if started_rx.await.is_err() {
            error!(iens = self.real.iens, "driver went away before the job started");
            self.send(State::Failed);
            return Attempt::FailedRetryable;
        }

        self.send(State::Running);
        let max_runtime = self.real.max_runtime.filter(|limit| !limit.is_zero());
        let returncode = tokio::select! {
            code = returncode_rx => code.ok(),
            _ = max_runtime_elapsed(max_runtime) => {
                self.events.realization_timeout(self.real.iens);
                None
            }
        };

        match returncode {
            Some(0) => {
                let run_arg = self.real.run_arg.clone();
                let result =
                    match tokio::task::spawn_blocking(move || forward_model_ok(&run_arg)).await {
                        Ok(result) => result,
                        Err(err) => LoadResult::failure(format!("result callback panicked: {err}")),
                    };
                self.note_callback_status(&result.message);
                if result.is_success() {
                    self.send(State::Completed);
                    Attempt::Completed
                } else {
                    self.send(State::Failed);
                    Attempt::FailedFinal
                }
            }
            // Non-zero exit, timeout, or a vanished driver. The attempt is
            // over; the next one arms fresh signals.
            _ => {
                self.send(State::Failed);
                Attempt::FailedRetryable
            }
        }
    }

    async fn abort(&mut self, aborted_rx: oneshot::Receiver<()>) {
        self.send(State::Aborting);
        self.driver.kill(self.real.iens).await;
        let _ = aborted_rx.await;
        self.send(State::Aborted);
    }

    fn note_callback_status(&mut self, message: &str) {
        if message.is_empty() {
            return;
        }
        if !self.callback_status_msg.is_empty() {
            self.callback_status_msg.push('\n');
        }
        self.callback_status_msg
            .push_str(&format!("status from done callback: {message}"));
    }

    fn send(&mut self, state: State) {
        self.state = state;
        if matches!(state, State::Failed | State::Aborted) {
            self.handle_failure();
        }
        self.events.queue_state(self.real.iens, state);
    }

    fn handle_failure(&self) {
        self.real
            .run_arg
            .ensemble
            .set_state(self.real.run_arg.iens, RealizationState::LoadFailure);
        error!(
            iens = self.real.iens,
            max_submit = self.requested_max_submit,
            status = %self.callback_status_msg,
            "realization failed"
        );
        log_info_from_exit_file(&self.real.runpath.join(ERROR_FILE));
    }
}

async fn max_runtime_elapsed(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

#[derive(Debug, Default, Deserialize)]
struct ExitErrorFile {
    job: Option<String>,
    reason: Option<String>,
    stderr_file: Option<String>,
    stderr: Option<String>,
}

/// Log the structured error report a failing forward model may have left in
/// its runpath. Missing files are silently ignored; missing fields render as
/// the literal `None`.
fn log_info_from_exit_file(exit_file_path: &Path) {
    let Ok(raw) = std::fs::read_to_string(exit_file_path) else {
        return;
    };
    match quick_xml::de::from_str::<ExitErrorFile>(&raw) {
        Ok(report) => error!(
            job = report.job.as_deref().unwrap_or("None"),
            reason = report.reason.as_deref().unwrap_or("None"),
            stderr_file = report.stderr_file.as_deref().unwrap_or("None"),
            stderr = report.stderr.as_deref().unwrap_or("None"),
            "forward model step failed"
        ),
        Err(err) => error!(
            path = %exit_file_path.display(),
            %err,
            "could not parse forward model error report"
        ),
    }
}
