//! Shared fixtures for the scheduler test suites.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use ensrun_core::config::JsonResponseConfig;
use ensrun_core::{Ensemble, Experiment, MemoryStorage, RunArg, Storage};

use crate::driver::{Driver, DriverEvent, SubmitError};
use crate::events::CloudEvent;
use crate::job::Realization;

/// What one submission attempt of a scripted realization does.
#[derive(Debug, Clone, Copy)]
pub(crate) enum AttemptScript {
    /// Start, then finish with the given exit code.
    Exit(i32),
    /// Start and never finish on its own.
    StartOnly,
    /// Reject the submission outright.
    RejectSubmit,
}

/// Driver that plays back per-realization transcripts and records every
/// submit and kill call.
pub(crate) struct ScriptedDriver {
    scripts: Mutex<HashMap<usize, VecDeque<AttemptScript>>>,
    event_tx: Mutex<mpsc::UnboundedSender<DriverEvent>>,
    submits: Mutex<Vec<usize>>,
    kills: Mutex<Vec<usize>>,
}

impl ScriptedDriver {
    pub(crate) fn new() -> Arc<Self> {
        let (event_tx, _) = mpsc::unbounded_channel();
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            event_tx: Mutex::new(event_tx),
            submits: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn script(&self, iens: usize, attempts: Vec<AttemptScript>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(iens, attempts.into_iter().collect());
    }

    pub(crate) fn submit_calls(&self) -> Vec<usize> {
        self.submits.lock().unwrap().clone()
    }

    pub(crate) fn kill_calls(&self) -> Vec<usize> {
        self.kills.lock().unwrap().clone()
    }

    fn sender(&self) -> mpsc::UnboundedSender<DriverEvent> {
        self.event_tx.lock().unwrap().clone()
    }

    /// Manually finish a held (`StartOnly`) realization.
    pub(crate) fn finish(&self, iens: usize, exit_code: i32) {
        let _ = self.sender().send(DriverEvent::Finished { iens, exit_code });
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn submit(&self, iens: usize, _job_script: &Path, _cwd: &Path) -> Result<(), SubmitError> {
        self.submits.lock().unwrap().push(iens);
        let attempt = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&iens)
            .and_then(VecDeque::pop_front)
            .unwrap_or(AttemptScript::Exit(0));

        let tx = self.sender();
        match attempt {
            AttemptScript::RejectSubmit => {
                return Err(SubmitError::Rejected {
                    iens,
                    reason: "scripted rejection".to_string(),
                });
            }
            AttemptScript::Exit(exit_code) => {
                let _ = tx.send(DriverEvent::Started { iens });
                let _ = tx.send(DriverEvent::Finished { iens, exit_code });
            }
            AttemptScript::StartOnly => {
                let _ = tx.send(DriverEvent::Started { iens });
            }
        }
        Ok(())
    }

    async fn kill(&self, iens: usize) {
        self.kills.lock().unwrap().push(iens);
        let _ = self.sender().send(DriverEvent::Aborted { iens });
    }

    fn take_events(&self) -> mpsc::UnboundedReceiver<DriverEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.event_tx.lock().unwrap() = tx;
        rx
    }
}

/// Ensemble whose experiment has no datasets, so the result callback always
/// succeeds without touching the filesystem.
pub(crate) fn empty_ensemble(size: usize) -> Arc<dyn Ensemble> {
    MemoryStorage::new(Experiment::new(Vec::new(), Vec::new()))
        .create_ensemble("test", 0, size)
        .unwrap()
}

/// Ensemble whose single response config points at a file that never exists,
/// so the result callback always fails.
pub(crate) fn failing_ensemble(size: usize) -> Arc<dyn Ensemble> {
    MemoryStorage::new(Experiment::new(
        Vec::new(),
        vec![Arc::new(JsonResponseConfig::new("response", "responses.json"))],
    ))
    .create_ensemble("test", 0, size)
    .unwrap()
}

/// Realizations over a runpath that never exists; fine as long as the
/// ensemble's experiment reads no files.
pub(crate) fn realizations(
    count: usize,
    ensemble: &Arc<dyn Ensemble>,
    max_runtime: Option<Duration>,
) -> Vec<Realization> {
    (0..count)
        .map(|iens| {
            let runpath = PathBuf::from(format!("/nonexistent/realization-{iens}"));
            Realization {
                iens,
                job_script: PathBuf::from("/nonexistent/job_script"),
                runpath: runpath.clone(),
                max_runtime,
                run_arg: RunArg {
                    iens,
                    itr: 0,
                    runpath,
                    ensemble: ensemble.clone(),
                },
            }
        })
        .collect()
}

/// A deserialized scheduler event, reduced to what the tests assert on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueEvent {
    pub(crate) iens: usize,
    pub(crate) event_type: String,
    pub(crate) legacy: Option<String>,
}

pub(crate) fn parse_event(raw: &str) -> QueueEvent {
    let event: CloudEvent = serde_json::from_str(raw).expect("malformed scheduler event");
    QueueEvent {
        iens: event.source_iens().expect("event source without iens"),
        event_type: event.event_type.clone(),
        legacy: event.queue_event_type().map(str::to_string),
    }
}

/// Drain whatever is left on a closed (or quiescent) event stream.
pub(crate) fn drain_events(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<QueueEvent> {
    let mut out = Vec::new();
    while let Ok(raw) = rx.try_recv() {
        out.push(parse_event(&raw));
    }
    out
}

/// Receive events until the stream stays quiet for a moment.
pub(crate) async fn collect_until_idle(
    rx: &mut mpsc::UnboundedReceiver<String>,
) -> Vec<QueueEvent> {
    let mut out = Vec::new();
    while let Ok(Some(raw)) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
        out.push(parse_event(&raw));
    }
    out
}

/// The legacy queue-state strings emitted for one realization, in order.
pub(crate) fn legacy_sequence(events: &[QueueEvent], iens: usize) -> Vec<String> {
    events
        .iter()
        .filter(|event| event.iens == iens)
        .filter_map(|event| event.legacy.clone())
        .collect()
}
