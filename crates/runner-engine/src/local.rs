//! Reference driver running each realization as a local subprocess.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::driver::{Driver, DriverEvent, SubmitError};

/// Driver that spawns each job script as a child process of the scheduler.
///
/// Spawn success doubles as the `Started` event: a local process begins
/// executing the moment it exists.
pub struct LocalDriver {
    event_tx: Mutex<mpsc::UnboundedSender<DriverEvent>>,
    kills: Arc<Mutex<HashMap<usize, oneshot::Sender<()>>>>,
}

impl LocalDriver {
    /// A driver with no jobs in flight.
    pub fn new() -> Self {
        let (event_tx, _) = mpsc::unbounded_channel();
        Self {
            event_tx: Mutex::new(event_tx),
            kills: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn sender(&self) -> mpsc::UnboundedSender<DriverEvent> {
        self.event_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Default for LocalDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn exit_code(status: std::io::Result<std::process::ExitStatus>) -> i32 {
    match status {
        // Signal-terminated processes have no exit code; report a failure.
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => -1,
    }
}

fn lock_kills(
    kills: &Mutex<HashMap<usize, oneshot::Sender<()>>>,
) -> std::sync::MutexGuard<'_, HashMap<usize, oneshot::Sender<()>>> {
    kills.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl Driver for LocalDriver {
    async fn submit(&self, iens: usize, job_script: &Path, cwd: &Path) -> Result<(), SubmitError> {
        let mut child = Command::new(job_script)
            .current_dir(cwd)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SubmitError::Spawn {
                script: job_script.display().to_string(),
                source,
            })?;

        let tx = self.sender();
        let _ = tx.send(DriverEvent::Started { iens });

        let (kill_tx, mut kill_rx) = oneshot::channel();
        lock_kills(&self.kills).insert(iens, kill_tx);

        let kills = self.kills.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                kill = &mut kill_rx => {
                    if kill.is_ok() {
                        if let Err(err) = child.start_kill() {
                            debug!(iens, %err, "kill of already-gone process");
                        }
                        let _ = child.wait().await;
                        let _ = tx.send(DriverEvent::Aborted { iens });
                        return;
                    }
                    // The kill sender vanished without a request; keep waiting.
                    let status = child.wait().await;
                    lock_kills(&kills).remove(&iens);
                    let _ = tx.send(DriverEvent::Finished { iens, exit_code: exit_code(status) });
                }
                status = child.wait() => {
                    // Close the kill slot before reporting, so a racing kill
                    // request either lands here or falls back to a direct
                    // acknowledgement in `kill`.
                    kill_rx.close();
                    let aborted = kill_rx.try_recv().is_ok();
                    lock_kills(&kills).remove(&iens);
                    if aborted {
                        let _ = tx.send(DriverEvent::Aborted { iens });
                    } else {
                        let _ = tx.send(DriverEvent::Finished { iens, exit_code: exit_code(status) });
                    }
                }
            }
        });

        Ok(())
    }

    async fn kill(&self, iens: usize) {
        let pending = lock_kills(&self.kills).remove(&iens);
        let acknowledged = match pending {
            Some(kill_tx) => kill_tx.send(()).is_ok(),
            None => false,
        };
        if !acknowledged {
            // Nothing in flight (or the waiter is already gone); a kill is
            // still acknowledged so an aborting job can finish aborting.
            if self.sender().send(DriverEvent::Aborted { iens }).is_err() {
                error!(iens, "no event stream to acknowledge kill on");
            }
        }
    }

    fn take_events(&self) -> mpsc::UnboundedReceiver<DriverEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .event_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = tx;
        rx
    }
}
