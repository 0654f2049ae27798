use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use ensrun_engine::{CloudEvent, EVTYPE_REALIZATION_TIMEOUT};

fn realization_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix} {spinner} {msg}")
        .expect("static progress template must be valid")
}

/// Terminal view of the scheduler event stream: one line per realization
/// when stdout is a terminal, plain status lines otherwise.
pub struct Monitor {
    progress: Option<MultiProgress>,
    bars: HashMap<usize, ProgressBar>,
}

impl Monitor {
    pub fn new(show_progress: bool) -> Self {
        Self {
            progress: show_progress.then(MultiProgress::new),
            bars: HashMap::new(),
        }
    }

    fn println(&self, line: &str) {
        match &self.progress {
            Some(progress) => {
                let _ = progress.println(line);
            }
            None => println!("{line}"),
        }
    }

    /// Render one serialized CloudEvent from the scheduler.
    pub fn handle(&mut self, raw: &str) {
        let Ok(event) = serde_json::from_str::<CloudEvent>(raw) else {
            return;
        };
        let Some(iens) = event.source_iens() else {
            return;
        };

        if event.event_type == EVTYPE_REALIZATION_TIMEOUT {
            self.println(&format!("realization {iens}: exceeded max runtime"));
            return;
        }
        let Some(status) = event.queue_event_type() else {
            return;
        };

        match &self.progress {
            Some(progress) => {
                let bar = self.bars.entry(iens).or_insert_with(|| {
                    let bar = progress.add(ProgressBar::new_spinner());
                    bar.set_style(realization_style());
                    bar.set_prefix(format!("real {iens:>4}"));
                    bar
                });
                if matches!(status, "SUCCESS" | "FAILED" | "IS_KILLED") {
                    bar.finish_with_message(status.to_string());
                } else {
                    bar.set_message(status.to_string());
                    bar.tick();
                }
            }
            None => println!("realization {iens}: {status}"),
        }
    }
}
