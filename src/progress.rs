//! Build progress reporting, for display to the user.

use crate::graph::{Step, StepId};
use crate::runner::{CommandResult, Termination};
use crate::work::StateCounts;
use std::io::Write;

/// What the console shows for a step: its description if it has one, else
/// the command line, else (for a bare phony step) a placeholder.
pub fn step_message(step: &Step) -> &str {
    step.description
        .as_deref()
        .filter(|desc| !desc.is_empty())
        .or(step.command.as_deref())
        .unwrap_or("phony")
}

pub trait Progress {
    /// Called as steps move through build states.
    fn update(&mut self, counts: &StateCounts);

    /// Called when a command starts running.
    fn task_started(&mut self, id: StepId, step: &Step);

    /// Called when a command completes.
    fn task_finished(&mut self, id: StepId, step: &Step, result: &CommandResult);

    /// Log a line of output that should survive the build.
    fn log(&mut self, msg: &str);
}

/// Plain console output, one line per event, no overprinting.
#[derive(Default)]
pub struct ConsoleProgress {
    /// Whether to print the command lines of started steps.
    verbose: bool,
    counts: StateCounts,
    /// The id of the last command printed, to avoid printing a step twice
    /// when it starts and then finishes with output.
    last_started: Option<StepId>,
}

impl ConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        ConsoleProgress {
            verbose,
            ..Default::default()
        }
    }
}

impl Progress for ConsoleProgress {
    fn update(&mut self, counts: &StateCounts) {
        self.counts = counts.clone();
    }

    fn task_started(&mut self, id: StepId, step: &Step) {
        let message = if self.verbose {
            step.command.as_deref().unwrap_or("phony")
        } else {
            step_message(step)
        };
        self.log(&format!(
            "[{}/{}] {}",
            self.counts.finished() + 1,
            self.counts.total(),
            message
        ));
        self.last_started = Some(id);
    }

    fn task_finished(&mut self, id: StepId, step: &Step, result: &CommandResult) {
        match result.termination {
            Termination::Success => {
                if result.output.is_empty() || self.last_started == Some(id) {
                    // Quiet success, or we just printed this step's line.
                } else {
                    self.log(step_message(step));
                }
            }
            Termination::Interrupted => self.log(&format!("interrupted: {}", step_message(step))),
            Termination::Failure => self.log(&format!("failed: {}", step_message(step))),
        }
        if !result.output.is_empty() {
            let _ = std::io::stdout().write_all(&result.output);
        }
    }

    fn log(&mut self, msg: &str) {
        println!("{}", msg);
    }
}

/// Discards everything; for tests and tools.
#[derive(Default)]
pub struct NullProgress {}

impl Progress for NullProgress {
    fn update(&mut self, _counts: &StateCounts) {}
    fn task_started(&mut self, _id: StepId, _step: &Step) {}
    fn task_finished(&mut self, _id: StepId, _step: &Step, _result: &CommandResult) {}
    fn log(&mut self, _msg: &str) {}
}
