//! The command runner interface: how the scheduler hands commands to the
//! layer that executes them.
//!
//! Runners stack by composition: the subprocess runner at the bottom, the
//! parallelism/load limiter around it, the pool layer around that.  Each
//! layer owns the next one.  Completion is a callback stored with the
//! in-flight command; it fires exactly once, always from inside a
//! run_commands call and never reentrantly from invoke.

use crate::signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Success,
    Interrupted,
    Failure,
}

/// What a finished command reported.
pub struct CommandResult {
    pub termination: Termination,
    /// Combined stdout and stderr.
    pub output: Vec<u8>,
    /// Files the tracer saw the command read and write.  Empty on backends
    /// without tracing.
    pub observed_inputs: Vec<String>,
    pub observed_outputs: Vec<String>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.termination == Termination::Success
    }

    pub fn untraced(termination: Termination, output: Vec<u8>) -> CommandResult {
        CommandResult {
            termination,
            output,
            observed_inputs: Vec::new(),
            observed_outputs: Vec::new(),
        }
    }
}

pub type OnDone = Box<dyn FnOnce(CommandResult)>;

pub trait CommandRunner {
    /// Accept a command for execution.  on_done fires from a later
    /// run_commands call.
    fn invoke(&mut self, command: &str, pool: &str, on_done: OnDone);

    /// Commands in flight, including any queued by a pool.
    fn size(&self) -> usize;

    /// Admission hint for the scheduler.
    fn can_run_more(&self) -> bool;

    fn empty(&self) -> bool {
        self.size() == 0
    }

    /// Block until at least one command completes, deliver completions, and
    /// report whether the user interrupted the build.
    fn run_commands(&mut self) -> bool;
}

/// A runner bottom that executes nothing: every command "succeeds"
/// immediately with no output and no observed files.
#[derive(Default)]
pub struct DryRunRunner {
    queued: Vec<OnDone>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        DryRunRunner::default()
    }
}

impl CommandRunner for DryRunRunner {
    fn invoke(&mut self, _command: &str, _pool: &str, on_done: OnDone) {
        self.queued.push(on_done);
    }

    fn size(&self) -> usize {
        self.queued.len()
    }

    fn can_run_more(&self) -> bool {
        true
    }

    fn run_commands(&mut self) -> bool {
        for on_done in self.queued.drain(..) {
            on_done(CommandResult::untraced(Termination::Success, Vec::new()));
        }
        signal::was_interrupted()
    }
}

#[cfg(test)]
pub mod testing {
    //! A hand-cranked runner for exercising the decorator layers: commands
    //! queue on invoke, and each run_commands call completes the oldest one.

    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Default)]
    pub struct ManualState {
        queue: VecDeque<OnDone>,
        pub started: Vec<String>,
        pub max_in_flight: usize,
    }

    pub struct ManualRunner {
        state: Rc<RefCell<ManualState>>,
    }

    impl ManualRunner {
        pub fn new() -> (ManualRunner, Rc<RefCell<ManualState>>) {
            let state = Rc::new(RefCell::new(ManualState::default()));
            (
                ManualRunner {
                    state: state.clone(),
                },
                state,
            )
        }
    }

    impl CommandRunner for ManualRunner {
        fn invoke(&mut self, command: &str, _pool: &str, on_done: OnDone) {
            let mut state = self.state.borrow_mut();
            state.started.push(command.to_owned());
            state.queue.push_back(on_done);
            state.max_in_flight = state.max_in_flight.max(state.queue.len());
        }

        fn size(&self) -> usize {
            self.state.borrow().queue.len()
        }

        fn can_run_more(&self) -> bool {
            true
        }

        fn run_commands(&mut self) -> bool {
            let next = self.state.borrow_mut().queue.pop_front();
            if let Some(on_done) = next {
                on_done(CommandResult::untraced(Termination::Success, Vec::new()));
            }
            false
        }
    }
}
