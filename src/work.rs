//! The build scheduler: decides which steps run, feeds them to the runner,
//! and records what happened in the invocation log.
//!
//! The scheduler is single-threaded and cooperative.  It owns the ready
//! queue, the fingerprint memo and the log writer; command completions
//! arrive only through runner.run_commands(), which is the loop's one
//! suspension point.  A step's log record is appended before any dependent
//! learns the step finished, so a crash in between re-runs the step on the
//! next build, which is correct.

use crate::db::{Entry, InvocationLog, Invocations};
use crate::dirty::{self, CleanResult, MatchMemo};
use crate::fingerprint;
use crate::fs::FileSystem;
use crate::graph::{BuildError, Graph, StepId};
use crate::paths::{PathId, Paths};
use crate::progress::Progress;
use crate::runner::{CommandResult, CommandRunner, OnDone, Termination};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

pub struct BuildOptions {
    pub parallelism: usize,
    /// Stop admitting new commands once this many have failed.
    pub failures_allowed: usize,
    pub max_load_average: f64,
    /// Pretend every command succeeds without running it.
    pub dry_run: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            parallelism: 1,
            failures_allowed: 1,
            max_load_average: 0.0,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Want,
    Ready,
    Running,
    Done,
    Failed,
}

impl BuildState {
    fn index(self) -> usize {
        match self {
            BuildState::Want => 0,
            BuildState::Ready => 1,
            BuildState::Running => 2,
            BuildState::Done => 3,
            BuildState::Failed => 4,
        }
    }
}

/// How many steps are in each state; drives the progress display.
#[derive(Default, Clone)]
pub struct StateCounts([usize; 5]);

impl StateCounts {
    pub fn get(&self, state: BuildState) -> usize {
        self.0[state.index()]
    }

    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }

    pub fn finished(&self) -> usize {
        self.get(BuildState::Done) + self.get(BuildState::Failed)
    }

    fn inc(&mut self, state: BuildState) {
        self.0[state.index()] += 1;
    }

    fn dec(&mut self, state: BuildState) {
        self.0[state.index()] -= 1;
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    /// All wanted steps are satisfied; tasks_ran commands were executed.
    Finished { tasks_ran: usize },
    Failed,
    Interrupted,
}

pub type Clock = Box<dyn Fn() -> i64>;

pub fn system_clock() -> Clock {
    use std::time::{SystemTime, UNIX_EPOCH};
    Box::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    })
}

pub struct Work<'a> {
    fs: &'a dyn FileSystem,
    paths: &'a mut Paths,
    graph: &'a Graph,
    invocations: &'a Invocations,
    log: &'a mut dyn InvocationLog,
    runner: &'a mut dyn CommandRunner,
    progress: &'a mut dyn Progress,
    options: &'a BuildOptions,
    clock: Clock,

    wanted: Vec<StepId>,
    memo: MatchMemo,
    states: HashMap<StepId, BuildState>,
    counts: StateCounts,
    /// Scheduled steps whose own fingerprints were clean at planning time;
    /// they re-check when they become ready, and are skipped if an upstream
    /// re-run produced identical content.
    recheck: HashSet<StepId>,
    /// Remaining unfinished dependency steps per scheduled step.
    pending_deps: HashMap<StepId, usize>,
    ready: VecDeque<StepId>,
    finished: Rc<RefCell<Vec<(StepId, CommandResult)>>>,
    tasks_ran: usize,
    failures: usize,
    interrupted: bool,
}

impl<'a> Work<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fs: &'a dyn FileSystem,
        paths: &'a mut Paths,
        graph: &'a Graph,
        invocations: &'a Invocations,
        log: &'a mut dyn InvocationLog,
        runner: &'a mut dyn CommandRunner,
        progress: &'a mut dyn Progress,
        options: &'a BuildOptions,
        clock: Clock,
    ) -> Self {
        Work {
            fs,
            paths,
            graph,
            invocations,
            log,
            runner,
            progress,
            options,
            clock,
            wanted: Vec::new(),
            memo: MatchMemo::new(),
            states: HashMap::new(),
            counts: StateCounts::default(),
            recheck: HashSet::new(),
            pending_deps: HashMap::new(),
            ready: VecDeque::new(),
            finished: Rc::new(RefCell::new(Vec::new())),
            tasks_ran: 0,
            failures: 0,
            interrupted: false,
        }
    }

    /// Ask for a target.  A file nothing produces is fine if it exists on
    /// disk (a source file); otherwise the target is unknown.
    pub fn want_path(&mut self, pid: PathId) -> anyhow::Result<()> {
        match self.graph.producer(pid) {
            Some(step) => {
                if !self.wanted.contains(&step) {
                    self.wanted.push(step);
                }
                Ok(())
            }
            None => {
                if self.fs.metadata(self.paths.name(pid))?.is_some() {
                    Ok(())
                } else {
                    Err(BuildError::UnknownTarget {
                        name: self.paths.name(pid).to_owned(),
                    }
                    .into())
                }
            }
        }
    }

    pub fn run(&mut self) -> anyhow::Result<BuildOutcome> {
        self.plan()?;
        loop {
            // Admit ready steps while the runner will take them.  When
            // nothing is in flight admit one regardless, so a high load
            // average cannot stall the build with zero commands running.
            while !self.interrupted
                && self.failures < self.options.failures_allowed
                && !self.ready.is_empty()
                && (self.runner.can_run_more() || self.runner.empty())
            {
                let id = self.ready.pop_front().unwrap();
                self.start_step(id)?;
            }
            if self.runner.empty() {
                break;
            }
            if self.runner.run_commands() {
                self.interrupted = true;
            }
            let finished = std::mem::take(&mut *self.finished.borrow_mut());
            for (id, result) in finished {
                self.handle_finished(id, result)?;
            }
        }

        if self.interrupted {
            Ok(BuildOutcome::Interrupted)
        } else if self.failures > 0 {
            Ok(BuildOutcome::Failed)
        } else {
            Ok(BuildOutcome::Finished {
                tasks_ran: self.tasks_ran,
            })
        }
    }

    /// Walk the wanted steps in dependency order, decide per step whether it
    /// must run, and seed the ready queue.
    fn plan(&mut self) -> anyhow::Result<()> {
        let order = self.graph.topo_order(self.paths, &self.wanted)?;
        for id in order {
            let step = self.graph.steps.get(id);
            let deps = self.graph.dep_steps(id);
            let pending: usize = deps
                .iter()
                .filter(|dep| self.states.contains_key(dep))
                .count();

            let own = if step.phony() {
                CleanResult::Clean {
                    needs_refresh: false,
                }
            } else {
                dirty::is_clean(
                    &mut self.memo,
                    self.fs,
                    self.paths,
                    self.invocations,
                    &step.identity,
                )?
            };

            if pending == 0 {
                if let CleanResult::Clean { needs_refresh } = own {
                    // Satisfied without running.
                    if needs_refresh {
                        self.refresh_entry(id)?;
                    }
                    continue;
                }
            } else if matches!(own, CleanResult::Clean { .. }) {
                // Only scheduled because something upstream is.  When every
                // scheduled producer is a restat step, the edge does not
                // trigger us by itself: re-check once the upstream work has
                // actually happened, and skip if it reproduced identical
                // content.  A non-restat producer triggers us regardless.
                let restat_edges_only = deps.iter().all(|dep| {
                    !self.states.contains_key(dep) || self.graph.steps.get(*dep).restat
                });
                if restat_edges_only {
                    self.recheck.insert(id);
                }
            }

            let state = if pending == 0 {
                self.ready.push_back(id);
                BuildState::Ready
            } else {
                self.pending_deps.insert(id, pending);
                BuildState::Want
            };
            self.states.insert(id, state);
            self.counts.inc(state);
        }
        self.progress.update(&self.counts);
        Ok(())
    }

    fn set_state(&mut self, id: StepId, state: BuildState) {
        if let Some(old) = self.states.insert(id, state) {
            self.counts.dec(old);
        }
        self.counts.inc(state);
        self.progress.update(&self.counts);
    }

    fn start_step(&mut self, id: StepId) -> anyhow::Result<()> {
        let step = self.graph.steps.get(id);
        if step.phony() {
            return self.finish_step(id);
        }
        // Membership in the recheck set means every scheduled producer was
        // a restat step, so identical re-produced content must not trigger
        // this step.
        if self.recheck.contains(&id) {
            let result = dirty::is_clean(
                &mut self.memo,
                self.fs,
                self.paths,
                self.invocations,
                &step.identity,
            )?;
            if let CleanResult::Clean { needs_refresh } = result {
                if needs_refresh {
                    self.refresh_entry(id)?;
                }
                return self.finish_step(id);
            }
        }

        if !self.options.dry_run {
            self.create_output_dirs(id)?;
        }
        self.progress.task_started(id, step);
        self.set_state(id, BuildState::Running);
        let finished = Rc::clone(&self.finished);
        let on_done: OnDone = Box::new(move |result| {
            finished.borrow_mut().push((id, result));
        });
        self.runner
            .invoke(step.command.as_deref().unwrap(), &step.pool, on_done);
        Ok(())
    }

    fn handle_finished(&mut self, id: StepId, result: CommandResult) -> anyhow::Result<()> {
        let step = self.graph.steps.get(id);
        self.progress.task_finished(id, step, &result);
        match result.termination {
            Termination::Interrupted => {
                self.interrupted = true;
                self.set_state(id, BuildState::Failed);
                Ok(())
            }
            Termination::Failure => {
                self.failures += 1;
                self.set_state(id, BuildState::Failed);
                Ok(())
            }
            Termination::Success => {
                if self.record_success(id, &result)? {
                    self.tasks_ran += 1;
                    self.finish_step(id)
                } else {
                    self.failures += 1;
                    self.set_state(id, BuildState::Failed);
                    Ok(())
                }
            }
        }
    }

    /// Fingerprint what the command read and wrote and append the log
    /// record.  Returns false when a declared output is missing, which
    /// converts the success into a failure.
    fn record_success(&mut self, id: StepId, result: &CommandResult) -> anyhow::Result<bool> {
        if self.options.dry_run {
            return Ok(true);
        }
        let step = self.graph.steps.get(id);
        let now = (self.clock)();

        let mut outputs: Vec<PathId> = step.outs.clone();
        for path in &result.observed_outputs {
            let pid = self.paths.intern(path);
            if !outputs.contains(&pid) {
                outputs.push(pid);
            }
        }
        // The tracer's input report is a superset of the manifest's view;
        // record the union so the next dirtiness check sees every read.
        let mut inputs: Vec<PathId> = Vec::new();
        for &pid in &step.ins {
            if !inputs.contains(&pid) {
                inputs.push(pid);
            }
        }
        for path in &result.observed_inputs {
            let pid = self.paths.intern(path);
            if !inputs.contains(&pid) && !outputs.contains(&pid) {
                inputs.push(pid);
            }
        }

        for &out in &step.outs {
            if self.fs.metadata(self.paths.name(out))?.is_none() {
                self.progress.log(&format!(
                    "output {} missing after successful command",
                    self.paths.name(out)
                ));
                return Ok(false);
            }
        }

        let prior = self.invocations.entries.get(&step.identity);
        let mut entry = Entry::default();
        for pid in outputs {
            dirty::forget_path(&mut self.memo, pid);
            let fp = fingerprint::take(self.fs, now, self.paths.name(pid))?;
            entry.outputs.push((pid, fp));
        }
        for pid in inputs {
            // Re-use the prior fingerprint when the file is unchanged;
            // retake only stats in that case.
            let old = prior.and_then(|entry| {
                entry
                    .inputs
                    .iter()
                    .find(|(p, _)| *p == pid)
                    .map(|(_, fp)| *fp)
            });
            let fp = match old {
                Some(old) => fingerprint::retake(self.fs, now, self.paths.name(pid), &old)?,
                None => fingerprint::take(self.fs, now, self.paths.name(pid))?,
            };
            entry.inputs.push((pid, fp));
        }

        // A log write failure does not retroactively fail the command; the
        // step merely re-runs next build.
        if let Err(err) = self.log.ran_command(self.paths, step.identity, entry) {
            self.progress
                .log(&format!("shk: warning: invocation log write failed: {:#}", err));
        }
        Ok(true)
    }

    /// Mark a step satisfied and hand readiness to its dependents.
    fn finish_step(&mut self, id: StepId) -> anyhow::Result<()> {
        self.set_state(id, BuildState::Done);
        let step = self.graph.steps.get(id);
        let mut dependents: HashSet<StepId> = HashSet::new();
        for &out in &step.outs {
            for &consumer in self.graph.consumers(out) {
                if self.states.get(&consumer) == Some(&BuildState::Want) {
                    dependents.insert(consumer);
                }
            }
        }
        for dependent in dependents {
            let pending = self
                .pending_deps
                .get_mut(&dependent)
                .expect("want state implies pending count");
            *pending -= 1;
            if *pending == 0 {
                self.pending_deps.remove(&dependent);
                self.set_state(dependent, BuildState::Ready);
                self.ready.push_back(dependent);
            }
        }
        Ok(())
    }

    /// Rewrite a clean step's log entry with freshly-taken fingerprints, so
    /// the next build can decide on stat data alone.
    fn refresh_entry(&mut self, id: StepId) -> anyhow::Result<()> {
        let identity = self.graph.steps.get(id).identity;
        let Some(prior) = self.invocations.entries.get(&identity) else {
            return Ok(());
        };
        let now = (self.clock)();
        let mut entry = Entry::default();
        for (pid, fp) in &prior.outputs {
            let fp = fingerprint::retake(self.fs, now, self.paths.name(*pid), fp)?;
            entry.outputs.push((*pid, fp));
        }
        for (pid, fp) in &prior.inputs {
            let fp = fingerprint::retake(self.fs, now, self.paths.name(*pid), fp)?;
            entry.inputs.push((*pid, fp));
        }
        // Purely an optimization for the next build; losing it is fine.
        if let Err(err) = self.log.ran_command(self.paths, identity, entry) {
            self.progress
                .log(&format!("shk: warning: invocation log write failed: {:#}", err));
        }
        Ok(())
    }

    /// Make the directories a step's declared outputs land in, recording
    /// the ones the build itself created.
    fn create_output_dirs(&mut self, id: StepId) -> anyhow::Result<()> {
        let step = self.graph.steps.get(id);
        let names: Vec<String> = step
            .outs
            .iter()
            .map(|&out| self.paths.name(out).to_owned())
            .collect();
        for name in names {
            for dir in parent_dirs(&name) {
                if self.fs.metadata(&dir)?.is_some() {
                    continue;
                }
                self.fs
                    .create_dir(&dir)
                    .map_err(|err| anyhow::anyhow!("mkdir {}: {}", dir, err))?;
                let pid = self.paths.intern(&dir);
                self.log.created_directory(self.paths, pid)?;
            }
        }
        Ok(())
    }
}

/// The chain of parent directories of a path, shallowest first, excluding
/// the root.  "a/b/c" yields ["a", "a/b"].
fn parent_dirs(path: &str) -> Vec<String> {
    let mut dirs = Vec::new();
    for (n, byte) in path.bytes().enumerate() {
        if byte == b'/' && n > 0 {
            dirs.push(path[..n].to_owned());
        }
    }
    dirs
}
