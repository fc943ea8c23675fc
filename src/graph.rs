//! The build graph: steps from the manifest, the files they touch, and the
//! producer/consumer edges between them.

use crate::densemap::{self, DenseMap};
use crate::hash::{Hash, HashBuilder};
use crate::paths::{PathId, Paths};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(u32);

impl densemap::Id for StepId {
    fn from_usize(n: usize) -> Self {
        StepId(n as u32)
    }
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One build statement from the manifest.
#[derive(Debug)]
pub struct Step {
    /// The shell command; None for phony steps, which run nothing.
    pub command: Option<String>,
    pub description: Option<String>,
    pub pool: String,
    pub ins: Vec<PathId>,
    pub outs: Vec<PathId>,
    pub generator: bool,
    pub restat: bool,
    /// Stable hash of the step itself; the key into the invocation log.
    pub identity: Hash,
}

impl Step {
    pub fn new(
        paths: &Paths,
        command: Option<String>,
        description: Option<String>,
        pool: String,
        ins: Vec<PathId>,
        outs: Vec<PathId>,
        generator: bool,
        restat: bool,
    ) -> Step {
        let identity = step_identity(
            paths,
            command.as_deref().unwrap_or(""),
            &pool,
            &ins,
            &outs,
            generator,
            restat,
        );
        Step {
            command,
            description,
            pool,
            ins,
            outs,
            generator,
            restat,
            identity,
        }
    }

    pub fn phony(&self) -> bool {
        self.command.is_none()
    }
}

/// Hash the attributes that define a step.  Paths are hashed sorted and by
/// canonical name so the identity survives reordering and re-interning
/// across runs; it changes only when the manifest meaningfully changes.
fn step_identity(
    paths: &Paths,
    command: &str,
    pool: &str,
    ins: &[PathId],
    outs: &[PathId],
    generator: bool,
    restat: bool,
) -> Hash {
    let mut builder = HashBuilder::new();
    builder.write_str(command);
    for ids in [ins, outs] {
        let mut names: Vec<&str> = ids.iter().map(|&pid| paths.name(pid)).collect();
        names.sort_unstable();
        for name in names {
            builder.write_str(name);
        }
        builder.separator();
    }
    builder.write_str(pool);
    builder.write(&[generator as u8 | (restat as u8) << 1]);
    builder.finish()
}

/// Fatal graph-shape problems, discovered while loading or planning.
#[derive(Debug)]
pub enum BuildError {
    DuplicateProducer { path: String },
    Cycle { path: String },
    UnknownTarget { name: String },
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BuildError::DuplicateProducer { path } => {
                write!(f, "multiple steps produce {}", path)
            }
            BuildError::Cycle { path } => {
                write!(f, "dependency cycle involving {}", path)
            }
            BuildError::UnknownTarget { name } => write!(f, "unknown target {:?}", name),
        }
    }
}

impl std::error::Error for BuildError {}

#[derive(Debug, Default, Clone)]
struct FileInfo {
    producer: Option<StepId>,
    consumers: Vec<StepId>,
}

#[derive(Default)]
pub struct Graph {
    pub steps: DenseMap<StepId, Step>,
    files: DenseMap<PathId, FileInfo>,
    pub defaults: Vec<PathId>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn add_step(&mut self, paths: &Paths, step: Step) -> Result<StepId, BuildError> {
        let id = self.steps.next_id();
        for &out in &step.outs {
            let info = self.file_mut(out);
            if info.producer.is_some() {
                return Err(BuildError::DuplicateProducer {
                    path: paths.name(out).to_owned(),
                });
            }
            info.producer = Some(id);
        }
        for &input in &step.ins {
            self.file_mut(input).consumers.push(id);
        }
        Ok(self.steps.push(step))
    }

    fn file_mut(&mut self, pid: PathId) -> &mut FileInfo {
        use densemap::Id;
        if pid.index() >= self.files.len() {
            self.files.set_grow(pid, FileInfo::default(), FileInfo::default());
        }
        self.files.get_mut(pid)
    }

    /// The step whose outputs include this file, if any.
    pub fn producer(&self, pid: PathId) -> Option<StepId> {
        self.files.lookup(pid).and_then(|info| info.producer)
    }

    /// The steps that list this file among their inputs.
    pub fn consumers(&self, pid: PathId) -> &[StepId] {
        match self.files.lookup(pid) {
            Some(info) => &info.consumers,
            None => &[],
        }
    }

    /// The steps this step depends on: the producers of its inputs, deduped,
    /// in input order.
    pub fn dep_steps(&self, id: StepId) -> Vec<StepId> {
        let mut deps = Vec::new();
        for &input in &self.steps.get(id).ins {
            if let Some(producer) = self.producer(input) {
                if !deps.contains(&producer) {
                    deps.push(producer);
                }
            }
        }
        deps
    }

    /// Outputs that no step consumes; what gets built when the manifest
    /// names no defaults.
    pub fn root_outputs(&self) -> Vec<PathId> {
        let mut roots = Vec::new();
        for (_, step) in self.steps.iter() {
            for &out in &step.outs {
                if self.consumers(out).is_empty() {
                    roots.push(out);
                }
            }
        }
        roots
    }

    pub fn default_targets(&self) -> Vec<PathId> {
        if self.defaults.is_empty() {
            self.root_outputs()
        } else {
            self.defaults.clone()
        }
    }

    /// The transitive closure of the wanted steps in dependency order
    /// (dependencies first).  A cycle is a fatal manifest error.
    pub fn topo_order(
        &self,
        paths: &Paths,
        wanted: &[StepId],
    ) -> Result<Vec<StepId>, BuildError> {
        use densemap::Id;
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }
        let mut marks = vec![Mark::New; self.steps.len()];
        let mut order = Vec::new();
        let mut stack: Vec<(StepId, Vec<StepId>, usize)> = Vec::new();

        for &root in wanted {
            if marks[root.index()] == Mark::Done {
                continue;
            }
            marks[root.index()] = Mark::Active;
            stack.push((root, self.dep_steps(root), 0));
            while let Some(frame) = stack.last_mut() {
                if frame.2 < frame.1.len() {
                    let dep = frame.1[frame.2];
                    frame.2 += 1;
                    match marks[dep.index()] {
                        Mark::New => {
                            marks[dep.index()] = Mark::Active;
                            stack.push((dep, self.dep_steps(dep), 0));
                        }
                        Mark::Active => {
                            let step = self.steps.get(dep);
                            let path = step
                                .outs
                                .first()
                                .map(|&out| paths.name(out).to_owned())
                                .unwrap_or_default();
                            return Err(BuildError::Cycle { path });
                        }
                        Mark::Done => {}
                    }
                } else {
                    let (id, _, _) = stack.pop().unwrap();
                    marks[id.index()] = Mark::Done;
                    order.push(id);
                }
            }
        }
        Ok(order)
    }
}
