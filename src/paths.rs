//! Canonicalized, interned file paths.
//!
//! Every path that enters the system (from the manifest, the invocation log,
//! or a traced command) is canonicalized and mapped to a PathId.  Two
//! spellings of the same file yield the same id, which is what lets the graph
//! and the log compare files without string comparisons.  The interner is
//! insert-only; ids are stable for its lifetime.

use crate::canon::canon_path;
use crate::densemap::{self, DenseMap};
use ahash::RandomState;
use hashbrown::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(u32);

impl densemap::Id for PathId {
    fn from_usize(n: usize) -> Self {
        PathId(n as u32)
    }
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Default)]
pub struct Paths {
    by_name: HashMap<String, PathId, RandomState>,
    names: DenseMap<PathId, String>,
}

impl Paths {
    pub fn new() -> Self {
        Paths::default()
    }

    /// Map a path to its id, canonicalizing and inserting if new.
    pub fn intern(&mut self, path: &str) -> PathId {
        let canon = canon_path(path);
        match self.by_name.get(&canon) {
            Some(&id) => id,
            None => {
                let id = self.names.push(canon.clone());
                self.by_name.insert(canon, id);
                id
            }
        }
    }

    /// Look a path up without inserting.
    pub fn lookup(&self, path: &str) -> Option<PathId> {
        self.by_name.get(&canon_path(path)).copied()
    }

    pub fn name(&self, id: PathId) -> &str {
        self.names.get(id)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
