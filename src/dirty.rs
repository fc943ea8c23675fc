//! Decides whether a step has to re-run.
//!
//! The check runs against the fingerprint lists the previous invocation
//! recorded, not against the manifest: a command may have read more files
//! than it declared, and those extra reads were captured at completion time.

use crate::db::Invocations;
use crate::fingerprint::{self, Fingerprint, MatchesResult};
use crate::fs::FileSystem;
use crate::hash::Hash;
use crate::paths::{PathId, Paths};
use hashbrown::HashMap;
use std::io;

/// Memoizes fingerprint match results within one build, so a file shared by
/// many steps is hashed at most once per recorded fingerprint.
pub type MatchMemo = HashMap<(PathId, Fingerprint), MatchesResult>;

#[derive(Debug, PartialEq, Eq)]
pub enum CleanResult {
    Dirty,
    Clean {
        /// True when some match was decided by hashing; retaking those
        /// fingerprints makes the next build cheaper.
        needs_refresh: bool,
    },
}

pub fn fingerprint_matches(
    memo: &mut MatchMemo,
    fs: &dyn FileSystem,
    paths: &Paths,
    pid: PathId,
    fp: &Fingerprint,
) -> io::Result<MatchesResult> {
    if let Some(&result) = memo.get(&(pid, *fp)) {
        return Ok(result);
    }
    let result = fingerprint::matches(fs, paths.name(pid), fp)?;
    memo.insert((pid, *fp), result);
    Ok(result)
}

/// Drop memoized results for a path, after a command (re)wrote it.
pub fn forget_path(memo: &mut MatchMemo, pid: PathId) {
    memo.retain(|(p, _), _| *p != pid);
}

/// Is the step with this identity clean?  A step with no recorded invocation
/// is dirty; otherwise every recorded output and input fingerprint must
/// still match.
pub fn is_clean(
    memo: &mut MatchMemo,
    fs: &dyn FileSystem,
    paths: &Paths,
    invocations: &Invocations,
    step: &Hash,
) -> io::Result<CleanResult> {
    let Some(entry) = invocations.entries.get(step) else {
        return Ok(CleanResult::Dirty);
    };
    let mut needs_refresh = false;
    for (pid, fp) in entry.outputs.iter().chain(entry.inputs.iter()) {
        let result = fingerprint_matches(memo, fs, paths, *pid, fp)?;
        if !result.clean {
            return Ok(CleanResult::Dirty);
        }
        needs_refresh |= result.should_update;
    }
    Ok(CleanResult::Clean { needs_refresh })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Entry;
    use crate::fs::RealFileSystem;

    struct Space {
        dir: tempfile::TempDir,
        fs: RealFileSystem,
        paths: Paths,
    }

    impl Space {
        fn new() -> Space {
            Space {
                dir: tempfile::tempdir().unwrap(),
                fs: RealFileSystem::new(),
                paths: Paths::new(),
            }
        }

        fn write(&mut self, name: &str, content: &str) -> PathId {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            self.paths.intern(path.to_str().unwrap())
        }

        fn fingerprint(&self, pid: PathId, now: i64) -> Fingerprint {
            fingerprint::take(&self.fs, now, self.paths.name(pid)).unwrap()
        }
    }

    fn future() -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
            + 10
    }

    #[test]
    fn unrecorded_step_is_dirty() {
        let space = Space::new();
        let mut memo = MatchMemo::new();
        let invocations = Invocations::default();
        let result = is_clean(
            &mut memo,
            &space.fs,
            &space.paths,
            &invocations,
            &Hash::of_bytes(b"step"),
        )
        .unwrap();
        assert_eq!(result, CleanResult::Dirty);
    }

    #[test]
    fn untouched_files_are_clean() {
        let mut space = Space::new();
        let input = space.write("in", "source");
        let output = space.write("out", "object");
        let now = future();

        let step = Hash::of_bytes(b"step");
        let mut invocations = Invocations::default();
        invocations.entries.insert(
            step,
            Entry {
                outputs: vec![(output, space.fingerprint(output, now))],
                inputs: vec![(input, space.fingerprint(input, now))],
            },
        );

        let mut memo = MatchMemo::new();
        let result = is_clean(&mut memo, &space.fs, &space.paths, &invocations, &step).unwrap();
        assert_eq!(
            result,
            CleanResult::Clean {
                needs_refresh: false
            }
        );
    }

    #[test]
    fn changed_input_makes_step_dirty() {
        let mut space = Space::new();
        let input = space.write("in", "source");
        let output = space.write("out", "object");
        let now = future();

        let step = Hash::of_bytes(b"step");
        let mut invocations = Invocations::default();
        invocations.entries.insert(
            step,
            Entry {
                outputs: vec![(output, space.fingerprint(output, now))],
                inputs: vec![(input, space.fingerprint(input, now))],
            },
        );

        space.write("in", "edited");
        let mut memo = MatchMemo::new();
        let result = is_clean(&mut memo, &space.fs, &space.paths, &invocations, &step).unwrap();
        assert_eq!(result, CleanResult::Dirty);
    }

    #[test]
    fn deleted_output_makes_step_dirty() {
        let mut space = Space::new();
        let output = space.write("out", "object");
        let now = future();

        let step = Hash::of_bytes(b"step");
        let mut invocations = Invocations::default();
        invocations.entries.insert(
            step,
            Entry {
                outputs: vec![(output, space.fingerprint(output, now))],
                inputs: vec![],
            },
        );

        std::fs::remove_file(space.dir.path().join("out")).unwrap();
        let mut memo = MatchMemo::new();
        let result = is_clean(&mut memo, &space.fs, &space.paths, &invocations, &step).unwrap();
        assert_eq!(result, CleanResult::Dirty);
    }

    #[test]
    fn racy_fingerprints_ask_for_a_refresh() {
        let mut space = Space::new();
        let input = space.write("in", "source");
        // Capture at the file's own mtime: within the racy window.
        let mtime = space
            .fs
            .metadata(space.paths.name(input))
            .unwrap()
            .unwrap()
            .mtime;

        let step = Hash::of_bytes(b"step");
        let mut invocations = Invocations::default();
        invocations.entries.insert(
            step,
            Entry {
                outputs: vec![],
                inputs: vec![(input, space.fingerprint(input, mtime))],
            },
        );

        let mut memo = MatchMemo::new();
        let result = is_clean(&mut memo, &space.fs, &space.paths, &invocations, &step).unwrap();
        assert_eq!(result, CleanResult::Clean { needs_refresh: true });
    }

    #[test]
    fn memo_is_invalidated_per_path() {
        let mut space = Space::new();
        let input = space.write("in", "source");
        let now = future();
        let fp = space.fingerprint(input, now);

        let mut memo = MatchMemo::new();
        let first =
            fingerprint_matches(&mut memo, &space.fs, &space.paths, input, &fp).unwrap();
        assert!(first.clean);

        // An edit behind the memo's back is invisible until the path is
        // forgotten.
        space.write("in", "edited");
        let stale =
            fingerprint_matches(&mut memo, &space.fs, &space.paths, input, &fp).unwrap();
        assert!(stale.clean);
        forget_path(&mut memo, input);
        let fresh =
            fingerprint_matches(&mut memo, &space.fs, &space.paths, input, &fp).unwrap();
        assert!(!fresh.clean);
    }
}
