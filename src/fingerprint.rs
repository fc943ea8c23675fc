//! Fingerprints: the file-change detector.
//!
//! A fingerprint is the stat information of a file plus a hash of its
//! contents, captured at a known time.  Comparing a fingerprint against the
//! file's current state decides whether a build step has to re-run.  Unlike a
//! timestamp-only check this cannot be fooled by a file modified within the
//! same second as the previous capture: in that window the stat data is
//! inconclusive and the contents are hashed instead.  The algorithm is the
//! one git uses for its index:
//! https://www.kernel.org/pub/software/scm/git/docs/technical/racy-git.txt
//!
//! Fingerprints are written byte-for-byte into the invocation log, so their
//! encoding is explicit and changing it is a log format break.

use crate::fs::{FileSystem, Metadata};
use crate::hash::{Hash, HashBuilder, HASH_LEN};
use std::io;

/// The subset of stat output a fingerprint keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stat {
    pub size: u64,
    pub ino: u64,
    /// Subset of st_mode, enough for the is-directory probe.
    pub mode: u32,
    pub mtime: i64,
    pub ctime: i64,
    pub exists: bool,
}

impl Stat {
    pub fn of(meta: &Option<Metadata>) -> Stat {
        match meta {
            None => Stat::default(),
            Some(m) => Stat {
                size: m.size,
                ino: m.ino,
                mode: m.mode & libc::S_IFMT as u32,
                mtime: m.mtime,
                ctime: m.ctime,
                exists: true,
            },
        }
    }

    pub fn is_dir(&self) -> bool {
        self.exists && self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub stat: Stat,
    /// When the fingerprint was captured, in seconds.
    pub timestamp: i64,
    pub hash: Hash,
}

/// Encoded size on disk: stat fields, an exists word, the capture timestamp
/// and the content hash.  A multiple of 4 so log records stay aligned.
pub const FINGERPRINT_LEN: usize = 8 + 8 + 4 + 8 + 8 + 4 + 8 + HASH_LEN;

impl Fingerprint {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.stat.size.to_le_bytes());
        out.extend_from_slice(&self.stat.ino.to_le_bytes());
        out.extend_from_slice(&self.stat.mode.to_le_bytes());
        out.extend_from_slice(&self.stat.mtime.to_le_bytes());
        out.extend_from_slice(&self.stat.ctime.to_le_bytes());
        out.extend_from_slice(&(self.stat.exists as u32).to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(self.hash.as_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Fingerprint> {
        if buf.len() < FINGERPRINT_LEN {
            return None;
        }
        let u64_at = |ofs: usize| u64::from_le_bytes(buf[ofs..ofs + 8].try_into().unwrap());
        let i64_at = |ofs: usize| i64::from_le_bytes(buf[ofs..ofs + 8].try_into().unwrap());
        let u32_at = |ofs: usize| u32::from_le_bytes(buf[ofs..ofs + 4].try_into().unwrap());
        Some(Fingerprint {
            stat: Stat {
                size: u64_at(0),
                ino: u64_at(8),
                mode: u32_at(16),
                mtime: i64_at(20),
                ctime: i64_at(28),
                exists: u32_at(36) != 0,
            },
            timestamp: i64_at(40),
            hash: Hash::from_slice(&buf[48..48 + HASH_LEN])?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchesResult {
    pub clean: bool,
    /// True when deciding took a content hash.  The caller should then retake
    /// the fingerprint, so the next check can get by on stat alone.
    pub should_update: bool,
}

/// Hash a file's contents, or for a directory the sorted list of its entry
/// names.  Directory fingerprints are shallow on purpose: a step that reads a
/// directory listing depends on the names, not on the files behind them.
pub fn content_hash(fs: &dyn FileSystem, path: &str, is_dir: bool) -> io::Result<Hash> {
    if is_dir {
        let mut names = fs.read_dir(path)?;
        names.sort();
        let mut builder = HashBuilder::new();
        for name in &names {
            builder.write_str(name);
        }
        Ok(builder.finish())
    } else {
        Ok(Hash::of_bytes(&fs.read(path)?))
    }
}

/// Capture the fingerprint of a path.  A missing file gets exists=false and a
/// zero hash; only other I/O errors fail.
pub fn take(fs: &dyn FileSystem, now: i64, path: &str) -> io::Result<Fingerprint> {
    let stat = Stat::of(&fs.metadata(path)?);
    let hash = if stat.exists {
        content_hash(fs, path, stat.is_dir())?
    } else {
        Hash::ZERO
    };
    Ok(Fingerprint {
        stat,
        timestamp: now,
        hash,
    })
}

/// Like take, but returns a copy of old when it is still known-good, saving
/// the content hash.
pub fn retake(
    fs: &dyn FileSystem,
    now: i64,
    path: &str,
    old: &Fingerprint,
) -> io::Result<Fingerprint> {
    let result = matches(fs, path, old)?;
    if result.clean && !result.should_update {
        Ok(*old)
    } else {
        take(fs, now, path)
    }
}

/// Check whether a path still matches a fingerprint.
///
/// When the current stat equals the recorded one and the fingerprint was
/// taken at least a second after the file last changed, the file is clean
/// without looking at its contents.  A younger fingerprint is racy: the file
/// may have been rewritten within the capture second without changing its
/// stat, so the contents decide.
pub fn matches(fs: &dyn FileSystem, path: &str, fp: &Fingerprint) -> io::Result<MatchesResult> {
    let cur = Stat::of(&fs.metadata(path)?);
    if cur.exists != fp.stat.exists {
        return Ok(MatchesResult {
            clean: false,
            should_update: false,
        });
    }
    if !cur.exists {
        return Ok(MatchesResult {
            clean: true,
            should_update: false,
        });
    }
    if cur.is_dir() != fp.stat.is_dir() {
        return Ok(MatchesResult {
            clean: false,
            should_update: false,
        });
    }
    let age = fp.timestamp - fp.stat.mtime.max(fp.stat.ctime);
    if cur == fp.stat && age >= 1 {
        return Ok(MatchesResult {
            clean: true,
            should_update: false,
        });
    }
    let hash = content_hash(fs, path, cur.is_dir())?;
    Ok(MatchesResult {
        clean: hash == fp.hash,
        should_update: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::RealFileSystem;
    use filetime::FileTime;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    struct Space {
        dir: tempfile::TempDir,
    }

    impl Space {
        fn new() -> Space {
            Space {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn path(&self, name: &str) -> String {
            self.dir.path().join(name).to_str().unwrap().to_owned()
        }

        fn write(&self, name: &str, content: &str) -> String {
            let path = self.path(name);
            std::fs::write(&path, content).unwrap();
            path
        }
    }

    #[test]
    fn fresh_fingerprint_matches() {
        let space = Space::new();
        let path = space.write("a", "hello");
        let fs = RealFileSystem::new();

        // Captured "in the future" relative to the file's times, so the
        // non-racy stat-only path is taken.
        let fp = take(&fs, now() + 5, &path).unwrap();
        assert_eq!(
            matches(&fs, &path, &fp).unwrap(),
            MatchesResult {
                clean: true,
                should_update: false
            }
        );
    }

    #[test]
    fn content_change_is_detected() {
        let space = Space::new();
        let path = space.write("a", "hello");
        let fs = RealFileSystem::new();

        let fp = take(&fs, now() + 5, &path).unwrap();
        std::fs::write(&path, "world").unwrap();
        assert!(!matches(&fs, &path, &fp).unwrap().clean);
    }

    #[test]
    fn racy_fingerprint_falls_back_to_hashing() {
        let space = Space::new();
        let path = space.write("a", "hello");
        let fs = RealFileSystem::new();

        // Captured within the same second the file changed: the stat data is
        // inconclusive, so the check must have hashed.
        let mtime = fs.metadata(&path).unwrap().unwrap().mtime;
        let fp = take(&fs, mtime, &path).unwrap();
        let result = matches(&fs, &path, &fp).unwrap();
        assert!(result.clean);
        assert!(result.should_update);
    }

    #[test]
    fn racy_rewrite_with_same_stat_is_caught() {
        let space = Space::new();
        let path = space.write("a", "aaaa");
        let fs = RealFileSystem::new();

        let mtime = fs.metadata(&path).unwrap().unwrap().mtime;
        let fp = take(&fs, mtime, &path).unwrap();
        // Same length, same mtime second: stat alone cannot tell.
        std::fs::write(&path, "bbbb").unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(fp.stat.mtime, 0)).unwrap();
        let result = matches(&fs, &path, &fp).unwrap();
        assert!(!result.clean);
        assert!(result.should_update);
    }

    #[test]
    fn missing_files_fingerprint_as_absent() {
        let space = Space::new();
        let path = space.path("gone");
        let fs = RealFileSystem::new();

        let fp = take(&fs, now(), &path).unwrap();
        assert!(!fp.stat.exists);
        assert_eq!(fp.hash, Hash::ZERO);
        assert_eq!(
            matches(&fs, &path, &fp).unwrap(),
            MatchesResult {
                clean: true,
                should_update: false
            }
        );

        std::fs::write(&path, "appeared").unwrap();
        assert!(!matches(&fs, &path, &fp).unwrap().clean);
    }

    #[test]
    fn directory_fingerprint_tracks_entry_names() {
        let space = Space::new();
        let dir = space.path("d");
        std::fs::create_dir(&dir).unwrap();
        space.write("d/one", "");
        let fs = RealFileSystem::new();

        let fp = take(&fs, now() + 5, &dir).unwrap();
        assert!(fp.stat.is_dir());
        assert!(matches(&fs, &dir, &fp).unwrap().clean);

        space.write("d/two", "");
        assert!(!matches(&fs, &dir, &fp).unwrap().clean);
    }

    #[test]
    fn retake_reuses_clean_fingerprints() {
        let space = Space::new();
        let path = space.write("a", "hello");
        let fs = RealFileSystem::new();

        let fp = take(&fs, now() + 5, &path).unwrap();
        let again = retake(&fs, now() + 6, &path, &fp).unwrap();
        assert_eq!(again, fp);
    }

    #[test]
    fn retake_refreshes_after_touch() {
        let space = Space::new();
        let path = space.write("a", "hello");
        let fs = RealFileSystem::new();

        let fp = take(&fs, now() + 5, &path).unwrap();
        // Bump mtime without changing content; the old fingerprint is stale
        // but the file is clean, so retake must produce a fresh fingerprint.
        filetime::set_file_mtime(&path, FileTime::from_unix_time(fp.stat.mtime + 30, 0)).unwrap();
        let refreshed = retake(&fs, now() + 60, &path, &fp).unwrap();
        assert_ne!(refreshed, fp);
        assert_eq!(refreshed.hash, fp.hash);
        assert!(matches(&fs, &path, &refreshed).unwrap().clean);
    }

    #[test]
    fn encoding_round_trips() {
        let fp = Fingerprint {
            stat: Stat {
                size: 1234,
                ino: 99,
                mode: libc::S_IFREG as u32,
                mtime: 1_700_000_000,
                ctime: 1_700_000_001,
                exists: true,
            },
            timestamp: 1_700_000_002,
            hash: Hash::of_bytes(b"content"),
        };
        let mut buf = Vec::new();
        fp.encode(&mut buf);
        assert_eq!(buf.len(), FINGERPRINT_LEN);
        assert_eq!(Fingerprint::decode(&buf).unwrap(), fp);
    }
}
