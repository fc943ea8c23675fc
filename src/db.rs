//! The invocation log: the on-disk record of which commands have run and the
//! fingerprints of the files they read and wrote.
//!
//! The log plays the role Ninja splits between its build log and its deps
//! log.  It is written in a streaming fashion while commands run, so an
//! interrupted build loses at most the record being appended, and it is read
//! back in full at startup.
//!
//! The file is a version header followed by records.  Each record starts
//! with a u32 whose low two bits are the record kind and whose remaining
//! bits are the payload length; payloads are padded to 4-byte alignment.
//! Records are implicitly numbered from 0 in file order, and a record may
//! only refer to records with smaller ids:
//!
//! 0. Path: a NUL-terminated path string, padded with NULs.
//! 1. CreatedDir: the record id of the Path of a directory the build made.
//! 2. Invocation: a step identity hash, a u32 output count, then
//!    (path record id, fingerprint) pairs; outputs first, inputs after.
//! 3. Deleted: a 4-byte payload undoes a CreatedDir by record id; a
//!    hash-sized payload undoes an Invocation by identity.
//!
//! The contents are endian- and platform-specific; log files do not travel
//! between machines.  One process at a time owns the log.

use crate::fingerprint::{Fingerprint, FINGERPRINT_LEN};
use crate::fs::FileSystem;
use crate::hash::{Hash, HASH_LEN};
use crate::paths::{PathId, Paths};
use hashbrown::{HashMap, HashSet};
use std::io::Write;

const MAGIC: &[u8; 8] = b"shk-log\0";
const VERSION: u32 = 1;
const HEADER_LEN: usize = MAGIC.len() + 4;

const KIND_PATH: u32 = 0;
const KIND_CREATED_DIR: u32 = 1;
const KIND_INVOCATION: u32 = 2;
const KIND_DELETED: u32 = 3;

const PAIR_LEN: usize = 4 + FINGERPRINT_LEN;

/// If the file holds more than this many records per live record, appending
/// has outpaced the useful content and a recompaction is worth it.
const RECOMPACTION_RATIO: usize = 3;

/// What one command execution observed, as recorded in the log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    pub outputs: Vec<(PathId, Fingerprint)>,
    pub inputs: Vec<(PathId, Fingerprint)>,
}

/// The logical state of the log once parsed: the surviving invocation per
/// step identity, and the directories the build has created.
#[derive(Default)]
pub struct Invocations {
    pub entries: HashMap<Hash, Entry>,
    pub created_dirs: HashSet<PathId>,
}

/// Write access to an invocation log.  Reading happens separately, up front.
pub trait InvocationLog {
    /// Record that the build created this directory.  Idempotent.
    fn created_directory(&mut self, paths: &Paths, dir: PathId) -> anyhow::Result<()>;

    /// Record that a created directory is gone again.  Unknown directories
    /// are a no-op.
    fn removed_directory(&mut self, paths: &Paths, dir: PathId) -> anyhow::Result<()>;

    /// Record a completed command, replacing any prior entry for the step.
    fn ran_command(&mut self, paths: &Paths, step: Hash, entry: Entry) -> anyhow::Result<()>;

    /// Logically delete the entry for a step whose outputs were cleaned.
    fn cleaned_command(&mut self, step: Hash) -> anyhow::Result<()>;
}

/// Memory-backed log, for dry runs and tests.
#[derive(Default)]
pub struct MemoryLog {
    invocations: Invocations,
}

impl MemoryLog {
    pub fn new() -> Self {
        MemoryLog::default()
    }

    pub fn invocations(&self) -> &Invocations {
        &self.invocations
    }
}

impl InvocationLog for MemoryLog {
    fn created_directory(&mut self, _paths: &Paths, dir: PathId) -> anyhow::Result<()> {
        self.invocations.created_dirs.insert(dir);
        Ok(())
    }

    fn removed_directory(&mut self, _paths: &Paths, dir: PathId) -> anyhow::Result<()> {
        self.invocations.created_dirs.remove(&dir);
        Ok(())
    }

    fn ran_command(&mut self, _paths: &Paths, step: Hash, entry: Entry) -> anyhow::Result<()> {
        self.invocations.entries.insert(step, entry);
        Ok(())
    }

    fn cleaned_command(&mut self, step: Hash) -> anyhow::Result<()> {
        self.invocations.entries.remove(&step);
        Ok(())
    }
}

/// What a parsed record created, kept for resolving back-references.
enum Record {
    Path(PathId),
    Dir(PathId),
    Invocation(Hash),
    Deleted,
}

pub struct ParseResult {
    pub invocations: Invocations,
    /// A non-fatal problem found while parsing, e.g. a truncated tail.
    pub warning: Option<String>,
    pub needs_recompaction: bool,
    path_records: HashMap<PathId, u32>,
    dir_records: HashMap<PathId, u32>,
    record_count: u32,
    /// False when the file is missing or its header is unusable; the writer
    /// then starts the file over.
    header_valid: bool,
}

impl Default for ParseResult {
    fn default() -> Self {
        ParseResult {
            invocations: Invocations::default(),
            warning: None,
            needs_recompaction: false,
            path_records: HashMap::new(),
            dir_records: HashMap::new(),
            record_count: 0,
            header_valid: false,
        }
    }
}

struct Parser<'a> {
    records: Vec<Record>,
    invocations: Invocations,
    path_records: HashMap<PathId, u32>,
    dir_records: HashMap<PathId, u32>,
    paths: &'a mut Paths,
}

impl<'a> Parser<'a> {
    /// Parse one record at `payload`.  Err means the log is corrupt from this
    /// record on and must be truncated here.
    fn parse_record(&mut self, kind: u32, payload: &[u8]) -> Result<(), String> {
        let id = self.records.len() as u32;
        match kind {
            KIND_PATH => {
                let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
                let name = std::str::from_utf8(&payload[..end])
                    .map_err(|_| "path is not valid utf-8".to_string())?;
                if name.is_empty() {
                    return Err("empty path record".to_string());
                }
                let pid = self.paths.intern(name);
                self.path_records.insert(pid, id);
                self.records.push(Record::Path(pid));
            }
            KIND_CREATED_DIR => {
                if payload.len() != 4 {
                    return Err("bad created-dir record size".to_string());
                }
                let pid = self.path_ref(payload, 0)?;
                self.invocations.created_dirs.insert(pid);
                self.dir_records.insert(pid, id);
                self.records.push(Record::Dir(pid));
            }
            KIND_INVOCATION => {
                if payload.len() < HASH_LEN + 4 || (payload.len() - HASH_LEN - 4) % PAIR_LEN != 0 {
                    return Err("bad invocation record size".to_string());
                }
                let step = Hash::from_slice(&payload[..HASH_LEN]).unwrap();
                let output_count = read_u32(payload, HASH_LEN) as usize;
                let pair_count = (payload.len() - HASH_LEN - 4) / PAIR_LEN;
                if output_count > pair_count {
                    return Err("invocation output count exceeds file count".to_string());
                }
                let mut files = Vec::with_capacity(pair_count);
                for n in 0..pair_count {
                    let ofs = HASH_LEN + 4 + n * PAIR_LEN;
                    let pid = self.path_ref(payload, ofs)?;
                    let fp = Fingerprint::decode(&payload[ofs + 4..ofs + PAIR_LEN]).unwrap();
                    files.push((pid, fp));
                }
                let inputs = files.split_off(output_count);
                self.invocations.entries.insert(
                    step,
                    Entry {
                        outputs: files,
                        inputs,
                    },
                );
                self.records.push(Record::Invocation(step));
            }
            KIND_DELETED => {
                if payload.len() == 4 {
                    let r = read_u32(payload, 0);
                    match self.resolve(r) {
                        Some(Record::Dir(pid)) => {
                            let pid = *pid;
                            self.invocations.created_dirs.remove(&pid);
                            self.dir_records.remove(&pid);
                        }
                        _ => return Err("deleted record does not refer to a directory".to_string()),
                    }
                } else if payload.len() == HASH_LEN {
                    let step = Hash::from_slice(payload).unwrap();
                    self.invocations.entries.remove(&step);
                } else {
                    return Err("bad deleted record size".to_string());
                }
                self.records.push(Record::Deleted);
            }
            _ => unreachable!("kind is two bits"),
        }
        Ok(())
    }

    /// Records may only refer backwards.
    fn resolve(&self, id: u32) -> Option<&Record> {
        self.records.get(id as usize)
    }

    fn path_ref(&self, payload: &[u8], ofs: usize) -> Result<PathId, String> {
        let r = read_u32(payload, ofs);
        match self.resolve(r) {
            Some(Record::Path(pid)) => Ok(*pid),
            _ => Err(format!("dangling path reference {}", r)),
        }
    }
}

fn read_u32(buf: &[u8], ofs: usize) -> u32 {
    u32::from_le_bytes(buf[ofs..ofs + 4].try_into().unwrap())
}

/// The number of records a freshly recompacted log would hold.
fn live_record_count(invocations: &Invocations) -> usize {
    let mut live_paths: HashSet<PathId> = invocations.created_dirs.iter().copied().collect();
    for entry in invocations.entries.values() {
        for (pid, _) in entry.outputs.iter().chain(entry.inputs.iter()) {
            live_paths.insert(*pid);
        }
    }
    live_paths.len() + invocations.created_dirs.len() + invocations.entries.len()
}

/// Read the log at log_path.  A missing file yields an empty state.  Corrupt
/// trailing records are cut off on disk and reported as a warning, not an
/// error; that is the normal recovery path after a crash mid-append.
pub fn parse(
    fs: &dyn FileSystem,
    paths: &mut Paths,
    log_path: &str,
) -> anyhow::Result<ParseResult> {
    let data = match fs.read(log_path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ParseResult::default());
        }
        Err(err) => return Err(anyhow::anyhow!("read {}: {}", log_path, err)),
    };

    if data.len() < HEADER_LEN
        || &data[..MAGIC.len()] != MAGIC
        || read_u32(&data, MAGIC.len()) != VERSION
    {
        return Ok(ParseResult {
            warning: Some(format!(
                "invocation log {} has an unusable header; starting over",
                log_path
            )),
            ..ParseResult::default()
        });
    }

    let mut parser = Parser {
        records: Vec::new(),
        invocations: Invocations::default(),
        path_records: HashMap::new(),
        dir_records: HashMap::new(),
        paths,
    };

    let mut ofs = HEADER_LEN;
    let mut corrupt: Option<(usize, String)> = None;
    while ofs < data.len() {
        let start = ofs;
        if data.len() - start < 4 {
            corrupt = Some((start, "trailing bytes shorter than a record header".to_string()));
            break;
        }
        let header = read_u32(&data, start);
        let kind = header & 3;
        let len = (header >> 2) as usize;
        let padded = (len + 3) & !3;
        if start + 4 + padded > data.len() {
            corrupt = Some((start, "record extends past end of file".to_string()));
            break;
        }
        let payload = &data[start + 4..start + 4 + len];
        if let Err(msg) = parser.parse_record(kind, payload) {
            corrupt = Some((start, msg));
            break;
        }
        ofs = start + 4 + padded;
    }

    let warning = match corrupt {
        Some((at, msg)) => {
            fs.truncate(log_path, at as u64)
                .map_err(|err| anyhow::anyhow!("truncate {}: {}", log_path, err))?;
            Some(format!(
                "invocation log {}: {}; dropping {} trailing bytes",
                log_path,
                msg,
                data.len() - at
            ))
        }
        None => None,
    };

    let record_count = parser.records.len() as u32;
    let needs_recompaction =
        record_count as usize > live_record_count(&parser.invocations) * RECOMPACTION_RATIO;
    Ok(ParseResult {
        invocations: parser.invocations,
        warning,
        needs_recompaction,
        path_records: parser.path_records,
        dir_records: parser.dir_records,
        record_count,
        header_valid: true,
    })
}

/// Append access to the log.  Opened after a parse; keeps the parse's path
/// record cache so paths are never written twice.
pub struct Writer {
    w: Box<dyn Write>,
    path_records: HashMap<PathId, u32>,
    dir_records: HashMap<PathId, u32>,
    live: HashSet<Hash>,
    record_count: u32,
}

impl Writer {
    pub fn open(
        fs: &dyn FileSystem,
        log_path: &str,
        parsed: &ParseResult,
    ) -> anyhow::Result<Writer> {
        if !parsed.header_valid {
            let mut header = Vec::with_capacity(HEADER_LEN);
            header.extend_from_slice(MAGIC);
            header.extend_from_slice(&VERSION.to_le_bytes());
            fs.write(log_path, &header)
                .map_err(|err| anyhow::anyhow!("write {}: {}", log_path, err))?;
        }
        let w = fs
            .open_append(log_path)
            .map_err(|err| anyhow::anyhow!("open {}: {}", log_path, err))?;
        Ok(Writer {
            w,
            path_records: parsed.path_records.clone(),
            dir_records: parsed.dir_records.clone(),
            live: parsed.invocations.entries.keys().copied().collect(),
            record_count: parsed.record_count,
        })
    }

    /// True when appends have outpaced live content and the next build should
    /// rewrite the log.
    pub fn recompaction_recommended(&self) -> bool {
        let live = self.path_records.len() + self.dir_records.len() + self.live.len();
        self.record_count as usize > live * RECOMPACTION_RATIO
    }

    fn write_record(&mut self, kind: u32, payload: &[u8]) -> anyhow::Result<u32> {
        debug_assert_eq!(payload.len() % 4, 0);
        let header = ((payload.len() as u32) << 2) | kind;
        self.w.write_all(&header.to_le_bytes())?;
        self.w.write_all(payload)?;
        self.w.flush()?;
        let id = self.record_count;
        self.record_count += 1;
        Ok(id)
    }

    fn ensure_path(&mut self, paths: &Paths, pid: PathId) -> anyhow::Result<u32> {
        if let Some(&id) = self.path_records.get(&pid) {
            return Ok(id);
        }
        let id = self.write_record(KIND_PATH, &encode_path(paths.name(pid)))?;
        self.path_records.insert(pid, id);
        Ok(id)
    }
}

impl InvocationLog for Writer {
    fn created_directory(&mut self, paths: &Paths, dir: PathId) -> anyhow::Result<()> {
        if self.dir_records.contains_key(&dir) {
            return Ok(());
        }
        let path_record = self.ensure_path(paths, dir)?;
        let id = self.write_record(KIND_CREATED_DIR, &path_record.to_le_bytes())?;
        self.dir_records.insert(dir, id);
        Ok(())
    }

    fn removed_directory(&mut self, _paths: &Paths, dir: PathId) -> anyhow::Result<()> {
        let Some(id) = self.dir_records.remove(&dir) else {
            return Ok(());
        };
        self.write_record(KIND_DELETED, &id.to_le_bytes())?;
        Ok(())
    }

    fn ran_command(&mut self, paths: &Paths, step: Hash, entry: Entry) -> anyhow::Result<()> {
        // Path records must precede the invocation that refers to them.
        let mut refs = Vec::with_capacity(entry.outputs.len() + entry.inputs.len());
        for (pid, fp) in entry.outputs.iter().chain(entry.inputs.iter()) {
            refs.push((self.ensure_path(paths, *pid)?, *fp));
        }
        let mut payload = Vec::with_capacity(HASH_LEN + 4 + refs.len() * PAIR_LEN);
        payload.extend_from_slice(step.as_bytes());
        payload.extend_from_slice(&(entry.outputs.len() as u32).to_le_bytes());
        for (record, fp) in &refs {
            payload.extend_from_slice(&record.to_le_bytes());
            fp.encode(&mut payload);
        }
        self.write_record(KIND_INVOCATION, &payload)?;
        self.live.insert(step);
        Ok(())
    }

    fn cleaned_command(&mut self, step: Hash) -> anyhow::Result<()> {
        if !self.live.remove(&step) {
            return Ok(());
        }
        self.write_record(KIND_DELETED, step.as_bytes())?;
        Ok(())
    }
}

fn encode_path(name: &str) -> Vec<u8> {
    let mut bytes = name.as_bytes().to_vec();
    // Always at least one NUL terminator, then pad to alignment.
    let padded = (bytes.len() + 1 + 3) & !3;
    bytes.resize(padded, 0);
    bytes
}

/// Rewrite the log to hold exactly the live state: one Path per referenced
/// path, one CreatedDir per live directory, one Invocation per step.  The
/// new file replaces the old one atomically; a writer still holding the old
/// file must be dropped.  Output order is deterministic, so recompacting an
/// already-minimal log reproduces it byte for byte.
pub fn recompact(
    fs: &dyn FileSystem,
    paths: &Paths,
    invocations: &Invocations,
    log_path: &str,
) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());

    let mut path_records: HashMap<PathId, u32> = HashMap::new();
    let mut count: u32 = 0;
    let mut add = |buf: &mut Vec<u8>, kind: u32, payload: &[u8]| -> u32 {
        buf.extend_from_slice(&(((payload.len() as u32) << 2) | kind).to_le_bytes());
        buf.extend_from_slice(payload);
        let id = count;
        count += 1;
        id
    };

    let mut dirs: Vec<PathId> = invocations.created_dirs.iter().copied().collect();
    dirs.sort_by_key(|&pid| paths.name(pid));
    for pid in dirs {
        let path_record = add(&mut buf, KIND_PATH, &encode_path(paths.name(pid)));
        path_records.insert(pid, path_record);
        add(&mut buf, KIND_CREATED_DIR, &path_record.to_le_bytes());
    }

    let mut steps: Vec<&Hash> = invocations.entries.keys().collect();
    steps.sort();
    for step in steps {
        let entry = &invocations.entries[step];
        let mut refs = Vec::with_capacity(entry.outputs.len() + entry.inputs.len());
        for (pid, fp) in entry.outputs.iter().chain(entry.inputs.iter()) {
            let record = match path_records.get(pid) {
                Some(&record) => record,
                None => {
                    let record = add(&mut buf, KIND_PATH, &encode_path(paths.name(*pid)));
                    path_records.insert(*pid, record);
                    record
                }
            };
            refs.push((record, *fp));
        }
        let mut payload = Vec::with_capacity(HASH_LEN + 4 + refs.len() * PAIR_LEN);
        payload.extend_from_slice(step.as_bytes());
        payload.extend_from_slice(&(entry.outputs.len() as u32).to_le_bytes());
        for (record, fp) in &refs {
            payload.extend_from_slice(&record.to_le_bytes());
            fp.encode(&mut payload);
        }
        add(&mut buf, KIND_INVOCATION, &payload);
    }

    let tmp_path = format!("{}.tmp", log_path);
    fs.write(&tmp_path, &buf)
        .map_err(|err| anyhow::anyhow!("write {}: {}", tmp_path, err))?;
    fs.rename(&tmp_path, log_path)
        .map_err(|err| anyhow::anyhow!("rename {} -> {}: {}", tmp_path, log_path, err))?;
    Ok(())
}
