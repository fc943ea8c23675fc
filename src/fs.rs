//! File system access, behind a trait so fingerprinting and the invocation
//! log code paths can be pointed at scratch directories in tests.

use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;

/// The stat information the rest of the system consumes.  st_dev is left out
/// on purpose: it is not stable over time on network file systems.
#[derive(Debug, Clone, Copy)]
pub struct Metadata {
    pub size: u64,
    pub ino: u64,
    pub mode: u32,
    pub mtime: i64,
    pub ctime: i64,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }
}

pub trait FileSystem {
    /// stat() a path.  A missing file is not an error; it is None.
    fn metadata(&self, path: &str) -> io::Result<Option<Metadata>>;

    fn read(&self, path: &str) -> io::Result<Vec<u8>>;

    /// The names (not full paths) of a directory's entries.
    fn read_dir(&self, path: &str) -> io::Result<Vec<String>>;

    /// Create or replace a file with the given contents.
    fn write(&self, path: &str, data: &[u8]) -> io::Result<()>;

    /// Open a file for appending, creating it if needed.  The returned stream
    /// is used by the invocation log writer.
    fn open_append(&self, path: &str) -> io::Result<Box<dyn Write>>;

    fn truncate(&self, path: &str, len: u64) -> io::Result<()>;

    fn create_dir(&self, path: &str) -> io::Result<()>;

    fn remove_file(&self, path: &str) -> io::Result<()>;

    /// Remove an empty directory.
    fn remove_dir(&self, path: &str) -> io::Result<()>;

    fn rename(&self, from: &str, to: &str) -> io::Result<()>;
}

pub struct RealFileSystem {}

impl RealFileSystem {
    pub fn new() -> Self {
        RealFileSystem {}
    }
}

impl Default for RealFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for RealFileSystem {
    fn metadata(&self, path: &str) -> io::Result<Option<Metadata>> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(Some(Metadata {
                size: meta.size(),
                ino: meta.ino(),
                mode: meta.mode(),
                mtime: meta.mtime(),
                ctime: meta.ctime(),
            })),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn write(&self, path: &str, data: &[u8]) -> io::Result<()> {
        std::fs::write(path, data)
    }

    fn open_append(&self, path: &str) -> io::Result<Box<dyn Write>> {
        let f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Box::new(f))
    }

    fn truncate(&self, path: &str, len: u64) -> io::Result<()> {
        let f = std::fs::OpenOptions::new().write(true).open(path)?;
        f.set_len(len)
    }

    fn create_dir(&self, path: &str) -> io::Result<()> {
        std::fs::create_dir(path)
    }

    fn remove_file(&self, path: &str) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn remove_dir(&self, path: &str) -> io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        std::fs::rename(from, to)
    }
}
