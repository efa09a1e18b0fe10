//! Filesystem access and path-safety checks.
//!
//! Every call here touches at most one `blksize` chunk, so the blocking
//! `std::fs` I/O is bounded per iteration (spec §5) and does not need its
//! own thread or an async-trait abstraction.

use super::error::Error;
use super::{DataSink, DataSource};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Joins `filename` onto `root`. Does not touch the filesystem; callers
/// canonicalize afterwards once the file is known to exist (or, for WRQ,
/// canonicalize the parent directory before creating it).
pub fn join(root: &Path, filename: &str) -> PathBuf {
    let mut path = PathBuf::from(root);
    path.push(filename);
    path
}

/// Canonicalizes `path` and checks the result still lives under `root`
/// (testable property 8). `root` itself must already be canonical.
pub fn ensure_within_root(root: &Path, path: &Path) -> Result<PathBuf, Error> {
    let canonical = path
        .canonicalize()
        .map_err(|_| Error::AccessViolation("path does not resolve under root"))?;
    if !canonical.starts_with(root) {
        return Err(Error::AccessViolation("path escapes configured root"));
    }
    Ok(canonical)
}

/// Like [`ensure_within_root`] but for a path that may not exist yet (WRQ
/// target): canonicalizes the parent directory and rejoins the file name.
pub fn ensure_parent_within_root(root: &Path, path: &Path) -> Result<PathBuf, Error> {
    let parent = path.parent().unwrap_or(root);
    let name = path
        .file_name()
        .ok_or(Error::AccessViolation("missing filename"))?;
    let canonical_parent = ensure_within_root(root, parent)?;
    Ok(canonical_parent.join(name))
}

pub fn open_read(path: &Path) -> Result<File, Error> {
    match File::open(path) {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::FileNotFound),
        Err(e) => Err(Error::Io(e)),
    }
}

pub fn open_create(path: &Path, allow_overwrite: bool) -> Result<File, Error> {
    let mut opts = OpenOptions::new();
    opts.write(true);
    if allow_overwrite {
        opts.create(true).truncate(true);
    } else {
        opts.create_new(true);
    }

    match opts.open(path) {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Error::FileExists),
        Err(e) => Err(Error::Io(e)),
    }
}

pub fn source_reader(source: DataSource) -> Result<Box<dyn Read + Send>, Error> {
    match source {
        DataSource::Path(path) => Ok(Box::new(open_read(&path)?)),
        DataSource::Stdin => Ok(Box::new(std::io::stdin())),
        DataSource::Reader(reader) => Ok(reader),
    }
}

pub fn sink_writer(sink: DataSink, allow_overwrite: bool) -> Result<Box<dyn Write + Send>, Error> {
    match sink {
        DataSink::Path(path) => Ok(Box::new(open_create(&path, allow_overwrite)?)),
        DataSink::Stdout => Ok(Box::new(std::io::stdout())),
        DataSink::Writer(writer) => Ok(writer),
    }
}
