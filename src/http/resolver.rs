//! Maps request targets onto files under the document root.

use crate::config::StaticFilesConfig;
use crate::http::response::StatusCode;
use memmap2::{Mmap, MmapOptions};
use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

/// Permission bit for "readable by others".
const WORLD_READABLE: u32 = 0o004;

/// What a request target resolved to.
#[derive(Debug)]
pub enum Resolution {
    File(FileBody),
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Resolution {
    pub fn status(&self) -> StatusCode {
        match self {
            Resolution::File(_) => StatusCode::Ok,
            Resolution::BadRequest => StatusCode::BadRequest,
            Resolution::Forbidden => StatusCode::Forbidden,
            Resolution::NotFound => StatusCode::NotFound,
            Resolution::InternalError => StatusCode::InternalServerError,
        }
    }
}

/// Body of a successful response.
///
/// Dropping the value releases the mapping or the file handle.
#[derive(Debug)]
pub enum FileBody {
    /// Zero-length file; nothing to map.
    Empty,
    /// Read-only private mapping of the whole file.
    Mapped(Mmap),
    /// Chunked positional reads, for files too large to map.
    Streamed(FileStream),
}

impl FileBody {
    pub fn len(&self) -> u64 {
        match self {
            FileBody::Empty => 0,
            FileBody::Mapped(map) => map.len() as u64,
            FileBody::Streamed(stream) => stream.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, FileBody::Mapped(_))
    }

    /// Unsent bytes starting at `offset`. For streamed bodies this is the
    /// rest of the current chunk, which may be shorter than the remainder.
    pub fn remaining_from(&mut self, offset: u64) -> io::Result<&[u8]> {
        match self {
            FileBody::Empty => Ok(&[]),
            FileBody::Mapped(map) => Ok(&map[offset as usize..]),
            FileBody::Streamed(stream) => stream.chunk_at(offset),
        }
    }
}

#[derive(Debug)]
pub struct FileStream {
    file: File,
    len: u64,
    chunk: Vec<u8>,
    chunk_start: u64,
    chunk_size: usize,
}

impl FileStream {
    fn new(file: File, len: u64, chunk_size: usize) -> Self {
        Self {
            file,
            len,
            chunk: Vec::new(),
            chunk_start: 0,
            chunk_size,
        }
    }

    fn chunk_at(&mut self, offset: u64) -> io::Result<&[u8]> {
        if offset >= self.len {
            return Ok(&[]);
        }

        let chunk_end = self.chunk_start + self.chunk.len() as u64;
        if offset < self.chunk_start || offset >= chunk_end {
            let want = (self.len - offset).min(self.chunk_size as u64) as usize;
            self.chunk.resize(want, 0);
            // Fails with UnexpectedEof if the file shrank underneath us.
            self.file.read_exact_at(&mut self.chunk, offset)?;
            self.chunk_start = offset;
        }
        Ok(&self.chunk[(offset - self.chunk_start) as usize..])
    }
}

/// Document root plus the limits that govern how files are served.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
    max_path_len: usize,
    mmap_threshold: u64,
    chunk_size: usize,
}

impl StaticFiles {
    pub fn new(config: &StaticFilesConfig) -> Self {
        Self {
            root: config.root.clone(),
            max_path_len: config.max_path_len,
            mmap_threshold: config.mmap_threshold,
            chunk_size: config.stream_chunk_size,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Joins `target` onto the root, bounded by the configured maximum length.
    pub fn full_path(&self, target: &[u8]) -> Option<PathBuf> {
        let root = self.root.as_os_str().as_bytes();
        let len = root.len() + target.len();
        if len > self.max_path_len {
            return None;
        }

        let mut path = Vec::with_capacity(len);
        path.extend_from_slice(root);
        path.extend_from_slice(target);
        Some(PathBuf::from(OsString::from_vec(path)))
    }

    pub fn resolve(&self, target: &[u8]) -> Resolution {
        if Path::new(OsStr::from_bytes(target))
            .components()
            .any(|c| c == Component::ParentDir)
        {
            return Resolution::Forbidden;
        }

        let Some(path) = self.full_path(target) else {
            tracing::warn!(
                target = %String::from_utf8_lossy(target),
                max_path_len = self.max_path_len,
                "resolved path exceeds limit"
            );
            return Resolution::InternalError;
        };

        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) => return Self::classify(&path, &e),
        };

        if meta.permissions().mode() & WORLD_READABLE == 0 {
            return Resolution::Forbidden;
        }
        if meta.is_dir() {
            return Resolution::BadRequest;
        }

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => return Self::classify(&path, &e),
        };

        let len = meta.len();
        if len == 0 {
            return Resolution::File(FileBody::Empty);
        }
        if len > self.mmap_threshold {
            return Resolution::File(FileBody::Streamed(FileStream::new(file, len, self.chunk_size)));
        }

        // SAFETY: the mapping is private and read-only; a concurrent
        // truncation of the file is the only way to invalidate it.
        match unsafe { MmapOptions::new().map_copy_read_only(&file) } {
            Ok(map) => Resolution::File(FileBody::Mapped(map)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "mmap failed, streaming instead");
                Resolution::File(FileBody::Streamed(FileStream::new(file, len, self.chunk_size)))
            }
        }
    }

    fn classify(path: &Path, err: &io::Error) -> Resolution {
        match err.kind() {
            io::ErrorKind::NotFound => Resolution::NotFound,
            io::ErrorKind::PermissionDenied => Resolution::Forbidden,
            _ if err.raw_os_error() == Some(libc::ENOTDIR) => Resolution::NotFound,
            _ => {
                tracing::warn!(path = %path.display(), error = %err, "failed to resolve file");
                Resolution::InternalError
            }
        }
    }
}
