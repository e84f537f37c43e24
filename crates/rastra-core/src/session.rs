//! Container session plumbing.
//!
//! A [`ContainerSession`] owns the open file handle, the requested access
//! mode, the byte offset at which the container starts (containers may be
//! embedded inside a larger stream) and the lock handle for the file's
//! identity. Every structural operation on a container borrows the session,
//! acquires the lock through it, and performs origin-relative positioned
//! I/O through the primitives here.

use crate::error::{Error, Result};
use crate::lock::{FileKey, LockGuard, LockHandle};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Requested access mode for a container session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Structural read only.
    Read,
    /// Read plus incremental rewrite of an existing container.
    Write,
    /// Create a new container, truncating any stale content.
    Create,
}

impl AccessMode {
    /// Returns true for modes that may mutate the file.
    pub fn is_writable(self) -> bool {
        !matches!(self, AccessMode::Read)
    }
}

/// How the pixel-access layer may address blocks within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAccess {
    /// Only whole-image sequential decode is legal.
    Sequential,
    /// Individual lines may be addressed at random.
    RandomLine,
}

/// Derived per-image description handed to the pixel-access layer.
///
/// Computed once during the structural scan and recomputed whenever a
/// frame is appended or a section preceding the raw data changes size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Frame width in pixels.
    pub width: u16,
    /// Frame height in pixels.
    pub height: u16,
    /// Format A: the frame's rows are stored interlaced.
    pub interlaced: bool,
    /// Format B: the pixel payload is run-length compressed.
    pub rle_compressed: bool,
    /// Chosen block-access mode.
    pub access: BlockAccess,
    /// Transparent palette index, if one applies.
    pub transparency: Option<u8>,
    /// Bits per palette index; defaults to 8 when no color table flag is
    /// present.
    pub index_bits: u8,
    /// Origin-relative offset of the first raw-data byte.
    pub data_start: u64,
    /// Origin-relative offset one past the last raw-data byte.
    pub data_end: u64,
}

/// An open container file plus the state shared by all operations on it.
#[derive(Debug)]
pub struct ContainerSession {
    file: File,
    mode: AccessMode,
    origin: u64,
    lock: LockHandle,
    path: PathBuf,
}

impl ContainerSession {
    /// Opens (or, in [`AccessMode::Create`], creates) the container file at
    /// `path`, with the container starting `origin` bytes into the stream.
    pub fn open(path: impl AsRef<Path>, mode: AccessMode, origin: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock = LockHandle::new(FileKey::for_path(&path)?);
        let file = match mode {
            AccessMode::Read => OpenOptions::new().read(true).open(&path)?,
            AccessMode::Write => OpenOptions::new().read(true).write(true).open(&path)?,
            AccessMode::Create => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?,
        };
        debug!(path = ?path, ?mode, origin, "container session opened");
        Ok(Self {
            file,
            mode,
            origin,
            lock,
            path,
        })
    }

    /// The session's access mode.
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Byte offset of the container start within the underlying stream.
    pub fn origin(&self) -> u64 {
        self.origin
    }

    /// Path the session was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquires the exclusive container lock for the scope of the returned
    /// guard.
    pub fn lock(&self) -> Result<LockGuard> {
        self.lock.acquire()
    }

    /// Fails with [`Error::IllegalAccessMode`] unless the session may
    /// mutate the file.
    pub fn require_writable(&self) -> Result<()> {
        if self.mode.is_writable() {
            Ok(())
        } else {
            Err(Error::illegal_access(
                "container session was opened read-only",
            ))
        }
    }

    /// Container length: bytes from the origin to the end of the stream.
    pub fn container_len(&mut self) -> Result<u64> {
        let len = self.file.seek(SeekFrom::End(0))?;
        Ok(len.saturating_sub(self.origin))
    }

    /// Seeks to the origin-relative offset `pos`.
    pub fn seek_to(&mut self, pos: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.origin + pos))?;
        Ok(())
    }

    /// The underlying file, positioned wherever the last operation left it.
    pub(crate) fn file(&mut self) -> &mut File {
        &mut self.file
    }

    /// Current origin-relative position.
    pub fn position(&mut self) -> Result<u64> {
        Ok(self.file.stream_position()?.saturating_sub(self.origin))
    }

    /// Reads exactly `buf.len()` bytes at origin-relative `pos`.
    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.seek_to(pos)?;
        self.file.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::corrupted(pos, format!("short read of {} bytes", buf.len()))
            } else {
                e.into()
            }
        })
    }

    /// Writes `bytes` at origin-relative `pos`.
    pub fn write_at(&mut self, pos: u64, bytes: &[u8]) -> Result<()> {
        self.require_writable()?;
        self.seek_to(pos)?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    /// Truncates the stream at origin-relative `pos`.
    pub fn truncate_to(&mut self, pos: u64) -> Result<()> {
        self.require_writable()?;
        self.file.set_len(self.origin + pos)?;
        Ok(())
    }

    /// Flushes buffered writes to the operating system.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}
