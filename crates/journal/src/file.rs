//! File handle that survives interrupted I/O
//!
//! An operation failing with `ErrorKind::Interrupted` drops the handle,
//! reopens the file and is retried once. All access goes through the
//! journal lock, so exactly one owner ever reopens the handle.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

enum FileState {
    Open(File),
    Interrupted,
    Closed,
}

pub(crate) struct ReopenableFile {
    path: PathBuf,
    state: FileState,
    reopen_count: u32,
}

impl ReopenableFile {
    /// Open (creating if needed) the file for reading and writing
    pub(crate) fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open_file(&path)?;
        Ok(Self {
            path,
            state: FileState::Open(file),
            reopen_count: 0,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub(crate) fn reopen_count(&self) -> u32 {
        self.reopen_count
    }

    /// Run an operation on the handle, reopening and retrying once on interruption
    pub(crate) fn with_file<T, F>(&mut self, mut op: F) -> io::Result<T>
    where
        F: FnMut(&mut File) -> io::Result<T>,
    {
        match op(self.handle()?) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                tracing::warn!("I/O on {:?} interrupted, reopening: {}", self.path, e);
                self.state = FileState::Interrupted;
                op(self.handle()?)
            }
            result => result,
        }
    }

    pub(crate) fn write_all_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.with_file(|file| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(bytes)
        })
    }

    pub(crate) fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.with_file(|file| {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(buf)
        })
    }

    pub(crate) fn len(&mut self) -> io::Result<u64> {
        self.with_file(|file| Ok(file.metadata()?.len()))
    }

    pub(crate) fn set_len(&mut self, size: u64) -> io::Result<()> {
        self.with_file(|file| file.set_len(size))
    }

    pub(crate) fn sync(&mut self) -> io::Result<()> {
        self.with_file(|file| file.sync_data())
    }

    pub(crate) fn close(&mut self) {
        self.state = FileState::Closed;
    }

    fn handle(&mut self) -> io::Result<&mut File> {
        match self.state {
            FileState::Open(_) => {}
            FileState::Interrupted => {
                let file = Self::open_file(&self.path)?;
                self.reopen_count += 1;
                tracing::debug!("Reopened {:?}", self.path);
                self.state = FileState::Open(file);
            }
            FileState::Closed => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("{:?} is closed", self.path),
                ));
            }
        }

        match &mut self.state {
            FileState::Open(file) => Ok(file),
            _ => Err(io::Error::other("file handle unavailable")),
        }
    }

    fn open_file(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    }
}
