//! Admission control for the file store.
//!
//! [`FileAccessArbiter`] keeps one [`FileAccessRecord`] per file name and
//! decides whether a session may read, write or delete it. Any number of
//! readers may share a file; a writer or a delete excludes everyone else.
//!
//! The record table is guarded by a single mutex that is never held across
//! a filesystem call or an `.await`. Admission is only coordinated between
//! sessions that share the same arbiter; other processes touching the store
//! root are not seen, so a file created externally between the existence
//! check and the create in [`FileAccessArbiter::open_for_write`] is
//! truncated.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::fs::{self, File, OpenOptions};
use tracing::{debug, error};

use crate::error::AccessError;
use crate::transfer::utils::validate_file_name;

/// Access state of one file name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileAccessRecord {
    pub reader_count: u32,
    pub writer_active: bool,
}

impl FileAccessRecord {
    /// No session holds the file
    pub fn is_idle(&self) -> bool {
        self.reader_count == 0 && !self.writer_active
    }
}

/// A file opened for reading; give it back with [`FileAccessArbiter::close_read`]
#[derive(Debug)]
pub struct ReadHandle {
    name: String,
    file: File,
}

impl ReadHandle {
    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }
}

/// A freshly created file; give it back with [`FileAccessArbiter::close_write`]
#[derive(Debug)]
pub struct WriteHandle {
    name: String,
    path: PathBuf,
    file: File,
}

impl WriteHandle {
    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }
}

/// Reader/writer admission over a store root
#[derive(Debug)]
pub struct FileAccessArbiter {
    root: PathBuf,
    records: Mutex<HashMap<String, FileAccessRecord>>,
}

impl FileAccessArbiter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of `name` inside the store root
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Whether `name` exists in the store. Does not touch the record table.
    pub async fn is_available(&self, name: &str) -> bool {
        fs::try_exists(self.path_of(name)).await.unwrap_or(false)
    }

    /// Open an existing file for reading.
    ///
    /// Fails with `NotFound` if the file is absent and with `Violation` while
    /// a writer or delete holds it.
    pub async fn open_for_read(&self, name: &str) -> Result<ReadHandle, AccessError> {
        check_name(name)?;

        let file = File::open(self.path_of(name))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => AccessError::NotFound(name.to_string()),
                ErrorKind::PermissionDenied => AccessError::Violation {
                    name: name.to_string(),
                    reason: "permission denied",
                },
                _ => AccessError::Io {
                    name: name.to_string(),
                    source: e,
                },
            })?;

        {
            let mut records = self.records();
            let record = records.entry(name.to_string()).or_default();
            if record.writer_active {
                return Err(AccessError::Violation {
                    name: name.to_string(),
                    reason: "file is being written",
                });
            }
            record.reader_count += 1;
            debug!("'{}' opened for read ({} readers)", name, record.reader_count);
        }

        Ok(ReadHandle {
            name: name.to_string(),
            file,
        })
    }

    /// Create a new file for writing.
    ///
    /// Fails with `AlreadyExists` if the file is present and with `Violation`
    /// if another session holds the name or the file cannot be created.
    pub async fn open_for_write(&self, name: &str) -> Result<WriteHandle, AccessError> {
        check_name(name)?;

        if self.is_available(name).await {
            return Err(AccessError::AlreadyExists(name.to_string()));
        }

        {
            let mut records = self.records();
            let record = records.entry(name.to_string()).or_default();
            if !record.is_idle() {
                return Err(AccessError::Violation {
                    name: name.to_string(),
                    reason: "file is in use",
                });
            }
            record.writer_active = true;
        }

        let path = self.path_of(name);
        let created = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await;

        match created {
            Ok(file) => {
                debug!("'{}' opened for write", name);
                Ok(WriteHandle {
                    name: name.to_string(),
                    path,
                    file,
                })
            }
            Err(e) => {
                if let Some(record) = self.records().get_mut(name) {
                    record.writer_active = false;
                }
                error!("Failed to create '{}': {}", path.display(), e);
                Err(AccessError::Violation {
                    name: name.to_string(),
                    reason: "cannot create file",
                })
            }
        }
    }

    /// Release a read handle
    pub fn close_read(&self, handle: ReadHandle) -> Result<(), AccessError> {
        let ReadHandle { name, file } = handle;
        drop(file);

        let mut records = self.records();
        match records.get_mut(&name) {
            Some(record) if record.reader_count > 0 => {
                record.reader_count -= 1;
                Ok(())
            }
            _ => Err(invariant(name, "close_read without an active reader")),
        }
    }

    /// Release a write handle. Flushing is the caller's job.
    pub fn close_write(&self, handle: WriteHandle) -> Result<(), AccessError> {
        let WriteHandle { name, file, .. } = handle;
        drop(file);

        let mut records = self.records();
        match records.get_mut(&name) {
            Some(record) if record.writer_active => {
                record.writer_active = false;
                Ok(())
            }
            _ => Err(invariant(name, "close_write without an active writer")),
        }
    }

    /// Give up on an unfinished write: remove the partial file while the
    /// writer slot is still held, then drop the record.
    pub async fn abandon_write(&self, handle: WriteHandle) -> Result<(), AccessError> {
        let WriteHandle { name, path, file } = handle;
        drop(file);

        let removed = fs::remove_file(&path).await;

        let mut records = self.records();
        match records.get(&name) {
            Some(record) if record.writer_active => {}
            _ => return Err(invariant(name, "abandon_write without an active writer")),
        }
        match removed {
            Ok(()) => {
                records.remove(&name);
                debug!("Partial '{}' removed", name);
                Ok(())
            }
            Err(e) => {
                if let Some(record) = records.get_mut(&name) {
                    record.writer_active = false;
                }
                error!("Failed to remove partial '{}': {}", path.display(), e);
                Err(AccessError::Io { name, source: e })
            }
        }
    }

    /// Delete `name` if no session holds it.
    ///
    /// Fails with `NotFound` if the file is absent and with `Violation` while
    /// it is open. A deleted file's record is dropped from the table.
    pub async fn try_delete(&self, name: &str) -> Result<(), AccessError> {
        check_name(name)?;

        if !self.is_available(name).await {
            return Err(AccessError::NotFound(name.to_string()));
        }

        {
            let mut records = self.records();
            let record = records.entry(name.to_string()).or_default();
            if !record.is_idle() {
                return Err(AccessError::Violation {
                    name: name.to_string(),
                    reason: "file is in use",
                });
            }
            // Hold the writer slot so no reader slips in during the removal.
            record.writer_active = true;
        }

        let removed = fs::remove_file(self.path_of(name)).await;

        let mut records = self.records();
        match removed {
            Ok(()) => {
                records.remove(name);
                debug!("'{}' deleted", name);
                Ok(())
            }
            Err(e) => {
                if let Some(record) = records.get_mut(name) {
                    record.writer_active = false;
                }
                if e.kind() == ErrorKind::NotFound {
                    Err(AccessError::NotFound(name.to_string()))
                } else {
                    error!("Failed to delete '{}': {}", name, e);
                    Err(AccessError::Violation {
                        name: name.to_string(),
                        reason: "cannot delete file",
                    })
                }
            }
        }
    }

    /// Current record for `name`, if any
    pub fn record(&self, name: &str) -> Option<FileAccessRecord> {
        self.records().get(name).copied()
    }

    /// Copy of the whole record table
    pub fn snapshot(&self) -> HashMap<String, FileAccessRecord> {
        self.records().clone()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, FileAccessRecord>> {
        // Critical sections never panic mid-update, so a poisoned table is still consistent.
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_name(name: &str) -> Result<(), AccessError> {
    validate_file_name(name).map_err(|reason| AccessError::Violation {
        name: name.to_string(),
        reason,
    })
}

fn invariant(name: String, detail: &'static str) -> AccessError {
    error!("Access table invariant violated for '{}': {}", name, detail);
    AccessError::Invariant { name, detail }
}
