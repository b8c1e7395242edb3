//! Open file handles.
//!
//! Every successful `open`/`create` parks the native file here and hands the
//! kernel a numeric handle. The table is bounded, by default to
//! [`MAX_FILE_HANDLES`].

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::constants::MAX_FILE_HANDLES;
use crate::error::errno;

/// Table of open native files keyed by FUSE handle.
pub struct HandleTable {
    capacity: usize,
    next_handle: AtomicU64,
    files: RwLock<HashMap<u64, Arc<File>>>,
}

impl HandleTable {
    /// Empty table holding up to [`MAX_FILE_HANDLES`]. Handles start at 1.
    pub fn new() -> Self {
        Self::with_capacity(MAX_FILE_HANDLES)
    }

    /// Empty table holding up to `capacity` open files.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            next_handle: AtomicU64::new(1),
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Park `file` and return its handle.
    ///
    /// # Errors
    ///
    /// `EMFILE` when the table is full; the file is closed.
    pub fn insert(&self, file: File) -> io::Result<u64> {
        let mut files = self.files.write().map_err(|_| io::Error::other("handle table lock poisoned"))?;
        if files.len() >= self.capacity {
            return Err(errno(libc::EMFILE));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        files.insert(handle, Arc::new(file));
        Ok(handle)
    }

    /// File behind `handle`, or `EBADF`.
    pub fn get(&self, handle: u64) -> io::Result<Arc<File>> {
        let files = self.files.read().map_err(|_| io::Error::other("handle table lock poisoned"))?;
        files.get(&handle).cloned().ok_or_else(|| errno(libc::EBADF))
    }

    /// Drop `handle`. The native file closes once no operation still holds it.
    pub fn remove(&self, handle: u64) -> io::Result<Option<Arc<File>>> {
        let mut files = self.files.write().map_err(|_| io::Error::other("handle table lock poisoned"))?;
        Ok(files.remove(&handle))
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.files.read().map(|files| files.len()).unwrap_or(0)
    }

    /// Whether no handle is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
