//! Passthrough filesystem with soft quota enforcement.
//!
//! Every virtual path maps onto the same relative path under the backing root:
//! - `/projects/a.txt` -> `<root>/projects/a.txt`
//! - Operations that can grow stored bytes ask the [`QuotaGuard`] first
//! - Successful size-changing operations mark the usage figure for recompute

mod operations;

use std::ffi::CStr;
use std::ffi::CString;
use std::ffi::OsStr;
use std::fs::Metadata;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use fuse_backend_rs::abi::fuse_abi::stat64;
use fuse_backend_rs::api::filesystem::Entry;
use tracing::debug;

use crate::constants::ATTR_TTL;
use crate::constants::ENTRY_TTL;
use crate::error::errno;
use crate::error::to_fuse_error;
use crate::handle::HandleTable;
use crate::inode::InodeManager;
use crate::quota::QuotaGuard;
use crate::sync::SyncLauncher;

/// Quota-enforcing passthrough filesystem.
pub struct QuotaFs {
    /// Canonical backing directory.
    root: PathBuf,
    inodes: InodeManager,
    handles: HandleTable,
    guard: QuotaGuard,
    /// Started on `init`, stopped on `destroy`. Absent when the caller drives
    /// the sync task itself.
    sync: Option<Arc<SyncLauncher>>,
}

impl QuotaFs {
    /// Passthrough over `root`, enforcing quota through `guard`.
    pub fn new(root: PathBuf, guard: QuotaGuard) -> Self {
        Self {
            root,
            inodes: InodeManager::new(),
            handles: HandleTable::new(),
            guard,
            sync: None,
        }
    }

    /// Tie the usage sync task to the mount lifecycle.
    pub fn with_sync_launcher(mut self, launcher: Arc<SyncLauncher>) -> Self {
        self.sync = Some(launcher);
        self
    }

    /// Backing directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Quota guard consulted by gated operations.
    pub fn guard(&self) -> &QuotaGuard {
        &self.guard
    }

    /// Number of open file handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Read up to `size` bytes at `offset` through an open handle.
    pub fn read_at(&self, handle: u64, size: u32, offset: u64) -> io::Result<Vec<u8>> {
        let file = self.handles.get(handle)?;
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Write `data` at `offset` through an open handle, subject to the write rule.
    pub fn write_at(&self, handle: u64, data: &[u8], offset: u64) -> io::Result<usize> {
        self.guard.check_write(data.len() as u64)?;
        self.write_admitted(handle, data, offset)
    }

    fn write_admitted(&self, handle: u64, data: &[u8], offset: u64) -> io::Result<usize> {
        let file = self.handles.get(handle)?;
        file.write_all_at(data, offset)?;
        self.guard.record_success();
        Ok(data.len())
    }

    /// Relative path of a known inode.
    fn entry_path(&self, inode: u64) -> io::Result<PathBuf> {
        self.inodes
            .get_path(inode)
            .map_err(to_fuse_error)?
            .map(|entry| entry.path)
            .ok_or_else(|| errno(libc::ENOENT))
    }

    /// Relative path of `name` inside directory `parent`.
    fn child_path(&self, parent: u64, name: &CStr) -> io::Result<PathBuf> {
        let name = validate_name(name)?;
        Ok(self.entry_path(parent)?.join(name))
    }

    /// Backing path for a relative path.
    fn real_path(&self, relative: &Path) -> PathBuf {
        if relative.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    fn real_path_of(&self, inode: u64) -> io::Result<PathBuf> {
        Ok(self.real_path(&self.entry_path(inode)?))
    }

    /// Stat `relative` without following a trailing symlink and hand its inode
    /// to the kernel, counting one lookup.
    fn lookup_path(&self, relative: &Path) -> io::Result<Entry> {
        let metadata = std::fs::symlink_metadata(self.real_path(relative))?;
        let inode = self.inodes.lookup(relative).map_err(to_fuse_error)?;
        Ok(make_entry(inode, &metadata))
    }

    fn forget_path(&self, relative: &Path) {
        if let Err(e) = self.inodes.remove_path(relative) {
            debug!(path = %relative.display(), error = %e, "failed to drop inode mapping");
        }
    }
}

/// Accept a single path component; reject separators and dot entries.
fn validate_name(name: &CStr) -> io::Result<&OsStr> {
    let bytes = name.to_bytes();
    if bytes.is_empty() || bytes == b"." || bytes == b".." || bytes.contains(&b'/') {
        return Err(errno(libc::EINVAL));
    }
    Ok(OsStr::from_bytes(bytes))
}

fn cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| errno(libc::EINVAL))
}

/// Build a stat64 from native metadata, reporting our inode number.
fn make_attr(inode: u64, metadata: &Metadata) -> stat64 {
    // SAFETY: stat64 is a C struct that can be safely zero-initialized.
    // All fields are primitive types (integers) with no invariants.
    let mut attr: stat64 = unsafe { std::mem::zeroed() };
    attr.st_dev = metadata.dev() as _;
    attr.st_ino = inode;
    attr.st_mode = metadata.mode();
    attr.st_nlink = metadata.nlink() as _;
    attr.st_uid = metadata.uid();
    attr.st_gid = metadata.gid();
    attr.st_rdev = metadata.rdev() as _;
    attr.st_size = metadata.size() as _;
    attr.st_blksize = metadata.blksize() as _;
    attr.st_blocks = metadata.blocks() as _;
    attr.st_atime = metadata.atime() as _;
    attr.st_atime_nsec = metadata.atime_nsec() as _;
    attr.st_mtime = metadata.mtime() as _;
    attr.st_mtime_nsec = metadata.mtime_nsec() as _;
    attr.st_ctime = metadata.ctime() as _;
    attr.st_ctime_nsec = metadata.ctime_nsec() as _;
    attr
}

fn make_entry(inode: u64, metadata: &Metadata) -> Entry {
    Entry {
        inode,
        generation: 0,
        attr: make_attr(inode, metadata),
        attr_flags: 0,
        attr_timeout: ATTR_TTL,
        entry_timeout: ENTRY_TTL,
    }
}

/// `d_type` for a directory entry.
fn dirent_type(file_type: std::fs::FileType) -> u32 {
    use std::os::unix::fs::FileTypeExt;

    let dtype = if file_type.is_dir() {
        libc::DT_DIR
    } else if file_type.is_symlink() {
        libc::DT_LNK
    } else if file_type.is_file() {
        libc::DT_REG
    } else if file_type.is_fifo() {
        libc::DT_FIFO
    } else if file_type.is_socket() {
        libc::DT_SOCK
    } else if file_type.is_char_device() {
        libc::DT_CHR
    } else if file_type.is_block_device() {
        libc::DT_BLK
    } else {
        libc::DT_UNKNOWN
    };
    u32::from(dtype)
}
