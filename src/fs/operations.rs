//! FUSE `FileSystem` trait implementation for `QuotaFs`.
//!
//! Each operation forwards to the native primitive on the backing path. Gated
//! operations consult the quota guard before touching the backing filesystem
//! and mark the usage figure for recompute once they succeed.

use std::collections::BTreeMap;
use std::ffi::CStr;
use std::ffi::OsStr;
use std::fs::DirBuilder;
use std::fs::Permissions;
use std::io;
use std::io::Read;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use fuse_backend_rs::abi::fuse_abi::CreateIn;
use fuse_backend_rs::abi::fuse_abi::stat64;
use fuse_backend_rs::api::filesystem::Context;
use fuse_backend_rs::api::filesystem::DirEntry;
use fuse_backend_rs::api::filesystem::Entry;
use fuse_backend_rs::api::filesystem::FileSystem;
use fuse_backend_rs::api::filesystem::FsOptions;
use fuse_backend_rs::api::filesystem::GetxattrReply;
use fuse_backend_rs::api::filesystem::ListxattrReply;
use fuse_backend_rs::api::filesystem::OpenOptions;
use fuse_backend_rs::api::filesystem::SetattrValid;
use fuse_backend_rs::api::filesystem::ZeroCopyReader;
use fuse_backend_rs::api::filesystem::ZeroCopyWriter;
use tracing::debug;
use tracing::info;

use super::QuotaFs;
use super::cstring;
use super::dirent_type;
use super::make_attr;
use super::make_entry;
use crate::constants::ATTR_TTL;
use crate::constants::MAX_READDIR_ENTRIES;
use crate::constants::MAX_XATTR_NAME_SIZE;
use crate::constants::MAX_XATTR_VALUE_SIZE;
use crate::constants::ROOT_INODE;
use crate::error::errno;
use crate::error::to_fuse_error;
use crate::quota::GatedOp;

impl FileSystem for QuotaFs {
    type Inode = u64;
    type Handle = u64;

    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        info!(
            root = %self.root.display(),
            limit_bytes = self.guard.state().limit_bytes(),
            "quota filesystem initialised"
        );
        if let Some(sync) = &self.sync {
            sync.start();
        }
        Ok(FsOptions::empty())
    }

    fn destroy(&self) {
        if let Some(sync) = &self.sync {
            sync.stop();
        }
        info!("quota filesystem destroyed");
    }

    fn lookup(&self, _ctx: &Context, parent: u64, name: &CStr) -> io::Result<Entry> {
        let relative = self.child_path(parent, name)?;
        self.lookup_path(&relative)
    }

    fn forget(&self, _ctx: &Context, inode: u64, count: u64) {
        if let Err(e) = self.inodes.forget(inode, count) {
            debug!(inode, count, error = %e, "forget failed");
        }
    }

    fn batch_forget(&self, ctx: &Context, requests: Vec<(u64, u64)>) {
        for (inode, count) in requests {
            self.forget(ctx, inode, count);
        }
    }

    fn getattr(&self, _ctx: &Context, inode: u64, handle: Option<u64>) -> io::Result<(stat64, Duration)> {
        let metadata = match handle {
            Some(handle) => self.handles.get(handle)?.metadata()?,
            None => std::fs::symlink_metadata(self.real_path_of(inode)?)?,
        };
        Ok((make_attr(inode, &metadata), ATTR_TTL))
    }

    fn setattr(
        &self,
        ctx: &Context,
        inode: u64,
        attr: stat64,
        handle: Option<u64>,
        valid: SetattrValid,
    ) -> io::Result<(stat64, Duration)> {
        let real = self.real_path_of(inode)?;

        // A denied resize must leave every other attribute untouched.
        let new_size = if valid.contains(SetattrValid::SIZE) {
            let new_size = u64::try_from(attr.st_size).map_err(|_| errno(libc::EINVAL))?;
            self.check_resize(&real, handle, new_size)?;
            Some(new_size)
        } else {
            None
        };

        if valid.contains(SetattrValid::MODE) {
            std::fs::set_permissions(&real, Permissions::from_mode(attr.st_mode & 0o7777))?;
        }

        if valid.intersects(SetattrValid::UID | SetattrValid::GID) {
            let uid = valid.contains(SetattrValid::UID).then_some(attr.st_uid);
            let gid = valid.contains(SetattrValid::GID).then_some(attr.st_gid);
            std::os::unix::fs::chown(&real, uid, gid)?;
        }

        if let Some(new_size) = new_size {
            self.resize(&real, handle, new_size)?;
        }

        if valid.intersects(
            SetattrValid::ATIME | SetattrValid::MTIME | SetattrValid::ATIME_NOW | SetattrValid::MTIME_NOW,
        ) {
            set_times(&real, &attr, valid)?;
        }

        self.getattr(ctx, inode, handle)
    }

    fn readlink(&self, _ctx: &Context, inode: u64) -> io::Result<Vec<u8>> {
        let target = std::fs::read_link(self.real_path_of(inode)?)?;
        Ok(target.into_os_string().into_vec())
    }

    fn symlink(&self, _ctx: &Context, linkname: &CStr, parent: u64, name: &CStr) -> io::Result<Entry> {
        self.guard.check_create(GatedOp::Symlink)?;
        let relative = self.child_path(parent, name)?;
        let target = OsStr::from_bytes(linkname.to_bytes());

        debug!(path = %relative.display(), target = ?target, "symlink");
        std::os::unix::fs::symlink(target, self.real_path(&relative))?;
        self.guard.record_success();

        self.lookup_path(&relative)
    }

    fn mknod(&self, _ctx: &Context, parent: u64, name: &CStr, mode: u32, rdev: u32, umask: u32) -> io::Result<Entry> {
        let relative = self.child_path(parent, name)?;
        let path = cstring(&self.real_path(&relative))?;

        debug!(path = %relative.display(), mode, rdev, "mknod");
        // SAFETY: path is a valid NUL-terminated string that outlives the call.
        cvt(unsafe { libc::mknod(path.as_ptr(), (mode & !umask) as libc::mode_t, libc::dev_t::from(rdev)) })?;

        self.lookup_path(&relative)
    }

    fn mkdir(&self, _ctx: &Context, parent: u64, name: &CStr, mode: u32, umask: u32) -> io::Result<Entry> {
        self.guard.check_create(GatedOp::Mkdir)?;
        let relative = self.child_path(parent, name)?;

        debug!(path = %relative.display(), mode, "mkdir");
        DirBuilder::new().mode(mode & !umask).create(self.real_path(&relative))?;
        self.guard.record_success();

        self.lookup_path(&relative)
    }

    fn unlink(&self, _ctx: &Context, parent: u64, name: &CStr) -> io::Result<()> {
        let relative = self.child_path(parent, name)?;

        debug!(path = %relative.display(), "unlink");
        std::fs::remove_file(self.real_path(&relative))?;
        self.forget_path(&relative);
        self.guard.record_success();
        Ok(())
    }

    fn rmdir(&self, _ctx: &Context, parent: u64, name: &CStr) -> io::Result<()> {
        let relative = self.child_path(parent, name)?;

        debug!(path = %relative.display(), "rmdir");
        std::fs::remove_dir(self.real_path(&relative))?;
        self.forget_path(&relative);
        self.guard.record_success();
        Ok(())
    }

    fn rename(
        &self,
        _ctx: &Context,
        olddir: u64,
        oldname: &CStr,
        newdir: u64,
        newname: &CStr,
        flags: u32,
    ) -> io::Result<()> {
        // RENAME_NOREPLACE / RENAME_EXCHANGE have no portable passthrough.
        if flags != 0 {
            return Err(errno(libc::EINVAL));
        }

        let old_path = self.child_path(olddir, oldname)?;
        let new_path = self.child_path(newdir, newname)?;

        debug!(from = %old_path.display(), to = %new_path.display(), "rename");
        std::fs::rename(self.real_path(&old_path), self.real_path(&new_path))?;
        self.inodes.rename_path(&old_path, &new_path).map_err(to_fuse_error)
    }

    fn link(&self, _ctx: &Context, inode: u64, newparent: u64, newname: &CStr) -> io::Result<Entry> {
        let source = self.real_path_of(inode)?;
        let relative = self.child_path(newparent, newname)?;

        debug!(source = %source.display(), path = %relative.display(), "link");
        std::fs::hard_link(&source, self.real_path(&relative))?;

        self.lookup_path(&relative)
    }

    fn open(
        &self,
        _ctx: &Context,
        inode: u64,
        flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<(Option<u64>, OpenOptions, Option<u32>)> {
        let real = self.real_path_of(inode)?;
        let creating = flags & libc::O_CREAT as u32 != 0;
        if creating {
            self.guard.check_create(GatedOp::OpenCreate)?;
        }

        // The kernel routes O_CREAT through `create`; this only gates direct callers.
        let file = open_options(flags, 0o666).open(&real)?;
        if creating {
            self.guard.record_success();
        }

        let handle = self.handles.insert(file)?;
        debug!(inode, handle, flags, "open");
        Ok((Some(handle), OpenOptions::empty(), None))
    }

    fn create(
        &self,
        _ctx: &Context,
        parent: u64,
        name: &CStr,
        args: CreateIn,
    ) -> io::Result<(Entry, Option<u64>, OpenOptions, Option<u32>)> {
        self.guard.check_create(GatedOp::Create)?;
        let relative = self.child_path(parent, name)?;

        debug!(path = %relative.display(), mode = args.mode, flags = args.flags, "create");
        let file = open_options(args.flags | libc::O_CREAT as u32, args.mode & !args.umask)
            .open(self.real_path(&relative))?;
        self.guard.record_success();

        let metadata = file.metadata()?;
        let inode = self.inodes.lookup(&relative).map_err(to_fuse_error)?;
        let handle = self.handles.insert(file)?;

        Ok((make_entry(inode, &metadata), Some(handle), OpenOptions::empty(), None))
    }

    fn read(
        &self,
        _ctx: &Context,
        _inode: u64,
        handle: u64,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        let data = self.read_at(handle, size, offset)?;
        w.write_all(&data)?;
        Ok(data.len())
    }

    fn write(
        &self,
        _ctx: &Context,
        _inode: u64,
        handle: u64,
        r: &mut dyn ZeroCopyReader,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _delayed_write: bool,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<usize> {
        // Denied writes leave the request payload unread.
        self.guard.check_write(u64::from(size))?;

        let mut buf = vec![0u8; size as usize];
        r.read_exact(&mut buf)?;
        self.write_admitted(handle, &buf, offset)
    }

    fn statfs(&self, _ctx: &Context, _inode: u64) -> io::Result<libc::statvfs64> {
        let path = cstring(&self.root)?;
        // SAFETY: statvfs64 is a C struct that can be safely zero-initialized.
        let mut st: libc::statvfs64 = unsafe { std::mem::zeroed() };
        // SAFETY: path is NUL-terminated and st is a valid, writable statvfs64.
        cvt(unsafe { libc::statvfs64(path.as_ptr(), &mut st) })?;
        Ok(st)
    }

    fn flush(&self, _ctx: &Context, _inode: u64, _handle: u64, _lock_owner: u64) -> io::Result<()> {
        Ok(())
    }

    fn release(
        &self,
        _ctx: &Context,
        _inode: u64,
        _flags: u32,
        handle: u64,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        self.handles.remove(handle).map_err(to_fuse_error)?;
        Ok(())
    }

    fn fsync(&self, _ctx: &Context, _inode: u64, datasync: bool, handle: u64) -> io::Result<()> {
        let file = self.handles.get(handle)?;
        if datasync { file.sync_data() } else { file.sync_all() }
    }

    fn setxattr(&self, _ctx: &Context, inode: u64, name: &CStr, value: &[u8], flags: u32) -> io::Result<()> {
        if name.to_bytes().len() > MAX_XATTR_NAME_SIZE {
            return Err(errno(libc::ERANGE));
        }
        if value.len() > MAX_XATTR_VALUE_SIZE {
            return Err(errno(libc::E2BIG));
        }

        let path = cstring(&self.real_path_of(inode)?)?;
        // SAFETY: path and name are NUL-terminated; value is valid for value.len() bytes.
        cvt(unsafe {
            libc::lsetxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                flags as libc::c_int,
            )
        })
    }

    fn getxattr(&self, _ctx: &Context, inode: u64, name: &CStr, size: u32) -> io::Result<GetxattrReply> {
        let real = self.real_path_of(inode)?;
        let value = xattr::get(&real, OsStr::from_bytes(name.to_bytes()))?.ok_or_else(|| errno(libc::ENODATA))?;

        if size == 0 {
            Ok(GetxattrReply::Count(value.len() as u32))
        } else if (size as usize) < value.len() {
            Err(errno(libc::ERANGE))
        } else {
            Ok(GetxattrReply::Value(value))
        }
    }

    fn listxattr(&self, _ctx: &Context, inode: u64, size: u32) -> io::Result<ListxattrReply> {
        let real = self.real_path_of(inode)?;

        let mut names = Vec::new();
        for name in xattr::list(&real)? {
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }

        if size == 0 {
            Ok(ListxattrReply::Count(names.len() as u32))
        } else if (size as usize) < names.len() {
            Err(errno(libc::ERANGE))
        } else {
            Ok(ListxattrReply::Names(names))
        }
    }

    fn removexattr(&self, _ctx: &Context, inode: u64, name: &CStr) -> io::Result<()> {
        let real = self.real_path_of(inode)?;
        xattr::remove(&real, OsStr::from_bytes(name.to_bytes()))
    }

    fn opendir(&self, _ctx: &Context, inode: u64, _flags: u32) -> io::Result<(Option<u64>, OpenOptions)> {
        let real = self.real_path_of(inode)?;
        if !std::fs::symlink_metadata(&real)?.is_dir() {
            return Err(errno(libc::ENOTDIR));
        }
        // Surfaces EACCES now rather than on the first readdir.
        std::fs::read_dir(&real)?;
        Ok((None, OpenOptions::empty()))
    }

    fn readdir(
        &self,
        _ctx: &Context,
        inode: u64,
        _handle: u64,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        let relative = self.entry_path(inode)?;

        let mut children = BTreeMap::new();
        for dirent in std::fs::read_dir(self.real_path(&relative))? {
            let dirent = dirent?;
            children.insert(dirent.file_name(), dirent.file_type()?);
        }

        let parent_inode = match relative.parent() {
            Some(parent) => self.inodes.get_inode(parent).map_err(to_fuse_error)?.unwrap_or(ROOT_INODE),
            None => ROOT_INODE,
        };

        let mut current_offset = 0u64;
        for (name, ino) in [(b".".as_slice(), inode), (b"..".as_slice(), parent_inode)] {
            current_offset += 1;
            if current_offset <= offset {
                continue;
            }
            let entry = DirEntry {
                ino,
                offset: current_offset,
                type_: u32::from(libc::DT_DIR),
                name,
            };
            if add_entry(entry)? == 0 {
                return Ok(());
            }
        }

        let mut entry_count = 0u32;
        for (name, file_type) in &children {
            current_offset += 1;
            if current_offset <= offset {
                continue;
            }
            if entry_count >= MAX_READDIR_ENTRIES {
                break;
            }

            let child_inode = self.inodes.get_or_create(&relative.join(name)).map_err(to_fuse_error)?;
            let entry = DirEntry {
                ino: child_inode,
                offset: current_offset,
                type_: dirent_type(*file_type),
                name: name.as_bytes(),
            };
            // Zero means the reply buffer is full.
            if add_entry(entry)? == 0 {
                break;
            }
            entry_count += 1;
        }

        Ok(())
    }

    fn releasedir(&self, _ctx: &Context, _inode: u64, _flags: u32, _handle: u64) -> io::Result<()> {
        Ok(())
    }

    fn access(&self, _ctx: &Context, inode: u64, mask: u32) -> io::Result<()> {
        let path = cstring(&self.real_path_of(inode)?)?;
        // SAFETY: path is a valid NUL-terminated string that outlives the call.
        cvt(unsafe { libc::access(path.as_ptr(), mask as libc::c_int) })
    }
}

/// Truncate helpers, split out of `setattr`.
impl QuotaFs {
    /// Current size by handle (fstat) or by path (lstat).
    fn current_size(&self, real: &Path, handle: Option<u64>) -> io::Result<u64> {
        match handle {
            Some(handle) => Ok(self.handles.get(handle)?.metadata()?.len()),
            None => Ok(std::fs::symlink_metadata(real)?.len()),
        }
    }

    /// Ask the guard whether resizing to `new_size` is admitted.
    fn check_resize(&self, real: &Path, handle: Option<u64>, new_size: u64) -> io::Result<()> {
        let current_size = self.current_size(real, handle)?;
        self.guard.check_truncate(current_size, new_size)?;
        Ok(())
    }

    /// Resize by handle (ftruncate) or by path (truncate) once admitted.
    fn resize(&self, real: &Path, handle: Option<u64>, new_size: u64) -> io::Result<()> {
        match handle {
            Some(handle) => {
                debug!(handle, new_size, "ftruncate");
                self.handles.get(handle)?.set_len(new_size)?;
            }
            None => {
                debug!(path = %real.display(), new_size, "truncate");
                let length = libc::off_t::try_from(new_size).map_err(|_| errno(libc::EFBIG))?;
                let path = cstring(real)?;
                // SAFETY: path is a valid NUL-terminated string that outlives the call.
                cvt(unsafe { libc::truncate(path.as_ptr(), length) })?;
            }
        }

        self.guard.record_success();
        Ok(())
    }
}

fn open_options(flags: u32, mode: u32) -> std::fs::OpenOptions {
    let flags = flags as libc::c_int;
    let mut options = std::fs::OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => options.write(true),
        libc::O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    options.custom_flags(flags & !libc::O_ACCMODE).mode(mode);
    options
}

fn set_times(real: &Path, attr: &stat64, valid: SetattrValid) -> io::Result<()> {
    let times = [
        timespec(valid, SetattrValid::ATIME, SetattrValid::ATIME_NOW, attr.st_atime as _, attr.st_atime_nsec as _),
        timespec(valid, SetattrValid::MTIME, SetattrValid::MTIME_NOW, attr.st_mtime as _, attr.st_mtime_nsec as _),
    ];
    let path = cstring(real)?;
    // SAFETY: path is NUL-terminated and times points at two initialised timespecs.
    cvt(unsafe { libc::utimensat(libc::AT_FDCWD, path.as_ptr(), times.as_ptr(), libc::AT_SYMLINK_NOFOLLOW) })
}

fn timespec(
    valid: SetattrValid,
    set: SetattrValid,
    now: SetattrValid,
    sec: libc::time_t,
    nsec: libc::c_long,
) -> libc::timespec {
    let (tv_sec, tv_nsec) = if valid.contains(now) {
        (0, libc::UTIME_NOW)
    } else if valid.contains(set) {
        (sec, nsec)
    } else {
        (0, libc::UTIME_OMIT)
    };
    libc::timespec { tv_sec, tv_nsec }
}

fn cvt(ret: libc::c_int) -> io::Result<()> {
    if ret == -1 { Err(io::Error::last_os_error()) } else { Ok(()) }
}
