//! Inode allocation and caching for the passthrough filesystem.
//!
//! Maps paths relative to the mount root to stable inode numbers using
//! hashing. Each entry carries the kernel's lookup count: entries the kernel
//! still references are pinned, idle ones are evicted oldest first once the
//! cache is full.
//!
//! # Error Handling
//!
//! Lock poisoning returns errors rather than panicking: the cache can always be
//! rebuilt from the backing directory, so a failed operation is preferable to a
//! dead daemon.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::debug;

use crate::constants::MAX_INODE_CACHE;
use crate::constants::ROOT_INODE;

/// Cached inode entry.
#[derive(Debug, Clone)]
pub struct InodeEntry {
    /// Path relative to the mount root; empty for the root itself.
    pub path: PathBuf,
    /// Last access timestamp for LRU eviction.
    pub last_access: u64,
    /// Outstanding kernel lookups. Non-zero pins the entry.
    pub lookups: u64,
}

#[derive(Debug, Default)]
struct Maps {
    inode_to_entry: HashMap<u64, InodeEntry>,
    path_to_inode: HashMap<PathBuf, u64>,
    /// `last_access -> inode` for unpinned entries, oldest first.
    idle: BTreeMap<u64, u64>,
}

impl Maps {
    fn insert(&mut self, inode: u64, path: PathBuf, access: u64, lookups: u64) {
        if lookups == 0 && inode != ROOT_INODE {
            self.idle.insert(access, inode);
        }
        self.path_to_inode.insert(path.clone(), inode);
        self.inode_to_entry.insert(inode, InodeEntry {
            path,
            last_access: access,
            lookups,
        });
    }

    /// Refresh the access time and add `lookups` kernel references.
    fn touch(&mut self, inode: u64, access: u64, lookups: u64) {
        let Some(entry) = self.inode_to_entry.get_mut(&inode) else {
            return;
        };
        if entry.lookups == 0 {
            self.idle.remove(&entry.last_access);
        }
        entry.last_access = access;
        entry.lookups = entry.lookups.saturating_add(lookups);
        if entry.lookups == 0 && inode != ROOT_INODE {
            self.idle.insert(access, inode);
        }
    }

    fn remove(&mut self, inode: u64) -> Option<InodeEntry> {
        let entry = self.inode_to_entry.remove(&inode)?;
        if self.path_to_inode.get(&entry.path) == Some(&inode) {
            self.path_to_inode.remove(&entry.path);
        }
        if entry.lookups == 0 {
            self.idle.remove(&entry.last_access);
        }
        Some(entry)
    }

    fn evict_idle(&mut self) {
        if let Some((_, inode)) = self.idle.pop_first()
            && let Some(entry) = self.inode_to_entry.remove(&inode)
        {
            self.path_to_inode.remove(&entry.path);
        }
    }
}

/// Manages inode allocation and path <-> inode mappings.
///
/// The root directory always has inode 1. Other inodes start from a hash of
/// the path and keep their number when the path is renamed.
pub struct InodeManager {
    access_counter: AtomicU64,
    maps: RwLock<Maps>,
}

impl InodeManager {
    /// Create a new inode manager with the root directory registered.
    pub fn new() -> Self {
        let mut maps = Maps::default();
        maps.insert(ROOT_INODE, PathBuf::new(), 0, 0);

        Self {
            access_counter: AtomicU64::new(1),
            maps: RwLock::new(maps),
        }
    }

    fn read(&self) -> io::Result<RwLockReadGuard<'_, Maps>> {
        self.maps.read().map_err(|_| io::Error::other("inode cache lock poisoned"))
    }

    fn write(&self) -> io::Result<RwLockWriteGuard<'_, Maps>> {
        self.maps.write().map_err(|_| io::Error::other("inode cache lock poisoned"))
    }

    /// Get or allocate the inode for `path` without taking a kernel reference.
    pub fn get_or_create(&self, path: &Path) -> io::Result<u64> {
        self.resolve(path, 0)
    }

    /// Get or allocate the inode for `path` and count one kernel lookup.
    ///
    /// Every entry handed to the kernel goes through here; the count is given
    /// back through [`InodeManager::forget`].
    pub fn lookup(&self, path: &Path) -> io::Result<u64> {
        self.resolve(path, 1)
    }

    fn resolve(&self, path: &Path, lookups: u64) -> io::Result<u64> {
        let access = self.access_counter.fetch_add(1, Ordering::Relaxed);
        let mut maps = self.write()?;

        if let Some(&inode) = maps.path_to_inode.get(path) {
            maps.touch(inode, access, lookups);
            return Ok(inode);
        }

        if maps.inode_to_entry.len() >= MAX_INODE_CACHE {
            maps.evict_idle();
        }

        // Probe past numbers held by other paths (hash collisions, renamed entries).
        let mut inode = hash_path(path);
        while maps.inode_to_entry.contains_key(&inode) {
            inode = next_inode(inode);
        }

        maps.insert(inode, path.to_path_buf(), access, lookups);
        Ok(inode)
    }

    /// Drop `count` kernel lookups. An entry left at zero becomes evictable.
    pub fn forget(&self, inode: u64, count: u64) -> io::Result<()> {
        if inode == ROOT_INODE {
            return Ok(());
        }
        let mut maps = self.write()?;
        let Some(entry) = maps.inode_to_entry.get_mut(&inode) else {
            return Ok(());
        };
        if entry.lookups == 0 {
            return Ok(());
        }

        if count > entry.lookups {
            debug!(inode, count, lookups = entry.lookups, "forget exceeds lookup count");
        }
        entry.lookups = entry.lookups.saturating_sub(count);
        if entry.lookups == 0 {
            let access = entry.last_access;
            maps.idle.insert(access, inode);
        }
        Ok(())
    }

    /// Look up the entry for an inode.
    pub fn get_path(&self, inode: u64) -> io::Result<Option<InodeEntry>> {
        Ok(self.read()?.inode_to_entry.get(&inode).cloned())
    }

    /// Look up an inode by its path.
    pub fn get_inode(&self, path: &Path) -> io::Result<Option<u64>> {
        Ok(self.read()?.path_to_inode.get(path).copied())
    }

    /// Forget `path`. Descendants are left to age out.
    pub fn remove_path(&self, path: &Path) -> io::Result<()> {
        let mut maps = self.write()?;
        if let Some(&inode) = maps.path_to_inode.get(path) {
            maps.remove(inode);
        }
        Ok(())
    }

    /// Move `from` and everything below it to `to`, keeping inode numbers.
    ///
    /// Whatever was cached at `to` (and below) is dropped, as rename replaces it.
    pub fn rename_path(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut maps = self.write()?;
        let maps = &mut *maps;

        let replaced: Vec<u64> = maps
            .path_to_inode
            .iter()
            .filter(|(path, _)| path.starts_with(to) && !path.starts_with(from))
            .map(|(_, &inode)| inode)
            .collect();
        for inode in replaced {
            maps.remove(inode);
        }

        let moved: Vec<(PathBuf, u64)> = maps
            .path_to_inode
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, &inode)| (path.clone(), inode))
            .collect();
        for (old_path, inode) in moved {
            let Ok(suffix) = old_path.strip_prefix(from) else {
                continue;
            };
            let new_path = if suffix.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(suffix)
            };
            maps.path_to_inode.remove(&old_path);
            maps.path_to_inode.insert(new_path.clone(), inode);
            if let Some(entry) = maps.inode_to_entry.get_mut(&inode) {
                entry.path = new_path;
            }
        }
        Ok(())
    }

    /// Current cache size, root included.
    pub fn cache_size(&self) -> io::Result<usize> {
        Ok(self.read()?.inode_to_entry.len())
    }
}

impl Default for InodeManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable inode number from the first 8 bytes of the path's blake3 hash.
///
/// 0 (invalid) and 1 (root) are never returned.
fn hash_path(path: &Path) -> u64 {
    let hash = blake3::hash(path.as_os_str().as_bytes());
    let bytes = hash.as_bytes();
    let arr: [u8; 8] = [
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ];
    let inode = u64::from_le_bytes(arr);
    if inode <= ROOT_INODE { inode + 2 } else { inode }
}

fn next_inode(inode: u64) -> u64 {
    match inode.wrapping_add(1) {
        0 | ROOT_INODE => 2,
        next => next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> &Path {
        Path::new(s)
    }

    #[test]
    fn test_root_inode() {
        let mgr = InodeManager::new();
        let entry = mgr.get_path(ROOT_INODE).unwrap().unwrap();
        assert_eq!(entry.path, PathBuf::new());
        assert_eq!(mgr.get_inode(p("")).unwrap(), Some(ROOT_INODE));
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let mgr = InodeManager::new();

        let inode1 = mgr.get_or_create(p("dir/file")).unwrap();
        let inode2 = mgr.get_or_create(p("dir/file")).unwrap();

        assert_eq!(inode1, inode2);
        assert_ne!(inode1, ROOT_INODE);
        assert_ne!(inode1, mgr.get_or_create(p("dir/other")).unwrap());
    }

    #[test]
    fn test_same_path_same_inode_across_managers() {
        let a = InodeManager::new().get_or_create(p("x/y")).unwrap();
        let b = InodeManager::new().get_or_create(p("x/y")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_remove_path() {
        let mgr = InodeManager::new();

        let inode = mgr.get_or_create(p("test/path")).unwrap();
        mgr.remove_path(p("test/path")).unwrap();

        assert!(mgr.get_inode(p("test/path")).unwrap().is_none());
        assert!(mgr.get_path(inode).unwrap().is_none());
        mgr.remove_path(p("nonexistent")).unwrap();
    }

    #[test]
    fn test_rename_keeps_inode() {
        let mgr = InodeManager::new();
        let inode = mgr.get_or_create(p("a")).unwrap();

        mgr.rename_path(p("a"), p("b")).unwrap();

        assert_eq!(mgr.get_inode(p("b")).unwrap(), Some(inode));
        assert!(mgr.get_inode(p("a")).unwrap().is_none());
        assert_eq!(mgr.get_path(inode).unwrap().unwrap().path, PathBuf::from("b"));
    }

    #[test]
    fn test_rename_moves_descendants() {
        let mgr = InodeManager::new();
        let dir = mgr.get_or_create(p("src")).unwrap();
        let child = mgr.get_or_create(p("src/sub/file")).unwrap();
        let sibling = mgr.get_or_create(p("srcx")).unwrap();

        mgr.rename_path(p("src"), p("dst")).unwrap();

        assert_eq!(mgr.get_inode(p("dst")).unwrap(), Some(dir));
        assert_eq!(mgr.get_inode(p("dst/sub/file")).unwrap(), Some(child));
        // Component-wise prefix: "srcx" is not below "src".
        assert_eq!(mgr.get_inode(p("srcx")).unwrap(), Some(sibling));
    }

    #[test]
    fn test_rename_over_existing_drops_target() {
        let mgr = InodeManager::new();
        let source = mgr.get_or_create(p("a")).unwrap();
        let target = mgr.get_or_create(p("b")).unwrap();

        mgr.rename_path(p("a"), p("b")).unwrap();

        assert_eq!(mgr.get_inode(p("b")).unwrap(), Some(source));
        assert!(mgr.get_path(target).unwrap().is_none());
    }

    #[test]
    fn test_recreated_path_does_not_collide_with_renamed() {
        let mgr = InodeManager::new();
        let moved = mgr.get_or_create(p("a")).unwrap();
        mgr.rename_path(p("a"), p("b")).unwrap();

        let fresh = mgr.get_or_create(p("a")).unwrap();

        assert_ne!(fresh, moved);
        assert_eq!(mgr.get_path(moved).unwrap().unwrap().path, PathBuf::from("b"));
        assert_eq!(mgr.get_path(fresh).unwrap().unwrap().path, PathBuf::from("a"));
    }

    #[test]
    fn test_inode_never_zero_or_one() {
        let mgr = InodeManager::new();
        for i in 0..1000 {
            let inode = mgr.get_or_create(&PathBuf::from(format!("test/path/{i}"))).unwrap();
            assert!(inode >= 2, "Got reserved inode: {inode}");
        }
        assert_eq!(next_inode(u64::MAX), 2);
    }

    #[test]
    fn test_access_time_updates() {
        let mgr = InodeManager::new();

        let inode = mgr.get_or_create(p("test/path")).unwrap();
        let access1 = mgr.get_path(inode).unwrap().unwrap().last_access;
        mgr.get_or_create(p("test/path")).unwrap();
        let access2 = mgr.get_path(inode).unwrap().unwrap().last_access;

        assert!(access2 > access1);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let mgr = Arc::new(InodeManager::new());
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let mgr = mgr.clone();
                thread::spawn(move || {
                    for j in 0..100 {
                        mgr.get_or_create(&PathBuf::from(format!("thread{i}/path{j}"))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(mgr.cache_size().unwrap(), 1001);
    }

    #[test]
    fn test_lookup_counts_references() {
        let mgr = InodeManager::new();

        let inode = mgr.lookup(p("a")).unwrap();
        mgr.lookup(p("a")).unwrap();
        mgr.get_or_create(p("a")).unwrap();
        assert_eq!(mgr.get_path(inode).unwrap().unwrap().lookups, 2);

        mgr.forget(inode, 1).unwrap();
        assert_eq!(mgr.get_path(inode).unwrap().unwrap().lookups, 1);
        mgr.forget(inode, 5).unwrap();
        assert_eq!(mgr.get_path(inode).unwrap().unwrap().lookups, 0);

        // Unknown inodes and the root are ignored.
        mgr.forget(0xdead_beef, 1).unwrap();
        mgr.forget(ROOT_INODE, 1).unwrap();
    }

    #[test]
    fn test_eviction_spares_referenced_entries() {
        let mgr = InodeManager::new();
        let pinned = mgr.lookup(p("pinned/dir")).unwrap();

        for i in 0..(MAX_INODE_CACHE + 10) {
            mgr.get_or_create(&PathBuf::from(format!("pinned/dir/{i}"))).unwrap();
        }

        assert_eq!(mgr.get_inode(p("pinned/dir")).unwrap(), Some(pinned));
        assert_eq!(mgr.cache_size().unwrap(), MAX_INODE_CACHE);

        // Once released, the entry ages out like any other.
        mgr.forget(pinned, 1).unwrap();
        for i in 0..(MAX_INODE_CACHE + 10) {
            mgr.get_or_create(&PathBuf::from(format!("other/{i}"))).unwrap();
        }
        assert!(mgr.get_path(pinned).unwrap().is_none());
    }

    #[test]
    fn test_cache_grows_past_bound_when_all_referenced() {
        let mgr = InodeManager::new();
        for i in 0..(MAX_INODE_CACHE + 5) {
            mgr.lookup(&PathBuf::from(format!("held/{i}"))).unwrap();
        }
        assert_eq!(mgr.cache_size().unwrap(), MAX_INODE_CACHE + 6);
    }

    #[test]
    fn test_renamed_entry_keeps_reference() {
        let mgr = InodeManager::new();
        let inode = mgr.lookup(p("a")).unwrap();

        mgr.rename_path(p("a"), p("b")).unwrap();
        for i in 0..(MAX_INODE_CACHE + 10) {
            mgr.get_or_create(&PathBuf::from(format!("x/{i}"))).unwrap();
        }

        assert_eq!(mgr.get_inode(p("b")).unwrap(), Some(inode));
    }

    #[test]
    fn test_lru_eviction_spares_root() {
        let mgr = InodeManager::new();

        for i in 0..(MAX_INODE_CACHE + 10) {
            mgr.get_or_create(&PathBuf::from(format!("eviction/path/{i}"))).unwrap();
        }

        assert_eq!(mgr.cache_size().unwrap(), MAX_INODE_CACHE);
        assert!(mgr.get_path(ROOT_INODE).unwrap().is_some());
        // The oldest entry went first.
        assert!(mgr.get_inode(p("eviction/path/0")).unwrap().is_none());
    }
}
