//! The union core: one read-write branch overlaid on one read-only branch.
//!
//! Every operation works on logical paths; the union state is nothing but
//! the layout of the two branch trees plus the `.wh.` / `.me.` sidecars on
//! the read-write branch. The FUSE surface in `crate::fuse` is a thin
//! adapter over [`UnionFs`].

pub mod attr;
pub mod copyup;
pub mod meta;
pub mod path;
pub mod readdir;
pub mod resolve;
pub mod stat;
pub mod whiteout;

pub use attr::Creds;
pub use readdir::{DirHandle, MergedEntry};
pub use resolve::{Intent, Origin};
pub use stat::{AttrChanges, EntryKind, UnionStat};

use std::collections::HashMap;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::stat::{mknod, Mode, SFlag};
use nix::sys::statvfs::statvfs;
use nix::unistd::mkfifo;
use parking_lot::Mutex;

use crate::config::MountConfig;
use crate::error::{DuofsError, Result};
use crate::union::path::Branches;
use crate::union::resolve::{find_file, Resolved};
use crate::union::stat::VALID_MODES_MASK;

/// statfs result: the read-only branch's figures with the union's own
/// `f_type` / `f_fsid` stamped on. FUSE cannot carry the last two fields,
/// but library callers get them.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub frsize: u32,
    pub namelen: u32,
    pub fs_type: u64,
    pub fsid: u64,
}

/// An opened union file: the underlying branch handle plus where it came
/// from. All read/write/seek traffic goes straight to the handle.
#[derive(Debug)]
pub struct OpenFile {
    pub file: fs::File,
    pub origin: Origin,
}

/// The operation dispatcher.
///
/// State-mutating operations on the same logical path are serialised
/// through a per-path latch; the branches themselves are immutable
/// configuration.
pub struct UnionFs {
    branches: Branches,
    fs_magic: u64,
    fs_seed: u64,
    path_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl UnionFs {
    pub fn new(config: &MountConfig) -> Result<Self> {
        let ro_meta = fs::metadata(&config.ro_root).map_err(|e| {
            DuofsError::Config(format!(
                "read-only branch {} is not accessible: {}",
                config.ro_root.display(),
                e
            ))
        })?;
        if !ro_meta.is_dir() {
            return Err(DuofsError::Config(format!(
                "read-only branch {} is not a directory",
                config.ro_root.display()
            )));
        }

        if !config.rw_root.exists() {
            fs::create_dir_all(&config.rw_root).map_err(|e| {
                DuofsError::Config(format!(
                    "failed to create read-write branch {}: {}",
                    config.rw_root.display(),
                    e
                ))
            })?;
        }

        let ro_root = config.ro_root.canonicalize().map_err(DuofsError::Io)?;
        let rw_root = config.rw_root.canonicalize().map_err(DuofsError::Io)?;
        let branches = Branches::new(ro_root, rw_root)?;

        Ok(UnionFs {
            branches,
            fs_magic: config.fs_magic,
            fs_seed: config.fs_seed,
            path_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn branches(&self) -> &Branches {
        &self.branches
    }

    fn with_path_lock<T>(&self, logical: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = {
            let mut locks = self.path_locks.lock();
            locks
                .entry(logical.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = lock.lock();
        let result = f();
        drop(guard);
        self.path_locks.lock().remove(logical);
        result
    }

    /// Normalise a logical path for lookup-style operations. Sidecar names
    /// are invisible, so they resolve to nothing.
    fn logical_visible(&self, raw: &Path) -> Result<PathBuf> {
        let logical = path::normalize(raw)?;
        if path::is_reserved(&logical) {
            return Err(DuofsError::NotFound(logical));
        }
        Ok(logical)
    }

    /// Normalise a logical path for create-style operations. Sidecar names
    /// are reserved and refused outright.
    fn logical_creatable(&self, raw: &Path) -> Result<PathBuf> {
        let logical = path::normalize(raw)?;
        if path::is_reserved(&logical) {
            return Err(DuofsError::InvalidPath(logical));
        }
        Ok(logical)
    }

    /// Fail with AlreadyExists when a non-whited-out entry occupies the
    /// target.
    fn ensure_absent(&self, logical: &Path) -> Result<()> {
        match find_file(&self.branches, logical, Intent::Any) {
            Ok(_) => Err(DuofsError::AlreadyExists(logical.to_path_buf())),
            Err(DuofsError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn lookup(&self, raw: &Path) -> Result<UnionStat> {
        let logical = self.logical_visible(raw)?;
        attr::getattr(&self.branches, &logical)
    }

    pub fn getattr(&self, raw: &Path) -> Result<UnionStat> {
        self.lookup(raw)
    }

    pub fn setattr(&self, raw: &Path, changes: &AttrChanges) -> Result<UnionStat> {
        let logical = self.logical_visible(raw)?;
        tracing::debug!("setattr({}, {:?})", logical.display(), changes);
        self.with_path_lock(&logical, || attr::setattr(&self.branches, &logical, changes))
    }

    pub fn access(&self, raw: &Path, creds: &Creds, mask: i32) -> Result<()> {
        let logical = self.logical_visible(raw)?;
        let stat = attr::getattr(&self.branches, &logical)?;
        attr::can_access(&logical, &stat, creds, mask)
    }

    pub fn readlink(&self, raw: &Path) -> Result<PathBuf> {
        let logical = self.logical_visible(raw)?;
        let resolved = find_file(&self.branches, &logical, Intent::Any)?;
        Ok(fs::read_link(&resolved.path)?)
    }

    /// Open a union file. Write access promotes a read-only hit onto the
    /// read-write branch first; if anything fails after that promotion, the
    /// copy-up is reverted so the pre-open state is restored.
    pub fn open(&self, raw: &Path, flags: i32, creds: &Creds) -> Result<OpenFile> {
        let logical = self.logical_visible(raw)?;
        tracing::debug!("open({}, flags={:#x})", logical.display(), flags);
        self.with_path_lock(&logical, || {
            let write = (flags & libc::O_ACCMODE) != libc::O_RDONLY;
            let intent = if write {
                Intent::CreateCopyup
            } else {
                Intent::Any
            };
            let resolved = find_file(&self.branches, &logical, intent)?;

            if resolved.origin == Origin::ReadWriteCopyup {
                if let Err(e) = attr::can_create(&self.branches, &logical, creds) {
                    self.undo_copyup(&logical, &resolved);
                    return Err(e);
                }
            }

            let mut options = OpenOptions::new();
            match flags & libc::O_ACCMODE {
                libc::O_WRONLY => {
                    options.write(true);
                }
                libc::O_RDWR => {
                    options.read(true).write(true);
                }
                _ => {
                    options.read(true);
                }
            }
            if write {
                if flags & libc::O_TRUNC != 0 {
                    options.truncate(true);
                }
                if flags & libc::O_APPEND != 0 {
                    options.append(true);
                }
            }

            match options.open(&resolved.path) {
                Ok(file) => Ok(OpenFile {
                    file,
                    origin: resolved.origin,
                }),
                Err(e) => {
                    if resolved.origin == Origin::ReadWriteCopyup {
                        self.undo_copyup(&logical, &resolved);
                    }
                    Err(e.into())
                }
            }
        })
    }

    fn undo_copyup(&self, logical: &Path, resolved: &Resolved) {
        if let Some(cu) = &resolved.copyup {
            copyup::revert_copy_up(&self.branches, logical, cu);
        }
    }

    /// Create a regular file on the read-write branch, owned by the caller.
    pub fn create(&self, raw: &Path, mode: u32, creds: &Creds) -> Result<(fs::File, UnionStat)> {
        let logical = self.logical_creatable(raw)?;
        tracing::debug!("create({}, mode={:#o})", logical.display(), mode);
        self.with_path_lock(&logical, || {
            self.ensure_absent(&logical)?;
            attr::can_create(&self.branches, &logical, creds)?;
            copyup::find_path(&self.branches, &logical)?;

            let rw_path = self.branches.to_rw(&logical)?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(mode & VALID_MODES_MASK)
                .open(&rw_path)?;

            if let Err(e) = attr::set_owner(&rw_path, Some(creds.uid), Some(creds.gid)) {
                drop(file);
                let _ = fs::remove_file(&rw_path);
                return Err(e);
            }

            whiteout::unlink_whiteout(&self.branches, &logical)?;
            let stat = attr::getattr(&self.branches, &logical)?;
            Ok((file, stat))
        })
    }

    /// Create a directory on the read-write branch. If it replaces a
    /// whited-out read-only directory, the stale read-only contents are
    /// whited out so the new directory reads as empty.
    pub fn mkdir(&self, raw: &Path, mode: u32, creds: &Creds) -> Result<UnionStat> {
        let logical = self.logical_creatable(raw)?;
        tracing::debug!("mkdir({}, mode={:#o})", logical.display(), mode);
        self.with_path_lock(&logical, || {
            self.ensure_absent(&logical)?;
            attr::can_create(&self.branches, &logical, creds)?;
            copyup::find_path(&self.branches, &logical)?;

            let rw_path = self.branches.to_rw(&logical)?;
            DirBuilder::new()
                .mode(mode & VALID_MODES_MASK)
                .create(&rw_path)?;

            if let Err(e) = attr::set_owner(&rw_path, Some(creds.uid), Some(creds.gid)) {
                let _ = fs::remove_dir(&rw_path);
                return Err(e);
            }

            if let Err(e) = whiteout::hide_dir_contents(&self.branches, &logical) {
                let _ = fs::remove_dir(&rw_path);
                return Err(e);
            }

            whiteout::unlink_whiteout(&self.branches, &logical)?;
            attr::getattr(&self.branches, &logical)
        })
    }

    /// Create a device node, FIFO or socket placeholder on the read-write
    /// branch.
    pub fn mknod(&self, raw: &Path, mode: u32, rdev: u64, creds: &Creds) -> Result<UnionStat> {
        let logical = self.logical_creatable(raw)?;
        tracing::debug!("mknod({}, mode={:#o}, rdev={})", logical.display(), mode, rdev);
        self.with_path_lock(&logical, || {
            self.ensure_absent(&logical)?;
            copyup::find_path(&self.branches, &logical)?;

            let rw_path = self.branches.to_rw(&logical)?;
            let perm = Mode::from_bits_truncate((mode & VALID_MODES_MASK) as libc::mode_t);
            if mode & libc::S_IFMT as u32 == libc::S_IFIFO as u32 {
                mkfifo(&rw_path, perm)?;
            } else {
                let kind = SFlag::from_bits_truncate((mode & libc::S_IFMT as u32) as libc::mode_t);
                mknod(&rw_path, kind, perm, rdev as libc::dev_t)?;
            }

            if let Err(e) = attr::set_owner(&rw_path, Some(creds.uid), Some(creds.gid)) {
                let _ = fs::remove_file(&rw_path);
                return Err(e);
            }

            whiteout::unlink_whiteout(&self.branches, &logical)?;
            attr::getattr(&self.branches, &logical)
        })
    }

    /// Create a symbolic link on the read-write branch.
    pub fn symlink(&self, raw: &Path, target: &Path, creds: &Creds) -> Result<UnionStat> {
        let logical = self.logical_creatable(raw)?;
        tracing::debug!("symlink({} -> {})", logical.display(), target.display());
        self.with_path_lock(&logical, || {
            self.ensure_absent(&logical)?;
            attr::can_create(&self.branches, &logical, creds)?;
            copyup::find_path(&self.branches, &logical)?;

            let rw_path = self.branches.to_rw(&logical)?;
            std::os::unix::fs::symlink(target, &rw_path)?;

            if let Err(e) = attr::set_owner(&rw_path, Some(creds.uid), Some(creds.gid)) {
                let _ = fs::remove_file(&rw_path);
                return Err(e);
            }

            whiteout::unlink_whiteout(&self.branches, &logical)?;
            attr::getattr(&self.branches, &logical)
        })
    }

    /// Hard-link `old` to `new` within the read-write branch. A read-only
    /// source cannot be hard-linked across branches, so it degrades to a
    /// symlink pointing at the read-only file.
    pub fn link(&self, old: &Path, new: &Path, creds: &Creds) -> Result<UnionStat> {
        let old_logical = self.logical_visible(old)?;
        let new_logical = self.logical_creatable(new)?;
        tracing::debug!(
            "link({} -> {})",
            old_logical.display(),
            new_logical.display()
        );
        self.with_path_lock(&new_logical, || {
            let from = find_file(&self.branches, &old_logical, Intent::Any)?;
            self.ensure_absent(&new_logical)?;
            attr::can_create(&self.branches, &new_logical, creds)?;
            copyup::find_path(&self.branches, &new_logical)?;

            let rw_new = self.branches.to_rw(&new_logical)?;
            match from.origin {
                Origin::ReadOnly => {
                    std::os::unix::fs::symlink(&from.path, &rw_new)?;
                }
                Origin::ReadWrite | Origin::ReadWriteCopyup => {
                    fs::hard_link(&from.path, &rw_new)?;
                }
            }

            whiteout::unlink_whiteout(&self.branches, &new_logical)?;
            attr::getattr(&self.branches, &new_logical)
        })
    }

    /// Remove a non-directory entry.
    pub fn unlink(&self, raw: &Path, creds: &Creds) -> Result<()> {
        let logical = self.logical_visible(raw)?;
        tracing::debug!("unlink({})", logical.display());
        self.with_path_lock(&logical, || {
            let resolved = find_file(&self.branches, &logical, Intent::Any)?;
            attr::can_remove(&self.branches, &logical, creds)?;

            match resolved.origin {
                Origin::ReadWrite | Origin::ReadWriteCopyup => {
                    let has_ro =
                        find_file(&self.branches, &logical, Intent::MustRo).is_ok();
                    if has_ro {
                        // Whiteout first: a deleted file cannot be restored,
                        // a stray marker can.
                        let marker = whiteout::create_whiteout(&self.branches, &logical)?;
                        if let Err(e) = fs::remove_file(&resolved.path) {
                            if let Err(re) = fs::remove_file(&marker) {
                                tracing::warn!(
                                    "rollback failed to remove whiteout {}: {}",
                                    marker.display(),
                                    re
                                );
                            }
                            return Err(e.into());
                        }
                    } else {
                        fs::remove_file(&resolved.path)?;
                    }
                }
                Origin::ReadOnly => {
                    let me = meta::find_me(&self.branches, &logical)?;
                    if let Some((me_path, _)) = &me {
                        fs::remove_file(me_path)?;
                    }
                    if let Err(e) = whiteout::create_whiteout(&self.branches, &logical) {
                        if let Some((_, me_stat)) = &me {
                            if let Err(re) = meta::create_me(&self.branches, &logical, me_stat) {
                                tracing::warn!(
                                    "rollback failed to restore sidecar for {}: {}",
                                    logical.display(),
                                    re
                                );
                            }
                        }
                        return Err(e);
                    }
                }
            }
            Ok(())
        })
    }

    /// Remove a directory. Emptiness is judged over the merged view, so a
    /// directory whose read-only entries are all whited out counts as
    /// empty.
    pub fn rmdir(&self, raw: &Path, creds: &Creds) -> Result<()> {
        let logical = self.logical_visible(raw)?;
        tracing::debug!("rmdir({})", logical.display());
        self.with_path_lock(&logical, || {
            let resolved = find_file(&self.branches, &logical, Intent::Any)?;
            if !fs::symlink_metadata(&resolved.path)?.is_dir() {
                return Err(DuofsError::Io(io::Error::from_raw_os_error(
                    libc::ENOTDIR,
                )));
            }
            attr::can_remove(&self.branches, &logical, creds)?;

            match resolved.origin {
                Origin::ReadWrite | Origin::ReadWriteCopyup => {
                    let ro_dir = find_file(&self.branches, &logical, Intent::MustRo)
                        .ok()
                        .map(|r| r.path);
                    if !readdir::is_empty_dir(ro_dir.as_deref(), Some(&resolved.path))? {
                        return Err(DuofsError::NotEmpty(logical.clone()));
                    }
                    // The root cannot carry a whiteout: its marker would
                    // live outside the union.
                    if ro_dir.is_some() && logical.parent().is_some() {
                        let marker = whiteout::create_whiteout(&self.branches, &logical)?;
                        if let Err(e) = remove_rw_dir(&resolved.path) {
                            if let Err(re) = fs::remove_file(&marker) {
                                tracing::warn!(
                                    "rollback failed to remove whiteout {}: {}",
                                    marker.display(),
                                    re
                                );
                            }
                            return Err(e);
                        }
                    } else {
                        remove_rw_dir(&resolved.path)?;
                    }
                }
                Origin::ReadOnly => {
                    if !readdir::is_empty_dir(Some(&resolved.path), None)? {
                        return Err(DuofsError::NotEmpty(logical.clone()));
                    }
                    let me = meta::find_me(&self.branches, &logical)?;
                    if let Some((me_path, _)) = &me {
                        fs::remove_file(me_path)?;
                    }
                    if let Err(e) = whiteout::create_whiteout(&self.branches, &logical) {
                        if let Some((_, me_stat)) = &me {
                            if let Err(re) = meta::create_me(&self.branches, &logical, me_stat) {
                                tracing::warn!(
                                    "rollback failed to restore sidecar for {}: {}",
                                    logical.display(),
                                    re
                                );
                            }
                        }
                        return Err(e);
                    }
                }
            }
            Ok(())
        })
    }

    /// Open a merged directory listing.
    pub fn opendir(&self, raw: &Path) -> Result<DirHandle> {
        let logical = self.logical_visible(raw)?;
        let resolved = find_file(&self.branches, &logical, Intent::Any)?;
        if !fs::symlink_metadata(&resolved.path)?.is_dir() {
            return Err(DuofsError::Io(io::Error::from_raw_os_error(
                libc::ENOTDIR,
            )));
        }

        let rw_dir = find_file(&self.branches, &logical, Intent::MustRw)
            .ok()
            .map(|r| r.path);
        let ro_dir = find_file(&self.branches, &logical, Intent::MustRo)
            .ok()
            .map(|r| r.path);
        Ok(DirHandle::new(logical, ro_dir, rw_dir))
    }

    /// statfs of the union: the read-only branch's figures with the
    /// configured `f_type` and `f_fsid`.
    pub fn statfs(&self) -> Result<FsStats> {
        let vfs = statvfs(self.branches.ro_root())?;
        Ok(FsStats {
            blocks: vfs.blocks() as u64,
            bfree: vfs.blocks_free() as u64,
            bavail: vfs.blocks_available() as u64,
            files: vfs.files() as u64,
            ffree: vfs.files_free() as u64,
            bsize: vfs.block_size() as u32,
            frsize: vfs.fragment_size() as u32,
            namelen: vfs.name_max() as u32,
            fs_type: self.fs_magic,
            fsid: self.fs_seed,
        })
    }
}

/// Remove a read-write directory that is merged-empty: clear the sidecar
/// entries it may still physically hold, then remove it.
fn remove_rw_dir(rw: &Path) -> Result<()> {
    for entry in fs::read_dir(rw)? {
        let entry = entry?;
        if path::classify(&entry.file_name()) != path::NameClass::Normal {
            fs::remove_file(entry.path())?;
        }
    }
    fs::remove_dir(rw)?;
    Ok(())
}
