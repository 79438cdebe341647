//! FUSE adapter over the union core.
//!
//! The kernel speaks inodes; the core speaks logical paths. The adapter
//! keeps an inode-to-path cache (inode numbers are stable hashes of the
//! logical path), forwards file I/O to the opened branch handles, and maps
//! core errors to errnos.

mod convert;

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyLseek, ReplyOpen, ReplyStatfs, Request, TimeOrNow, FUSE_ROOT_ID,
};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::config::MountConfig;
use crate::error::{io_error_to_errno, Result};
use crate::union::stat::name_to_ino;
use crate::union::{AttrChanges, Creds, DirHandle, UnionFs};

const INODE_CACHE_CAPACITY: usize = 10_000;

thread_local! {
    static READ_BUFFER: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(128 * 1024));
}

/// Inode-number to logical-path cache. The root is pinned; everything else
/// is an LRU entry keyed by the path hash.
struct InodePaths {
    cache: LruCache<u64, PathBuf>,
}

impl InodePaths {
    fn new() -> Self {
        InodePaths {
            cache: LruCache::new(NonZeroUsize::new(INODE_CACHE_CAPACITY).unwrap()),
        }
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        if ino == FUSE_ROOT_ID {
            return Some(PathBuf::from("/"));
        }
        self.cache.peek(&ino).cloned()
    }

    fn remember(&mut self, logical: &Path) -> u64 {
        if logical == Path::new("/") {
            return FUSE_ROOT_ID;
        }
        let ino = name_to_ino(logical);
        self.cache.put(ino, logical.to_path_buf());
        ino
    }

    fn forget(&mut self, logical: &Path) {
        self.cache.pop(&name_to_ino(logical));
    }
}

struct FileHandleEntry {
    file: Arc<Mutex<fs::File>>,
}

pub struct DuoFs {
    union: UnionFs,
    inodes: RwLock<InodePaths>,
    file_handles: RwLock<HashMap<u64, FileHandleEntry>>,
    dir_handles: RwLock<HashMap<u64, Arc<Mutex<DirHandle>>>>,
    next_fh: Mutex<u64>,
    ttl: Duration,
}

impl DuoFs {
    pub fn new(config: &MountConfig) -> Result<Self> {
        Ok(DuoFs {
            union: UnionFs::new(config)?,
            inodes: RwLock::new(InodePaths::new()),
            file_handles: RwLock::new(HashMap::new()),
            dir_handles: RwLock::new(HashMap::new()),
            next_fh: Mutex::new(1),
            ttl: Duration::from_secs(config.ttl_secs),
        })
    }

    pub fn union(&self) -> &UnionFs {
        &self.union
    }

    fn alloc_fh(&self) -> u64 {
        let mut next = self.next_fh.lock();
        let fh = *next;
        // File handles are ephemeral; wrapping is not a practical concern
        *next = next.wrapping_add(1);
        fh
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.read().path_of(ino)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.path_of(parent).map(|p| p.join(name))
    }

    fn creds(req: &Request<'_>) -> Creds {
        Creds {
            uid: req.uid(),
            gid: req.gid(),
        }
    }

    fn file_of(&self, fh: u64) -> Option<Arc<Mutex<fs::File>>> {
        self.file_handles.read().get(&fh).map(|h| Arc::clone(&h.file))
    }
}

fn resolve_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl Filesystem for DuoFs {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        tracing::info!(
            "duofs initialized: ro={}, rw={}",
            self.union.branches().ro_root().display(),
            self.union.branches().rw_root().display()
        );
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("duofs destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        tracing::trace!("lookup(parent={}, name={:?})", parent, name);
        let Some(child) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.union.lookup(&child) {
            Ok(stat) => {
                let ino = self.inodes.write().remember(&child);
                reply.entry(&self.ttl, &convert::stat_to_fileattr(&stat, ino), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        tracing::trace!("getattr(ino={})", ino);
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.union.getattr(&path) {
            Ok(stat) => reply.attr(&self.ttl, &convert::stat_to_fileattr(&stat, ino)),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let changes = AttrChanges {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(resolve_time),
            mtime: mtime.map(resolve_time),
        };
        match self.union.setattr(&path, &changes) {
            Ok(stat) => reply.attr(&self.ttl, &convert::stat_to_fileattr(&stat, ino)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.union.readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(child) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self
            .union
            .mknod(&child, mode, rdev as u64, &Self::creds(req))
        {
            Ok(stat) => {
                let ino = self.inodes.write().remember(&child);
                reply.entry(&self.ttl, &convert::stat_to_fileattr(&stat, ino), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(child) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.union.mkdir(&child, mode, &Self::creds(req)) {
            Ok(stat) => {
                let ino = self.inodes.write().remember(&child);
                reply.entry(&self.ttl, &convert::stat_to_fileattr(&stat, ino), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(child) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.union.unlink(&child, &Self::creds(req)) {
            Ok(()) => {
                self.inodes.write().forget(&child);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(child) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.union.rmdir(&child, &Self::creds(req)) {
            Ok(()) => {
                self.inodes.write().forget(&child);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(child) = self.child_path(parent, link_name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.union.symlink(&child, target, &Self::creds(req)) {
            Ok(stat) => {
                let ino = self.inodes.write().remember(&child);
                reply.entry(&self.ttl, &convert::stat_to_fileattr(&stat, ino), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let Some(old) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(new) = self.child_path(newparent, newname) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.union.link(&old, &new, &Self::creds(req)) {
            Ok(stat) => {
                let new_ino = self.inodes.write().remember(&new);
                reply.entry(&self.ttl, &convert::stat_to_fileattr(&stat, new_ino), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        tracing::debug!("open(ino={}, flags={:#x})", ino, flags);
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.union.open(&path, flags, &Self::creds(req)) {
            Ok(open_file) => {
                let fh = self.alloc_fh();
                self.file_handles.write().insert(
                    fh,
                    FileHandleEntry {
                        file: Arc::new(Mutex::new(open_file.file)),
                    },
                );
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        // Clone the handle Arc so slow disk I/O does not hold the table lock
        let Some(file_arc) = self.file_of(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut file = file_arc.lock();

        READ_BUFFER.with(|buffer| {
            let mut buf = buffer.borrow_mut();
            let requested = size as usize;
            let capacity = buf.capacity();
            if capacity < requested {
                buf.reserve(requested - capacity);
            }
            buf.resize(requested, 0u8);

            if let Err(e) = file.seek(SeekFrom::Start(offset as u64)) {
                reply.error(io_error_to_errno(&e));
                return;
            }

            // A short read before EOF would truncate what the kernel sees
            let mut filled = 0;
            loop {
                match file.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => {
                        filled += n;
                        if filled == requested {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        reply.error(io_error_to_errno(&e));
                        return;
                    }
                }
            }
            reply.data(&buf[..filled]);
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let Some(file_arc) = self.file_of(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut file = file_arc.lock();

        if let Err(e) = file.seek(SeekFrom::Start(offset as u64)) {
            reply.error(io_error_to_errno(&e));
            return;
        }
        match file.write_all(data) {
            Ok(()) => reply.written(data.len() as u32),
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        if self.file_handles.read().contains_key(&fh) {
            reply.ok();
        } else {
            reply.error(libc::EBADF);
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.file_handles.write().remove(&fh);
        reply.ok();
    }

    fn lseek(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        let Some(file_arc) = self.file_of(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let pos = match whence {
            libc::SEEK_SET => SeekFrom::Start(offset as u64),
            libc::SEEK_CUR => SeekFrom::Current(offset),
            libc::SEEK_END => SeekFrom::End(offset),
            _ => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        let mut file = file_arc.lock();
        match file.seek(pos) {
            Ok(new_offset) => reply.offset(new_offset as i64),
            Err(e) => reply.error(io_error_to_errno(&e)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        tracing::trace!("opendir(ino={}, flags={:#x})", ino, flags);
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.union.opendir(&path) {
            Ok(handle) => {
                let fh = self.alloc_fh();
                self.dir_handles
                    .write()
                    .insert(fh, Arc::new(Mutex::new(handle)));
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        tracing::trace!("readdir(ino={}, fh={}, offset={})", ino, fh, offset);
        let Some(handle_arc) = self.dir_handles.read().get(&fh).map(Arc::clone) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut handle = handle_arc.lock();

        let entries = match handle.entries() {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        for (idx, entry) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(
                entry.ino,
                (idx + 1) as i64,
                convert::entry_kind_to_fuser(entry.kind),
                &entry.name,
            ) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        self.dir_handles.write().remove(&fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.union.statfs() {
            Ok(stats) => reply.statfs(
                stats.blocks,
                stats.bfree,
                stats.bavail,
                stats.files,
                stats.ffree,
                stats.bsize,
                stats.namelen,
                stats.frsize,
            ),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.union.access(&path, &Self::creds(req), mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        tracing::debug!("create(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        let Some(child) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.union.create(&child, mode, &Self::creds(req)) {
            Ok((file, stat)) => {
                let ino = self.inodes.write().remember(&child);
                let fh = self.alloc_fh();
                self.file_handles.write().insert(
                    fh,
                    FileHandleEntry {
                        file: Arc::new(Mutex::new(file)),
                    },
                );
                reply.created(
                    &self.ttl,
                    &convert::stat_to_fileattr(&stat, ino),
                    0,
                    fh,
                    flags as u32,
                );
            }
            Err(e) => reply.error(e.errno()),
        }
    }
}
