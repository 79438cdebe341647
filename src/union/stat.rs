use std::fs::Metadata;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The alterable permission and special bits: rwx for user/group/other plus
/// setuid, setgid and sticky. File-type bits are intrinsic and never come
/// from an ME sidecar.
pub const VALID_MODES_MASK: u32 = (libc::S_ISUID
    | libc::S_ISGID
    | libc::S_ISVTX
    | libc::S_IRWXU
    | libc::S_IRWXG
    | libc::S_IRWXO) as u32;

/// Strip everything but the alterable bits from a mode.
pub fn clear_mode_flags(mode: u32) -> u32 {
    mode & VALID_MODES_MASK
}

/// Stable inode number for a logical path.
///
/// The union has no inode store of its own: the logical path IS the
/// identity, so the inode number is a hash of it. 0 and 1 are avoided
/// because FUSE reserves inode 1 for the root.
pub fn name_to_ino(logical: &Path) -> u64 {
    match fxhash::hash64(logical.as_os_str().as_bytes()) {
        h @ (0 | 1) => h + 2,
        h => h,
    }
}

/// File type as reported in merged directory listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    NamedPipe,
    Socket,
}

impl EntryKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & (libc::S_IFMT as u32) {
            x if x == libc::S_IFDIR as u32 => EntryKind::Directory,
            x if x == libc::S_IFLNK as u32 => EntryKind::Symlink,
            x if x == libc::S_IFBLK as u32 => EntryKind::BlockDevice,
            x if x == libc::S_IFCHR as u32 => EntryKind::CharDevice,
            x if x == libc::S_IFIFO as u32 => EntryKind::NamedPipe,
            x if x == libc::S_IFSOCK as u32 => EntryKind::Socket,
            _ => EntryKind::RegularFile,
        }
    }
}

/// The stat record the union exposes: data attributes from the resolved
/// branch file, possibly overlaid with deported metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnionStat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub nlink: u32,
    pub rdev: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl UnionStat {
    pub fn from_metadata(meta: &Metadata) -> Self {
        UnionStat {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.len(),
            blocks: meta.blocks(),
            blksize: meta.blksize() as u32,
            nlink: meta.nlink() as u32,
            rdev: meta.rdev(),
            atime: timestamp(meta.atime(), meta.atime_nsec()),
            mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
            ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
        }
    }

    pub fn kind(&self) -> EntryKind {
        EntryKind::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == EntryKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind() == EntryKind::Symlink
    }
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0)
    }
}

/// The set of attribute changes a setattr carries. Fields left as `None`
/// are untouched. This is the union-side analogue of the kernel's iattr.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttrChanges {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

impl AttrChanges {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.size.is_none()
            && self.atime.is_none()
            && self.mtime.is_none()
    }
}
