use fuser::{FileAttr, FileType};
use std::time::SystemTime;

use crate::union::{EntryKind, UnionStat};

pub(crate) fn entry_kind_to_fuser(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::RegularFile => FileType::RegularFile,
        EntryKind::Directory => FileType::Directory,
        EntryKind::Symlink => FileType::Symlink,
        EntryKind::BlockDevice => FileType::BlockDevice,
        EntryKind::CharDevice => FileType::CharDevice,
        EntryKind::NamedPipe => FileType::NamedPipe,
        EntryKind::Socket => FileType::Socket,
    }
}

pub(crate) fn stat_to_fileattr(stat: &UnionStat, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.blocks,
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.ctime,
        crtime: SystemTime::UNIX_EPOCH,
        kind: entry_kind_to_fuser(stat.kind()),
        perm: (stat.mode & 0o7777) as u16,
        nlink: stat.nlink,
        uid: stat.uid,
        gid: stat.gid,
        rdev: stat.rdev as u32,
        blksize: stat.blksize,
        flags: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn test_stat_to_fileattr_keeps_special_bits() {
        let stat = UnionStat {
            mode: libc::S_IFREG as u32 | 0o4755,
            uid: 1,
            gid: 2,
            size: 10,
            blocks: 1,
            blksize: 4096,
            nlink: 1,
            rdev: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
        };
        let attr = stat_to_fileattr(&stat, 42);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.perm, 0o4755);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, 10);
    }
}
