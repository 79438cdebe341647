//! Deported metadata (ME) sidecars.
//!
//! Changing the owner, times or mode of a file that only exists on the
//! read-only branch does not copy the file up. Instead the altered metadata
//! is deported into a zero-byte `.me.<name>` file beside it on the
//! read-write branch: the sidecar's own stat record carries the logical
//! owner, times and alterable mode bits. Reads merge the read-only file's
//! data attributes with the sidecar's metadata attributes.
//!
//! An ME only exists while its file has not been copied up: copy-up folds
//! the sidecar into the new read-write file and deletes it.

use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::union::attr::{set_mode, set_owner, set_times};
use crate::union::copyup::find_path;
use crate::union::path::{Branches, SpecialKind};
use crate::union::stat::{clear_mode_flags, AttrChanges, UnionStat, VALID_MODES_MASK};

/// Locate the ME sidecar for a logical path, returning its concrete path
/// and stat record. The root cannot carry an ME.
pub fn find_me(branches: &Branches, logical: &Path) -> Result<Option<(PathBuf, UnionStat)>> {
    if logical.parent().is_none() {
        return Ok(None);
    }
    let path = branches.to_special(logical, SpecialKind::Me)?;
    match fs::symlink_metadata(&path) {
        Ok(meta) => Ok(Some((path, UnionStat::from_metadata(&meta)))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Create an ME sidecar carrying the given stat record. Used both by the
/// attribute engine and to re-create a sidecar when rolling back a failed
/// compound operation.
pub fn create_me(branches: &Branches, logical: &Path, stat: &UnionStat) -> Result<PathBuf> {
    let me = branches.to_special(logical, SpecialKind::Me)?;
    find_path(branches, logical)?;

    let mode = clear_mode_flags(stat.mode);
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(&me)?;

    // The creation mode is subject to the umask; apply the full record in a
    // single attribute update.
    set_mode(&me, mode)?;
    set_owner(&me, Some(stat.uid), Some(stat.gid))?;
    set_times(&me, stat.atime, stat.mtime)?;
    Ok(me)
}

/// Apply a metadata change to the ME sidecar of a read-only file, creating
/// the sidecar if none exists yet.
///
/// Only mode, owner and times deport into an ME; a size change is a data
/// operation and is not accepted here. On first creation the fields the
/// caller did not request are backfilled from the read-only file's current
/// stat so the merge rule stays complete.
pub fn set_me(
    branches: &Branches,
    logical: &Path,
    real_path: &Path,
    changes: &AttrChanges,
) -> Result<()> {
    let changes = AttrChanges {
        size: None,
        ..*changes
    };
    if changes.is_empty() {
        return Ok(());
    }

    match find_me(branches, logical)? {
        None => {
            let base = UnionStat::from_metadata(&fs::symlink_metadata(real_path)?);
            find_path(branches, logical)?;
            let me = branches.to_special(logical, SpecialKind::Me)?;

            let mode = clear_mode_flags(changes.mode.unwrap_or(base.mode));
            let created = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(mode)
                .open(&me);
            if let Err(e) = created {
                return Err(e.into());
            }

            let applied = set_mode(&me, mode)
                .and_then(|_| {
                    set_owner(
                        &me,
                        Some(changes.uid.unwrap_or(base.uid)),
                        Some(changes.gid.unwrap_or(base.gid)),
                    )
                })
                .and_then(|_| {
                    set_times(
                        &me,
                        changes.atime.unwrap_or(base.atime),
                        changes.mtime.unwrap_or(base.mtime),
                    )
                });
            if let Err(e) = applied {
                // A half-attributed sidecar would corrupt every later merge
                let _ = fs::remove_file(&me);
                return Err(e);
            }
            Ok(())
        }
        Some((me, current)) => {
            if let Some(mode) = changes.mode {
                set_mode(&me, clear_mode_flags(mode))?;
            }
            if changes.uid.is_some() || changes.gid.is_some() {
                set_owner(&me, changes.uid, changes.gid)?;
            }
            if changes.atime.is_some() || changes.mtime.is_some() {
                set_times(
                    &me,
                    changes.atime.unwrap_or(current.atime),
                    changes.mtime.unwrap_or(current.mtime),
                )?;
            }
            Ok(())
        }
    }
}

/// Merge the data attributes of a branch file with the metadata attributes
/// of its ME sidecar: owner and times come from the sidecar, the mode is
/// the file's non-alterable bits plus the sidecar's alterable bits.
pub fn merge_attr(data: &UnionStat, me: &UnionStat) -> UnionStat {
    let mut merged = *data;
    merged.uid = me.uid;
    merged.gid = me.gid;
    merged.atime = me.atime;
    merged.mtime = me.mtime;
    merged.ctime = me.ctime;
    merged.mode = (data.mode & !VALID_MODES_MASK) | clear_mode_flags(me.mode);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Branches) {
        let dir = tempdir().unwrap();
        let ro = dir.path().join("ro");
        let rw = dir.path().join("rw");
        fs::create_dir_all(&ro).unwrap();
        fs::create_dir_all(&rw).unwrap();
        (dir, Branches::new(ro, rw).unwrap())
    }

    fn sample_stat(mode: u32) -> UnionStat {
        UnionStat {
            mode,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            size: 0,
            blocks: 0,
            blksize: 4096,
            nlink: 1,
            rdev: 0,
            atime: UNIX_EPOCH + Duration::from_secs(1_000_000),
            mtime: UNIX_EPOCH + Duration::from_secs(2_000_000),
            ctime: UNIX_EPOCH + Duration::from_secs(3_000_000),
        }
    }

    #[test]
    fn test_merge_attr_composition() {
        let data = UnionStat {
            mode: libc::S_IFREG as u32 | 0o644,
            uid: 1000,
            gid: 1000,
            ..sample_stat(0)
        };
        let me = UnionStat {
            mode: 0o4600,
            uid: 2000,
            gid: 2000,
            ..sample_stat(0)
        };
        let merged = merge_attr(&data, &me);
        assert_eq!(merged.mode, libc::S_IFREG as u32 | 0o4600);
        assert_eq!(merged.uid, 2000);
        assert_eq!(merged.gid, 2000);
        assert_eq!(merged.atime, me.atime);
        assert_eq!(merged.mtime, me.mtime);
        assert_eq!(merged.ctime, me.ctime);
        // Data-side attributes survive
        assert_eq!(merged.size, data.size);
        assert_eq!(merged.nlink, data.nlink);
    }

    #[test]
    fn test_create_me_then_find_me_roundtrip() {
        let (_dir, branches) = setup();
        let logical = Path::new("/a/file.txt");
        let stat = sample_stat(libc::S_IFREG as u32 | 0o640);

        create_me(&branches, logical, &stat).unwrap();
        let (me_path, found) = find_me(&branches, logical).unwrap().unwrap();

        assert!(me_path.ends_with("a/.me.file.txt"));
        assert_eq!(clear_mode_flags(found.mode), 0o640);
        assert_eq!(found.uid, stat.uid);
        assert_eq!(found.gid, stat.gid);
        assert_eq!(found.atime, stat.atime);
        assert_eq!(found.mtime, stat.mtime);
        assert_eq!(found.size, 0);
    }

    #[test]
    fn test_find_me_absent() {
        let (_dir, branches) = setup();
        assert!(find_me(&branches, Path::new("/nothing")).unwrap().is_none());
        assert!(find_me(&branches, Path::new("/")).unwrap().is_none());
    }

    #[test]
    fn test_set_me_creates_with_backfill() {
        let (_dir, branches) = setup();
        let ro_file = branches.ro_root().join("data.txt");
        fs::write(&ro_file, b"payload").unwrap();
        let base = UnionStat::from_metadata(&fs::symlink_metadata(&ro_file).unwrap());

        let changes = AttrChanges {
            mode: Some(0o600),
            ..Default::default()
        };
        set_me(&branches, Path::new("/data.txt"), &ro_file, &changes).unwrap();

        let (_, me) = find_me(&branches, Path::new("/data.txt")).unwrap().unwrap();
        assert_eq!(clear_mode_flags(me.mode), 0o600);
        // Untouched fields backfilled from the data file
        assert_eq!(me.uid, base.uid);
        assert_eq!(me.atime, base.atime);
        assert_eq!(me.mtime, base.mtime);
    }

    #[test]
    fn test_set_me_updates_only_requested_fields() {
        let (_dir, branches) = setup();
        let ro_file = branches.ro_root().join("data.txt");
        fs::write(&ro_file, b"payload").unwrap();

        set_me(
            &branches,
            Path::new("/data.txt"),
            &ro_file,
            &AttrChanges {
                mode: Some(0o640),
                ..Default::default()
            },
        )
        .unwrap();

        let mtime = UNIX_EPOCH + Duration::from_secs(42);
        set_me(
            &branches,
            Path::new("/data.txt"),
            &ro_file,
            &AttrChanges {
                mtime: Some(mtime),
                ..Default::default()
            },
        )
        .unwrap();

        let (_, me) = find_me(&branches, Path::new("/data.txt")).unwrap().unwrap();
        assert_eq!(clear_mode_flags(me.mode), 0o640);
        assert_eq!(me.mtime, mtime);
    }

    #[test]
    fn test_set_me_ignores_size() {
        let (_dir, branches) = setup();
        let ro_file = branches.ro_root().join("data.txt");
        fs::write(&ro_file, b"payload").unwrap();

        set_me(
            &branches,
            Path::new("/data.txt"),
            &ro_file,
            &AttrChanges {
                size: Some(0),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(find_me(&branches, Path::new("/data.txt")).unwrap().is_none());
        assert_eq!(fs::read(&ro_file).unwrap(), b"payload");
    }

    #[test]
    fn test_me_file_is_zero_size() {
        let (_dir, branches) = setup();
        let stat = sample_stat(libc::S_IFREG as u32 | 0o755);
        let me = create_me(&branches, Path::new("/bin.sh"), &stat).unwrap();
        assert_eq!(fs::metadata(&me).unwrap().len(), 0);
    }
}
