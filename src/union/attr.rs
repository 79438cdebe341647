//! Attribute engine: visible attributes and the setattr state machine.
//!
//! Reads merge the resolved file's stat with its ME sidecar when the file
//! still lives on the read-only branch. Writes route by origin: read-write
//! files are updated in place, read-only files deport the change into an
//! ME sidecar. A size change is the exception: truncation is a data edit,
//! so it forces a copy-up and is applied to the new read-write file.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::stat::{utimensat, UtimensatFlags};
use nix::sys::time::TimeSpec;

use crate::error::{DuofsError, Result};
use crate::union::meta;
use crate::union::path::Branches;
use crate::union::resolve::{find_file, Intent, Origin, Resolved};
use crate::union::stat::{clear_mode_flags, AttrChanges, UnionStat};

/// The identity an operation runs as, as reported by the host.
#[derive(Debug, Clone, Copy)]
pub struct Creds {
    pub uid: u32,
    pub gid: u32,
}

/// Visible attributes of a logical path: the resolved file's stat, overlaid
/// with its ME sidecar when the origin is the read-only branch.
pub fn getattr(branches: &Branches, logical: &Path) -> Result<UnionStat> {
    let resolved = find_file(branches, logical, Intent::Any)?;
    stat_resolved(branches, logical, &resolved)
}

pub(crate) fn stat_resolved(
    branches: &Branches,
    logical: &Path,
    resolved: &Resolved,
) -> Result<UnionStat> {
    let meta = fs::symlink_metadata(&resolved.path)?;
    let stat = UnionStat::from_metadata(&meta);
    if resolved.origin == Origin::ReadOnly {
        if let Some((_, me)) = meta::find_me(branches, logical)? {
            return Ok(meta::merge_attr(&stat, &me));
        }
    }
    Ok(stat)
}

/// Apply an attribute change to a logical path and return the new visible
/// attributes.
pub fn setattr(branches: &Branches, logical: &Path, changes: &AttrChanges) -> Result<UnionStat> {
    let intent = if changes.size.is_some() {
        Intent::CreateCopyup
    } else {
        Intent::Any
    };
    let resolved = find_file(branches, logical, intent)?;

    match resolved.origin {
        Origin::ReadWrite | Origin::ReadWriteCopyup => {
            apply_changes(&resolved.path, changes)?;
        }
        Origin::ReadOnly => {
            meta::set_me(branches, logical, &resolved.path, changes)?;
        }
    }
    getattr(branches, logical)
}

/// Apply changes directly to a concrete read-write file.
pub(crate) fn apply_changes(path: &Path, changes: &AttrChanges) -> Result<()> {
    if let Some(size) = changes.size {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(size)?;
    }
    if let Some(mode) = changes.mode {
        set_mode(path, clear_mode_flags(mode))?;
    }
    if changes.uid.is_some() || changes.gid.is_some() {
        set_owner(path, changes.uid, changes.gid)?;
    }
    if changes.atime.is_some() || changes.mtime.is_some() {
        let current = UnionStat::from_metadata(&fs::symlink_metadata(path)?);
        set_times(
            path,
            changes.atime.unwrap_or(current.atime),
            changes.mtime.unwrap_or(current.mtime),
        )?;
    }
    Ok(())
}

pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

pub(crate) fn set_owner(path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    std::os::unix::fs::lchown(path, uid, gid)?;
    Ok(())
}

pub(crate) fn set_times(path: &Path, atime: SystemTime, mtime: SystemTime) -> Result<()> {
    utimensat(
        None,
        path,
        &to_timespec(atime),
        &to_timespec(mtime),
        UtimensatFlags::NoFollowSymlink,
    )?;
    Ok(())
}

fn to_timespec(t: SystemTime) -> TimeSpec {
    TimeSpec::from(t.duration_since(UNIX_EPOCH).unwrap_or_default())
}

/// POSIX class check of an access mask against merged attributes. Root
/// bypasses everything except execute, which still needs at least one x bit
/// on non-directories.
pub fn can_access(logical: &Path, stat: &UnionStat, creds: &Creds, mask: i32) -> Result<()> {
    let mask = mask & (libc::R_OK | libc::W_OK | libc::X_OK);
    if mask == 0 {
        return Ok(());
    }

    if creds.uid == 0 {
        if mask & libc::X_OK != 0 && !stat.is_dir() && stat.mode & 0o111 == 0 {
            return Err(DuofsError::PermissionDenied(logical.to_path_buf()));
        }
        return Ok(());
    }

    let shift = if creds.uid == stat.uid {
        6
    } else if creds.gid == stat.gid {
        3
    } else {
        0
    };
    let perms = (stat.mode >> shift) & 0o7;

    let mut need = 0;
    if mask & libc::R_OK != 0 {
        need |= 0o4;
    }
    if mask & libc::W_OK != 0 {
        need |= 0o2;
    }
    if mask & libc::X_OK != 0 {
        need |= 0o1;
    }

    if perms & need == need {
        Ok(())
    } else {
        Err(DuofsError::PermissionDenied(logical.to_path_buf()))
    }
}

/// Whether the caller may create an entry at the target: write + search on
/// the parent's merged attributes.
pub fn can_create(branches: &Branches, logical: &Path, creds: &Creds) -> Result<()> {
    let parent = logical
        .parent()
        .ok_or_else(|| DuofsError::InvalidPath(logical.to_path_buf()))?;
    let stat = getattr(branches, parent)?;
    can_access(parent, &stat, creds, libc::W_OK | libc::X_OK)
}

/// Whether the caller may remove the target. Success means permission
/// granted. The root has no parent, so it is gated on its own attributes.
pub fn can_remove(branches: &Branches, logical: &Path, creds: &Creds) -> Result<()> {
    if logical.parent().is_none() {
        let stat = getattr(branches, logical)?;
        return can_access(logical, &stat, creds, libc::W_OK | libc::X_OK);
    }
    can_create(branches, logical, creds)
}
