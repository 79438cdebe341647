//! Copy-up: promotion of a read-only entry onto the read-write branch.
//!
//! Copy-up materialises the data first and the metadata second, and only
//! deletes a consumed ME sidecar once the metadata has been applied to the
//! new file. Any failure after the read-write file has been created unlinks
//! the partial file; the sidecar is never deleted before the commit point.

use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::{mknod, Mode, SFlag};
use nix::unistd::mkfifo;

use crate::error::{DuofsError, Result};
use crate::union::attr::{set_mode, set_owner, set_times};
use crate::union::meta;
use crate::union::path::Branches;
use crate::union::stat::{clear_mode_flags, EntryKind, UnionStat};

/// Outcome of a successful copy-up. The consumed ME stat is kept so a
/// failed follow-up step can revert the promotion.
#[derive(Debug)]
pub struct CopyUp {
    pub rw_path: PathBuf,
    pub consumed_me: Option<UnionStat>,
}

/// Promote a read-only entry onto the read-write branch: data plus the
/// merged metadata, consuming any ME sidecar.
pub fn copy_up(branches: &Branches, logical: &Path) -> Result<CopyUp> {
    let ro_path = branches.to_ro(logical)?;
    let ro_meta = match fs::symlink_metadata(&ro_path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(DuofsError::NotFound(logical.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    let ro_stat = UnionStat::from_metadata(&ro_meta);

    find_path(branches, logical)?;
    let rw_path = branches.to_rw(logical)?;

    if ro_stat.is_dir() {
        // Directories materialise through the same path the parent-chain
        // walker uses; the ME is consumed there.
        materialize_dir(branches, logical)?;
        return Ok(CopyUp {
            rw_path,
            consumed_me: None,
        });
    }

    let me = meta::find_me(branches, logical)?;

    tracing::debug!(
        "copy_up: {} -> {} (me={})",
        ro_path.display(),
        rw_path.display(),
        me.is_some()
    );

    match ro_stat.kind() {
        EntryKind::RegularFile => {
            let mut src = fs::File::open(&ro_path)?;
            let mut dst = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(clear_mode_flags(ro_stat.mode))
                .open(&rw_path)?;
            if let Err(e) = io::copy(&mut src, &mut dst) {
                drop(dst);
                let _ = fs::remove_file(&rw_path);
                return Err(e.into());
            }
        }
        EntryKind::Symlink => {
            let target = fs::read_link(&ro_path)?;
            std::os::unix::fs::symlink(&target, &rw_path)?;
        }
        EntryKind::NamedPipe => {
            mkfifo(
                &rw_path,
                Mode::from_bits_truncate(clear_mode_flags(ro_stat.mode) as libc::mode_t),
            )?;
        }
        EntryKind::CharDevice | EntryKind::BlockDevice => {
            let kind = if ro_stat.kind() == EntryKind::CharDevice {
                SFlag::S_IFCHR
            } else {
                SFlag::S_IFBLK
            };
            mknod(
                &rw_path,
                kind,
                Mode::from_bits_truncate(clear_mode_flags(ro_stat.mode) as libc::mode_t),
                ro_stat.rdev as libc::dev_t,
            )?;
        }
        EntryKind::Socket | EntryKind::Directory => {
            return Err(DuofsError::Io(io::Error::from_raw_os_error(
                libc::ENOTSUP,
            )));
        }
    }

    let final_stat = me
        .as_ref()
        .map(|(_, m)| meta::merge_attr(&ro_stat, m))
        .unwrap_or(ro_stat);
    if let Err(e) = apply_promoted_metadata(&rw_path, &final_stat) {
        let _ = fs::remove_file(&rw_path);
        return Err(e);
    }

    // Commit point: the metadata is on the new file, the sidecar goes away.
    if let Some((me_path, _)) = &me {
        if let Err(e) = fs::remove_file(me_path) {
            let _ = fs::remove_file(&rw_path);
            return Err(e.into());
        }
    }

    Ok(CopyUp {
        rw_path,
        consumed_me: me.map(|(_, stat)| stat),
    })
}

/// Undo a copy-up whose follow-up step failed: unlink the promoted file and
/// restore the sidecar it consumed. Best-effort; failures are logged.
pub fn revert_copy_up(branches: &Branches, logical: &Path, copyup: &CopyUp) {
    if let Err(e) = fs::remove_file(&copyup.rw_path) {
        tracing::warn!(
            "failed to revert copy-up of {}: {}",
            copyup.rw_path.display(),
            e
        );
    }
    if let Some(me_stat) = &copyup.consumed_me {
        if let Err(e) = meta::create_me(branches, logical, me_stat) {
            tracing::warn!(
                "failed to restore metadata sidecar for {}: {}",
                logical.display(),
                e
            );
        }
    }
}

/// Parent-chain materialiser: walk the ancestors of a logical path and
/// create every missing read-write directory. A directory that exists on
/// the read-only branch is created with its (ME-merged) attributes; others
/// are created fresh.
pub fn find_path(branches: &Branches, logical: &Path) -> Result<()> {
    let parent = match logical.parent() {
        Some(p) => p,
        None => return Ok(()),
    };
    let suffix = parent
        .strip_prefix("/")
        .map_err(|_| DuofsError::InvalidPath(logical.to_path_buf()))?;

    let mut current = PathBuf::from("/");
    for component in suffix.components() {
        current.push(component);
        materialize_dir(branches, &current)?;
    }
    Ok(())
}

fn materialize_dir(branches: &Branches, logical: &Path) -> Result<()> {
    let rw = branches.to_rw(logical)?;
    match fs::symlink_metadata(&rw) {
        Ok(m) if m.is_dir() => return Ok(()),
        Ok(_) => {
            return Err(DuofsError::Io(io::Error::from_raw_os_error(
                libc::ENOTDIR,
            )))
        }
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
        Err(_) => {}
    }

    let ro = branches.to_ro(logical)?;
    match fs::symlink_metadata(&ro) {
        Ok(ro_meta) if ro_meta.is_dir() => {
            let ro_stat = UnionStat::from_metadata(&ro_meta);
            let me = meta::find_me(branches, logical)?;
            let final_stat = me
                .as_ref()
                .map(|(_, m)| meta::merge_attr(&ro_stat, m))
                .unwrap_or(ro_stat);

            create_dir_racy(&rw)?;
            apply_promoted_metadata(&rw, &final_stat)?;

            // The directory now lives on the read-write branch; a leftover
            // sidecar would violate the one-authority rule.
            if let Some((me_path, _)) = me {
                if let Err(e) = fs::remove_file(&me_path) {
                    tracing::warn!(
                        "failed to remove consumed sidecar {}: {}",
                        me_path.display(),
                        e
                    );
                }
            }
        }
        _ => {
            create_dir_racy(&rw)?;
        }
    }
    Ok(())
}

fn create_dir_racy(path: &Path) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        // Concurrent materialisation of the same chain
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn apply_promoted_metadata(path: &Path, stat: &UnionStat) -> Result<()> {
    if !stat.is_symlink() {
        set_mode(path, clear_mode_flags(stat.mode))?;
    }
    // Preserving foreign ownership needs root; keep going without it.
    if let Err(e) = set_owner(path, Some(stat.uid), Some(stat.gid)) {
        tracing::warn!("failed to set owner on {}: {}", path.display(), e);
    }
    set_times(path, stat.atime, stat.mtime)?;
    Ok(())
}
