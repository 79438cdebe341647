//! Whiteout markers: deletions of read-only entries, recorded on the
//! read-write branch.
//!
//! A whiteout for a file named `foo` is an empty file named `.wh.foo` in the
//! same directory on the read-write branch. Its contents are irrelevant;
//! existence is the signal. A whiteout is only ever created for a name that
//! exists on the read-only branch; purely read-write entries are simply
//! unlinked.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::union::copyup::find_path;
use crate::union::path::{classify, Branches, NameClass, SpecialKind};

/// Whether a whiteout marker hides this logical path. The root cannot be
/// whited out.
pub fn has_whiteout(branches: &Branches, logical: &Path) -> bool {
    if logical.parent().is_none() {
        return false;
    }
    match branches.to_special(logical, SpecialKind::Whiteout) {
        Ok(path) => path.exists(),
        Err(_) => false,
    }
}

/// Materialise the whiteout marker for a logical path, creating the
/// read-write parent directory chain as needed. Returns the marker path so
/// callers can roll it back.
pub fn create_whiteout(branches: &Branches, logical: &Path) -> Result<PathBuf> {
    let marker = branches.to_special(logical, SpecialKind::Whiteout)?;
    find_path(branches, logical)?;
    File::create(&marker)?;
    Ok(marker)
}

/// Remove the whiteout for a logical path if one exists. Idempotent:
/// removing an absent whiteout succeeds silently. Invoked by any operation
/// that re-creates a logically deleted name.
pub fn unlink_whiteout(branches: &Branches, logical: &Path) -> Result<()> {
    if logical.parent().is_none() {
        return Ok(());
    }
    let marker = branches.to_special(logical, SpecialKind::Whiteout)?;
    match fs::remove_file(&marker) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whiteout every read-only entry under a directory that is being replaced.
///
/// When a fresh directory is created over a whited-out read-only directory,
/// the stale read-only contents would otherwise reappear in the merged
/// listing once the directory's own whiteout is removed.
pub fn hide_dir_contents(branches: &Branches, logical: &Path) -> Result<()> {
    let ro_dir = branches.to_ro(logical)?;
    let meta = match fs::symlink_metadata(&ro_dir) {
        Ok(m) => m,
        Err(_) => return Ok(()),
    };
    if !meta.is_dir() {
        return Ok(());
    }

    for entry in fs::read_dir(&ro_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if classify(&name) != NameClass::Normal {
            continue;
        }
        create_whiteout(branches, &logical.join(&name))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::union::path::Branches;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Branches) {
        let dir = tempdir().unwrap();
        let ro = dir.path().join("ro");
        let rw = dir.path().join("rw");
        fs::create_dir_all(&ro).unwrap();
        fs::create_dir_all(&rw).unwrap();
        let branches = Branches::new(ro, rw).unwrap();
        (dir, branches)
    }

    #[test]
    fn test_create_and_detect_whiteout() {
        let (_dir, branches) = setup();
        let logical = Path::new("/deleted.txt");

        assert!(!has_whiteout(&branches, logical));
        let marker = create_whiteout(&branches, logical).unwrap();
        assert!(marker.ends_with(".wh.deleted.txt"));
        assert!(marker.exists());
        assert!(has_whiteout(&branches, logical));
    }

    #[test]
    fn test_create_whiteout_builds_parent_chain() {
        let (_dir, branches) = setup();
        let logical = Path::new("/a/b/c.txt");
        let marker = create_whiteout(&branches, logical).unwrap();
        assert!(marker.exists());
        assert!(branches.to_rw(Path::new("/a/b")).unwrap().is_dir());
    }

    #[test]
    fn test_unlink_whiteout_is_idempotent() {
        let (_dir, branches) = setup();
        let logical = Path::new("/gone.txt");

        // Absent: silently succeeds
        unlink_whiteout(&branches, logical).unwrap();

        create_whiteout(&branches, logical).unwrap();
        unlink_whiteout(&branches, logical).unwrap();
        assert!(!has_whiteout(&branches, logical));
        unlink_whiteout(&branches, logical).unwrap();
    }

    #[test]
    fn test_root_has_no_whiteout() {
        let (_dir, branches) = setup();
        assert!(!has_whiteout(&branches, Path::new("/")));
        unlink_whiteout(&branches, Path::new("/")).unwrap();
    }

    #[test]
    fn test_hide_dir_contents_whiteouts_ro_entries() {
        let (_dir, branches) = setup();
        let ro_sub = branches.ro_root().join("sub");
        fs::create_dir_all(&ro_sub).unwrap();
        fs::write(ro_sub.join("x"), b"x").unwrap();
        fs::write(ro_sub.join("y"), b"y").unwrap();
        // Sidecar-looking names on the RO branch are not re-hidden
        fs::write(ro_sub.join(".wh.stale"), b"").unwrap();

        hide_dir_contents(&branches, Path::new("/sub")).unwrap();

        assert!(has_whiteout(&branches, Path::new("/sub/x")));
        assert!(has_whiteout(&branches, Path::new("/sub/y")));
        assert!(!branches
            .to_rw(Path::new("/sub"))
            .unwrap()
            .join(".wh..wh.stale")
            .exists());
    }

    #[test]
    fn test_hide_dir_contents_no_ro_dir_is_noop() {
        let (_dir, branches) = setup();
        hide_dir_contents(&branches, Path::new("/missing")).unwrap();
    }
}
