//! Merged directory listings.
//!
//! A listing handle is created at opendir with the resolved branch
//! directories and populated lazily on the first read: the read-write side
//! is scanned first (collecting whiteout targets on the way), then the
//! read-only side, dropping names that are whited out or already present.
//! The stable order is all read-write entries in underlying-directory
//! order, then the surviving read-only entries. Sidecar names never
//! surface.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::union::path::{classify, strip_whiteout, NameClass};
use crate::union::stat::{name_to_ino, EntryKind};

/// One merged directory entry.
#[derive(Debug, Clone)]
pub struct MergedEntry {
    pub name: OsString,
    pub ino: u64,
    pub kind: EntryKind,
}

enum State {
    Fresh,
    Populated(Vec<MergedEntry>),
}

/// An open merged-directory handle.
///
/// Owned exclusively by its opener; populated once, on the first entries()
/// call, and iterated by index from the caller-supplied offset.
pub struct DirHandle {
    logical: PathBuf,
    ro_dir: Option<PathBuf>,
    rw_dir: Option<PathBuf>,
    state: State,
}

impl DirHandle {
    pub(crate) fn new(logical: PathBuf, ro_dir: Option<PathBuf>, rw_dir: Option<PathBuf>) -> Self {
        DirHandle {
            logical,
            ro_dir,
            rw_dir,
            state: State::Fresh,
        }
    }

    /// The merged entry list, populating it on first use.
    pub fn entries(&mut self) -> Result<&[MergedEntry]> {
        if let State::Fresh = self.state {
            let entries = self.populate()?;
            self.state = State::Populated(entries);
        }
        match &self.state {
            State::Populated(entries) => Ok(entries),
            State::Fresh => unreachable!(),
        }
    }

    fn populate(&self) -> Result<Vec<MergedEntry>> {
        let mut entries: Vec<MergedEntry> = Vec::new();
        let mut seen: HashSet<OsString> = HashSet::new();
        // Whiteout targets found on the read-write side; discarded once the
        // read-only side has been filtered against them.
        let mut whiteouts: HashSet<OsString> = HashSet::new();

        if let Some(rw_dir) = &self.rw_dir {
            for entry in fs::read_dir(rw_dir)? {
                let entry = entry?;
                let name = entry.file_name();
                match classify(&name) {
                    NameClass::Me => continue,
                    NameClass::Whiteout => {
                        // Only meaningful when there is a read-only side to
                        // hide something from.
                        if self.ro_dir.is_some() {
                            if let Some(target) = strip_whiteout(&name) {
                                whiteouts.insert(target);
                            }
                        }
                    }
                    NameClass::Normal => {
                        let kind = entry_kind(&entry);
                        let ino = name_to_ino(&self.logical.join(&name));
                        seen.insert(name.clone());
                        entries.push(MergedEntry { name, ino, kind });
                    }
                }
            }
        }

        if let Some(ro_dir) = &self.ro_dir {
            for entry in fs::read_dir(ro_dir)? {
                let entry = entry?;
                let name = entry.file_name();
                if classify(&name) != NameClass::Normal {
                    continue;
                }
                if whiteouts.contains(&name) || seen.contains(&name) {
                    continue;
                }
                let kind = entry_kind(&entry);
                let ino = name_to_ino(&self.logical.join(&name));
                entries.push(MergedEntry { name, ino, kind });
            }
        }

        Ok(entries)
    }
}

fn entry_kind(entry: &fs::DirEntry) -> EntryKind {
    match entry.file_type() {
        Ok(ft) if ft.is_file() => EntryKind::RegularFile,
        Ok(ft) if ft.is_dir() => EntryKind::Directory,
        Ok(ft) if ft.is_symlink() => EntryKind::Symlink,
        // Devices, pipes and sockets need the full mode
        _ => entry
            .metadata()
            .map(|m| EntryKind::from_mode(m.mode()))
            .unwrap_or(EntryKind::RegularFile),
    }
}

/// Emptiness over the merged view, in canonical (ro, rw) order: a directory
/// is empty iff the read-write side has no surviving entries and every
/// read-only entry is covered by a whiteout.
pub fn is_empty_dir(ro_dir: Option<&Path>, rw_dir: Option<&Path>) -> Result<bool> {
    let mut whiteouts: HashSet<OsString> = HashSet::new();

    if let Some(rw) = rw_dir {
        for entry in fs::read_dir(rw)? {
            let entry = entry?;
            let name = entry.file_name();
            match classify(&name) {
                NameClass::Me => continue,
                NameClass::Whiteout => {
                    if let Some(target) = strip_whiteout(&name) {
                        whiteouts.insert(target);
                    }
                }
                NameClass::Normal => return Ok(false),
            }
        }
    }

    if let Some(ro) = ro_dir {
        for entry in fs::read_dir(ro)? {
            let entry = entry?;
            let name = entry.file_name();
            if classify(&name) != NameClass::Normal {
                continue;
            }
            if !whiteouts.contains(&name) {
                return Ok(false);
            }
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        ro: PathBuf,
        rw: PathBuf,
    }

    fn setup() -> Fixture {
        let dir = tempdir().unwrap();
        let ro = dir.path().join("ro");
        let rw = dir.path().join("rw");
        fs::create_dir_all(&ro).unwrap();
        fs::create_dir_all(&rw).unwrap();
        Fixture { _dir: dir, ro, rw }
    }

    fn names(handle: &mut DirHandle) -> Vec<String> {
        handle
            .entries()
            .unwrap()
            .iter()
            .map(|e| e.name.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_merge_rw_before_ro() {
        let f = setup();
        fs::write(f.ro.join("x"), b"").unwrap();
        fs::write(f.ro.join("y"), b"").unwrap();
        fs::write(f.rw.join("z"), b"").unwrap();

        let mut handle = DirHandle::new(
            PathBuf::from("/"),
            Some(f.ro.clone()),
            Some(f.rw.clone()),
        );
        let listed = names(&mut handle);

        // Read-write entries first, then surviving read-only entries
        assert_eq!(listed[0], "z");
        let mut rest = listed[1..].to_vec();
        rest.sort();
        assert_eq!(rest, vec!["x", "y"]);
    }

    #[test]
    fn test_merge_dedups_shadowed_names() {
        let f = setup();
        fs::write(f.ro.join("both"), b"ro").unwrap();
        fs::write(f.rw.join("both"), b"rw").unwrap();

        let mut handle =
            DirHandle::new(PathBuf::from("/"), Some(f.ro.clone()), Some(f.rw.clone()));
        assert_eq!(names(&mut handle), vec!["both"]);
    }

    #[test]
    fn test_merge_respects_whiteouts() {
        let f = setup();
        fs::write(f.ro.join("kept"), b"").unwrap();
        fs::write(f.ro.join("gone"), b"").unwrap();
        fs::write(f.rw.join(".wh.gone"), b"").unwrap();

        let mut handle =
            DirHandle::new(PathBuf::from("/"), Some(f.ro.clone()), Some(f.rw.clone()));
        assert_eq!(names(&mut handle), vec!["kept"]);
    }

    #[test]
    fn test_merge_hides_sidecar_names() {
        let f = setup();
        fs::write(f.rw.join("visible"), b"").unwrap();
        fs::write(f.rw.join(".me.visible"), b"").unwrap();
        fs::write(f.rw.join(".wh.phantom"), b"").unwrap();
        fs::write(f.ro.join(".me.stale"), b"").unwrap();
        fs::write(f.ro.join(".wh.stale"), b"").unwrap();

        let mut handle =
            DirHandle::new(PathBuf::from("/"), Some(f.ro.clone()), Some(f.rw.clone()));
        assert_eq!(names(&mut handle), vec!["visible"]);
    }

    #[test]
    fn test_merge_rw_only_directory() {
        let f = setup();
        fs::write(f.rw.join("a"), b"").unwrap();
        // Whiteouts without a read-only side hide nothing and list nothing
        fs::write(f.rw.join(".wh.a"), b"").unwrap();

        let mut handle = DirHandle::new(PathBuf::from("/"), None, Some(f.rw.clone()));
        assert_eq!(names(&mut handle), vec!["a"]);
    }

    #[test]
    fn test_entry_inos_are_logical() {
        let f = setup();
        fs::write(f.ro.join("file"), b"").unwrap();

        let mut handle =
            DirHandle::new(PathBuf::from("/sub"), Some(f.ro.clone()), Some(f.rw.clone()));
        let entries = handle.entries().unwrap();
        assert_eq!(entries[0].ino, name_to_ino(Path::new("/sub/file")));
    }

    #[test]
    fn test_entry_kinds() {
        let f = setup();
        fs::create_dir(f.rw.join("d")).unwrap();
        fs::write(f.rw.join("f"), b"").unwrap();
        std::os::unix::fs::symlink("f", f.rw.join("l")).unwrap();

        let mut handle = DirHandle::new(PathBuf::from("/"), None, Some(f.rw.clone()));
        let entries = handle.entries().unwrap();
        let kind_of = |n: &str| {
            entries
                .iter()
                .find(|e| e.name == OsStr::new(n))
                .unwrap()
                .kind
        };
        assert_eq!(kind_of("d"), EntryKind::Directory);
        assert_eq!(kind_of("f"), EntryKind::RegularFile);
        assert_eq!(kind_of("l"), EntryKind::Symlink);
    }

    #[test]
    fn test_populate_happens_once() {
        let f = setup();
        fs::write(f.rw.join("a"), b"").unwrap();

        let mut handle = DirHandle::new(PathBuf::from("/"), None, Some(f.rw.clone()));
        assert_eq!(names(&mut handle).len(), 1);

        // Later changes are not observed by an already-populated handle
        fs::write(f.rw.join("b"), b"").unwrap();
        assert_eq!(names(&mut handle).len(), 1);
    }

    #[test]
    fn test_is_empty_dir() {
        let f = setup();
        assert!(is_empty_dir(Some(&f.ro), Some(&f.rw)).unwrap());

        fs::write(f.ro.join("x"), b"").unwrap();
        assert!(!is_empty_dir(Some(&f.ro), Some(&f.rw)).unwrap());

        // Whiteout covering the only read-only entry makes it empty again
        fs::write(f.rw.join(".wh.x"), b"").unwrap();
        assert!(is_empty_dir(Some(&f.ro), Some(&f.rw)).unwrap());

        // A surviving read-write entry keeps it non-empty
        fs::write(f.rw.join("y"), b"").unwrap();
        assert!(!is_empty_dir(Some(&f.ro), Some(&f.rw)).unwrap());
    }

    #[test]
    fn test_is_empty_dir_ignores_sidecars() {
        let f = setup();
        fs::write(f.rw.join(".me.x"), b"").unwrap();
        fs::write(f.rw.join(".wh.ghost"), b"").unwrap();
        assert!(is_empty_dir(Some(&f.ro), Some(&f.rw)).unwrap());
    }
}
