//! Path mapping between the logical union namespace and the two branches.
//!
//! A logical path is absolute and normalised (`/a/b.txt`). Mapping it onto a
//! branch is plain prefix concatenation; the sidecar paths for a name are
//! built in the same directory on the read-write branch:
//!
//! - whiteout for `/a/b` -> `<rw_root>/a/.wh.b`
//! - deported metadata for `/a/b` -> `<rw_root>/a/.me.b`
//!
//! Names carrying either sidecar prefix are reserved: they never surface in
//! listings and user attempts to create them are refused.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use crate::error::{DuofsError, Result};

/// Prefix of whiteout marker files on the read-write branch.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Prefix of deported-metadata sidecar files on the read-write branch.
pub const ME_PREFIX: &str = ".me.";

/// Which sidecar a special path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    Me,
    Whiteout,
}

/// Classification of a directory-entry basename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameClass {
    Normal,
    Me,
    Whiteout,
}

/// Classify a basename by its reserved prefix.
pub fn classify(name: &OsStr) -> NameClass {
    let bytes = name.as_bytes();
    if bytes.starts_with(ME_PREFIX.as_bytes()) {
        NameClass::Me
    } else if bytes.starts_with(WHITEOUT_PREFIX.as_bytes()) {
        NameClass::Whiteout
    } else {
        NameClass::Normal
    }
}

/// Whether the basename of a logical path is reserved for sidecar use.
pub fn is_reserved(logical: &Path) -> bool {
    logical
        .file_name()
        .is_some_and(|name| classify(name) != NameClass::Normal)
}

/// Build the marker name for a target basename: `.wh.<name>` or `.me.<name>`.
pub fn marker_name(kind: SpecialKind, name: &OsStr) -> OsString {
    let mut marker = OsString::from(match kind {
        SpecialKind::Me => ME_PREFIX,
        SpecialKind::Whiteout => WHITEOUT_PREFIX,
    });
    marker.push(name);
    marker
}

/// Extract the hidden basename from a whiteout marker name.
pub fn strip_whiteout(marker: &OsStr) -> Option<OsString> {
    let bytes = marker.as_bytes();
    let prefix = WHITEOUT_PREFIX.as_bytes();
    if bytes.starts_with(prefix) {
        Some(OsString::from(OsStr::from_bytes(&bytes[prefix.len()..])))
    } else {
        None
    }
}

/// Normalise a logical path: absolute, no `.` / `..`, single separators.
pub fn normalize(logical: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::from("/");
    let mut components = logical.components();
    match components.next() {
        Some(Component::RootDir) => {}
        _ => return Err(DuofsError::InvalidPath(logical.to_path_buf())),
    }
    for component in components {
        match component {
            Component::Normal(name) => out.push(name),
            Component::CurDir => {}
            _ => return Err(DuofsError::InvalidPath(logical.to_path_buf())),
        }
    }
    Ok(out)
}

/// lstat-style existence probe: a dangling symlink still exists.
pub(crate) fn lexists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// The two immutable branch roots, fixed at mount time.
///
/// Invariant: neither root is a prefix of the other, so a concrete path
/// unambiguously belongs to one branch.
#[derive(Debug, Clone)]
pub struct Branches {
    ro_root: PathBuf,
    rw_root: PathBuf,
}

impl Branches {
    pub fn new(ro_root: PathBuf, rw_root: PathBuf) -> Result<Self> {
        if ro_root.starts_with(&rw_root) || rw_root.starts_with(&ro_root) {
            return Err(DuofsError::Config(format!(
                "branch roots must not nest: {} / {}",
                ro_root.display(),
                rw_root.display()
            )));
        }
        Ok(Branches { ro_root, rw_root })
    }

    pub fn ro_root(&self) -> &Path {
        &self.ro_root
    }

    pub fn rw_root(&self) -> &Path {
        &self.rw_root
    }

    /// Concrete path of a logical path on the read-only branch.
    pub fn to_ro(&self, logical: &Path) -> Result<PathBuf> {
        self.join(&self.ro_root, logical)
    }

    /// Concrete path of a logical path on the read-write branch.
    pub fn to_rw(&self, logical: &Path) -> Result<PathBuf> {
        self.join(&self.rw_root, logical)
    }

    /// Sidecar path for a logical path: the `.wh.` or `.me.` marker in the
    /// same directory on the read-write branch.
    ///
    /// The root has no parent directory and no basename, so it cannot carry
    /// a sidecar.
    pub fn to_special(&self, logical: &Path, kind: SpecialKind) -> Result<PathBuf> {
        let name = logical
            .file_name()
            .ok_or_else(|| DuofsError::InvalidPath(logical.to_path_buf()))?;
        let parent = logical
            .parent()
            .ok_or_else(|| DuofsError::InvalidPath(logical.to_path_buf()))?;
        let mut path = self.join(&self.rw_root, parent)?;
        path.push(marker_name(kind, name));
        check_length(logical, &path)?;
        Ok(path)
    }

    fn join(&self, root: &Path, logical: &Path) -> Result<PathBuf> {
        let suffix = logical
            .strip_prefix("/")
            .map_err(|_| DuofsError::InvalidPath(logical.to_path_buf()))?;
        let path = root.join(suffix);
        check_length(logical, &path)?;
        Ok(path)
    }
}

fn check_length(logical: &Path, concrete: &Path) -> Result<()> {
    if concrete.as_os_str().len() >= libc::PATH_MAX as usize {
        return Err(DuofsError::NameTooLong(logical.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branches() -> Branches {
        Branches::new(PathBuf::from("/ro"), PathBuf::from("/rw")).unwrap()
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(OsStr::new("foo")), NameClass::Normal);
        assert_eq!(classify(OsStr::new(".hidden")), NameClass::Normal);
        assert_eq!(classify(OsStr::new("wh.foo")), NameClass::Normal);
        assert_eq!(classify(OsStr::new(".wh.foo")), NameClass::Whiteout);
        assert_eq!(classify(OsStr::new(".me.foo")), NameClass::Me);
        assert_eq!(classify(OsStr::new(".wh.")), NameClass::Whiteout);
    }

    #[test]
    fn test_is_reserved() {
        assert!(is_reserved(Path::new("/a/.wh.b")));
        assert!(is_reserved(Path::new("/a/.me.b")));
        assert!(!is_reserved(Path::new("/a/b")));
        assert!(!is_reserved(Path::new("/")));
    }

    #[test]
    fn test_marker_and_strip_roundtrip() {
        let marker = marker_name(SpecialKind::Whiteout, OsStr::new("bar.txt"));
        assert_eq!(marker, OsString::from(".wh.bar.txt"));
        assert_eq!(
            strip_whiteout(&marker),
            Some(OsString::from("bar.txt"))
        );
        assert_eq!(strip_whiteout(OsStr::new("bar.txt")), None);
    }

    #[test]
    fn test_branch_mapping() {
        let branches = branches();
        assert_eq!(
            branches.to_ro(Path::new("/a/b.txt")).unwrap(),
            PathBuf::from("/ro/a/b.txt")
        );
        assert_eq!(
            branches.to_rw(Path::new("/a/b.txt")).unwrap(),
            PathBuf::from("/rw/a/b.txt")
        );
        assert_eq!(branches.to_rw(Path::new("/")).unwrap(), PathBuf::from("/rw"));
    }

    #[test]
    fn test_to_special() {
        let branches = branches();
        assert_eq!(
            branches
                .to_special(Path::new("/a/b.txt"), SpecialKind::Whiteout)
                .unwrap(),
            PathBuf::from("/rw/a/.wh.b.txt")
        );
        assert_eq!(
            branches
                .to_special(Path::new("/top"), SpecialKind::Me)
                .unwrap(),
            PathBuf::from("/rw/.me.top")
        );
        assert!(branches.to_special(Path::new("/"), SpecialKind::Me).is_err());
    }

    #[test]
    fn test_nested_roots_rejected() {
        assert!(Branches::new(PathBuf::from("/data"), PathBuf::from("/data/rw")).is_err());
        assert!(Branches::new(PathBuf::from("/data/ro"), PathBuf::from("/data")).is_err());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize(Path::new("/a//b/./c")).unwrap(),
            PathBuf::from("/a/b/c")
        );
        assert_eq!(normalize(Path::new("/")).unwrap(), PathBuf::from("/"));
        assert!(normalize(Path::new("a/b")).is_err());
        assert!(normalize(Path::new("/a/../b")).is_err());
    }

    #[test]
    fn test_name_too_long() {
        let branches = branches();
        let long = format!("/{}", "x".repeat(libc::PATH_MAX as usize));
        assert!(matches!(
            branches.to_rw(Path::new(&long)),
            Err(DuofsError::NameTooLong(_))
        ));
    }
}
