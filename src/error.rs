use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DuofsError>;

#[derive(Error, Debug)]
pub enum DuofsError {
    #[error("no such entry: {0}")]
    NotFound(PathBuf),

    #[error("entry already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("derived path too long: {0}")]
    NameTooLong(PathBuf),

    #[error("invalid path: {0}")]
    InvalidPath(PathBuf),

    #[error("directory not empty: {0}")]
    NotEmpty(PathBuf),

    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("out of memory")]
    OutOfMemory,

    #[error("operation straddles branches: {0}")]
    CrossBranch(PathBuf),

    #[error("config error: {0}")]
    Config(String),

    #[error("FUSE error: {0}")]
    Fuse(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DuofsError {
    /// Map to the libc error code reported at the FUSE boundary.
    pub fn errno(&self) -> i32 {
        match self {
            DuofsError::NotFound(_) => libc::ENOENT,
            DuofsError::AlreadyExists(_) => libc::EEXIST,
            DuofsError::NameTooLong(_) => libc::ENAMETOOLONG,
            DuofsError::InvalidPath(_) => libc::EINVAL,
            DuofsError::NotEmpty(_) => libc::ENOTEMPTY,
            DuofsError::PermissionDenied(_) => libc::EACCES,
            DuofsError::OutOfMemory => libc::ENOMEM,
            DuofsError::CrossBranch(_) => libc::EXDEV,
            DuofsError::Config(_) => libc::EIO,
            DuofsError::Fuse(_) => libc::EIO,
            DuofsError::Io(e) => io_error_to_errno(e),
        }
    }
}

impl From<nix::errno::Errno> for DuofsError {
    fn from(errno: nix::errno::Errno) -> Self {
        DuofsError::Io(io::Error::from_raw_os_error(errno as i32))
    }
}

/// Map std::io::Error to the appropriate libc error code.
/// This provides more specific error codes than generic EIO for better debugging.
pub(crate) fn io_error_to_errno(e: &io::Error) -> i32 {
    // The raw OS error code is the most accurate when available
    if let Some(code) = e.raw_os_error() {
        return code;
    }

    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::WriteZero => libc::ENOSPC,
        io::ErrorKind::OutOfMemory => libc::ENOMEM,
        io::ErrorKind::BrokenPipe => libc::EPIPE,
        io::ErrorKind::WouldBlock => libc::EAGAIN,
        io::ErrorKind::UnexpectedEof => libc::EIO,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        _ => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_errno_mapping() {
        let p = Path::new("/a/b").to_path_buf();
        assert_eq!(DuofsError::NotFound(p.clone()).errno(), libc::ENOENT);
        assert_eq!(DuofsError::AlreadyExists(p.clone()).errno(), libc::EEXIST);
        assert_eq!(
            DuofsError::NameTooLong(p.clone()).errno(),
            libc::ENAMETOOLONG
        );
        assert_eq!(DuofsError::InvalidPath(p.clone()).errno(), libc::EINVAL);
        assert_eq!(DuofsError::NotEmpty(p.clone()).errno(), libc::ENOTEMPTY);
        assert_eq!(
            DuofsError::PermissionDenied(p.clone()).errno(),
            libc::EACCES
        );
        assert_eq!(DuofsError::CrossBranch(p).errno(), libc::EXDEV);
        assert_eq!(DuofsError::OutOfMemory.errno(), libc::ENOMEM);
    }

    #[test]
    fn test_io_error_prefers_raw_os_error() {
        let e = io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(io_error_to_errno(&e), libc::ENOSPC);
    }

    #[test]
    fn test_io_error_kind_fallback() {
        let e = io::Error::new(io::ErrorKind::NotFound, "synthetic");
        assert_eq!(io_error_to_errno(&e), libc::ENOENT);
        let e = io::Error::new(io::ErrorKind::Other, "synthetic");
        assert_eq!(io_error_to_errno(&e), libc::EIO);
    }
}
