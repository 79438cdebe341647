pub mod config;
pub mod error;
pub mod fuse;
pub mod mount;
pub mod union;

pub use config::{config_path, load_file_config, FileConfig, MountConfig};
pub use error::{DuofsError, Result};
pub use fuse::DuoFs;
pub use mount::{mount, spawn_mount, unmount};
pub use union::{AttrChanges, Creds, DirHandle, EntryKind, Intent, Origin, UnionFs, UnionStat};
