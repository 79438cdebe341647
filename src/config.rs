use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DuofsError, Result};

/// Default statfs `f_type` reported for the union ("duof" in ASCII).
fn default_fs_magic() -> u64 {
    0x6475_6F66
}

/// Default statfs `f_fsid` seed.
fn default_fs_seed() -> u64 {
    0x9E37_79B9_7F4A_7C15
}

fn default_ttl_secs() -> u64 {
    1
}

/// Fully resolved mount configuration.
///
/// The two branch roots are fixed at mount time and never change afterwards.
/// `fs_magic` and `fs_seed` override the `f_type` / `f_fsid` fields of the
/// statfs result, which otherwise comes from the read-only branch.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub ro_root: PathBuf,
    pub rw_root: PathBuf,
    pub fs_magic: u64,
    pub fs_seed: u64,
    pub ttl_secs: u64,
}

impl MountConfig {
    pub fn new(ro_root: PathBuf, rw_root: PathBuf) -> Self {
        MountConfig {
            ro_root,
            rw_root,
            fs_magic: default_fs_magic(),
            fs_seed: default_fs_seed(),
            ttl_secs: default_ttl_secs(),
        }
    }

    /// Apply the optional settings from a config file on top of the defaults.
    pub fn with_file(mut self, file: &FileConfig) -> Self {
        self.fs_magic = file.get_fs_magic();
        self.fs_seed = file.get_fs_seed();
        self.ttl_secs = file.get_ttl_secs();
        self
    }
}

/// Optional settings read from the TOML config file. Anything absent falls
/// back to the built-in default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_magic: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

impl FileConfig {
    pub fn get_fs_magic(&self) -> u64 {
        self.fs_magic.unwrap_or_else(default_fs_magic)
    }

    pub fn get_fs_seed(&self) -> u64 {
        self.fs_seed.unwrap_or_else(default_fs_seed)
    }

    pub fn get_ttl_secs(&self) -> u64 {
        self.ttl_secs.unwrap_or_else(default_ttl_secs)
    }
}

/// Path of the config file: `$XDG_CONFIG_HOME/duofs/config.toml`, falling
/// back to `~/.config/duofs/config.toml`.
pub fn config_path() -> Result<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return Ok(PathBuf::from(xdg).join("duofs").join("config.toml"));
        }
    }
    let home = std::env::var("HOME")
        .map_err(|_| DuofsError::Config("HOME environment variable not set".to_string()))?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("duofs")
        .join("config.toml"))
}

/// Load the config file. A missing file is not an error: defaults apply.
pub fn load_file_config(path: Option<&Path>) -> Result<FileConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_path()?,
    };

    if !path.exists() {
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(&path).map_err(|e| {
        DuofsError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;

    toml::from_str(&contents)
        .map_err(|e| DuofsError::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_when_file_is_empty() {
        let file: FileConfig = toml::from_str("").unwrap();
        assert_eq!(file.get_fs_magic(), default_fs_magic());
        assert_eq!(file.get_fs_seed(), default_fs_seed());
        assert_eq!(file.get_ttl_secs(), 1);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file: FileConfig = toml::from_str("fs_magic = 42\nttl_secs = 5\n").unwrap();
        assert_eq!(file.get_fs_magic(), 42);
        assert_eq!(file.get_fs_seed(), default_fs_seed());
        assert_eq!(file.get_ttl_secs(), 5);
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = load_file_config(Some(&dir.path().join("nope.toml"))).unwrap();
        assert!(file.fs_magic.is_none());
    }

    #[test]
    fn test_mount_config_with_file() {
        let file: FileConfig = toml::from_str("fs_seed = 7\n").unwrap();
        let config = MountConfig::new(PathBuf::from("/ro"), PathBuf::from("/rw")).with_file(&file);
        assert_eq!(config.fs_seed, 7);
        assert_eq!(config.fs_magic, default_fs_magic());
    }
}
