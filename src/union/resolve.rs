//! Branch resolution: mapping a logical path to the concrete file that
//! backs it, with copy-up on write intent.
//!
//! Resolution order for the intents that see both branches: a whiteout
//! hides the entry outright, then the read-write branch shadows the
//! read-only branch. The single-branch intents exist for the directory
//! merger, which needs to discover each side on its own.

use std::path::{Path, PathBuf};

use crate::error::{DuofsError, Result};
use crate::union::copyup::{copy_up, CopyUp};
use crate::union::path::{lexists, Branches};
use crate::union::whiteout::has_whiteout;

/// What the caller intends to do with the resolved file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Plain resolution; read-write shadows read-only.
    Any,
    /// Only consult the read-only branch.
    MustRo,
    /// Only consult the read-write branch.
    MustRw,
    /// Resolution for writing: promote a read-only hit to the read-write
    /// branch.
    CreateCopyup,
}

/// Which branch satisfied a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    ReadOnly,
    ReadWrite,
    /// Newly created on the read-write branch by copy-up during this call.
    ReadWriteCopyup,
}

/// A successful resolution: the concrete path plus its origin tag. When the
/// resolution performed a copy-up, the record needed to revert it rides
/// along.
#[derive(Debug)]
pub struct Resolved {
    pub path: PathBuf,
    pub origin: Origin,
    pub copyup: Option<CopyUp>,
}

/// Resolve a logical path to a concrete branch file.
pub fn find_file(branches: &Branches, logical: &Path, intent: Intent) -> Result<Resolved> {
    match intent {
        Intent::MustRw => {
            let rw = branches.to_rw(logical)?;
            if lexists(&rw) {
                Ok(Resolved {
                    path: rw,
                    origin: Origin::ReadWrite,
                    copyup: None,
                })
            } else {
                Err(DuofsError::NotFound(logical.to_path_buf()))
            }
        }
        Intent::MustRo => {
            let ro = branches.to_ro(logical)?;
            if lexists(&ro) {
                Ok(Resolved {
                    path: ro,
                    origin: Origin::ReadOnly,
                    copyup: None,
                })
            } else {
                Err(DuofsError::NotFound(logical.to_path_buf()))
            }
        }
        Intent::Any | Intent::CreateCopyup => {
            // A whiteout means the entry is logically deleted, no matter
            // what the read-only branch holds.
            if has_whiteout(branches, logical) {
                return Err(DuofsError::NotFound(logical.to_path_buf()));
            }

            let rw = branches.to_rw(logical)?;
            if lexists(&rw) {
                return Ok(Resolved {
                    path: rw,
                    origin: Origin::ReadWrite,
                    copyup: None,
                });
            }

            let ro = branches.to_ro(logical)?;
            if lexists(&ro) {
                if intent == Intent::CreateCopyup {
                    let copyup = copy_up(branches, logical)?;
                    return Ok(Resolved {
                        path: copyup.rw_path.clone(),
                        origin: Origin::ReadWriteCopyup,
                        copyup: Some(copyup),
                    });
                }
                return Ok(Resolved {
                    path: ro,
                    origin: Origin::ReadOnly,
                    copyup: None,
                });
            }

            Err(DuofsError::NotFound(logical.to_path_buf()))
        }
    }
}
