use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use fuser::MountOption;

use crate::config::MountConfig;
use crate::error::{DuofsError, Result};
use crate::fuse::DuoFs;

fn mount_options() -> Vec<MountOption> {
    vec![
        MountOption::FSName("duofs".to_string()),
        MountOption::DefaultPermissions,
        MountOption::AutoUnmount,
    ]
}

fn prepare_mountpoint(mountpoint: &Path) -> Result<()> {
    fs::create_dir_all(mountpoint).map_err(|e| {
        DuofsError::Config(format!(
            "failed to create mount directory {}: {}",
            mountpoint.display(),
            e
        ))
    })
}

/// Mount the union and serve it until the filesystem is unmounted. This is
/// the foreground path the CLI uses.
pub fn mount(config: &MountConfig, mountpoint: &Path) -> Result<()> {
    prepare_mountpoint(mountpoint)?;
    let fs = DuoFs::new(config)?;

    tracing::info!(
        "mounting duofs at {} (ro={}, rw={})",
        mountpoint.display(),
        config.ro_root.display(),
        config.rw_root.display()
    );

    fuser::mount2(fs, mountpoint, &mount_options())
        .map_err(|e| DuofsError::Fuse(format!("mount failed: {}", e)))?;

    tracing::info!("duofs unmounted from {}", mountpoint.display());
    Ok(())
}

/// Mount the union on a background session and verify the mountpoint
/// actually became accessible before reporting success. The returned
/// session unmounts on drop.
pub fn spawn_mount(config: &MountConfig, mountpoint: &Path) -> Result<fuser::BackgroundSession> {
    prepare_mountpoint(mountpoint)?;
    let fs = DuoFs::new(config)?;
    let session = fuser::Session::new(fs, mountpoint, &mount_options())
        .map_err(|e| DuofsError::Fuse(format!("failed to create session: {}", e)))?;
    let session = session
        .spawn()
        .map_err(|e| DuofsError::Fuse(format!("failed to spawn session: {}", e)))?;

    // Reading the mountpoint goes through the session's worker thread, so
    // a successful read_dir proves the kernel is dispatching to us.
    let mount_timeout = Duration::from_millis(2000);
    let check_interval = Duration::from_millis(50);
    let start = Instant::now();
    loop {
        if mountpoint.is_dir() && fs::read_dir(mountpoint).is_ok() {
            tracing::debug!("mount verified accessible at {}", mountpoint.display());
            break;
        }
        if start.elapsed() >= mount_timeout {
            return Err(DuofsError::Fuse(format!(
                "mount timed out: {} not accessible after 2 seconds",
                mountpoint.display()
            )));
        }
        std::thread::sleep(check_interval);
    }

    Ok(session)
}

/// Unmount a duofs mountpoint with the platform unmount command. Returns
/// whether the command reported success.
pub fn unmount(mountpoint: &Path) -> Result<bool> {
    let status = if cfg!(target_os = "macos") {
        std::process::Command::new("diskutil")
            .args(["unmount", "force"])
            .arg(mountpoint)
            .status()
    } else {
        std::process::Command::new("umount").arg(mountpoint).status()
    };

    match status {
        Ok(status) => Ok(status.success()),
        Err(e) => {
            tracing::warn!("failed to run unmount command: {}", e);
            Ok(false)
        }
    }
}
