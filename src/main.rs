use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod config;
mod error;
mod fuse;
mod mount;
mod union;

use config::{config_path, load_file_config, MountConfig};

#[derive(Parser, Debug)]
#[command(name = "duofs")]
#[command(
    about = "Two-branch union filesystem: a writable branch overlaid on a read-only branch"
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Mount a union of a read-only and a read-write branch")]
    Mount {
        #[arg(help = "Read-only branch root")]
        ro_root: PathBuf,

        #[arg(help = "Read-write branch root (created if missing)")]
        rw_root: PathBuf,

        #[arg(help = "Directory to mount the union at")]
        mountpoint: PathBuf,

        #[arg(long, help = "Path to a config file (default: XDG config dir)")]
        config: Option<PathBuf>,

        #[arg(long, help = "Attribute/entry cache TTL in seconds")]
        ttl: Option<u64>,

        #[arg(long, help = "Serve on the calling thread instead of a background session")]
        foreground: bool,
    },
    #[command(about = "Manage configuration")]
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    #[command(about = "Show current configuration values")]
    Show,
    #[command(about = "Show config file path")]
    Path,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("DUOFS_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> error::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Mount {
            ro_root,
            rw_root,
            mountpoint,
            config,
            ttl,
            foreground,
        } => {
            let file = load_file_config(config.as_deref())?;
            let mut mount_config = MountConfig::new(ro_root, rw_root).with_file(&file);
            if let Some(ttl) = ttl {
                mount_config.ttl_secs = ttl;
            }
            if foreground {
                mount::mount(&mount_config, &mountpoint)
            } else {
                let session = mount::spawn_mount(&mount_config, &mountpoint)?;
                tracing::info!("serving duofs at {}", mountpoint.display());
                // Hold the session until the filesystem is unmounted
                session.join();
                Ok(())
            }
        }
        Commands::Config { action } => {
            let path = config_path()?;
            match action.unwrap_or(ConfigAction::Show) {
                ConfigAction::Path => println!("{}", path.display()),
                ConfigAction::Show => {
                    let file = load_file_config(None)?;
                    println!("config file: {}", path.display());
                    println!("fs_magic = {:#x}", file.get_fs_magic());
                    println!("fs_seed = {:#x}", file.get_fs_seed());
                    println!("ttl_secs = {}", file.get_ttl_secs());
                }
            }
            Ok(())
        }
    }
}
