//! Mount point handling for the davfs daemon.
//!
//! Parses `-o` style option strings, validates the mountpoint and runs the
//! blocking FUSE session loop.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::config::DaemonConfig;
use crate::filesystem::DavFuse;

/// Kernel mount options understood by davfs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    /// Allow other users to access.
    pub allow_other: bool,
    /// Allow root to access.
    pub allow_root: bool,
    /// Let the kernel enforce permission bits.
    pub default_permissions: bool,
    /// Unmount when the daemon exits.
    pub auto_unmount: bool,
    /// Read-only mount.
    pub ro: bool,
}

#[derive(Debug, Error)]
pub enum MountError {
    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid option: {0}")]
    InvalidOption(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for MountError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => MountError::PermissionDenied(e.to_string()),
            _ => MountError::IoError(e.to_string()),
        }
    }
}

/// Where and how to mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
    pub mountpoint: PathBuf,
    pub options: MountOptions,
    /// Source name shown in the mount table.
    pub fsname: String,
}

impl MountConfig {
    pub fn from_daemon(config: &DaemonConfig) -> Result<Self, MountError> {
        Ok(MountConfig {
            mountpoint: config.mountpoint.clone(),
            options: parse_mount_options(&config.mount_options)?,
            fsname: config.dav.url.clone(),
        })
    }

    pub fn to_fuser(&self) -> Vec<fuser::MountOption> {
        let mut opts = options_to_fuser(&self.options);
        opts.push(fuser::MountOption::FSName(self.fsname.clone()));
        opts.push(fuser::MountOption::Subtype("davfs".to_string()));
        opts
    }
}

pub fn validate_mountpoint(path: &Path) -> Result<(), MountError> {
    if !path.exists() {
        return Err(MountError::PathNotFound(path.display().to_string()));
    }
    if !path.is_dir() {
        return Err(MountError::NotADirectory(path.display().to_string()));
    }
    Ok(())
}

/// Parse mount options from a comma-separated string.
///
/// Valid options: allow_other, allow_root, default_permissions,
/// auto_unmount, ro, rw.
pub fn parse_mount_options(opts_str: &str) -> Result<MountOptions, MountError> {
    let mut options = MountOptions::default();

    for opt in opts_str.split(',') {
        let opt = opt.trim();
        match opt {
            "allow_other" => options.allow_other = true,
            "allow_root" => options.allow_root = true,
            "default_permissions" => options.default_permissions = true,
            "auto_unmount" => options.auto_unmount = true,
            "ro" => options.ro = true,
            "rw" => options.ro = false,
            "" => {}
            _ => return Err(MountError::InvalidOption(opt.to_string())),
        }
    }

    Ok(options)
}

pub fn options_to_fuser(opts: &MountOptions) -> Vec<fuser::MountOption> {
    let mut fuser_opts = Vec::new();
    if opts.allow_other {
        fuser_opts.push(fuser::MountOption::AllowOther);
    }
    if opts.allow_root {
        fuser_opts.push(fuser::MountOption::AllowRoot);
    }
    if opts.default_permissions {
        fuser_opts.push(fuser::MountOption::DefaultPermissions);
    }
    if opts.auto_unmount {
        fuser_opts.push(fuser::MountOption::AutoUnmount);
    }
    fuser_opts.push(if opts.ro {
        fuser::MountOption::RO
    } else {
        fuser::MountOption::RW
    });
    fuser_opts
}

/// Mount `fs` and serve requests until the filesystem is unmounted.
/// Blocks the calling thread.
pub fn mount(fs: DavFuse, config: &MountConfig) -> Result<(), MountError> {
    validate_mountpoint(&config.mountpoint)?;
    info!(
        "mounting {} at {}",
        config.fsname,
        config.mountpoint.display()
    );
    fuser::mount2(fs, &config.mountpoint, &config.to_fuser())?;
    info!("{} unmounted", config.mountpoint.display());
    Ok(())
}
