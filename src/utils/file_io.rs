use std::fs::create_dir_all;
use std::fs::Permissions;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use nix::unistd::chown;
use nix::unistd::Gid;
use nix::unistd::Uid;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::Error;
use crate::Result;
use crate::SyncError;
use crate::SystemError;

/// Permission bits used when neither the descriptor nor an existing
/// destination provide one
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Content and ownership fingerprint of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub uid: u32,
    pub gid: u32,
    /// Permission bits only (`mode & 0o7777`)
    pub mode: u32,
    /// Hex encoded SHA-256 of the content
    pub sha256: String,
}

/// How the staged file reached its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// Atomic rename on the same filesystem
    Renamed,
    /// Content copied over the destination; not atomic
    Copied,
}

pub fn create_parent_dir_if_not_exist(path: &Path) -> Result<()> {
    if let Some(parent_dir) = path.parent() {
        if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
            if let Err(e) = create_dir_all(parent_dir) {
                error!("Failed to create directory {:?}: {:?}", parent_dir, e);
                return Err(path_error(parent_dir, e));
            }
        }
    }
    Ok(())
}

pub(crate) fn path_error(
    path: &Path,
    source: std::io::Error,
) -> Error {
    Error::System(SystemError::PathError {
        path: path.to_path_buf(),
        source,
    })
}

pub async fn sha256_hex(path: &Path) -> Result<String> {
    let content = tokio::fs::read(path).await.map_err(|e| path_error(path, e))?;
    Ok(hex::encode(Sha256::digest(&content)))
}

/// Returns `None` when the file does not exist.
pub async fn file_stat(path: &Path) -> Result<Option<FileStat>> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(path_error(path, e)),
    };
    Ok(Some(FileStat {
        uid: meta.uid(),
        gid: meta.gid(),
        mode: meta.mode() & 0o7777,
        sha256: sha256_hex(path).await?,
    }))
}

/// Permission bits of an existing file, `None` when it does not exist
pub fn existing_mode(path: &Path) -> Result<Option<u32>> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.mode() & 0o7777)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(path_error(path, e)),
    }
}

/// Compares two files by content hash and owner/mode triple.
///
/// A missing destination is reported as different.
pub async fn is_same_config(
    staged: &Path,
    dest: &Path,
) -> Result<bool> {
    let Some(dest_stat) = file_stat(dest).await? else {
        debug!("{:?} does not exist yet", dest);
        return Ok(false);
    };
    let Some(staged_stat) = file_stat(staged).await? else {
        return Err(path_error(staged, std::io::Error::from(ErrorKind::NotFound)));
    };

    if dest_stat.uid != staged_stat.uid {
        debug!("{:?} has uid {} should be {}", dest, dest_stat.uid, staged_stat.uid);
    }
    if dest_stat.gid != staged_stat.gid {
        debug!("{:?} has gid {} should be {}", dest, dest_stat.gid, staged_stat.gid);
    }
    if dest_stat.mode != staged_stat.mode {
        debug!("{:?} has mode {:o} should be {:o}", dest, dest_stat.mode, staged_stat.mode);
    }
    if dest_stat.sha256 != staged_stat.sha256 {
        debug!("{:?} has sha256 {} should be {}", dest, dest_stat.sha256, staged_stat.sha256);
    }
    Ok(dest_stat == staged_stat)
}

pub fn set_mode(
    path: &Path,
    mode: u32,
) -> Result<()> {
    std::fs::set_permissions(path, Permissions::from_mode(mode)).map_err(|e| path_error(path, e))
}

/// Changes owner and group, a no-op when both already match.
pub fn set_owner(
    path: &Path,
    uid: u32,
    gid: u32,
) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|e| path_error(path, e))?;
    if meta.uid() == uid && meta.gid() == gid {
        return Ok(());
    }
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(|e| {
        Error::Sync(SyncError::Chown {
            path: path.to_path_buf(),
            source: e,
        })
    })
}

/// Moves `staged` over `dest`.
///
/// Uses `rename(2)`, which is atomic when both paths live on one filesystem.
/// When the rename fails with `EXDEV` or `EBUSY` (bind-mounted files, for
/// instance) the content is copied instead and mode/owner are applied
/// explicitly. The copy path is NOT atomic: readers can observe a truncated
/// destination while it runs.
pub fn replace_file(
    staged: &Path,
    dest: &Path,
    mode: u32,
    uid: u32,
    gid: u32,
) -> Result<ReplaceOutcome> {
    match std::fs::rename(staged, dest) {
        Ok(()) => Ok(ReplaceOutcome::Renamed),
        Err(e) if is_cross_device_or_busy(&e) => {
            warn!(
                "rename {:?} -> {:?} failed ({}), falling back to non-atomic copy",
                staged, dest, e
            );
            let content = std::fs::read(staged).map_err(|e| path_error(staged, e))?;
            std::fs::write(dest, content).map_err(|e| replace_error(dest, e))?;
            set_mode(dest, mode)?;
            set_owner(dest, uid, gid)?;
            if let Err(e) = std::fs::remove_file(staged) {
                warn!("cannot remove staged file {:?}: {}", staged, e);
            }
            Ok(ReplaceOutcome::Copied)
        }
        Err(e) => Err(replace_error(dest, e)),
    }
}

fn replace_error(
    dest: &Path,
    source: std::io::Error,
) -> Error {
    Error::Sync(SyncError::Replace {
        dest: dest.to_path_buf(),
        source,
    })
}

fn is_cross_device_or_busy(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == nix::libc::EXDEV || code == nix::libc::EBUSY
    )
}

/// Parses an octal permission string such as `"0644"` or `"755"`
pub fn parse_mode(s: &str) -> Result<u32> {
    let trimmed = s.trim();
    let digits = trimmed.strip_prefix("0o").unwrap_or(trimmed);
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .ok_or_else(|| Error::Template(crate::TemplateError::InvalidMode(s.to_string())))
}

pub fn file_exists(path: impl Into<PathBuf>) -> bool {
    path.into().exists()
}
