//! `local` backend: volumes are host directories.
//!
//! The volume's `path` parameter names the source directory. Staging only
//! ensures the directories exist; publishing makes the source visible at the
//! target either through a bind mount or, for development hosts without
//! mount privileges, through a marker file.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{BackendFactory, StorageBackend};
use crate::error::BackendError;
use crate::types::{BackendCapabilities, Parameters, Volume};

/// Name the backend registers under.
pub const LOCAL_BACKEND: &str = "local";
/// Required creation parameter: absolute source directory.
pub const PARAM_PATH: &str = "path";
/// Marker written into the target by [`MountMode::Marker`].
pub const MOUNT_MARKER: &str = ".volume-mount";

/// How `publish` exposes the source directory at the target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MountMode {
    /// `mount --bind`, with a read-only remount when requested.
    #[default]
    Bind,
    /// Write a marker file describing the mount instead of mounting.
    Marker,
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bind => "bind",
            Self::Marker => "marker",
        })
    }
}

impl FromStr for MountMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bind" => Ok(Self::Bind),
            "marker" => Ok(Self::Marker),
            other => Err(format!("unknown mount mode {other:?} (expected bind or marker)")),
        }
    }
}

/// Host-directory backend.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend {
    mode: MountMode,
}

impl LocalBackend {
    pub fn new(mode: MountMode) -> Self {
        Self { mode }
    }

    /// Factory suitable for [`BackendRegistry::register`](super::BackendRegistry::register).
    pub fn factory(mode: MountMode) -> BackendFactory {
        Box::new(move || Ok(Arc::new(Self::new(mode)) as Arc<dyn StorageBackend>))
    }

    fn source_path(volume: &Volume) -> Result<&Path, BackendError> {
        volume
            .parameters
            .get(PARAM_PATH)
            .map(Path::new)
            .ok_or_else(|| BackendError::invalid(PARAM_PATH, "parameter is required"))
    }
}

async fn ensure_dir(op: &'static str, path: &Path) -> Result<(), BackendError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| BackendError::operation(op, path, e))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MountState {
    read_only: bool,
}

/// The topmost mount at `path` according to `/proc/self/mounts`, if any.
///
/// Mount paths containing whitespace are escaped in that file and will not
/// match.
async fn mount_state(path: &Path) -> Option<MountState> {
    let contents = tokio::fs::read_to_string("/proc/self/mounts").await.ok()?;
    let resolved = tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf());
    let wanted = resolved.to_str()?;
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let mount_point = fields.nth(1)?;
            let options = fields.nth(1)?;
            (mount_point == wanted).then_some(options)
        })
        .last()
        .map(|options| MountState {
            read_only: options.split(',').any(|opt| opt == "ro"),
        })
}

#[cfg(target_os = "linux")]
fn bind_mount(source: &Path, target: &Path, read_only: bool) -> Result<(), BackendError> {
    use nix::mount::{MsFlags, mount};

    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| BackendError::operation("bind mount", target, e))?;

    // MS_RDONLY is ignored on the initial bind; it takes a remount.
    if read_only {
        if let Err(e) = remount_read_only(target) {
            // Never leave a writable bind behind a failed read-only publish.
            if let Err(undo) = unmount(target) {
                warn!(target = %target.display(), error = %undo, "failed to undo bind mount");
            }
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn remount_read_only(target: &Path) -> Result<(), BackendError> {
    use nix::mount::{MsFlags, mount};

    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| BackendError::operation("read-only remount", target, e))
}

#[cfg(not(target_os = "linux"))]
fn remount_read_only(target: &Path) -> Result<(), BackendError> {
    Err(BackendError::Unsupported(format!(
        "remount is not available on this platform (target {})",
        target.display()
    )))
}

#[cfg(not(target_os = "linux"))]
fn bind_mount(_source: &Path, target: &Path, _read_only: bool) -> Result<(), BackendError> {
    Err(BackendError::Unsupported(format!(
        "bind mounts are not available on this platform (target {})",
        target.display()
    )))
}

#[cfg(target_os = "linux")]
fn unmount(target: &Path) -> Result<(), BackendError> {
    nix::mount::umount(target).map_err(|e| BackendError::operation("unmount", target, e))
}

#[cfg(not(target_os = "linux"))]
fn unmount(target: &Path) -> Result<(), BackendError> {
    Err(BackendError::Unsupported(format!(
        "unmount is not available on this platform (target {})",
        target.display()
    )))
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        LOCAL_BACKEND
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_read_only: true,
            supports_read_write: true,
            supports_snapshot: false,
            supports_clone: false,
        }
    }

    fn validate(&self, parameters: &Parameters) -> Result<(), BackendError> {
        let path = parameters
            .get(PARAM_PATH)
            .ok_or_else(|| BackendError::invalid(PARAM_PATH, "parameter is required"))?;
        if path.is_empty() {
            return Err(BackendError::invalid(PARAM_PATH, "must not be empty"));
        }
        if !Path::new(path).is_absolute() {
            return Err(BackendError::invalid(
                PARAM_PATH,
                format!("{path} is not an absolute path"),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self, volume), fields(volume_id = %volume.id))]
    async fn stage(&self, volume: &Volume, staging_path: &Path) -> Result<(), BackendError> {
        let source = Self::source_path(volume)?;
        ensure_dir("create source directory", source).await?;
        ensure_dir("create staging directory", staging_path).await?;
        debug!(source = %source.display(), "volume staged");
        Ok(())
    }

    async fn unstage(&self, volume: &Volume, staging_path: &Path) -> Result<(), BackendError> {
        // A host directory keeps no per-node state to tear down.
        debug!(volume_id = %volume.id, path = %staging_path.display(), "volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, volume, staging_path), fields(volume_id = %volume.id))]
    async fn publish(
        &self,
        volume: &Volume,
        staging_path: &Path,
        target_path: &Path,
        read_only: bool,
    ) -> Result<(), BackendError> {
        let source = Self::source_path(volume)?;
        ensure_dir("create target directory", target_path).await?;

        match self.mode {
            MountMode::Bind => {
                match mount_state(target_path).await {
                    Some(state) if state.read_only == read_only => {
                        debug!("target already mounted as requested");
                        return Ok(());
                    }
                    Some(_) if read_only => {
                        info!("target mounted read-write, remounting read-only");
                        remount_read_only(target_path)?;
                    }
                    Some(_) => {
                        return Err(BackendError::operation(
                            "bind mount",
                            target_path,
                            "target is already mounted read-only",
                        ));
                    }
                    None => bind_mount(source, target_path, read_only)?,
                }
            }
            MountMode::Marker => {
                let marker = target_path.join(MOUNT_MARKER);
                let contents = format!("source={}\nreadonly={read_only}\n", source.display());
                tokio::fs::write(&marker, contents)
                    .await
                    .map_err(|e| BackendError::operation("write mount marker", &marker, e))?;
            }
        }

        info!(
            source = %source.display(),
            target = %target_path.display(),
            read_only,
            mode = %self.mode,
            "volume published"
        );
        Ok(())
    }

    #[instrument(skip(self, volume), fields(volume_id = %volume.id))]
    async fn unpublish(&self, volume: &Volume, target_path: &Path) -> Result<(), BackendError> {
        match self.mode {
            MountMode::Bind => {
                if mount_state(target_path).await.is_none() {
                    debug!("target not mounted, nothing to unpublish");
                    return Ok(());
                }
                unmount(target_path)?;
            }
            MountMode::Marker => {
                let marker = target_path.join(MOUNT_MARKER);
                match tokio::fs::remove_file(&marker).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!("no mount marker, nothing to unpublish");
                        return Ok(());
                    }
                    Err(e) => {
                        return Err(BackendError::operation("remove mount marker", &marker, e));
                    }
                }
            }
        }
        info!(target = %target_path.display(), "volume unpublished");
        Ok(())
    }
}
