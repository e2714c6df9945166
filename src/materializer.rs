//! Idempotent materialization of directories and files with exact ownership.
//!
//! # Security Guarantees
//!
//! - **Atomic writes**: File contents go to a `0600` temporary file in the target
//!   directory, get their final owner and mode, and are then renamed into place
//! - **No content in errors**: Failures name the artifact label, never its bytes
//! - **Convergent metadata**: Owner, group and mode are corrected whatever the
//!   prior on-disk state was
//!
//! # Example
//!
//! ```no_run
//! use wale_provision::materializer::{materialize, FileArtifact, Ownership};
//!
//! # fn main() -> anyhow::Result<()> {
//! let ownership = Ownership::new("root", "postgres", 0o750);
//! let report = materialize(&[
//!     FileArtifact::directory("/etc/wal-e.d", ownership.clone()),
//!     FileArtifact::file("/etc/wal-e.d/NOTE", "NOTE", ownership, b"hello".to_vec()),
//! ])?;
//! println!("changed: {}", report.changed());
//! # Ok(())
//! # }
//! ```

use nix::unistd::{Gid, Group, Uid, User};
use std::fmt;
use std::fs::{self, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Permission bits compared and enforced (includes setuid/setgid/sticky).
const MODE_MASK: u32 = 0o7777;

#[derive(Debug, Error)]
pub enum MaterializeError {
    /// The process lacks the rights to create, chown or chmod the artifact.
    #[error("permission denied applying {label} at {}", .path.display())]
    PermissionDenied {
        path: PathBuf,
        label: String,
        #[source]
        source: io::Error,
    },

    /// Underlying storage failure (disk full, read-only filesystem, ...).
    #[error("I/O error applying {label} at {}", .path.display())]
    Io {
        path: PathBuf,
        label: String,
        #[source]
        source: io::Error,
    },

    /// The owner or group does not exist in the user database.
    #[error("unknown {kind} '{name}' for {label}")]
    UnknownPrincipal {
        kind: &'static str,
        name: String,
        label: String,
    },
}

impl MaterializeError {
    fn from_io(path: &Path, label: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            Self::PermissionDenied {
                path: path.to_path_buf(),
                label: label.to_string(),
                source,
            }
        } else {
            Self::Io {
                path: path.to_path_buf(),
                label: label.to_string(),
                source,
            }
        }
    }

    /// Label of the artifact that failed.
    pub fn label(&self) -> &str {
        match self {
            Self::PermissionDenied { label, .. }
            | Self::Io { label, .. }
            | Self::UnknownPrincipal { label, .. } => label,
        }
    }
}

/// Owner, group and mode an artifact must end up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ownership {
    pub owner: String,
    pub group: String,
    pub mode: u32,
}

impl Ownership {
    pub fn new(owner: &str, group: &str, mode: u32) -> Self {
        Self {
            owner: owner.to_string(),
            group: group.to_string(),
            mode,
        }
    }
}

/// What should be at an artifact's path.
#[derive(Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    Directory { ownership: Ownership },
    File { ownership: Ownership, contents: Vec<u8> },
    /// Nothing: remove the file if present.
    Absent,
}

impl fmt::Debug for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory { ownership } => f
                .debug_struct("Directory")
                .field("ownership", ownership)
                .finish(),
            Self::File { ownership, contents } => f
                .debug_struct("File")
                .field("ownership", ownership)
                .field("contents", &format_args!("[{} bytes]", contents.len()))
                .finish(),
            Self::Absent => f.write_str("Absent"),
        }
    }
}

/// A single materialization target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileArtifact {
    pub path: PathBuf,
    /// Human name used in logs and errors (e.g. the variable name).
    pub label: String,
    pub kind: ArtifactKind,
}

impl FileArtifact {
    pub fn directory(path: impl Into<PathBuf>, ownership: Ownership) -> Self {
        let path = path.into();
        Self {
            label: path.display().to_string(),
            path,
            kind: ArtifactKind::Directory { ownership },
        }
    }

    pub fn file(
        path: impl Into<PathBuf>,
        label: &str,
        ownership: Ownership,
        contents: Vec<u8>,
    ) -> Self {
        Self {
            path: path.into(),
            label: label.to_string(),
            kind: ArtifactKind::File {
                ownership,
                contents,
            },
        }
    }

    pub fn absent(path: impl Into<PathBuf>, label: &str) -> Self {
        Self {
            path: path.into(),
            label: label.to_string(),
            kind: ArtifactKind::Absent,
        }
    }

    /// Ownership the artifact converges to, if it is meant to exist.
    pub fn ownership(&self) -> Option<&Ownership> {
        match &self.kind {
            ArtifactKind::Directory { ownership } | ArtifactKind::File { ownership, .. } => {
                Some(ownership)
            }
            ArtifactKind::Absent => None,
        }
    }
}

/// What applying an artifact did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
    Removed,
    AlreadyAbsent,
}

impl Outcome {
    pub fn is_change(self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Removed)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "up to date",
            Self::Removed => "removed",
            Self::AlreadyAbsent => "absent",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedArtifact {
    pub path: PathBuf,
    pub label: String,
    pub outcome: Outcome,
}

/// Result of a successful [`materialize`] call, in apply order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializationReport {
    pub applied: Vec<AppliedArtifact>,
}

impl MaterializationReport {
    /// Whether any artifact changed the filesystem.
    pub fn changed(&self) -> bool {
        self.applied.iter().any(|a| a.outcome.is_change())
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.applied.iter().filter(|a| a.outcome == outcome).count()
    }
}

/// Apply artifacts in order, stopping at the first failure.
///
/// Directories must precede the files they contain. A file whose parent
/// is missing gets the parent created with the file's owner and group and
/// a mode with execute bits added wherever read bits are set.
///
/// # Errors
///
/// Returns an error if:
/// - An owner or group cannot be resolved
/// - The process may not create, chown or chmod an artifact
/// - The underlying filesystem fails
#[instrument(skip_all, fields(artifacts = artifacts.len()))]
pub fn materialize(artifacts: &[FileArtifact]) -> Result<MaterializationReport, MaterializeError> {
    let mut report = MaterializationReport::default();

    for artifact in artifacts {
        let outcome = apply(artifact)?;
        debug!(
            path = %artifact.path.display(),
            label = %artifact.label,
            %outcome,
            "artifact applied"
        );

        report.applied.push(AppliedArtifact {
            path: artifact.path.clone(),
            label: artifact.label.clone(),
            outcome,
        });
    }

    info!(
        changed = report.applied.iter().filter(|a| a.outcome.is_change()).count(),
        total = report.applied.len(),
        "materialization complete"
    );
    Ok(report)
}

fn apply(artifact: &FileArtifact) -> Result<Outcome, MaterializeError> {
    let path = artifact.path.as_path();
    let label = artifact.label.as_str();

    match &artifact.kind {
        ArtifactKind::Directory { ownership } => apply_directory(path, label, ownership),
        ArtifactKind::File {
            ownership,
            contents,
        } => apply_file(path, label, ownership, contents),
        ArtifactKind::Absent => ensure_absent(path, label),
    }
}

fn apply_directory(
    path: &Path,
    label: &str,
    ownership: &Ownership,
) -> Result<Outcome, MaterializeError> {
    let (uid, gid) = resolve_principal(path, label, ownership)?;
    let existed = path.is_dir();

    if !existed {
        fs::create_dir_all(path).map_err(|e| MaterializeError::from_io(path, label, e))?;
    }

    let corrected = enforce_metadata(path, label, uid, gid, ownership.mode)?;

    Ok(match (existed, corrected) {
        (false, _) => Outcome::Created,
        (true, true) => Outcome::Updated,
        (true, false) => Outcome::Unchanged,
    })
}

fn apply_file(
    path: &Path,
    label: &str,
    ownership: &Ownership,
    contents: &[u8],
) -> Result<Outcome, MaterializeError> {
    let (uid, gid) = resolve_principal(path, label, ownership)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            let parent_ownership = Ownership {
                mode: directory_mode(ownership.mode),
                ..ownership.clone()
            };
            apply_directory(parent, label, &parent_ownership)?;
        }
    }

    let existing = match fs::symlink_metadata(path) {
        Ok(meta) => Some(meta),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(MaterializeError::from_io(path, label, e)),
    };

    if let Some(meta) = &existing {
        if meta.is_file() && same_contents(path, label, contents)? {
            let corrected = enforce_metadata(path, label, uid, gid, ownership.mode)?;
            return Ok(if corrected {
                Outcome::Updated
            } else {
                Outcome::Unchanged
            });
        }
    }

    write_atomic(path, label, contents, uid, gid, ownership.mode)?;

    Ok(if existing.is_some() {
        Outcome::Updated
    } else {
        Outcome::Created
    })
}

fn ensure_absent(path: &Path, label: &str) -> Result<Outcome, MaterializeError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(Outcome::Removed),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Outcome::AlreadyAbsent),
        Err(e) => Err(MaterializeError::from_io(path, label, e)),
    }
}

/// Write `contents` next to `path` and rename it into place.
fn write_atomic(
    path: &Path,
    label: &str,
    contents: &[u8],
    uid: Uid,
    gid: Gid,
    mode: u32,
) -> Result<(), MaterializeError> {
    let err = |e: io::Error| MaterializeError::from_io(path, label, e);

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(parent).map_err(err)?;
    tmp.write_all(contents).map_err(err)?;
    tmp.flush().map_err(err)?;

    std::os::unix::fs::fchown(tmp.as_file(), Some(uid.as_raw()), Some(gid.as_raw()))
        .map_err(err)?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(mode))
        .map_err(err)?;
    tmp.as_file().sync_all().map_err(err)?;

    tmp.persist(path).map_err(|e| err(e.error))?;
    Ok(())
}

/// Set owner, group and mode, returning whether anything had to change.
fn enforce_metadata(
    path: &Path,
    label: &str,
    uid: Uid,
    gid: Gid,
    mode: u32,
) -> Result<bool, MaterializeError> {
    let err = |e: io::Error| MaterializeError::from_io(path, label, e);
    // chown and chmod follow symlinks, so compare against the target
    let meta = fs::metadata(path).map_err(err)?;

    let owner_wrong = meta.uid() != uid.as_raw() || meta.gid() != gid.as_raw();
    let mode_wrong = meta.permissions().mode() & MODE_MASK != mode;

    if owner_wrong {
        std::os::unix::fs::chown(path, Some(uid.as_raw()), Some(gid.as_raw())).map_err(err)?;
    }

    // chown can clear setuid/setgid bits, so the mode goes second
    if owner_wrong || mode_wrong {
        fs::set_permissions(path, Permissions::from_mode(mode)).map_err(err)?;
    }

    Ok(owner_wrong || mode_wrong)
}

fn same_contents(path: &Path, label: &str, contents: &[u8]) -> Result<bool, MaterializeError> {
    let meta = fs::metadata(path).map_err(|e| MaterializeError::from_io(path, label, e))?;
    if meta.len() != contents.len() as u64 {
        return Ok(false);
    }

    let current = fs::read(path).map_err(|e| MaterializeError::from_io(path, label, e))?;
    Ok(current == contents)
}

fn resolve_principal(
    path: &Path,
    label: &str,
    ownership: &Ownership,
) -> Result<(Uid, Gid), MaterializeError> {
    let (owner, group_name) = (&ownership.owner, &ownership.group);
    let user = found(path, label, "user", owner, User::from_name(owner))?;
    let group = found(path, label, "group", group_name, Group::from_name(group_name))?;

    Ok((user.uid, group.gid))
}

/// Missing entries are unknown principals; lookup failures are I/O errors.
fn found<T>(
    path: &Path,
    label: &str,
    kind: &'static str,
    name: &str,
    lookup: nix::Result<Option<T>>,
) -> Result<T, MaterializeError> {
    match lookup {
        Ok(Some(entry)) => Ok(entry),
        Ok(None) => Err(MaterializeError::UnknownPrincipal {
            kind,
            name: name.to_string(),
            label: label.to_string(),
        }),
        Err(errno) => Err(MaterializeError::from_io(path, label, io::Error::from(errno))),
    }
}

/// Directory mode for a file mode: execute wherever read is granted.
fn directory_mode(file_mode: u32) -> u32 {
    let mut mode = file_mode & MODE_MASK;
    for (read, exec) in [(0o400, 0o100), (0o040, 0o010), (0o004, 0o001)] {
        if mode & read != 0 {
            mode |= exec;
        }
    }
    mode
}
