//! Error types shared across the mirroring engine.

use std::path::PathBuf;
use std::time::Duration;

/// Conditions callers dispatch on.
///
/// Per-repository failures (`GitFailed`, `GitTimeout`, `LockBusy`) are
/// recovered locally by the pull and fsck controllers; process-level
/// failures propagate to the exit code.
#[derive(Debug)]
pub enum GrokError {
    /// A git subprocess exceeded its deadline and was killed.
    GitTimeout { args: String, timeout: Duration },
    /// A git subprocess could not be spawned at all.
    GitSpawn { args: String, source: std::io::Error },
    /// A git subprocess exited non-zero where success was required.
    GitFailed { args: String, code: i32, stderr: String },
    /// Another grokmirror process holds the repository lock.
    LockBusy { path: PathBuf },
    /// The manifest could not be fetched from the remote.
    ManifestFetch(String),
    /// The manifest bytes did not decode to a JSON object.
    ManifestParse(String),
    /// An incremental manifest write would remove too many entries.
    PurgeRefused { removed: usize, total: usize },
    /// Rewiring a repository into an objstore failed partway.
    ObjstoreMigration { repo: PathBuf, reason: String },
    Io(std::io::Error),
}

impl std::fmt::Display for GrokError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GrokError::GitTimeout { args, timeout } => {
                write!(f, "git {} timed out after {}s", args, timeout.as_secs())
            }
            GrokError::GitSpawn { args, source } => {
                write!(f, "could not run git {}: {}", args, source)
            }
            GrokError::GitFailed { args, code, stderr } => {
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    write!(f, "git {} exited with code {}", args, code)
                } else {
                    write!(f, "git {} exited with code {}: {}", args, code, stderr)
                }
            }
            GrokError::LockBusy { path } => {
                write!(f, "lock busy: {}", path.display())
            }
            GrokError::ManifestFetch(msg) => write!(f, "manifest fetch failed: {}", msg),
            GrokError::ManifestParse(msg) => write!(f, "manifest parse failed: {}", msg),
            GrokError::PurgeRefused { removed, total } => {
                write!(
                    f,
                    "refusing to remove {} of {} manifest entries (use --force-purge to override)",
                    removed, total
                )
            }
            GrokError::ObjstoreMigration { repo, reason } => {
                write!(f, "objstore migration of {} failed: {}", repo.display(), reason)
            }
            GrokError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for GrokError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GrokError::GitSpawn { source, .. } => Some(source),
            GrokError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for GrokError {
    fn from(e: std::io::Error) -> Self {
        GrokError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, GrokError>;
