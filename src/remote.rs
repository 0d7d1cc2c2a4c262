//! Manifest transport.
//!
//! The replica checks the origin manifest with a conditional request:
//! `If-Modified-Since` carries the local manifest's mtime, and the
//! server's `Last-Modified` is canonical; on success it is propagated
//! onto the local file so the next conditional request asks the right
//! question. A plain filesystem path works as a source too (same-host
//! replicas, tests), with mtime comparison standing in for the HTTP
//! dance.

use std::io::Read;
use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

use crate::error::{GrokError, Result};

/// Outcome of a conditional manifest check.
#[derive(Debug)]
pub enum ManifestCheck {
    /// Origin says nothing changed since our mtime.
    NotModified,
    /// Fresh manifest bytes, plus the origin's Last-Modified when known.
    Fetched {
        bytes: Vec<u8>,
        last_modified: Option<SystemTime>,
    },
}

/// RFC 7231 IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
fn http_date(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn parse_http_date(s: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(s)
        .ok()
        .map(|dt| SystemTime::from(dt))
}

/// mtime of the local manifest, if it exists.
pub fn local_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Propagate the origin's Last-Modified onto the local manifest file.
pub fn set_local_mtime(path: &Path, t: SystemTime) -> Result<()> {
    filetime::set_file_mtime(path, filetime::FileTime::from_system_time(t))?;
    Ok(())
}

/// Conditionally fetch the remote manifest.
///
/// `source` is an `http(s)://` URL or a filesystem path. `since` is the
/// local manifest's mtime; `None` forces a full fetch.
pub fn check_manifest(source: &str, since: Option<SystemTime>) -> Result<ManifestCheck> {
    if source.starts_with("http://") || source.starts_with("https://") {
        check_http(source, since)
    } else {
        check_file(Path::new(source), since)
    }
}

fn check_http(url: &str, since: Option<SystemTime>) -> Result<ManifestCheck> {
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(30))
        .timeout(Duration::from_secs(300))
        .build();
    let mut req = agent.get(url);
    if let Some(t) = since {
        req = req.set("If-Modified-Since", &http_date(t));
    }
    match req.call() {
        Ok(resp) => {
            let last_modified = resp
                .header("Last-Modified")
                .and_then(parse_http_date);
            let mut bytes = Vec::new();
            resp.into_reader()
                .read_to_end(&mut bytes)
                .map_err(|e| GrokError::ManifestFetch(format!("{}: {}", url, e)))?;
            Ok(ManifestCheck::Fetched {
                bytes,
                last_modified,
            })
        }
        Err(ureq::Error::Status(304, _)) => Ok(ManifestCheck::NotModified),
        Err(e) => Err(GrokError::ManifestFetch(format!("{}: {}", url, e))),
    }
}

fn check_file(path: &Path, since: Option<SystemTime>) -> Result<ManifestCheck> {
    let meta = std::fs::metadata(path)
        .map_err(|e| GrokError::ManifestFetch(format!("{}: {}", path.display(), e)))?;
    let mtime = meta.modified().ok();
    if let (Some(local), Some(remote)) = (since, mtime) {
        // Filesystem mtimes are compared at whole-second granularity,
        // matching what HTTP would have told us.
        let local_s = as_epoch_secs(local);
        let remote_s = as_epoch_secs(remote);
        if remote_s <= local_s {
            return Ok(ManifestCheck::NotModified);
        }
    }
    let bytes = std::fs::read(path)
        .map_err(|e| GrokError::ManifestFetch(format!("{}: {}", path.display(), e)))?;
    Ok(ManifestCheck::Fetched {
        bytes,
        last_modified: mtime,
    })
}

fn as_epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
