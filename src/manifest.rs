//! Manifest model and codec.
//!
//! The manifest is the distributed authority on what exists and when it
//! last changed: a JSON object mapping toplevel-relative repository paths
//! (always starting with `/`) to [`RepoEntry`] values. It travels plain
//! or gzip-compressed, and is replaced on disk atomically so readers see
//! either the old or the new snapshot, never a torn file.
//!
//! Fingerprints make delta computation cheap: a SHA-1 over the sorted
//! `git show-ref` output stands in for the full ref state, so two
//! repositories with identical refs (modulo ignored patterns) compare
//! equal by string comparison alone.

use std::io::{Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use indexmap::IndexMap;
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::{GrokError, Result};

/// Pseudo-entry carrying the producer's schema hint. Never a repository.
pub const META_KEY: &str = "/manifest/";

/// Schema hint we stamp on manifests we produce.
pub const HOOKVERSION: u32 = 2;

const DEFAULT_DESCRIPTION: &str =
    "Unnamed repository; edit this file 'description' to name it";

/// One repository as described by the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RepoEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Symbolic-ref form, e.g. `"ref: refs/heads/master"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    /// Last-update time, seconds since the epoch.
    pub modified: u64,
    /// SHA-1 over the sorted ref listing, or null for an empty ref set.
    pub fingerprint: Option<String>,
    /// Legacy (1.x) alternates source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Objstore family membership.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forkgroup: Option<String>,
    /// Symlink aliases pointing at this entry, kept sorted and unique so
    /// the set compares order-independently.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub symlinks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hookversion: Option<u32>,
}

impl RepoEntry {
    /// Description with git's placeholder treated as empty.
    pub fn description_or_empty(&self) -> &str {
        match self.description.as_deref() {
            None => "",
            Some(d) if d.trim() == DEFAULT_DESCRIPTION => "",
            Some(d) => d,
        }
    }

    pub fn add_symlink(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.symlinks.contains(&path) {
            self.symlinks.push(path);
            self.symlinks.sort();
        }
    }

    /// True when `other` differs from `self` only in its symlink set.
    pub fn differs_only_in_symlinks(&self, other: &RepoEntry) -> bool {
        if self.symlinks == other.symlinks {
            return false;
        }
        let mut a = self.clone();
        let mut b = other.clone();
        a.symlinks.clear();
        b.symlinks.clear();
        a == b
    }
}

/// The repository mapping. Insertion order is preserved on compact emit;
/// pretty emit sorts keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub repos: IndexMap<String, RepoEntry>,
}

impl Serialize for Manifest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.repos.len()))?;
        for (key, entry) in &self.repos {
            map.serialize_entry(key, entry)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Manifest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ManifestVisitor;

        impl<'de> Visitor<'de> for ManifestVisitor {
            type Value = Manifest;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a map of repository paths to entries")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Manifest, A::Error> {
                let mut repos = IndexMap::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, entry)) = access.next_entry::<String, RepoEntry>()? {
                    if repos.insert(key.clone(), entry).is_some() {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate manifest key {:?}",
                            key
                        )));
                    }
                }
                Ok(Manifest { repos })
            }
        }

        deserializer.deserialize_map(ManifestVisitor)
    }
}

impl Manifest {
    pub fn new() -> Manifest {
        Manifest::default()
    }

    /// Repository keys, skipping the `/manifest/` meta-entry.
    pub fn repo_keys(&self) -> impl Iterator<Item = &String> {
        self.repos.keys().filter(|k| k.as_str() != META_KEY)
    }

    pub fn get(&self, key: &str) -> Option<&RepoEntry> {
        self.repos.get(key)
    }

    /// Insert or replace an entry, stamping the producer hookversion on
    /// the meta-entry the first time.
    pub fn upsert(&mut self, key: impl Into<String>, entry: RepoEntry) {
        if !self.repos.contains_key(META_KEY) {
            self.repos.insert(
                META_KEY.to_string(),
                RepoEntry {
                    hookversion: Some(HOOKVERSION),
                    ..RepoEntry::default()
                },
            );
        }
        self.repos.insert(key.into(), entry);
    }

    pub fn remove(&mut self, key: &str) -> Option<RepoEntry> {
        self.repos.shift_remove(key)
    }

    /// Parse manifest bytes, plain or gzip (detected by magic bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Manifest> {
        let plain;
        let data: &[u8] = if bytes.starts_with(&[0x1f, 0x8b]) {
            let mut decoder = GzDecoder::new(bytes);
            let mut buf = Vec::new();
            decoder
                .read_to_end(&mut buf)
                .map_err(|e| GrokError::ManifestParse(format!("gzip: {}", e)))?;
            plain = buf;
            &plain
        } else {
            bytes
        };
        serde_json::from_slice(data).map_err(|e| GrokError::ManifestParse(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Manifest> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Local manifest, or an empty one when the file doesn't exist yet
    /// (a cold replica).
    pub fn load_or_empty(path: &Path) -> Result<Manifest> {
        match std::fs::read(path) {
            Ok(bytes) => Self::from_bytes(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Serialize. Pretty mode sorts keys and indents; compact is the hot
    /// path and preserves insertion order.
    pub fn to_bytes(&self, pretty: bool) -> Vec<u8> {
        if pretty {
            let sorted: std::collections::BTreeMap<&String, &RepoEntry> =
                self.repos.iter().collect();
            let mut buf = serde_json::to_vec_pretty(&sorted).expect("manifest serializes");
            buf.push(b'\n');
            buf
        } else {
            serde_json::to_vec(self).expect("manifest serializes")
        }
    }

    /// Atomically replace `path` with this manifest: temp file in the
    /// same directory, fsync, rename. Gzip is selected by a `.gz`
    /// filename suffix.
    pub fn write_file(&self, path: &Path, pretty: bool) -> Result<()> {
        let body = self.to_bytes(pretty);
        let gzip = path.extension().is_some_and(|e| e == "gz");
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        if gzip {
            let mut encoder = GzEncoder::new(tmp.as_file_mut(), Compression::default());
            encoder.write_all(&body)?;
            encoder.finish()?;
        } else {
            tmp.write_all(&body)?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| GrokError::Io(e.error))?;
        Ok(())
    }

    /// Write guard for incremental updates: refuse to shrink the on-disk
    /// manifest past the purge quorum unless forced.
    ///
    /// Removing up to `quorum` (a fraction of current entries) is always
    /// allowed, as is any removal of at most `threshold` entries; one
    /// entry past the quorum is refused.
    pub fn write_file_guarded(
        &self,
        path: &Path,
        pretty: bool,
        quorum: f64,
        threshold: usize,
        force_purge: bool,
    ) -> Result<()> {
        if !force_purge {
            if let Ok(current) = Manifest::load(path) {
                let removed = current
                    .repo_keys()
                    .filter(|k| !self.repos.contains_key(*k))
                    .count();
                let total = current.repo_keys().count();
                if purge_refused(removed, total, quorum, threshold) {
                    return Err(GrokError::PurgeRefused { removed, total });
                }
            }
        }
        self.write_file(path, pretty)
    }
}

/// Quorum decision shared by the codec and the pull purge pass.
pub fn purge_refused(removed: usize, total: usize, quorum: f64, threshold: usize) -> bool {
    if removed == 0 || total == 0 {
        return false;
    }
    let fraction = removed as f64 / total as f64;
    fraction > quorum && removed > threshold
}

/// Fingerprint of a repository's refs from raw `git show-ref` output.
///
/// Lines are `<sha1> <refname>`; refs matching any ignore pattern are
/// dropped, the rest sorted lexicographically by refname and hashed as
/// the byte-string `"<sha1> <refname>\n"`. An empty ref set has no
/// fingerprint, which consumers treat as "always fetch".
pub fn fingerprint_refs(show_ref: &str, ignore: &[Regex]) -> Option<String> {
    let mut refs: Vec<(&str, &str)> = show_ref
        .lines()
        .filter_map(|line| line.split_once(' '))
        .filter(|(_, refname)| !ignore.iter().any(|pat| pat.is_match(refname)))
        .collect();
    if refs.is_empty() {
        return None;
    }
    refs.sort_by_key(|&(_, refname)| refname);
    let mut hasher = Sha1::new();
    for (sha, refname) in refs {
        hasher.update(sha.as_bytes());
        hasher.update(b" ");
        hasher.update(refname.as_bytes());
        hasher.update(b"\n");
    }
    Some(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fingerprint: &str, modified: u64) -> RepoEntry {
        RepoEntry {
            fingerprint: Some(fingerprint.to_string()),
            modified,
            head: Some("ref: refs/heads/master".to_string()),
            ..RepoEntry::default()
        }
    }

    #[test]
    fn test_roundtrip_compact() {
        let mut m = Manifest::new();
        m.upsert("/a.git", entry("abc", 100));
        m.upsert("/b.git", entry("def", 200));
        let bytes = m.to_bytes(false);
        let parsed = Manifest::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, m);
        // Compact emit preserves insertion order.
        let keys: Vec<_> = parsed.repos.keys().cloned().collect();
        assert_eq!(keys, vec!["/manifest/", "/a.git", "/b.git"]);
    }

    #[test]
    fn test_roundtrip_gzip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.js.gz");
        let mut m = Manifest::new();
        m.upsert("/a.git", entry("abc", 100));
        m.write_file(&path, false).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        assert_eq!(Manifest::load(&path).unwrap(), m);
    }

    #[test]
    fn test_pretty_sorts_keys() {
        let mut m = Manifest::new();
        m.upsert("/z.git", entry("abc", 100));
        m.upsert("/a.git", entry("def", 200));
        let pretty = String::from_utf8(m.to_bytes(true)).unwrap();
        let a = pretty.find("/a.git").unwrap();
        let z = pretty.find("/z.git").unwrap();
        assert!(a < z);
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let raw = br#"{"/a.git": {"modified": 1, "fingerprint": null},
                       "/a.git": {"modified": 2, "fingerprint": null}}"#;
        match Manifest::from_bytes(raw) {
            Err(GrokError::ManifestParse(msg)) => assert!(msg.contains("duplicate")),
            other => panic!("expected parse failure, got {:?}", other),
        }
    }

    #[test]
    fn test_top_level_must_be_object() {
        assert!(Manifest::from_bytes(b"[1, 2, 3]").is_err());
        assert!(Manifest::from_bytes(b"\"hi\"").is_err());
    }

    #[test]
    fn test_meta_entry_skipped_by_repo_keys() {
        let mut m = Manifest::new();
        m.upsert("/a.git", entry("abc", 100));
        assert!(m.repos.contains_key(META_KEY));
        let keys: Vec<_> = m.repo_keys().collect();
        assert_eq!(keys, vec!["/a.git"]);
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.js");
        let mut m = Manifest::new();
        m.upsert("/a.git", entry("abc", 100));
        m.write_file(&path, false).unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("manifest.js")]);
    }

    #[test]
    fn test_quorum_exact_fraction_allowed_one_more_refused() {
        // 100 entries, 5% quorum: removing 5 is fine, 6 is not.
        assert!(!purge_refused(5, 100, 0.05, 5));
        assert!(purge_refused(6, 100, 0.05, 5));
    }

    #[test]
    fn test_quorum_small_absolute_removals_allowed() {
        // 3 of 10 is 30%, but under the absolute threshold.
        assert!(!purge_refused(3, 10, 0.05, 5));
        assert!(purge_refused(6, 10, 0.05, 5));
    }

    #[test]
    fn test_guarded_write_refuses_mass_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.js");

        let mut old = Manifest::new();
        for i in 0..100 {
            old.upsert(format!("/r{}.git", i), entry("abc", 100));
        }
        old.write_file(&path, false).unwrap();

        let mut new = Manifest::new();
        for i in 0..80 {
            new.upsert(format!("/r{}.git", i), entry("abc", 100));
        }
        match new.write_file_guarded(&path, false, 0.05, 5, false) {
            Err(GrokError::PurgeRefused { removed, total }) => {
                assert_eq!(removed, 20);
                assert_eq!(total, 100);
            }
            other => panic!("expected PurgeRefused, got {:?}", other),
        }
        // On-disk manifest untouched.
        assert_eq!(Manifest::load(&path).unwrap().repo_keys().count(), 100);

        // Forced, the removal goes through.
        new.write_file_guarded(&path, false, 0.05, 5, true).unwrap();
        assert_eq!(Manifest::load(&path).unwrap().repo_keys().count(), 80);
    }

    #[test]
    fn test_fingerprint_stable_under_reordering() {
        let a = "aaa refs/heads/main\nbbb refs/tags/v1\n";
        let b = "bbb refs/tags/v1\naaa refs/heads/main\n";
        assert_eq!(fingerprint_refs(a, &[]), fingerprint_refs(b, &[]));
        assert!(fingerprint_refs(a, &[]).is_some());
    }

    #[test]
    fn test_fingerprint_ignores_patterns() {
        let with = "aaa refs/heads/main\nccc refs/meta/config\n";
        let without = "aaa refs/heads/main\n";
        let ignore = vec![Regex::new("^refs/meta/").unwrap()];
        assert_eq!(
            fingerprint_refs(with, &ignore),
            fingerprint_refs(without, &[])
        );
    }

    #[test]
    fn test_fingerprint_empty_is_none() {
        assert_eq!(fingerprint_refs("", &[]), None);
        let ignore = vec![Regex::new(".").unwrap()];
        assert_eq!(fingerprint_refs("aaa refs/heads/main\n", &ignore), None);
    }

    #[test]
    fn test_fingerprint_known_value() {
        // sha1 of the literal line, computable with coreutils:
        //   printf 'aaa refs/heads/main\n' | sha1sum
        let fp = fingerprint_refs("aaa refs/heads/main\n", &[]).unwrap();
        assert_eq!(fp.len(), 40);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_symlinks_kept_sorted_unique() {
        let mut e = RepoEntry::default();
        e.add_symlink("/z");
        e.add_symlink("/a");
        e.add_symlink("/z");
        assert_eq!(e.symlinks, vec!["/a", "/z"]);
    }

    #[test]
    fn test_differs_only_in_symlinks() {
        let mut a = entry("abc", 100);
        let mut b = a.clone();
        b.add_symlink("/alias");
        assert!(a.differs_only_in_symlinks(&b));
        b.fingerprint = Some("def".to_string());
        assert!(!a.differs_only_in_symlinks(&b));
        // Identical entries are not a symlink-only change.
        a.fingerprint = Some("def".to_string());
        a.symlinks = b.symlinks.clone();
        assert!(!a.differs_only_in_symlinks(&b));
    }

    #[test]
    fn test_description_placeholder_is_empty() {
        let mut e = RepoEntry::default();
        assert_eq!(e.description_or_empty(), "");
        e.description = Some(DEFAULT_DESCRIPTION.to_string());
        assert_eq!(e.description_or_empty(), "");
        e.description = Some("Linux kernel".to_string());
        assert_eq!(e.description_or_empty(), "Linux kernel");
    }
}
