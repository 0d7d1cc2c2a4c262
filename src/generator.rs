//! Origin-side manifest generation.
//!
//! Walks the toplevel for bare repositories and emits the manifest the
//! replicas consume. The walk stops descending as soon as a directory
//! looks like a git dir (`HEAD` plus `objects/`), so a toplevel with
//! tens of thousands of repositories is one readdir pass, not a full
//! tree crawl. A second pass resolves symlinks inside the toplevel and
//! groups each alias under its realpath entry.

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;

use crate::config::Config;
use crate::error::Result;
use crate::git::Git;
use crate::manifest::{Manifest, RepoEntry, fingerprint_refs};
use crate::objstore::ObjstoreAdmin;
use crate::utils::epoch_now;

#[derive(Debug, Default, Clone)]
pub struct GeneratorOpts {
    /// Stamp entries with the wall clock instead of the newest commit.
    pub use_now: bool,
    /// Skip repositories lacking `git-daemon-export-ok`.
    pub check_export_ok: bool,
    /// Shell-style globs of manifest paths to ignore.
    pub ignore: Vec<String>,
    /// Manifest paths to remove (`-x`).
    pub remove: Vec<String>,
    /// Drop entries whose on-disk path no longer exists (`-p`).
    pub prune: bool,
    /// Sort keys and indent the output.
    pub pretty: bool,
    /// Update just these repositories in the existing manifest instead
    /// of walking the whole toplevel.
    pub paths: Vec<String>,
}

/// Translate a shell glob into an anchored regex, fnmatch-style.
pub fn glob_to_regex(glob: &str) -> Option<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).ok()
}

fn ignored(key: &str, patterns: &[Regex]) -> bool {
    patterns.iter().any(|p| p.is_match(key))
}

/// Find all bare repositories under the toplevel, as manifest keys.
///
/// Symlinked directories are skipped here; the alias pass picks them up.
pub fn find_repos(toplevel: &Path) -> Vec<String> {
    let mut found = Vec::new();
    walk(toplevel, toplevel, &mut found);
    found.sort();
    found
}

fn walk(toplevel: &Path, dir: &Path, found: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            continue;
        };
        if meta.file_type().is_symlink() || !meta.is_dir() {
            continue;
        }
        if is_gitdir(&path) {
            if let Ok(rel) = path.strip_prefix(toplevel) {
                found.push(format!("/{}", rel.display()));
            }
            continue;
        }
        walk(toplevel, &path, found);
    }
}

pub fn is_gitdir(path: &Path) -> bool {
    path.join("HEAD").is_file() && path.join("objects").is_dir()
}

/// Build the manifest entry for one on-disk repository.
pub fn entry_for(git: &Git, config: &Config, gitdir: &Path, use_now: bool) -> Result<RepoEntry> {
    let mut entry = RepoEntry::default();

    let raw_head = std::fs::read_to_string(gitdir.join("HEAD")).unwrap_or_default();
    let raw_head = raw_head.trim();
    if !raw_head.is_empty() {
        entry.head = Some(raw_head.to_string());
    }

    let ignore = config.ignore_ref_patterns();
    entry.fingerprint = fingerprint_refs(&git.show_ref(gitdir)?, &ignore);

    if let Ok(description) = std::fs::read_to_string(gitdir.join("description")) {
        let description = description.trim();
        if !description.is_empty() {
            entry.description = Some(description.to_string());
        }
        // git's stock placeholder counts as no description.
        if entry.description_or_empty().is_empty() {
            entry.description = None;
        }
    }
    entry.owner = git.config_get(gitdir, "gitweb.owner")?;

    entry.modified = if use_now {
        epoch_now()
    } else {
        newest_commit_time(git, gitdir)?.unwrap_or_else(epoch_now)
    };

    // Objstore membership shows up as a forkgroup so replicas can wire
    // their own alternates.
    if let Some(alt) = crate::objstore::read_alternates(gitdir) {
        if alt.starts_with(config.core.objstore_dir()) {
            if let Some(repo) = alt.parent() {
                entry.forkgroup = ObjstoreAdmin::forkgroup_of(repo);
            }
        } else if let Some(provider) = alt.parent() {
            // Legacy 1.x alternates travel in `reference`.
            if let Ok(rel) = provider.strip_prefix(&config.core.toplevel) {
                entry.reference = Some(format!("/{}", rel.display()));
            }
        }
    }

    Ok(entry)
}

/// Commit time of the most recently updated ref.
fn newest_commit_time(git: &Git, gitdir: &Path) -> Result<Option<u64>> {
    let out = git.run(
        Some(gitdir),
        &[
            "for-each-ref",
            "--sort=-committerdate",
            "--count=1",
            "--format=%(committerdate:unix)",
        ],
        &[],
        None,
        crate::git::DEFAULT_TIMEOUT,
    )?;
    if !out.success() {
        return Ok(None);
    }
    Ok(out.stdout.trim().parse::<u64>().ok())
}

/// Second pass: group in-tree symlinks under their realpath entries.
fn collect_symlinks(toplevel: &Path, manifest: &mut Manifest) {
    // Compare against the canonical toplevel, else a symlinked tmpdir
    // component makes every realpath look out-of-tree.
    let canon_top = std::fs::canonicalize(toplevel).unwrap_or_else(|_| toplevel.to_path_buf());
    let mut aliases: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut stack = vec![toplevel.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Ok(meta) = std::fs::symlink_metadata(&path) else {
                continue;
            };
            if meta.file_type().is_symlink() {
                let Ok(real) = std::fs::canonicalize(&path) else {
                    continue;
                };
                let (Ok(alias_rel), Ok(real_rel)) =
                    (path.strip_prefix(toplevel), real.strip_prefix(&canon_top))
                else {
                    continue;
                };
                let real_key = format!("/{}", real_rel.display());
                if manifest.get(&real_key).is_some() {
                    aliases
                        .entry(real_key)
                        .or_default()
                        .push(format!("/{}", alias_rel.display()));
                }
            } else if meta.is_dir() && !is_gitdir(&path) {
                stack.push(path);
            }
        }
    }
    for (key, links) in aliases {
        if let Some(entry) = manifest.repos.get_mut(&key) {
            for link in links {
                entry.add_symlink(link);
            }
        }
    }
}

/// Produce (or update) the manifest for this toplevel.
pub fn run_manifest(config: &Config, git: &Git, opts: &GeneratorOpts) -> anyhow::Result<usize> {
    let toplevel = &config.core.toplevel;
    let manifest_path = &config.core.manifest;
    let ignore: Vec<Regex> = opts.ignore.iter().filter_map(|g| glob_to_regex(g)).collect();

    let mut manifest = if opts.paths.is_empty() && opts.remove.is_empty() && !opts.prune {
        // Full walk from scratch.
        Manifest::new()
    } else {
        Manifest::load_or_empty(manifest_path)?
    };

    if opts.paths.is_empty() && opts.remove.is_empty() && !opts.prune {
        for key in find_repos(toplevel) {
            // The objstore is shared storage, not a published repo.
            if crate::fsck::gitdir_for(toplevel, &key).starts_with(config.core.objstore_dir()) {
                continue;
            }
            if ignored(&key, &ignore) {
                log::debug!("{}: ignored", key);
                continue;
            }
            let gitdir = crate::fsck::gitdir_for(toplevel, &key);
            if opts.check_export_ok && !gitdir.join("git-daemon-export-ok").is_file() {
                log::debug!("{}: not exported, skipping", key);
                continue;
            }
            match entry_for(git, config, &gitdir, opts.use_now) {
                Ok(entry) => manifest.upsert(key, entry),
                Err(e) => log::warn!("{}: skipping: {}", key, e),
            }
        }
        collect_symlinks(toplevel, &mut manifest);
    } else {
        // Incremental: patch the named repositories only.
        for raw in &opts.paths {
            let key = normalize_key(toplevel, raw);
            let gitdir = crate::fsck::gitdir_for(toplevel, &key);
            if !is_gitdir(&gitdir) {
                log::warn!("{}: not a repository, skipping", key);
                continue;
            }
            if ignored(&key, &ignore) {
                continue;
            }
            if opts.check_export_ok && !gitdir.join("git-daemon-export-ok").is_file() {
                continue;
            }
            match entry_for(git, config, &gitdir, opts.use_now) {
                Ok(entry) => manifest.upsert(key, entry),
                Err(e) => log::warn!("{}: skipping: {}", key, e),
            }
        }
        for raw in &opts.remove {
            let key = normalize_key(toplevel, raw);
            if manifest.remove(&key).is_some() {
                log::info!("{}: removed from manifest", key);
            }
        }
        if opts.prune {
            let stale: Vec<String> = manifest
                .repo_keys()
                .filter(|key| !is_gitdir(&crate::fsck::gitdir_for(toplevel, key)))
                .cloned()
                .collect();
            for key in stale {
                log::info!("{}: pruned (gone from disk)", key);
                manifest.remove(&key);
            }
        }
    }

    let count = manifest.repo_keys().count();
    manifest.write_file(manifest_path, opts.pretty)?;
    log::info!(
        "wrote {} with {} entries",
        manifest_path.display(),
        count
    );
    Ok(count)
}

/// Accept either a manifest key or an on-disk path for CLI arguments.
fn normalize_key(toplevel: &Path, raw: &str) -> String {
    let path = Path::new(raw);
    if let Ok(rel) = path.strip_prefix(toplevel) {
        return format!("/{}", rel.display());
    }
    if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("/{}", raw)
    }
}
