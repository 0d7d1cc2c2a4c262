//! Fsck and repack controller.
//!
//! One pass walks every repository in the local manifest, decides per
//! repo whether it needs a quick repack, a full repack, pruning, or a
//! health check, and runs the git work under the repository lock.
//! Checks are staggered: a repository first seen today gets a random
//! `nextcheck` inside the fsck frequency window, so ten thousand repos
//! don't all fsck on the same night.
//!
//! Corruption observed in git stderr doesn't get repaired here. The
//! controller drops a `grokmirror.reclone` file in the repository and
//! moves on; the pull engine honors the mark on its next pass by
//! deleting and re-cloning. The two programs rendezvous only through
//! that file, which keeps them independently restartable.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{Config, FsckConfig};
use crate::error::GrokError;
use crate::git::Git;
use crate::lock::RepoLock;
use crate::manifest::Manifest;
use crate::objstore::{self, ObjstoreAdmin};
use crate::utils::epoch_now;

/// Sentinel telling the pull engine to delete and re-clone.
pub const RECLONE_MARK: &str = "grokmirror.reclone";

/// Sidecar status file, kept under the toplevel.
pub const STATUS_FILE: &str = ".grokmirror-fsck.status";

const DAY: u64 = 86400;

// ---------------------------------------------------------------------------
// Status file

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RepoStatus {
    /// Epoch seconds of the last completed fsck; 0 = never.
    pub lastcheck: u64,
    pub lastrepack: u64,
    pub lastfullrepack: u64,
    /// Epoch seconds after which the next fsck is due; 0 = unscheduled.
    pub nextcheck: u64,
    /// Wall-clock seconds the last check spent on this repo.
    pub s_elapsed: u64,
    pub quick_repack_count: u32,
}

/// The status mapping for one toplevel, replaced atomically on save.
#[derive(Debug, Default)]
pub struct FsckStatus {
    pub entries: BTreeMap<String, RepoStatus>,
}

impl FsckStatus {
    pub fn path_for(toplevel: &Path) -> PathBuf {
        toplevel.join(STATUS_FILE)
    }

    pub fn load_or_default(toplevel: &Path) -> FsckStatus {
        let path = Self::path_for(toplevel);
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => FsckStatus { entries },
                Err(e) => {
                    log::warn!("corrupt status file {}: {}", path.display(), e);
                    FsckStatus::default()
                }
            },
            Err(_) => FsckStatus::default(),
        }
    }

    pub fn save(&self, toplevel: &Path) -> crate::error::Result<()> {
        let path = Self::path_for(toplevel);
        let body = serde_json::to_vec_pretty(&self.entries).expect("status serializes");
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| GrokError::Io(e.error))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Observed state and decisions

/// What the controller can see without running git.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RepoStats {
    pub loose_objects: usize,
    pub packs: usize,
    pub pack_size: u64,
    pub has_bitmap: bool,
}

/// Count loose objects and packs the way `git count-objects` would,
/// without the subprocess.
pub fn collect_repo_stats(gitdir: &Path) -> RepoStats {
    let mut stats = RepoStats::default();
    let objects = gitdir.join("objects");
    if let Ok(entries) = std::fs::read_dir(&objects) {
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.len() == 2 && name.chars().all(|c| c.is_ascii_hexdigit()) {
                if let Ok(files) = std::fs::read_dir(entry.path()) {
                    stats.loose_objects += files.filter_map(|f| f.ok()).count();
                }
            }
        }
    }
    if let Ok(entries) = std::fs::read_dir(objects.join("pack")) {
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("pack") => {
                    stats.packs += 1;
                    if let Ok(meta) = entry.metadata() {
                        stats.pack_size += meta.len();
                    }
                }
                Some("bitmap") => stats.has_bitmap = true,
                _ => {}
            }
        }
    }
    stats
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepackDecision {
    None,
    Quick,
    Full,
}

/// Repack policy: thresholds trigger a quick repack, age triggers a full
/// one. `jitter_days` shifts the full-repack schedule per repo so a
/// fleet doesn't repack in lockstep; it is derived once per pass.
pub fn repack_needed(
    stats: &RepoStats,
    status: &RepoStatus,
    now: u64,
    cfg: &FsckConfig,
    jitter_days: i64,
) -> RepackDecision {
    let interval_days = (cfg.full_repack_every as i64 + jitter_days).max(1) as u64;
    let full_due = status.lastfullrepack == 0
        || now.saturating_sub(status.lastfullrepack) >= interval_days * DAY;
    if full_due {
        return RepackDecision::Full;
    }
    if stats.loose_objects >= cfg.loose_obj_threshold || stats.packs >= cfg.packs_threshold {
        return RepackDecision::Quick;
    }
    RepackDecision::None
}

/// First sighting gets a uniformly random check inside the frequency
/// window; after that, checks land every `frequency` days.
pub fn fsck_due(status: &RepoStatus, now: u64, force: bool) -> bool {
    force || (status.nextcheck != 0 && status.nextcheck <= now)
}

pub fn schedule_first_check(now: u64, frequency_days: u64) -> u64 {
    let spread = rand::thread_rng().gen_range(0..=frequency_days.max(1));
    now + spread * DAY
}

/// Scan git stderr for the configured corruption markers. Returns the
/// first offending line for the reclone mark.
pub fn match_reclone_errors(stderr: &str, patterns: &[String]) -> Option<String> {
    for line in stderr.lines() {
        if patterns.iter().any(|p| line.contains(p.as_str())) {
            return Some(line.trim().to_string());
        }
    }
    None
}

pub fn write_reclone_mark(gitdir: &Path, reason: &str) -> std::io::Result<()> {
    std::fs::write(gitdir.join(RECLONE_MARK), format!("{}\n", reason))
}

pub fn read_reclone_mark(gitdir: &Path) -> Option<String> {
    std::fs::read_to_string(gitdir.join(RECLONE_MARK))
        .ok()
        .map(|s| s.trim().to_string())
}

pub fn clear_reclone_mark(gitdir: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(gitdir.join(RECLONE_MARK)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// The pass

#[derive(Debug, Default, Clone)]
pub struct FsckOpts {
    pub force: bool,
    pub connectivity: bool,
    pub repack_all_quick: bool,
    pub repack_all_full: bool,
}

#[derive(Debug, Default)]
pub struct FsckSummary {
    pub checked: usize,
    pub repacked: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Accumulated findings for the end-of-pass report.
#[derive(Debug, Default)]
struct Report {
    warnings: Vec<String>,
    errors: Vec<String>,
}

impl Report {
    fn warn(&mut self, msg: String) {
        log::warn!("{}", msg);
        self.warnings.push(msg);
    }

    fn error(&mut self, msg: String) {
        log::error!("{}", msg);
        self.errors.push(msg);
    }

    fn is_empty(&self) -> bool {
        self.warnings.is_empty() && self.errors.is_empty()
    }
}

pub fn run_fsck_pass(config: &Config, git: &Git, opts: &FsckOpts) -> anyhow::Result<FsckSummary> {
    let toplevel = &config.core.toplevel;
    let manifest = Manifest::load_or_empty(&config.core.manifest)?;
    let mut status = FsckStatus::load_or_default(toplevel);
    let admin = ObjstoreAdmin::new(git, config.core.objstore_dir(), config.fsck.precious);
    let mut report = Report::default();
    let mut summary = FsckSummary::default();
    let now = epoch_now();
    // One jitter draw per pass keeps the full-repack schedule stable
    // within the pass while still de-synchronizing replicas.
    let jitter_days = rand::thread_rng().gen_range(-2..=2);

    let repo_keys: Vec<String> = manifest.repo_keys().cloned().collect();
    let gitdirs: Vec<PathBuf> = repo_keys
        .iter()
        .map(|k| gitdir_for(toplevel, k))
        .collect();

    // Fork discovery and objstore consolidation happen before the
    // per-repo maintenance loop, so repacks already see the alternates.
    consolidate_forks(config, git, &admin, &manifest, &mut report)?;

    for (key, gitdir) in repo_keys.iter().zip(&gitdirs) {
        if !gitdir.join("HEAD").exists() {
            report.warn(format!("{}: not on disk, skipping", key));
            summary.skipped += 1;
            continue;
        }
        if read_reclone_mark(gitdir).is_some() {
            log::info!("{}: marked for reclone, skipping maintenance", key);
            summary.skipped += 1;
            continue;
        }

        let _lock = match RepoLock::try_acquire(gitdir) {
            Ok(lock) => lock,
            Err(GrokError::LockBusy { .. }) => {
                report.warn(format!("{}: locked by another process, skipping", key));
                summary.skipped += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let t0 = std::time::Instant::now();
        let entry = status.entries.entry(key.clone()).or_default();
        if entry.nextcheck == 0 {
            entry.nextcheck = schedule_first_check(now, config.fsck.frequency);
            log::info!(
                "{}: first sight, fsck scheduled at {}",
                key,
                crate::utils::format_timestamp_iso8601(entry.nextcheck)
            );
        }

        if let Ok(true) = admin.heal_repack_sentinel(gitdir) {
            report.warn(format!("{}: healed crashed repack window", key));
        }

        let is_provider = objstore::is_alternates_provider(gitdir, &gitdirs);
        let is_member = objstore::read_alternates(gitdir)
            .map(|alt| alt.starts_with(config.core.objstore_dir()))
            .unwrap_or(false);

        let stats = collect_repo_stats(gitdir);
        let mut decision = repack_needed(&stats, entry, now, &config.fsck, jitter_days);
        if opts.repack_all_full {
            decision = RepackDecision::Full;
        } else if opts.repack_all_quick && decision == RepackDecision::None {
            decision = RepackDecision::Quick;
        }

        let mut repo_failed = false;
        if decision != RepackDecision::None {
            match run_repack(config, git, &admin, gitdir, decision, is_member, is_provider) {
                Ok(stderr) => {
                    summary.repacked += 1;
                    match decision {
                        RepackDecision::Full => {
                            entry.lastfullrepack = now;
                            entry.lastrepack = now;
                            entry.quick_repack_count = 0;
                        }
                        RepackDecision::Quick => {
                            entry.lastrepack = now;
                            entry.quick_repack_count += 1;
                        }
                        RepackDecision::None => unreachable!(),
                    }
                    check_for_corruption(config, gitdir, key, &stderr, &mut report);
                }
                Err(e) => {
                    report.error(format!("{}: repack failed: {}", key, e));
                    repo_failed = true;
                }
            }

            // Prune policy: alternates providers must keep objects that
            // borrowers may still reference.
            let expire = if is_provider {
                if config.fsck.precious != crate::config::Precious::No {
                    None
                } else {
                    Some("2.weeks.ago")
                }
            } else {
                Some(config.fsck.prune_expire.as_str())
            };
            if let Some(expire) = expire {
                if !is_member {
                    match git.prune(gitdir, expire) {
                        Ok(out) if !out.success() => {
                            check_for_corruption(config, gitdir, key, &out.stderr, &mut report);
                            report.error(format!("{}: prune failed: {}", key, out.stderr.trim()));
                        }
                        Ok(_) => {}
                        Err(e) => report.error(format!("{}: prune failed: {}", key, e)),
                    }
                }
            }

            if config.fsck.commitgraph {
                if let Ok(out) = git.commit_graph_write(gitdir) {
                    if !out.success() {
                        report.warn(format!(
                            "{}: commit-graph write failed: {}",
                            key,
                            out.stderr.trim()
                        ));
                    }
                }
            }
        }

        if fsck_due(entry, now, opts.force) {
            log::info!("{}: running fsck", key);
            match git.fsck(gitdir, opts.connectivity || config.fsck.connectivity) {
                Ok(out) => {
                    summary.checked += 1;
                    entry.lastcheck = now;
                    entry.nextcheck = now + config.fsck.frequency.max(1) * DAY;
                    if !out.success() {
                        report.error(format!("{}: fsck reported errors: {}", key, out.stderr.trim()));
                        repo_failed = true;
                    }
                    // git fsck splits its findings across both streams.
                    let transcript = format!("{}\n{}", out.stderr, out.stdout);
                    check_for_corruption(config, gitdir, key, &transcript, &mut report);
                }
                Err(e) => {
                    report.error(format!("{}: fsck failed: {}", key, e));
                    repo_failed = true;
                }
            }
        }

        entry.s_elapsed = t0.elapsed().as_secs();
        if repo_failed {
            summary.failed += 1;
        }
    }

    // Objstore repositories get their own maintenance, never pruned.
    for objstore_repo in admin.list_repos() {
        let _lock = match RepoLock::try_acquire(&objstore_repo) {
            Ok(lock) => lock,
            Err(_) => {
                summary.skipped += 1;
                continue;
            }
        };
        let key = objstore_repo.display().to_string();
        let entry = status.entries.entry(key.clone()).or_default();
        let stats = collect_repo_stats(&objstore_repo);
        let decision = repack_needed(&stats, entry, now, &config.fsck, jitter_days);
        if decision != RepackDecision::None {
            let full = decision == RepackDecision::Full;
            match admin.repack_objstore(&objstore_repo, full) {
                Ok(out) if out.success() => {
                    summary.repacked += 1;
                    entry.lastrepack = now;
                    if full {
                        entry.lastfullrepack = now;
                    }
                }
                Ok(out) => report.error(format!("{}: repack failed: {}", key, out.stderr.trim())),
                Err(e) => report.error(format!("{}: repack failed: {}", key, e)),
            }
        }
    }

    status.save(toplevel)?;

    if !report.is_empty() {
        if let Some(report_to) = &config.fsck.report_to {
            if let Err(e) = send_report(config, report_to, &report) {
                log::error!("could not send fsck report: {}", e);
            }
        }
    }

    Ok(summary)
}

/// Filesystem path of a manifest key under the toplevel.
pub fn gitdir_for(toplevel: &Path, key: &str) -> PathBuf {
    toplevel.join(key.trim_start_matches('/'))
}

fn check_for_corruption(config: &Config, gitdir: &Path, key: &str, stderr: &str, report: &mut Report) {
    if let Some(line) = match_reclone_errors(stderr, &config.fsck.reclone_on_errors) {
        report.error(format!("{}: corruption detected, marking for reclone: {}", key, line));
        if let Err(e) = write_reclone_mark(gitdir, &line) {
            report.error(format!("{}: could not write reclone mark: {}", key, e));
        }
    }
}

/// Run the chosen repack. Members are repacked through the objstore
/// admin so no objects remain locally; everyone else gets the classic
/// flag sets.
fn run_repack(
    config: &Config,
    git: &Git,
    admin: &ObjstoreAdmin,
    gitdir: &Path,
    decision: RepackDecision,
    is_member: bool,
    is_provider: bool,
) -> crate::error::Result<String> {
    if is_member {
        let out = admin.repack_member(gitdir)?;
        if !out.success() {
            return Err(GrokError::GitFailed {
                args: "repack -adlq".to_string(),
                code: out.exit,
                stderr: out.stderr,
            });
        }
        let _ = git.pack_refs(gitdir, true);
        return Ok(out.stderr);
    }

    let mut flags: Vec<String> = match decision {
        RepackDecision::Quick => vec!["-d", "-l", "-A", "-q"]
            .into_iter()
            .map(String::from)
            .collect(),
        RepackDecision::Full => {
            let mut flags: Vec<String> = vec!["-f", "-d", "-l", "-A", "-q"]
                .into_iter()
                .map(String::from)
                .collect();
            // Bitmaps only help repos nobody borrows objects from.
            if !is_provider {
                flags.push("-b".to_string());
                git.config_set(gitdir, "pack.writeBitmaps", "true")?;
            }
            flags.extend(config.fsck.extra_repack_flags_full.iter().cloned());
            flags
        }
        RepackDecision::None => return Ok(String::new()),
    };
    if let Some(max) = &config.fsck.max_pack_size {
        flags.push(format!("--max-pack-size={}", max));
    }
    flags.extend(config.fsck.extra_repack_flags.iter().cloned());

    let flag_refs: Vec<&str> = flags.iter().map(String::as_str).collect();
    let out = git.repack(gitdir, &flag_refs, decision == RepackDecision::Full)?;
    if !out.success() {
        return Err(GrokError::GitFailed {
            args: format!("repack {}", flags.join(" ")),
            code: out.exit,
            stderr: out.stderr,
        });
    }
    let _ = git.pack_refs(gitdir, true);
    Ok(out.stderr)
}

/// Discover fork families and consolidate them into objstores.
fn consolidate_forks(
    config: &Config,
    git: &Git,
    admin: &ObjstoreAdmin,
    manifest: &Manifest,
    report: &mut Report,
) -> anyhow::Result<()> {
    let toplevel = &config.core.toplevel;
    let objstore_dir = config.core.objstore_dir();

    let mut roots_by_repo: HashMap<String, Vec<String>> = HashMap::new();
    for key in manifest.repo_keys() {
        let gitdir = gitdir_for(toplevel, key);
        if !gitdir.join("HEAD").exists() {
            continue;
        }
        match git.rev_list_roots(&gitdir) {
            Ok(roots) => {
                roots_by_repo.insert(key.clone(), roots);
            }
            Err(e) => report.warn(format!("{}: could not list root commits: {}", key, e)),
        }
    }

    for family in objstore::find_fork_families(&roots_by_repo) {
        // Reuse the objstore a member already belongs to, if any.
        let existing = family.iter().find_map(|key| {
            let alt = objstore::read_alternates(&gitdir_for(toplevel, key))?;
            if alt.starts_with(&objstore_dir) {
                alt.parent().map(Path::to_path_buf)
            } else {
                None
            }
        });
        let (_forkgroup, objstore_repo) = match existing {
            Some(repo) => match ObjstoreAdmin::forkgroup_of(&repo) {
                Some(fg) => (fg, repo),
                None => continue,
            },
            None => {
                let fg = admin.new_forkgroup();
                let repo = match admin.ensure_repo(&fg) {
                    Ok(repo) => repo,
                    Err(e) => {
                        report.error(format!("objstore create failed for {:?}: {}", family, e));
                        continue;
                    }
                };
                log::info!("new objstore {} for family {:?}", fg, family);
                (fg, repo)
            }
        };

        let mut siblings = Vec::new();
        for key in &family {
            let gitdir = gitdir_for(toplevel, key);
            match admin.ensure_member(&objstore_repo, &gitdir, key) {
                Ok(sib) => siblings.push(sib),
                Err(e) => report.error(format!("{}: objstore membership failed: {}", key, e)),
            }
        }

        // Fetching members into the objstore is safe to parallelize:
        // each fetch only touches its own remote's virtual namespace.
        let threads = config.pull.threads();
        let fetch_errors: Vec<String> = if threads > 1 {
            siblings
                .par_iter()
                .filter_map(|sib| {
                    admin
                        .fetch_member(&objstore_repo, sib)
                        .err()
                        .map(|e| format!("objstore fetch {} failed: {}", sib, e))
                })
                .collect()
        } else {
            siblings
                .iter()
                .filter_map(|sib| {
                    admin
                        .fetch_member(&objstore_repo, sib)
                        .err()
                        .map(|e| format!("objstore fetch {} failed: {}", sib, e))
                })
                .collect()
        };
        for err in fetch_errors {
            report.error(err);
        }
    }

    // Legacy 1.x alternates: anything pointing outside the objstore
    // directory gets migrated into a proper family.
    for key in manifest.repo_keys() {
        let gitdir = gitdir_for(toplevel, key);
        let Some(alt) = objstore::read_alternates(&gitdir) else {
            continue;
        };
        if alt.starts_with(&objstore_dir) {
            continue;
        }
        let Some(provider_gitdir) = alt.parent().map(Path::to_path_buf) else {
            continue;
        };
        let provider_key = match provider_gitdir.strip_prefix(toplevel) {
            Ok(rel) => format!("/{}", rel.display()),
            Err(_) => {
                report.warn(format!(
                    "{}: legacy alternates outside toplevel, leaving alone",
                    key
                ));
                continue;
            }
        };
        let forkgroup = admin.new_forkgroup();
        match admin.migrate_legacy(&gitdir, key, &provider_gitdir, &provider_key, &forkgroup) {
            Ok(repo) => log::info!("{}: migrated legacy alternates into {}", key, repo.display()),
            Err(e) => report.error(format!("{}", e)),
        }
    }

    Ok(())
}

/// Mail the accumulated report through the local sendmail, the
/// lowest-common-denominator transport on mirror hosts.
fn send_report(config: &Config, report_to: &str, report: &Report) -> std::io::Result<()> {
    let from = config
        .fsck
        .report_from
        .as_deref()
        .unwrap_or("grokmirror@localhost");
    let mut body = String::new();
    body.push_str(&format!("To: {}\n", report_to));
    body.push_str(&format!("From: {}\n", from));
    body.push_str("Subject: grok-fsck report\n\n");
    if !report.errors.is_empty() {
        body.push_str("Errors:\n");
        for line in &report.errors {
            body.push_str(&format!("  {}\n", line));
        }
        body.push('\n');
    }
    if !report.warnings.is_empty() {
        body.push_str("Warnings:\n");
        for line in &report.warnings {
            body.push_str(&format!("  {}\n", line));
        }
    }

    let mut child = Command::new("sendmail")
        .arg("-t")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(body.as_bytes())?;
    }
    let status = child.wait()?;
    if !status.success() {
        return Err(std::io::Error::other("sendmail exited non-zero"));
    }
    Ok(())
}
