//! Object storage for fork families.
//!
//! Repositories that share a root commit are forks of each other and can
//! share object storage: one bare "objstore" repository holds every
//! member's objects, members point at it through
//! `objects/info/alternates`, and member repacks then keep nothing
//! locally. The objstore tracks each member as a remote named by the
//! member's sibling id, fetching into a `refs/virtual/<sib>/*` namespace
//! so delta islands can keep per-member clones tight.
//!
//! Nothing in here decides *when* any of this happens; fork discovery
//! runs inside fsck and membership wiring is invoked from both fsck and
//! pull.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::Rng;
use sha1::{Digest, Sha1};

use crate::config::Precious;
use crate::error::{GrokError, Result};
use crate::git::Git;

/// Sentinel marking an in-progress member repack window. If a repack
/// crashes between disabling and restoring `preciousObjects`, the next
/// fsck pass finds this file and restores the setting.
pub const REPACK_SENTINEL: &str = "grokmirror.repack";

/// Sibling id of a manifest path: `sha1(path)[:12]`.
///
/// Stable across replicas because it hashes the toplevel-relative
/// manifest key, not any local filesystem path.
pub fn sibling_id(manifest_path: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(manifest_path.as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}

/// Group repositories into fork families by root-commit identity.
///
/// Each repository is keyed by its lexicographically smallest root
/// commit; classes with at least two members are families. Repositories
/// with no commits never join a family.
pub fn find_fork_families(
    roots_by_repo: &HashMap<String, Vec<String>>,
) -> Vec<Vec<String>> {
    let mut classes: HashMap<&str, Vec<&str>> = HashMap::new();
    for (repo, roots) in roots_by_repo {
        if let Some(smallest) = roots.iter().min() {
            classes.entry(smallest.as_str()).or_default().push(repo.as_str());
        }
    }
    let mut families: Vec<Vec<String>> = classes
        .into_values()
        .filter(|members| members.len() >= 2)
        .map(|mut members| {
            members.sort();
            members.into_iter().map(String::from).collect()
        })
        .collect();
    families.sort();
    families
}

/// Single-line alternates target of a repository, if wired.
pub fn read_alternates(gitdir: &Path) -> Option<PathBuf> {
    let raw = fs::read_to_string(gitdir.join("objects/info/alternates")).ok()?;
    let line = raw.lines().find(|l| !l.trim().is_empty())?;
    Some(PathBuf::from(line.trim()))
}

/// Point a repository's alternates at `objects_dir`. The file is tiny;
/// a rename keeps concurrent readers off a half-written path.
pub fn set_alternates(gitdir: &Path, objects_dir: &Path) -> Result<()> {
    let info = gitdir.join("objects/info");
    fs::create_dir_all(&info)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&info)?;
    writeln!(tmp, "{}", objects_dir.display())?;
    tmp.as_file().sync_all()?;
    tmp.persist(info.join("alternates"))
        .map_err(|e| GrokError::Io(e.error))?;
    Ok(())
}

/// Resolve the full alternates chain of `gitdir` to realpaths.
pub fn alternates_chain(gitdir: &Path) -> Vec<PathBuf> {
    let mut chain = Vec::new();
    let mut cursor = gitdir.to_path_buf();
    // Alternates-of-alternates; bounded to keep a cycle from spinning.
    for _ in 0..10 {
        let Some(target) = read_alternates(&cursor) else {
            break;
        };
        let Ok(real) = fs::canonicalize(&target) else {
            break;
        };
        chain.push(real.clone());
        // The target is an objects dir; its owning repo is the parent.
        match real.parent() {
            Some(repo) => cursor = repo.to_path_buf(),
            None => break,
        }
    }
    chain
}

/// True when some *other* repository's resolved alternates chain
/// references `gitdir`'s objects. Such a repository must not be deleted.
pub fn is_alternates_provider(gitdir: &Path, all_gitdirs: &[PathBuf]) -> bool {
    let Ok(own_objects) = fs::canonicalize(gitdir.join("objects")) else {
        return false;
    };
    all_gitdirs
        .iter()
        .filter(|other| other.as_path() != gitdir)
        .any(|other| alternates_chain(other).contains(&own_objects))
}

/// Administration of one toplevel's objstore directory.
pub struct ObjstoreAdmin<'a> {
    git: &'a Git,
    objstore_dir: PathBuf,
    precious: Precious,
}

impl<'a> ObjstoreAdmin<'a> {
    pub fn new(git: &'a Git, objstore_dir: PathBuf, precious: Precious) -> Self {
        ObjstoreAdmin {
            git,
            objstore_dir,
            precious,
        }
    }

    pub fn repo_path(&self, forkgroup: &str) -> PathBuf {
        self.objstore_dir.join(format!("{}.git", forkgroup))
    }

    /// Forkgroup GUID of an objstore repo path (`<guid>.git`).
    pub fn forkgroup_of(path: &Path) -> Option<String> {
        let name = path.file_name()?.to_string_lossy();
        name.strip_suffix(".git").map(String::from)
    }

    /// Create (or adopt) the objstore repository for a forkgroup.
    pub fn ensure_repo(&self, forkgroup: &str) -> Result<PathBuf> {
        let path = self.repo_path(forkgroup);
        if !path.join("HEAD").exists() {
            fs::create_dir_all(&self.objstore_dir)?;
            self.git.init_bare(&path)?;
        }
        let g = self.git;
        g.config_set(&path, "extensions.preciousObjects", "true")?;
        g.config_set(&path, "gc.auto", "0")?;
        g.config_set(&path, "fetch.writeCommitGraph", "true")?;
        g.config_set(&path, "repack.useDeltaIslands", "true")?;
        g.config_set(&path, "pack.island", "refs/virtual/([0-9a-f]+)/")?;
        Ok(path)
    }

    /// Pick a fresh forkgroup GUID: 12 hex chars, collision-checked
    /// against the objstore directory.
    pub fn new_forkgroup(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let guid = format!("{:012x}", rng.gen::<u64>() & 0xffff_ffff_ffff);
            if !self.repo_path(&guid).exists() {
                return guid;
            }
        }
    }

    /// Wire one member into an objstore repository: remote on the
    /// objstore side, alternates + gc policy on the member side.
    pub fn ensure_member(
        &self,
        objstore_repo: &Path,
        member_gitdir: &Path,
        member_key: &str,
    ) -> Result<String> {
        let sib = sibling_id(member_key);
        let g = self.git;

        let existing = g.config_get(objstore_repo, &format!("remote.{}.url", sib))?;
        if existing.is_none() {
            let url = member_gitdir.to_string_lossy();
            g.remote_add(objstore_repo, &sib, &url)?;
        }
        g.config_set(
            objstore_repo,
            &format!("remote.{}.fetch", sib),
            &format!("+refs/*:refs/virtual/{}/*", sib),
        )?;
        g.config_set(objstore_repo, &format!("remote.{}.tagOpt", sib), "--no-tags")?;

        let objects = fs::canonicalize(objstore_repo.join("objects"))?;
        set_alternates(member_gitdir, &objects)?;
        g.config_set(member_gitdir, "gc.auto", "0")?;
        if self.precious != Precious::No && !member_gitdir.join(REPACK_SENTINEL).exists() {
            g.config_set(member_gitdir, "extensions.preciousObjects", "true")?;
        }
        Ok(sib)
    }

    /// Pull one member's refs into the objstore's virtual namespace.
    pub fn fetch_member(&self, objstore_repo: &Path, sibling: &str) -> Result<()> {
        let out = self.git.fetch(objstore_repo, sibling, &[], false)?;
        if !out.success() {
            return Err(GrokError::GitFailed {
                args: format!("fetch {}", sibling),
                code: out.exit,
                stderr: out.stderr,
            });
        }
        Ok(())
    }

    /// Fetch an origin URL straight into the objstore's virtual
    /// namespace for a member, bypassing the member repository. Used by
    /// the pull engine when `core.objstore-uses-plumbing` is set.
    pub fn fetch_remote_into(&self, objstore_repo: &Path, member_key: &str, url: &str) -> Result<()> {
        let sib = sibling_id(member_key);
        let refspec = format!("+refs/*:refs/virtual/{}/*", sib);
        let out = self.git.fetch(objstore_repo, url, &[&refspec], false)?;
        if !out.success() {
            return Err(GrokError::GitFailed {
                args: format!("fetch {} {}", url, refspec),
                code: out.exit,
                stderr: out.stderr,
            });
        }
        Ok(())
    }

    /// Refresh a member's refs from the objstore's virtual namespace
    /// (the second half of the plumbing path).
    pub fn update_member_from(&self, objstore_repo: &Path, member_gitdir: &Path, member_key: &str) -> Result<()> {
        let sib = sibling_id(member_key);
        let url = objstore_repo.to_string_lossy();
        let refspec = format!("+refs/virtual/{}/*:refs/*", sib);
        let out = self.git.fetch(member_gitdir, &url, &[&refspec], true)?;
        if !out.success() {
            return Err(GrokError::GitFailed {
                args: format!("fetch {} {}", url, refspec),
                code: out.exit,
                stderr: out.stderr,
            });
        }
        Ok(())
    }

    /// Drop a member remote; the objstore itself becomes deletable when
    /// no remotes remain.
    pub fn remove_member(&self, objstore_repo: &Path, member_key: &str) -> Result<()> {
        let sib = sibling_id(member_key);
        if self
            .git
            .config_get(objstore_repo, &format!("remote.{}.url", sib))?
            .is_some()
        {
            self.git.remote_remove(objstore_repo, &sib)?;
        }
        Ok(())
    }

    pub fn is_deletable(&self, objstore_repo: &Path) -> Result<bool> {
        Ok(self.git.remote_list(objstore_repo)?.is_empty())
    }

    /// Repack a member so no objects remain outside the alternate.
    ///
    /// `preciousObjects` blocks `repack -d`, so it is dropped for the
    /// duration and restored afterwards; the sentinel file marks the
    /// window so a crash can be repaired by the next fsck pass. Under
    /// `precious = always` the setting is never touched and `-d` is
    /// skipped, which keeps every object at the cost of never cleaning
    /// loose ones.
    pub fn repack_member(&self, member_gitdir: &Path) -> Result<crate::git::GitOutput> {
        let g = self.git;
        if self.precious == Precious::Always {
            return g.repack(member_gitdir, &["-a", "-l", "-q"], false);
        }
        let toggle = self.precious == Precious::Yes;
        if toggle {
            fs::write(member_gitdir.join(REPACK_SENTINEL), b"")?;
            g.config_set(member_gitdir, "extensions.preciousObjects", "false")?;
        }
        let out = g.repack(member_gitdir, &["-a", "-d", "-l", "-q"], false);
        if toggle {
            g.config_set(member_gitdir, "extensions.preciousObjects", "true")?;
            let _ = fs::remove_file(member_gitdir.join(REPACK_SENTINEL));
        }
        out
    }

    /// Repair a crashed repack window found by fsck.
    pub fn heal_repack_sentinel(&self, member_gitdir: &Path) -> Result<bool> {
        if !member_gitdir.join(REPACK_SENTINEL).exists() {
            return Ok(false);
        }
        if self.precious != Precious::No {
            self.git
                .config_set(member_gitdir, "extensions.preciousObjects", "true")?;
        }
        fs::remove_file(member_gitdir.join(REPACK_SENTINEL))?;
        Ok(true)
    }

    /// Migrate a repository off a legacy 1.x alternates link onto a
    /// proper objstore. Never leaves the alternates half-rewritten: the
    /// objstore is fully populated before the member is repointed.
    pub fn migrate_legacy(
        &self,
        member_gitdir: &Path,
        member_key: &str,
        provider_gitdir: &Path,
        provider_key: &str,
        forkgroup: &str,
    ) -> Result<PathBuf> {
        let fail = |reason: String| GrokError::ObjstoreMigration {
            repo: member_gitdir.to_path_buf(),
            reason,
        };

        let objstore_repo = self.ensure_repo(forkgroup).map_err(|e| fail(e.to_string()))?;

        // Populate from the provider first: the member's objects are
        // incomplete without its alternate, so order matters.
        let sib_provider = self
            .ensure_member(&objstore_repo, provider_gitdir, provider_key)
            .map_err(|e| fail(e.to_string()))?;
        self.fetch_member(&objstore_repo, &sib_provider)
            .map_err(|e| fail(e.to_string()))?;

        let sib_member = sibling_id(member_key);
        let g = self.git;
        if g.config_get(&objstore_repo, &format!("remote.{}.url", sib_member))?
            .is_none()
        {
            let url = member_gitdir.to_string_lossy();
            g.remote_add(&objstore_repo, &sib_member, &url)
                .map_err(|e| fail(e.to_string()))?;
        }
        g.config_set(
            &objstore_repo,
            &format!("remote.{}.fetch", sib_member),
            &format!("+refs/*:refs/virtual/{}/*", sib_member),
        )?;
        g.config_set(&objstore_repo, &format!("remote.{}.tagOpt", sib_member), "--no-tags")?;
        self.fetch_member(&objstore_repo, &sib_member)
            .map_err(|e| fail(e.to_string()))?;

        // Only now drop the legacy link.
        let objects = fs::canonicalize(objstore_repo.join("objects"))?;
        set_alternates(member_gitdir, &objects).map_err(|e| fail(e.to_string()))?;
        g.config_set(member_gitdir, "gc.auto", "0")?;
        set_alternates(provider_gitdir, &objects).map_err(|e| fail(e.to_string()))?;
        g.config_set(provider_gitdir, "gc.auto", "0")?;

        Ok(objstore_repo)
    }

    /// Repack the objstore itself with delta islands. The objstore
    /// always carries `preciousObjects`, so the same toggle-and-sentinel
    /// dance as member repacks applies.
    pub fn repack_objstore(&self, objstore_repo: &Path, full: bool) -> Result<crate::git::GitOutput> {
        if self.precious == Precious::Always {
            let flags: &[&str] = if full {
                &["-f", "-a", "-b", "-q", "--delta-islands"]
            } else {
                &["-a", "-q", "--delta-islands"]
            };
            return self.git.repack(objstore_repo, flags, full);
        }
        let flags: &[&str] = if full {
            &["-f", "-a", "-d", "-b", "-q", "--delta-islands"]
        } else {
            &["-a", "-d", "-q", "--delta-islands"]
        };
        fs::write(objstore_repo.join(REPACK_SENTINEL), b"")?;
        self.git
            .config_set(objstore_repo, "extensions.preciousObjects", "false")?;
        let out = self.git.repack(objstore_repo, flags, full);
        self.git
            .config_set(objstore_repo, "extensions.preciousObjects", "true")?;
        let _ = fs::remove_file(objstore_repo.join(REPACK_SENTINEL));
        out
    }

    /// All objstore repositories currently on disk.
    pub fn list_repos(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.objstore_dir) else {
            return Vec::new();
        };
        let mut repos: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "git") && p.join("HEAD").exists())
            .collect();
        repos.sort();
        repos
    }

    /// Remove an objstore repository that no longer has members.
    pub fn delete_repo(&self, objstore_repo: &Path) -> Result<()> {
        if !self.is_deletable(objstore_repo)? {
            return Err(GrokError::ObjstoreMigration {
                repo: objstore_repo.to_path_buf(),
                reason: "objstore still has member remotes".to_string(),
            });
        }
        fs::remove_dir_all(objstore_repo)?;
        Ok(())
    }
}
