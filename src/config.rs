//! Configuration for the mirroring engine.
//!
//! A single TOML file with four sections, loaded once at startup:
//!
//! - `[core]`: where repositories live and how git is invoked
//! - `[remote]`: the origin being mirrored
//! - `[pull]`: replication engine tuning and hooks
//! - `[fsck]`: maintenance pass scheduling and repack thresholds
//!
//! Every field has a default, so a minimal replica config is just
//! `core.toplevel` plus `remote.site`/`remote.manifest`. Unknown keys are
//! collected and surfaced as startup warnings rather than silently
//! dropped or rejected, so typos are visible but old configs keep
//! working.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use serde::Deserialize;

/// How aggressively objstore members protect shared objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Precious {
    /// `extensions.preciousObjects` is set, but temporarily dropped
    /// around repacks so loose objects can be cleaned.
    #[default]
    Yes,
    /// Never set `preciousObjects`.
    No,
    /// Keep `preciousObjects` on at all times, at the cost of never
    /// cleaning loose objects in members.
    Always,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CoreConfig {
    /// Directory under which all mirrored repositories are created.
    pub toplevel: PathBuf,
    /// Path of the local manifest. A `.gz` suffix selects gzip output.
    pub manifest: PathBuf,
    /// Where shared fork-family repositories live.
    /// Defaults to `<toplevel>/objstore`.
    pub objstore: Option<PathBuf>,
    /// Fetch remote refs directly into the objstore repository instead of
    /// going through the member.
    pub objstore_uses_plumbing: bool,
    /// Refs matching any of these regular expressions are excluded from
    /// fingerprints (e.g. `^refs/meta/`).
    pub ignore_refs: Vec<String>,
    /// Override for the git binary. `GITBIN` in the environment wins over
    /// this, which wins over `$PATH`.
    pub gitbin: Option<PathBuf>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, toml::Value>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            toplevel: PathBuf::from("/var/lib/git/mirror"),
            manifest: PathBuf::from("/var/lib/git/mirror/manifest.js.gz"),
            objstore: None,
            objstore_uses_plumbing: false,
            ignore_refs: Vec::new(),
            gitbin: None,
            unknown: BTreeMap::new(),
        }
    }
}

impl CoreConfig {
    /// Effective objstore directory.
    pub fn objstore_dir(&self) -> PathBuf {
        self.objstore
            .clone()
            .unwrap_or_else(|| self.toplevel.join("objstore"))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RemoteConfig {
    /// Base URL repositories are cloned from; the manifest key is appended
    /// verbatim (keys start with `/`).
    pub site: String,
    /// URL (or filesystem path) of the remote manifest.
    pub manifest: String,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PullConfig {
    /// Worker pool size. 0 means one per CPU, capped at 10.
    pub pull_threads: usize,
    /// Seconds between manifest checks in daemon mode.
    pub refresh: u64,
    /// Unix-domain socket accepting newline-terminated repository paths
    /// for priority fetching. Daemon mode only.
    pub socket: Option<PathBuf>,
    /// Remove local repositories that disappeared from the remote
    /// manifest.
    pub purge: bool,
    /// Fraction of manifest entries that a single pass may remove without
    /// `--force-purge`.
    pub purge_quorum: f64,
    /// Removals at or below this absolute count are always allowed, so
    /// small mirrors aren't stuck behind the quorum fraction.
    pub purge_threshold: usize,
    /// Attempts per repository before a network failure is surfaced.
    pub retries: u32,
    /// Seconds to wait for in-flight workers after SIGTERM/SIGINT.
    pub shutdown_grace: u64,
    /// Cosmetic owner recorded on cloned repositories when the manifest
    /// entry carries none.
    pub default_owner: Option<String>,
    /// Run once per changed repository, argv = `[<repo-path>]`.
    pub post_update_hook: Option<String>,
    /// Run once per pass if any new clone succeeded, no args.
    pub post_clone_complete_hook: Option<String>,
    /// Run at the end of every pass regardless of work.
    pub post_work_complete_hook: Option<String>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, toml::Value>,
}

impl Default for PullConfig {
    fn default() -> Self {
        PullConfig {
            pull_threads: 0,
            refresh: 300,
            socket: None,
            purge: false,
            purge_quorum: 0.05,
            purge_threshold: 5,
            retries: 3,
            shutdown_grace: 60,
            default_owner: None,
            post_update_hook: None,
            post_clone_complete_hook: None,
            post_work_complete_hook: None,
            unknown: BTreeMap::new(),
        }
    }
}

impl PullConfig {
    /// Resolved worker pool size.
    pub fn threads(&self) -> usize {
        if self.pull_threads > 0 {
            return self.pull_threads;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cpus.min(10)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FsckConfig {
    /// Days between full fsck runs of any one repository.
    pub frequency: u64,
    /// Quick repack once this many loose objects accumulate.
    pub loose_obj_threshold: usize,
    /// Quick repack once this many packs accumulate.
    pub packs_threshold: usize,
    /// Days between full (`-f -b`) repacks. Jittered ±2 days so a fleet
    /// of replicas doesn't repack in lockstep.
    pub full_repack_every: u64,
    /// Passed to `git repack --max-pack-size`.
    pub max_pack_size: Option<String>,
    /// Extra flags appended to quick repacks.
    pub extra_repack_flags: Vec<String>,
    /// Extra flags appended to full repacks only.
    pub extra_repack_flags_full: Vec<String>,
    /// Write commit-graph files after repacking.
    pub commitgraph: bool,
    /// `--expire` value for `git prune`.
    pub prune_expire: String,
    /// Run `git fsck --connectivity-only`.
    pub connectivity: bool,
    /// `preciousObjects` policy for objstore members.
    pub precious: Precious,
    /// Substrings of git stderr that mark a repository for reclone.
    pub reclone_on_errors: Vec<String>,
    /// Mail the accumulated warnings and repack transcripts here.
    pub report_to: Option<String>,
    /// Sender address for the report.
    pub report_from: Option<String>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, toml::Value>,
}

pub fn default_reclone_on_errors() -> Vec<String> {
    [
        "fatal: bad object",
        "fatal: bad tree",
        "missing blob",
        "missing tree",
        "broken link",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for FsckConfig {
    fn default() -> Self {
        FsckConfig {
            frequency: 30,
            loose_obj_threshold: 1200,
            packs_threshold: 20,
            full_repack_every: 65,
            max_pack_size: None,
            extra_repack_flags: Vec::new(),
            extra_repack_flags_full: Vec::new(),
            commitgraph: true,
            prune_expire: "now".to_string(),
            connectivity: false,
            precious: Precious::Yes,
            reclone_on_errors: default_reclone_on_errors(),
            report_to: None,
            report_from: None,
            unknown: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub core: CoreConfig,
    pub remote: RemoteConfig,
    pub pull: PullConfig,
    pub fsck: FsckConfig,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, toml::Value>,
}

impl Config {
    /// Load and validate a config file.
    ///
    /// Fails on unreadable files, TOML syntax errors, and invalid values;
    /// unknown keys only warn.
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Config> {
        let mut config: Config = toml::from_str(raw)?;
        config.expand_paths();
        config.validate()?;
        for key in config.unknown_keys() {
            log::warn!("unknown config key: {}", key);
        }
        Ok(config)
    }

    /// Default config location when `-c` is not given.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("grokmirror")
            .join("grokmirror.toml")
    }

    fn expand_paths(&mut self) {
        self.core.toplevel = expand_tilde(&self.core.toplevel);
        self.core.manifest = expand_tilde(&self.core.manifest);
        if let Some(p) = &self.core.objstore {
            self.core.objstore = Some(expand_tilde(p));
        }
        if let Some(p) = &self.pull.socket {
            self.pull.socket = Some(expand_tilde(p));
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.core.toplevel.is_absolute() {
            bail!("core.toplevel must be an absolute path");
        }
        if !(0.0..=1.0).contains(&self.pull.purge_quorum) {
            bail!("pull.purge-quorum must be between 0 and 1");
        }
        if self.pull.refresh == 0 {
            bail!("pull.refresh must be non-zero");
        }
        for pat in &self.core.ignore_refs {
            regex::Regex::new(pat)
                .with_context(|| format!("bad core.ignore-refs pattern {:?}", pat))?;
        }
        Ok(())
    }

    /// Dotted paths of all unrecognized keys, for startup warnings.
    pub fn unknown_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for k in self.unknown.keys() {
            keys.push(k.clone());
        }
        for (section, map) in [
            ("core", &self.core.unknown),
            ("remote", &self.remote.unknown),
            ("pull", &self.pull.unknown),
            ("fsck", &self.fsck.unknown),
        ] {
            for k in map.keys() {
                keys.push(format!("{}.{}", section, k));
            }
        }
        keys
    }

    /// Compiled `core.ignore-refs` patterns. Validation has already
    /// checked the syntax.
    pub fn ignore_ref_patterns(&self) -> Vec<regex::Regex> {
        self.core
            .ignore_refs
            .iter()
            .filter_map(|p| regex::Regex::new(p).ok())
            .collect()
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(s.as_ref()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[core]
toplevel = "/srv/mirror"
manifest = "/srv/mirror/manifest.js.gz"

[remote]
site = "https://git.example.org"
manifest = "https://git.example.org/manifest.js.gz"
"#;

    #[test]
    fn test_minimal_config() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.core.toplevel, PathBuf::from("/srv/mirror"));
        assert_eq!(config.pull.refresh, 300);
        assert_eq!(config.pull.purge_quorum, 0.05);
        assert_eq!(config.fsck.frequency, 30);
        assert_eq!(config.fsck.loose_obj_threshold, 1200);
        assert_eq!(config.fsck.packs_threshold, 20);
        assert!(config.fsck.commitgraph);
        assert_eq!(config.fsck.precious, Precious::Yes);
        assert!(config.unknown_keys().is_empty());
    }

    #[test]
    fn test_objstore_dir_default() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(
            config.core.objstore_dir(),
            PathBuf::from("/srv/mirror/objstore")
        );
    }

    #[test]
    fn test_unknown_keys_warn_not_fail() {
        let raw = format!("{}\n[pull]\nrefres = 60\n", MINIMAL);
        let config = Config::parse(&raw).unwrap();
        assert_eq!(config.unknown_keys(), vec!["pull.refres".to_string()]);
        // The typo'd key must not have touched the real one.
        assert_eq!(config.pull.refresh, 300);
    }

    #[test]
    fn test_unknown_section_warns() {
        let raw = format!("{}\n[pi-piper]\nenabled = true\n", MINIMAL);
        let config = Config::parse(&raw).unwrap();
        assert_eq!(config.unknown_keys(), vec!["pi-piper".to_string()]);
    }

    #[test]
    fn test_relative_toplevel_rejected() {
        let raw = MINIMAL.replace("/srv/mirror\"", "srv/mirror\"");
        assert!(Config::parse(&raw).is_err());
    }

    #[test]
    fn test_bad_quorum_rejected() {
        let raw = format!("{}\n[pull]\npurge-quorum = 1.5\n", MINIMAL);
        assert!(Config::parse(&raw).is_err());
    }

    #[test]
    fn test_bad_ignore_refs_pattern_rejected() {
        let raw = MINIMAL.replace(
            "manifest = \"/srv/mirror/manifest.js.gz\"",
            "manifest = \"/srv/mirror/manifest.js.gz\"\nignore-refs = [\"([\"]",
        );
        assert!(Config::parse(&raw).is_err());
    }

    #[test]
    fn test_precious_values() {
        let raw = format!("{}\n[fsck]\nprecious = \"always\"\n", MINIMAL);
        let config = Config::parse(&raw).unwrap();
        assert_eq!(config.fsck.precious, Precious::Always);
    }

    #[test]
    fn test_threads_capped() {
        let config = Config::parse(MINIMAL).unwrap();
        assert!(config.pull.threads() >= 1);
        assert!(config.pull.threads() <= 10);
    }

    #[test]
    fn test_reclone_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert!(
            config
                .fsck
                .reclone_on_errors
                .iter()
                .any(|s| s == "fatal: bad object")
        );
    }
}
