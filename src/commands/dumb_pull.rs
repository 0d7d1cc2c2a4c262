//! `grok dumb-pull`: update explicitly named mirrors without a
//! manifest. Meant for cron-driven setups mirroring a handful of repos;
//! the exit code tells wrappers whether anything moved (127 = stale).

use std::path::Path;

use grokmirror::config::Config;
use grokmirror::error::GrokError;
use grokmirror::git::{FETCH_TIMEOUT, Git};
use grokmirror::lock::RepoLock;
use grokmirror::manifest::fingerprint_refs;

use super::{EXIT_PARTIAL, EXIT_STALE};

pub fn handle_dumb_pull(
    config: &Config,
    prune: bool,
    remote: &str,
    dirs: &[std::path::PathBuf],
) -> anyhow::Result<i32> {
    let git = Git::new(config.core.gitbin.as_deref())?;
    let mut changed = false;
    let mut failed = 0usize;

    for dir in dirs {
        match update_one(config, &git, dir, remote, prune) {
            Ok(true) => changed = true,
            Ok(false) => {}
            Err(e) => {
                log::error!("{}: {}", dir.display(), e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        Ok(EXIT_PARTIAL)
    } else if changed {
        Ok(0)
    } else {
        Ok(EXIT_STALE)
    }
}

/// Returns whether the repository's refs changed.
fn update_one(
    config: &Config,
    git: &Git,
    gitdir: &Path,
    remote: &str,
    prune: bool,
) -> grokmirror::Result<bool> {
    if !gitdir.join("HEAD").exists() {
        return Err(GrokError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "not a git repository",
        )));
    }
    let _lock = RepoLock::try_acquire(gitdir)?;

    let ignore = config.ignore_ref_patterns();
    let before = fingerprint_refs(&git.show_ref(gitdir)?, &ignore);

    let mut args = vec!["remote", "update", remote];
    if prune {
        args.push("--prune");
    }
    let out = git.run(Some(gitdir), &args, &[], None, FETCH_TIMEOUT)?;
    if !out.success() {
        return Err(GrokError::GitFailed {
            args: args.join(" "),
            code: out.exit,
            stderr: out.stderr,
        });
    }

    let after = fingerprint_refs(&git.show_ref(gitdir)?, &ignore);
    let changed = before != after;
    if changed {
        // Dumb HTTP consumers need the info files refreshed.
        if gitdir.join("info").exists() {
            let _ = git.update_server_info(gitdir);
        }
        if let Some(hook) = &config.pull.post_update_hook {
            let path = gitdir.to_string_lossy();
            log::debug!("$ {} {}", hook, path);
            if let Err(e) = std::process::Command::new(hook).arg(path.as_ref()).status() {
                log::warn!("hook {} failed to run: {}", hook, e);
            }
        }
        log::info!("{}: updated", gitdir.display());
    } else {
        log::debug!("{}: no change", gitdir.display());
    }
    Ok(changed)
}
