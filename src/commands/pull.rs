//! `grok pull`: the replication engine.

use grokmirror::config::Config;
use grokmirror::git::Git;
use grokmirror::pull::{PullEngine, PullOpts};

use super::EXIT_PARTIAL;

pub fn handle_pull(config: &Config, daemon: bool, force_purge: bool) -> anyhow::Result<i32> {
    let git = Git::new(config.core.gitbin.as_deref())?;
    let engine = PullEngine::new(config.clone(), git)?;
    let opts = PullOpts {
        once: !daemon,
        force_purge,
    };
    let summary = engine.run(&opts)?;
    if summary.purge_refused {
        log::warn!("purges were refused by the quorum; re-run with --force-purge to override");
    }
    if summary.failed > 0 {
        eprintln!("{}", summary.one_line());
        return Ok(EXIT_PARTIAL);
    }
    Ok(0)
}
