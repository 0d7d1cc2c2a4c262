//! `grok fsck`: repository health checks and repacks.

use grokmirror::config::Config;
use grokmirror::fsck::{FsckOpts, run_fsck_pass};
use grokmirror::git::Git;

use super::EXIT_PARTIAL;

pub fn handle_fsck(
    config: &Config,
    force: bool,
    connectivity: bool,
    repack_all_quick: bool,
    repack_all_full: bool,
) -> anyhow::Result<i32> {
    let git = Git::new(config.core.gitbin.as_deref())?;
    let opts = FsckOpts {
        force,
        connectivity,
        repack_all_quick,
        repack_all_full,
    };
    let summary = run_fsck_pass(config, &git, &opts)?;
    log::info!(
        "fsck pass complete: {} checked, {} repacked, {} skipped, {} failed",
        summary.checked,
        summary.repacked,
        summary.skipped,
        summary.failed
    );
    if summary.failed > 0 {
        return Ok(EXIT_PARTIAL);
    }
    Ok(0)
}
