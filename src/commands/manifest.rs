//! `grok manifest`: origin-side manifest generation.

use grokmirror::config::Config;
use grokmirror::generator::{GeneratorOpts, run_manifest};
use grokmirror::git::Git;

#[allow(clippy::too_many_arguments)]
pub fn handle_manifest(
    config: &Config,
    use_now: bool,
    check_export_ok: bool,
    ignore: Vec<String>,
    remove: Vec<String>,
    prune: bool,
    pretty: bool,
    paths: Vec<String>,
) -> anyhow::Result<i32> {
    let git = Git::new(config.core.gitbin.as_deref())?;
    let opts = GeneratorOpts {
        use_now,
        check_export_ok,
        ignore,
        remove,
        prune,
        pretty,
        paths,
    };
    run_manifest(config, &git, &opts)?;
    Ok(0)
}
