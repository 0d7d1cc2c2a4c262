//! `grok dumb-pull` exit-code contract, driven through the real binary.

mod common;

use std::process::Command;

use common::*;

fn write_config(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("grokmirror.toml");
    let raw = format!(
        r#"
[core]
toplevel = "{}"
manifest = "{}"

[remote]
site = ""
manifest = ""
"#,
        dir.display(),
        dir.join("manifest.js").display(),
    );
    std::fs::write(&path, raw).unwrap();
    path
}

#[test]
fn dumb_pull_reports_stale_then_fresh() {
    let tmp = tempfile::tempdir().unwrap();
    let g = git();

    let upstream = tmp.path().join("upstream.git");
    make_bare_repo(&g, &upstream);
    commit_file(&g, &upstream, "f", "one", "initial");

    // A mirror with an `origin` remote pointing at the upstream.
    let mirror = tmp.path().join("mirror.git");
    let out = g.clone_mirror(&upstream.to_string_lossy(), &mirror).unwrap();
    assert_eq!(out.exit, 0, "mirror clone: {}", out.stderr);

    let config = write_config(tmp.path());
    let grok = env!("CARGO_BIN_EXE_grok");

    // Nothing new upstream: stale.
    let status = Command::new(grok)
        .args(["-c", config.to_str().unwrap(), "dumb-pull"])
        .arg(&mirror)
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(127), "no change means stale exit");

    // Upstream moves: a fetch happens and the exit flips to success.
    commit_file(&g, &upstream, "f", "two", "update");
    let status = Command::new(grok)
        .args(["-c", config.to_str().unwrap(), "dumb-pull"])
        .arg(&mirror)
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(0));

    let up_tip = g.rev_parse(&upstream, "refs/heads/master").unwrap();
    let mirror_tip = g.rev_parse(&mirror, "refs/heads/master").unwrap();
    assert_eq!(up_tip, mirror_tip, "mirror caught up");
}

#[test]
fn dumb_pull_partial_failure_exit() {
    let tmp = tempfile::tempdir().unwrap();
    let config = write_config(tmp.path());
    let grok = env!("CARGO_BIN_EXE_grok");

    // Not a repository at all.
    let bogus = tmp.path().join("not-a-repo");
    std::fs::create_dir(&bogus).unwrap();
    let status = Command::new(grok)
        .args(["-c", config.to_str().unwrap(), "dumb-pull"])
        .arg(&bogus)
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(2), "failures exit 2");
}
