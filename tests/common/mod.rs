//! Shared fixtures: build real bare repositories with git plumbing so
//! tests control exactly which objects exist (and stay loose, so
//! corruption tests can delete them).

// Each integration test binary compiles its own copy; not all of them
// use every helper.
#![allow(dead_code)]

use std::path::Path;

use grokmirror::config::Config;
use grokmirror::git::{DEFAULT_TIMEOUT, Git};

pub fn git() -> Git {
    Git::new(None).expect("git binary in PATH")
}

const AUTHOR_ENV: &[(&str, &str)] = &[
    ("GIT_AUTHOR_NAME", "Test"),
    ("GIT_AUTHOR_EMAIL", "test@example.org"),
    ("GIT_AUTHOR_DATE", "1600000000 +0000"),
    ("GIT_COMMITTER_NAME", "Test"),
    ("GIT_COMMITTER_EMAIL", "test@example.org"),
    ("GIT_COMMITTER_DATE", "1600000000 +0000"),
];

fn run_ok(git: &Git, gitdir: &Path, args: &[&str], stdin: Option<&[u8]>) -> String {
    let out = git
        .run(Some(gitdir), args, AUTHOR_ENV, stdin, DEFAULT_TIMEOUT)
        .expect("git runs");
    assert_eq!(out.exit, 0, "git {:?} failed: {}", args, out.stderr);
    out.stdout.trim().to_string()
}

/// Create an empty bare repository with HEAD on refs/heads/master.
pub fn make_bare_repo(git: &Git, path: &Path) {
    git.init_bare(path).expect("init bare");
    run_ok(git, path, &["symbolic-ref", "HEAD", "refs/heads/master"], None);
}

/// Commit one file on refs/heads/master via plumbing, returning the
/// commit sha. Objects stay loose.
pub fn commit_file(git: &Git, gitdir: &Path, name: &str, content: &str, msg: &str) -> String {
    let blob = run_ok(
        git,
        gitdir,
        &["hash-object", "-w", "--stdin"],
        Some(content.as_bytes()),
    );
    let tree_listing = format!("100644 blob {}\t{}\n", blob, name);
    let tree = run_ok(git, gitdir, &["mktree"], Some(tree_listing.as_bytes()));
    let parent = git.rev_parse(gitdir, "refs/heads/master").expect("rev-parse");
    let commit = match parent {
        Some(parent) => run_ok(
            git,
            gitdir,
            &["commit-tree", &tree, "-p", &parent, "-m", msg],
            None,
        ),
        None => run_ok(git, gitdir, &["commit-tree", &tree, "-m", msg], None),
    };
    run_ok(git, gitdir, &["update-ref", "refs/heads/master", &commit], None);
    commit
}

/// Tree sha of the tip commit, for corruption tests.
pub fn tip_tree(git: &Git, gitdir: &Path) -> String {
    run_ok(git, gitdir, &["rev-parse", "refs/heads/master^{tree}"], None)
}

/// Delete a loose object out from under the repository.
pub fn delete_loose_object(gitdir: &Path, sha: &str) {
    let path = gitdir.join("objects").join(&sha[..2]).join(&sha[2..]);
    std::fs::remove_file(&path).expect("loose object present");
}

/// Minimal replica config rooted in a temp directory.
pub fn replica_config(toplevel: &Path, origin_toplevel: &Path, origin_manifest: &Path) -> Config {
    let raw = format!(
        r#"
[core]
toplevel = "{}"
manifest = "{}"

[remote]
site = "{}"
manifest = "{}"
"#,
        toplevel.display(),
        toplevel.join("manifest.js").display(),
        origin_toplevel.display(),
        origin_manifest.display(),
    );
    Config::parse(&raw).expect("replica config parses")
}

/// Config for an origin toplevel (manifest generation, fsck).
pub fn origin_config(toplevel: &Path) -> Config {
    let raw = format!(
        r#"
[core]
toplevel = "{}"
manifest = "{}"

[remote]
site = ""
manifest = ""
"#,
        toplevel.display(),
        toplevel.join("manifest.js").display(),
    );
    Config::parse(&raw).expect("origin config parses")
}

