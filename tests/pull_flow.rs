//! End-to-end pull engine flows against real on-disk origins.

mod common;

use std::time::{Duration, SystemTime};

use common::*;
use grokmirror::config::Config;
use grokmirror::fsck::{read_reclone_mark, write_reclone_mark};
use grokmirror::generator::{GeneratorOpts, run_manifest};
use grokmirror::manifest::Manifest;
use grokmirror::pull::{PullEngine, PullOpts};
use grokmirror::remote::set_local_mtime;

fn once() -> PullOpts {
    PullOpts {
        once: true,
        force_purge: false,
    }
}

/// Make the next conditional check see the remote manifest as newer.
fn age_local_manifest(config: &Config) {
    let old = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
    set_local_mtime(&config.core.manifest, old).expect("age manifest");
}

#[test]
fn cold_clone_then_idempotent_pass() {
    let tmp = tempfile::tempdir().unwrap();
    let origin_top = tmp.path().join("origin");
    let replica_top = tmp.path().join("replica");
    std::fs::create_dir_all(&origin_top).unwrap();
    std::fs::create_dir_all(&replica_top).unwrap();
    let g = git();

    let origin_repo = origin_top.join("a.git");
    make_bare_repo(&g, &origin_repo);
    commit_file(&g, &origin_repo, "README", "hello", "initial");

    let ocfg = origin_config(&origin_top);
    run_manifest(&ocfg, &g, &GeneratorOpts::default()).unwrap();
    let origin_manifest = Manifest::load(&ocfg.core.manifest).unwrap();
    let origin_fp = origin_manifest.get("/a.git").unwrap().fingerprint.clone();
    assert!(origin_fp.is_some());

    let rcfg = replica_config(&replica_top, &origin_top, &ocfg.core.manifest);
    let engine = PullEngine::new(rcfg.clone(), g.clone()).unwrap();
    let summary = engine.run(&once()).unwrap();
    assert_eq!(summary.cloned, 1, "one repo cloned");
    assert_eq!(summary.failed, 0);

    let cloned = replica_top.join("a.git");
    assert!(cloned.join("HEAD").exists());
    let head = g
        .run(
            Some(&cloned),
            &["symbolic-ref", "HEAD"],
            &[],
            None,
            grokmirror::git::DEFAULT_TIMEOUT,
        )
        .unwrap();
    assert_eq!(head.stdout.trim(), "refs/heads/master");

    let local = Manifest::load(&rcfg.core.manifest).unwrap();
    assert_eq!(local.get("/a.git").unwrap().fingerprint, origin_fp);

    // Unchanged origin: the second pass is a 304-equivalent no-op.
    let engine = PullEngine::new(rcfg.clone(), g.clone()).unwrap();
    let summary = engine.run(&once()).unwrap();
    assert!(summary.not_modified);
}

#[test]
fn delta_fetch_updates_fingerprint() {
    let tmp = tempfile::tempdir().unwrap();
    let origin_top = tmp.path().join("origin");
    let replica_top = tmp.path().join("replica");
    std::fs::create_dir_all(&origin_top).unwrap();
    std::fs::create_dir_all(&replica_top).unwrap();
    let g = git();

    let origin_repo = origin_top.join("a.git");
    make_bare_repo(&g, &origin_repo);
    commit_file(&g, &origin_repo, "README", "hello", "initial");

    let ocfg = origin_config(&origin_top);
    run_manifest(&ocfg, &g, &GeneratorOpts::default()).unwrap();

    let rcfg = replica_config(&replica_top, &origin_top, &ocfg.core.manifest);
    let engine = PullEngine::new(rcfg.clone(), g.clone()).unwrap();
    engine.run(&once()).unwrap();

    // Origin moves on.
    let new_tip = commit_file(&g, &origin_repo, "README", "hello v2", "update");
    run_manifest(&ocfg, &g, &GeneratorOpts::default()).unwrap();
    let new_fp = Manifest::load(&ocfg.core.manifest)
        .unwrap()
        .get("/a.git")
        .unwrap()
        .fingerprint
        .clone();
    age_local_manifest(&rcfg);

    let engine = PullEngine::new(rcfg.clone(), g.clone()).unwrap();
    let summary = engine.run(&once()).unwrap();
    assert_eq!(summary.updated, 1, "one repo fetched");
    assert_eq!(summary.failed, 0);

    let cloned = replica_top.join("a.git");
    let tip = g.rev_parse(&cloned, "refs/heads/master").unwrap();
    assert_eq!(tip.as_deref(), Some(new_tip.as_str()));
    let local = Manifest::load(&rcfg.core.manifest).unwrap();
    assert_eq!(local.get("/a.git").unwrap().fingerprint, new_fp);
}

#[test]
fn reclone_mark_forces_full_reclone() {
    let tmp = tempfile::tempdir().unwrap();
    let origin_top = tmp.path().join("origin");
    let replica_top = tmp.path().join("replica");
    std::fs::create_dir_all(&origin_top).unwrap();
    std::fs::create_dir_all(&replica_top).unwrap();
    let g = git();

    let origin_repo = origin_top.join("b.git");
    make_bare_repo(&g, &origin_repo);
    let tip = commit_file(&g, &origin_repo, "f", "data", "initial");

    let ocfg = origin_config(&origin_top);
    run_manifest(&ocfg, &g, &GeneratorOpts::default()).unwrap();

    let rcfg = replica_config(&replica_top, &origin_top, &ocfg.core.manifest);
    let engine = PullEngine::new(rcfg.clone(), g.clone()).unwrap();
    engine.run(&once()).unwrap();

    let cloned = replica_top.join("b.git");
    write_reclone_mark(&cloned, "fatal: bad tree").unwrap();
    // Leave a file a plain fetch would never touch; a true re-clone
    // removes it.
    std::fs::write(cloned.join("stale-marker"), b"x").unwrap();
    age_local_manifest(&rcfg);

    let engine = PullEngine::new(rcfg.clone(), g.clone()).unwrap();
    let summary = engine.run(&once()).unwrap();
    assert_eq!(summary.cloned, 1, "marked repo was re-cloned");
    assert_eq!(summary.failed, 0);

    assert!(cloned.join("HEAD").exists());
    assert_eq!(read_reclone_mark(&cloned), None, "mark removed");
    assert!(!cloned.join("stale-marker").exists(), "directory was replaced");
    assert_eq!(
        g.rev_parse(&cloned, "refs/heads/master").unwrap().as_deref(),
        Some(tip.as_str())
    );
}

/// Build a fake (empty but marker-complete) repository directory.
fn fake_repo(toplevel: &std::path::Path, key: &str) {
    let gitdir = toplevel.join(key.trim_start_matches('/'));
    std::fs::create_dir_all(gitdir.join("objects")).unwrap();
    std::fs::write(gitdir.join("HEAD"), "ref: refs/heads/master\n").unwrap();
}

fn purge_test_config(toplevel: &std::path::Path, remote_manifest: &std::path::Path) -> Config {
    let raw = format!(
        r#"
[core]
toplevel = "{}"
manifest = "{}"

[remote]
site = "/nowhere"
manifest = "{}"

[pull]
purge = true
"#,
        toplevel.display(),
        toplevel.join("manifest.js").display(),
        remote_manifest.display(),
    );
    Config::parse(&raw).unwrap()
}

#[test]
fn purge_respects_quorum_until_forced() {
    let tmp = tempfile::tempdir().unwrap();
    let toplevel = tmp.path().join("replica");
    std::fs::create_dir_all(&toplevel).unwrap();
    let remote_path = tmp.path().join("remote-manifest.js");
    let g = git();

    // Ten local repositories, all present in the local manifest with
    // entries matching the remote so no git work is queued.
    let entry = |modified| grokmirror::manifest::RepoEntry {
        fingerprint: Some("abcabc".to_string()),
        modified,
        ..Default::default()
    };
    let mut local = Manifest::new();
    let mut remote = Manifest::new();
    for i in 0..10 {
        let key = format!("/r{}.git", i);
        fake_repo(&toplevel, &key);
        local.upsert(key.clone(), entry(100));
        // Remote keeps only the first four: a 60% removal.
        if i < 4 {
            remote.upsert(key, entry(100));
        }
    }
    let config = purge_test_config(&toplevel, &remote_path);
    local.write_file(&config.core.manifest, false).unwrap();
    remote.write_file(&remote_path, false).unwrap();
    age_local_manifest(&config);

    let engine = PullEngine::new(config.clone(), g.clone()).unwrap();
    let summary = engine.run(&once()).unwrap();
    assert!(summary.purge_refused, "60% removal must trip the quorum");
    assert!(toplevel.join("r9.git").exists(), "nothing was deleted");
    let after = Manifest::load(&config.core.manifest).unwrap();
    assert_eq!(after.repo_keys().count(), 10, "local manifest untouched");

    // Forced, the purge goes through.
    age_local_manifest(&config);
    let engine = PullEngine::new(config.clone(), g).unwrap();
    let summary = engine
        .run(&PullOpts {
            once: true,
            force_purge: true,
        })
        .unwrap();
    assert!(!summary.purge_refused);
    assert!(!toplevel.join("r9.git").exists(), "gone repos deleted");
    assert!(toplevel.join("r0.git").exists(), "kept repos intact");
    let after = Manifest::load(&config.core.manifest).unwrap();
    assert_eq!(after.repo_keys().count(), 4);
}

#[test]
fn daemon_socket_push_fetches_before_manifest_catches_up() {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    let tmp = tempfile::tempdir().unwrap();
    let origin_top = tmp.path().join("origin");
    let replica_top = tmp.path().join("replica");
    std::fs::create_dir_all(&origin_top).unwrap();
    std::fs::create_dir_all(&replica_top).unwrap();
    let g = git();

    let origin_repo = origin_top.join("x.git");
    make_bare_repo(&g, &origin_repo);
    commit_file(&g, &origin_repo, "f", "one", "initial");

    let ocfg = origin_config(&origin_top);
    run_manifest(&ocfg, &g, &GeneratorOpts::default()).unwrap();

    let socket_path = tmp.path().join("pull.sock");
    let raw = format!(
        r#"
[core]
toplevel = "{}"
manifest = "{}"

[remote]
site = "{}"
manifest = "{}"

[pull]
refresh = 120
socket = "{}"
"#,
        replica_top.display(),
        replica_top.join("manifest.js").display(),
        origin_top.display(),
        ocfg.core.manifest.display(),
        socket_path.display(),
    );
    let rcfg = grokmirror::config::Config::parse(&raw).unwrap();

    let engine = PullEngine::new(rcfg.clone(), g.clone()).unwrap();
    let stop = engine.stop_handle();
    let daemon = std::thread::spawn(move || {
        engine
            .run(&PullOpts {
                once: false,
                force_purge: false,
            })
            .unwrap()
    });

    // Wait for the first pass to clone and the socket to come up.
    let cloned = replica_top.join("x.git");
    for _ in 0..300 {
        if cloned.join("HEAD").exists() && socket_path.exists() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    assert!(cloned.join("HEAD").exists(), "first daemon pass cloned");
    assert!(socket_path.exists(), "push socket came up");

    // The origin moves on, but its manifest does NOT: only a push
    // notification can tell the replica.
    let new_tip = commit_file(&g, &origin_repo, "f", "two", "pushed update");
    for _ in 0..5 {
        let mut stream = UnixStream::connect(&socket_path).unwrap();
        stream.write_all(b"/x.git\n").unwrap();
    }

    let mut caught_up = false;
    for _ in 0..300 {
        if g.rev_parse(&cloned, "refs/heads/master").unwrap().as_deref() == Some(new_tip.as_str())
        {
            caught_up = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    stop.stop();
    let _ = daemon.join().unwrap();
    assert!(caught_up, "pushed path was fetched ahead of the manifest");
    assert!(!socket_path.exists(), "socket removed on shutdown");
}

#[test]
fn symlink_aliases_travel_with_the_manifest() {
    let tmp = tempfile::tempdir().unwrap();
    let origin_top = tmp.path().join("origin");
    let replica_top = tmp.path().join("replica");
    std::fs::create_dir_all(&origin_top).unwrap();
    std::fs::create_dir_all(&replica_top).unwrap();
    let g = git();

    let origin_repo = origin_top.join("a.git");
    make_bare_repo(&g, &origin_repo);
    commit_file(&g, &origin_repo, "README", "hello", "initial");
    std::os::unix::fs::symlink(&origin_repo, origin_top.join("alias.git")).unwrap();

    let ocfg = origin_config(&origin_top);
    run_manifest(&ocfg, &g, &GeneratorOpts::default()).unwrap();
    assert_eq!(
        Manifest::load(&ocfg.core.manifest).unwrap().get("/a.git").unwrap().symlinks,
        vec!["/alias.git"]
    );

    let rcfg = replica_config(&replica_top, &origin_top, &ocfg.core.manifest);
    let engine = PullEngine::new(rcfg.clone(), g).unwrap();
    engine.run(&once()).unwrap();

    let link = replica_top.join("alias.git");
    let target = std::fs::read_link(&link).expect("alias symlink exists");
    assert_eq!(target, replica_top.join("a.git"));
}
