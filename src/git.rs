//! The git invoker.
//!
//! Every git subprocess in the engine goes through [`Git::run`]. This is
//! the **only** way git is executed: one chokepoint for environment
//! scrubbing, timeouts, output capture, and debug logging.
//!
//! ```text
//! $ git show-ref [/srv/mirror/a.git]
//! [git] dur=12.3ms exit=0
//! ```
//!
//! `run` never errors on a non-zero exit; callers get the exit code and
//! decide. It does error when the child cannot be spawned or exceeds its
//! deadline (the child is killed and [`GrokError::GitTimeout`] surfaced).

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use wait_timeout::ChildExt;

use crate::error::{GrokError, Result};

/// Default deadline for clones of unknown-size repositories.
pub const CLONE_TIMEOUT: Duration = Duration::from_secs(3600);
/// Default deadline for incremental fetches.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(600);
/// Default deadline for full repacks, which on giant repositories can
/// legitimately run for hours.
pub const REPACK_FULL_TIMEOUT: Duration = Duration::from_secs(4 * 3600);
/// Default deadline for everything else.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1800);

/// Captured result of one git invocation.
#[derive(Debug)]
pub struct GitOutput {
    pub exit: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit == 0
    }
}

/// Handle on a located git binary.
#[derive(Debug, Clone)]
pub struct Git {
    gitbin: PathBuf,
}

impl Git {
    /// Locate git: `GITBIN` environment override, then the configured
    /// path, then `$PATH`.
    pub fn new(configured: Option<&Path>) -> anyhow::Result<Git> {
        if let Ok(env_bin) = std::env::var("GITBIN") {
            return Ok(Git {
                gitbin: PathBuf::from(env_bin),
            });
        }
        if let Some(bin) = configured {
            return Ok(Git {
                gitbin: bin.to_path_buf(),
            });
        }
        let gitbin = which::which("git")?;
        Ok(Git { gitbin })
    }

    /// Run git with a scrubbed environment and a hard deadline.
    ///
    /// `gitdir` becomes `--git-dir`; pass `None` for commands that operate
    /// on paths given in `args` (clone, init). The environment is reduced
    /// to `HOME`, `PATH` and a C locale so output parsing is stable, plus
    /// whatever `env` adds.
    pub fn run(
        &self,
        gitdir: Option<&Path>,
        args: &[&str],
        env: &[(&str, &str)],
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<GitOutput> {
        let mut cmd = Command::new(&self.gitbin);
        if let Some(dir) = gitdir {
            cmd.arg("--git-dir").arg(dir);
        }
        cmd.args(args);
        cmd.env_clear();
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", home);
        }
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("LANG", "C").env("LC_ALL", "C");
        for (key, val) in env {
            cmd.env(key, val);
        }
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let args_str = args.join(" ");
        match gitdir {
            Some(dir) => log::debug!("$ git {} [{}]", args_str, dir.display()),
            None => log::debug!("$ git {}", args_str),
        }

        let t0 = Instant::now();
        let mut child = cmd.spawn().map_err(|e| GrokError::GitSpawn {
            args: args_str.clone(),
            source: e,
        })?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            // Ignore EPIPE: the child may exit without draining stdin.
            let _ = pipe.write_all(data);
        }

        // Drain pipes on threads so a chatty child can't deadlock against
        // a full pipe buffer while we sit in wait_timeout().
        let mut out_pipe = child.stdout.take().expect("stdout was piped");
        let mut err_pipe = child.stderr.take().expect("stderr was piped");
        let out_thread = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = out_pipe.read_to_end(&mut buf);
            buf
        });
        let err_thread = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = err_pipe.read_to_end(&mut buf);
            buf
        });

        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                // Unblock the reader threads before dropping them.
                let _ = out_thread.join();
                let _ = err_thread.join();
                log::warn!("git {} killed after {}s", args_str, timeout.as_secs());
                return Err(GrokError::GitTimeout {
                    args: args_str,
                    timeout,
                });
            }
            Err(e) => return Err(GrokError::Io(e)),
        };

        let stdout = String::from_utf8_lossy(&out_thread.join().unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&err_thread.join().unwrap_or_default()).into_owned();
        let duration = t0.elapsed();
        // Death by signal has no exit code; -1 stands in.
        let exit = status.code().unwrap_or(-1);

        log::debug!(
            "[git] dur={:.1}ms exit={}",
            duration.as_secs_f64() * 1000.0,
            exit
        );
        if !stderr.is_empty() {
            log::debug!("[git] stderr: {}", stderr.trim_end());
        }

        Ok(GitOutput {
            exit,
            stdout,
            stderr,
            duration,
        })
    }

    /// Like [`Git::run`] but errors on non-zero exit, for callers where
    /// failure has no per-repo recovery.
    pub fn run_ok(&self, gitdir: Option<&Path>, args: &[&str], timeout: Duration) -> Result<GitOutput> {
        let out = self.run(gitdir, args, &[], None, timeout)?;
        if !out.success() {
            return Err(GrokError::GitFailed {
                args: args.join(" "),
                code: out.exit,
                stderr: out.stderr,
            });
        }
        Ok(out)
    }

    // ----- thin wrappers -------------------------------------------------

    pub fn rev_parse(&self, gitdir: &Path, what: &str) -> Result<Option<String>> {
        let out = self.run(Some(gitdir), &["rev-parse", what], &[], None, DEFAULT_TIMEOUT)?;
        if out.success() {
            Ok(Some(out.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Raw `git show-ref` output; empty string for a repo with no refs
    /// (show-ref exits 1 in that case, which is not an error here).
    pub fn show_ref(&self, gitdir: &Path) -> Result<String> {
        let out = self.run(Some(gitdir), &["show-ref"], &[], None, DEFAULT_TIMEOUT)?;
        Ok(out.stdout)
    }

    pub fn config_get(&self, gitdir: &Path, key: &str) -> Result<Option<String>> {
        let out = self.run(Some(gitdir), &["config", key], &[], None, DEFAULT_TIMEOUT)?;
        if out.success() {
            Ok(Some(out.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    pub fn config_set(&self, gitdir: &Path, key: &str, value: &str) -> Result<()> {
        self.run_ok(Some(gitdir), &["config", key, value], DEFAULT_TIMEOUT)?;
        Ok(())
    }

    pub fn config_unset(&self, gitdir: &Path, key: &str) -> Result<()> {
        let out = self.run(Some(gitdir), &["config", "--unset", key], &[], None, DEFAULT_TIMEOUT)?;
        // Exit 5 means the key wasn't set, which is fine.
        if !out.success() && out.exit != 5 {
            return Err(GrokError::GitFailed {
                args: format!("config --unset {}", key),
                code: out.exit,
                stderr: out.stderr,
            });
        }
        Ok(())
    }

    pub fn set_head(&self, gitdir: &Path, symref: &str) -> Result<()> {
        let target = symref.strip_prefix("ref: ").unwrap_or(symref);
        self.run_ok(Some(gitdir), &["symbolic-ref", "HEAD", target], DEFAULT_TIMEOUT)?;
        Ok(())
    }

    pub fn init_bare(&self, dest: &Path) -> Result<()> {
        let dest = dest.to_string_lossy();
        self.run_ok(None, &["init", "--bare", dest.as_ref()], DEFAULT_TIMEOUT)?;
        Ok(())
    }

    pub fn clone_mirror(&self, url: &str, dest: &Path) -> Result<GitOutput> {
        let dest = dest.to_string_lossy();
        self.run(
            None,
            &["clone", "--mirror", "--bare", url, dest.as_ref()],
            &[],
            None,
            CLONE_TIMEOUT,
        )
    }

    pub fn fetch(&self, gitdir: &Path, remote: &str, refspecs: &[&str], prune: bool) -> Result<GitOutput> {
        let mut args = vec!["fetch"];
        if prune {
            args.push("--prune");
            // With an explicit refspec, tag pruning is already covered
            // (and git rejects the combination).
            if refspecs.is_empty() {
                args.push("--prune-tags");
            }
        }
        args.push(remote);
        args.extend_from_slice(refspecs);
        self.run(Some(gitdir), &args, &[], None, FETCH_TIMEOUT)
    }

    pub fn remote_add(&self, gitdir: &Path, name: &str, url: &str) -> Result<()> {
        self.run_ok(Some(gitdir), &["remote", "add", name, url], DEFAULT_TIMEOUT)?;
        Ok(())
    }

    pub fn remote_remove(&self, gitdir: &Path, name: &str) -> Result<()> {
        self.run_ok(Some(gitdir), &["remote", "remove", name], DEFAULT_TIMEOUT)?;
        Ok(())
    }

    pub fn remote_list(&self, gitdir: &Path) -> Result<Vec<String>> {
        let out = self.run_ok(Some(gitdir), &["remote"], DEFAULT_TIMEOUT)?;
        Ok(out
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub fn pack_refs(&self, gitdir: &Path, all: bool) -> Result<GitOutput> {
        let args: &[&str] = if all {
            &["pack-refs", "--all"]
        } else {
            &["pack-refs"]
        };
        self.run(Some(gitdir), args, &[], None, DEFAULT_TIMEOUT)
    }

    pub fn repack(&self, gitdir: &Path, flags: &[&str], full: bool) -> Result<GitOutput> {
        let mut args = vec!["repack"];
        args.extend_from_slice(flags);
        let timeout = if full { REPACK_FULL_TIMEOUT } else { DEFAULT_TIMEOUT };
        self.run(Some(gitdir), &args, &[], None, timeout)
    }

    pub fn prune(&self, gitdir: &Path, expire: &str) -> Result<GitOutput> {
        let expire_arg = format!("--expire={}", expire);
        self.run(Some(gitdir), &["prune", &expire_arg], &[], None, DEFAULT_TIMEOUT)
    }

    pub fn fsck(&self, gitdir: &Path, connectivity_only: bool) -> Result<GitOutput> {
        let mut args = vec!["fsck", "--no-dangling", "--no-reflogs"];
        if connectivity_only {
            args.push("--connectivity-only");
        }
        self.run(Some(gitdir), &args, &[], None, REPACK_FULL_TIMEOUT)
    }

    pub fn commit_graph_write(&self, gitdir: &Path) -> Result<GitOutput> {
        self.run(
            Some(gitdir),
            &["commit-graph", "write", "--reachable"],
            &[],
            None,
            DEFAULT_TIMEOUT,
        )
    }

    /// Root commits (`--max-parents=0`) across all refs, sorted.
    pub fn rev_list_roots(&self, gitdir: &Path) -> Result<Vec<String>> {
        let out = self.run(
            Some(gitdir),
            &["rev-list", "--max-parents=0", "--all"],
            &[],
            None,
            DEFAULT_TIMEOUT,
        )?;
        if !out.success() {
            // A repo with no commits has no roots.
            return Ok(Vec::new());
        }
        let mut roots: Vec<String> = out
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        roots.sort();
        Ok(roots)
    }

    pub fn update_server_info(&self, gitdir: &Path) -> Result<GitOutput> {
        self.run(Some(gitdir), &["update-server-info"], &[], None, DEFAULT_TIMEOUT)
    }
}
