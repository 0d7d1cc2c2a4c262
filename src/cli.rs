//! Command-line interface definition.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "grok",
    version,
    about = "Smartly mirror large collections of bare git repositories",
    propagate_version = true
)]
pub struct Cli {
    /// Path to the grokmirror config file.
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Generate or update the manifest for this toplevel.
    Manifest {
        /// Use the current time as the modified stamp instead of the
        /// newest commit date.
        #[arg(short = 'n', long = "use-now")]
        use_now: bool,

        /// Skip repositories not marked with git-daemon-export-ok.
        #[arg(long = "check-export-ok")]
        check_export_ok: bool,

        /// Ignore repositories matching this glob (repeatable).
        #[arg(short = 'i', long = "ignore", value_name = "GLOB")]
        ignore: Vec<String>,

        /// Remove these repositories from the manifest (repeatable).
        #[arg(short = 'x', long = "remove", value_name = "PATH")]
        remove: Vec<String>,

        /// Drop manifest entries whose on-disk path no longer exists.
        #[arg(short = 'p', long)]
        prune: bool,

        /// Sort keys and indent the output.
        #[arg(long)]
        pretty: bool,

        /// Update only these repositories instead of walking the whole
        /// toplevel.
        #[arg(value_name = "PATH")]
        paths: Vec<String>,
    },

    /// Mirror repositories described by the remote manifest.
    Pull {
        /// Keep running: refresh on an interval and accept push
        /// notifications on the configured socket.
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Purge removed repositories even past the quorum.
        #[arg(long = "force-purge")]
        force_purge: bool,
    },

    /// Check and repack local repositories.
    Fsck {
        /// Check every repository now, ignoring the schedule.
        #[arg(short = 'f', long)]
        force: bool,

        /// Run fsck with --connectivity-only.
        #[arg(long)]
        connectivity: bool,

        /// Quick-repack every repository regardless of thresholds.
        #[arg(long = "repack-all-quick", conflicts_with = "repack_all_full")]
        repack_all_quick: bool,

        /// Full-repack every repository regardless of schedule.
        #[arg(long = "repack-all-full")]
        repack_all_full: bool,
    },

    /// Fetch explicitly named local mirrors, no manifest involved.
    DumbPull {
        /// Prune removed remote refs while fetching.
        #[arg(short = 'p', long)]
        prune: bool,

        /// Remote to update.
        #[arg(short = 'o', long, default_value = "origin", value_name = "REMOTE")]
        remote: String,

        /// Repository directories to update.
        #[arg(value_name = "DIR", required = true)]
        dirs: Vec<PathBuf>,
    },
}
