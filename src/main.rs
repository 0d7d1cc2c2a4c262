use std::process;

use clap::Parser;
use grokmirror::config::Config;

mod cli;
mod commands;

use cli::{Cli, Commands};
use commands::{handle_dumb_pull, handle_fsck, handle_manifest, handle_pull};

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(level)
        .format_timestamp_secs()
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("grok: {:#}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Manifest {
            use_now,
            check_export_ok,
            ignore,
            remove,
            prune,
            pretty,
            paths,
        } => handle_manifest(
            &config,
            use_now,
            check_export_ok,
            ignore,
            remove,
            prune,
            pretty,
            paths,
        ),
        Commands::Pull { daemon, force_purge } => handle_pull(&config, daemon, force_purge),
        Commands::Fsck {
            force,
            connectivity,
            repack_all_quick,
            repack_all_full,
        } => handle_fsck(&config, force, connectivity, repack_all_quick, repack_all_full),
        Commands::DumbPull {
            prune,
            remote,
            dirs,
        } => handle_dumb_pull(&config, prune, &remote, &dirs),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("grok: {:#}", e);
            process::exit(1);
        }
    }
}
