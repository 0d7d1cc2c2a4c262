//! Smart mirroring for large collections of bare git repositories.
//!
//! An origin publishes a compact JSON manifest of every repository it
//! serves; replicas poll it (or listen for pushed paths on a socket),
//! compute the delta against local state, and run git to converge. A
//! companion fsck pass keeps the on-disk repositories healthy and
//! consolidates forks into shared object storage.
//!
//! The library is consumed by the `grok` binary; the module split
//! mirrors the moving parts: [`manifest`] is the wire format, [`pull`]
//! the replication engine, [`fsck`] the maintenance controller,
//! [`objstore`] the fork-family storage, and [`git`] the one place a
//! git subprocess is ever spawned.

pub mod config;
pub mod error;
pub mod fsck;
pub mod generator;
pub mod git;
pub mod lock;
pub mod manifest;
pub mod objstore;
pub mod pull;
pub mod remote;
pub mod utils;

pub use error::{GrokError, Result};
