//! One handler per subcommand. Each returns the process exit code:
//! 0 success, 1 configuration error (mapped in main), 2 partial failure,
//! 127 nothing changed (dumb consumers chain on this).

mod dumb_pull;
mod fsck;
mod manifest;
mod pull;

pub use dumb_pull::handle_dumb_pull;
pub use fsck::handle_fsck;
pub use manifest::handle_manifest;
pub use pull::handle_pull;

/// Exit code for "some repositories failed".
pub const EXIT_PARTIAL: i32 = 2;
/// Exit code for "nothing changed".
pub const EXIT_STALE: i32 = 127;
