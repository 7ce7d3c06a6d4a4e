//! Command implementations.

mod serve;

use crate::cli::{Cli, Commands};

/// Dispatch CLI command to the appropriate handler.
pub fn run_command(cli: &Cli) -> i32 {
    match &cli.command {
        Commands::Serve {
            listen,
            cpus,
            watchpoints,
            memory_kib,
            packet_size,
            start_running,
            keep_jit,
            once,
        } => serve::cmd_serve(&serve::ServeArgs {
            listen,
            cpus: usize::from(*cpus),
            watchpoints: *watchpoints,
            memory_size: memory_kib.saturating_mul(1024),
            packet_size: *packet_size,
            start_running: *start_running,
            keep_jit: *keep_jit,
            once: *once,
            quiet: cli.silent,
        }),
    }
}
