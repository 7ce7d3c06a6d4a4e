//! CLI definitions and argument types.

use clap::{Parser, Subcommand};

/// Exit code for success.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for failure.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Parser)]
#[command(name = "kstub")]
#[command(about = "GDB remote stub engine - serve a simulated multi-core AArch64 target")]
#[command(version)]
pub struct Cli {
    /// Show metrics summary after execution
    #[arg(long, global = true)]
    pub metrics: bool,

    /// Enable verbose output (sets RUST_LOG=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output (only show errors)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub silent: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve a simulated machine to a remote debugger over TCP
    Serve {
        /// Listen address (e.g., :1234 or 127.0.0.1:1234)
        #[arg(short, long, default_value = "127.0.0.1:1234")]
        listen: String,

        /// Number of simulated CPUs (1-32)
        #[arg(long, default_value = "4", value_parser = clap::value_parser!(u8).range(1..=32))]
        cpus: u8,

        /// Hardware watchpoint slots
        #[arg(long, default_value = "4")]
        watchpoints: usize,

        /// Simulated RAM size in KiB
        #[arg(long, default_value = "1024")]
        memory_kib: usize,

        /// Packet size advertised to the debugger (at least 2048)
        #[arg(long, default_value = "4096")]
        packet_size: usize,

        /// Start with every CPU running instead of halted
        #[arg(long)]
        start_running: bool,

        /// Keep JIT allocations when a debugger detaches
        #[arg(long)]
        keep_jit: bool,

        /// Exit after the first debugger disconnects
        #[arg(long)]
        once: bool,
    },
}
