//! Serve command.

use kstub::server::Server;
use kstub::sim::{SimConfig, SimHost};
use kstub::{Engine, StubConfig};
use tracing::error;

use crate::cli::{EXIT_FAILURE, EXIT_SUCCESS};
use crate::terminal;

pub struct ServeArgs<'a> {
    pub listen: &'a str,
    pub cpus: usize,
    pub watchpoints: usize,
    pub memory_size: usize,
    pub packet_size: usize,
    pub start_running: bool,
    pub keep_jit: bool,
    pub once: bool,
    pub quiet: bool,
}

/// Handle the `serve` command.
pub fn cmd_serve(args: &ServeArgs<'_>) -> i32 {
    let host = SimHost::new(SimConfig {
        cpus: args.cpus,
        memory_size: args.memory_size,
        watchpoints: args.watchpoints,
        start_halted: !args.start_running,
    });
    let cpu_mask = host.cpu_mask();
    let halted_mask = host.parked_mask();
    let config = StubConfig::default()
        .with_packet_size(args.packet_size)
        .with_reclaim_jit_on_detach(!args.keep_jit);

    let engine = match Engine::new(host, config, cpu_mask, halted_mask) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "failed to initialize engine");
            return EXIT_FAILURE;
        }
    };
    if let Err(e) = engine.set_watchpoint_count(args.watchpoints) {
        error!(error = %e, "failed to size watchpoint pool");
        return EXIT_FAILURE;
    }

    if !args.quiet {
        terminal::print_target(args.listen, cpu_mask.len(), args.memory_size, args.watchpoints);
    }

    match Server::new(engine).once(args.once).run_addr(args.listen) {
        Ok(stats) => {
            if !args.quiet {
                terminal::print_success(&format!("served {} session(s)", stats.sessions));
            }
            EXIT_SUCCESS
        }
        Err(e) => {
            error!(error = %e, "serve failed");
            terminal::print_failure(&e.to_string());
            EXIT_FAILURE
        }
    }
}
