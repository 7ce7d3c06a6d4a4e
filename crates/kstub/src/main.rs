//! kstub CLI - GDB remote stub with a simulated target

mod cli;
mod commands;
mod terminal;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;

fn main() {
    let cli = Cli::parse();

    let metrics_handle = if cli.metrics {
        kstub::recorder::CliRecorder::new().install()
    } else {
        None
    };
    kstub::engine_metrics::init();

    let default_level = if cli.verbose {
        "kstub=debug"
    } else if cli.silent {
        "kstub=error"
    } else {
        "kstub=info"
    };
    let filter = match default_level.parse() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let exit_code = commands::run_command(&cli);

    if let Some(handle) = metrics_handle {
        handle.print_summary();
    }

    std::process::exit(exit_code);
}
