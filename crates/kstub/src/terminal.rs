//! Styled terminal output helpers.

use console::style;

/// Print the simulated target's shape and how to attach to it.
pub fn print_target(listen: &str, cpus: usize, memory_size: usize, watchpoints: usize) {
    eprintln!(
        "{} {} cpus, {} KiB RAM at {:#x}, {} watchpoint slots",
        style("target").cyan().bold(),
        cpus,
        memory_size / 1024,
        kstub::sim::SIM_MEMORY_BASE,
        watchpoints
    );
    eprintln!(
        "{} gdb-multiarch -ex 'target remote {}'",
        style("attach").cyan().bold(),
        listen
    );
}

pub fn print_success(message: &str) {
    eprintln!("{} {}", style("✓").green().bold(), message);
}

pub fn print_failure(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}
