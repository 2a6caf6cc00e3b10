use signal_hook::consts::signal::*;
use signal_hook::iterator::Signals;
use std::thread;

use crate::utils;

/// Installs the shell's signal listener thread.
///
/// - SIGQUIT: prints a termination message and exits the shell.
/// - SIGINT: (Ctrl-C) absorbed here so the keystroke kills only the
///   foreground children, which share the terminal's process group and
///   regain the default disposition on exec.
///
/// There is deliberately no SIGCHLD handler: child reaping is poll-based
/// (`exec::sweep`, once per prompt cycle), so the job registries are only
/// ever touched from the main control flow.
pub fn install_signal_handlers() {
    let mut signals = match Signals::new([SIGINT, SIGQUIT]) {
        Ok(signals) => signals,
        Err(err) => utils::fatal(&format!("unable to install signal handlers: {}", err)),
    };
    thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGQUIT => {
                    println!("Terminating after receipt of SIGQUIT signal");
                    std::process::exit(0);
                }
                SIGINT => {
                    // Absorbed; the foreground job received its own copy.
                }
                _ => unreachable!(),
            }
        }
    });
}
