mod builtins;
mod exec;
mod jobs;
mod parser;
mod shell;
mod signals;
mod utils;

use std::env;

struct Options {
    emit_prompt: bool,
    verbose: bool,
}

impl Options {
    fn from_args() -> Self {
        let mut opts = Options {
            emit_prompt: true,
            verbose: false,
        };
        for arg in env::args().skip(1) {
            match arg.as_str() {
                "-h" => utils::print_usage(),
                "-v" => opts.verbose = true,
                "-p" => opts.emit_prompt = false,
                other if other.starts_with('-') => {
                    eprintln!("qsh: unknown option: {}", other);
                }
                _ => {}
            }
        }
        opts
    }
}

fn main() {
    let opts = Options::from_args();
    signals::install_signal_handlers();
    shell::run_shell(opts.emit_prompt, opts.verbose);
}
