use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::exec::Executor;
use crate::parser::parse_command_line;
use crate::utils;

/// Runs the main shell loop: prints the prompt (if enabled), reads input,
/// parses it, and hands each pipeline to the executor.
///
/// - `emit_prompt`: if true, prints the command prompt.
/// - `verbose`: if true, prints the parsed pipeline before running it.
pub fn run_shell(emit_prompt: bool, verbose: bool) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => utils::fatal(&format!("failed to initialize line editor: {}", err)),
    };
    let mut executor = Executor::new();

    loop {
        let prompt = if emit_prompt {
            prompt_string()
        } else {
            String::new()
        };
        match editor.readline(&prompt) {
            Ok(line) => {
                let cmdline = line.trim();
                if cmdline.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(cmdline);
                match parse_command_line(cmdline) {
                    Ok(pipeline) => {
                        if verbose {
                            eprintln!("qsh: parsed {:?}", pipeline);
                        }
                        if executor.run_pipeline(&pipeline, cmdline) {
                            break;
                        }
                    }
                    Err(err) => eprintln!("Parse error: {}", err),
                }
            }
            // Ctrl-C at the prompt drops the line and keeps the shell.
            Err(ReadlineError::Interrupted) => continue,
            // Ctrl-D.
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error reading input: {}", err);
                break;
            }
        }
    }
}

/// The prompt carries the working directory so `cd` is visible at a glance.
fn prompt_string() -> String {
    match nix::unistd::getcwd() {
        Ok(cwd) => format!("[qsh {}]$ ", cwd.display()),
        Err(_) => String::from("[qsh]$ "),
    }
}
