use std::env;
use std::ffi::CString;
use std::fs;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::libc::STDOUT_FILENO;
use nix::sys::signal::{self, Signal};
use nix::unistd;

use crate::jobs::{self, JobRegistry};
use crate::parser::CommandKind;

/// Which side of the fork an action runs on. Every stage is dispatched on
/// both sides; each side's table decides whether the command acts there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    /// The freshly created child process, after its streams are wired.
    Spawned,
    /// The shell process itself, immediately after the fork.
    Supervisor,
}

/// Total dispatch over command kinds for the given execution context.
/// Returns the exit status a spawned process should terminate with;
/// supervisor-side actions always report 0.
pub fn run_command(ctx: Context, cmd: &CommandKind, jobs: &mut JobRegistry) -> i32 {
    match ctx {
        Context::Spawned => spawned_action(cmd),
        Context::Supervisor => {
            supervisor_action(cmd, jobs);
            0
        }
    }
}

/// Child-side table: external programs and output-producing builtins.
/// State-mutating builtins are no-ops here; their effect would vanish with
/// the child.
fn spawned_action(cmd: &CommandKind) -> i32 {
    match cmd {
        CommandKind::Generic { argv } => run_generic(argv),
        CommandKind::Echo { args } => run_echo(args),
        CommandKind::Pwd => run_pwd(),
        CommandKind::Export { .. }
        | CommandKind::Cd { .. }
        | CommandKind::Kill { .. }
        | CommandKind::Jobs
        | CommandKind::Exit => 0,
    }
}

/// Shell-side table: exactly the builtins whose effect must outlive the
/// child (environment, working directory, signal delivery, job listing).
fn supervisor_action(cmd: &CommandKind, jobs: &mut JobRegistry) {
    match cmd {
        CommandKind::Export { name, value } => env::set_var(name, value),
        CommandKind::Cd { dir } => run_cd(dir.as_deref()),
        CommandKind::Kill { job_id, signal } => run_kill(jobs, *job_id, *signal),
        CommandKind::Jobs => jobs::list_jobs(jobs),
        CommandKind::Generic { .. }
        | CommandKind::Echo { .. }
        | CommandKind::Pwd
        | CommandKind::Exit => {}
    }
}

/// Replaces the process image with the named program, resolving it through
/// PATH. Only returns when the exec itself failed.
fn run_generic(argv: &[String]) -> i32 {
    if argv.is_empty() {
        debug_assert!(false, "generic command with empty argv");
        return 127;
    }
    let args: Vec<CString> = match argv
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()
    {
        Ok(args) => args,
        Err(_) => {
            eprintln!("ERROR: Argument contains an interior nul byte");
            return 127;
        }
    };
    if let Err(err) = unistd::execvp(&args[0], &args) {
        eprintln!("ERROR: Failed to execute {}: {}", argv[0], err);
    }
    127
}

fn run_echo(args: &[String]) -> i32 {
    write_stdout(&format!("{}\n", args.join(" ")))
}

fn run_pwd() -> i32 {
    match unistd::getcwd() {
        Ok(cwd) => write_stdout(&format!("{}\n", cwd.display())),
        Err(err) => {
            eprintln!("ERROR: Failed to read working directory: {}", err);
            1
        }
    }
}

/// Spawned-side output goes straight to descriptor 1: that is the stream the
/// spawner rewired, and a buffered writer inherited across the fork may point
/// somewhere else entirely.
fn write_stdout(text: &str) -> i32 {
    let bytes = text.as_bytes();
    let mut written = 0;
    while written < bytes.len() {
        match unistd::write(STDOUT_FILENO, &bytes[written..]) {
            Ok(n) => written += n,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                eprintln!("ERROR: Failed to write output: {}", err);
                return 1;
            }
        }
    }
    0
}

/// Resolves the target, changes directory, and updates PWD to the resolved
/// absolute path. A target that does not resolve leaves all state unchanged.
fn run_cd(dir: Option<&str>) {
    let target = match dir {
        Some(d) => PathBuf::from(d),
        None => match dirs_next::home_dir() {
            Some(home) => home,
            None => {
                eprintln!("ERROR: Failed to resolve home directory");
                return;
            }
        },
    };
    let resolved = match fs::canonicalize(&target) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("ERROR: Failed to resolve path {}: {}", target.display(), err);
            return;
        }
    };
    if let Err(err) = unistd::chdir(&resolved) {
        eprintln!("ERROR: Failed to change directory: {}", err);
        return;
    }
    env::set_var("PWD", &resolved);
}

/// Delivers a signal to every process of the requested job. Best effort: a
/// pid that already vanished is reported distinctly and skipped.
fn run_kill(jobs: &JobRegistry, job_id: i32, signum: i32) {
    let sig = match Signal::try_from(signum) {
        Ok(sig) => sig,
        Err(_) => {
            eprintln!("ERROR: Invalid signal number: {}", signum);
            return;
        }
    };
    let job = match jobs.find(job_id) {
        Some(job) => job,
        None => {
            eprintln!("ERROR: No such job: {}", job_id);
            return;
        }
    };
    for &pid in job.pids.iter() {
        match signal::kill(pid, sig) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                eprintln!("kill: process {} no longer exists", pid);
            }
            Err(err) => {
                eprintln!("ERROR: Failed to signal process {}: {}", pid, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::Job;

    #[test]
    fn spawned_side_ignores_shell_state_builtins() {
        assert_eq!(
            spawned_action(&CommandKind::Export {
                name: "A".into(),
                value: "B".into()
            }),
            0
        );
        assert_eq!(spawned_action(&CommandKind::Cd { dir: None }), 0);
        assert_eq!(spawned_action(&CommandKind::Jobs), 0);
        assert_eq!(
            spawned_action(&CommandKind::Kill {
                job_id: 1,
                signal: 9
            }),
            0
        );
    }

    #[test]
    fn supervisor_export_mutates_environment() {
        let mut jobs = JobRegistry::new();
        let cmd = CommandKind::Export {
            name: "QSH_BUILTIN_TEST".into(),
            value: "set".into(),
        };
        assert_eq!(run_command(Context::Supervisor, &cmd, &mut jobs), 0);
        assert_eq!(env::var("QSH_BUILTIN_TEST").as_deref(), Ok("set"));
    }

    #[test]
    fn supervisor_ignores_child_side_commands() {
        let mut jobs = JobRegistry::new();
        let cmd = CommandKind::Generic {
            argv: vec!["definitely-not-a-program".into()],
        };
        // Must not attempt an exec; just a no-op returning 0.
        assert_eq!(run_command(Context::Supervisor, &cmd, &mut jobs), 0);
    }

    #[test]
    fn kill_rejects_unknown_job() {
        let mut jobs = JobRegistry::new();
        let mut job = Job::new("sleep 1 &".into());
        job.id = jobs.next_id();
        jobs.push_back(job);
        // Only job 1 exists; signalling job 9 must not touch it.
        run_kill(&jobs, 9, 15);
        assert!(jobs.find(9).is_none());
        assert_eq!(jobs.len(), 1);
    }
}
