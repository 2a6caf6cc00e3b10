use std::env;
use std::mem;

pub const MAXARGS: usize = 128;

/// What a single pipeline stage asks the shell to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    /// An external program; `argv[0]` is the program name.
    Generic { argv: Vec<String> },
    /// Prints its space-joined arguments and a newline.
    Echo { args: Vec<String> },
    /// Sets or overwrites an environment variable.
    Export { name: String, value: String },
    /// Changes the working directory; `None` targets the home directory.
    Cd { dir: Option<String> },
    Pwd,
    /// Lists the tracked background jobs.
    Jobs,
    /// Delivers a signal to every process of the given job.
    Kill { job_id: i32, signal: i32 },
    Exit,
}

/// One stage of a parsed pipeline together with its stream wiring.
///
/// `append` is meaningful only when `redirect_out` is set; exactly one of
/// truncate/append applies to an output redirection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub cmd: CommandKind,
    pub piped_in: bool,
    pub piped_out: bool,
    pub redirect_in: Option<String>,
    pub redirect_out: Option<String>,
    pub append: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
    pub background: bool,
}

/// Parses one command line into a pipeline of stage descriptors plus a
/// background flag. Handles tokenization (with quoting), input redirection
/// ("<"), output redirection (">" truncating, ">>" appending), pipelines
/// ("|"), background execution ("&"), and `$VAR`/`~` expansion per token.
pub fn parse_command_line(cmdline: &str) -> Result<Pipeline, String> {
    let tokens = tokenize(cmdline);
    if tokens.is_empty() {
        return Err("Empty command line".into());
    }

    #[derive(Default)]
    struct RawStage {
        argv: Vec<String>,
        redirect_in: Option<String>,
        redirect_out: Option<String>,
        append: bool,
    }

    let mut raw_stages: Vec<RawStage> = Vec::new();
    let mut current = RawStage::default();
    let mut background = false;

    let mut iter = tokens.into_iter();
    while let Some(token) = iter.next() {
        match token.as_str() {
            "<" => match iter.next() {
                Some(file) => current.redirect_in = Some(substitute_token(&file)),
                None => return Err("No input file specified".into()),
            },
            ">" | ">>" => match iter.next() {
                Some(file) => {
                    current.redirect_out = Some(substitute_token(&file));
                    current.append = token == ">>";
                }
                None => return Err("No output file specified".into()),
            },
            "|" => {
                if current.argv.is_empty() {
                    return Err("Empty command before '|'".into());
                }
                raw_stages.push(mem::take(&mut current));
            }
            "&" => {
                background = true;
            }
            _ => {
                if current.argv.len() >= MAXARGS - 1 {
                    return Err("Too many arguments".into());
                }
                current.argv.push(substitute_token(&token));
            }
        }
    }

    if current.argv.is_empty() {
        if !raw_stages.is_empty() {
            return Err("Empty command after '|'".into());
        }
        return Err("Empty command line".into());
    }
    raw_stages.push(current);

    let count = raw_stages.len();
    let mut stages = Vec::with_capacity(count);
    for (i, raw) in raw_stages.into_iter().enumerate() {
        stages.push(Stage {
            cmd: classify(raw.argv)?,
            piped_in: i > 0,
            piped_out: i + 1 < count,
            redirect_in: raw.redirect_in,
            redirect_out: raw.redirect_out,
            append: raw.append,
        });
    }
    Ok(Pipeline { stages, background })
}

/// Maps a stage's argv onto the command kind the dispatcher understands.
fn classify(argv: Vec<String>) -> Result<CommandKind, String> {
    match argv[0].as_str() {
        "echo" => Ok(CommandKind::Echo {
            args: argv[1..].to_vec(),
        }),
        "pwd" => Ok(CommandKind::Pwd),
        "jobs" => Ok(CommandKind::Jobs),
        "exit" | "quit" => Ok(CommandKind::Exit),
        "cd" => Ok(CommandKind::Cd {
            dir: argv.get(1).cloned(),
        }),
        "export" => parse_export(&argv),
        "kill" => parse_kill(&argv),
        _ => Ok(CommandKind::Generic { argv }),
    }
}

/// `export NAME=VALUE`
fn parse_export(argv: &[String]) -> Result<CommandKind, String> {
    let assignment = argv
        .get(1)
        .ok_or_else(|| String::from("export: expected NAME=VALUE"))?;
    match assignment.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok(CommandKind::Export {
            name: name.to_string(),
            value: value.to_string(),
        }),
        _ => Err(format!("export: invalid assignment: {}", assignment)),
    }
}

/// `kill <signal> <job>`; accepts the `-SIG` and `%JOB` spellings as well as
/// bare numbers.
fn parse_kill(argv: &[String]) -> Result<CommandKind, String> {
    if argv.len() != 3 {
        return Err("kill: expected a signal number and a job id".into());
    }
    let signal = argv[1]
        .trim_start_matches('-')
        .parse::<i32>()
        .map_err(|_| format!("kill: invalid signal: {}", argv[1]))?;
    let job_id = argv[2]
        .trim_start_matches('%')
        .parse::<i32>()
        .map_err(|_| format!("kill: invalid job id: {}", argv[2]))?;
    Ok(CommandKind::Kill { job_id, signal })
}

/// Splits the command line into tokens, honoring single/double quotes and
/// the special tokens `<`, `>`, `>>`, `|`, and `&`.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        if ch == '"' || ch == '\'' {
            let quote = ch;
            chars.next();
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                chars.next();
                if c == quote {
                    break;
                }
                token.push(c);
            }
            tokens.push(token);
        } else if ch == '>' {
            chars.next();
            if chars.peek() == Some(&'>') {
                chars.next();
                tokens.push(">>".to_string());
            } else {
                tokens.push(">".to_string());
            }
        } else if ch == '<' || ch == '|' || ch == '&' {
            chars.next();
            tokens.push(ch.to_string());
        } else {
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == '<' || c == '>' || c == '|' || c == '&' {
                    break;
                }
                token.push(c);
                chars.next();
            }
            tokens.push(token);
        }
    }
    tokens
}

/// Per-token expansion: `$VAR` resolves against the environment (empty when
/// unset), a leading `~` resolves to the home directory. Anything else passes
/// through unchanged.
fn substitute_token(token: &str) -> String {
    if let Some(var) = token.strip_prefix('$') {
        if !var.is_empty() {
            return env::var(var).unwrap_or_default();
        }
    }
    if token == "~" || token.starts_with("~/") {
        if let Some(home) = dirs_next::home_dir() {
            return format!("{}{}", home.display(), &token[1..]);
        }
    }
    token.to_string()
}
