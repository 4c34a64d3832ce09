//! Client command lines and the reserved tokens the server intercepts.

/// Tokens that end the session (exact, case-sensitive).
pub const EXIT_TOKENS: [&str; 2] = ["exit", "quit"];

/// Token replaced by the interpreter's native print-directory instruction.
pub const PRINT_DIRECTORY_TOKEN: &str = "pwd";

/// Strip one trailing `\n` and then one trailing `\r`.
pub fn strip_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Whether `line` is one of the session-ending tokens.
pub fn is_exit(line: &str) -> bool {
    EXIT_TOKENS.contains(&line)
}

/// A single command line received from a client, classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandLine<'a> {
    /// Blank line; nothing to do.
    Empty,
    /// `exit` or `quit`.
    Exit,
    /// `pwd`.
    PrintDirectory,
    /// `cd` / `chdir` with its (possibly empty) argument.
    ChangeDirectory(&'a str),
    /// Anything else, passed to the shell verbatim.
    Shell(&'a str),
}

impl<'a> CommandLine<'a> {
    /// Classify a line whose line ending has already been stripped.
    pub fn parse(line: &'a str) -> Self {
        if line.trim().is_empty() {
            return CommandLine::Empty;
        }
        if is_exit(line) {
            return CommandLine::Exit;
        }
        if line == PRINT_DIRECTORY_TOKEN {
            return CommandLine::PrintDirectory;
        }
        if let Some(arg) = change_directory_argument(line) {
            return CommandLine::ChangeDirectory(arg);
        }
        CommandLine::Shell(line)
    }
}

fn change_directory_argument(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    for verb in ["cd", "chdir"] {
        if let Some(rest) = trimmed.strip_prefix(verb) {
            if rest.is_empty() {
                return Some("");
            }
            if rest.starts_with([' ', '\t']) {
                return Some(unquote(rest.trim()));
            }
        }
    }
    None
}

fn unquote(arg: &str) -> &str {
    for quote in ['"', '\''] {
        if arg.len() >= 2 && arg.starts_with(quote) && arg.ends_with(quote) {
            return &arg[1..arg.len() - 1];
        }
    }
    arg
}
