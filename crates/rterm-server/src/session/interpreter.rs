//! Interpreter profiles: how to launch a shell and speak to it over pipes.
//!
//! The session logic only depends on the profile's knobs (prompt terminator,
//! line terminator, exit / directory instructions, echo behaviour); the
//! platform differences live here.

/// Prompt used for POSIX shells unless configured otherwise.
pub const DEFAULT_POSIX_PROMPT: &str = "rterm> ";

/// Shell family, decides quoting and native instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpreterKind {
    /// `sh`, `bash`, `dash`, `zsh`, ... driven with `-i` and a fixed `PS1`.
    Posix,
    /// Windows `cmd.exe`.
    Cmd,
}

/// Launch parameters and protocol knobs for one interpreter.
#[derive(Debug, Clone)]
pub struct Interpreter {
    pub kind: InterpreterKind,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Prompt text before the terminator (e.g. `rterm` for `rterm> `).
    pub prompt_prefix: String,
    /// Character that ends the shell prompt.
    pub prompt_terminator: char,
    pub line_terminator: &'static str,
    pub exit_instruction: &'static str,
    /// Native instruction that prints the current directory.
    pub print_directory: &'static str,
    /// Whether the shell writes each received command line back to stdout.
    pub echoes_input: bool,
}

impl Interpreter {
    /// POSIX shell run interactively with a deterministic prompt.
    ///
    /// `PS2` is cleared so continuation prompts never look like a finished
    /// command.
    pub fn posix(program: &str, args: Option<Vec<String>>, prompt: &str) -> Self {
        let prompt = if prompt.trim().is_empty() {
            DEFAULT_POSIX_PROMPT
        } else {
            prompt
        };
        let visible = prompt.trim_end();
        let prompt_terminator = visible.chars().last().unwrap_or('>');
        let prompt_prefix = visible[..visible.len() - prompt_terminator.len_utf8()].to_string();

        let args = args.unwrap_or_else(|| {
            if program_name(program) == "bash" {
                vec!["--norc".into(), "--noprofile".into(), "-i".into()]
            } else {
                vec!["-i".into()]
            }
        });

        Self {
            kind: InterpreterKind::Posix,
            program: program.to_string(),
            args,
            env: vec![
                ("PS1".into(), prompt.to_string()),
                ("PS2".into(), String::new()),
                ("TERM".into(), "dumb".into()),
            ],
            prompt_prefix,
            prompt_terminator,
            line_terminator: "\n",
            exit_instruction: "exit",
            print_directory: "pwd",
            echoes_input: false,
        }
    }

    /// Windows command interpreter. Its prompt is `<cwd>>` and it echoes
    /// every command line after the prompt.
    pub fn cmd(program: &str, args: Option<Vec<String>>) -> Self {
        Self {
            kind: InterpreterKind::Cmd,
            program: program.to_string(),
            args: args.unwrap_or_default(),
            env: Vec::new(),
            prompt_prefix: String::new(),
            prompt_terminator: '>',
            line_terminator: "\r\n",
            exit_instruction: "exit",
            // `cd` without arguments prints the current directory on cmd.exe
            print_directory: "cd",
            echoes_input: true,
        }
    }

    /// Build a profile from an optional configured shell, falling back to the
    /// platform default (`cmd.exe` on Windows, `/bin/sh` elsewhere).
    pub fn from_config(shell: Option<&str>, args: Option<Vec<String>>, prompt: &str) -> Self {
        match shell {
            Some(program) if is_cmd(program) => Self::cmd(program, args),
            Some(program) => Self::posix(program, args, prompt),
            None => Self::platform_default(args, prompt),
        }
    }

    #[cfg(windows)]
    fn platform_default(args: Option<Vec<String>>, _prompt: &str) -> Self {
        let program = std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string());
        Self::cmd(&program, args)
    }

    #[cfg(not(windows))]
    fn platform_default(args: Option<Vec<String>>, prompt: &str) -> Self {
        Self::posix("/bin/sh", args, prompt)
    }

    /// A command line as written to the shell's stdin.
    pub fn command_line(&self, command: &str) -> String {
        format!("{command}{}", self.line_terminator)
    }

    /// The exit instruction including its line terminator.
    pub fn exit_line(&self) -> String {
        self.command_line(self.exit_instruction)
    }

    /// Instruction that moves the shell into `path`.
    pub fn change_directory_instruction(&self, path: &str) -> String {
        match self.kind {
            InterpreterKind::Posix => format!("cd '{}'", path.replace('\'', r"'\''")),
            InterpreterKind::Cmd => format!("cd /d \"{path}\""),
        }
    }

    /// The prompt text preceding the terminator for a shell sitting in
    /// `working_directory`.
    pub fn prompt_text(&self, working_directory: &str) -> String {
        match self.kind {
            InterpreterKind::Posix => self.prompt_prefix.clone(),
            InterpreterKind::Cmd => working_directory.to_string(),
        }
    }
}

/// Lower-cased file stem, accepting both `/` and `\\` separators.
fn program_name(program: &str) -> String {
    let file = program.rsplit(['/', '\\']).next().unwrap_or(program);
    file.split('.').next().unwrap_or(file).to_ascii_lowercase()
}

fn is_cmd(program: &str) -> bool {
    program_name(program) == "cmd"
}
