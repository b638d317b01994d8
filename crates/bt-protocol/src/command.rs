//! Worker-side translation command contract
//!
//! The coordinator runs exactly one program on the worker per segment:
//!
//! ```text
//! <remoteExecutable> --input <path> --output <path> --from <lang> --to <lang> --model <id> [--context <chars>]
//! ```
//!
//! Exit code 0 means the output file was written. Anything printed on
//! stdout/stderr is diagnostic only.

use crate::error::ProtocolError;

/// One invocation of the worker-side translation program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslateCommand {
    /// Program to run (absolute, or relative to the working directory)
    pub executable: String,
    /// Remote path of the segment source text
    pub input: String,
    /// Remote path the program must write the translation to
    pub output: String,
    /// Source language identifier
    pub from: String,
    /// Target language identifier
    pub to: String,
    /// Model/provider identifier
    pub model: String,
    /// Optional context budget in characters
    pub context: Option<u32>,
}

impl TranslateCommand {
    /// Argument vector, program first
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![
            self.executable.clone(),
            "--input".to_string(),
            self.input.clone(),
            "--output".to_string(),
            self.output.clone(),
            "--from".to_string(),
            self.from.clone(),
            "--to".to_string(),
            self.to.clone(),
            "--model".to_string(),
            self.model.clone(),
        ];
        if let Some(context) = self.context {
            argv.push("--context".to_string());
            argv.push(context.to_string());
        }
        argv
    }

    /// Render as a single shell command line, running from `workdir`
    pub fn to_shell(&self, workdir: &str) -> Result<String, ProtocolError> {
        self.check()?;
        let argv = self
            .argv()
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        Ok(format!("cd {} && {}", shell_quote(workdir), argv))
    }

    fn check(&self) -> Result<(), ProtocolError> {
        let fields = [
            ("executable", &self.executable),
            ("input", &self.input),
            ("output", &self.output),
            ("from", &self.from),
            ("to", &self.to),
            ("model", &self.model),
        ];
        for (name, value) in fields {
            if value.is_empty() {
                return Err(ProtocolError::EmptyArgument(name));
            }
        }
        Ok(())
    }

    /// Parse an argument vector produced by [`TranslateCommand::argv`]
    pub fn from_argv<S: AsRef<str>>(argv: &[S]) -> Option<Self> {
        let (executable, rest) = argv.split_first()?;
        let mut command = TranslateCommand {
            executable: executable.as_ref().to_string(),
            input: String::new(),
            output: String::new(),
            from: String::new(),
            to: String::new(),
            model: String::new(),
            context: None,
        };

        let mut args = rest.iter().map(|s| s.as_ref());
        while let Some(flag) = args.next() {
            let value = args.next()?;
            match flag {
                "--input" => command.input = value.to_string(),
                "--output" => command.output = value.to_string(),
                "--from" => command.from = value.to_string(),
                "--to" => command.to = value.to_string(),
                "--model" => command.model = value.to_string(),
                "--context" => command.context = Some(value.parse().ok()?),
                _ => return None,
            }
        }

        command.check().ok()?;
        Some(command)
    }
}

/// Quote a string for POSIX `sh`
///
/// Strings made only of unambiguous characters are returned unchanged.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | ',' | '+' | '=' | '@' | '%')
        });
    if safe {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Split a command line produced by [`shell_quote`]-joined words back into words
///
/// Supports bare words, single-quoted words and the `'\''` escape. Returns
/// `None` for anything else (double quotes, backslashes outside quotes).
pub fn shell_split(line: &str) -> Option<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '\'' => break,
                        other => current.push(other),
                    }
                }
            }
            '\\' => {
                in_word = true;
                current.push(chars.next()?);
            }
            '"' => return None,
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Some(words)
}
