//! Quote-aware decomposition of a raw shell command.
//!
//! The rule engine never hands the raw string to a shell parser. It needs
//! the argv of every chained sub-command, the operators between them, any
//! substitution that would run code the rules cannot see, and whether the
//! invocation asks for privilege escalation. This module derives all of that
//! in a single pass that tracks quoting and backslash escapes.

use serde::{Deserialize, Serialize};

/// Leading token that requests privilege escalation.
pub const SUDO: &str = "sudo";

/// Operator joining two sub-commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainOperator {
    /// `;` or a newline.
    Sequence,
    /// `&&`
    And,
    /// `||`
    Or,
    /// `|` or `|&`
    Pipe,
    /// Trailing or infix `&`.
    Background,
}

impl ChainOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainOperator::Sequence => ";",
            ChainOperator::And => "&&",
            ChainOperator::Or => "||",
            ChainOperator::Pipe => "|",
            ChainOperator::Background => "&",
        }
    }
}

/// Inline substitution that executes code while the command line is expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Substitution {
    /// `` `...` ``
    Backtick,
    /// `$(...)`
    Dollar,
    /// `<(...)`
    ProcessInput,
    /// `>(...)`
    ProcessOutput,
}

impl Substitution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Substitution::Backtick => "`...`",
            Substitution::Dollar => "$(...)",
            Substitution::ProcessInput => "<(...)",
            Substitution::ProcessOutput => ">(...)",
        }
    }
}

/// One sub-command of a (possibly chained) command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    text: String,
    argv: Vec<String>,
    piped: bool,
}

impl Segment {
    /// Source text of this segment, trimmed.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Tokenized arguments, quotes removed.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// The leading executable.
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    /// Whether stdin is the previous segment's output (`a | b`).
    pub fn reads_pipe(&self) -> bool {
        self.piped
    }

    pub fn is_sudo(&self) -> bool {
        self.program() == Some(SUDO)
    }

    /// Arguments following a leading `sudo`, or the full argv otherwise.
    pub fn effective_argv(&self) -> &[String] {
        if self.is_sudo() {
            &self.argv[1..]
        } else {
            &self.argv
        }
    }
}

/// An immutable command as received from the caller, plus everything the
/// rule engine derives from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    raw: String,
    segments: Vec<Segment>,
    operators: Vec<ChainOperator>,
    substitutions: Vec<Substitution>,
    parse_error: Option<String>,
}

impl Command {
    /// Decompose a raw command string. Never fails: malformed input is
    /// recorded in [`Command::parse_error`] so the caller can reject it.
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let scan = scan(&raw);

        let mut parse_error = scan.error;
        let mut pieces = scan.pieces;
        let operators = scan.operators;

        // A trailing `;` or `&` leaves an empty final piece; that is fine.
        // Any other empty piece means an operator with nothing on one side.
        if pieces.len() > 1
            && pieces.last().is_some_and(|p| p.trim().is_empty())
            && matches!(
                operators.last(),
                Some(ChainOperator::Sequence) | Some(ChainOperator::Background)
            )
        {
            pieces.pop();
        }

        let mut segments = Vec::with_capacity(pieces.len());
        if !(pieces.len() == 1 && pieces[0].trim().is_empty()) {
            for (index, piece) in pieces.iter().enumerate() {
                let piped = index > 0 && operators.get(index - 1) == Some(&ChainOperator::Pipe);
                let text = piece.trim();
                if text.is_empty() {
                    parse_error.get_or_insert_with(|| "empty command in chain".to_string());
                    continue;
                }
                match shell_words::split(text) {
                    Ok(argv) if !argv.is_empty() => segments.push(Segment {
                        text: text.to_string(),
                        argv,
                        piped,
                    }),
                    Ok(_) => {
                        parse_error.get_or_insert_with(|| "empty command in chain".to_string());
                    }
                    Err(e) => {
                        parse_error.get_or_insert_with(|| format!("cannot tokenize '{}': {}", text, e));
                    }
                }
            }
        }

        Self {
            raw,
            segments,
            operators,
            substitutions: scan.substitutions,
            parse_error,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.trim().is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn operators(&self) -> &[ChainOperator] {
        &self.operators
    }

    pub fn substitutions(&self) -> &[Substitution] {
        &self.substitutions
    }

    pub fn parse_error(&self) -> Option<&str> {
        self.parse_error.as_deref()
    }

    /// Whether the command joins more than one sub-command.
    pub fn is_chained(&self) -> bool {
        self.segments.len() > 1
    }

    pub fn runs_in_background(&self) -> bool {
        self.operators.contains(&ChainOperator::Background)
    }

    /// Whether any sub-command starts with `sudo`.
    pub fn is_privileged(&self) -> bool {
        self.segments.iter().any(Segment::is_sudo)
    }

    /// Leading executable of the first sub-command.
    pub fn program(&self) -> Option<&str> {
        self.segments.first().and_then(Segment::program)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

struct Scan {
    pieces: Vec<String>,
    operators: Vec<ChainOperator>,
    substitutions: Vec<Substitution>,
    error: Option<String>,
}

/// Split on unquoted chain operators and record substitutions.
///
/// Single quotes suppress everything. Double quotes still allow `$(` and
/// backticks, which the shell expands inside them.
fn scan(raw: &str) -> Scan {
    let chars: Vec<char> = raw.chars().collect();
    let mut pieces = Vec::new();
    let mut operators = Vec::new();
    let mut substitutions = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match quote {
            Some('\'') => {
                current.push(c);
                if c == '\'' {
                    quote = None;
                }
            }
            Some(_) => {
                current.push(c);
                match c {
                    '\\' => {
                        if let Some(n) = next {
                            current.push(n);
                            i += 1;
                        }
                    }
                    '"' => quote = None,
                    '`' => substitutions.push(Substitution::Backtick),
                    '$' if next == Some('(') => substitutions.push(Substitution::Dollar),
                    _ => {}
                }
            }
            None => match c {
                '\\' => {
                    current.push(c);
                    if let Some(n) = next {
                        current.push(n);
                        i += 1;
                    }
                }
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                '`' => {
                    substitutions.push(Substitution::Backtick);
                    current.push(c);
                }
                '$' if next == Some('(') => {
                    substitutions.push(Substitution::Dollar);
                    current.push(c);
                }
                '<' if next == Some('(') => {
                    substitutions.push(Substitution::ProcessInput);
                    current.push(c);
                }
                '>' if next == Some('(') => {
                    substitutions.push(Substitution::ProcessOutput);
                    current.push(c);
                }
                ';' | '\n' => {
                    pieces.push(std::mem::take(&mut current));
                    operators.push(ChainOperator::Sequence);
                }
                '&' if next == Some('&') => {
                    pieces.push(std::mem::take(&mut current));
                    operators.push(ChainOperator::And);
                    i += 1;
                }
                '|' if next == Some('|') => {
                    pieces.push(std::mem::take(&mut current));
                    operators.push(ChainOperator::Or);
                    i += 1;
                }
                '|' => {
                    if next == Some('&') {
                        i += 1;
                    }
                    pieces.push(std::mem::take(&mut current));
                    operators.push(ChainOperator::Pipe);
                }
                '&' => {
                    // `2>&1`, `>&2` and `&>file` are redirections.
                    let prev = current.chars().last();
                    if matches!(prev, Some('>') | Some('<')) || next == Some('>') {
                        current.push(c);
                    } else {
                        pieces.push(std::mem::take(&mut current));
                        operators.push(ChainOperator::Background);
                    }
                }
                _ => current.push(c),
            },
        }
        i += 1;
    }

    pieces.push(current);

    let error = quote.map(|q| format!("unterminated {} quote", if q == '\'' { "single" } else { "double" }));

    Scan {
        pieces,
        operators,
        substitutions,
        error,
    }
}
