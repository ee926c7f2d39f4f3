//! Classification of raw sandbox output into a structured error taxonomy.
//!
//! The repair loop never inspects raw output itself — it asks this module
//! whether a run succeeded and, if not, which kind of error occurred and
//! whether another repair attempt is worth spending. Pure and idempotent:
//! the same output always classifies the same way.

use std::collections::HashSet;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

/// Error kinds recognized in Python tracebacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Syntax,
    Import,
    Name,
    Type,
    Value,
    Eof,
    Memory,
    Recursion,
    Assertion,
    Attribute,
    Index,
    Key,
    ZeroDivision,
    Runtime,
    Unknown,
}

/// A classified execution failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub message: String,
    /// Fatal kinds indicate structurally broken code that another repair
    /// attempt is unlikely to fix; the loop aborts instead of spending
    /// attempts.
    pub fatal: bool,
}

impl Classification {
    /// The classification assigned to a timed-out execution: a non-fatal
    /// runtime error, so the loop proceeds to repair.
    pub fn timeout(limit: Duration) -> Self {
        Self {
            kind: ErrorKind::Runtime,
            message: format!("execution timed out after {}s", limit.as_secs()),
            fatal: false,
        }
    }
}

/// One entry in the ordered output-pattern table.
struct OutputPattern {
    kind: ErrorKind,
    pattern: Regex,
}

/// Output classifier with a fixed pattern table and a configurable fatal set.
pub struct Classifier {
    patterns: Vec<OutputPattern>,
    fatal: HashSet<ErrorKind>,
}

impl Classifier {
    /// `import_errors_fatal` controls whether an Import classification
    /// aborts the session — a judgment call surfaced as policy.
    pub fn new(import_errors_fatal: bool) -> Self {
        let mut fatal: HashSet<ErrorKind> = [
            ErrorKind::Syntax,
            ErrorKind::Eof,
            ErrorKind::Memory,
            ErrorKind::Recursion,
        ]
        .into_iter()
        .collect();
        if import_errors_fatal {
            fatal.insert(ErrorKind::Import);
        }

        Self {
            patterns: default_patterns(),
            fatal,
        }
    }

    /// Classifies raw combined output. `None` means success: the output
    /// contains neither a traceback marker nor a generic `Error` token.
    pub fn classify(&self, output: &str) -> Option<Classification> {
        let has_traceback = output.contains("Traceback");
        let has_error_token = output.contains("Error");

        if !has_traceback && !has_error_token {
            return None;
        }

        for entry in &self.patterns {
            if let Some(m) = entry.pattern.find(output) {
                return Some(Classification {
                    kind: entry.kind,
                    message: m.as_str().trim().to_string(),
                    fatal: self.fatal.contains(&entry.kind),
                });
            }
        }

        // A traceback we cannot pin down is still a concrete runtime
        // failure; anything else is deliberately permissive so ambiguous
        // output does not block the loop from attempting repair.
        if has_traceback {
            Some(Classification {
                kind: ErrorKind::Runtime,
                message: last_nonempty_line(output),
                fatal: false,
            })
        } else {
            Some(Classification {
                kind: ErrorKind::Unknown,
                message: last_nonempty_line(output),
                fatal: false,
            })
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(true)
    }
}

fn last_nonempty_line(output: &str) -> String {
    output
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no output")
        .trim()
        .to_string()
}

/// The fixed output-pattern table, in match priority order.
fn default_patterns() -> Vec<OutputPattern> {
    let entry = |kind, pattern: &str| OutputPattern {
        kind,
        pattern: Regex::new(pattern).expect("output pattern"),
    };

    vec![
        entry(ErrorKind::Syntax, r"(?m)^\s*(?:SyntaxError|IndentationError|TabError).*$"),
        entry(
            ErrorKind::Import,
            r"(?m)^\s*(?:ModuleNotFoundError|ImportError).*$",
        ),
        entry(ErrorKind::Eof, r"(?m)^\s*EOFError.*$"),
        entry(ErrorKind::Memory, r"(?m)^\s*MemoryError.*$"),
        entry(
            ErrorKind::Recursion,
            r"(?m)^\s*RecursionError.*$|maximum recursion depth exceeded",
        ),
        entry(ErrorKind::Name, r"(?m)^\s*NameError.*$"),
        entry(ErrorKind::Type, r"(?m)^\s*TypeError.*$"),
        entry(ErrorKind::Value, r"(?m)^\s*ValueError.*$"),
        entry(ErrorKind::Assertion, r"(?m)^\s*AssertionError.*$"),
        entry(ErrorKind::Attribute, r"(?m)^\s*AttributeError.*$"),
        entry(ErrorKind::Index, r"(?m)^\s*IndexError.*$"),
        entry(ErrorKind::Key, r"(?m)^\s*KeyError.*$"),
        entry(ErrorKind::ZeroDivision, r"(?m)^\s*ZeroDivisionError.*$"),
    ]
}
