//! Static validation of untrusted Python candidates.
//!
//! Deny-by-default gate that runs before any execution: a fixed, ordered
//! table of dangerous-capability patterns, then an import allow-list, then
//! a call allow-list. Pattern-based, not AST-based — the sandbox remains
//! the enforcement boundary; this layer exists to reject obviously
//! disallowed capabilities cheaply and to give the repair loop a precise
//! violation to feed back to the model.
//!
//! Every candidate goes through the same checks, including repaired ones —
//! repair never gets a trusted bypass.

use std::collections::HashSet;

use regex::Regex;
use serde::Serialize;

use crate::config::ValidatorConfig;

/// Modules a candidate may import (top-level name).
const ALLOWED_MODULES: &[&str] = &[
    "math",
    "random",
    "datetime",
    "collections",
    "itertools",
    "functools",
    "string",
    "re",
    "json",
    "csv",
    "typing",
    "enum",
];

/// Builtins a candidate may call without defining them.
const ALLOWED_BUILTINS: &[&str] = &[
    "abs",
    "all",
    "any",
    "bool",
    "dict",
    "divmod",
    "enumerate",
    "filter",
    "float",
    "format",
    "frozenset",
    "hash",
    "int",
    "isinstance",
    "issubclass",
    "iter",
    "len",
    "list",
    "map",
    "max",
    "min",
    "next",
    "pow",
    "print",
    "range",
    "repr",
    "reversed",
    "round",
    "set",
    "sorted",
    "str",
    "sum",
    "tuple",
    "type",
    "zip",
];

/// Python keywords — excluded from the call scan (`return (x)` is not a call).
const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "case", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "match", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// Capability category of a rejected candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCategory {
    System,
    FileIo,
    Network,
    Execution,
    Input,
    Shell,
    Import,
    Env,
    UnauthorizedModule,
    UnauthorizedCall,
}

/// The single violation reported for a rejected candidate (first match wins).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub category: ViolationCategory,
    pub detail: String,
}

/// Accept/reject decision for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    Rejected(Violation),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// One entry in the ordered dangerous-pattern table.
struct DangerRule {
    category: ViolationCategory,
    pattern: Regex,
    detail: &'static str,
}

/// Pre-validation sanitization: normalize line endings so patterns are
/// platform-independent, and neutralize a shebang line by commenting it
/// out instead of rejecting the candidate.
pub fn sanitize(code: &str) -> String {
    let code = code.replace("\r\n", "\n").replace('\r', "\n");
    if code.starts_with("#!") {
        format!("# {code}")
    } else {
        code
    }
}

/// Static validator with a pluggable rule table and overridable allow-sets.
pub struct Validator {
    rules: Vec<DangerRule>,
    allowed_modules: HashSet<String>,
    allowed_builtins: HashSet<String>,
    keywords: HashSet<&'static str>,
    import_re: Regex,
    from_import_re: Regex,
    def_re: Regex,
    decorator_re: Regex,
    call_re: Regex,
}

impl Validator {
    pub fn new(config: &ValidatorConfig) -> Self {
        let allowed_modules = if config.allowed_modules.is_empty() {
            ALLOWED_MODULES.iter().map(|s| s.to_string()).collect()
        } else {
            config.allowed_modules.iter().cloned().collect()
        };
        let allowed_builtins = if config.allowed_builtins.is_empty() {
            ALLOWED_BUILTINS.iter().map(|s| s.to_string()).collect()
        } else {
            config.allowed_builtins.iter().cloned().collect()
        };

        Self {
            rules: default_rules(),
            allowed_modules,
            allowed_builtins,
            keywords: PYTHON_KEYWORDS.iter().copied().collect(),
            import_re: Regex::new(r"(?m)^\s*import\s+(.+)$").expect("import regex"),
            from_import_re: Regex::new(r"(?m)^\s*from\s+([A-Za-z_][\w.]*)\s+import\s+(.+)$")
                .expect("from-import regex"),
            def_re: Regex::new(r"(?m)^\s*(?:async\s+)?(?:def|class)\s+([A-Za-z_]\w*)")
                .expect("def regex"),
            decorator_re: Regex::new(r"(?m)^\s*@\s*([A-Za-z_][\w.]*)").expect("decorator regex"),
            call_re: Regex::new(r"([A-Za-z_][\w.]*)\s*\(").expect("call regex"),
        }
    }

    /// Validates one candidate. Pure — no I/O, no side effects.
    ///
    /// Checks run in priority order and the first failing rule terminates
    /// with that violation: dangerous patterns, then the import allow-list,
    /// then the call allow-list.
    pub fn validate(&self, code: &str) -> Verdict {
        for rule in &self.rules {
            if let Some(m) = rule.pattern.find(code) {
                return Verdict::Rejected(Violation {
                    category: rule.category,
                    detail: format!("{}: `{}`", rule.detail, m.as_str().trim()),
                });
            }
        }

        let imports = match self.scan_imports(code) {
            Ok(imports) => imports,
            Err(violation) => return Verdict::Rejected(violation),
        };

        if let Err(violation) = self.scan_calls(code, &imports) {
            return Verdict::Rejected(violation);
        }

        Verdict::Accepted
    }

    /// Collects the names bound by import statements, rejecting any module
    /// outside the allow-set. Returns both module bindings (`import math
    /// as m` binds `m`) and names pulled in via `from math import sqrt`.
    fn scan_imports(&self, code: &str) -> Result<ImportedSymbols, Violation> {
        let mut symbols = ImportedSymbols::default();

        for caps in self.import_re.captures_iter(code) {
            for part in caps[1].split(',') {
                let mut tokens = part.split_whitespace();
                let module = match tokens.next() {
                    Some(m) => m,
                    None => continue,
                };
                let root = module.split('.').next().unwrap_or(module);
                if !self.allowed_modules.contains(root) {
                    return Err(unauthorized_module(root));
                }
                // `import math as m` binds `m`; plain `import math` binds `math`
                let binding = match (tokens.next(), tokens.next()) {
                    (Some("as"), Some(alias)) => alias,
                    _ => root,
                };
                symbols.modules.insert(binding.to_string());
            }
        }

        for caps in self.from_import_re.captures_iter(code) {
            let root = caps[1].split('.').next().unwrap_or(&caps[1]).to_string();
            if !self.allowed_modules.contains(&root) {
                return Err(unauthorized_module(&root));
            }
            // Handles both `import a, b as c` and the parenthesized form.
            for part in caps[2].split(',') {
                let mut tokens = part.split_whitespace();
                let name = match tokens.next() {
                    Some("*") | None => continue,
                    Some(n) => n.trim_matches(|c| c == '(' || c == ')'),
                };
                if name.is_empty() {
                    continue;
                }
                let binding = match (tokens.next(), tokens.next()) {
                    (Some("as"), Some(alias)) => alias.trim_matches(|c| c == '(' || c == ')'),
                    _ => name,
                };
                symbols.names.insert(binding.to_string());
            }
        }

        Ok(symbols)
    }

    /// Checks every identifier immediately followed by a call parenthesis
    /// against the exemption rules; anything unresolvable is rejected.
    fn scan_calls(&self, code: &str, imports: &ImportedSymbols) -> Result<(), Violation> {
        let mut defined: HashSet<&str> = HashSet::new();
        for caps in self.def_re.captures_iter(code) {
            defined.insert(caps.get(1).expect("def capture").as_str());
        }
        for caps in self.decorator_re.captures_iter(code) {
            let name = caps.get(1).expect("decorator capture").as_str();
            defined.insert(name.split('.').next().unwrap_or(name));
        }

        for caps in self.call_re.captures_iter(code) {
            let m = caps.get(1).expect("call capture");
            let name = m.as_str();

            // Attribute call on a non-identifier receiver, e.g. `"a b".split()`
            // — the receiver is not statically resolvable, leave it to the
            // sandbox.
            if m.start() > 0 && code.as_bytes()[m.start() - 1] == b'.' {
                continue;
            }

            let exempt = if let Some((root, _)) = name.split_once('.') {
                imports.modules.contains(root)
                    || root == "self"
                    || root == "cls"
                    || starts_uppercase(root)
            } else {
                self.keywords.contains(name)
                    || defined.contains(name)
                    || imports.names.contains(name)
                    || self.allowed_builtins.contains(name)
                    || starts_uppercase(name)
            };

            if !exempt {
                return Err(Violation {
                    category: ViolationCategory::UnauthorizedCall,
                    detail: format!("call to '{name}' is not allowed"),
                });
            }
        }

        Ok(())
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(&ValidatorConfig::default())
    }
}

/// Names bound by the candidate's import statements.
#[derive(Default)]
struct ImportedSymbols {
    /// Local names bound to allowed modules (`math`, or `m` for `as m`).
    modules: HashSet<String>,
    /// Names pulled in via `from <allowed> import ...`.
    names: HashSet<String>,
}

fn starts_uppercase(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

fn unauthorized_module(root: &str) -> Violation {
    Violation {
        category: ViolationCategory::UnauthorizedModule,
        detail: format!("module '{root}' is not in the allow-list"),
    }
}

/// The fixed dangerous-pattern table, in priority order. First match wins.
fn default_rules() -> Vec<DangerRule> {
    let rule = |category, pattern: &str, detail| DangerRule {
        category,
        pattern: Regex::new(pattern).expect("danger rule regex"),
        detail,
    };

    vec![
        rule(
            ViolationCategory::System,
            r"\bos\s*\.\s*(system|popen|spawn\w*|exec[lv]\w*|kill|fork|remove|unlink|rmdir|rename)\b",
            "system call through the os module",
        ),
        rule(
            ViolationCategory::FileIo,
            r"\bopen\s*\(|\bio\s*\.\s*open\b|\bshutil\b|\bpathlib\b",
            "file I/O",
        ),
        rule(
            ViolationCategory::Network,
            r"\b(socket|requests|urllib|http\.client|ftplib|smtplib|telnetlib)\b",
            "network access",
        ),
        rule(
            ViolationCategory::Execution,
            r"\b(eval|exec|compile)\s*\(|__import__",
            "dynamic code execution",
        ),
        rule(ViolationCategory::Input, r"\binput\s*\(", "interactive input"),
        rule(
            ViolationCategory::Shell,
            r"\b(subprocess|pty)\b|\bcommands\s*\.",
            "shell invocation",
        ),
        rule(ViolationCategory::Import, r"\bimportlib\b", "reflective import"),
        rule(
            ViolationCategory::Env,
            r"\bos\s*\.\s*(environ|getenv|putenv)\b|\bgetpass\b|\bdotenv\b",
            "environment access",
        ),
    ]
}
