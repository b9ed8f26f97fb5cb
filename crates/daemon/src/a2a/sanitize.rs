//! Input validation
//!
//! Applied to every request before dispatch: structural size caps plus
//! pattern-based rejection of shell metacharacters, SQL keyword fragments,
//! and control characters. Violations are reported with enough context for
//! the audit log but never echoed back to the caller verbatim.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Longest permitted string anywhere in a request.
pub const MAX_STRING_CHARS: usize = 10_000;
/// Longest permitted array anywhere in a request.
pub const MAX_ARRAY_ELEMENTS: usize = 1_000;
/// Deepest permitted nesting.
const MAX_DEPTH: usize = 32;

static SHELL_META: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[;&|`$]|\$\(|>\s*/|<\s*/").expect("shell pattern"));

static SQL_FRAGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(union\s+select|select\s+[\w*,\s]+\s+from\s|insert\s+into\s|delete\s+from\s|drop\s+(table|database)\s|update\s+\w+\s+set\s|exec\s*\(|xp_cmdshell)",
    )
    .expect("sql pattern")
});

static CONTROL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]").expect("control pattern"));

/// A rejected input, with the JSON path that tripped the check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    StringTooLong,
    ArrayTooLarge,
    TooDeep,
    ShellMetacharacters,
    SqlFragment,
    ControlCharacters,
}

impl ViolationKind {
    pub fn label(self) -> &'static str {
        match self {
            ViolationKind::StringTooLong => "string_too_long",
            ViolationKind::ArrayTooLarge => "array_too_large",
            ViolationKind::TooDeep => "nesting_too_deep",
            ViolationKind::ShellMetacharacters => "shell_metacharacters",
            ViolationKind::SqlFragment => "sql_fragment",
            ViolationKind::ControlCharacters => "control_characters",
        }
    }

    /// Pattern violations are hostile; size violations are merely invalid.
    pub fn is_injection(self) -> bool {
        matches!(
            self,
            ViolationKind::ShellMetacharacters
                | ViolationKind::SqlFragment
                | ViolationKind::ControlCharacters
        )
    }
}

/// Scan a params tree. Returns the first violation found, if any.
pub fn scan(value: &Value) -> Option<Violation> {
    scan_inner(value, "params", 0)
}

fn scan_inner(value: &Value, path: &str, depth: usize) -> Option<Violation> {
    if depth > MAX_DEPTH {
        return Some(Violation {
            kind: ViolationKind::TooDeep,
            path: path.to_string(),
        });
    }
    match value {
        Value::String(s) => check_text(s, path),
        Value::Array(items) => {
            if items.len() > MAX_ARRAY_ELEMENTS {
                return Some(Violation {
                    kind: ViolationKind::ArrayTooLarge,
                    path: path.to_string(),
                });
            }
            for (i, item) in items.iter().enumerate() {
                if let Some(v) = scan_inner(item, &format!("{}[{}]", path, i), depth + 1) {
                    return Some(v);
                }
            }
            None
        }
        Value::Object(map) => {
            for (key, item) in map {
                if let Some(v) = check_text(key, path) {
                    return Some(v);
                }
                if let Some(v) = scan_inner(item, &format!("{}.{}", path, key), depth + 1) {
                    return Some(v);
                }
            }
            None
        }
        _ => None,
    }
}

/// Check a single text field.
pub fn check_text(text: &str, path: &str) -> Option<Violation> {
    if text.chars().count() > MAX_STRING_CHARS {
        return Some(Violation {
            kind: ViolationKind::StringTooLong,
            path: path.to_string(),
        });
    }
    if CONTROL_CHARS.is_match(text) {
        return Some(Violation {
            kind: ViolationKind::ControlCharacters,
            path: path.to_string(),
        });
    }
    if SHELL_META.is_match(text) {
        return Some(Violation {
            kind: ViolationKind::ShellMetacharacters,
            path: path.to_string(),
        });
    }
    if SQL_FRAGMENT.is_match(text) {
        return Some(Violation {
            kind: ViolationKind::SqlFragment,
            path: path.to_string(),
        });
    }
    None
}
