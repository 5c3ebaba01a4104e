//! Validation phase collaborators
//!
//! The default validator is a light syntax check: JSON must parse, source
//! files must have balanced brackets outside strings and comments.

use crate::evolution::task::PhaseResult;
use async_trait::async_trait;
use std::path::Path;

/// Checks that one generated file is well formed
#[async_trait]
pub trait SourceValidator: Send + Sync {
    async fn validate(&self, path: &Path, contents: &str) -> PhaseResult;
}

struct Syntax {
    line_comments: &'static [&'static str],
    block_comment: Option<(&'static str, &'static str)>,
    quotes: &'static [char],
    triple_quotes: bool,
    char_literals: bool,
}

const PYTHON: Syntax = Syntax {
    line_comments: &["#"],
    block_comment: None,
    quotes: &['"', '\''],
    triple_quotes: true,
    char_literals: false,
};

const C_LIKE: Syntax = Syntax {
    line_comments: &["//"],
    block_comment: Some(("/*", "*/")),
    quotes: &['"', '\'', '`'],
    triple_quotes: false,
    char_literals: false,
};

const RUST: Syntax = Syntax {
    line_comments: &["//"],
    block_comment: Some(("/*", "*/")),
    quotes: &['"'],
    triple_quotes: false,
    char_literals: true,
};

const CONFIG: Syntax = Syntax {
    line_comments: &["#"],
    block_comment: None,
    quotes: &['"', '\''],
    triple_quotes: false,
    char_literals: false,
};

/// Extension-driven syntax checks
#[derive(Debug, Clone, Copy, Default)]
pub struct SyntaxValidator;

impl SyntaxValidator {
    pub fn check(path: &Path, contents: &str) -> Result<(), String> {
        if contents.trim().is_empty() {
            return Err(format!("{} is empty", path.display()));
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let syntax = match ext.as_str() {
            "json" => {
                return serde_json::from_str::<serde_json::Value>(contents)
                    .map(|_| ())
                    .map_err(|e| format!("{}: invalid JSON: {}", path.display(), e));
            }
            "py" => &PYTHON,
            "rs" => &RUST,
            "js" | "jsx" | "ts" | "tsx" | "java" | "go" | "c" | "h" | "cpp" | "cs" => &C_LIKE,
            "toml" | "yaml" | "yml" => &CONFIG,
            _ => return Ok(()),
        };

        check_brackets(contents, syntax).map_err(|e| format!("{}: {}", path.display(), e))
    }
}

#[async_trait]
impl SourceValidator for SyntaxValidator {
    async fn validate(&self, path: &Path, contents: &str) -> PhaseResult {
        match Self::check(path, contents) {
            Ok(()) => PhaseResult::Completed,
            Err(reason) => PhaseResult::Failed(format!("Syntax error in {}", reason)),
        }
    }
}

fn closing_for(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

fn check_brackets(src: &str, syntax: &Syntax) -> Result<(), String> {
    let chars: Vec<char> = src.chars().collect();
    let starts_with = |i: usize, pat: &str| -> bool {
        let mut j = i;
        for p in pat.chars() {
            if chars.get(j) != Some(&p) {
                return false;
            }
            j += 1;
        }
        true
    };

    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];

        if let Some(marker) = syntax.line_comments.iter().find(|m| starts_with(i, m)) {
            i += marker.chars().count();
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        if let Some((open, close)) = syntax.block_comment {
            if starts_with(i, open) {
                let start_line = line;
                i += open.chars().count();
                loop {
                    if i >= chars.len() {
                        return Err(format!("unterminated block comment starting on line {}", start_line));
                    }
                    if starts_with(i, close) {
                        i += close.chars().count();
                        break;
                    }
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
                continue;
            }
        }

        if syntax.char_literals && c == '\'' {
            // 'x' or '\n' is a char literal; anything else is a lifetime
            if chars.get(i + 1) == Some(&'\\') {
                let mut j = i + 2;
                while j < chars.len() && chars[j] != '\'' && chars[j] != '\n' {
                    j += 1;
                }
                i = j + 1;
                continue;
            }
            if chars.get(i + 2) == Some(&'\'') {
                i += 3;
                continue;
            }
            i += 1;
            continue;
        }

        if syntax.quotes.contains(&c) {
            let start_line = line;
            let triple = syntax.triple_quotes
                && chars.get(i + 1) == Some(&c)
                && chars.get(i + 2) == Some(&c);
            let width = if triple { 3 } else { 1 };
            i += width;
            loop {
                if i >= chars.len() {
                    return Err(format!("unterminated string starting on line {}", start_line));
                }
                let ch = chars[i];
                if ch == '\\' {
                    i += 2;
                    continue;
                }
                if ch == '\n' {
                    if !triple && c != '`' && c != '"' {
                        return Err(format!("unterminated string on line {}", start_line));
                    }
                    line += 1;
                }
                if ch == c
                    && (!triple
                        || (chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c)))
                {
                    i += width;
                    break;
                }
                i += 1;
            }
            continue;
        }

        match c {
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => match stack.pop() {
                Some((open, _)) if closing_for(open) == c => {}
                Some((open, open_line)) => {
                    return Err(format!(
                        "mismatched '{}' on line {} (opened '{}' on line {})",
                        c, line, open, open_line
                    ))
                }
                None => return Err(format!("unexpected '{}' on line {}", c, line)),
            },
            '\n' => line += 1,
            _ => {}
        }
        i += 1;
    }

    match stack.pop() {
        Some((open, open_line)) => Err(format!("unclosed '{}' from line {}", open, open_line)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(name: &str, src: &str) -> Result<(), String> {
        SyntaxValidator::check(Path::new(name), src)
    }

    #[test]
    fn test_json_must_parse() {
        assert!(check("users.json", r#"{"table": "users", "columns": []}"#).is_ok());
        assert!(check("users.json", r#"{"table": "users""#).is_err());
    }

    #[test]
    fn test_empty_file_rejected() {
        assert!(check("models.py", "   \n").is_err());
        assert!(check("notes.txt", "").is_err());
    }

    #[test]
    fn test_python_strings_and_comments_ignored() {
        let src = "class User(Model):\n    # closing ) in comment\n    name = Column(String(50), doc=\"a ) b\")\n    bio = '''multi\n( line'''\n";
        assert!(check("models.py", src).is_ok());
        assert!(check("models.py", "def f(:\n    return [1, 2\n").is_err());
    }

    #[test]
    fn test_rust_lifetimes_and_chars() {
        let src = "fn first<'a>(s: &'a str) -> char {\n    let open = '{';\n    /* } */ s.chars().next().unwrap_or('\\n')\n}\n";
        assert!(check("lib.rs", src).is_ok());
        assert!(check("lib.rs", "fn main() { let v = vec![1, 2; }").is_err());
    }

    #[test]
    fn test_js_template_literal_spans_lines() {
        let src = "const q = `\nselect * from users where id = ${id}\n`;\nfunction f() { return q; }\n";
        assert!(check("api.ts", src).is_ok());
    }

    #[test]
    fn test_unknown_extension_only_needs_content() {
        assert!(check("README", "(((").is_ok());
    }

    #[tokio::test]
    async fn test_validator_reports_phase_failure() {
        let result = SyntaxValidator
            .validate(Path::new("broken.json"), "{")
            .await;
        assert!(matches!(result, PhaseResult::Failed(reason) if reason.contains("broken.json")));
    }
}
