//! The variable/context environment threaded through condition evaluation,
//! command evaluation, and output-variable propagation.
//!
//! This is deliberately a minimal `${VAR}`/`$VAR` substitution engine plus
//! backtick command substitution — not a full templating language. Richer
//! expansion (pipelines, functions, conditionals) is explicitly out of scope;
//! the only contract the rest of the scheduler relies on is that evaluation
//! is side-effect-free and returns either a string or an error.

use regex::Regex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error, Clone)]
pub enum EvalError {
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    #[error("command substitution failed: {0}")]
    CommandSubstitution(String),

    #[error("invalid regular expression '{0}': {1}")]
    InvalidRegex(String, String),
}

fn var_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap())
}

fn backtick_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`([^`]*)`").unwrap())
}

/// Per-node (or per-handler) variable scope. Cheap to clone; never shared
/// mutably beyond the task that builds it — downstream scopes are built
/// fresh by reading each upstream node's published `output_variables` under
/// that node's own lock (see `graph::ExecutionGraph::scope_for`).
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: HashMap<String, String>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vars(vars: HashMap<String, String>) -> Self {
        Self { vars }
    }

    pub fn store(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn load(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.vars
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = (String, String)>) {
        self.vars.extend(other);
    }

    /// Substitutes `${VAR}`/`$VAR` references (undefined variables expand to
    /// the empty string, matching shell semantics) and then evaluates any
    /// backtick-delimited command substitutions left over.
    pub async fn eval_string(&self, template: &str) -> Result<String, EvalError> {
        let substituted = var_pattern().replace_all(template, |caps: &regex::Captures| {
            let name = caps.get(1).or_else(|| caps.get(2)).unwrap().as_str();
            self.load(name).unwrap_or("").to_string()
        });

        if !backtick_pattern().is_match(&substituted) {
            return Ok(substituted.into_owned());
        }

        let mut out = String::with_capacity(substituted.len());
        let mut last = 0;
        for caps in backtick_pattern().captures_iter(&substituted) {
            let whole = caps.get(0).unwrap();
            out.push_str(&substituted[last..whole.start()]);
            let cmd = caps.get(1).unwrap().as_str();
            out.push_str(run_command_capture(cmd).await?.trim_end_matches('\n'));
            last = whole.end();
        }
        out.push_str(&substituted[last..]);
        Ok(out)
    }

    /// Evaluates `value` as a string and interprets it as a boolean: empty,
    /// `"false"`, or `"0"` are false; everything else is true.
    pub async fn eval_bool(&self, value: &str) -> Result<bool, EvalError> {
        let evaluated = self.eval_string(value).await?;
        let trimmed = evaluated.trim();
        Ok(!(trimmed.is_empty() || trimmed.eq_ignore_ascii_case("false") || trimmed == "0"))
    }

    /// Matches `actual` against an `expected` spec that is either a literal
    /// (exact match) or, when prefixed `re:`, a regex applied to `actual`.
    pub fn matches_expected(actual: &str, expected: &str) -> Result<bool, EvalError> {
        if let Some(pattern) = expected.strip_prefix("re:") {
            let re = Regex::new(pattern)
                .map_err(|e| EvalError::InvalidRegex(pattern.to_string(), e.to_string()))?;
            Ok(re.is_match(actual))
        } else {
            Ok(actual == expected)
        }
    }
}

async fn run_command_capture(cmd: &str) -> Result<String, EvalError> {
    let shell = resolve_shell(None).unwrap_or_else(|| "/bin/sh".to_string());
    let output = Command::new(&shell)
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| EvalError::CommandSubstitution(e.to_string()))?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Resolves the shell to invoke for condition commands and `command`-form
/// steps: the caller's `preferred` shell, falling back to `$SHELL`, falling
/// back to `/bin/sh`. Returns `None` only if every fallback is empty, which
/// cannot happen with the built-in default.
pub fn resolve_shell(preferred: Option<&str>) -> Option<String> {
    if let Some(p) = preferred {
        if !p.is_empty() {
            return Some(p.to_string());
        }
    }
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| Some("/bin/sh".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn substitutes_braced_and_bare_vars() {
        let mut env = Env::new();
        env.store("NAME", "world");
        let out = env.eval_string("hello ${NAME} and $NAME").await.unwrap();
        assert_eq!(out, "hello world and world");
    }

    #[tokio::test]
    async fn undefined_variable_expands_to_empty() {
        let env = Env::new();
        let out = env.eval_string("[${MISSING}]").await.unwrap();
        assert_eq!(out, "[]");
    }

    #[tokio::test]
    async fn evaluates_backtick_command_substitution() {
        let env = Env::new();
        let out = env.eval_string("`echo hi`").await.unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn eval_bool_treats_zero_and_false_as_false() {
        let env = Env::new();
        assert!(!env.eval_bool("false").await.unwrap());
        assert!(!env.eval_bool("0").await.unwrap());
        assert!(!env.eval_bool("").await.unwrap());
        assert!(env.eval_bool("1").await.unwrap());
        assert!(env.eval_bool("yes").await.unwrap());
    }

    #[test]
    fn matches_expected_exact_and_regex() {
        assert!(Env::matches_expected("0", "0").unwrap());
        assert!(!Env::matches_expected("1", "0").unwrap());
        assert!(Env::matches_expected("abc123", "re:^abc\\d+$").unwrap());
        assert!(!Env::matches_expected("xyz", "re:^abc\\d+$").unwrap());
    }

    #[test]
    fn resolve_shell_prefers_explicit_argument() {
        assert_eq!(resolve_shell(Some("/bin/zsh")), Some("/bin/zsh".to_string()));
    }
}
