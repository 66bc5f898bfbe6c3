//! Safe-command policy: a pure predicate deciding whether a shell tool
//! call can run without human approval.
//!
//! Decision order: extract a command string from the opaque tool-input
//! preview, reject anything matching the danger pattern set, strip an
//! optional leading `env VAR=value` prefix, then require one of the safe
//! command prefixes. Everything else needs approval. Both pattern sets
//! ship defaults and accept additive overrides from configuration.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::PolicyConfig;

/// Patterns that always force approval, regardless of any safe prefix.
/// Covers filesystem mutation, privilege escalation, process termination,
/// output redirection, subshells, pipe-to-shell, write-style git, and
/// write-style HTTP.
const DEFAULT_DANGER_PATTERNS: &[&str] = &[
    r"\brm\b",
    r"\bmv\b",
    r"\bcp\b",
    r"\bsudo\b",
    r"\bkill(all)?\b",
    r"\bshutdown\b",
    r"\breboot\b",
    r">",
    r"`",
    r"\$\(",
    r"\|\s*(sh|bash|zsh|dash)\b",
    r"\bgit\s+(push|reset|rebase|clean|checkout|restore|commit|merge|filter-branch)\b",
    r"\bcurl\b.*(-X\s*(POST|PUT|DELETE|PATCH)|--data\b|-d\s|--upload-file\b)",
    r"\bwget\b.*--(post-data|post-file|method)\b",
];

/// Command prefixes that run without approval: read-only filesystem
/// viewers, read-only git, version/list probes, standard build-and-test
/// scripts, and common text processing.
const DEFAULT_SAFE_PREFIXES: &[&str] = &[
    "ls",
    "cat",
    "head",
    "tail",
    "grep",
    "rg",
    "find",
    "wc",
    "file",
    "stat",
    "du",
    "pwd",
    "which",
    "echo",
    "jq",
    "yq",
    "sort",
    "uniq",
    "diff",
    "git status",
    "git log",
    "git diff",
    "git show",
    "git branch",
    "git blame",
    "npm run build",
    "npm run test",
    "npm run lint",
    "npm test",
    "npm ls",
    "node --version",
    "python --version",
    "tsc --noEmit",
    "cargo check",
    "cargo tree",
];

static ENV_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^env(\s+[A-Za-z_][A-Za-z0-9_]*=\S*)+\s+").expect("env prefix regex")
});

/// The policy. Construction compiles the pattern tables once; evaluation
/// is a pure function of the input.
pub struct CommandPolicy {
    danger: Vec<Regex>,
    safe_prefixes: Vec<String>,
}

impl CommandPolicy {
    /// Build the policy from shipped defaults plus config extras.
    pub fn new(config: &PolicyConfig) -> Self {
        let danger = DEFAULT_DANGER_PATTERNS
            .iter()
            .map(|p| (*p, Regex::new(p)))
            .chain(
                config
                    .extra_danger_patterns
                    .iter()
                    .map(|p| (p.as_str(), Regex::new(p))),
            )
            .filter_map(|(src, compiled)| match compiled {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!("Ignoring unparseable danger pattern '{}': {}", src, e);
                    None
                }
            })
            .collect();

        let safe_prefixes = DEFAULT_SAFE_PREFIXES
            .iter()
            .map(|s| s.to_string())
            .chain(config.extra_safe_prefixes.iter().cloned())
            .collect();

        Self {
            danger,
            safe_prefixes,
        }
    }

    /// Whether this tool input may run without approval.
    pub fn is_safe(&self, input: &serde_json::Value) -> bool {
        let Some(command) = extract_command(input) else {
            return false;
        };
        let command = command.trim();
        if command.is_empty() {
            return false;
        }

        if self.danger.iter().any(|re| re.is_match(command)) {
            return false;
        }

        let stripped = ENV_PREFIX.replace(command, "");
        let stripped = stripped.trim_start();

        self.safe_prefixes.iter().any(|prefix| {
            stripped.strip_prefix(prefix.as_str()).is_some_and(|rest| {
                rest.is_empty() || rest.starts_with(char::is_whitespace)
            })
        })
    }
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new(&PolicyConfig::default())
    }
}

/// Pull a command string out of a tool-input preview.
///
/// Tries the common field names used by shell-style tools; an array
/// `args` field is joined with spaces. As a last resort a single-key
/// object with a string value is treated as the command.
fn extract_command(input: &serde_json::Value) -> Option<String> {
    if let Some(s) = input.as_str() {
        return Some(s.to_string());
    }

    let obj = input.as_object()?;
    for key in ["command", "cmd", "script", "shell", "input"] {
        if let Some(s) = obj.get(key).and_then(|v| v.as_str()) {
            return Some(s.to_string());
        }
    }
    if let Some(args) = obj.get("args").and_then(|v| v.as_array()) {
        let parts: Vec<&str> = args.iter().filter_map(|v| v.as_str()).collect();
        if !parts.is_empty() {
            return Some(parts.join(" "));
        }
    }
    if obj.len() == 1 {
        if let Some(s) = obj.values().next().and_then(|v| v.as_str()) {
            return Some(s.to_string());
        }
    }
    None
}
