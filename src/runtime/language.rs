//! Closed set of languages the engine can execute

use serde::{Deserialize, Serialize};

/// A language tag resolved against the supported runtimes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Shell,
    PowerShell,
    /// Any tag without a runtime adapter; keeps the original tag
    Unsupported(String),
}

impl Language {
    /// Every language with a runtime adapter
    pub const SUPPORTED: [Language; 4] = [
        Language::Python,
        Language::JavaScript,
        Language::Shell,
        Language::PowerShell,
    ];

    /// Resolve a fence tag or tool argument, case-insensitively
    pub fn from_tag(tag: &str) -> Self {
        let tag = tag.trim().to_ascii_lowercase();
        match tag.as_str() {
            "python" | "python3" | "py" => Language::Python,
            "javascript" | "js" | "node" | "nodejs" => Language::JavaScript,
            "shell" | "sh" | "bash" | "zsh" | "console" => Language::Shell,
            "powershell" | "pwsh" | "ps1" | "ps" => Language::PowerShell,
            _ => Language::Unsupported(tag),
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Language::Unsupported(_))
    }

    pub fn name(&self) -> &str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Shell => "shell",
            Language::PowerShell => "powershell",
            Language::Unsupported(tag) => tag,
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::Unsupported(tag) if tag.is_empty() => f.write_str("<untagged>"),
            other => f.write_str(other.name()),
        }
    }
}
