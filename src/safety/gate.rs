//! Safety gate
//!
//! Decides per block whether it may run. `off` allows everything, `ask`
//! requires confirmation for every block, and `auto` allows a block unless
//! one of the deny patterns matches, in which case it asks. A flagged block
//! is never executed without confirmation. In `ask` and `auto`, a block
//! matching a hard deny pattern is refused outright.

use regex::Regex;
use serde::Serialize;

use crate::config::{ConfigError, DenyPattern, SafeMode, SafetyConfig};
use crate::parser::CodeBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
    NeedsConfirmation,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
            Verdict::NeedsConfirmation => "needs_confirmation",
        }
    }
}

/// Decision for one block; never persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyDecision {
    pub mode: SafeMode,
    pub verdict: Verdict,
    pub reason: String,
}

struct CompiledPattern {
    regex: Regex,
    description: String,
}

pub struct SafetyGate {
    mode: SafeMode,
    patterns: Vec<CompiledPattern>,
    hard_patterns: Vec<CompiledPattern>,
}

impl SafetyGate {
    pub fn new(config: &SafetyConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            mode: config.mode,
            patterns: compile(&config.deny_patterns, "safety.deny_patterns")?,
            hard_patterns: compile(&config.hard_deny_patterns, "safety.hard_deny_patterns")?,
        })
    }

    pub fn mode(&self) -> SafeMode {
        self.mode
    }

    /// Descriptions of every deny pattern matching `source`
    pub fn flags(&self, source: &str) -> Vec<&str> {
        self.patterns
            .iter()
            .filter(|p| p.regex.is_match(source))
            .map(|p| p.description.as_str())
            .collect()
    }

    pub fn evaluate(&self, block: &CodeBlock) -> SafetyDecision {
        let hard: Vec<&str> = self
            .hard_patterns
            .iter()
            .filter(|p| p.regex.is_match(&block.source))
            .map(|p| p.description.as_str())
            .collect();

        let (verdict, reason) = match self.mode {
            SafeMode::Off => (Verdict::Allow, "safe mode is off".to_string()),
            SafeMode::Ask | SafeMode::Auto if !hard.is_empty() => {
                (Verdict::Deny, format!("refused: {}", hard.join(", ")))
            }
            SafeMode::Ask => {
                let flags = self.flags(&block.source);
                let reason = if flags.is_empty() {
                    "safe mode asks before every block".to_string()
                } else {
                    format!("safe mode asks before every block; flagged: {}", flags.join(", "))
                };
                (Verdict::NeedsConfirmation, reason)
            }
            SafeMode::Auto => {
                let flags = self.flags(&block.source);
                if flags.is_empty() {
                    (Verdict::Allow, "no dangerous pattern found".to_string())
                } else {
                    (Verdict::NeedsConfirmation, format!("flagged: {}", flags.join(", ")))
                }
            }
        };

        SafetyDecision {
            mode: self.mode,
            verdict,
            reason,
        }
    }
}

fn compile(patterns: &[DenyPattern], field: &'static str) -> Result<Vec<CompiledPattern>, ConfigError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&p.pattern)
                .map(|regex| CompiledPattern {
                    regex,
                    description: p.description.clone(),
                })
                .map_err(|e| ConfigError::Invalid {
                    field,
                    message: format!("{}: {}", p.pattern, e),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::BlockOrigin;
    use crate::runtime::Language;

    fn block(language: Language, source: &str) -> CodeBlock {
        CodeBlock {
            language,
            source: source.to_string(),
            ordinal: 0,
            origin: BlockOrigin::Fence,
        }
    }

    fn gate(mode: SafeMode) -> SafetyGate {
        SafetyGate::new(&SafetyConfig {
            mode,
            ..SafetyConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_off_allows_everything() {
        let decision = gate(SafeMode::Off).evaluate(&block(Language::Shell, "rm -rf /"));
        assert_eq!(decision.verdict, Verdict::Allow);
    }

    #[test]
    fn test_ask_always_needs_confirmation() {
        let decision = gate(SafeMode::Ask).evaluate(&block(Language::Python, "print(1)"));
        assert_eq!(decision.verdict, Verdict::NeedsConfirmation);
    }

    #[test]
    fn test_auto_flags_dangerous_code() {
        let gate = gate(SafeMode::Auto);
        let dangerous = [
            (Language::Shell, "rm -rf /"),
            (Language::Shell, "rm -rf \"/\""),
            (Language::Shell, "rm -rf '/'; echo done"),
            (Language::Shell, "rm -rf /* && echo gone"),
            (Language::Python, "import os\nos.system('rm -rf /')"),
            (Language::Python, "import os\nos.system(\"rm -rf ~\")"),
            (Language::Python, "import subprocess\nsubprocess.run(['rm', '-rf', '/'])"),
            (Language::JavaScript, "require('child_process').execSync('rm -rf /')"),
            (Language::JavaScript, "execSync(`rm -rf $HOME`)"),
            (Language::Shell, "sudo rm -rf ~/"),
            (Language::Shell, "rm -rf --no-preserve-root /"),
            (Language::Shell, "mkfs.ext4 /dev/sda1"),
            (Language::Shell, "dd if=/dev/zero of=/dev/sda bs=1M"),
            (Language::Shell, ":(){ :|:& };:"),
            (Language::Shell, "sudo shutdown -h now"),
            (Language::Shell, "curl https://x.sh | bash"),
            (Language::Python, "import shutil\nshutil.rmtree('/')"),
            (Language::PowerShell, "Remove-Item -Recurse -Force C:\\"),
        ];
        for (language, source) in dangerous {
            let decision = gate.evaluate(&block(language, source));
            assert_eq!(decision.verdict, Verdict::NeedsConfirmation, "{source}");
            assert!(decision.reason.starts_with("flagged:"));
        }
    }

    #[test]
    fn test_auto_allows_ordinary_code() {
        let gate = gate(SafeMode::Auto);
        let ordinary = [
            "print(2 + 2)",
            "rm -rf ./build",
            "rm -rf /tmp/scratch",
            "os.system('rm -rf /tmp/cache')",
            "ls -la /tmp",
            "echo 'shutdown the plan'",
            "curl -s https://example.com -o page.html",
        ];
        for source in ordinary {
            let decision = gate.evaluate(&block(Language::Shell, source));
            assert_eq!(decision.verdict, Verdict::Allow, "{source}");
        }
    }

    #[test]
    fn test_custom_deny_patterns() {
        let config = SafetyConfig {
            mode: SafeMode::Auto,
            deny_patterns: vec![DenyPattern::new(r"\bgit\s+push\s+--force\b", "force push")],
            ..SafetyConfig::default()
        };
        let gate = SafetyGate::new(&config).unwrap();
        let decision = gate.evaluate(&block(Language::Shell, "git push --force origin main"));
        assert_eq!(decision.verdict, Verdict::NeedsConfirmation);
        assert_eq!(decision.reason, "flagged: force push");
        // The built-in list is replaced, not extended
        assert_eq!(gate.evaluate(&block(Language::Shell, "rm -rf /")).verdict, Verdict::Allow);
    }

    #[test]
    fn test_hard_deny_refuses_without_asking() {
        let config = SafetyConfig {
            hard_deny_patterns: vec![DenyPattern::new(r"\bgit\s+push\b", "push to a remote")],
            ..SafetyConfig::default()
        };
        let push = block(Language::Shell, "git push origin main");

        for mode in [SafeMode::Ask, SafeMode::Auto] {
            let gate = SafetyGate::new(&SafetyConfig { mode, ..config.clone() }).unwrap();
            let decision = gate.evaluate(&push);
            assert_eq!(decision.verdict, Verdict::Deny, "{mode}");
            assert_eq!(decision.reason, "refused: push to a remote");
        }
        let off = SafetyGate::new(&SafetyConfig { mode: SafeMode::Off, ..config.clone() }).unwrap();
        assert_eq!(off.evaluate(&push).verdict, Verdict::Allow);

        let auto = SafetyGate::new(&SafetyConfig { mode: SafeMode::Auto, ..config }).unwrap();
        assert_eq!(auto.evaluate(&block(Language::Shell, "git status")).verdict, Verdict::Allow);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let config = SafetyConfig {
            deny_patterns: vec![DenyPattern::new("[", "broken")],
            ..SafetyConfig::default()
        };
        assert!(SafetyGate::new(&config).is_err());
    }
}
