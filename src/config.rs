//! Engine configuration
//!
//! One `EngineConfig` is built at startup (defaults, then an optional JSON
//! file, then `LOCALAGENT_*` environment overrides), validated once, and
//! shared by `Arc` into the router, controller and runtime registry.
//!
//! ```ignore
//! let config = EngineConfig::from_file("localagent.json")?.with_env_overrides()?;
//! config.validate()?;
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Smallest accepted output budget
pub const MIN_OUTPUT_CHARS: usize = 100;
/// Largest accepted output budget
pub const MAX_OUTPUT_CHARS: usize = 100_000;

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Complete configuration for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model: ModelConfig,
    pub router: RouterConfig,
    pub safety: SafetyConfig,
    pub runtime: RuntimeConfig,
    pub output: OutputConfig,
    pub agent: AgentConfig,
}

impl EngineConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `LOCALAGENT_*` environment variables on top of this config
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (used by tests)
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(url) = lookup("LOCALAGENT_OLLAMA_URL") {
            self.model.base_url = url;
        }
        if let Some(model) = lookup("LOCALAGENT_AGENT_MODEL") {
            self.model.agent_model = model;
        }
        if let Some(model) = lookup("LOCALAGENT_CHAT_MODEL") {
            self.model.chat_model = model;
        }
        if let Some(mode) = lookup("LOCALAGENT_SAFE_MODE") {
            self.safety.mode = mode.parse()?;
        }
        if let Some(max) = lookup("LOCALAGENT_MAX_OUTPUT") {
            self.output.max_output_chars = max.trim().parse().map_err(|_| {
                ConfigError::invalid("output.max_output_chars", format!("not an integer: {max}"))
            })?;
        }
        Ok(self)
    }

    /// Check every section; the first problem found is returned
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = self.output.max_output_chars;
        if !(MIN_OUTPUT_CHARS..=MAX_OUTPUT_CHARS).contains(&max) {
            return Err(ConfigError::invalid(
                "output.max_output_chars",
                format!("must be between {MIN_OUTPUT_CHARS} and {MAX_OUTPUT_CHARS}, got {max}"),
            ));
        }
        if !(0.0..=1.0).contains(&self.output.head_ratio) {
            return Err(ConfigError::invalid(
                "output.head_ratio",
                format!("must be within [0, 1], got {}", self.output.head_ratio),
            ));
        }
        if self.agent.max_turns == 0 {
            return Err(ConfigError::invalid("agent.max_turns", "must be at least 1"));
        }
        if self.agent.keep_recent_entries == 0 {
            return Err(ConfigError::invalid("agent.keep_recent_entries", "must be at least 1"));
        }
        if self.runtime.execution_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "runtime.execution_timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.runtime.start_attempts == 0 {
            return Err(ConfigError::invalid("runtime.start_attempts", "must be at least 1"));
        }
        if self.safety.confirmation_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "safety.confirmation_timeout_secs",
                "must be greater than 0",
            ));
        }
        for pattern in &self.safety.deny_patterns {
            Regex::new(&pattern.pattern).map_err(|e| {
                ConfigError::invalid("safety.deny_patterns", format!("{}: {}", pattern.pattern, e))
            })?;
        }
        for pattern in &self.safety.hard_deny_patterns {
            Regex::new(&pattern.pattern).map_err(|e| {
                ConfigError::invalid("safety.hard_deny_patterns", format!("{}: {}", pattern.pattern, e))
            })?;
        }
        for marker in &self.router.agent_markers {
            if marker.trim().is_empty() {
                return Err(ConfigError::invalid("router.agent_markers", "markers must not be blank"));
            }
        }
        Ok(())
    }
}

/// Model backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of the Ollama server
    pub base_url: String,
    /// Code-capable model used on the agent path
    pub agent_model: String,
    /// Small, fast model used on the chat path
    pub chat_model: String,
    pub temperature: f32,
    /// Send the `execute` tool schema and accept native tool calls
    pub native_tool_calls: bool,
    /// Replaces the default agent system prompt
    pub system_prompt: Option<String>,
    /// Extra text appended to the agent system prompt
    pub custom_instructions: String,
    /// System prompt for the chat path
    pub chat_system_prompt: String,
    /// HTTP request timeout for one model call
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            agent_model: "qwen2.5-coder:14b".to_string(),
            chat_model: "qwen2.5:3b".to_string(),
            temperature: 0.0,
            native_tool_calls: false,
            system_prompt: None,
            custom_instructions: String::new(),
            chat_system_prompt: "You are a helpful, concise assistant.".to_string(),
            request_timeout_secs: 300,
        }
    }
}

/// Chat/agent routing rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Message prefixes that force the agent path
    pub agent_markers: Vec<String>,
    /// Words implying an action request
    pub keywords: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let keywords = [
            "run", "execute", "install", "download", "file", "files", "folder", "directory",
            "script", "code", "compute", "calculate", "plot", "open", "delete", "create",
            "list", "search", "shell", "terminal", "python", "javascript", "powershell",
            "运行", "执行", "安装", "下载", "文件", "目录", "代码", "计算", "创建", "删除",
        ];
        Self {
            agent_markers: vec!["/agent".to_string(), "!".to_string()],
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// Safety mode applied before each block executes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafeMode {
    /// Execute everything
    #[default]
    Off,
    /// Ask before every block
    Ask,
    /// Execute unless a deny pattern matches, then ask
    Auto,
}

impl SafeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafeMode::Off => "off",
            SafeMode::Ask => "ask",
            SafeMode::Auto => "auto",
        }
    }
}

impl std::fmt::Display for SafeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SafeMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(SafeMode::Off),
            "ask" => Ok(SafeMode::Ask),
            "auto" => Ok(SafeMode::Auto),
            other => Err(ConfigError::invalid(
                "safety.mode",
                format!("'{other}' is not one of off, ask, auto"),
            )),
        }
    }
}

/// A regex flagging a dangerous operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyPattern {
    pub pattern: String,
    pub description: String,
}

impl DenyPattern {
    pub fn new(pattern: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            description: description.into(),
        }
    }
}

/// Built-in deny list used when none is configured
pub fn default_deny_patterns() -> Vec<DenyPattern> {
    vec![
        DenyPattern::new(
            r#"(?m)\brm\s+(-[a-zA-Z]*[rR][a-zA-Z]*\s+|--recursive\s+)+(-\S+\s+)*['"`]?(/\*?|~/?|\$HOME/?)['"`]?(\s|$|;|&|\||['"`)\]])"#,
            "recursive delete of a root or home path",
        ),
        DenyPattern::new(r"\bmkfs(\.\w+)?\b", "filesystem format"),
        DenyPattern::new(r"\bdd\b[^\n]*\bof=/dev/", "raw write to a block device"),
        DenyPattern::new(r":\(\)\s*\{\s*:\|:&\s*\}\s*;\s*:", "fork bomb"),
        DenyPattern::new(r"(?m)(^|[;&|]\s*|sudo\s+)(shutdown|reboot|halt|poweroff)\b", "host power control"),
        DenyPattern::new(r"(?m)\bchmod\s+-R\s+0?777\s+/(\s|$)", "recursive permission change on /"),
        DenyPattern::new(r"\b(curl|wget)\b[^\n|]*\|\s*(sudo\s+)?(ba|z)?sh\b", "download piped into a shell"),
        DenyPattern::new(r#"shutil\.rmtree\(\s*['"](/|~|C:\\\\?)['"]"#, "recursive delete of a root path"),
        DenyPattern::new(
            r#"['"]rm['"]\s*,\s*['"]-[a-zA-Z]*[rR][a-zA-Z]*['"]\s*,\s*(['"]-\S*['"]\s*,\s*)*['"](/\*?|~/?)['"]"#,
            "recursive delete of a root or home path",
        ),
        DenyPattern::new(
            r"(?im)Remove-Item\b[^\n]*-Recurse[^\n]*\b[A-Z]:\\?(\s|$)",
            "recursive delete of a drive root",
        ),
        DenyPattern::new(r"(?i)\bformat\s+[A-Z]:", "drive format"),
        DenyPattern::new(r">\s*/dev/sd[a-z]\b", "overwrite of a disk device"),
    ]
}

/// Safety gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub mode: SafeMode,
    pub deny_patterns: Vec<DenyPattern>,
    /// Blocks matching these are refused without asking, in `ask` and `auto`
    pub hard_deny_patterns: Vec<DenyPattern>,
    /// How long an `ask` confirmation may stay pending before it counts as denied
    pub confirmation_timeout_secs: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            mode: SafeMode::Off,
            deny_patterns: default_deny_patterns(),
            hard_deny_patterns: Vec::new(),
            confirmation_timeout_secs: 60,
        }
    }
}

impl SafetyConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

/// Program and arguments used to launch one language runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Launch commands for each supported language
///
/// The driver script is appended after `args` for every language but the shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeCommands {
    pub python: CommandSpec,
    pub javascript: CommandSpec,
    pub shell: CommandSpec,
    pub powershell: CommandSpec,
}

impl Default for RuntimeCommands {
    fn default() -> Self {
        let python = if cfg!(windows) { "python" } else { "python3" };
        Self {
            python: CommandSpec::new(python, &["-u", "-c"]),
            javascript: CommandSpec::new("node", &["-e"]),
            shell: CommandSpec::new("bash", &["--noprofile", "--norc"]),
            powershell: CommandSpec::new(
                "pwsh",
                &["-NoLogo", "-NoProfile", "-NonInteractive", "-Command"],
            ),
        }
    }
}

/// Execution session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Wall-clock limit for a single block
    pub execution_timeout_secs: u32,
    /// How long an interrupted runtime gets to reach its end marker
    pub interrupt_grace_ms: u64,
    /// Kill the session after a timeout instead of keeping it
    pub terminate_on_timeout: bool,
    /// Sessions idle longer than this are terminated
    pub idle_timeout_secs: u64,
    /// Sessions older than this are terminated
    pub max_lifetime_secs: u64,
    /// Launch attempts before a language is marked unsupported
    pub start_attempts: u32,
    pub start_retry_delay_ms: u64,
    /// How long a new runtime may take to report ready
    pub start_timeout_secs: u64,
    /// Period of the idle-session reaper
    pub reap_interval_secs: u64,
    pub commands: RuntimeCommands,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: 30,
            interrupt_grace_ms: 2_000,
            terminate_on_timeout: true,
            idle_timeout_secs: 600,
            max_lifetime_secs: 3_600,
            start_attempts: 3,
            start_retry_delay_ms: 250,
            start_timeout_secs: 10,
            reap_interval_secs: 30,
            commands: RuntimeCommands::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.execution_timeout_secs))
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

/// Output governor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Character budget for one execution result
    pub max_output_chars: usize,
    /// Share of the budget kept from the start of the output
    pub head_ratio: f64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_output_chars: 2_800,
            head_ratio: 0.4,
        }
    }
}

/// Who the model sees execution output from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSender {
    #[default]
    User,
    Tool,
}

/// Conversation loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum model calls per request
    pub max_turns: usize,
    /// Stop the turn at the first failing block
    pub halt_on_error: bool,
    /// Execute a fence left open at end of response
    pub flush_incomplete_blocks: bool,
    /// Language for fences without a tag; `None` marks them unsupported
    pub default_language: Option<String>,
    /// Phrases in the assistant reply that end the loop
    pub loop_breakers: Vec<String>,
    /// `{content}` is replaced by the governed output
    pub code_output_template: String,
    pub empty_code_output_template: String,
    pub code_output_sender: OutputSender,
    /// Transcript size, in characters, above which older entries are
    /// summarized for the model; 0 sends everything
    pub max_context_chars: usize,
    /// Entries always sent verbatim once the window applies
    pub keep_recent_entries: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            halt_on_error: false,
            flush_incomplete_blocks: false,
            default_language: Some("python".to_string()),
            loop_breakers: vec![
                "The task is done.".to_string(),
                "The task is impossible.".to_string(),
                "Let me know what you'd like to do next.".to_string(),
                "Please provide more information.".to_string(),
            ],
            code_output_template: "Code output: {content}\n\nWhat does this output mean / what's next (if anything, or are we done)?".to_string(),
            empty_code_output_template: "The code above was executed on my machine. It produced no text output. What's next (if anything, or are we done?)".to_string(),
            code_output_sender: OutputSender::User,
            max_context_chars: 32_768,
            keep_recent_entries: 4,
        }
    }
}
