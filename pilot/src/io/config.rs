//! Pilot configuration stored under `.pilot/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::compaction::CompactionPolicy;
use crate::core::routing::{RoutingTable, Tier};

pub const DEFAULT_CONFIG_PATH: &str = ".pilot/config.toml";

/// Pilot configuration (TOML).
///
/// Every section is optional; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PilotConfig {
    pub llm: LlmConfig,
    pub planner: PlannerConfig,
    pub safety: SafetyConfig,
    pub subagent: SubAgentLimits,
    pub tools: ToolsConfig,
    pub fixes: FixesConfig,
    pub events: EventsConfig,
}

/// Wire protocol spoken by a backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// `/v1/messages`.
    Anthropic,
    /// OpenAI-compatible `/chat/completions` (OpenAI, Groq, OpenRouter, ...).
    OpenAi,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    pub name: String,
    pub provider: Provider,
    pub model: String,
    /// Defaults to the provider's public endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

impl BackendConfig {
    pub fn endpoint(&self) -> String {
        let base = self.base_url.as_deref().unwrap_or(match self.provider {
            Provider::Anthropic => "https://api.anthropic.com",
            Provider::OpenAi => "https://api.openai.com/v1",
        });
        let base = base.trim_end_matches('/');
        match self.provider {
            Provider::Anthropic => format!("{base}/v1/messages"),
            Provider::OpenAi => format!("{base}/chat/completions"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LlmConfig {
    /// Backend name used for the fast tier.
    pub fast: String,
    /// Backend name used for the heavy tier.
    pub heavy: String,
    /// Backend used when the tier's backend is rate-limited or failing.
    pub fallback: Option<String>,
    /// Retries per call for transient errors before failing over.
    pub max_retries: u32,
    pub request_timeout_secs: u64,
    pub max_tokens: u32,
    pub routing: RoutingTable,
    pub backends: Vec<BackendConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            fast: "groq".to_string(),
            heavy: "claude".to_string(),
            fallback: Some("groq".to_string()),
            max_retries: 5,
            request_timeout_secs: 120,
            max_tokens: 4096,
            routing: RoutingTable::default(),
            backends: vec![
                BackendConfig {
                    name: "claude".to_string(),
                    provider: Provider::Anthropic,
                    model: "claude-sonnet-4-5".to_string(),
                    base_url: None,
                    api_key_env: "ANTHROPIC_API_KEY".to_string(),
                },
                BackendConfig {
                    name: "groq".to_string(),
                    provider: Provider::OpenAi,
                    model: "llama-3.3-70b-versatile".to_string(),
                    base_url: Some("https://api.groq.com/openai/v1".to_string()),
                    api_key_env: "GROQ_API_KEY".to_string(),
                },
            ],
        }
    }
}

impl LlmConfig {
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }

    pub fn tier_backend(&self, tier: Tier) -> &str {
        match tier {
            Tier::Fast => &self.fast,
            Tier::Heavy => &self.heavy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    /// Turns before the planner force-stops with a partial answer.
    pub max_turns: u32,
    pub max_history_messages: usize,
    /// Re-prompts for an empty reply after tool work.
    pub max_empty_retries: u32,
    pub max_task_chars: usize,
    pub max_tool_result_chars: usize,
    /// Tasks waiting behind the active one before intake rejects new ones.
    pub queue_capacity: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_turns: 50,
            max_history_messages: 80,
            max_empty_retries: 2,
            max_task_chars: 8000,
            max_tool_result_chars: 8000,
            queue_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SafetyConfig {
    /// Consecutive same-signature failures before the planner is told to stop retrying.
    pub max_retries: u32,
    /// Sub-agent deployments allowed per task.
    pub max_deployments: u32,
    /// Intake messages equal to one of these (case-insensitive) stop the active task.
    pub kill_words: Vec<String>,
    /// Allow `run_command` to execute commands matching the destructive patterns.
    pub allow_destructive_commands: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_deployments: 15,
            kill_words: vec!["stop".to_string(), "halt".to_string(), "abort".to_string()],
            allow_destructive_commands: false,
        }
    }
}

impl SafetyConfig {
    pub fn is_kill_word(&self, text: &str) -> bool {
        let text = text.trim();
        self.kill_words.iter().any(|kw| kw.eq_ignore_ascii_case(text))
    }
}

/// Thresholds enforced by every sub-agent runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SubAgentLimits {
    pub max_steps: u32,
    pub max_parallel_tools: usize,
    pub soft_dispatch_budget: u32,
    pub hard_dispatch_budget: u32,
    pub loop_window: usize,
    pub loop_repeats: usize,
    pub text_repeat_limit: usize,
    pub observe_streak_limit: usize,
    pub compaction_threshold: usize,
    pub compaction_keep_recent: usize,
    pub compaction_char_budget: usize,
    pub min_dispatches_for_done: u32,
    pub min_dispatches_for_text_conclusion: u32,
    pub conclusion_min_chars: usize,
    pub min_steps_before_stuck: u32,
    pub max_tool_result_chars: usize,
    /// Wall-clock limit for one deployment.
    pub timeout_secs: u64,
}

impl Default for SubAgentLimits {
    fn default() -> Self {
        Self {
            max_steps: 40,
            max_parallel_tools: 6,
            soft_dispatch_budget: 40,
            hard_dispatch_budget: 55,
            loop_window: 3,
            loop_repeats: 3,
            text_repeat_limit: 3,
            observe_streak_limit: 6,
            compaction_threshold: 20,
            compaction_keep_recent: 6,
            compaction_char_budget: 500,
            min_dispatches_for_done: 2,
            min_dispatches_for_text_conclusion: 8,
            conclusion_min_chars: 80,
            min_steps_before_stuck: 3,
            max_tool_result_chars: 8000,
            timeout_secs: 300,
        }
    }
}

impl SubAgentLimits {
    pub fn compaction(&self) -> CompactionPolicy {
        CompactionPolicy {
            threshold: self.compaction_threshold,
            keep_recent: self.compaction_keep_recent,
            char_budget: self.compaction_char_budget,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolsConfig {
    pub handler_timeout_secs: u64,
    /// Truncate `run_command` stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Max bytes returned by `read_file`.
    pub read_limit_bytes: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            handler_timeout_secs: 120,
            output_limit_bytes: 100_000,
            read_limit_bytes: 64_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FixesConfig {
    pub path: PathBuf,
    pub max_entries: usize,
}

impl Default for FixesConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".pilot/fixes.jsonl"),
            max_entries: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventsConfig {
    pub history_capacity: usize,
    pub subscriber_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            history_capacity: 500,
            subscriber_capacity: 256,
        }
    }
}

impl PilotConfig {
    pub fn validate(&self) -> Result<()> {
        let llm = &self.llm;
        if llm.backends.is_empty() {
            return Err(anyhow!("llm.backends must not be empty"));
        }
        for (idx, backend) in llm.backends.iter().enumerate() {
            if backend.name.trim().is_empty() || backend.model.trim().is_empty() {
                return Err(anyhow!("llm.backends[{idx}] needs a name and a model"));
            }
            if llm.backends[..idx].iter().any(|b| b.name == backend.name) {
                return Err(anyhow!("duplicate llm backend name: {}", backend.name));
            }
        }
        for (field, name) in [("llm.fast", &llm.fast), ("llm.heavy", &llm.heavy)] {
            if llm.backend(name).is_none() {
                return Err(anyhow!("{field} names unknown backend {name:?}"));
            }
        }
        if let Some(fallback) = &llm.fallback
            && llm.backend(fallback).is_none()
        {
            return Err(anyhow!("llm.fallback names unknown backend {fallback:?}"));
        }
        if llm.request_timeout_secs == 0 {
            return Err(anyhow!("llm.request_timeout_secs must be > 0"));
        }
        if self.planner.max_turns == 0 {
            return Err(anyhow!("planner.max_turns must be > 0"));
        }
        if self.planner.max_history_messages < 2 {
            return Err(anyhow!("planner.max_history_messages must be >= 2"));
        }
        let limits = &self.subagent;
        if limits.max_steps == 0 || limits.max_parallel_tools == 0 {
            return Err(anyhow!(
                "subagent.max_steps and subagent.max_parallel_tools must be > 0"
            ));
        }
        if limits.hard_dispatch_budget == 0
            || limits.soft_dispatch_budget > limits.hard_dispatch_budget
        {
            return Err(anyhow!(
                "subagent dispatch budgets need 0 < soft <= hard (soft={}, hard={})",
                limits.soft_dispatch_budget,
                limits.hard_dispatch_budget
            ));
        }
        if limits.loop_window == 0 || limits.loop_repeats < 2 || limits.text_repeat_limit < 2 {
            return Err(anyhow!(
                "subagent.loop_window must be > 0, loop_repeats and text_repeat_limit >= 2"
            ));
        }
        if limits.timeout_secs == 0 {
            return Err(anyhow!("subagent.timeout_secs must be > 0"));
        }
        if self.tools.handler_timeout_secs == 0 || self.tools.output_limit_bytes == 0 {
            return Err(anyhow!(
                "tools.handler_timeout_secs and tools.output_limit_bytes must be > 0"
            ));
        }
        if self.fixes.max_entries == 0 {
            return Err(anyhow!("fixes.max_entries must be > 0"));
        }
        if self.events.subscriber_capacity == 0 {
            return Err(anyhow!("events.subscriber_capacity must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PilotConfig::default()`.
pub fn load_config(path: &Path) -> Result<PilotConfig> {
    if !path.exists() {
        let cfg = PilotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PilotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PilotConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` to a sibling temp file, then rename over `path`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PilotConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("config.toml");
        let cfg = PilotConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert!(!temp.path().join("nested").join("config.toml.tmp").exists());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "[subagent]\nhard_dispatch_budget = 10\nsoft_dispatch_budget = 8\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.subagent.hard_dispatch_budget, 10);
        assert_eq!(cfg.subagent.max_parallel_tools, 6);
        assert_eq!(cfg.planner.max_turns, 50);
    }

    #[test]
    fn rejects_soft_budget_above_hard() {
        let mut cfg = PilotConfig::default();
        cfg.subagent.soft_dispatch_budget = 60;
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("soft <= hard"));
    }

    #[test]
    fn rejects_unknown_tier_backend() {
        let mut cfg = PilotConfig::default();
        cfg.llm.heavy = "nope".to_string();
        assert!(cfg.validate().is_err());
        cfg.llm.heavy = "claude".to_string();
        cfg.llm.fallback = Some("missing".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn kill_words_match_whole_message_case_insensitive() {
        let safety = SafetyConfig::default();
        assert!(safety.is_kill_word("  STOP "));
        assert!(!safety.is_kill_word("stop the web server"));
    }

    #[test]
    fn endpoints_follow_provider() {
        let cfg = LlmConfig::default();
        let claude = cfg.backend("claude").expect("claude");
        assert_eq!(claude.endpoint(), "https://api.anthropic.com/v1/messages");
        let groq = cfg.backend("groq").expect("groq");
        assert_eq!(
            groq.endpoint(),
            "https://api.groq.com/openai/v1/chat/completions"
        );
    }
}
