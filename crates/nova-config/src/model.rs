use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration. Every section falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: HashMap<String, LlmProviderConfig>,
    pub agent: AgentConfig,
    pub prompt: PromptBudgetConfig,
    pub tool_loop: ToolLoopConfig,
    pub dedupe: DedupeConfig,
    pub idempotency: IdempotencyConfig,
    pub fast_path: FastPathConfig,
    pub refine: RefineConfig,
    pub storage: StorageConfig,
    pub gateway: GatewayConfig,
    pub security: SecurityConfig,
}

/// One named LLM backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    /// Adapter kind: `anthropic` or `openai` (any OpenAI-compatible endpoint).
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable to read the key from when `api_key` is unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl LlmProviderConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                self.api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub default_provider: Option<String>,
    pub fallback_providers: Vec<String>,
    pub model: Option<String>,
    pub persona: Option<String>,
    pub max_tokens: u32,
    pub stream_by_default: bool,
    pub recall_limit: usize,
    /// Standing skill hints merged into every system prompt.
    pub skills: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_provider: None,
            fallback_providers: Vec::new(),
            model: None,
            persona: None,
            max_tokens: 1024,
            stream_by_default: false,
            recall_limit: 6,
            skills: Vec::new(),
        }
    }
}

/// Prompt assembly ceilings, all in estimated tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptBudgetConfig {
    pub max_prompt_tokens: usize,
    pub response_reserve_tokens: usize,
    pub section_max_tokens: usize,
    pub history_target_tokens: usize,
    pub min_history_tokens: usize,
}

impl Default for PromptBudgetConfig {
    fn default() -> Self {
        Self {
            max_prompt_tokens: 12_000,
            response_reserve_tokens: 2_000,
            section_max_tokens: 1_200,
            history_target_tokens: 6_000,
            min_history_tokens: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolLoopConfig {
    pub enabled: bool,
    pub max_steps: usize,
    pub max_duration_ms: u64,
    pub max_tool_calls_per_step: usize,
    pub tool_exec_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Consecutive timeouts after which the loop gives up instead of retrying.
    pub abort_after_timeouts: usize,
    /// Lowercase fragments that mark an error message as a timeout.
    pub timeout_markers: Vec<String>,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_steps: 6,
            max_duration_ms: 45_000,
            max_tool_calls_per_step: 4,
            tool_exec_timeout_ms: 12_000,
            request_timeout_ms: 30_000,
            abort_after_timeouts: 2,
            timeout_markers: vec![
                "timed out".to_string(),
                "timeout".to_string(),
                "deadline exceeded".to_string(),
                "etimedout".to_string(),
                "aborted".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    pub debounce_window_ms: i64,
    pub bucket_ms: i64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: 2_500,
            bucket_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub default_ttl_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FastPathConfig {
    pub weather: bool,
    pub crypto: bool,
    pub confirmation_ttl_secs: u64,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            weather: true,
            crypto: true,
            confirmation_ttl_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineConfig {
    pub empty_reply_retry_max_tokens: u32,
    /// Completion tokens at or above this share of the cap count as token-starved.
    pub token_starved_ratio: f64,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            empty_reply_retry_max_tokens: 2_048,
            token_starved_ratio: 0.9,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
    pub transcript_db: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolved transcript database path, defaulting to `<data_dir>/nova.db`.
    pub fn transcript_db_path(&self) -> PathBuf {
        if let Some(path) = &self.transcript_db {
            return path.clone();
        }
        self.data_dir
            .clone()
            .unwrap_or_else(crate::loader::default_config_dir)
            .join("nova.db")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3789,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub enforce_capabilities: bool,
    pub granted_capabilities: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_leave_reserve_inside_ceiling() {
        let prompt = PromptBudgetConfig::default();
        assert!(prompt.response_reserve_tokens < prompt.max_prompt_tokens);
        assert!(prompt.min_history_tokens <= prompt.history_target_tokens);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config: AppConfig = serde_yaml::from_str(
            "tool_loop:\n  max_steps: 3\nllm:\n  main:\n    provider: openai\n    model: gpt-4o-mini\n",
        )
        .unwrap();
        assert_eq!(config.tool_loop.max_steps, 3);
        assert_eq!(config.tool_loop.max_tool_calls_per_step, 4);
        assert_eq!(config.llm["main"].provider, "openai");
        assert_eq!(config.dedupe.debounce_window_ms, 2_500);
    }

    #[test]
    fn explicit_api_key_wins_over_env() {
        let cfg = LlmProviderConfig {
            provider: "openai".to_string(),
            model: None,
            api_key: Some("sk-inline".to_string()),
            api_key_env: Some("NOVA_TEST_UNSET_KEY_VAR".to_string()),
            base_url: None,
            timeout_secs: None,
        };
        assert_eq!(cfg.resolve_api_key().as_deref(), Some("sk-inline"));
    }

    #[test]
    fn transcript_path_defaults_under_data_dir() {
        let storage = StorageConfig {
            data_dir: Some(PathBuf::from("/tmp/nova-data")),
            transcript_db: None,
        };
        assert_eq!(
            storage.transcript_db_path(),
            PathBuf::from("/tmp/nova-data/nova.db")
        );
    }
}
