use anyhow::{Context, Result, bail};
use conclave_core::{
    AnalysisConfig, ModelArgs, ProviderEndpoint, ProviderKind, RetryPolicy, RouterConfig,
    TurnPolicy,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConclaveConfig {
    pub defaults: DefaultsConfig,
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub analysis: AnalysisSection,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Model used for classification, forms, notes, amendments and retry prompts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    pub utility_provider: String,
    pub utility_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    4096
}

impl DefaultsConfig {
    pub fn utility_model_args(&self) -> ModelArgs {
        ModelArgs::new(&self.utility_provider, &self.utility_model).with_temperature(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub anthropic: Option<AnthropicConfig>,
    #[serde(default)]
    pub openai: Option<OpenAiProviderConfig>,
    #[serde(default)]
    pub openai_compat: Vec<OpenAiCompatProviderConfig>,
    /// Provider names in the order they are tried as fallbacks
    #[serde(default)]
    pub failover_order: Vec<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub fallback_model: Option<String>,
}

impl std::fmt::Debug for AnthropicConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicConfig")
            .field("api_key", &mask_secret(&self.api_key))
            .field("base_url", &self.base_url)
            .field("fallback_model", &self.fallback_model)
            .finish()
    }
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct OpenAiProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub fallback_model: Option<String>,
}

impl std::fmt::Debug for OpenAiProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProviderConfig")
            .field("api_key", &mask_secret(&self.api_key))
            .field("base_url", &self.base_url)
            .field("fallback_model", &self.fallback_model)
            .finish()
    }
}

fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct OpenAiCompatProviderConfig {
    pub name: String,
    #[serde(default)]
    pub api_key: String,
    pub base_url: String,
    #[serde(default)]
    pub fallback_model: Option<String>,
}

impl std::fmt::Debug for OpenAiCompatProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatProviderConfig")
            .field("name", &self.name)
            .field("api_key", &mask_secret(&self.api_key))
            .field("base_url", &self.base_url)
            .field("fallback_model", &self.fallback_model)
            .finish()
    }
}

impl ProvidersConfig {
    /// Configured endpoints, ordered by `failover_order` (unlisted ones last)
    pub fn endpoints(&self) -> Vec<ProviderEndpoint> {
        let mut endpoints = Vec::new();
        if let Some(a) = &self.anthropic {
            endpoints.push(ProviderEndpoint {
                name: "anthropic".to_string(),
                kind: ProviderKind::Anthropic,
                api_key: a.api_key.clone(),
                base_url: a.base_url.clone(),
                fallback_model: a.fallback_model.clone(),
            });
        }
        if let Some(o) = &self.openai {
            endpoints.push(ProviderEndpoint {
                name: "openai".to_string(),
                kind: ProviderKind::OpenAi,
                api_key: o.api_key.clone(),
                base_url: o.base_url.clone(),
                fallback_model: o.fallback_model.clone(),
            });
        }
        for c in &self.openai_compat {
            endpoints.push(ProviderEndpoint {
                name: c.name.clone(),
                kind: ProviderKind::OpenAiCompat,
                api_key: c.api_key.clone(),
                base_url: c.base_url.clone(),
                fallback_model: c.fallback_model.clone(),
            });
        }

        let rank = |name: &str| {
            self.failover_order
                .iter()
                .position(|n| n.eq_ignore_ascii_case(name))
                .unwrap_or(usize::MAX)
        };
        endpoints.sort_by_key(|e| rank(&e.name));
        endpoints
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSection {
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
}

fn default_max_hops() -> usize {
    8
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
        }
    }
}

impl RouterSection {
    pub fn to_router_config(&self) -> RouterConfig {
        RouterConfig::new(self.max_hops)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSection {
    #[serde(default = "default_analysis_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub take_notes_on_analysis: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_analysis_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_analysis_timeout_secs(),
            take_notes_on_analysis: true,
            retry: RetryPolicy::Disabled,
        }
    }
}

impl AnalysisSection {
    pub fn to_analysis_config(&self) -> AnalysisConfig {
        AnalysisConfig {
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            take_notes_on_analysis: self.take_notes_on_analysis,
            retry: self.retry,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default = "default_embedding_provider")]
    pub embedding_provider: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
}

fn default_db_path() -> String {
    "~/.conclave/conclave.db".to_string()
}
fn default_top_k() -> usize {
    5
}
fn default_min_score() -> f32 {
    0.2
}
fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_chunk_chars() -> usize {
    1200
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            top_k: default_top_k(),
            min_score: default_min_score(),
            embedding_provider: default_embedding_provider(),
            embedding_model: default_embedding_model(),
            chunk_chars: default_chunk_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_team_file")]
    pub team_file: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default)]
    pub turn_policy: TurnPolicy,
}

fn default_team_file() -> String {
    "~/.conclave/team.toml".to_string()
}
fn default_user_id() -> String {
    "local".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            team_file: default_team_file(),
            user_id: default_user_id(),
            turn_policy: TurnPolicy::default(),
        }
    }
}

/// Mask a secret for Debug output and logs: first 3 and last 4 chars of
/// anything longer than 7 chars, otherwise "***"
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conclave")
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

impl ConclaveConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                // group or other may read it
                if mode & 0o077 != 0 {
                    bail!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    );
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `conclave init` first.",
                path.display()
            )
        })?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        config.warn_hardcoded_keys();
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)?;
        if config.providers.endpoints().is_empty() {
            bail!("No providers configured; add [providers.anthropic], [providers.openai] or [[providers.openai_compat]]");
        }
        Ok(config)
    }

    fn warn_hardcoded_keys(&self) {
        let anthropic_key = self.providers.anthropic.as_ref().map(|a| a.api_key.as_str());
        if anthropic_key.is_some_and(|k| k.starts_with("sk-ant-")) {
            warn!(
                "Anthropic API key is hardcoded in config file. For security, use environment variables: api_key = \"${{ANTHROPIC_API_KEY}}\""
            );
        }
        let openai_key = self.providers.openai.as_ref().map(|o| o.api_key.as_str());
        if openai_key.is_some_and(|k| k.starts_with("sk-")) {
            warn!(
                "OpenAI API key is hardcoded in config file. For security, use environment variables: api_key = \"${{OPENAI_API_KEY}}\""
            );
        }
    }
}

/// Environment variables that may be expanded in config files
const ALLOWED_ENV_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "CUSTOM_LLM_API_KEY",
    "CONCLAVE_USER_ID",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        let value_len = value.len();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value_len;
    }
    result
}
