use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

const DEFAULT_CONFIG: &str = r#"# messages-bridge configuration

[backend]
# OpenAI-compatible endpoint; "/chat/completions" is appended unless present.
base_url = "http://localhost:8000/v1"
# api_key = "sk-..."
# organization = "org-..."
# project = "proj-..."
request_timeout_secs = 300
# Drop top_k when the backend rejects it.
supports_top_k = true
# Send reasoning_effort derived from thinking.budget_tokens.
supports_reasoning_effort = false
# Send chat_template_kwargs.enable_thinking (vLLM, SGLang).
chat_template_kwargs = true

[server]
host = "127.0.0.1"
port = 8080
# Require this key as x-api-key or Authorization: Bearer.
# api_key = "..."

[search]
# Without a key, web searches report "unavailable".
# tavily_api_key = "tvly-..."
base_url = "https://api.tavily.com"
timeout_secs = 30
max_results = 5
max_uses = 5

[logging]
level = "info"
"#;

/// Root of `config.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub backend: BackendSettings,
    pub server: ServerSettings,
    pub search: SearchSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub organization: Option<String>,
    pub project: Option<String>,
    pub request_timeout_secs: u64,
    pub supports_top_k: bool,
    pub supports_reasoning_effort: bool,
    pub chat_template_kwargs: bool,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: None,
            organization: None,
            project: None,
            request_timeout_secs: 300,
            supports_top_k: true,
            supports_reasoning_effort: false,
            chat_template_kwargs: true,
        }
    }
}

impl BackendSettings {
    fn base(&self) -> &str {
        let trimmed = self.base_url.trim_end_matches('/');
        trimmed
            .strip_suffix(CHAT_COMPLETIONS_PATH)
            .unwrap_or(trimmed)
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}{}", self.base(), CHAT_COMPLETIONS_PATH)
    }

    pub fn models_url(&self) -> String {
        format!("{}/models", self.base())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Key clients must present; proxy auth is off when unset.
    pub api_key: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub tavily_api_key: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_results: usize,
    /// Per-request budget when the tool definition sets no `max_uses`.
    pub max_uses: u32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            tavily_api_key: None,
            base_url: crate::search::TAVILY_DEFAULT_URL.to_string(),
            timeout_secs: 30,
            max_results: 5,
            max_uses: 5,
        }
    }
}

impl SearchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    /// `<config_dir>/messages-bridge`
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("messages-bridge"))
    }

    pub fn config_file_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Loads settings from `path`, or from the default location when `None`.
    ///
    /// An explicit path must exist. The default location gets a commented
    /// default file on first run.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => Self::read(path)?,
            None => {
                let path =
                    Self::config_file_path().context("Could not determine config directory")?;
                if !path.exists() {
                    write_default(&path)?;
                }
                Self::read(&path)?
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    fn read(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        check_url("backend.base_url", &self.backend.base_url)?;
        check_url("search.base_url", &self.search.base_url)?;
        if self.backend.request_timeout_secs == 0 {
            bail!("backend.request_timeout_secs must be greater than zero");
        }
        if self.search.max_results == 0 {
            bail!("search.max_results must be greater than zero");
        }
        Ok(())
    }
}

fn check_url(field: &str, value: &str) -> Result<()> {
    let url = Url::parse(value).with_context(|| format!("{field} is not a valid URL: {value}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("{field} must be an http(s) URL: {value}");
    }
    Ok(())
}

fn write_default(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
    }
    fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write config file: {}", path.display()))
}
