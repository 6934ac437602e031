use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_COMPLETION_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_PORT: u16 = 3000;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("OPENAI_API_KEY environment variable is not set")]
    MissingCredential,
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("options store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("options store is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

// ── Relay configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub api_key: String,
    pub host: String,
    pub port: u16,
    pub completion_url: String,
    pub model: String,
    /// Overall per-request limit for completion calls; unset means none.
    pub request_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

impl RelayConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_key = var("OPENAI_API_KEY").ok_or(ConfigError::MissingCredential)?;

        let port = match var("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidValue { key: "PORT", value: raw })?,
            None => DEFAULT_PORT,
        };

        let seconds = |key: &'static str| -> Result<Option<Duration>, ConfigError> {
            match var(key) {
                Some(raw) => match raw.parse::<u64>() {
                    Ok(secs) => Ok(Some(Duration::from_secs(secs))),
                    Err(_) => Err(ConfigError::InvalidValue { key, value: raw }),
                },
                None => Ok(None),
            }
        };
        let request_timeout = seconds("RELAY_REQUEST_TIMEOUT_SECS")?;
        let connect_timeout = seconds("RELAY_CONNECT_TIMEOUT_SECS")?;

        Ok(RelayConfig {
            api_key,
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            completion_url: var("OPENAI_URL").unwrap_or_else(|| DEFAULT_COMPLETION_URL.to_string()),
            model: var("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            request_timeout,
            connect_timeout,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── User options ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Concise,
    Conversational,
    Academic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SumMode {
    Sentences,
    Bullets,
}

/// User-set options, stored under the same keys the options page uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    pub tone: Tone,
    pub sum_mode: SumMode,
    pub sum_count: u32,
    pub eng_max_chars: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            tone: Tone::Conversational,
            sum_mode: SumMode::Sentences,
            sum_count: 5,
            eng_max_chars: 20_000,
        }
    }
}

impl Options {
    /// Zero counts fall back to the defaults, as the options page does.
    pub fn normalized(mut self) -> Self {
        let defaults = Options::default();
        if self.sum_count == 0 {
            self.sum_count = defaults.sum_count;
        }
        if self.eng_max_chars == 0 {
            self.eng_max_chars = defaults.eng_max_chars;
        }
        self
    }
}

// ── Options storage ──────────────────────────────────────────────────────────

pub trait OptionsStore: Send + Sync {
    /// Stored options merged over the defaults.
    fn load(&self) -> Result<Options, ConfigError>;
    fn save(&self, options: &Options) -> Result<(), ConfigError>;

    fn reset(&self) -> Result<Options, ConfigError> {
        let defaults = Options::default();
        self.save(&defaults)?;
        Ok(defaults)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    options: RwLock<Option<Options>>,
}

impl MemoryStore {
    pub fn new(options: Options) -> Self {
        MemoryStore {
            options: RwLock::new(Some(options)),
        }
    }
}

impl OptionsStore for MemoryStore {
    fn load(&self) -> Result<Options, ConfigError> {
        let guard = self.options.read().unwrap_or_else(|e| e.into_inner());
        Ok(guard.clone().unwrap_or_default().normalized())
    }

    fn save(&self, options: &Options) -> Result<(), ConfigError> {
        let mut guard = self.options.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(options.clone().normalized());
        Ok(())
    }
}

/// Options persisted as a JSON object on disk. A missing file reads as defaults.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OptionsStore for JsonFileStore {
    fn load(&self) -> Result<Options, ConfigError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(serde_json::from_str::<Options>(&raw)?.normalized()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Options::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, options: &Options) -> Result<(), ConfigError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let raw = serde_json::to_string_pretty(&options.clone().normalized())?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}
