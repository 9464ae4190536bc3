use mentor_core::llm_client::ModelSet;
use std::path::PathBuf;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// The generative backend used for chat, recommendations and speech.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
}

/// Per-user data directory, e.g. `~/.local/share/mentor` on Linux.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("mentor"))
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub provider: Provider,
    pub gemini_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub chat_model: String,
    pub structured_model: String,
    pub speech_model: String,
    pub live_model: String,
    pub log_level: Level,
    pub data_dir: PathBuf,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let provider_str = var_or("MENTOR_PROVIDER", "gemini");
        let provider = match provider_str.to_lowercase().as_str() {
            "gemini" => Provider::Gemini,
            "openai" => Provider::OpenAI,
            _ => {
                return Err(ConfigError::InvalidValue(
                    "MENTOR_PROVIDER".to_string(),
                    format!("'{}' is not one of 'gemini' or 'openai'", provider_str),
                ));
            }
        };

        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok();
        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let openai_base_url = var_or("OPENAI_BASE_URL", "https://api.openai.com/v1");

        let (chat_default, structured_default, speech_default) = match provider {
            Provider::Gemini => (
                "gemini-3-pro-preview",
                "gemini-3-flash-preview",
                "gemini-2.5-flash-preview-tts",
            ),
            Provider::OpenAI => ("gpt-4o", "gpt-4o-mini", "tts-1"),
        };
        let chat_model = var_or("CHAT_MODEL", chat_default);
        let structured_model = var_or("STRUCTURED_MODEL", structured_default);
        let speech_model = var_or("SPEECH_MODEL", speech_default);
        let live_model = var_or(
            "LIVE_MODEL",
            "gemini-2.5-flash-native-audio-preview-12-2025",
        );

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let data_dir = match std::env::var("MENTOR_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => default_data_dir()
                .ok_or_else(|| ConfigError::MissingVar("MENTOR_DATA_DIR".to_string()))?,
        };

        match provider {
            Provider::OpenAI => {
                if openai_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                    ));
                }
            }
            Provider::Gemini => {
                if gemini_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            provider,
            gemini_api_key,
            openai_api_key,
            openai_base_url,
            chat_model,
            structured_model,
            speech_model,
            live_model,
            log_level,
            data_dir,
        })
    }

    pub fn models(&self) -> ModelSet {
        ModelSet {
            chat: self.chat_model.clone(),
            structured: self.structured_model.clone(),
            speech: self.speech_model.clone(),
        }
    }
}
