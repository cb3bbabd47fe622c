//! Configuration for the turn controller and its gateway binary.
//!
//! Loaded from TOML via [`Config::from_file`]; every field has a sane
//! default so a minimal file only needs to override what differs, but
//! required credentials are validated explicitly on load rather than
//! silently defaulting to an empty string.

use crate::error::{ControllerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for one turn-controller deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub vector: VectorConfig,
    pub rag: RagConfig,
    pub turn: TurnConfig,
    pub gateway: GatewayConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ControllerError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| ControllerError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Required-key and range validation. Missing credentials or an
    /// out-of-range value is a startup failure, never a silent default.
    pub fn validate(&self) -> Result<()> {
        if self.llm.model.trim().is_empty() {
            return Err(ControllerError::Config("llm.model is required".into()));
        }
        if self.llm.api_key.trim().is_empty() {
            return Err(ControllerError::Config("llm.api_key is required".into()));
        }
        if self.tts.api_key.trim().is_empty() {
            return Err(ControllerError::Config("tts.api_key is required".into()));
        }
        if self.stt.api_key.trim().is_empty() {
            return Err(ControllerError::Config("stt.api_key is required".into()));
        }
        if self.vector.index_name.trim().is_empty() {
            return Err(ControllerError::Config("vector.index_name is required".into()));
        }
        if !(400..=1_200).contains(&self.turn.silence_debounce_ms) {
            return Err(ControllerError::Config("turn.silence_debounce_ms must be in [400, 1200]".into()));
        }
        if !(0.1..=0.5).contains(&self.turn.cancellation_threshold) {
            return Err(ControllerError::Config("turn.cancellation_threshold must be in [0.1, 0.5]".into()));
        }
        if self.rag.chunk_overlap >= self.rag.chunk_size {
            return Err(ControllerError::Config("rag.chunk_overlap must be smaller than rag.chunk_size".into()));
        }
        Ok(())
    }
}

/// Speech-to-text provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    pub provider: String,
    pub api_key: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self { provider: "deepgram".to_owned(), api_key: String::new() }
    }
}

/// Language model provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_url: String,
    pub model: String,
    pub api_key: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_owned(),
            model: String::new(),
            api_key: String::new(),
            temperature: 0.7,
            max_tokens: 512,
        }
    }
}

/// Text-to-speech provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub provider: String,
    pub api_key: String,
    pub voice_id: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self { provider: "elevenlabs".to_owned(), api_key: String::new(), voice_id: None }
    }
}

/// Vector store identity (index name, region, embedding dimension).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    pub index_name: String,
    pub region: String,
    pub dimension: usize,
    pub db_path: String,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self { index_name: String::new(), region: "local".to_owned(), dimension: 384, db_path: "turn-controller.db".to_owned() }
    }
}

/// Retrieval-augmented context parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub top_k: usize,
    pub min_similarity: f32,
    pub timeout_ms: u64,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self { top_k: 3, min_similarity: 0.3, timeout_ms: 2_000, chunk_size: 500, chunk_overlap: 50 }
    }
}

/// Turn controller timing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    pub silence_debounce_ms: u64,
    pub min_debounce_ms: u64,
    pub max_debounce_ms: u64,
    pub cancellation_threshold: f32,
    pub adaptive_debounce_enabled: bool,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            silence_debounce_ms: 600,
            min_debounce_ms: 400,
            max_debounce_ms: 1_200,
            cancellation_threshold: 0.30,
            adaptive_debounce_enabled: true,
        }
    }
}

/// WebSocket/HTTP gateway bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub bearer_token: Option<String>,
    pub permitted_origin: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_owned(), port: 8088, bearer_token: None, permitted_origin: None }
    }
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_owned(), log_dir: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_valid_config() -> Config {
        let mut config = Config::default();
        config.llm.model = "gpt-4o-mini".to_owned();
        config.llm.api_key = "sk-test".to_owned();
        config.stt.api_key = "dg-test".to_owned();
        config.tts.api_key = "el-test".to_owned();
        config.vector.index_name = "sessions".to_owned();
        config
    }

    #[test]
    fn default_config_has_expected_debounce_bounds() {
        let config = Config::default();
        assert_eq!(config.turn.min_debounce_ms, 400);
        assert_eq!(config.turn.max_debounce_ms, 1_200);
    }

    #[test]
    fn validate_rejects_missing_llm_model() {
        let config = Config::default();
        let err = config.validate();
        assert!(err.is_err());
    }

    #[test]
    fn validate_passes_with_required_keys_set() {
        minimal_valid_config().validate().expect("should validate");
    }

    #[test]
    fn validate_rejects_out_of_range_debounce() {
        let mut config = minimal_valid_config();
        config.turn.silence_debounce_ms = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_overlap_not_smaller_than_chunk_size() {
        let mut config = minimal_valid_config();
        config.rag.chunk_overlap = config.rag.chunk_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_loads_toml_and_validates() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            r#"
            [llm]
            model = "gpt-4o-mini"
            api_key = "sk-test"

            [stt]
            api_key = "dg-test"

            [tts]
            api_key = "el-test"

            [vector]
            index_name = "sessions"
            "#
        )
        .expect("write");

        let config = Config::from_file(file.path()).expect("load");
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.turn.silence_debounce_ms, 600);
    }

    #[test]
    fn from_file_missing_file_errors() {
        let err = Config::from_file(Path::new("/nonexistent/path/config.toml"));
        assert!(err.is_err());
    }
}
