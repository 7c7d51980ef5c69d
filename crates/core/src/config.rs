use crate::session::SessionConfig;
use serde::Deserialize;
use sonic_realtime::{
    StreamConnector, WebSocketConnector,
    codec::EndpointingSensitivity,
    credentials::{DEFAULT_API_KEY_VAR, EnvCredentialProvider},
    mock::{MockConnector, echo_responder},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;

const DEFAULT_REGION: &str = "us-west-2";
const DEFAULT_MODEL_ID: &str = "amazon.nova-2-sonic-v1:0";
const DEFAULT_TARGET_LANGUAGE: &str = "Japanese";
const DEFAULT_PROJECT_NAME: &str = "speech-to-speech";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
    #[error("Invalid configuration file {0}: {1}")]
    File(PathBuf, String),
}

/// Defines the supported stream providers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    /// The hosted bidirectional streaming endpoint.
    Bedrock,
    /// In-memory echo transport for offline development.
    Mock,
}

/// The optional JSON record read at startup.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    pub region: Option<String>,
    pub target_language: Option<String>,
    pub project_name: Option<String>,
}

impl ConfigFile {
    /// Reads the record at `path`. A missing file yields an empty record.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::File(path.to_path_buf(), e.to_string())),
        };
        serde_json::from_str(&raw).map_err(|e| ConfigError::File(path.to_path_buf(), e.to_string()))
    }
}

/// Holds all translator configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct TranslatorConfig {
    pub region: String,
    pub model_id: String,
    pub endpoint: String,
    pub target_language: String,
    pub project_name: String,
    pub voice_id: String,
    pub endpointing_sensitivity: Option<EndpointingSensitivity>,
    pub provider: Provider,
    pub log_level: Level,
    pub config_path: PathBuf,
}

fn env_or(name: &str, default: impl FnOnce() -> String) -> String {
    std::env::var(name).unwrap_or_else(|_| default())
}

impl TranslatorConfig {
    /// Loads configuration from environment variables, falling back to the
    /// JSON record at `SONIC_CONFIG_PATH` and then to built-in defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let config_path = std::env::var("SONIC_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./config.json"));
        let file = ConfigFile::load(&config_path)?;

        let region = env_or("SONIC_REGION", || {
            file.region.clone().unwrap_or_else(|| DEFAULT_REGION.to_string())
        });
        let model_id = env_or("SONIC_MODEL_ID", || DEFAULT_MODEL_ID.to_string());
        let endpoint = env_or("SONIC_ENDPOINT", || default_endpoint(&region, &model_id));
        if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") {
            return Err(ConfigError::InvalidValue(
                "SONIC_ENDPOINT".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", endpoint),
            ));
        }

        let target_language = env_or("SONIC_TARGET_LANGUAGE", || {
            file.target_language
                .clone()
                .unwrap_or_else(|| DEFAULT_TARGET_LANGUAGE.to_string())
        });
        if target_language.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "SONIC_TARGET_LANGUAGE".to_string(),
                "target language must not be empty".to_string(),
            ));
        }
        let project_name = file
            .project_name
            .clone()
            .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string());

        let voice_id = env_or("SONIC_VOICE_ID", || crate::session::DEFAULT_VOICE_ID.to_string());

        let endpointing_sensitivity = match std::env::var("SONIC_ENDPOINTING_SENSITIVITY") {
            Ok(raw) => Some(raw.parse::<EndpointingSensitivity>().map_err(|e| {
                ConfigError::InvalidValue("SONIC_ENDPOINTING_SENSITIVITY".to_string(), e)
            })?),
            Err(_) => None,
        };

        let provider_str = env_or("SONIC_PROVIDER", || "bedrock".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "bedrock" => Provider::Bedrock,
            "mock" => Provider::Mock,
            other => {
                return Err(ConfigError::InvalidValue(
                    "SONIC_PROVIDER".to_string(),
                    format!("'{}' is not one of bedrock, mock", other),
                ));
            }
        };
        if provider == Provider::Bedrock && std::env::var(DEFAULT_API_KEY_VAR).is_err() {
            return Err(ConfigError::MissingVar(format!(
                "{} must be set for 'bedrock' provider",
                DEFAULT_API_KEY_VAR
            )));
        }

        let log_level_str = env_or("RUST_LOG", || "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            region,
            model_id,
            endpoint,
            target_language,
            project_name,
            voice_id,
            endpointing_sensitivity,
            provider,
            log_level,
            config_path,
        })
    }

    /// Session parameters derived from this configuration.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            voice_id: self.voice_id.clone(),
            endpointing_sensitivity: self.endpointing_sensitivity,
            ..SessionConfig::default()
        }
    }

    /// Builds the stream connector for the configured provider.
    pub fn connector(&self) -> Arc<dyn StreamConnector> {
        match self.provider {
            Provider::Bedrock => Arc::new(WebSocketConnector::new(
                self.endpoint.clone(),
                Arc::new(EnvCredentialProvider::default()),
            )),
            Provider::Mock => Arc::new(MockConnector::new().with_responder(echo_responder())),
        }
    }
}

fn default_endpoint(region: &str, model_id: &str) -> String {
    format!(
        "wss://bedrock-runtime.{}.amazonaws.com/model/{}/invoke-with-bidirectional-stream",
        region, model_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::io::Write;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("SONIC_REGION");
            env::remove_var("SONIC_MODEL_ID");
            env::remove_var("SONIC_ENDPOINT");
            env::remove_var("SONIC_TARGET_LANGUAGE");
            env::remove_var("SONIC_VOICE_ID");
            env::remove_var("SONIC_ENDPOINTING_SENSITIVITY");
            env::remove_var("SONIC_PROVIDER");
            env::remove_var("SONIC_API_KEY");
            env::remove_var("RUST_LOG");
            env::set_var("SONIC_CONFIG_PATH", "/nonexistent/sonic/config.json");
        }
    }

    fn set_minimal_env_mock() {
        unsafe {
            env::set_var("SONIC_PROVIDER", "mock");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_defaults() {
        clear_env_vars();
        set_minimal_env_mock();

        let config = TranslatorConfig::from_env().expect("Config should load successfully");

        assert_eq!(config.region, "us-west-2");
        assert_eq!(config.model_id, "amazon.nova-2-sonic-v1:0");
        assert_eq!(
            config.endpoint,
            "wss://bedrock-runtime.us-west-2.amazonaws.com/model/amazon.nova-2-sonic-v1:0/invoke-with-bidirectional-stream"
        );
        assert_eq!(config.target_language, "Japanese");
        assert_eq!(config.project_name, "speech-to-speech");
        assert_eq!(config.voice_id, "matthew");
        assert_eq!(config.endpointing_sensitivity, None);
        assert_eq!(config.provider, Provider::Mock);
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("SONIC_REGION", "us-east-1");
            env::set_var("SONIC_TARGET_LANGUAGE", "Korean");
            env::set_var("SONIC_VOICE_ID", "ambre");
            env::set_var("SONIC_ENDPOINTING_SENSITIVITY", "low");
            env::set_var("SONIC_PROVIDER", "bedrock");
            env::set_var("SONIC_API_KEY", "test-key");
            env::set_var("RUST_LOG", "debug");
        }

        let config = TranslatorConfig::from_env().expect("Config should load successfully");

        assert_eq!(config.region, "us-east-1");
        assert!(config.endpoint.contains("bedrock-runtime.us-east-1"));
        assert_eq!(config.target_language, "Korean");
        assert_eq!(config.voice_id, "ambre");
        assert_eq!(
            config.endpointing_sensitivity,
            Some(EndpointingSensitivity::Low)
        );
        assert_eq!(config.provider, Provider::Bedrock);
        assert_eq!(config.log_level, Level::DEBUG);

        let session = config.session_config();
        assert_eq!(session.voice_id, "ambre");
        assert_eq!(session.endpointing_sensitivity, Some(EndpointingSensitivity::Low));
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_config_reads_json_record() {
        clear_env_vars();
        set_minimal_env_mock();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"region": "eu-north-1", "targetLanguage": "French", "projectName": "demo", "accountId": "123"}}"#
        )
        .unwrap();
        unsafe {
            env::set_var("SONIC_CONFIG_PATH", file.path());
        }

        let config = TranslatorConfig::from_env().expect("Config should load successfully");
        assert_eq!(config.region, "eu-north-1");
        assert_eq!(config.target_language, "French");
        assert_eq!(config.project_name, "demo");

        // Environment variables take precedence over the file.
        unsafe {
            env::set_var("SONIC_TARGET_LANGUAGE", "German");
        }
        let config = TranslatorConfig::from_env().unwrap();
        assert_eq!(config.target_language, "German");
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_config_invalid_json_record() {
        clear_env_vars();
        set_minimal_env_mock();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        unsafe {
            env::set_var("SONIC_CONFIG_PATH", file.path());
        }

        let err = TranslatorConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::File(_, _)));
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_config_missing_api_key_for_bedrock() {
        clear_env_vars();

        let err = TranslatorConfig::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => assert!(msg.contains("SONIC_API_KEY")),
            _ => panic!("Expected MissingVar for SONIC_API_KEY"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_values() {
        for (var, value) in [
            ("SONIC_ENDPOINTING_SENSITIVITY", "extreme"),
            ("SONIC_PROVIDER", "carrier-pigeon"),
            ("SONIC_ENDPOINT", "https://example.com"),
            ("RUST_LOG", "not-a-level"),
        ] {
            clear_env_vars();
            set_minimal_env_mock();
            unsafe {
                env::set_var(var, value);
            }
            match TranslatorConfig::from_env().unwrap_err() {
                ConfigError::InvalidValue(name, _) => assert_eq!(name, var),
                other => panic!("Expected InvalidValue for {}, got {:?}", var, other),
            }
        }
        clear_env_vars();
    }
}
