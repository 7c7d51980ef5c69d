use sonic_core::{ConfigError, TranslatorConfig};
use std::net::SocketAddr;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Holds the HTTP service configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub translator: TranslatorConfig,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let translator = TranslatorConfig::from_env()?;

        Ok(Self {
            bind_address,
            translator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use sonic_core::Provider;
    use std::env;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("BIND_ADDRESS");
            env::remove_var("SONIC_PROVIDER");
            env::remove_var("SONIC_API_KEY");
            env::remove_var("SONIC_CONFIG_PATH");
            env::remove_var("RUST_LOG");
        }
    }

    fn set_mock_provider() {
        unsafe {
            env::set_var("SONIC_PROVIDER", "mock");
            env::set_var("SONIC_CONFIG_PATH", "/nonexistent/config.json");
        }
    }

    #[test]
    #[serial]
    fn test_config_default_bind_address() {
        clear_env_vars();
        set_mock_provider();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "0.0.0.0:3000");
        assert_eq!(config.translator.provider, Provider::Mock);
    }

    #[test]
    #[serial]
    fn test_config_custom_bind_address() {
        clear_env_vars();
        set_mock_provider();
        unsafe {
            env::set_var("BIND_ADDRESS", "127.0.0.1:8080");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "127.0.0.1:8080");
    }

    #[test]
    #[serial]
    fn test_config_invalid_bind_address() {
        clear_env_vars();
        set_mock_provider();
        unsafe {
            env::set_var("BIND_ADDRESS", "not-a-valid-address");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "BIND_ADDRESS"),
            _ => panic!("Expected InvalidValue for BIND_ADDRESS"),
        }
    }

    #[test]
    #[serial]
    fn test_config_propagates_translator_errors() {
        clear_env_vars();
        unsafe {
            env::set_var("SONIC_PROVIDER", "bedrock");
            env::set_var("SONIC_CONFIG_PATH", "/nonexistent/config.json");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => assert!(msg.contains("SONIC_API_KEY")),
            _ => panic!("Expected MissingVar for SONIC_API_KEY"),
        }
    }
}
