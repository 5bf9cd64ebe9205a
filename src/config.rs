use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Server parameters loadable from a JSON file. Everything has a sane
/// default so the config file is optional.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address the listener binds when the CLI doesn't override it
    pub address: Option<String>,
    /// Certificate key kind for TLS protocols: "ecdsa" or "ed25519"
    pub certificate_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: None,
            certificate_key: Some("ecdsa".to_string()),
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, String> {
    match path {
        Some(config_path) => {
            if !config_path.exists() {
                return Err(format!("Config file not found: {config_path:?}"));
            }

            let config_content = match fs::read_to_string(config_path) {
                Ok(content) => content,
                Err(e) => return Err(format!("Failed to read config file: {e}")),
            };

            match serde_json::from_str(&config_content) {
                Ok(config) => {
                    debug!("Loaded configuration from {config_path:?}");
                    Ok(config)
                }
                Err(e) => Err(format!("Failed to parse config file: {e}")),
            }
        }
        None => {
            debug!("No config file provided, using default configuration");
            Ok(ServerConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = load_config(None).unwrap();
        assert!(config.address.is_none());
        assert_eq!(config.certificate_key.as_deref(), Some("ecdsa"));
    }

    #[test]
    fn test_load_config_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(
            file.path(),
            r#"{"address": "127.0.0.1:9090", "certificate_key": "ed25519"}"#,
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.address.as_deref(), Some("127.0.0.1:9090"));
        assert_eq!(config.certificate_key.as_deref(), Some("ed25519"));
    }

    #[test]
    fn test_missing_config_file() {
        let result = load_config(Some(Path::new("/nonexistent/mockingbird.json")));
        assert!(result.is_err());
    }
}
