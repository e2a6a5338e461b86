use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("jobs.max_jobs must be at least 1")]
    NoJobCapacity,

    #[error("invalid allowed origin: {0}")]
    InvalidOrigin(String),
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "0.0.0.0".into(),
            port: 10000,
        }
    }
}

fn default_admin_listener() -> Listener {
    Listener {
        host: "127.0.0.1".into(),
        port: 10001,
    }
}

/// Retention of finished and running jobs in memory.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Jobs {
    pub max_jobs: u64,
    pub ttl_secs: u64,
}

impl Default for Jobs {
    fn default() -> Self {
        Jobs {
            max_jobs: 1000,
            ttl_secs: 24 * 3600,
        }
    }
}

/// Power of attorney rendering. Without this section the PDF download is
/// disabled.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Documents {
    pub template_path: PathBuf,
    /// Chrome/Chromium binary. Looked up on the system when unset.
    pub browser_path: Option<PathBuf>,
}

fn default_max_upload_bytes() -> usize {
    25 * 1024 * 1024
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    #[serde(default = "default_admin_listener")]
    pub admin_listener: Listener,
    #[serde(default)]
    pub jobs: Jobs,
    pub documents: Option<Documents>,
    /// Origins allowed to call the API from a browser.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listener: Listener::default(),
            admin_listener: default_admin_listener(),
            jobs: Jobs::default(),
            documents: None,
            allowed_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.jobs.max_jobs == 0 {
            return Err(ValidationError::NoJobCapacity);
        }

        for origin in &self.allowed_origins {
            if http::HeaderValue::from_str(origin).is_err() {
                return Err(ValidationError::InvalidOrigin(origin.clone()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
            listener:
                host: 0.0.0.0
                port: 8080
            admin_listener:
                host: 127.0.0.1
                port: 8081
            jobs:
                max_jobs: 10
            documents:
                template_path: /etc/regbridge/poa.html
            allowed_origins:
                - https://app.example.com
            "#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.listener.port, 8080);
        assert_eq!(config.jobs.max_jobs, 10);
        assert_eq!(config.jobs.ttl_secs, 24 * 3600);
        let documents = config.documents.as_ref().unwrap();
        assert_eq!(documents.template_path, PathBuf::from("/etc/regbridge/poa.html"));
        assert_eq!(documents.browser_path, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port() {
        let config = Config {
            admin_listener: Listener {
                host: "127.0.0.1".into(),
                port: 0,
            },
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ValidationError::InvalidPort));
    }
}
