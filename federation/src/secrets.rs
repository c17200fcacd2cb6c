//! Lookup of credentials by name.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum SecretError {
    #[error("secret {0} not found")]
    NotFound(String),

    #[error("secret {0} is empty")]
    Empty(String),

    #[error("could not read secret {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Opaque secret material. Never printed.
#[derive(Clone)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new<T: Into<String>>(value: T) -> Self {
        SecretValue(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<SecretValue, SecretError>;
}

fn non_empty(name: &str, value: &str) -> Result<SecretValue, SecretError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SecretError::Empty(name.to_string()));
    }
    Ok(SecretValue::new(trimmed))
}

/// Reads secrets from environment variables. `gateway/auth-token` with prefix
/// `KEYFED_` resolves to `KEYFED_GATEWAY_AUTH_TOKEN`.
pub struct EnvSecretProvider {
    prefix: String,
}

impl EnvSecretProvider {
    pub fn new(prefix: Option<&str>) -> Self {
        EnvSecretProvider {
            prefix: prefix.unwrap_or_default().to_string(),
        }
    }

    fn variable_name(&self, name: &str) -> String {
        let normalized: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{normalized}", self.prefix)
    }
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<SecretValue, SecretError> {
        let variable = self.variable_name(name);
        let value =
            std::env::var(&variable).map_err(|_| SecretError::NotFound(name.to_string()))?;
        non_empty(name, &value)
    }
}

/// Reads each secret from a file named after it, below a directory.
pub struct FileSecretProvider {
    dir: PathBuf,
}

impl FileSecretProvider {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        FileSecretProvider {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl SecretProvider for FileSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<SecretValue, SecretError> {
        if name.is_empty() || name.contains("..") || name.starts_with('/') {
            return Err(SecretError::NotFound(name.to_string()));
        }

        match tokio::fs::read_to_string(self.dir.join(name)).await {
            Ok(value) => non_empty(name, &value),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SecretError::NotFound(name.to_string()))
            }
            Err(source) => Err(SecretError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }
}
