//! SMTP outbox configuration records.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ConfigError;

/// Connection parameters for an SMTP relay. At most one is active at a time;
/// the repository enforces that when saving an active configuration.
#[derive(Debug, Clone)]
pub struct OutboxConfiguration {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: secrecy::SecretString,
    /// STARTTLS.
    pub use_tls: bool,
    /// Implicit TLS.
    pub use_ssl: bool,
    pub ssl_keyfile: Option<String>,
    pub ssl_certfile: Option<String>,
    /// Socket timeout in seconds.
    pub timeout: Option<u64>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl OutboxConfiguration {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            host: host.into(),
            port: 587,
            username: username.into(),
            password: secrecy::SecretString::from(password.into()),
            use_tls: true,
            use_ssl: false,
            ssl_keyfile: None,
            ssl_certfile: None,
            timeout: None,
            active: false,
            created_at: super::now(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder: switch to implicit TLS (clears STARTTLS).
    pub fn with_ssl(mut self) -> Self {
        self.use_ssl = true;
        self.use_tls = false;
        self
    }

    pub fn plaintext(mut self) -> Self {
        self.use_ssl = false;
        self.use_tls = false;
        self
    }

    pub fn active(mut self) -> Self {
        self.active = true;
        self
    }

    /// TLS and SSL are mutually exclusive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.use_tls && self.use_ssl {
            return Err(ConfigError::TlsAndSsl);
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "host".into(),
                message: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for OutboxConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}
