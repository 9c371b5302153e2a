//! SMTP backend on `lettre`, configured from an [`OutboxConfiguration`].

use std::time::Duration;

use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use super::{Backend, Connection, PreparedEmail};
use crate::error::{ConfigError, SendError};
use crate::models::OutboxConfiguration;

/// lettre's own default when no timeout is configured.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Reply code for rejected credentials.
const AUTH_FAILED_CODE: &str = "535";

pub struct SmtpBackend {
    name: String,
    outbox: OutboxConfiguration,
}

impl SmtpBackend {
    /// Validate the configuration up front; TLS and SSL together is a
    /// configuration error, not a delivery failure.
    pub fn new(name: impl Into<String>, outbox: OutboxConfiguration) -> Result<Self, ConfigError> {
        outbox.validate()?;
        if outbox.ssl_keyfile.is_some() || outbox.ssl_certfile.is_some() {
            warn!(outbox = %outbox, "Client certificates are not used by the SMTP backend");
        }
        Ok(Self {
            name: name.into(),
            outbox,
        })
    }

    pub fn outbox(&self) -> &OutboxConfiguration {
        &self.outbox
    }

    fn transport(&self) -> Result<SmtpTransport, SendError> {
        let host = &self.outbox.host;
        let connect_err = |e: lettre::transport::smtp::Error| SendError::Connect {
            host: host.clone(),
            reason: e.to_string(),
        };
        let builder = if self.outbox.use_ssl {
            SmtpTransport::relay(host).map_err(connect_err)?
        } else if self.outbox.use_tls {
            SmtpTransport::starttls_relay(host).map_err(connect_err)?
        } else {
            SmtpTransport::builder_dangerous(host)
        };

        let mut builder = builder
            .port(self.outbox.port)
            .timeout(self.outbox.timeout.map(Duration::from_secs));
        if !self.outbox.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.outbox.username.clone(),
                self.outbox.password.expose_secret().to_string(),
            ));
        }
        Ok(builder.build())
    }
}

impl Backend for SmtpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> Result<Box<dyn Connection>, SendError> {
        debug!(backend = %self.name, outbox = %self.outbox, "Opening SMTP connection");
        Ok(Box::new(SmtpConnection {
            transport: self.transport()?,
            host: self.outbox.host.clone(),
            timeout: self.outbox.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS),
        }))
    }
}

struct SmtpConnection {
    transport: SmtpTransport,
    host: String,
    timeout: u64,
}

impl Connection for SmtpConnection {
    fn send(&mut self, email: &PreparedEmail) -> Result<(), SendError> {
        self.transport
            .send(&email.message)
            .map(|_| ())
            .map_err(|e| classify(&e, &self.host, self.timeout))
    }
}

fn classify(err: &lettre::transport::smtp::Error, host: &str, timeout: u64) -> SendError {
    if err.is_timeout() {
        SendError::Timeout { secs: timeout }
    } else if err.status().is_some_and(|code| code.to_string() == AUTH_FAILED_CODE) {
        SendError::AuthFailed { host: host.to_string() }
    } else if err.is_permanent() {
        SendError::Rejected(err.to_string())
    } else if err.is_tls() {
        SendError::Connect {
            host: host.to_string(),
            reason: err.to_string(),
        }
    } else {
        SendError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_and_ssl_together_is_rejected() {
        let mut outbox = OutboxConfiguration::new("main", "smtp.example.com", "u", "p");
        outbox.use_ssl = true;
        assert!(matches!(SmtpBackend::new("default", outbox), Err(ConfigError::TlsAndSsl)));
    }

    #[test]
    fn opens_connections_for_each_security_mode() {
        for outbox in [
            OutboxConfiguration::new("tls", "smtp.example.com", "u", "p"),
            OutboxConfiguration::new("ssl", "smtp.example.com", "u", "p").with_ssl(),
            OutboxConfiguration::new("plain", "localhost", "", "").plaintext().with_port(2525),
        ] {
            let backend = SmtpBackend::new("default", outbox).unwrap();
            assert_eq!(backend.name(), "default");
            assert!(backend.open().is_ok());
        }
    }
}
