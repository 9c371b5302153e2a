//! Incoming mail records: mailboxes, messages and offloaded attachments.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MimeError, StorageError};
use crate::mime::{self, HeaderList};

/// A polled mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: Uuid,
    pub name: String,
    /// Address replies are sent from.
    #[serde(default)]
    pub from_email: Option<String>,
    pub active: bool,
    #[serde(default)]
    pub last_polling: Option<DateTime<Utc>>,
}

impl Mailbox {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            from_email: None,
            active: true,
            last_polling: None,
        }
    }

    pub fn with_from_email(mut self, from: impl Into<String>) -> Self {
        self.from_email = Some(from.into());
        self
    }
}

/// A received message in dehydrated form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub id: Uuid,
    pub mailbox_id: Uuid,
    pub subject: String,
    pub message_id: String,
    /// Outgoing message this one answers, if it could be matched.
    #[serde(default)]
    pub in_reply_to: Option<Uuid>,
    pub from_header: String,
    pub to_header: String,
    /// Dehydrated message text; base64 when `encoded` is set.
    pub body: String,
    pub encoded: bool,
    /// Store reference of the full original message, `.gz` when compressed.
    #[serde(default)]
    pub eml: Option<String>,
    pub processed: DateTime<Utc>,
    /// `None` while unread.
    #[serde(default)]
    pub read: Option<DateTime<Utc>>,
}

impl IncomingMessage {
    pub fn new(mailbox_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            mailbox_id,
            subject: String::new(),
            message_id: String::new(),
            in_reply_to: None,
            from_header: String::new(),
            to_header: String::new(),
            body: String::new(),
            encoded: false,
            eml: None,
            processed: super::now(),
            read: None,
        }
    }

    /// Store `bytes` inline, base64-encoded.
    pub fn set_body(&mut self, bytes: &[u8]) {
        self.body = base64::engine::general_purpose::STANDARD.encode(bytes);
        self.encoded = true;
    }

    /// The inline body as bytes.
    pub fn body_bytes(&self) -> Result<Vec<u8>, StorageError> {
        if self.encoded {
            base64::engine::general_purpose::STANDARD
                .decode(self.body.as_bytes())
                .map_err(|e| StorageError::Encoding(format!("message {}: {e}", self.id)))
        } else {
            Ok(self.body.as_bytes().to_vec())
        }
    }

    pub fn is_read(&self) -> bool {
        self.read.is_some()
    }

    pub fn from_address(&self) -> Vec<String> {
        mime::parse_addresses(&self.from_header)
    }

    pub fn to_addresses(&self) -> Vec<String> {
        mime::parse_addresses(&self.to_header)
    }
}

impl std::fmt::Display for IncomingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.subject)
    }
}

/// An attachment lifted out of an incoming message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingAttachment {
    pub id: Uuid,
    /// `None` once orphaned.
    #[serde(default)]
    pub message_id: Option<Uuid>,
    /// Serialized original MIME headers.
    pub headers: String,
    /// Reference into the attachment store.
    pub document: String,
}

impl IncomingAttachment {
    pub fn new(id: Uuid, message_id: Option<Uuid>, headers: &HeaderList, document: impl Into<String>) -> Result<Self, MimeError> {
        Ok(Self {
            id,
            message_id,
            headers: headers.to_blob()?,
            document: document.into(),
        })
    }

    pub fn header_list(&self) -> Result<HeaderList, MimeError> {
        HeaderList::from_blob(&self.headers)
    }

    /// First value of a stored header.
    pub fn get(&self, name: &str) -> Option<String> {
        self.header_list().ok()?.get(name)
    }

    /// Replace a stored header.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), MimeError> {
        let mut headers = self.header_list()?;
        headers.replace(name, value);
        self.headers = headers.to_blob()?;
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<(), MimeError> {
        let mut headers = self.header_list()?;
        headers.remove(name);
        self.headers = headers.to_blob()?;
        Ok(())
    }

    pub fn items(&self) -> Vec<(String, String)> {
        self.header_list().map(|h| h.items()).unwrap_or_default()
    }

    /// Filename from the stored headers, else the store reference's file name.
    pub fn filename(&self) -> String {
        let from_headers = self.header_list().ok().and_then(|headers| {
            mime::MimePart::leaf(headers, Vec::new(), mime::LineEnding::Lf).filename()
        });
        from_headers.unwrap_or_else(|| {
            self.document
                .rsplit('/')
                .next()
                .unwrap_or(&self.document)
                .to_string()
        })
    }
}
