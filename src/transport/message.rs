//! Ready-to-send messages.
//!
//! Rendering happens once, before any network I/O; the result is a
//! [`PreparedEmail`] carrying both the resolved fields and the built
//! `lettre::Message`.

use std::collections::BTreeMap;
use std::time::SystemTime;

use lettre::Message;
use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::{Attachment, Mailbox, MessageBuilder, MultiPart, SinglePart};
use uuid::Uuid;

use crate::error::RenderError;

/// An attachment with its bytes loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedAttachment {
    pub name: String,
    pub mimetype: Option<String>,
    pub content: Vec<u8>,
}

impl PreparedAttachment {
    /// Declared mimetype, else a guess from the filename.
    pub fn content_type(&self) -> String {
        match &self.mimetype {
            Some(m) if !m.trim().is_empty() => m.clone(),
            _ => mime_guess::from_path(&self.name).first_or_octet_stream().to_string(),
        }
    }
}

/// A rendered outgoing message.
#[derive(Debug, Clone)]
pub struct PreparedEmail {
    pub id: Uuid,
    pub backend_alias: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub attachments: Vec<PreparedAttachment>,
    pub message: Message,
}

/// Fields a [`PreparedEmail`] is built from.
#[derive(Debug, Clone, Default)]
pub struct EmailParts {
    pub id: Uuid,
    pub backend_alias: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub attachments: Vec<PreparedAttachment>,
}

impl PreparedEmail {
    /// Build the wire message. Address or header problems are render errors.
    pub fn build(parts: EmailParts) -> Result<Self, RenderError> {
        let message = build_message(&parts)?;
        let EmailParts {
            id,
            backend_alias,
            from,
            to,
            cc,
            bcc,
            subject,
            text_body,
            html_body,
            headers,
            attachments,
        } = parts;
        Ok(Self {
            id,
            backend_alias,
            from,
            to,
            cc,
            bcc,
            subject,
            text_body,
            html_body,
            headers,
            attachments,
            message,
        })
    }

    /// Serialized RFC 5322 bytes.
    pub fn formatted(&self) -> Vec<u8> {
        self.message.formatted()
    }
}

fn mailbox(value: &str) -> Result<Mailbox, RenderError> {
    value
        .parse()
        .map_err(|e| RenderError::Build(format!("invalid address {value:?}: {e}")))
}

fn with_headers(
    mut builder: MessageBuilder,
    headers: &BTreeMap<String, String>,
) -> Result<MessageBuilder, RenderError> {
    let mut has_message_id = false;
    for (name, value) in headers {
        builder = match name.to_ascii_lowercase().as_str() {
            "message-id" => {
                has_message_id = true;
                builder.message_id(Some(value.clone()))
            }
            "in-reply-to" => builder.in_reply_to(value.clone()),
            "references" => builder.references(value.clone()),
            "reply-to" => builder.reply_to(mailbox(value)?),
            "date" => {
                let date = chrono::DateTime::parse_from_rfc2822(value)
                    .map_err(|e| RenderError::Build(format!("invalid Date header {value:?}: {e}")))?;
                builder.date(SystemTime::from(date))
            }
            _ => {
                let header_name = HeaderName::new_from_ascii(name.clone())
                    .map_err(|e| RenderError::Build(format!("invalid header name {name:?}: {e}")))?;
                builder.raw_header(HeaderValue::new(header_name, value.clone()))
            }
        };
    }
    if !has_message_id {
        builder = builder.message_id(None);
    }
    Ok(builder)
}

fn build_message(parts: &EmailParts) -> Result<Message, RenderError> {
    let mut builder = Message::builder().from(mailbox(&parts.from)?).subject(parts.subject.clone());
    for addr in &parts.to {
        builder = builder.to(mailbox(addr)?);
    }
    for addr in &parts.cc {
        builder = builder.cc(mailbox(addr)?);
    }
    for addr in &parts.bcc {
        builder = builder.bcc(mailbox(addr)?);
    }
    let builder = with_headers(builder, &parts.headers)?;

    let text = parts.text_body.clone();
    let built = if parts.attachments.is_empty() {
        match &parts.html_body {
            Some(html) => builder.multipart(MultiPart::alternative_plain_html(text, html.clone())),
            None => builder.singlepart(SinglePart::plain(text)),
        }
    } else {
        let mut mixed = match &parts.html_body {
            Some(html) => MultiPart::mixed().multipart(MultiPart::alternative_plain_html(text, html.clone())),
            None => MultiPart::mixed().singlepart(SinglePart::plain(text)),
        };
        for attachment in &parts.attachments {
            let content_type = attachment.content_type();
            let content_type = ContentType::parse(&content_type)
                .map_err(|e| RenderError::Build(format!("invalid mimetype {content_type:?}: {e}")))?;
            mixed = mixed.singlepart(
                Attachment::new(attachment.name.clone()).body(attachment.content.clone(), content_type),
            );
        }
        builder.multipart(mixed)
    };
    built.map_err(|e| RenderError::Build(e.to_string()))
}
