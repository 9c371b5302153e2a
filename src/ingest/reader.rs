//! Reading stored incoming mail back: rehydration, body text, replies and
//! deletion.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::Ingestor;
use crate::error::{Error, StorageError, ValidationError};
use crate::mailer::{Mailer, SendRequest};
use crate::mime::{self, AttachmentContent, MimePart};
use crate::models::{IncomingAttachment, IncomingMessage, OutgoingMessage};
use crate::storage::load_original;

impl Ingestor {
    /// Bytes the message was stored from: the original when kept, else the
    /// dehydrated inline body.
    pub async fn raw_message(&self, message: &IncomingMessage) -> Result<Vec<u8>, Error> {
        if let Some(reference) = &message.eml {
            match load_original(self.store.as_ref(), reference).await {
                Ok(bytes) => return Ok(bytes),
                Err(StorageError::NotFound(_)) => {
                    warn!(message_id = %message.id, reference = %reference, "Original message missing, using stored body");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(message.body_bytes()?)
    }

    /// The full message tree with every offloaded attachment put back.
    pub async fn message_object(&self, message: &IncomingMessage) -> Result<MimePart, Error> {
        let parsed = MimePart::parse(&self.raw_message(message).await?);

        let mut attachments = HashMap::new();
        for id in mime::placeholder_ids(&parsed, &self.config) {
            let Ok(uuid) = Uuid::parse_str(id.trim()) else {
                warn!(message_id = %message.id, placeholder = %id, "Placeholder does not name an attachment");
                continue;
            };
            let Some(record) = self.repo.get_incoming_attachment(uuid).await? else {
                warn!(message_id = %message.id, attachment_id = %uuid, "Attachment record missing");
                continue;
            };
            let payload = match self.store.read(&record.document).await {
                Ok(bytes) => bytes,
                Err(StorageError::NotFound(_)) => {
                    warn!(message_id = %message.id, document = %record.document, "Attachment file missing");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            attachments.insert(
                id,
                AttachmentContent {
                    headers: record.header_list()?,
                    payload,
                },
            );
        }

        Ok(mime::rehydrate(&parsed, &attachments, &self.config))
    }

    /// Every text/plain part, soft line breaks removed.
    pub async fn text(&self, message: &IncomingMessage) -> Result<String, Error> {
        let tree = self.message_object(message).await?;
        Ok(mime::body_text(&tree, "text/plain").replace("=\n", "").trim().to_string())
    }

    /// Every text/html part, newlines removed.
    pub async fn html(&self, message: &IncomingMessage) -> Result<String, Error> {
        let tree = self.message_object(message).await?;
        Ok(mime::body_text(&tree, "text/html").replace(['\r', '\n'], "").trim().to_string())
    }

    /// Decoded content of one stored attachment.
    pub async fn attachment_content(&self, attachment: &IncomingAttachment) -> Result<Vec<u8>, Error> {
        Ok(self.store.read(&attachment.document).await?)
    }

    pub async fn attachments(&self, message: &IncomingMessage) -> Result<Vec<IncomingAttachment>, Error> {
        Ok(self.repo.incoming_attachments(message.id).await?)
    }

    /// Unread messages, oldest first.
    pub async fn unread(&self, mailbox_id: Option<Uuid>) -> Result<Vec<IncomingMessage>, Error> {
        Ok(self.repo.unread_incoming(mailbox_id).await?)
    }

    pub async fn mark_read(&self, message: &mut IncomingMessage) -> Result<(), Error> {
        let now = Utc::now();
        self.repo.mark_read(message.id, now).await?;
        message.read = Some(now);
        Ok(())
    }

    /// Answer `message` through the queue. The sender is the mailbox's
    /// address; recipients default to the original sender.
    pub async fn reply(
        &self,
        mailer: &Mailer,
        message: &IncomingMessage,
        mut request: SendRequest,
    ) -> Result<OutgoingMessage, Error> {
        let from_email = self
            .repo
            .get_mailbox(message.mailbox_id)
            .await?
            .and_then(|mailbox| mailbox.from_email)
            .filter(|from| !from.trim().is_empty())
            .ok_or(ValidationError::NoReplySender(message.id))?;

        if request.recipients.is_empty() {
            request.recipients = message.from_address();
        }
        request.sender = from_email;
        for (name, value) in reply_headers(&request.sender, message) {
            request.headers.insert(name.to_string(), value);
        }

        let sent = mailer.send(request).await?;
        info!(message_id = %message.id, reply_id = %sent.id, "Reply queued");
        Ok(sent)
    }

    /// Remove attachment files and records, then the original, then the
    /// message itself.
    pub async fn delete_message(&self, message: &IncomingMessage) -> Result<(), Error> {
        for attachment in self.repo.incoming_attachments(message.id).await? {
            self.store.delete(&attachment.document).await?;
            self.repo.delete_incoming_attachment(attachment.id).await?;
        }
        if let Some(reference) = &message.eml {
            self.store.delete(reference).await?;
        }
        self.repo.delete_incoming(message.id).await?;
        info!(message_id = %message.id, "Incoming message deleted");
        Ok(())
    }
}

/// `Message-ID`, `Date` and `In-Reply-To` for a reply sent from `sender`.
fn reply_headers(sender: &str, message: &IncomingMessage) -> [(&'static str, String); 3] {
    let domain = mime::parse_addresses(sender)
        .first()
        .and_then(|addr| addr.rsplit_once('@').map(|(_, d)| d.to_string()))
        .unwrap_or_else(|| "localhost".to_string());
    [
        ("Message-ID", format!("<{}@{domain}>", Uuid::new_v4().simple())),
        ("Date", Utc::now().to_rfc2822()),
        ("In-Reply-To", message.message_id.trim().to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::GatewayConfig;
    use crate::dispatch::DispatchEngine;
    use crate::models::Mailbox;
    use crate::storage::{AttachmentStore, MemoryStore};
    use crate::store::{LibSqlRepository, Repository};
    use crate::transport::{BackendRegistry, LocmemBackend};

    const WITH_ATTACHMENT: &[u8] = b"From: Alice <alice@example.com>\r\n\
To: support@example.com\r\n\
Subject: report\r\n\
Message-ID: <abc@example.com>\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain; charset=us-ascii\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
see the long line that was=\r\n soft wrapped\r\n\
--b1\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>see\r\n\
attached</p>\r\n\
--b1\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQ=\r\n\
--b1--\r\n";

    struct Fixture {
        ingestor: Ingestor,
        repo: Arc<LibSqlRepository>,
        store: Arc<MemoryStore>,
        mailbox: Mailbox,
    }

    async fn fixture(config: GatewayConfig) -> Fixture {
        let repo = Arc::new(LibSqlRepository::new_memory().await.unwrap());
        let store = Arc::new(MemoryStore::new());
        let mailbox = Mailbox::new("support").with_from_email("support@example.com");
        repo.save_mailbox(&mailbox).await.unwrap();
        Fixture {
            ingestor: Ingestor::new(repo.clone(), store.clone(), config),
            repo,
            store,
            mailbox,
        }
    }

    fn inline_only() -> GatewayConfig {
        GatewayConfig {
            store_original_message: false,
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn rehydrates_from_inline_body() {
        let f = fixture(inline_only()).await;
        let msg = f
            .ingestor
            .process_incoming_message(&f.mailbox, WITH_ATTACHMENT)
            .await
            .unwrap()
            .unwrap();
        assert!(msg.eml.is_none());

        let attachments = f.ingestor.attachments(&msg).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].filename(), "report.pdf");
        assert_eq!(f.ingestor.attachment_content(&attachments[0]).await.unwrap(), b"%PDF-1.4");

        let tree = f.ingestor.message_object(&msg).await.unwrap();
        let pdf = tree.walk().into_iter().find(|p| p.content_type() == "application/pdf").unwrap();
        assert_eq!(pdf.decoded_payload(), b"%PDF-1.4");
        assert_eq!(pdf.filename().as_deref(), Some("report.pdf"));
    }

    #[tokio::test]
    async fn text_and_html_accessors() {
        let f = fixture(inline_only()).await;
        let msg = f
            .ingestor
            .process_incoming_message(&f.mailbox, WITH_ATTACHMENT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.ingestor.text(&msg).await.unwrap(), "see the long line that was soft wrapped");
        assert_eq!(f.ingestor.html(&msg).await.unwrap(), "<p>seeattached</p>");
    }

    #[tokio::test]
    async fn original_is_preferred_when_kept() {
        let f = fixture(GatewayConfig {
            compress_original_message: true,
            ..GatewayConfig::default()
        })
        .await;
        let msg = f
            .ingestor
            .process_incoming_message(&f.mailbox, WITH_ATTACHMENT)
            .await
            .unwrap()
            .unwrap();
        assert!(msg.eml.as_deref().is_some_and(|r| r.ends_with(".gz")));
        assert_eq!(f.ingestor.raw_message(&msg).await.unwrap(), WITH_ATTACHMENT);
    }

    #[tokio::test]
    async fn missing_attachment_file_leaves_marked_placeholder() {
        let f = fixture(inline_only()).await;
        let msg = f
            .ingestor
            .process_incoming_message(&f.mailbox, WITH_ATTACHMENT)
            .await
            .unwrap()
            .unwrap();
        let attachment = &f.ingestor.attachments(&msg).await.unwrap()[0];
        f.store.delete(&attachment.document).await.unwrap();

        let config = f.ingestor.config().clone();
        let tree = f.ingestor.message_object(&msg).await.unwrap();
        assert!(tree.walk().iter().any(|p| p.headers.contains(&config.altered_message_header)));
    }

    #[tokio::test]
    async fn mark_read_removes_from_unread() {
        let f = fixture(inline_only()).await;
        let mut msg = f
            .ingestor
            .process_incoming_message(&f.mailbox, WITH_ATTACHMENT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.ingestor.unread(Some(f.mailbox.id)).await.unwrap().len(), 1);

        f.ingestor.mark_read(&mut msg).await.unwrap();
        assert!(msg.is_read());
        assert!(f.ingestor.unread(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_files_before_rows() {
        let f = fixture(GatewayConfig::default()).await;
        let msg = f
            .ingestor
            .process_incoming_message(&f.mailbox, WITH_ATTACHMENT)
            .await
            .unwrap()
            .unwrap();
        let attachment_id = f.ingestor.attachments(&msg).await.unwrap()[0].id;
        assert_eq!(f.store.len().await, 2);

        f.ingestor.delete_message(&msg).await.unwrap();
        assert!(f.store.is_empty().await);
        assert!(f.repo.get_incoming(msg.id).await.unwrap().is_none());
        assert!(f.repo.get_incoming_attachment(attachment_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reply_is_threaded_and_addressed_to_sender() {
        let f = fixture(inline_only()).await;
        let msg = f
            .ingestor
            .process_incoming_message(&f.mailbox, WITH_ATTACHMENT)
            .await
            .unwrap()
            .unwrap();

        let registry = BackendRegistry::new().with_backend("default", Arc::new(LocmemBackend::new()));
        let engine = DispatchEngine::new(f.repo.clone(), f.store.clone(), registry, GatewayConfig::default());
        let mailer = Mailer::new(engine);

        let request = SendRequest::default().with_subject("Re: report").with_message("Thanks");
        let reply = f.ingestor.reply(&mailer, &msg, request).await.unwrap();
        assert_eq!(reply.from_email, "support@example.com");
        assert_eq!(reply.to, vec!["alice@example.com".to_string()]);
        assert_eq!(reply.headers.get("In-Reply-To").map(String::as_str), Some("<abc@example.com>"));
        assert!(reply.headers["Message-ID"].ends_with("@example.com>"));
        assert!(reply.headers.contains_key("Date"));
    }

    #[tokio::test]
    async fn reply_without_mailbox_address_fails() {
        let f = fixture(inline_only()).await;
        let silent = Mailbox::new("silent");
        f.repo.save_mailbox(&silent).await.unwrap();
        let msg = f
            .ingestor
            .process_incoming_message(&silent, WITH_ATTACHMENT)
            .await
            .unwrap()
            .unwrap();

        let engine = DispatchEngine::new(
            f.repo.clone(),
            f.store.clone(),
            BackendRegistry::new(),
            GatewayConfig::default(),
        );
        let err = f
            .ingestor
            .reply(&Mailer::new(engine), &msg, SendRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::NoReplySender(id)) if id == msg.id));
    }
}
