//! Queueing API — create outgoing mail, send it now or leave it for the
//! dispatch loop, and clean up old records.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::{BatchReport, DispatchEngine};
use crate::error::{ConfigError, Error, ValidationError};
use crate::events::GatewayEvent;
use crate::models::{EmailTemplate, LogLevel, OutgoingAttachment, OutgoingMessage, Priority, Status};
use crate::validators::{parse_emails, validate_email_with_name, validate_template_syntax};

/// File contents to attach to a new message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachment {
    pub name: String,
    pub content: Vec<u8>,
    pub mimetype: Option<String>,
}

impl NewAttachment {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            mimetype: None,
        }
    }

    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.mimetype = Some(mimetype.into());
        self
    }
}

/// Arguments to [`Mailer::send`].
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub sender: String,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub template: Option<EmailTemplate>,
    pub subject: String,
    pub message: String,
    pub html_message: String,
    pub context: BTreeMap<String, String>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub headers: BTreeMap<String, String>,
    /// Falls back to the configured default.
    pub priority: Option<Priority>,
    pub attachments: Vec<NewAttachment>,
    /// Overrides the configured log level for immediate sends.
    pub log_level: Option<LogLevel>,
    pub backend: String,
}

impl SendRequest {
    pub fn new(sender: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            sender: sender.into(),
            recipients,
            ..Self::default()
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html_message = html.into();
        self
    }

    pub fn with_template(mut self, template: EmailTemplate, context: BTreeMap<String, String>) -> Self {
        self.template = Some(template);
        self.context = context;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_attachment(mut self, attachment: NewAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_backend(mut self, alias: impl Into<String>) -> Self {
        self.backend = alias.into();
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }
}

/// What [`Mailer::cleanup`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub messages: usize,
    pub attachments: usize,
}

/// Front door for outgoing mail.
#[derive(Clone)]
pub struct Mailer {
    engine: DispatchEngine,
}

impl Mailer {
    pub fn new(engine: DispatchEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &DispatchEngine {
        &self.engine
    }

    /// Store a template after checking every source parses.
    pub async fn save_template(&self, template: &EmailTemplate) -> Result<(), Error> {
        for (_, source) in template.sources() {
            validate_template_syntax(self.engine.renderer(), source)?;
        }
        self.engine.repository().insert_template(template).await?;
        Ok(())
    }

    /// Validate a request and build the record without persisting it.
    pub fn create(&self, request: &SendRequest) -> Result<OutgoingMessage, Error> {
        validate_email_with_name(&request.sender, "sender")?;
        let to = parse_emails(&request.recipients, "recipients")?;
        let cc = parse_emails(&request.cc, "cc")?;
        let bcc = parse_emails(&request.bcc, "bcc")?;

        if request.template.is_some() {
            for (field, value) in [
                ("subject", &request.subject),
                ("message", &request.message),
                ("html_message", &request.html_message),
            ] {
                if !value.is_empty() {
                    return Err(ValidationError::TemplateConflict(field.to_string()).into());
                }
            }
        }
        if !self.engine.backends().accepts(&request.backend) {
            return Err(ConfigError::UnknownBackend {
                alias: request.backend.clone(),
            }
            .into());
        }

        let priority = request.priority.unwrap_or(self.engine.config().default_priority);
        let mut message = OutgoingMessage::new(request.sender.trim(), to)
            .with_subject(request.subject.clone())
            .with_message(request.message.clone())
            .with_html(request.html_message.clone())
            .with_context(request.context.clone())
            .with_priority(priority)
            .with_backend(request.backend.trim());
        message.cc = cc;
        message.bcc = bcc;
        message.headers = request.headers.clone();
        message.scheduled_time = request.scheduled_time;
        message.template = request.template.clone();
        Ok(message)
    }

    /// Queue a message, or send it immediately for priority `now`.
    pub async fn send(&self, request: SendRequest) -> Result<OutgoingMessage, Error> {
        let mut message = self.create(&request)?;
        message.attachments = self.save_attachments(&request.attachments).await?;
        let repo = self.engine.repository();
        repo.insert_outgoing(std::slice::from_ref(&message)).await?;

        if message.priority == Priority::Now {
            let report = self.engine.dispatch_one(&message, request.log_level).await?;
            message.status = Some(if report.sent == 1 { Status::Sent } else { Status::Failed });
            debug!(email_id = %message.id, status = ?message.status, "Sent immediately");
        } else {
            self.engine.events().publish(GatewayEvent::EmailQueued { id: message.id });
            debug!(email_id = %message.id, priority = %message.priority, "Queued");
        }
        Ok(message)
    }

    /// Queue many messages in one transaction. Immediate priority and
    /// attachments are not supported here.
    pub async fn send_many(&self, requests: Vec<SendRequest>) -> Result<Vec<OutgoingMessage>, Error> {
        let mut messages = Vec::with_capacity(requests.len());
        for request in &requests {
            if request.priority == Some(Priority::Now) {
                return Err(ValidationError::NotAllowed("send_many() can't be used with priority = 'now'".into()).into());
            }
            if !request.attachments.is_empty() {
                return Err(ValidationError::NotAllowed("send_many() can't be used to send attachments".into()).into());
            }
            messages.push(self.create(request)?);
        }
        // A configured default of `now` still queues.
        for message in &mut messages {
            if message.priority == Priority::Now {
                message.priority = Priority::High;
                message.status = Some(Status::Queued);
            }
        }

        self.engine.repository().insert_outgoing(&messages).await?;
        for message in &messages {
            self.engine.events().publish(GatewayEvent::EmailQueued { id: message.id });
        }
        info!(count = messages.len(), "Queued messages");
        Ok(messages)
    }

    /// One message per recipient.
    pub async fn send_mail(
        &self,
        subject: &str,
        message: &str,
        from: &str,
        recipients: &[String],
        html_message: &str,
        priority: Option<Priority>,
    ) -> Result<Vec<OutgoingMessage>, Error> {
        let mut out = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let mut request = SendRequest::new(from, vec![recipient.clone()])
                .with_subject(subject)
                .with_message(message)
                .with_html(html_message);
            request.priority = priority;
            out.push(self.send(request).await?);
        }
        Ok(out)
    }

    /// Dispatch queued mail until nothing is due.
    pub async fn send_queued(&self, processes: usize, log_level: Option<LogLevel>) -> Result<BatchReport, Error> {
        self.engine.run_until_empty(processes, log_level).await
    }

    /// Delete messages older than `days` with their logs; optionally delete
    /// attachment files no remaining message uses.
    pub async fn cleanup(&self, days: i64, delete_attachments: bool) -> Result<CleanupReport, Error> {
        let cutoff = Utc::now() - Duration::days(days);
        let repo = self.engine.repository();
        let messages = repo.delete_outgoing_before(cutoff).await?;

        let mut attachments = 0;
        if delete_attachments {
            for orphan in repo.orphaned_outgoing_attachments().await? {
                if let Err(e) = self.engine.attachment_store().delete(&orphan.file).await {
                    warn!(attachment_id = %orphan.id, error = %e, "Failed to delete attachment file");
                    continue;
                }
                repo.delete_outgoing_attachment(orphan.id).await?;
                attachments += 1;
            }
        }
        info!(messages, attachments, %cutoff, "Cleanup complete");
        Ok(CleanupReport { messages, attachments })
    }

    async fn save_attachments(&self, attachments: &[NewAttachment]) -> Result<Vec<OutgoingAttachment>, Error> {
        let store = self.engine.attachment_store();
        let repo = self.engine.repository();
        let mut saved = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let file = store.save(&attachment.content, &attachment.name).await?;
            let record = OutgoingAttachment {
                id: Uuid::new_v4(),
                name: attachment.name.clone(),
                file,
                mimetype: attachment.mimetype.clone(),
            };
            repo.insert_outgoing_attachment(&record).await?;
            saved.push(record);
        }
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::GatewayConfig;
    use crate::storage::MemoryStore;
    use crate::store::{LibSqlRepository, Repository};
    use crate::transport::{BackendRegistry, LocmemBackend};

    async fn mailer() -> (Mailer, Arc<LibSqlRepository>, LocmemBackend) {
        let repo = Arc::new(LibSqlRepository::new_memory().await.unwrap());
        let locmem = LocmemBackend::new();
        let registry = BackendRegistry::new().with_backend("default", Arc::new(locmem.clone()));
        let engine = DispatchEngine::new(repo.clone(), Arc::new(MemoryStore::new()), registry, GatewayConfig::default());
        (Mailer::new(engine), repo, locmem)
    }

    fn request() -> SendRequest {
        SendRequest::new("Sender <from@example.com>", vec!["to@example.com".into()])
            .with_subject("Hi")
            .with_message("Body")
    }

    #[tokio::test]
    async fn send_queues_by_default() {
        let (mailer, repo, locmem) = mailer().await;
        let mut rx = mailer.engine().events().subscribe();
        let msg = mailer.send(request()).await.unwrap();

        assert_eq!(msg.status, Some(Status::Queued));
        assert_eq!(msg.priority, Priority::Medium);
        assert!(locmem.sent().is_empty());
        assert_eq!(rx.recv().await.unwrap(), GatewayEvent::EmailQueued { id: msg.id });
        assert!(repo.get_outgoing(msg.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn priority_now_sends_immediately() {
        let (mailer, repo, locmem) = mailer().await;
        let msg = mailer.send(request().with_priority(Priority::Now)).await.unwrap();

        assert_eq!(msg.status, Some(Status::Sent));
        assert_eq!(locmem.sent().len(), 1);
        assert_eq!(repo.get_outgoing(msg.id).await.unwrap().unwrap().status, Some(Status::Sent));
    }

    #[tokio::test]
    async fn rejects_invalid_input() {
        let (mailer, _repo, _locmem) = mailer().await;

        let bad_address = SendRequest::new("from@example.com", vec!["nope".into()]);
        assert!(matches!(
            mailer.send(bad_address).await,
            Err(Error::Validation(ValidationError::InvalidAddress { .. }))
        ));

        let conflict = request().with_template(EmailTemplate::new("t", "s", "h"), BTreeMap::new());
        assert!(matches!(
            mailer.send(conflict).await,
            Err(Error::Validation(ValidationError::TemplateConflict(f))) if f == "subject"
        ));

        let unknown = request().with_backend("nowhere");
        assert!(matches!(
            mailer.send(unknown).await,
            Err(Error::Config(ConfigError::UnknownBackend { .. }))
        ));
    }

    #[tokio::test]
    async fn attachments_are_stored_and_sent() {
        let (mailer, repo, locmem) = mailer().await;
        let msg = mailer
            .send(
                request()
                    .with_priority(Priority::Now)
                    .with_attachment(NewAttachment::new("a.txt", b"hello".to_vec()).with_mimetype("text/plain")),
            )
            .await
            .unwrap();

        let stored = repo.get_outgoing(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.attachments.len(), 1);
        assert_eq!(locmem.sent()[0].attachments[0].content, b"hello");
    }

    #[tokio::test]
    async fn send_many_refuses_now_and_attachments() {
        let (mailer, _repo, _locmem) = mailer().await;
        assert!(mailer.send_many(vec![request().with_priority(Priority::Now)]).await.is_err());
        assert!(
            mailer
                .send_many(vec![request().with_attachment(NewAttachment::new("a", b"x".to_vec()))])
                .await
                .is_err()
        );

        let queued = mailer.send_many(vec![request(), request()]).await.unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(mailer.send_queued(1, None).await.unwrap().sent, 2);
    }

    #[tokio::test]
    async fn send_mail_creates_one_message_per_recipient() {
        let (mailer, _repo, _locmem) = mailer().await;
        let recipients = vec!["a@example.com".to_string(), "b@example.com".to_string()];
        let msgs = mailer
            .send_mail("s", "m", "from@example.com", &recipients, "", None)
            .await
            .unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].to, vec!["b@example.com".to_string()]);
    }

    #[tokio::test]
    async fn template_syntax_checked_on_save() {
        let (mailer, repo, _locmem) = mailer().await;
        let broken = EmailTemplate::new("t", "Hi {{ name", "");
        assert!(matches!(
            mailer.save_template(&broken).await,
            Err(Error::Validation(ValidationError::NotAllowed(_)))
        ));
        let ok = EmailTemplate::new("t", "Hi {{ name }}", "");
        mailer.save_template(&ok).await.unwrap();
        assert!(repo.get_template(ok.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cleanup_removes_old_mail_and_orphaned_files() {
        let (mailer, repo, _locmem) = mailer().await;
        let msg = mailer
            .send(request().with_attachment(NewAttachment::new("a.txt", b"x".to_vec())))
            .await
            .unwrap();

        let report = mailer.cleanup(0, true).await.unwrap();
        assert_eq!(report, CleanupReport { messages: 1, attachments: 1 });
        assert!(repo.get_outgoing(msg.id).await.unwrap().is_none());
    }
}
