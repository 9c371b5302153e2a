//! Inbound mail — poll mailboxes, dehydrate and persist what arrives.
//!
//! Protocol clients (IMAP, POP3, local mailbox files) sit behind
//! [`MailboxConnection`]; this module only sees raw message bytes.

mod reader;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::error::Error;
use crate::events::{EventBus, GatewayEvent};
use crate::mime::{self, MimePart};
use crate::models::{IncomingAttachment, IncomingMessage, Mailbox};
use crate::storage::{AttachmentStore, store_original};
use crate::store::Repository;

/// Longest subject kept on a record, in characters.
const MAX_SUBJECT_CHARS: usize = 255;

/// An open connection to a remote or local mailbox.
pub trait MailboxConnection: Send + Sync {
    /// Messages available in this poll. Each call is a fresh fetch.
    fn get_messages(&self) -> BoxStream<'_, Vec<u8>>;
}

/// Predicate applied to each parsed message before it is stored.
pub type MessageFilter = dyn Fn(&MimePart) -> bool + Send + Sync;

/// In-process mailbox fed by [`MemoryMailbox::deliver`]. Each poll drains
/// what has been delivered so far.
#[derive(Debug, Default)]
pub struct MemoryMailbox {
    pending: Mutex<VecDeque<Vec<u8>>>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliver(&self, raw: impl Into<Vec<u8>>) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back(raw.into());
        }
    }
}

impl MailboxConnection for MemoryMailbox {
    fn get_messages(&self) -> BoxStream<'_, Vec<u8>> {
        let drained: Vec<Vec<u8>> = match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        futures::stream::iter(drained).boxed()
    }
}

/// Turns raw incoming messages into stored records and back.
#[derive(Clone)]
pub struct Ingestor {
    repo: Arc<dyn Repository>,
    store: Arc<dyn AttachmentStore>,
    config: Arc<GatewayConfig>,
    events: EventBus,
}

impl Ingestor {
    pub fn new(repo: Arc<dyn Repository>, store: Arc<dyn AttachmentStore>, config: GatewayConfig) -> Self {
        Self {
            repo,
            store,
            config: Arc::new(config),
            events: EventBus::new(),
        }
    }

    /// Builder: publish to an existing event bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Poll `connection` once, storing every message that passes `condition`.
    /// A message that cannot be stored is logged and skipped; the poll goes on.
    pub async fn get_new_mail(
        &self,
        mailbox: &Mailbox,
        connection: &dyn MailboxConnection,
        condition: Option<&MessageFilter>,
    ) -> Result<Vec<IncomingMessage>, Error> {
        let mut received = Vec::new();
        let mut messages = connection.get_messages();
        while let Some(raw) = messages.next().await {
            if let Some(condition) = condition
                && !condition(&MimePart::parse(&raw))
            {
                debug!(mailbox = %mailbox.name, "Message filtered out");
                continue;
            }
            match self.process_incoming_message(mailbox, &raw).await {
                Ok(Some(message)) => received.push(message),
                Ok(None) => {}
                Err(e) => error!(mailbox = %mailbox.name, error = %e, "Failed to store incoming message"),
            }
        }
        drop(messages);

        self.repo.update_last_polling(mailbox.id, Utc::now()).await?;
        if !received.is_empty() {
            info!(mailbox = %mailbox.name, count = received.len(), "Received new mail");
        }
        Ok(received)
    }

    /// Dehydrate and persist one raw message.
    ///
    /// Returns `Ok(None)` when the transformed message cannot be serialized;
    /// nothing is stored in that case.
    pub async fn process_incoming_message(
        &self,
        mailbox: &Mailbox,
        raw: &[u8],
    ) -> Result<Option<IncomingMessage>, Error> {
        let parsed = MimePart::parse(raw);
        let dehydrated = match mime::dehydrate(raw, &self.config) {
            Ok(d) => d,
            Err(e) => {
                warn!(mailbox = %mailbox.name, error = %e, "Dropping message that failed to dehydrate");
                return Ok(None);
            }
        };

        let mut message = IncomingMessage::new(mailbox.id);
        message.subject = self.header_text(&parsed, "Subject").chars().take(MAX_SUBJECT_CHARS).collect();
        message.message_id = parsed.headers.get("Message-ID").unwrap_or_default();
        message.from_header = self.header_text(&parsed, "From");
        message.to_header = match parsed.headers.contains("To") {
            true => self.header_text(&parsed, "To"),
            false => self.header_text(&parsed, "Delivered-To"),
        };
        message.set_body(&dehydrated.serialized);

        if let Some(in_reply_to) = parsed.headers.get("In-Reply-To") {
            message.in_reply_to = self.repo.find_outgoing_by_message_id(in_reply_to.trim()).await?;
        }

        let mut saved: Vec<String> = Vec::new();
        let result = self.persist(&mut message, &dehydrated.attachments, raw, &mut saved).await;
        if let Err(e) = result {
            for reference in &saved {
                if let Err(cleanup) = self.store.delete(reference).await {
                    warn!(reference = %reference, error = %cleanup, "Failed to remove blob after aborted insert");
                }
            }
            return Err(e);
        }

        self.events.publish(GatewayEvent::MessageReceived {
            id: message.id,
            mailbox_id: mailbox.id,
        });
        info!(
            message_id = %message.id,
            mailbox = %mailbox.name,
            attachments = dehydrated.attachments.len(),
            "Incoming message stored"
        );
        Ok(Some(message))
    }

    /// Store blobs, then the records. `saved` collects blob references so a
    /// failed insert can be rolled back.
    async fn persist(
        &self,
        message: &mut IncomingMessage,
        pending: &[mime::PendingAttachment],
        raw: &[u8],
        saved: &mut Vec<String>,
    ) -> Result<(), Error> {
        if self.config.store_original_message {
            let original = store_original(self.store.as_ref(), raw, &self.config).await?;
            saved.push(original.reference.clone());
            message.eml = Some(original.reference);
        }

        let mut attachments = Vec::with_capacity(pending.len());
        for attachment in pending {
            let document = self.store.save(&attachment.payload, &attachment.stored_name).await?;
            saved.push(document.clone());
            attachments.push(IncomingAttachment::new(
                attachment.id,
                Some(message.id),
                &attachment.headers,
                document,
            )?);
        }

        self.repo.insert_incoming(message, &attachments).await?;
        Ok(())
    }

    /// Decoded header value; 8-bit bytes use the configured default charset.
    fn header_text(&self, part: &MimePart, name: &str) -> String {
        part.headers
            .header(name)
            .map(|h| mime::decode_header_value(&h.value_with_charset(&self.config.default_charset)))
            .unwrap_or_default()
    }

    /// Poll `connection` every `interval` until the returned flag is set.
    pub fn spawn_poller(
        self,
        mailbox: Mailbox,
        connection: Arc<dyn MailboxConnection>,
        interval: Duration,
    ) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            info!(mailbox = %mailbox.name, "Mailbox poller started, polling every {}s", interval.as_secs());
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    info!(mailbox = %mailbox.name, "Mailbox poller shutting down");
                    return;
                }
                if let Err(e) = self.get_new_mail(&mailbox, connection.as_ref(), None).await {
                    error!(mailbox = %mailbox.name, error = %e, "Mailbox poll failed");
                }
            }
        });

        (handle, shutdown_flag)
    }
}
