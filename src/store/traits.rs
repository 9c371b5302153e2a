//! `Repository` trait — the gateway's single async persistence interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::SortKey;
use crate::error::DatabaseError;
use crate::models::{
    DeliveryLogEntry, EmailTemplate, IncomingAttachment, IncomingMessage, Mailbox, OutboxConfiguration,
    OutgoingAttachment, OutgoingMessage,
};

/// Backend-agnostic repository over outgoing and incoming mail records.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Templates ───────────────────────────────────────────────────

    async fn insert_template(&self, template: &EmailTemplate) -> Result<(), DatabaseError>;

    async fn get_template(&self, id: Uuid) -> Result<Option<EmailTemplate>, DatabaseError>;

    // ── Outgoing messages ───────────────────────────────────────────

    /// Insert messages and link their attachments, all or nothing.
    async fn insert_outgoing(&self, messages: &[OutgoingMessage]) -> Result<(), DatabaseError>;

    /// Get a message with its template and attachments.
    async fn get_outgoing(&self, id: Uuid) -> Result<Option<OutgoingMessage>, DatabaseError>;

    /// Up to `limit` queued messages due at `now`, in `order`.
    async fn queued_batch(
        &self,
        now: DateTime<Utc>,
        order: &[SortKey],
        limit: usize,
    ) -> Result<Vec<OutgoingMessage>, DatabaseError>;

    /// Apply a batch outcome in one transaction: statuses for every message
    /// plus the delivery log rows.
    async fn record_delivery(
        &self,
        sent: &[Uuid],
        failed: &[Uuid],
        logs: &[DeliveryLogEntry],
    ) -> Result<(), DatabaseError>;

    /// Most recent outgoing message whose serialized headers contain this
    /// `Message-ID` value.
    async fn find_outgoing_by_message_id(&self, message_id: &str) -> Result<Option<Uuid>, DatabaseError>;

    /// Delete messages created before `cutoff` with their logs. Returns the
    /// number of messages removed.
    async fn delete_outgoing_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError>;

    // ── Outgoing attachments ────────────────────────────────────────

    async fn insert_outgoing_attachment(&self, attachment: &OutgoingAttachment) -> Result<(), DatabaseError>;

    /// Attachments no message links to.
    async fn orphaned_outgoing_attachments(&self) -> Result<Vec<OutgoingAttachment>, DatabaseError>;

    async fn delete_outgoing_attachment(&self, id: Uuid) -> Result<(), DatabaseError>;

    // ── Delivery logs ───────────────────────────────────────────────

    async fn logs_for(&self, email_id: Uuid) -> Result<Vec<DeliveryLogEntry>, DatabaseError>;

    // ── Outbox configurations ───────────────────────────────────────

    /// Upsert. Saving an active configuration deactivates every other one
    /// in the same transaction.
    async fn save_outbox(&self, outbox: &OutboxConfiguration) -> Result<(), DatabaseError>;

    async fn get_outbox(&self, id: Uuid) -> Result<Option<OutboxConfiguration>, DatabaseError>;

    async fn active_outboxes(&self) -> Result<Vec<OutboxConfiguration>, DatabaseError>;

    // ── Mailboxes ───────────────────────────────────────────────────

    async fn save_mailbox(&self, mailbox: &Mailbox) -> Result<(), DatabaseError>;

    async fn get_mailbox(&self, id: Uuid) -> Result<Option<Mailbox>, DatabaseError>;

    async fn active_mailboxes(&self) -> Result<Vec<Mailbox>, DatabaseError>;

    async fn update_last_polling(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    // ── Incoming messages ───────────────────────────────────────────

    /// Insert a message with its attachment records, all or nothing.
    async fn insert_incoming(
        &self,
        message: &IncomingMessage,
        attachments: &[IncomingAttachment],
    ) -> Result<(), DatabaseError>;

    async fn get_incoming(&self, id: Uuid) -> Result<Option<IncomingMessage>, DatabaseError>;

    /// Unread messages, optionally limited to one mailbox, oldest first.
    async fn unread_incoming(&self, mailbox_id: Option<Uuid>) -> Result<Vec<IncomingMessage>, DatabaseError>;

    async fn mark_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Delete the message row. Attachment rows are orphaned, not removed.
    async fn delete_incoming(&self, id: Uuid) -> Result<(), DatabaseError>;

    async fn incoming_attachments(&self, message_id: Uuid) -> Result<Vec<IncomingAttachment>, DatabaseError>;

    async fn get_incoming_attachment(&self, id: Uuid) -> Result<Option<IncomingAttachment>, DatabaseError>;

    async fn delete_incoming_attachment(&self, id: Uuid) -> Result<(), DatabaseError>;
}
