//! Persisted record shapes shared by dispatch and ingestion.

pub mod incoming;
pub mod logs;
pub mod outbox;
pub mod outgoing;

use chrono::{DateTime, SubsecRound, Utc};

pub use incoming::{IncomingAttachment, IncomingMessage, Mailbox};
pub use logs::{DeliveryLogEntry, DeliveryOutcome, LogLevel};
pub use outbox::OutboxConfiguration;
pub use outgoing::{EmailTemplate, OutgoingAttachment, OutgoingMessage, Priority, Status};

/// Current time at the microsecond precision the store keeps.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
