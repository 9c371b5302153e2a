//! Outbound dispatch — batch selection, rendering, concurrent delivery and
//! outcome recording.
//!
//! A batch runs in two phases per partition:
//! 1. **prepare** (sequential): render every message and load attachments.
//!    Render failures never reach the network.
//! 2. **deliver** (concurrent): prepared messages are drained by
//!    `min(threads_per_process, n)` blocking lanes, each with its own
//!    connections.
//!
//! Statuses and delivery logs for the whole batch are written in one
//! transaction after every partition has finished.

pub mod engine;
mod lanes;
mod prepare;

pub use engine::DispatchEngine;

use uuid::Uuid;

use crate::error::Error;

/// Why one message failed. `kind` is the error variant label stored in
/// the delivery log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub kind: String,
    pub message: String,
}

impl DeliveryFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&Error> for DeliveryFailure {
    fn from(err: &Error) -> Self {
        let message = match err {
            Error::Config(e) => e.to_string(),
            Error::Database(e) => e.to_string(),
            Error::Storage(e) => e.to_string(),
            Error::Mime(e) => e.to_string(),
            Error::Render(e) => e.to_string(),
            Error::Send(e) => e.to_string(),
            Error::Validation(e) => e.to_string(),
        };
        Self::new(err.kind(), message)
    }
}

impl From<Error> for DeliveryFailure {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}

impl std::fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone)]
pub(crate) struct Outcome {
    pub id: Uuid,
    pub result: Result<(), DeliveryFailure>,
}

impl Outcome {
    pub fn sent(id: Uuid) -> Self {
        Self { id, result: Ok(()) }
    }

    pub fn failed(id: Uuid, failure: DeliveryFailure) -> Self {
        Self {
            id,
            result: Err(failure),
        }
    }
}

/// Counts for one or more batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.attempted == 0
    }
}

impl std::ops::AddAssign for BatchReport {
    fn add_assign(&mut self, other: Self) {
        self.attempted += other.attempted;
        self.sent += other.sent;
        self.failed += other.failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, SendError};

    #[test]
    fn failure_keeps_variant_label_and_inner_message() {
        let err: Error = SendError::Rejected("550 mailbox unavailable".into()).into();
        let failure = DeliveryFailure::from(err);
        assert_eq!(failure.kind, "Rejected");
        assert_eq!(failure.message, "Delivery rejected: 550 mailbox unavailable");

        let err: Error = ConfigError::ActiveOutbox { count: 0 }.into();
        assert_eq!(DeliveryFailure::from(&err).kind, "ActiveOutbox");
    }

    #[test]
    fn reports_accumulate() {
        let mut total = BatchReport::default();
        total += BatchReport {
            attempted: 3,
            sent: 2,
            failed: 1,
        };
        total += BatchReport {
            attempted: 1,
            sent: 1,
            failed: 0,
        };
        assert_eq!(
            total,
            BatchReport {
                attempted: 4,
                sent: 3,
                failed: 1
            }
        );
    }
}
