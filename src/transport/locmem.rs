//! In-process backend that records messages instead of sending them.

use std::sync::{Arc, Mutex};

use super::{Backend, Connection, PreparedEmail};
use crate::error::SendError;

/// Every connection opened from one `LocmemBackend` appends to the same
/// shared outbox.
#[derive(Debug, Clone, Default)]
pub struct LocmemBackend {
    outbox: Arc<Mutex<Vec<PreparedEmail>>>,
}

impl LocmemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages delivered so far.
    pub fn sent(&self) -> Vec<PreparedEmail> {
        self.outbox.lock().map(|o| o.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut outbox) = self.outbox.lock() {
            outbox.clear();
        }
    }
}

impl Backend for LocmemBackend {
    fn name(&self) -> &str {
        "locmem"
    }

    fn open(&self) -> Result<Box<dyn Connection>, SendError> {
        Ok(Box::new(LocmemConnection {
            outbox: Arc::clone(&self.outbox),
        }))
    }
}

struct LocmemConnection {
    outbox: Arc<Mutex<Vec<PreparedEmail>>>,
}

impl Connection for LocmemConnection {
    fn send(&mut self, email: &PreparedEmail) -> Result<(), SendError> {
        self.outbox
            .lock()
            .map_err(|_| SendError::Transport("locmem outbox lock poisoned".into()))?
            .push(email.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::message::EmailParts;

    #[test]
    fn connections_share_one_outbox() {
        let backend = LocmemBackend::new();
        let email = PreparedEmail::build(EmailParts {
            from: "a@example.com".into(),
            to: vec!["b@example.com".into()],
            ..EmailParts::default()
        })
        .unwrap();

        let mut first = backend.open().unwrap();
        let mut second = backend.open().unwrap();
        first.send(&email).unwrap();
        second.send(&email).unwrap();
        assert_eq!(backend.sent().len(), 2);

        backend.clear();
        assert!(backend.sent().is_empty());
    }
}
