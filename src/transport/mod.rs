//! Transport layer — the sender abstraction the dispatch engine delivers
//! through.
//!
//! A [`Backend`] is a configured transport; it hands out [`Connection`]s.
//! Each dispatch lane opens its own connection per backend and never shares
//! it, so a `Connection` only needs `Send`, not `Sync`.

pub mod locmem;
pub mod message;
pub mod registry;
pub mod smtp;

pub use locmem::LocmemBackend;
pub use message::{PreparedAttachment, PreparedEmail};
pub use registry::{BackendRegistry, DEFAULT_ALIAS};
pub use smtp::SmtpBackend;

use crate::error::SendError;

/// One open transport session, owned by a single lane.
pub trait Connection: Send {
    /// Deliver one message. Blocking.
    fn send(&mut self, email: &PreparedEmail) -> Result<(), SendError>;

    /// Release the session. Called once when the lane finishes.
    fn close(&mut self) {}
}

/// A configured transport.
pub trait Backend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Open a fresh connection.
    fn open(&self) -> Result<Box<dyn Connection>, SendError>;
}
