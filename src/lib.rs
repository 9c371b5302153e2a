//! Mail Gateway — queued outgoing mail and dehydrated incoming mail.
//!
//! Outgoing messages are queued through [`mailer::Mailer`] and delivered in
//! batches by [`dispatch::DispatchEngine`]. Incoming messages are stored by
//! [`ingest::Ingestor`] with binary parts moved into an attachment store.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod ingest;
pub mod mailer;
pub mod mime;
pub mod models;
pub mod storage;
pub mod store;
pub mod template;
pub mod transport;
pub mod validators;
