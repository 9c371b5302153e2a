//! `DispatchEngine` — selects queued mail and runs batches.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::prepare::{Prepared, prepare};
use super::{BatchReport, DeliveryFailure, Outcome, lanes};
use crate::config::GatewayConfig;
use crate::error::{DatabaseError, Error};
use crate::events::{EventBus, GatewayEvent};
use crate::models::{DeliveryLogEntry, DeliveryOutcome, LogLevel, OutgoingMessage};
use crate::storage::AttachmentStore;
use crate::store::Repository;
use crate::template::{SimpleRenderer, TemplateRenderer};
use crate::transport::{Backend, BackendRegistry};

/// Backend resolution per alias, shared read-only by all partitions.
type ResolvedBackends = Arc<HashMap<String, Result<Arc<dyn Backend>, DeliveryFailure>>>;

/// Sends queued outgoing mail in batches.
///
/// Cheap to clone; partitions run on clones of the engine.
#[derive(Clone)]
pub struct DispatchEngine {
    repo: Arc<dyn Repository>,
    store: Arc<dyn AttachmentStore>,
    backends: Arc<BackendRegistry>,
    renderer: Arc<dyn TemplateRenderer>,
    events: EventBus,
    config: Arc<GatewayConfig>,
}

impl DispatchEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        store: Arc<dyn AttachmentStore>,
        backends: BackendRegistry,
        config: GatewayConfig,
    ) -> Self {
        Self {
            repo,
            store,
            backends: Arc::new(backends),
            renderer: Arc::new(SimpleRenderer::default()),
            events: EventBus::new(),
            config: Arc::new(config),
        }
    }

    /// Builder: use a different template engine.
    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
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

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn renderer(&self) -> &dyn TemplateRenderer {
        self.renderer.as_ref()
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn attachment_store(&self) -> &Arc<dyn AttachmentStore> {
        &self.store
    }

    /// Up to `batch_size` queued messages that are due, in sending order.
    pub async fn select_batch(&self) -> Result<Vec<OutgoingMessage>, DatabaseError> {
        self.repo
            .queued_batch(Utc::now(), &self.config.sending_order, self.config.batch_size)
            .await
    }

    /// Run one batch. `processes` partitions the batch (clamped to the batch
    /// size); `log_level` overrides the configured verbosity.
    ///
    /// Per-message failures of any kind end up in the report; only
    /// repository errors are returned.
    pub async fn send_queued(&self, processes: usize, log_level: Option<LogLevel>) -> Result<BatchReport, Error> {
        let batch = self.select_batch().await?;
        if batch.is_empty() {
            debug!("No queued mail due");
            return Ok(BatchReport::default());
        }
        self.dispatch_batch(batch, processes, log_level).await
    }

    /// Run batches until none are left.
    pub async fn run_until_empty(&self, processes: usize, log_level: Option<LogLevel>) -> Result<BatchReport, Error> {
        let mut total = BatchReport::default();
        loop {
            let report = self.send_queued(processes, log_level).await?;
            if report.is_empty() {
                break;
            }
            total += report;
        }
        Ok(total)
    }

    /// Send one message right away, outside the queue.
    pub async fn dispatch_one(&self, message: &OutgoingMessage, log_level: Option<LogLevel>) -> Result<BatchReport, Error> {
        self.dispatch_batch(vec![message.clone()], 1, log_level).await
    }

    async fn dispatch_batch(
        &self,
        batch: Vec<OutgoingMessage>,
        processes: usize,
        log_level: Option<LogLevel>,
    ) -> Result<BatchReport, Error> {
        let processes = processes.clamp(1, batch.len().max(1));
        info!(count = batch.len(), processes, "Dispatching batch");

        let backends = self.resolve_backends(&batch).await?;
        let partitions = split_round_robin(batch, processes);

        let mut expected: Vec<Vec<Uuid>> = Vec::with_capacity(partitions.len());
        let mut handles = Vec::with_capacity(partitions.len());
        for (index, partition) in partitions.into_iter().enumerate() {
            expected.push(partition.iter().map(|m| m.id).collect());
            let engine = self.clone();
            let backends = Arc::clone(&backends);
            handles.push(tokio::spawn(async move {
                engine.run_partition(index, partition, backends).await
            }));
        }

        let mut outcomes = Vec::new();
        for (ids, result) in expected.into_iter().zip(join_all(handles).await) {
            match result {
                Ok(partition_outcomes) => outcomes.extend(partition_outcomes),
                Err(e) => {
                    error!("Dispatch partition failed: {e}");
                    outcomes.extend(ids.into_iter().map(|id| {
                        Outcome::failed(id, DeliveryFailure::new("TransportError", format!("partition aborted: {e}")))
                    }));
                }
            }
        }

        self.record(outcomes, log_level.unwrap_or(self.config.log_level)).await
    }

    /// Resolve each distinct alias once. Configuration errors become
    /// per-message failures; repository errors abort the batch.
    async fn resolve_backends(&self, batch: &[OutgoingMessage]) -> Result<ResolvedBackends, Error> {
        let mut resolved = HashMap::new();
        for message in batch {
            if resolved.contains_key(&message.backend_alias) {
                continue;
            }
            let backend = match self.backends.resolve(&message.backend_alias, self.repo.as_ref()).await {
                Ok(backend) => Ok(backend),
                Err(Error::Database(e)) => return Err(e.into()),
                Err(e) => {
                    error!(alias = %message.backend_alias, error = %e, "Backend configuration error");
                    Err(DeliveryFailure::from(&e))
                }
            };
            resolved.insert(message.backend_alias.clone(), backend);
        }
        Ok(Arc::new(resolved))
    }

    /// Phase 1 then phase 2 for one partition. Never touches the repository.
    async fn run_partition(self, index: usize, messages: Vec<OutgoingMessage>, backends: ResolvedBackends) -> Vec<Outcome> {
        debug!(partition = index, count = messages.len(), "Partition started");
        let mut outcomes = Vec::new();
        let mut ready: Vec<Prepared> = Vec::with_capacity(messages.len());

        for message in &messages {
            let backend = match backends.get(&message.backend_alias) {
                Some(resolved) => resolved.clone(),
                None => Err(DeliveryFailure::new("UnknownBackend", message.backend_alias.clone())),
            };
            match prepare(message, backend, self.renderer.as_ref(), self.store.as_ref()).await {
                Ok(prepared) => ready.push(prepared),
                Err(failure) => {
                    debug!(email_id = %message.id, error = %failure, "Message failed before delivery");
                    outcomes.push(Outcome::failed(message.id, failure));
                }
            }
        }

        outcomes.extend(lanes::deliver(ready, self.config.threads_per_process).await);
        outcomes
    }

    /// Write statuses and logs in one transaction, then publish events.
    async fn record(&self, outcomes: Vec<Outcome>, log_level: LogLevel) -> Result<BatchReport, Error> {
        let mut sent = Vec::new();
        let mut failed = Vec::new();
        let mut logs = Vec::new();
        for outcome in &outcomes {
            match &outcome.result {
                Ok(()) => {
                    sent.push(outcome.id);
                    if log_level.records(DeliveryOutcome::Sent) {
                        logs.push(DeliveryLogEntry::sent(outcome.id));
                    }
                }
                Err(failure) => {
                    failed.push(outcome.id);
                    if log_level.records(DeliveryOutcome::Failed) {
                        logs.push(DeliveryLogEntry::failed(outcome.id, &failure.kind, &failure.message));
                    }
                }
            }
        }

        self.repo.record_delivery(&sent, &failed, &logs).await?;

        for outcome in outcomes {
            match outcome.result {
                Ok(()) => self.events.publish(GatewayEvent::EmailSent { id: outcome.id }),
                Err(failure) => self.events.publish(GatewayEvent::EmailFailed {
                    id: outcome.id,
                    error: failure.to_string(),
                }),
            }
        }

        let report = BatchReport {
            attempted: sent.len() + failed.len(),
            sent: sent.len(),
            failed: failed.len(),
        };
        info!(sent = report.sent, failed = report.failed, logs = logs.len(), "Batch complete");
        Ok(report)
    }
}

/// Deal items into `n` lists: item `i` goes to list `i % n`.
fn split_round_robin<T>(items: Vec<T>, n: usize) -> Vec<Vec<T>> {
    let n = n.max(1);
    let mut parts: Vec<Vec<T>> = (0..n).map(|_| Vec::new()).collect();
    for (i, item) in items.into_iter().enumerate() {
        parts[i % n].push(item);
    }
    parts.retain(|p| !p.is_empty());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmailTemplate, Priority, Status};
    use crate::storage::MemoryStore;
    use crate::store::LibSqlRepository;
    use crate::transport::LocmemBackend;

    async fn engine(config: GatewayConfig) -> (DispatchEngine, Arc<LibSqlRepository>, LocmemBackend) {
        let repo = Arc::new(LibSqlRepository::new_memory().await.unwrap());
        let locmem = LocmemBackend::new();
        let registry = BackendRegistry::new().with_backend("default", Arc::new(locmem.clone()));
        let engine = DispatchEngine::new(repo.clone(), Arc::new(MemoryStore::new()), registry, config);
        (engine, repo, locmem)
    }

    fn message(priority: Priority) -> OutgoingMessage {
        OutgoingMessage::new("from@example.com", vec!["to@example.com".into()])
            .with_subject("hello")
            .with_message("body")
            .with_priority(priority)
    }

    #[test]
    fn round_robin_split() {
        let parts = split_round_robin((0..7).collect::<Vec<_>>(), 3);
        assert_eq!(parts, vec![vec![0, 3, 6], vec![1, 4], vec![2, 5]]);
        assert_eq!(split_round_robin(vec![1, 2], 5).len(), 2);
    }

    #[tokio::test]
    async fn empty_queue_is_a_no_op() {
        let (engine, _repo, locmem) = engine(GatewayConfig::default()).await;
        assert_eq!(engine.send_queued(1, None).await.unwrap(), BatchReport::default());
        assert!(locmem.sent().is_empty());
    }

    #[tokio::test]
    async fn partitions_cover_the_whole_batch() {
        let (engine, repo, locmem) = engine(GatewayConfig::default()).await;
        let msgs: Vec<OutgoingMessage> = (0..9).map(|_| message(Priority::Medium)).collect();
        repo.insert_outgoing(&msgs).await.unwrap();

        let report = engine.send_queued(4, None).await.unwrap();
        assert_eq!(report.sent, 9);
        assert_eq!(locmem.sent().len(), 9);
        for m in &msgs {
            assert_eq!(repo.get_outgoing(m.id).await.unwrap().unwrap().status, Some(Status::Sent));
        }
    }

    #[tokio::test]
    async fn render_failure_marks_only_that_message_failed() {
        let (engine, repo, _locmem) = engine(GatewayConfig::default()).await;
        let template = EmailTemplate::new("t", "Hi {{ name }}", "");
        repo.insert_template(&template).await.unwrap();
        let bad = message(Priority::Medium).with_template(template);
        let good = message(Priority::Medium);
        repo.insert_outgoing(&[bad.clone(), good.clone()]).await.unwrap();

        let report = engine.send_queued(1, Some(LogLevel::All)).await.unwrap();
        assert_eq!((report.sent, report.failed), (1, 1));
        let logs = repo.logs_for(bad.id).await.unwrap();
        assert_eq!(logs[0].exception_type, "MissingVariable");
        assert_eq!(repo.logs_for(good.id).await.unwrap()[0].status, DeliveryOutcome::Sent);
    }

    #[tokio::test]
    async fn run_until_empty_drains_multiple_batches() {
        let config = GatewayConfig {
            batch_size: 2,
            ..GatewayConfig::default()
        };
        let (engine, repo, locmem) = engine(config).await;
        let msgs: Vec<OutgoingMessage> = (0..5).map(|_| message(Priority::Low)).collect();
        repo.insert_outgoing(&msgs).await.unwrap();

        let report = engine.run_until_empty(2, None).await.unwrap();
        assert_eq!(report.sent, 5);
        assert_eq!(locmem.sent().len(), 5);
    }

    #[tokio::test]
    async fn events_follow_outcomes() {
        let (engine, repo, _locmem) = engine(GatewayConfig::default()).await;
        let mut rx = engine.events().subscribe();
        let msg = message(Priority::High);
        repo.insert_outgoing(std::slice::from_ref(&msg)).await.unwrap();

        engine.send_queued(1, None).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), GatewayEvent::EmailSent { id: msg.id });
    }

    #[tokio::test]
    async fn unresolvable_default_backend_fails_each_message() {
        let repo = Arc::new(LibSqlRepository::new_memory().await.unwrap());
        let engine = DispatchEngine::new(
            repo.clone(),
            Arc::new(MemoryStore::new()),
            BackendRegistry::new(),
            GatewayConfig::default(),
        );
        let msg = message(Priority::Medium);
        repo.insert_outgoing(std::slice::from_ref(&msg)).await.unwrap();

        let report = engine.send_queued(1, None).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(repo.logs_for(msg.id).await.unwrap()[0].exception_type, "ActiveOutbox");
    }
}
