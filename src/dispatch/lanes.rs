//! Phase 2: concurrent delivery lanes.
//!
//! Lanes are blocking tasks draining one shared queue. A lane opens a
//! connection per backend alias on first use and keeps it to itself;
//! connections are closed when the lane runs dry.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tracing::{debug, error};
use uuid::Uuid;

use super::prepare::Prepared;
use super::{DeliveryFailure, Outcome};
use crate::error::{Error, SendError};
use crate::transport::Connection;

/// Deliver `prepared` over at most `threads` lanes. Every input yields
/// exactly one outcome, including items a crashed lane never reported.
pub(crate) async fn deliver(prepared: Vec<Prepared>, threads: usize) -> Vec<Outcome> {
    if prepared.is_empty() {
        return Vec::new();
    }
    let lanes = threads.clamp(1, prepared.len());
    let ids: Vec<Uuid> = prepared.iter().map(|p| p.email.id).collect();
    let queue = Arc::new(Mutex::new(VecDeque::from(prepared)));

    let handles = (0..lanes).map(|lane| {
        let queue = Arc::clone(&queue);
        tokio::task::spawn_blocking(move || run_lane(lane, &queue))
    });

    let mut outcomes = Vec::with_capacity(ids.len());
    for result in join_all(handles).await {
        match result {
            Ok(lane_outcomes) => outcomes.extend(lane_outcomes),
            Err(e) => error!("Delivery lane panicked: {e}"),
        }
    }

    let reported: HashSet<Uuid> = outcomes.iter().map(|o| o.id).collect();
    for id in ids {
        if !reported.contains(&id) {
            outcomes.push(Outcome::failed(
                id,
                DeliveryFailure::new("TransportError", "delivery lane aborted before reporting"),
            ));
        }
    }
    outcomes
}

fn run_lane(lane: usize, queue: &Mutex<VecDeque<Prepared>>) -> Vec<Outcome> {
    debug!(lane, "Delivery lane started");
    let mut connections: HashMap<String, Box<dyn Connection>> = HashMap::new();
    let mut outcomes = Vec::new();

    loop {
        let next = match queue.lock() {
            Ok(mut q) => q.pop_front(),
            Err(_) => break,
        };
        let Some(item) = next else { break };

        let outcome = match send_one(&mut connections, &item) {
            Ok(()) => Outcome::sent(item.email.id),
            Err(e) => {
                let failure = DeliveryFailure::from(Error::from(e));
                debug!(lane, email_id = %item.email.id, error = %failure, "Delivery failed");
                Outcome::failed(item.email.id, failure)
            }
        };
        outcomes.push(outcome);
    }

    for (_, mut connection) in connections {
        connection.close();
    }
    debug!(lane, delivered = outcomes.len(), "Delivery lane finished");
    outcomes
}

fn send_one(connections: &mut HashMap<String, Box<dyn Connection>>, item: &Prepared) -> Result<(), SendError> {
    let connection = match connections.entry(item.email.backend_alias.clone()) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => entry.insert(item.backend.open()?),
    };
    connection.send(&item.email)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::transport::message::EmailParts;
    use crate::transport::{Backend, LocmemBackend, PreparedEmail};

    fn prepared(backend: Arc<dyn Backend>, alias: &str) -> Prepared {
        let email = PreparedEmail::build(EmailParts {
            id: Uuid::new_v4(),
            backend_alias: alias.into(),
            from: "a@example.com".into(),
            to: vec!["b@example.com".into()],
            ..EmailParts::default()
        })
        .unwrap();
        Prepared { email, backend }
    }

    /// Counts opened connections; every send fails.
    struct Refusing {
        opened: AtomicUsize,
    }

    struct RefusingConnection;

    impl Connection for RefusingConnection {
        fn send(&mut self, _email: &PreparedEmail) -> Result<(), SendError> {
            Err(SendError::Rejected("550 no".into()))
        }
    }

    impl Backend for Refusing {
        fn name(&self) -> &str {
            "refusing"
        }

        fn open(&self) -> Result<Box<dyn Connection>, SendError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(RefusingConnection))
        }
    }

    #[tokio::test]
    async fn every_item_gets_one_outcome() {
        let locmem = LocmemBackend::new();
        let backend: Arc<dyn Backend> = Arc::new(locmem.clone());
        let items: Vec<Prepared> = (0..7).map(|_| prepared(Arc::clone(&backend), "")).collect();

        let outcomes = deliver(items, 3).await;
        assert_eq!(outcomes.len(), 7);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert_eq!(locmem.sent().len(), 7);
    }

    #[tokio::test]
    async fn lanes_never_exceed_item_count() {
        let refusing = Arc::new(Refusing {
            opened: AtomicUsize::new(0),
        });
        let backend: Arc<dyn Backend> = refusing.clone();
        let items = vec![prepared(Arc::clone(&backend), "x"), prepared(backend, "x")];

        let outcomes = deliver(items, 10).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.result.as_ref().is_err_and(|f| f.kind == "Rejected")));
        assert!(refusing.opened.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn one_connection_per_lane_and_alias() {
        let refusing = Arc::new(Refusing {
            opened: AtomicUsize::new(0),
        });
        let backend: Arc<dyn Backend> = refusing.clone();
        let items: Vec<Prepared> = (0..5).map(|_| prepared(Arc::clone(&backend), "x")).collect();

        deliver(items, 1).await;
        assert_eq!(refusing.opened.load(Ordering::SeqCst), 1);
    }
}
