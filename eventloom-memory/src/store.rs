//! Thread-safe in-memory event store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use eventloom::errors::{EventStoreError, EventStoreResult};
use eventloom::query::sort_events;
use eventloom::store::{batch_aggregate, validate_versions, EventStore, EventStream};
use eventloom::streams::CHANNEL_CAPACITY;
use eventloom::{AggregateName, AggregateVersion, Event, EventId, Query};

#[derive(Default)]
struct Inner {
    // Insertion order; queries without sortings iterate in this order.
    events: Vec<Event>,
    ids: HashSet<EventId>,
    versions: HashMap<(AggregateName, Uuid), AggregateVersion>,
}

/// An in-memory [`EventStore`].
///
/// Clones share the same storage. Writes are serialized, so concurrent
/// inserts for the same aggregate race on the version check exactly like
/// they would against a transactional backend.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored version of the given aggregate, 0 when it has none.
    pub fn current_version(&self, name: &AggregateName, id: Uuid) -> AggregateVersion {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .versions
            .get(&(name.clone(), id))
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn insert(&self, events: Vec<Event>) -> EventStoreResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write().expect("store lock poisoned");

        // Version consistency is checked first, like a transactional backend
        // validating against the state record before touching the log.
        let advanced = match batch_aggregate(&events)? {
            Some((name, id)) => {
                let current = inner
                    .versions
                    .get(&(name.clone(), id))
                    .copied()
                    .unwrap_or_default();
                let advanced = validate_versions(&events, &name, id, current)?;
                Some(((name, id), advanced))
            }
            None => None,
        };

        let mut batch_ids = HashSet::new();
        for event in &events {
            if inner.ids.contains(&event.id()) || !batch_ids.insert(event.id()) {
                return Err(EventStoreError::DuplicateEvent(event.id()));
            }
        }

        if let Some((key, version)) = advanced {
            inner.versions.insert(key, version);
        }

        for event in events {
            inner.ids.insert(event.id());
            inner.events.push(event);
        }
        Ok(())
    }

    async fn find(&self, id: EventId) -> EventStoreResult<Event> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .events
            .iter()
            .find(|event| event.id() == id)
            .cloned()
            .ok_or(EventStoreError::NotFound(id))
    }

    async fn delete(&self, event: &Event) -> EventStoreResult<()> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let id = event.id();
        inner.ids.remove(&id);
        inner.events.retain(|stored| stored.id() != id);
        Ok(())
    }

    async fn query(&self, query: Query) -> EventStoreResult<EventStream> {
        let mut matching: Vec<Event> = {
            let inner = self.inner.read().expect("store lock poisoned");
            inner
                .events
                .iter()
                .filter(|event| query.matches(event))
                .cloned()
                .collect()
        };
        sort_events(&mut matching, query.sortings());

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (_err_tx, err_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            for event in matching {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok((rx, err_rx))
    }
}
