//! Projection jobs: per-run work units bundling a query, in-memory filters,
//! before-each interceptors, and a de-duplicating query cache.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::aggregate::AggregateRef;
use crate::errors::{EventStoreError, EventStoreResult, ProjectionError, ProjectionResult};
use crate::event::Event;
use crate::projection::{apply_next, Projection};
use crate::query::Query;
use crate::store::EventStore;
use crate::streams::{self, CHANNEL_CAPACITY};
use crate::types::AggregateName;

/// A before-each interceptor: called per event, its returned events are
/// inserted into the stream immediately before the triggering event.
pub type BeforeEventFn = Arc<
    dyn Fn(&Event) -> Result<Vec<Event>, Box<dyn std::error::Error + Send + Sync>> + Send + Sync,
>;

/// A per-run projection work unit.
///
/// Jobs are typically created by the subscribe pipeline and handed to
/// consumers, which ask the job for events and apply them to their targets.
/// All event queries go through the job's private query cache, so a job that
/// is applied to many targets hits the store once per distinct query.
pub struct Job {
    query: Query,
    aggregate_query: Option<Query>,
    filters: Vec<Query>,
    before_event: Vec<BeforeEventFn>,
    reset: bool,
    cache: QueryCache,
}

impl Job {
    /// Creates a job over the given store and base query.
    pub fn new(store: Arc<dyn EventStore>, query: Query) -> Self {
        Self::builder(store, query).build()
    }

    /// Starts building a job with filters, interceptors, or a reset.
    pub fn builder(store: Arc<dyn EventStore>, query: Query) -> JobBuilder {
        JobBuilder {
            store,
            query,
            aggregate_query: None,
            filters: Vec::new(),
            before_event: Vec::new(),
            reset: false,
        }
    }

    /// Streams the job's events. The given filters are applied in memory on
    /// top of the job's own filters.
    pub async fn events(
        &self,
        filters: Vec<Query>,
    ) -> ProjectionResult<(mpsc::Receiver<Event>, mpsc::Receiver<ProjectionError>)> {
        self.query_events(self.query.clone(), filters).await
    }

    /// Streams the job's events that belong to one of the given aggregate
    /// kinds. Without names this is the same as [`Job::events`].
    pub async fn events_of(
        &self,
        names: Vec<AggregateName>,
    ) -> ProjectionResult<(mpsc::Receiver<Event>, mpsc::Receiver<ProjectionError>)> {
        if names.is_empty() {
            return self.events(Vec::new()).await;
        }
        let filter = Query::builder().aggregate_names(names).build();
        self.events(vec![filter]).await
    }

    /// Streams the events that [`Job::apply`] would apply to the target.
    ///
    /// For a progress-aware target the base query is narrowed to events from
    /// one nanosecond before the recorded progress onward. The extra
    /// nanosecond deliberately over-fetches: several events can share a
    /// timestamp, and the apply path skips anything at or before the
    /// progress instant.
    pub async fn events_for<P>(
        &self,
        target: &P,
    ) -> ProjectionResult<(mpsc::Receiver<Event>, mpsc::Receiver<ProjectionError>)>
    where
        P: Projection + ?Sized,
    {
        let mut query = self.query.clone();
        if let Some(progress) = target.progress() {
            query = query.merge(
                Query::builder()
                    .time_min(progress.minus_nanos(1))
                    .build(),
            );
        }
        self.query_events(query, Vec::new()).await
    }

    /// Streams the deduplicated aggregate references extracted from the
    /// job's events, optionally restricted to the given aggregate kinds.
    ///
    /// Uses the job's aggregate query when one was configured, the base
    /// query otherwise. Events without an aggregate are skipped.
    pub async fn aggregates(
        &self,
        names: Vec<AggregateName>,
    ) -> ProjectionResult<(mpsc::Receiver<AggregateRef>, mpsc::Receiver<ProjectionError>)> {
        let (mut events, errors) = match &self.aggregate_query {
            Some(aggregate_query) => {
                let filters = if names.is_empty() {
                    Vec::new()
                } else {
                    vec![Query::builder().aggregate_names(names).build()]
                };
                self.query_events(aggregate_query.clone(), filters).await?
            }
            None => self.events_of(names).await?,
        };

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut seen: HashSet<AggregateRef> = HashSet::new();
            while let Some(event) = events.recv().await {
                let Some(reference) = event.aggregate_ref() else {
                    continue;
                };
                if seen.insert(reference.clone()) && tx.send(reference).await.is_err() {
                    return;
                }
            }
        });

        Ok((rx, errors))
    }

    /// The id of the first aggregate of the given kind found in the job's
    /// events.
    pub async fn aggregate(&self, name: &AggregateName) -> ProjectionResult<Uuid> {
        let (references, errors) = self.aggregates(vec![name.clone()]).await?;

        let mut found = None;
        streams::walk(references, errors, |reference| {
            if reference.name == *name {
                found = Some(reference.id);
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await?;

        found.ok_or_else(|| ProjectionError::AggregateNotFound(name.clone()))
    }

    /// Applies the job to the target.
    ///
    /// Drives [`Job::events_for`] into the target, skipping events at or
    /// before its progress and advancing the progress per applied event. If
    /// the job was built with a reset, the target's progress and state are
    /// cleared first. A job may be applied to any number of targets;
    /// application to a single target is strictly serial.
    pub async fn apply<P>(&self, target: &mut P) -> ProjectionResult<()>
    where
        P: Projection + ?Sized,
    {
        if self.reset {
            target.set_progress(None);
            target.reset();
        }

        let (mut events, mut errors) = self.events_for(target).await?;
        let mut errors_open = true;
        loop {
            if errors_open {
                tokio::select! {
                    maybe_event = events.recv() => match maybe_event {
                        Some(event) => {
                            apply_next(target, &event);
                        }
                        None => return Ok(()),
                    },
                    maybe_error = errors.recv() => match maybe_error {
                        Some(err) => return Err(err),
                        None => errors_open = false,
                    },
                }
            } else {
                match events.recv().await {
                    Some(event) => {
                        apply_next(target, &event);
                    }
                    None => return Ok(()),
                }
            }
        }
    }

    async fn query_events(
        &self,
        query: Query,
        extra_filters: Vec<Query>,
    ) -> ProjectionResult<(mpsc::Receiver<Event>, mpsc::Receiver<ProjectionError>)> {
        let (mut events, mut store_errors) = self.cache.run(query).await?;

        let (err_tx, err_rx) = mpsc::channel(CHANNEL_CAPACITY);

        // Surface store iteration errors on the job's error channel.
        let store_err_tx = err_tx.clone();
        tokio::spawn(async move {
            while let Some(err) = store_errors.recv().await {
                if store_err_tx.send(ProjectionError::Store(err)).await.is_err() {
                    return;
                }
            }
        });

        // Interceptors chain in registration order: extras inserted by an
        // earlier interceptor pass through the later ones.
        for before in self.before_event.iter().cloned() {
            let intercept_err_tx = err_tx.clone();
            events = streams::before_each(events, move |event: &Event| match before(event) {
                Ok(extras) => extras,
                Err(err) => {
                    let _ = intercept_err_tx.try_send(ProjectionError::BeforeEvent {
                        event: event.name().clone(),
                        reason: err.to_string(),
                    });
                    Vec::new()
                }
            });
        }

        let mut filters = self.filters.clone();
        filters.extend(extra_filters);
        if !filters.is_empty() {
            events = streams::filter(events, move |event| {
                filters.iter().all(|query| query.matches(event))
            });
        }

        Ok((events, err_rx))
    }
}

/// Builds a [`Job`].
#[must_use]
pub struct JobBuilder {
    store: Arc<dyn EventStore>,
    query: Query,
    aggregate_query: Option<Query>,
    filters: Vec<Query>,
    before_event: Vec<BeforeEventFn>,
    reset: bool,
}

impl JobBuilder {
    /// Adds an in-memory filter. Streamed events must match every filter.
    pub fn with_filter(mut self, filter: Query) -> Self {
        self.filters.push(filter);
        self
    }

    /// Uses a dedicated query for [`Job::aggregates`] and [`Job::aggregate`]
    /// instead of the job's base query.
    pub fn with_aggregate_query(mut self, query: Query) -> Self {
        self.aggregate_query = Some(query);
        self
    }

    /// Resets targets before applying events to them.
    pub fn with_reset(mut self) -> Self {
        self.reset = true;
        self
    }

    /// Adds a before-each interceptor.
    pub fn before_event<F>(mut self, intercept: F) -> Self
    where
        F: Fn(&Event) -> Result<Vec<Event>, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.before_event.push(Arc::new(intercept));
        self
    }

    /// Finishes the job.
    pub fn build(self) -> Job {
        Job {
            query: self.query,
            aggregate_query: self.aggregate_query,
            filters: self.filters,
            before_event: self.before_event,
            reset: self.reset,
            cache: QueryCache::new(self.store),
        }
    }
}

/// Caches query results by fingerprint for the lifetime of one job.
///
/// At most one backend execution runs per fingerprint: the first caller
/// builds the entry under a per-fingerprint lock held until the result is
/// committed, and later callers replay the cached events. A build aborted by
/// the consumer going away commits nothing and releases the lock, so the
/// next caller simply retries.
struct QueryCache {
    store: Arc<dyn EventStore>,
    locks: Mutex<HashMap<[u8; 32], Arc<tokio::sync::Mutex<()>>>>,
    cache: Arc<RwLock<HashMap<[u8; 32], Vec<Event>>>>,
}

impl QueryCache {
    fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn run(
        &self,
        query: Query,
    ) -> EventStoreResult<(mpsc::Receiver<Event>, mpsc::Receiver<EventStoreError>)> {
        let hash = query.fingerprint();

        if let Some(events) = self.cached(&hash) {
            return Ok(Self::replay(events));
        }

        // Serialize concurrent builds of the same query; whoever holds the
        // lock either finds the committed result or produces it.
        let build_lock = self.build_lock(hash);
        let guard = build_lock.lock_owned().await;

        if let Some(events) = self.cached(&hash) {
            return Ok(Self::replay(events));
        }

        debug!("query cache miss, querying store");
        let (mut source, errors) = self.store.query(query).await?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            // Build exclusion is held until the entry commits or the build
            // aborts, so concurrent callers wait instead of re-querying.
            let _guard = guard;
            let mut collected = Vec::new();
            while let Some(event) = source.recv().await {
                collected.push(event.clone());
                if tx.send(event).await.is_err() {
                    // Consumer went away mid-stream: abort without
                    // committing a partial result.
                    return;
                }
            }
            cache
                .write()
                .expect("query cache lock poisoned")
                .insert(hash, collected);
        });

        Ok((rx, errors))
    }

    fn cached(&self, hash: &[u8; 32]) -> Option<Vec<Event>> {
        self.cache
            .read()
            .expect("query cache lock poisoned")
            .get(hash)
            .cloned()
    }

    fn build_lock(&self, hash: [u8; 32]) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .expect("query cache locks poisoned")
            .entry(hash)
            .or_default()
            .clone()
    }

    fn replay(events: Vec<Event>) -> (mpsc::Receiver<Event>, mpsc::Receiver<EventStoreError>) {
        let (_err_tx, err_rx) = mpsc::channel(1);
        (streams::replay(events), err_rx)
    }
}
