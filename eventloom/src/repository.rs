//! The aggregate repository: maps between aggregate instances and the event
//! log behind an [`EventStore`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::aggregate::{apply_history, Aggregate, AggregateRef};
use crate::errors::{RepositoryError, RepositoryResult};
use crate::event::Event;
use crate::query::{Query, SortDirection, SortField};
use crate::store::EventStore;
use crate::streams::{self, CHANNEL_CAPACITY};
use crate::types::{AggregateName, AggregateVersion};

/// A declarative filter over aggregates, translated to an event [`Query`]
/// when executed.
#[derive(Debug, Clone, Default)]
pub struct AggregateQuery {
    names: Vec<AggregateName>,
    ids: Vec<Uuid>,
}

impl AggregateQuery {
    /// An unconstrained query matching every aggregate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the query to aggregates of the given kind.
    #[must_use]
    pub fn with_name(mut self, name: AggregateName) -> Self {
        self.names.push(name);
        self
    }

    /// Restricts the query to the given aggregate instance.
    #[must_use]
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.ids.push(id);
        self
    }

    /// The aggregate kinds the query is restricted to, when non-empty.
    pub fn names(&self) -> &[AggregateName] {
        &self.names
    }

    /// The aggregate instances the query is restricted to, when non-empty.
    pub fn ids(&self) -> &[Uuid] {
        &self.ids
    }

    /// The event query that reconstructs the matching aggregates: their
    /// events, grouped and ordered by (name, id, version) ascending.
    pub fn to_event_query(&self) -> Query {
        Query::builder()
            .aggregate_names(self.names.iter().cloned())
            .aggregate_ids(self.ids.iter().copied())
            .sort_by(SortField::AggregateName, SortDirection::Asc)
            .sort_by(SortField::AggregateId, SortDirection::Asc)
            .sort_by(SortField::AggregateVersion, SortDirection::Asc)
            .build()
    }
}

/// How often and how many times [`Repository::update`] retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Delay between attempts.
    pub interval: Duration,
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
}

impl RetryConfig {
    /// Retries every `interval`, making at most `max_attempts` attempts.
    pub const fn every(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::every(Duration::from_millis(100), 3)
    }
}

/// Which errors [`Repository::update`] recovers from.
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// Only retry optimistic-concurrency losses.
    VersionConflictsOnly,
    /// Custom predicate over the failed attempt's error.
    Custom(fn(&RepositoryError) -> bool),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::VersionConflictsOnly
    }
}

impl RetryPolicy {
    /// Whether an error should trigger another attempt.
    pub fn should_retry(&self, error: &RepositoryError) -> bool {
        match self {
            Self::VersionConflictsOnly => error.is_version_conflict(),
            Self::Custom(predicate) => predicate(error),
        }
    }
}

/// Fetches and saves aggregates through an [`EventStore`].
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn EventStore>,
}

impl Repository {
    /// Creates a repository over the given store.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Persists the aggregate's uncommitted changes.
    ///
    /// On success the changes are flushed and the aggregate's version
    /// advances past them. A `VersionConflict` from the store propagates
    /// unchanged, so callers can classify it for retries.
    pub async fn save<A>(&self, aggregate: &mut A) -> RepositoryResult<()>
    where
        A: Aggregate,
    {
        let changes = aggregate.changes().to_vec();
        if changes.is_empty() {
            return Ok(());
        }
        self.store.insert(changes).await?;
        aggregate.flush_changes();
        Ok(())
    }

    /// Brings the aggregate up to date with its stored history.
    ///
    /// Queries the events after the aggregate's current version, ascending
    /// by version, and applies them in order.
    pub async fn fetch<A>(&self, aggregate: &mut A) -> RepositoryResult<()>
    where
        A: Aggregate,
    {
        let events = self.history(aggregate, None).await?;
        apply_history(aggregate, events)?;
        Ok(())
    }

    /// Brings the aggregate to exactly the given version.
    ///
    /// Fails with `VersionNotFound` if the stored history does not reach
    /// `version`.
    pub async fn fetch_version<A>(
        &self,
        aggregate: &mut A,
        version: AggregateVersion,
    ) -> RepositoryResult<()>
    where
        A: Aggregate,
    {
        let events = self.history(aggregate, Some(version)).await?;
        apply_history(aggregate, events)?;
        if aggregate.aggregate_version() != version {
            return Err(RepositoryError::VersionNotFound {
                requested: version,
                actual: aggregate.aggregate_version(),
            });
        }
        Ok(())
    }

    /// Deletes every stored event of the aggregate.
    pub async fn delete<A>(&self, aggregate: &A) -> RepositoryResult<()>
    where
        A: Aggregate,
    {
        let query = Query::builder()
            .aggregate(
                aggregate.aggregate_name().clone(),
                aggregate.aggregate_id(),
            )
            .build();
        let (events, errors) = self.store.query(query).await?;
        let events = streams::drain(events, errors).await?;
        for event in events {
            self.store.delete(&event).await?;
        }
        Ok(())
    }

    /// Streams fully reconstructed aggregates matching the query.
    ///
    /// The event stream is grouped by (name, id) and sorted ascending by
    /// version; `factory` builds the empty instance for each reference and
    /// may return `None` to skip aggregates it does not know how to build.
    pub async fn query<A, F>(
        &self,
        query: &AggregateQuery,
        factory: F,
    ) -> RepositoryResult<(mpsc::Receiver<A>, mpsc::Receiver<RepositoryError>)>
    where
        A: Aggregate + 'static,
        F: Fn(&AggregateRef) -> Option<A> + Send + Sync + 'static,
    {
        let (mut events, mut store_errors) = self.store.query(query.to_event_query()).await?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut group: Option<(AggregateRef, Vec<Event>)> = None;
            let mut errors_open = true;
            loop {
                let event = if errors_open {
                    tokio::select! {
                        maybe_event = events.recv() => maybe_event,
                        maybe_error = store_errors.recv() => {
                            match maybe_error {
                                Some(err) => {
                                    let _ = err_tx.send(RepositoryError::Store(err)).await;
                                }
                                None => errors_open = false,
                            }
                            continue;
                        }
                    }
                } else {
                    events.recv().await
                };

                let Some(event) = event else {
                    if let Some((reference, history)) = group.take() {
                        emit_aggregate(&tx, &err_tx, &factory, reference, history).await;
                    }
                    return;
                };

                // Events without an aggregate cannot be grouped.
                let Some(reference) = event.aggregate_ref() else {
                    continue;
                };

                match &mut group {
                    Some((current, history)) if *current == reference => history.push(event),
                    _ => {
                        if let Some((finished, history)) = group.take() {
                            if !emit_aggregate(&tx, &err_tx, &factory, finished, history).await {
                                return;
                            }
                        }
                        group = Some((reference, vec![event]));
                    }
                }
            }
        });

        Ok((rx, err_rx))
    }

    /// Runs `modify` on the up-to-date aggregate and saves the result,
    /// retrying optimistic-concurrency losses.
    ///
    /// Each attempt starts from a fresh instance built by `factory`, fetches
    /// the latest history onto it, runs `modify`, and saves. A losing
    /// attempt's instance is discarded along with its uncommitted changes,
    /// so a retry can never re-submit stale events or fold `modify`'s
    /// effects twice. Retryable failures (per `policy`) wait
    /// `config.interval` between attempts, up to `config.max_attempts`
    /// attempts; the final attempt's error is returned unchanged. On success
    /// the saved aggregate is returned.
    pub async fn update<A, F, M>(
        &self,
        factory: F,
        config: RetryConfig,
        policy: RetryPolicy,
        mut modify: M,
    ) -> RepositoryResult<A>
    where
        A: Aggregate,
        F: Fn() -> A,
        M: FnMut(&mut A) -> RepositoryResult<()>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut aggregate = factory();
            let result = self.attempt(&mut aggregate, &mut modify).await;
            match result {
                Ok(()) => return Ok(aggregate),
                Err(err) if policy.should_retry(&err) && attempt < config.max_attempts => {
                    debug!(
                        attempt,
                        max_attempts = config.max_attempts,
                        error = %err,
                        "retrying aggregate update"
                    );
                    tokio::time::sleep(config.interval).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt<A, F>(&self, aggregate: &mut A, modify: &mut F) -> RepositoryResult<()>
    where
        A: Aggregate,
        F: FnMut(&mut A) -> RepositoryResult<()>,
    {
        self.fetch(aggregate).await?;
        modify(aggregate)?;
        self.save(aggregate).await
    }

    async fn history<A>(
        &self,
        aggregate: &A,
        up_to: Option<AggregateVersion>,
    ) -> RepositoryResult<Vec<Event>>
    where
        A: Aggregate,
    {
        let mut builder = Query::builder()
            .aggregate(
                aggregate.aggregate_name().clone(),
                aggregate.aggregate_id(),
            )
            .version_min(aggregate.aggregate_version() + 1)
            .sort_by(SortField::AggregateVersion, SortDirection::Asc);
        if let Some(max) = up_to {
            builder = builder.version_max(max);
        }

        let (events, errors) = self.store.query(builder.build()).await?;
        Ok(streams::drain(events, errors).await?)
    }
}

async fn emit_aggregate<A, F>(
    tx: &mpsc::Sender<A>,
    err_tx: &mpsc::Sender<RepositoryError>,
    factory: &F,
    reference: AggregateRef,
    history: Vec<Event>,
) -> bool
where
    A: Aggregate,
    F: Fn(&AggregateRef) -> Option<A>,
{
    let Some(mut aggregate) = factory(&reference) else {
        return true;
    };
    match apply_history(&mut aggregate, history) {
        Ok(()) => tx.send(aggregate).await.is_ok(),
        Err(err) => {
            let _ = err_tx.send(err.into()).await;
            true
        }
    }
}
