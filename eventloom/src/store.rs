//! The event store contract.
//!
//! A store persists events, enforces per-aggregate version monotonicity, and
//! answers [`Query`]s with a single-consumer stream. Backends implement the
//! [`EventStore`] trait; the version-consistency rules they all share live
//! here so every backend rejects the same batches.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::{EventStoreError, EventStoreResult};
use crate::event::Event;
use crate::query::Query;
use crate::types::{AggregateName, AggregateVersion, EventId};

/// A streaming query result: the event channel and the terminal error
/// channel. Both close when iteration ends; dropping the receivers cancels
/// iteration.
pub type EventStream = (
    mpsc::Receiver<Event>,
    mpsc::Receiver<EventStoreError>,
);

/// Durable, version-consistent event log with streaming query.
///
/// Implementations must be safe for concurrent use. Writes for a single
/// aggregate are serialized so that concurrent inserts starting from the
/// same current version cannot both succeed.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically persists the given events.
    ///
    /// If any event carries an aggregate, all events in the batch must
    /// belong to that same aggregate and their versions must continue its
    /// history contiguously at `current_version + 1`. Either every event
    /// commits and the aggregate's state record advances, or nothing does.
    async fn insert(&self, events: Vec<Event>) -> EventStoreResult<()>;

    /// Fetches a single event by id.
    async fn find(&self, id: EventId) -> EventStoreResult<Event>;

    /// Removes an event by id. Deleting an absent event succeeds.
    async fn delete(&self, event: &Event) -> EventStoreResult<()>;

    /// Streams the events matching `query`, ordered by its sortings.
    ///
    /// The stream is single-consumer. Iteration errors are delivered on the
    /// second channel, which closes when iteration ends.
    async fn query(&self, query: Query) -> EventStoreResult<EventStream>;
}

/// Determines which aggregate an insert batch belongs to.
///
/// Returns `None` for a batch of unattributed events. A batch that mixes
/// aggregates, or mixes attributed and unattributed events, is rejected.
pub fn batch_aggregate(events: &[Event]) -> EventStoreResult<Option<(AggregateName, Uuid)>> {
    let mut batch: Option<(AggregateName, Uuid)> = None;
    for (position, event) in events.iter().enumerate() {
        match (event.aggregate(), &batch) {
            (None, None) => {}
            (Some(agg), None) if position == 0 => {
                batch = Some((agg.name.clone(), agg.id));
            }
            (Some(agg), Some((name, id))) if agg.name == *name && agg.id == *id => {}
            _ => return Err(EventStoreError::MixedAggregates),
        }
    }
    Ok(batch)
}

/// Checks that a batch continues an aggregate's history contiguously.
///
/// `current_version` is the aggregate's stored version (0 when nothing has
/// been stored). Returns the version the state record advances to on commit.
pub fn validate_versions(
    events: &[Event],
    aggregate_name: &AggregateName,
    aggregate_id: Uuid,
    current_version: AggregateVersion,
) -> EventStoreResult<AggregateVersion> {
    let mut expected = current_version;
    for event in events {
        expected += 1;
        let version = event
            .aggregate()
            .map(|agg| agg.version)
            .unwrap_or_default();
        if version != expected {
            return Err(EventStoreError::VersionConflict {
                aggregate_name: aggregate_name.clone(),
                aggregate_id,
                current_version,
                event_id: event.id(),
                event_version: version,
            });
        }
    }
    Ok(expected)
}
