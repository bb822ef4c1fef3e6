//! Aggregates: consistency boundaries whose state is the fold of their
//! ordered event history.
//!
//! Domain types embed an [`AggregateCore`] for the bookkeeping (identity,
//! version, uncommitted changes) and implement [`Aggregate`] by exposing the
//! core plus their event-folding logic in [`Aggregate::apply`].

use std::fmt;

use uuid::Uuid;

use crate::errors::HistoryError;
use crate::event::{Event, Payload};
use crate::types::{AggregateName, AggregateVersion, EventName};

/// A (name, id) reference to an aggregate instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateRef {
    /// The aggregate kind.
    pub name: AggregateName,
    /// The aggregate instance.
    pub id: Uuid,
}

impl fmt::Display for AggregateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Identity, version, and change tracking for an aggregate.
///
/// The version is the version of the last applied event, 0 before any
/// history has been applied. Recorded changes carry strictly sequential
/// versions starting at `version + 1`.
#[derive(Debug, Clone)]
pub struct AggregateCore {
    name: AggregateName,
    id: Uuid,
    version: AggregateVersion,
    changes: Vec<Event>,
}

impl AggregateCore {
    /// Creates the core of a fresh aggregate at version 0.
    pub fn new(name: AggregateName, id: Uuid) -> Self {
        Self {
            name,
            id,
            version: 0,
            changes: Vec::new(),
        }
    }

    /// The aggregate kind.
    pub fn name(&self) -> &AggregateName {
        &self.name
    }

    /// The aggregate instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The version of the last applied event.
    pub fn version(&self) -> AggregateVersion {
        self.version
    }

    /// The uncommitted changes, oldest first.
    pub fn changes(&self) -> &[Event] {
        &self.changes
    }

    /// Records an uncommitted change.
    pub fn record_change(&mut self, event: Event) {
        self.changes.push(event);
    }

    /// Drops all uncommitted changes and advances the version past them.
    ///
    /// Called after the changes have been persisted.
    pub fn flush_changes(&mut self) {
        if let Some(last) = self.changes.last() {
            if let Some(agg) = last.aggregate() {
                self.version = agg.version;
            }
        }
        self.changes.clear();
    }

    /// Forces the version, used while replaying history.
    pub fn set_version(&mut self, version: AggregateVersion) {
        self.version = version;
    }
}

/// A consistency boundary identified by (name, id).
///
/// Implementors store an [`AggregateCore`] and fold events into their state
/// in [`apply`](Aggregate::apply). `apply` must be total: unknown event
/// kinds are ignored, not rejected.
pub trait Aggregate: Send {
    /// The embedded bookkeeping core.
    fn core(&self) -> &AggregateCore;

    /// Mutable access to the embedded core.
    fn core_mut(&mut self) -> &mut AggregateCore;

    /// Folds one event into the aggregate's state.
    fn apply(&mut self, event: &Event);

    /// The aggregate kind.
    fn aggregate_name(&self) -> &AggregateName {
        self.core().name()
    }

    /// The aggregate instance.
    fn aggregate_id(&self) -> Uuid {
        self.core().id()
    }

    /// The version of the last applied event, 0 for a fresh aggregate.
    fn aggregate_version(&self) -> AggregateVersion {
        self.core().version()
    }

    /// The (name, id) reference.
    fn aggregate_ref(&self) -> AggregateRef {
        AggregateRef {
            name: self.aggregate_name().clone(),
            id: self.aggregate_id(),
        }
    }

    /// The uncommitted changes, oldest first.
    fn changes(&self) -> &[Event] {
        self.core().changes()
    }

    /// Records an uncommitted change.
    fn record_change(&mut self, event: Event) {
        self.core_mut().record_change(event);
    }

    /// Drops all uncommitted changes, advancing the version past them.
    fn flush_changes(&mut self) {
        self.core_mut().flush_changes();
    }
}

/// Replays stored history onto an aggregate.
///
/// Events are applied in order; after each one, the aggregate's version
/// advances to the event's version. Events that belong to another aggregate
/// or skip a version are rejected before being applied.
pub fn apply_history<A>(
    aggregate: &mut A,
    events: impl IntoIterator<Item = Event>,
) -> Result<(), HistoryError>
where
    A: Aggregate + ?Sized,
{
    for event in events {
        let agg = event
            .aggregate()
            .ok_or(HistoryError::MissingAggregate(event.id()))?;
        if agg.name != *aggregate.aggregate_name() || agg.id != aggregate.aggregate_id() {
            return Err(HistoryError::ForeignEvent {
                aggregate_name: aggregate.aggregate_name().clone(),
                aggregate_id: aggregate.aggregate_id(),
                event_id: event.id(),
            });
        }
        let expected = aggregate.aggregate_version() + 1;
        if agg.version != expected {
            return Err(HistoryError::VersionGap {
                event_id: event.id(),
                expected,
                got: agg.version,
            });
        }
        let version = agg.version;
        aggregate.apply(&event);
        aggregate.core_mut().set_version(version);
    }
    Ok(())
}

/// Creates, applies, and records the aggregate's next event.
///
/// The event's version is `version + changes + 1`, keeping uncommitted
/// changes strictly sequential. Returns a copy of the recorded event.
pub fn next_event<A>(aggregate: &mut A, name: EventName, payload: Payload) -> Event
where
    A: Aggregate + ?Sized,
{
    let version = aggregate.aggregate_version() + aggregate.changes().len() as AggregateVersion + 1;
    let event = Event::new(name, payload).with_aggregate(
        aggregate.aggregate_name().clone(),
        aggregate.aggregate_id(),
        version,
    );
    aggregate.apply(&event);
    aggregate.record_change(event.clone());
    event
}
