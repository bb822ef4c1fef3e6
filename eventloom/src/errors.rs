//! Error types for every subsystem.
//!
//! One enum per subsystem, with conversions along the propagation paths:
//! store errors flow into repository, projection, and schedule errors; codec
//! errors flow into store and bus errors. `VersionConflict` is the
//! distinguished kind the repository's retry helper classifies on.

use thiserror::Error;
use uuid::Uuid;

use crate::types::{AggregateName, AggregateVersion, EventId, EventName};

/// Errors raised by an event store.
#[derive(Debug, Clone, Error)]
pub enum EventStoreError {
    /// An insert lost the optimistic-concurrency race: the batch does not
    /// continue the aggregate's history at `current_version + 1`.
    #[error(
        "version conflict on {aggregate_name}({aggregate_id}): current version is \
         {current_version}, event {event_id} carries version {event_version}"
    )]
    VersionConflict {
        /// The aggregate kind.
        aggregate_name: AggregateName,
        /// The aggregate instance.
        aggregate_id: Uuid,
        /// The version stored for the aggregate when the insert was attempted.
        current_version: AggregateVersion,
        /// The id of the offending event.
        event_id: EventId,
        /// The version the offending event carried.
        event_version: AggregateVersion,
    },

    /// An insert batch mixed events of different aggregates, or mixed
    /// attributed and unattributed events.
    #[error("insert batch mixes events of different aggregates")]
    MixedAggregates,

    /// An event id that already exists in the store was inserted again.
    #[error("duplicate event id {0}")]
    DuplicateEvent(EventId),

    /// No event with the given id exists.
    #[error("event {0} not found")]
    NotFound(EventId),

    /// Encoding or decoding an event payload failed.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    /// The backend reported a transport or storage failure.
    #[error("backend: {0}")]
    Backend(String),
}

/// Errors raised by an event bus.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// Encoding or decoding a wire envelope failed.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    /// The transport reported a failure.
    #[error("transport: {0}")]
    Transport(String),
}

/// Errors raised by the payload codec registry.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// No payload type is registered under the given name.
    #[error("no payload registered for {0:?}")]
    UnregisteredName(String),

    /// The payload value is not of the type registered under its name.
    #[error("payload for {name:?} is not the registered type")]
    WrongPayloadType {
        /// The event name the payload was presented under.
        name: String,
    },

    /// Serializing a payload failed.
    #[error("encode {name:?} payload: {reason}")]
    Encode {
        /// The event name being encoded.
        name: String,
        /// The serializer's failure message.
        reason: String,
    },

    /// Deserializing a payload failed.
    #[error("decode {name:?} payload: {reason}")]
    Decode {
        /// The event name being decoded.
        name: String,
        /// The deserializer's failure message.
        reason: String,
    },
}

/// Errors raised when replaying history onto an aggregate.
#[derive(Debug, Clone, Error)]
pub enum HistoryError {
    /// The event belongs to a different aggregate.
    #[error("event {event_id} does not belong to aggregate {aggregate_name}({aggregate_id})")]
    ForeignEvent {
        /// The aggregate the history was applied to.
        aggregate_name: AggregateName,
        /// Its id.
        aggregate_id: Uuid,
        /// The offending event.
        event_id: EventId,
    },

    /// The event carries no aggregate attribution.
    #[error("event {0} carries no aggregate and cannot be part of a history")]
    MissingAggregate(EventId),

    /// The event does not continue the history at the next version.
    #[error("event {event_id} carries version {got}, expected {expected}")]
    VersionGap {
        /// The offending event.
        event_id: EventId,
        /// The version the aggregate expected next.
        expected: AggregateVersion,
        /// The version the event carried.
        got: AggregateVersion,
    },
}

/// Errors raised by the aggregate repository.
#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// Replaying fetched events onto the aggregate failed.
    #[error("apply history: {0}")]
    History(#[from] HistoryError),

    /// The requested version exceeds the aggregate's stored history.
    #[error("version {requested} not found, aggregate is at version {actual}")]
    VersionNotFound {
        /// The version that was asked for.
        requested: AggregateVersion,
        /// The version reached after applying everything available.
        actual: AggregateVersion,
    },
}

impl RepositoryError {
    /// Whether the error is an optimistic-concurrency loss.
    pub fn is_version_conflict(&self) -> bool {
        matches!(
            self,
            Self::Store(EventStoreError::VersionConflict { .. })
        )
    }
}

/// Errors raised by projection jobs.
#[derive(Debug, Clone, Error)]
pub enum ProjectionError {
    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// None of the job's events belong to an aggregate with the given name.
    #[error("no {0} aggregate found in events")]
    AggregateNotFound(AggregateName),

    /// A before-each interceptor failed for an event. The triggering event
    /// is still delivered.
    #[error("before {event} event: {reason}")]
    BeforeEvent {
        /// The name of the intercepted event.
        event: EventName,
        /// The interceptor's failure message.
        reason: String,
    },
}

/// Errors raised by schedules and the subscribe pipeline.
#[derive(Debug, Clone, Error)]
pub enum ScheduleError {
    /// Querying the store for bootstrap events failed.
    #[error("query bootstrap events: {0}")]
    Store(#[from] EventStoreError),

    /// The bus subscription failed or reported an async error.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Result alias for store operations.
pub type EventStoreResult<T> = Result<T, EventStoreError>;
/// Result alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;
/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
/// Result alias for repository operations.
pub type RepositoryResult<T> = Result<T, RepositoryError>;
/// Result alias for projection operations.
pub type ProjectionResult<T> = Result<T, ProjectionError>;
/// Result alias for schedule operations.
pub type ScheduleResult<T> = Result<T, ScheduleError>;
