//! Core identifier and time types.
//!
//! All identifiers follow the "parse, don't validate" principle: smart
//! constructors reject invalid values at the boundary, so a value that exists
//! is guaranteed valid for the rest of the program.

use chrono::{DateTime, Duration, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The name of an event kind, e.g. `"order.placed"`.
///
/// Guaranteed non-empty (after trimming) and at most 255 characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventName(String);

/// The name of an aggregate kind, e.g. `"order"`.
///
/// Guaranteed non-empty (after trimming) and at most 255 characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AggregateName(String);

/// A globally unique event identifier.
///
/// Event ids are UUIDv7, so ids created later compare greater than ids
/// created earlier. The store enforces uniqueness across all events.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new id stamped with the current time.
    ///
    /// ```
    /// use eventloom::EventId;
    ///
    /// let first = EventId::new();
    /// let second = EventId::new();
    /// assert_ne!(first, second);
    /// ```
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() always returns a v7 UUID")
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// The position of an event within its aggregate's history.
///
/// Versions are dense and start at 1; an aggregate state record with
/// version 0 means no events have been stored yet.
pub type AggregateVersion = u64;

/// A UTC wall-clock instant with nanosecond resolution.
///
/// All event times are UTC. Comparisons are exact to the nanosecond, which
/// matters for progress tracking: a projection's progress is the time of the
/// last applied event, and events sharing a timestamp must not be lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// The current instant.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Wraps an existing UTC datetime.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Nanoseconds since the Unix epoch.
    ///
    /// Saturates at the representable range, which covers years 1677-2262.
    pub fn as_nanos(&self) -> i64 {
        self.0
            .timestamp_nanos_opt()
            .unwrap_or(if self.0 > DateTime::<Utc>::UNIX_EPOCH {
                i64::MAX
            } else {
                i64::MIN
            })
    }

    /// This instant moved back by the given number of nanoseconds.
    #[must_use]
    pub fn minus_nanos(&self, nanos: i64) -> Self {
        Self(self.0 - Duration::nanoseconds(nanos))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
