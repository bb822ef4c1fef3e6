//! # Eventloom
//!
//! The core of an event-sourced domain framework: a version-consistent
//! event log, a name-keyed event bus, an aggregate repository with
//! optimistic-concurrency retries, and a projection engine driven by
//! continuous or periodic schedules.
//!
//! ## Architecture
//!
//! Producers insert events into an [`EventStore`] and publish them on an
//! [`EventBus`]. A [`Schedule`](projection::Schedule) consumes either the
//! bus (continuously) or the store (periodically) and emits projection
//! tickets; consumers build a [`Job`](projection::Job) per run, ask it for
//! events, and apply them to [`Projection`](projection::Projection) targets.
//! The [`Repository`](repository::Repository) reconstructs and persists
//! [`Aggregate`](aggregate::Aggregate)s through the same store.
//!
//! All of these share the [`Query`] value object: a composable predicate
//! plus multi-key sort that backends translate natively and that doubles as
//! an in-memory filter.
//!
//! Storage backends and wire transports are external: they implement
//! [`EventStore`] and [`EventBus`] and plug in. The `eventloom-memory`
//! crate ships in-memory reference implementations of both.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use eventloom::{aggregate, Event, EventName, Payload, Repository};
//! use eventloom_memory::InMemoryEventStore;
//!
//! let store = Arc::new(InMemoryEventStore::new());
//! let repository = Repository::new(store);
//!
//! let mut order = Order::new();
//! aggregate::next_event(
//!     &mut order,
//!     EventName::try_new("order.placed")?,
//!     Payload::new(Placed { total: 42 }),
//! );
//! repository.save(&mut order).await?;
//! ```

#![warn(missing_docs)]

pub mod aggregate;
mod bus;
mod codec;
pub mod errors;
mod event;
pub mod projection;
pub mod query;
pub mod repository;
pub mod store;
pub mod streams;
mod types;

pub use bus::{BusSubscription, EventBus};
pub use codec::EventRegistry;
pub use errors::{
    BusError, CodecError, EventStoreError, HistoryError, ProjectionError, RepositoryError,
    ScheduleError,
};
pub use event::{Event, EventAggregate, Payload};
pub use query::Query;
pub use repository::Repository;
pub use store::{EventStore, EventStream};
pub use types::{AggregateName, AggregateVersion, EventId, EventName, Timestamp};

/// The most commonly used types, importable in one line.
pub mod prelude {
    pub use crate::aggregate::{Aggregate, AggregateCore, AggregateRef};
    pub use crate::bus::EventBus;
    pub use crate::errors::{
        BusError, EventStoreError, ProjectionError, RepositoryError, ScheduleError,
    };
    pub use crate::event::{Event, Payload};
    pub use crate::projection::{Job, Projection, Schedule};
    pub use crate::query::{Query, SortDirection, SortField};
    pub use crate::repository::Repository;
    pub use crate::store::EventStore;
    pub use crate::types::{AggregateName, EventId, EventName, Timestamp};
}
