//! The event record and its opaque payload.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::aggregate::AggregateRef;
use crate::types::{AggregateName, AggregateVersion, EventId, EventName, Timestamp};

/// An opaque, shared event payload.
///
/// Payloads are type-erased so that events of any kind flow through the same
/// channels; typed access is recovered by downcasting. Cloning a payload is
/// cheap because the value is shared.
///
/// Wire transports do not serialize payloads directly; they go through the
/// codec registry, which knows the concrete type for each event name.
#[derive(Clone)]
pub struct Payload(Arc<dyn Any + Send + Sync>);

impl Payload {
    /// Wraps a concrete payload value.
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self(Arc::new(value))
    }

    /// Returns a reference to the payload if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// Whether the payload is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Payload(..)")
    }
}

/// The aggregate a persisted event belongs to.
///
/// Either every field is meaningful or the event carries no aggregate at all;
/// the `Option<EventAggregate>` on [`Event`] makes a partial attribution
/// unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventAggregate {
    /// The aggregate kind.
    pub name: AggregateName,
    /// The aggregate instance.
    pub id: Uuid,
    /// The event's position in the aggregate's history, starting at 1.
    pub version: AggregateVersion,
}

impl EventAggregate {
    /// The (name, id) pair without the version.
    pub fn to_ref(&self) -> AggregateRef {
        AggregateRef {
            name: self.name.clone(),
            id: self.id,
        }
    }
}

/// An immutable fact, optionally attributed to an aggregate.
#[derive(Debug, Clone)]
pub struct Event {
    id: EventId,
    name: EventName,
    time: Timestamp,
    payload: Payload,
    aggregate: Option<EventAggregate>,
}

impl Event {
    /// Creates an event with a fresh id, the current time, and no aggregate.
    pub fn new(name: EventName, payload: Payload) -> Self {
        Self {
            id: EventId::new(),
            name,
            time: Timestamp::now(),
            payload,
            aggregate: None,
        }
    }

    /// Reassembles an event from its stored parts.
    ///
    /// Backends and transports use this when materializing events they read
    /// back from storage or the wire.
    pub fn from_parts(
        id: EventId,
        name: EventName,
        time: Timestamp,
        payload: Payload,
        aggregate: Option<EventAggregate>,
    ) -> Self {
        Self {
            id,
            name,
            time,
            payload,
            aggregate,
        }
    }

    /// Attributes the event to an aggregate.
    #[must_use]
    pub fn with_aggregate(
        mut self,
        name: AggregateName,
        id: Uuid,
        version: AggregateVersion,
    ) -> Self {
        self.aggregate = Some(EventAggregate { name, id, version });
        self
    }

    /// Overrides the event time.
    #[must_use]
    pub fn with_time(mut self, time: Timestamp) -> Self {
        self.time = time;
        self
    }

    /// Overrides the event id.
    #[must_use]
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    /// The unique event id.
    pub fn id(&self) -> EventId {
        self.id
    }

    /// The event name.
    pub fn name(&self) -> &EventName {
        &self.name
    }

    /// When the event happened.
    pub fn time(&self) -> Timestamp {
        self.time
    }

    /// The opaque payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Typed payload access.
    pub fn payload_as<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }

    /// The aggregate attribution, if any.
    pub fn aggregate(&self) -> Option<&EventAggregate> {
        self.aggregate.as_ref()
    }

    /// The (name, id) reference of the owning aggregate, if any.
    pub fn aggregate_ref(&self) -> Option<AggregateRef> {
        self.aggregate.as_ref().map(EventAggregate::to_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Opened {
        total: u32,
    }

    fn name(s: &str) -> EventName {
        EventName::try_new(s).unwrap()
    }

    #[test]
    fn payload_downcasting() {
        let payload = Payload::new(Opened { total: 7 });
        assert!(payload.is::<Opened>());
        assert_eq!(payload.downcast_ref::<Opened>(), Some(&Opened { total: 7 }));
        assert!(payload.downcast_ref::<String>().is_none());
    }

    #[test]
    fn event_without_aggregate() {
        let evt = Event::new(name("order.placed"), Payload::new(Opened { total: 1 }));
        assert!(evt.aggregate().is_none());
        assert!(evt.aggregate_ref().is_none());
        assert_eq!(evt.payload_as::<Opened>().unwrap().total, 1);
    }

    #[test]
    fn event_with_aggregate() {
        let id = Uuid::new_v4();
        let evt = Event::new(name("order.placed"), Payload::new(Opened { total: 1 }))
            .with_aggregate(AggregateName::try_new("order").unwrap(), id, 3);

        let agg = evt.aggregate().unwrap();
        assert_eq!(agg.name.as_ref(), "order");
        assert_eq!(agg.id, id);
        assert_eq!(agg.version, 3);
        assert_eq!(evt.aggregate_ref().unwrap().id, id);
    }

    #[test]
    fn clones_share_the_payload() {
        let evt = Event::new(name("noted"), Payload::new(Opened { total: 2 }));
        let copy = evt.clone();
        assert_eq!(copy.id(), evt.id());
        assert!(std::ptr::eq(
            evt.payload_as::<Opened>().unwrap(),
            copy.payload_as::<Opened>().unwrap()
        ));
    }
}
