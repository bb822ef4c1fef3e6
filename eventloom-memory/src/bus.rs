//! In-process event bus with queue-group load balancing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;
use uuid::Uuid;

use eventloom::errors::{BusError, BusResult};
use eventloom::streams::CHANNEL_CAPACITY;
use eventloom::{
    AggregateName, AggregateVersion, Event, EventBus, EventId, EventName, EventRegistry,
    Timestamp,
};

type SubjectFn = Arc<dyn Fn(&EventName) -> String + Send + Sync>;
type QueueFn = Arc<dyn Fn(&EventName) -> Option<String> + Send + Sync>;

/// What goes over the wire per event. Payloads travel as codec-encoded
/// bytes, exactly as they would through a real broker, so subscribing with
/// an incomplete registry surfaces decode errors instead of panicking.
#[derive(Serialize, Deserialize)]
struct Envelope {
    id: EventId,
    name: EventName,
    time: Timestamp,
    payload: Vec<u8>,
    aggregate_name: Option<AggregateName>,
    aggregate_id: Option<Uuid>,
    aggregate_version: Option<AggregateVersion>,
}

struct SubscriberHandle {
    events: mpsc::Sender<Event>,
    errors: mpsc::Sender<BusError>,
}

#[derive(Default)]
struct Group {
    members: Vec<SubscriberHandle>,
    next: usize,
}

#[derive(Default)]
struct Subject {
    broadcast: Vec<SubscriberHandle>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct BusState {
    subjects: HashMap<String, Subject>,
}

/// An in-process [`EventBus`].
///
/// Events are delivered to subscribers by subject, derived from the event
/// name through the configured subject function (identity by default). When
/// a queue-group function is configured, subscriptions sharing a group key
/// compete for deliveries round-robin; other subscriptions all receive every
/// event. Per-publisher delivery order is preserved per subject.
pub struct InMemoryEventBus {
    registry: Arc<EventRegistry>,
    subject_fn: SubjectFn,
    queue_fn: QueueFn,
    state: Mutex<BusState>,
}

impl InMemoryEventBus {
    /// Creates a bus that encodes payloads through the given registry.
    pub fn new(registry: Arc<EventRegistry>) -> Self {
        Self {
            registry,
            subject_fn: Arc::new(|name: &EventName| name.to_string()),
            queue_fn: Arc::new(|_name: &EventName| None),
            state: Mutex::new(BusState::default()),
        }
    }

    /// Derives subjects by calling `subject` with the event name.
    #[must_use]
    pub fn with_subject_fn<F>(mut self, subject: F) -> Self
    where
        F: Fn(&EventName) -> String + Send + Sync + 'static,
    {
        self.subject_fn = Arc::new(subject);
        self
    }

    /// Derives subjects by prepending `prefix` to the event name.
    #[must_use]
    pub fn with_subject_prefix(self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.with_subject_fn(move |name| format!("{prefix}{name}"))
    }

    /// Derives queue groups by calling `queue` with the event name.
    /// Returning `None` disables grouping for that name.
    #[must_use]
    pub fn with_queue_fn<F>(mut self, queue: F) -> Self
    where
        F: Fn(&EventName) -> Option<String> + Send + Sync + 'static,
    {
        self.queue_fn = Arc::new(queue);
        self
    }

    /// Uses the event name itself as the queue group, load-balancing each
    /// event name between its subscribers.
    #[must_use]
    pub fn queue_group_by_event(self) -> Self {
        self.with_queue_fn(|name| Some(name.to_string()))
    }

    fn encode(&self, event: &Event) -> BusResult<Vec<u8>> {
        let payload = self.registry.encode(event.name(), event.payload())?;
        let envelope = Envelope {
            id: event.id(),
            name: event.name().clone(),
            time: event.time(),
            payload,
            aggregate_name: event.aggregate().map(|agg| agg.name.clone()),
            aggregate_id: event.aggregate().map(|agg| agg.id),
            aggregate_version: event.aggregate().map(|agg| agg.version),
        };
        serde_json::to_vec(&envelope)
            .map_err(|err| BusError::Transport(format!("encode envelope: {err}")))
    }

    fn decode(&self, bytes: &[u8]) -> BusResult<Event> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|err| BusError::Transport(format!("decode envelope: {err}")))?;
        let payload = self.registry.decode(&envelope.name, &envelope.payload)?;

        let mut event = Event::from_parts(
            envelope.id,
            envelope.name,
            envelope.time,
            payload,
            None,
        );
        if let (Some(name), Some(id), Some(version)) = (
            envelope.aggregate_name,
            envelope.aggregate_id,
            envelope.aggregate_version,
        ) {
            event = event.with_aggregate(name, id, version);
        }
        Ok(event)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, events: Vec<Event>) -> BusResult<()> {
        for event in events {
            let bytes = self.encode(&event)?;
            let subject = (self.subject_fn)(event.name());

            let mut state = self.state.lock().await;
            let Some(subscribers) = state.subjects.get_mut(&subject) else {
                continue;
            };

            // One decode per published event; subscribers share the payload.
            let decoded = self.decode(&bytes);

            subscribers
                .broadcast
                .retain(|handle| !handle.events.is_closed());
            for handle in &subscribers.broadcast {
                deliver(handle, &decoded).await;
            }

            for group in subscribers.groups.values_mut() {
                group.members.retain(|handle| !handle.events.is_closed());
                if group.members.is_empty() {
                    continue;
                }
                group.next %= group.members.len();
                let handle = &group.members[group.next];
                deliver(handle, &decoded).await;
                group.next = (group.next + 1) % group.members.len();
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        names: Vec<EventName>,
    ) -> BusResult<(mpsc::Receiver<Event>, mpsc::Receiver<BusError>)> {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let mut state = self.state.lock().await;
        for name in names {
            let subject = (self.subject_fn)(&name);
            let entry = state.subjects.entry(subject).or_default();
            let handle = SubscriberHandle {
                events: event_tx.clone(),
                errors: err_tx.clone(),
            };
            match (self.queue_fn)(&name) {
                Some(group) => entry.groups.entry(group).or_default().members.push(handle),
                None => entry.broadcast.push(handle),
            }
        }

        Ok((event_rx, err_rx))
    }
}

async fn deliver(handle: &SubscriberHandle, decoded: &BusResult<Event>) {
    match decoded {
        Ok(event) => {
            let _ = handle.events.send(event.clone()).await;
        }
        Err(err) => {
            // Error delivery is best-effort so a slow consumer cannot stall
            // the publisher.
            if handle.errors.try_send(err.clone()).is_err() {
                warn!(error = %err, "dropping undeliverable bus error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventloom::Payload;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Granted {
        scope: String,
    }

    fn ename(s: &str) -> EventName {
        EventName::try_new(s).unwrap()
    }

    fn registry() -> Arc<EventRegistry> {
        let registry = EventRegistry::new();
        registry.register::<Granted>(ename("granted"));
        Arc::new(registry)
    }

    fn granted(scope: &str) -> Event {
        Event::new(
            ename("granted"),
            Payload::new(Granted {
                scope: scope.to_string(),
            }),
        )
    }

    #[tokio::test]
    async fn subscribers_receive_matching_events_in_order() {
        let bus = InMemoryEventBus::new(registry());
        let (mut events, _errors) = bus.subscribe(vec![ename("granted")]).await.unwrap();

        bus.publish(vec![granted("read"), granted("write")])
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(first.payload_as::<Granted>().unwrap().scope, "read");
        assert_eq!(second.payload_as::<Granted>().unwrap().scope, "write");
    }

    #[tokio::test]
    async fn unsubscribed_names_are_not_delivered() {
        let registry = EventRegistry::new();
        registry.register::<Granted>(ename("granted"));
        registry.register::<Granted>(ename("revoked"));
        let bus = InMemoryEventBus::new(Arc::new(registry));

        let (mut events, _errors) = bus.subscribe(vec![ename("granted")]).await.unwrap();

        bus.publish(vec![
            Event::new(
                ename("revoked"),
                Payload::new(Granted {
                    scope: "read".to_string(),
                }),
            ),
            granted("read"),
        ])
        .await
        .unwrap();

        let received = events.recv().await.unwrap();
        assert_eq!(received.name().as_ref(), "granted");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let bus = InMemoryEventBus::new(registry());
        let (mut a, _a_errs) = bus.subscribe(vec![ename("granted")]).await.unwrap();
        let (mut b, _b_errs) = bus.subscribe(vec![ename("granted")]).await.unwrap();

        bus.publish(vec![granted("read")]).await.unwrap();

        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
    }

    #[tokio::test]
    async fn queue_groups_deliver_to_exactly_one_member() {
        let bus = InMemoryEventBus::new(registry()).queue_group_by_event();

        let mut receivers = Vec::new();
        for _ in 0..5 {
            let (events, _errors) = bus.subscribe(vec![ename("granted")]).await.unwrap();
            receivers.push(events);
        }

        bus.publish(vec![granted("read")]).await.unwrap();

        let mut delivered = 0;
        for receiver in &mut receivers {
            if receiver.try_recv().is_ok() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn queue_groups_round_robin() {
        let bus = InMemoryEventBus::new(registry()).queue_group_by_event();
        let (mut a, _a_errs) = bus.subscribe(vec![ename("granted")]).await.unwrap();
        let (mut b, _b_errs) = bus.subscribe(vec![ename("granted")]).await.unwrap();

        for _ in 0..4 {
            bus.publish(vec![granted("read")]).await.unwrap();
        }

        let mut a_count = 0;
        while a.try_recv().is_ok() {
            a_count += 1;
        }
        let mut b_count = 0;
        while b.try_recv().is_ok() {
            b_count += 1;
        }
        assert_eq!((a_count, b_count), (2, 2));
    }

    #[tokio::test]
    async fn subject_prefix_separates_buses() {
        let bus = InMemoryEventBus::new(registry()).with_subject_prefix("prod.");
        let (mut events, _errors) = bus.subscribe(vec![ename("granted")]).await.unwrap();

        bus.publish(vec![granted("read")]).await.unwrap();
        assert!(events.recv().await.is_some());
    }

    #[tokio::test]
    async fn unregistered_payloads_fail_to_publish() {
        let bus = InMemoryEventBus::new(Arc::new(EventRegistry::new()));
        let err = bus.publish(vec![granted("read")]).await.unwrap_err();
        assert!(matches!(err, BusError::Codec(_)));
    }

    #[tokio::test]
    async fn decode_failures_reach_the_error_channel() {
        // A payload type whose deserializer validates: values over 100 are
        // rejected on the way in, but nothing stops a process from
        // publishing one it built directly.
        #[derive(Debug, Clone, Serialize, Deserialize)]
        #[serde(into = "u8", try_from = "u8")]
        struct Percent(u8);

        impl From<Percent> for u8 {
            fn from(percent: Percent) -> Self {
                percent.0
            }
        }

        impl TryFrom<u8> for Percent {
            type Error = String;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                if value > 100 {
                    return Err(format!("{value} is not a percentage"));
                }
                Ok(Self(value))
            }
        }

        let registry = EventRegistry::new();
        registry.register::<Percent>(ename("rated"));
        let bus = InMemoryEventBus::new(Arc::new(registry));

        let (mut events, mut errors) = bus.subscribe(vec![ename("rated")]).await.unwrap();

        bus.publish(vec![Event::new(ename("rated"), Payload::new(Percent(250)))])
            .await
            .unwrap();

        let err = errors.recv().await.expect("decode error delivered");
        assert!(matches!(err, BusError::Codec(_)));
        assert!(events.try_recv().is_err());
    }
}
