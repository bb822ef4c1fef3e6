//! Schedules and the subscribe pipeline against the in-memory backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use common::{aname, ename, Added};
use eventloom::projection::{
    subscribe, Continuously, Periodically, Schedule, SubscribeOptions,
};
use eventloom::{Event, EventBus, EventRegistry, EventStore, Payload, Query};
use eventloom_memory::{InMemoryEventBus, InMemoryEventStore};

fn registry() -> Arc<EventRegistry> {
    let registry = EventRegistry::new();
    registry.register::<Added>(ename("granted"));
    Arc::new(registry)
}

fn granted(aggregate: &str, id: Uuid) -> Event {
    Event::new(ename("granted"), Payload::new(Added { amount: 1 }))
        .with_aggregate(aname(aggregate), id, 1)
}

#[tokio::test]
async fn periodic_schedules_emit_one_ticket_per_bootstrap_event() {
    let store = Arc::new(InMemoryEventStore::new());
    let id_a = Uuid::new_v4();
    let id_b = Uuid::new_v4();
    let id_c = Uuid::new_v4();
    for (name, id) in [("a", id_a), ("b", id_b), ("c", id_c)] {
        store.insert(vec![granted(name, id)]).await.unwrap();
    }

    let schedule = Periodically::new(
        store,
        Duration::from_millis(100),
        vec![aname("a"), aname("b")],
    );
    let (mut tickets, _errors) = schedule.jobs().await.unwrap();

    let mut received = Vec::new();
    for _ in 0..2 {
        let ticket = tokio::time::timeout(Duration::from_millis(500), tickets.recv())
            .await
            .expect("tick produced tickets")
            .expect("channel open");
        received.push(ticket);
    }

    assert!(received.iter().any(|t| t.id == id_a));
    assert!(received.iter().any(|t| t.id == id_b));
    assert!(!received.iter().any(|t| t.id == id_c));
}

#[tokio::test]
async fn periodic_schedules_ignore_later_versions() {
    let store = Arc::new(InMemoryEventStore::new());
    let id = Uuid::new_v4();
    store.insert(vec![granted("a", id)]).await.unwrap();
    store
        .insert(vec![
            Event::new(ename("granted"), Payload::new(Added { amount: 2 }))
                .with_aggregate(aname("a"), id, 2),
        ])
        .await
        .unwrap();

    let schedule = Periodically::new(store, Duration::from_millis(50), vec![aname("a")]);
    let (mut tickets, _errors) = schedule.jobs().await.unwrap();

    // One tick scans one bootstrap event, so each scan yields one ticket.
    let first = tokio::time::timeout(Duration::from_millis(500), tickets.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.id, id);
}

#[tokio::test]
async fn continuous_schedules_filter_and_require_attribution() {
    let bus = Arc::new(InMemoryEventBus::new(registry()));
    let filter = Query::builder().aggregate_name(aname("order")).build();
    let schedule = Continuously::new(bus.clone(), vec![ename("granted")]).with_filter(filter);

    let (mut tickets, _errors) = schedule.jobs().await.unwrap();

    // No aggregate attribution: discarded.
    bus.publish(vec![Event::new(
        ename("granted"),
        Payload::new(Added { amount: 1 }),
    )])
    .await
    .unwrap();

    // Filtered out by aggregate name: discarded.
    bus.publish(vec![granted("ignored", Uuid::new_v4())])
        .await
        .unwrap();

    // Passes the filter: one ticket.
    let order = Uuid::new_v4();
    bus.publish(vec![granted("order", order)]).await.unwrap();

    let ticket = tokio::time::timeout(Duration::from_millis(500), tickets.recv())
        .await
        .expect("matching event produced a ticket")
        .expect("channel open");
    assert_eq!(ticket.name, aname("order"));
    assert_eq!(ticket.id, order);
    assert!(tickets.try_recv().is_err());
}

#[tokio::test]
async fn subscribe_delivers_contexts_until_stopped() {
    let bus = Arc::new(InMemoryEventBus::new(registry()));
    let schedule = Arc::new(Continuously::new(bus.clone(), vec![ename("granted")]));

    let (mut contexts, _errors, handle) = subscribe(schedule, SubscribeOptions::new())
        .await
        .unwrap();

    let order = Uuid::new_v4();
    bus.publish(vec![granted("order", order)]).await.unwrap();

    let context = tokio::time::timeout(Duration::from_millis(500), contexts.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(context.aggregate_name, aname("order"));
    assert_eq!(context.aggregate_id, order);

    // An immediate stop closes the output promptly.
    handle.stop();
    let closed = tokio::time::timeout(Duration::from_millis(500), async {
        while contexts.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "output channel did not close after stop");
}

#[tokio::test]
async fn stop_timeout_drains_in_flight_tickets() {
    let bus = Arc::new(InMemoryEventBus::new(registry()));
    let schedule = Arc::new(Continuously::new(bus.clone(), vec![ename("granted")]));

    let (mut contexts, _errors, handle) = subscribe(
        schedule,
        SubscribeOptions::new().with_stop_timeout(Duration::from_millis(200)),
    )
    .await
    .unwrap();

    handle.stop();

    // Published inside the drain window: still delivered.
    let order = Uuid::new_v4();
    bus.publish(vec![granted("order", order)]).await.unwrap();

    let context = tokio::time::timeout(Duration::from_millis(150), contexts.recv())
        .await
        .expect("ticket drained within the stop timeout")
        .expect("channel still open during drain");
    assert_eq!(context.aggregate_id, order);

    // After the window the output closes.
    let closed = tokio::time::timeout(Duration::from_millis(500), async {
        while contexts.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "output channel did not close after the stop timeout");
}
