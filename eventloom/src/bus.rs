//! The event bus contract.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{BusError, BusResult};
use crate::event::Event;
use crate::types::EventName;

/// A live subscription: the event channel and the async error channel.
/// Both close when the subscription ends. Dropping the event receiver
/// cancels the subscription.
pub type BusSubscription = (mpsc::Receiver<Event>, mpsc::Receiver<BusError>);

/// Name-keyed fan-out of events with optional queue-group load balancing.
///
/// Implementations must preserve per-publisher delivery order for each
/// subject and must never panic on decode or transport failures; async
/// errors are pushed to the subscription's error channel instead.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Delivers each event to every live subscription whose subscribed name
    /// set includes the event's name.
    async fn publish(&self, events: Vec<Event>) -> BusResult<()>;

    /// Subscribes to events with any of the given names.
    ///
    /// When the transport is configured with a queue-group function,
    /// subscriptions sharing a group key receive competing deliveries;
    /// otherwise every subscription receives every event.
    async fn subscribe(&self, names: Vec<EventName>) -> BusResult<BusSubscription>;
}
