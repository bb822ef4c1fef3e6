//! Schedules decide when aggregates are projected.
//!
//! A schedule emits lightweight tickets, one per aggregate that should be
//! (re)projected: the continuous schedule reacts to events on the bus, the
//! periodic schedule scans the store on a fixed interval. The subscribe
//! pipeline turns tickets into [`ScheduleContext`] values for consumers and
//! owns the graceful-stop choreography.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::debug;
use uuid::Uuid;

use crate::aggregate::AggregateRef;
use crate::bus::EventBus;
use crate::errors::{ScheduleError, ScheduleResult};
use crate::event::Event;
use crate::query::Query;
use crate::store::EventStore;
use crate::streams::CHANNEL_CAPACITY;
use crate::types::{AggregateName, EventName};

/// The version every aggregate's first event carries; the periodic schedule
/// scans for these creation events to enumerate aggregates.
const BOOTSTRAP_VERSION: u64 = 1;

/// What a consumer receives per scheduled projection run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleContext {
    /// The kind of the aggregate to project.
    pub aggregate_name: AggregateName,
    /// The aggregate instance to project.
    pub aggregate_id: Uuid,
}

/// A long-lived producer of projection tickets.
#[async_trait]
pub trait Schedule: Send + Sync {
    /// Starts the schedule, returning its ticket and error channels.
    ///
    /// The producer closes both channels when it stops; dropping the ticket
    /// receiver stops it as well.
    async fn jobs(
        &self,
    ) -> ScheduleResult<(mpsc::Receiver<AggregateRef>, mpsc::Receiver<ScheduleError>)>;
}

/// Events without a full aggregate attribution, and events failing the
/// schedule's pre-filter, do not produce a ticket.
fn ticket_for(event: &Event, filter: &Query) -> Option<AggregateRef> {
    let reference = event.aggregate_ref()?;
    filter.matches(event).then_some(reference)
}

/// Projects aggregates on every matching event published on the bus.
pub struct Continuously {
    bus: Arc<dyn EventBus>,
    events: Vec<EventName>,
    filter: Query,
}

impl Continuously {
    /// Creates a continuous schedule for the given event names.
    pub fn new(bus: Arc<dyn EventBus>, events: Vec<EventName>) -> Self {
        Self {
            bus,
            events,
            filter: Query::new(),
        }
    }

    /// Only events matching `filter` trigger a ticket.
    #[must_use]
    pub fn with_filter(mut self, filter: Query) -> Self {
        self.filter = filter;
        self
    }
}

#[async_trait]
impl Schedule for Continuously {
    async fn jobs(
        &self,
    ) -> ScheduleResult<(mpsc::Receiver<AggregateRef>, mpsc::Receiver<ScheduleError>)> {
        let (mut events, mut bus_errors) = self.bus.subscribe(self.events.clone()).await?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(err) = bus_errors.recv().await {
                if err_tx.send(ScheduleError::Bus(err)).await.is_err() {
                    return;
                }
            }
        });

        let filter = self.filter.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(reference) = ticket_for(&event, &filter) else {
                    continue;
                };
                if tx.send(reference).await.is_err() {
                    return;
                }
            }
        });

        Ok((rx, err_rx))
    }
}

/// Projects aggregates on a fixed interval by scanning the store for their
/// creation events.
pub struct Periodically {
    store: Arc<dyn EventStore>,
    interval: Duration,
    names: Vec<AggregateName>,
    filter: Query,
}

impl Periodically {
    /// Creates a periodic schedule.
    ///
    /// Without aggregate names every aggregate is projected; otherwise only
    /// aggregates of the given kinds.
    pub fn new(store: Arc<dyn EventStore>, interval: Duration, names: Vec<AggregateName>) -> Self {
        Self {
            store,
            interval,
            names,
            filter: Query::new(),
        }
    }

    /// Only creation events matching `filter` trigger a ticket.
    #[must_use]
    pub fn with_filter(mut self, filter: Query) -> Self {
        self.filter = filter;
        self
    }
}

#[async_trait]
impl Schedule for Periodically {
    async fn jobs(
        &self,
    ) -> ScheduleResult<(mpsc::Receiver<AggregateRef>, mpsc::Receiver<ScheduleError>)> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let store = Arc::clone(&self.store);
        let names = self.names.clone();
        let filter = self.filter.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Fixed pacing: a tardy tick is skipped, not burst through.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of a tokio interval completes immediately; the
            // schedule fires after one full interval instead.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    return;
                }

                let query = Query::builder()
                    .aggregate_names(names.iter().cloned())
                    .version(BOOTSTRAP_VERSION)
                    .build();

                let (mut events, mut errors) = match store.query(query).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = err_tx.send(ScheduleError::Store(err)).await;
                        return;
                    }
                };

                debug!("periodic schedule tick, scanning creation events");
                let mut errors_open = true;
                loop {
                    let event = if errors_open {
                        tokio::select! {
                            maybe_event = events.recv() => maybe_event,
                            maybe_error = errors.recv() => {
                                match maybe_error {
                                    Some(err) => {
                                        let _ = err_tx.send(ScheduleError::Store(err)).await;
                                    }
                                    None => errors_open = false,
                                }
                                continue;
                            }
                        }
                    } else {
                        events.recv().await
                    };

                    let Some(event) = event else { break };
                    let Some(reference) = ticket_for(&event, &filter) else {
                        continue;
                    };
                    if tx.send(reference).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok((rx, err_rx))
    }
}

/// Options for [`subscribe`].
#[derive(Debug, Clone, Copy, Default)]
#[must_use]
pub struct SubscribeOptions {
    stop_timeout: Option<Duration>,
}

impl SubscribeOptions {
    /// Default options: stopping closes the output immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps draining in-flight tickets for up to `timeout` after
    /// [`SubscriptionHandle::stop`] before closing the output.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }
}

/// Controls a running subscription.
///
/// Dropping the handle without calling [`stop`](Self::stop) also initiates
/// the shutdown.
pub struct SubscriptionHandle {
    cancel: Option<oneshot::Sender<()>>,
}

impl SubscriptionHandle {
    /// Initiates the graceful stop: in-flight tickets keep flowing for the
    /// configured stop timeout, then the output channel closes.
    pub fn stop(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

/// Wires a schedule into a consumer channel with graceful-stop semantics.
///
/// Returns the context channel, the schedule's error channel, and the stop
/// handle. The context channel closes when the schedule's producer finishes
/// or after a stop; a single dispatch task is the only sender, so nothing is
/// ever sent to a closed channel.
pub async fn subscribe(
    schedule: Arc<dyn Schedule>,
    options: SubscribeOptions,
) -> ScheduleResult<(
    mpsc::Receiver<ScheduleContext>,
    mpsc::Receiver<ScheduleError>,
    SubscriptionHandle,
)> {
    let (mut jobs, errors) = schedule.jobs().await?;

    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (stop_tx, stop_rx) = watch::channel(false);
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

    // Dispatch loop: the sole sender to the output channel.
    let mut dispatch_stop = stop_rx;
    tokio::spawn(async move {
        // Dropped on return, signalling natural completion.
        let _done = done_tx;
        loop {
            tokio::select! {
                changed = dispatch_stop.changed() => {
                    if changed.is_err() || *dispatch_stop.borrow() {
                        return;
                    }
                }
                maybe_ticket = jobs.recv() => {
                    let Some(ticket) = maybe_ticket else { return };
                    let context = ScheduleContext {
                        aggregate_name: ticket.name,
                        aggregate_id: ticket.id,
                    };
                    tokio::select! {
                        changed = dispatch_stop.changed() => {
                            if changed.is_err() || *dispatch_stop.borrow() {
                                return;
                            }
                        }
                        sent = out_tx.send(context) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    });

    // Stop choreography: on cancellation, drain for the stop timeout (when
    // configured), then signal the dispatch loop to finish.
    let stop_timeout = options.stop_timeout;
    tokio::spawn(async move {
        let mut done_rx = done_rx;
        tokio::select! {
            _ = &mut done_rx => return,
            _ = cancel_rx => {}
        }
        if let Some(timeout) = stop_timeout {
            debug!(?timeout, "subscription stopping, draining in-flight tickets");
            tokio::select! {
                _ = &mut done_rx => {}
                () = tokio::time::sleep(timeout) => {}
            }
        }
        let _ = stop_tx.send(true);
    });

    Ok((
        out_rx,
        errors,
        SubscriptionHandle {
            cancel: Some(cancel_tx),
        },
    ))
}
