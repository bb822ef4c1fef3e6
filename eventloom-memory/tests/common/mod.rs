//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use eventloom::aggregate::{next_event, Aggregate, AggregateCore};
use eventloom::projection::{Progress, Projection};
use eventloom::{AggregateName, Event, EventName, Payload, Timestamp};

/// The single event kind the counter aggregate emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Added {
    pub amount: i64,
}

pub fn added_name() -> EventName {
    EventName::try_new("counter.added").unwrap()
}

pub fn counter_name() -> AggregateName {
    AggregateName::try_new("counter").unwrap()
}

pub fn aname(s: &str) -> AggregateName {
    AggregateName::try_new(s).unwrap()
}

pub fn ename(s: &str) -> EventName {
    EventName::try_new(s).unwrap()
}

/// A minimal event-sourced aggregate summing `Added` amounts.
#[derive(Debug)]
pub struct Counter {
    core: AggregateCore,
    pub total: i64,
}

impl Counter {
    pub fn new(id: Uuid) -> Self {
        Self {
            core: AggregateCore::new(counter_name(), id),
            total: 0,
        }
    }

    /// Records an `Added` change at the next version.
    pub fn add(&mut self, amount: i64) -> Event {
        next_event(self, added_name(), Payload::new(Added { amount }))
    }
}

impl Aggregate for Counter {
    fn core(&self) -> &AggregateCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AggregateCore {
        &mut self.core
    }

    fn apply(&mut self, event: &Event) {
        if let Some(Added { amount }) = event.payload_as::<Added>() {
            self.total += amount;
        }
    }
}

/// A progress-aware read model over `Added` events.
#[derive(Debug, Default)]
pub struct CounterTotal {
    progress: Progress,
    pub total: i64,
    pub applied: usize,
}

impl Projection for CounterTotal {
    fn apply_event(&mut self, event: &Event) {
        if let Some(Added { amount }) = event.payload_as::<Added>() {
            self.total += amount;
        }
        self.applied += 1;
    }

    fn progress(&self) -> Option<Timestamp> {
        self.progress.get()
    }

    fn set_progress(&mut self, progress: Option<Timestamp>) {
        self.progress.set(progress);
    }

    fn reset(&mut self) {
        self.total = 0;
        self.applied = 0;
    }
}
