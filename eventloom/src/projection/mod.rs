//! Projections: read models computed by applying events to a target.
//!
//! A target implements [`Projection`]. Targets that track how far they have
//! been projected additionally override the progress hooks, typically by
//! embedding a [`Progress`]; the apply path then skips events at or before
//! the recorded progress, which is what makes re-application idempotent.

mod job;
mod schedule;

pub use job::{BeforeEventFn, Job, JobBuilder};
pub use schedule::{
    subscribe, Continuously, Periodically, Schedule, ScheduleContext, SubscribeOptions,
    SubscriptionHandle,
};

use crate::event::Event;
use crate::types::Timestamp;

/// A consumer of events that maintains derived state.
///
/// The progress hooks default to "not progress-aware": `progress` returns
/// `None` and the setters do nothing. Override all of them together, or
/// embed a [`Progress`] and forward to it.
pub trait Projection: Send {
    /// Folds one event into the projection's state.
    fn apply_event(&mut self, event: &Event);

    /// The time of the last applied event, `None` when untracked or when
    /// nothing has been applied yet.
    fn progress(&self) -> Option<Timestamp> {
        None
    }

    /// Records the time of the last applied event. `None` rewinds the
    /// projection to the beginning.
    fn set_progress(&mut self, progress: Option<Timestamp>) {
        let _ = progress;
    }

    /// Clears derived state before a rebuild. The default does nothing.
    fn reset(&mut self) {}
}

/// Embeddable progress bookkeeping for progress-aware projections.
#[derive(Debug, Clone, Copy, Default)]
pub struct Progress {
    applied: Option<Timestamp>,
}

impl Progress {
    /// A tracker with no progress yet.
    pub const fn new() -> Self {
        Self { applied: None }
    }

    /// The time of the last applied event.
    pub fn get(&self) -> Option<Timestamp> {
        self.applied
    }

    /// Overwrites the recorded progress.
    pub fn set(&mut self, progress: Option<Timestamp>) {
        self.applied = progress;
    }
}

/// Applies one event to the target, honoring progress.
///
/// Events at or before the target's current progress are skipped; applied
/// events advance the progress to their time. Returns whether the event was
/// applied.
pub fn apply_next<P>(target: &mut P, event: &Event) -> bool
where
    P: Projection + ?Sized,
{
    if let Some(progress) = target.progress() {
        if event.time() <= progress {
            return false;
        }
    }
    target.apply_event(event);
    target.set_progress(Some(event.time()));
    true
}

/// Applies a finite sequence of events to the target, honoring progress.
pub fn apply_all<P>(target: &mut P, events: &[Event])
where
    P: Projection + ?Sized,
{
    for event in events {
        apply_next(target, event);
    }
}
