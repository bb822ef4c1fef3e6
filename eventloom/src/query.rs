//! The declarative event query shared by the store, the bus schedules, and
//! the projection engine.
//!
//! A [`Query`] is an immutable value object combining membership constraints
//! (names, ids, aggregates), time and version bounds, and a multi-key sort
//! order. Backends translate it to their native filter language; the same
//! query doubles as an in-memory predicate via [`Query::matches`], which is
//! what keeps backend filtering and post-filtering consistent.

use std::cmp::Ordering;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::event::Event;
use crate::types::{AggregateName, AggregateVersion, EventId, EventName, Timestamp};

/// Bumped whenever the canonical fingerprint encoding changes, so stale
/// fingerprints can never alias fresh ones.
const FINGERPRINT_VERSION: u8 = 1;

/// An inclusive time interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeRange {
    /// First instant inside the range.
    pub start: Timestamp,
    /// Last instant inside the range.
    pub end: Timestamp,
}

impl TimeRange {
    /// Whether `time` lies within the range, bounds included.
    pub fn contains(&self, time: Timestamp) -> bool {
        self.start <= time && time <= self.end
    }
}

/// An inclusive aggregate-version interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionRange {
    /// Lowest version inside the range.
    pub start: AggregateVersion,
    /// Highest version inside the range.
    pub end: AggregateVersion,
}

impl VersionRange {
    /// Whether `version` lies within the range, bounds included.
    pub fn contains(&self, version: AggregateVersion) -> bool {
        self.start <= version && version <= self.end
    }
}

/// Time constraints of a query.
///
/// `min` and `max` are inclusive at nanosecond precision. Ranges are
/// disjunctive: an event satisfies them if any one range contains its time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeConstraints {
    exact: Vec<Timestamp>,
    min: Option<Timestamp>,
    max: Option<Timestamp>,
    ranges: Vec<TimeRange>,
}

impl TimeConstraints {
    /// Exact instants an event time must be one of, when non-empty.
    pub fn exact(&self) -> &[Timestamp] {
        &self.exact
    }

    /// Inclusive lower bound.
    pub fn min(&self) -> Option<Timestamp> {
        self.min
    }

    /// Inclusive upper bound.
    pub fn max(&self) -> Option<Timestamp> {
        self.max
    }

    /// Disjunctive inclusive ranges.
    pub fn ranges(&self) -> &[TimeRange] {
        &self.ranges
    }

    /// Whether no time constraint is set.
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.min.is_none() && self.max.is_none() && self.ranges.is_empty()
    }

    fn matches(&self, time: Timestamp) -> bool {
        if !self.exact.is_empty() && !self.exact.contains(&time) {
            return false;
        }
        if let Some(min) = self.min {
            if time < min {
                return false;
            }
        }
        if let Some(max) = self.max {
            if time > max {
                return false;
            }
        }
        if !self.ranges.is_empty() && !self.ranges.iter().any(|r| r.contains(time)) {
            return false;
        }
        true
    }
}

/// Aggregate-version constraints of a query.
///
/// The `min` and `max` sets are disjunctive within their field: a version
/// satisfies the minimum constraint if it is at least one of the listed
/// minimums, and likewise for maximums.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionConstraints {
    exact: Vec<AggregateVersion>,
    min: Vec<AggregateVersion>,
    max: Vec<AggregateVersion>,
    ranges: Vec<VersionRange>,
}

impl VersionConstraints {
    /// Exact versions an event must have one of, when non-empty.
    pub fn exact(&self) -> &[AggregateVersion] {
        &self.exact
    }

    /// Disjunctive inclusive lower bounds.
    pub fn min(&self) -> &[AggregateVersion] {
        &self.min
    }

    /// Disjunctive inclusive upper bounds.
    pub fn max(&self) -> &[AggregateVersion] {
        &self.max
    }

    /// Disjunctive inclusive ranges.
    pub fn ranges(&self) -> &[VersionRange] {
        &self.ranges
    }

    /// Whether no version constraint is set.
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.min.is_empty() && self.max.is_empty() && self.ranges.is_empty()
    }

    fn matches(&self, version: AggregateVersion) -> bool {
        if !self.exact.is_empty() && !self.exact.contains(&version) {
            return false;
        }
        if !self.min.is_empty() && !self.min.iter().any(|&m| version >= m) {
            return false;
        }
        if !self.max.is_empty() && !self.max.iter().any(|&m| version <= m) {
            return false;
        }
        if !self.ranges.is_empty() && !self.ranges.iter().any(|r| r.contains(version)) {
            return false;
        }
        true
    }
}

/// A sortable event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortField {
    /// The event time.
    Time,
    /// The owning aggregate's name; events without an aggregate sort first.
    AggregateName,
    /// The owning aggregate's id; events without an aggregate sort first.
    AggregateId,
    /// The owning aggregate's version; events without an aggregate sort first.
    AggregateVersion,
}

/// A sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortDirection {
    /// Smallest first.
    Asc,
    /// Largest first.
    Desc,
}

/// One key of a multi-key sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sorting {
    /// The field to sort by.
    pub field: SortField,
    /// The direction to sort in.
    pub direction: SortDirection,
}

impl Sorting {
    /// Creates a sorting key.
    pub const fn new(field: SortField, direction: SortDirection) -> Self {
        Self { field, direction }
    }
}

/// A declarative predicate + sort over the event log.
///
/// An event matches a query iff it satisfies every non-empty constraint
/// group. The empty query matches every event and is the identity of
/// [`Query::merge`].
///
/// ```
/// use eventloom::query::{Query, SortDirection, SortField};
/// use eventloom::{AggregateName, EventName};
///
/// let query = Query::builder()
///     .name(EventName::try_new("order.placed")?)
///     .aggregate_name(AggregateName::try_new("order")?)
///     .version_min(2)
///     .sort_by(SortField::AggregateVersion, SortDirection::Asc)
///     .build();
///
/// assert_eq!(query.aggregate_versions().min(), &[2]);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    names: Vec<EventName>,
    ids: Vec<EventId>,
    times: TimeConstraints,
    aggregate_names: Vec<AggregateName>,
    aggregate_ids: Vec<Uuid>,
    aggregate_versions: VersionConstraints,
    sortings: Vec<Sorting>,
}

impl Query {
    /// An unconstrained query matching every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts building a query.
    pub fn builder() -> QueryBuilder {
        QueryBuilder::default()
    }

    /// Event names the query is restricted to, when non-empty.
    pub fn names(&self) -> &[EventName] {
        &self.names
    }

    /// Event ids the query is restricted to, when non-empty.
    pub fn ids(&self) -> &[EventId] {
        &self.ids
    }

    /// The time constraints.
    pub fn times(&self) -> &TimeConstraints {
        &self.times
    }

    /// Aggregate names the query is restricted to, when non-empty.
    pub fn aggregate_names(&self) -> &[AggregateName] {
        &self.aggregate_names
    }

    /// Aggregate ids the query is restricted to, when non-empty.
    pub fn aggregate_ids(&self) -> &[Uuid] {
        &self.aggregate_ids
    }

    /// The aggregate-version constraints.
    pub fn aggregate_versions(&self) -> &VersionConstraints {
        &self.aggregate_versions
    }

    /// The sort order, primary key first.
    pub fn sortings(&self) -> &[Sorting] {
        &self.sortings
    }

    /// The in-memory predicate.
    ///
    /// Constraints on aggregate fields fail for events that carry no
    /// aggregate attribution.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.names.is_empty() && !self.names.contains(event.name()) {
            return false;
        }
        if !self.ids.is_empty() && !self.ids.contains(&event.id()) {
            return false;
        }
        if !self.times.matches(event.time()) {
            return false;
        }
        if !self.aggregate_names.is_empty() {
            match event.aggregate() {
                Some(agg) if self.aggregate_names.contains(&agg.name) => {}
                _ => return false,
            }
        }
        if !self.aggregate_ids.is_empty() {
            match event.aggregate() {
                Some(agg) if self.aggregate_ids.contains(&agg.id) => {}
                _ => return false,
            }
        }
        if !self.aggregate_versions.is_empty() {
            match event.aggregate() {
                Some(agg) if self.aggregate_versions.matches(agg.version) => {}
                _ => return false,
            }
        }
        true
    }

    /// Refines `self` with the constraints of `other`.
    ///
    /// Membership sets are unioned, scalar time bounds narrow conjunctively
    /// (the later minimum and the earlier maximum win), and ranges and
    /// sortings are concatenated. The operation is associative and the empty
    /// query is its identity.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        union_into(&mut self.names, other.names);
        union_into(&mut self.ids, other.ids);
        union_into(&mut self.times.exact, other.times.exact);
        self.times.min = narrow(self.times.min, other.times.min, Ordering::Greater);
        self.times.max = narrow(self.times.max, other.times.max, Ordering::Less);
        self.times.ranges.extend(other.times.ranges);
        union_into(&mut self.aggregate_names, other.aggregate_names);
        union_into(&mut self.aggregate_ids, other.aggregate_ids);
        union_into(&mut self.aggregate_versions.exact, other.aggregate_versions.exact);
        union_into(&mut self.aggregate_versions.min, other.aggregate_versions.min);
        union_into(&mut self.aggregate_versions.max, other.aggregate_versions.max);
        self.aggregate_versions
            .ranges
            .extend(other.aggregate_versions.ranges);
        self.sortings.extend(other.sortings);
        self
    }

    /// A deterministic, structure-sensitive hash of the query.
    ///
    /// Membership sets are sorted and deduplicated before hashing, and every
    /// field is length- and tag-prefixed, so logically equal queries share a
    /// fingerprint while distinct queries collide only with negligible
    /// probability. The projection query cache keys on this.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update([FINGERPRINT_VERSION]);

        hash_list(
            &mut hasher,
            0x01,
            &sorted(self.names.iter().map(|n| n.as_ref().as_bytes().to_vec())),
        );
        hash_list(
            &mut hasher,
            0x02,
            &sorted(self.ids.iter().map(|id| id.as_bytes().to_vec())),
        );
        hash_list(
            &mut hasher,
            0x03,
            &sorted(self.times.exact.iter().map(|t| t.as_nanos().to_le_bytes().to_vec())),
        );
        hash_bound(&mut hasher, 0x04, self.times.min.map(|t| t.as_nanos()));
        hash_bound(&mut hasher, 0x05, self.times.max.map(|t| t.as_nanos()));
        hash_list(
            &mut hasher,
            0x06,
            &sorted(self.times.ranges.iter().map(|r| {
                let mut bytes = r.start.as_nanos().to_le_bytes().to_vec();
                bytes.extend(r.end.as_nanos().to_le_bytes());
                bytes
            })),
        );
        hash_list(
            &mut hasher,
            0x07,
            &sorted(self.aggregate_names.iter().map(|n| n.as_ref().as_bytes().to_vec())),
        );
        hash_list(
            &mut hasher,
            0x08,
            &sorted(self.aggregate_ids.iter().map(|id| id.as_bytes().to_vec())),
        );
        hash_list(
            &mut hasher,
            0x09,
            &sorted(self.aggregate_versions.exact.iter().map(|v| v.to_le_bytes().to_vec())),
        );
        hash_list(
            &mut hasher,
            0x0a,
            &sorted(self.aggregate_versions.min.iter().map(|v| v.to_le_bytes().to_vec())),
        );
        hash_list(
            &mut hasher,
            0x0b,
            &sorted(self.aggregate_versions.max.iter().map(|v| v.to_le_bytes().to_vec())),
        );
        hash_list(
            &mut hasher,
            0x0c,
            &sorted(self.aggregate_versions.ranges.iter().map(|r| {
                let mut bytes = r.start.to_le_bytes().to_vec();
                bytes.extend(r.end.to_le_bytes());
                bytes
            })),
        );
        // Sort order is positional, so sortings are hashed in declaration order.
        let sortings: Vec<Vec<u8>> = self
            .sortings
            .iter()
            .map(|s| {
                vec![
                    match s.field {
                        SortField::Time => 0,
                        SortField::AggregateName => 1,
                        SortField::AggregateId => 2,
                        SortField::AggregateVersion => 3,
                    },
                    match s.direction {
                        SortDirection::Asc => 0,
                        SortDirection::Desc => 1,
                    },
                ]
            })
            .collect();
        hash_list(&mut hasher, 0x0d, &sortings);

        hasher.finalize().into()
    }
}

fn union_into<T: PartialEq>(target: &mut Vec<T>, source: Vec<T>) {
    for item in source {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

fn narrow(a: Option<Timestamp>, b: Option<Timestamp>, keep: Ordering) -> Option<Timestamp> {
    match (a, b) {
        (Some(x), Some(y)) => Some(if x.cmp(&y) == keep { x } else { y }),
        (some, None) | (None, some) => some,
    }
}

fn sorted(items: impl Iterator<Item = Vec<u8>>) -> Vec<Vec<u8>> {
    let mut collected: Vec<Vec<u8>> = items.collect();
    collected.sort();
    collected.dedup();
    collected
}

fn hash_list(hasher: &mut Sha256, tag: u8, items: &[Vec<u8>]) {
    hasher.update([tag]);
    hasher.update((items.len() as u64).to_le_bytes());
    for item in items {
        hasher.update((item.len() as u64).to_le_bytes());
        hasher.update(item);
    }
}

fn hash_bound(hasher: &mut Sha256, tag: u8, bound: Option<i64>) {
    hasher.update([tag]);
    match bound {
        Some(value) => {
            hasher.update([1]);
            hasher.update(value.to_le_bytes());
        }
        None => hasher.update([0]),
    }
}

/// Compares two events under a multi-key sort order.
///
/// Keys are applied lexicographically; events equal under every key compare
/// as equal, which combined with a stable sort preserves their prior order.
pub fn compare(a: &Event, b: &Event, sortings: &[Sorting]) -> Ordering {
    for sorting in sortings {
        let ordering = match sorting.field {
            SortField::Time => a.time().cmp(&b.time()),
            SortField::AggregateName => a
                .aggregate()
                .map(|agg| &agg.name)
                .cmp(&b.aggregate().map(|agg| &agg.name)),
            SortField::AggregateId => a
                .aggregate()
                .map(|agg| agg.id)
                .cmp(&b.aggregate().map(|agg| agg.id)),
            SortField::AggregateVersion => a
                .aggregate()
                .map(|agg| agg.version)
                .cmp(&b.aggregate().map(|agg| agg.version)),
        };
        let ordering = match sorting.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Stably sorts events under a multi-key sort order.
pub fn sort_events(events: &mut [Event], sortings: &[Sorting]) {
    events.sort_by(|a, b| compare(a, b, sortings));
}

/// Builds a [`Query`] field by field.
///
/// Every setter is additive; calling a membership setter twice extends the
/// set. Unset fields stay unconstrained.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct QueryBuilder {
    query: Query,
}

impl QueryBuilder {
    /// Restricts the query to an event name.
    pub fn name(mut self, name: EventName) -> Self {
        self.query.names.push(name);
        self
    }

    /// Restricts the query to a set of event names.
    pub fn names(mut self, names: impl IntoIterator<Item = EventName>) -> Self {
        self.query.names.extend(names);
        self
    }

    /// Restricts the query to an event id.
    pub fn id(mut self, id: EventId) -> Self {
        self.query.ids.push(id);
        self
    }

    /// Restricts the query to a set of event ids.
    pub fn ids(mut self, ids: impl IntoIterator<Item = EventId>) -> Self {
        self.query.ids.extend(ids);
        self
    }

    /// Requires the event time to be one of the given instants.
    pub fn time(mut self, time: Timestamp) -> Self {
        self.query.times.exact.push(time);
        self
    }

    /// Inclusive lower time bound.
    pub fn time_min(mut self, min: Timestamp) -> Self {
        self.query.times.min = Some(min);
        self
    }

    /// Inclusive upper time bound.
    pub fn time_max(mut self, max: Timestamp) -> Self {
        self.query.times.max = Some(max);
        self
    }

    /// Adds an inclusive time range.
    pub fn time_range(mut self, start: Timestamp, end: Timestamp) -> Self {
        self.query.times.ranges.push(TimeRange { start, end });
        self
    }

    /// Restricts the query to an aggregate name.
    pub fn aggregate_name(mut self, name: AggregateName) -> Self {
        self.query.aggregate_names.push(name);
        self
    }

    /// Restricts the query to a set of aggregate names.
    pub fn aggregate_names(mut self, names: impl IntoIterator<Item = AggregateName>) -> Self {
        self.query.aggregate_names.extend(names);
        self
    }

    /// Restricts the query to an aggregate id.
    pub fn aggregate_id(mut self, id: Uuid) -> Self {
        self.query.aggregate_ids.push(id);
        self
    }

    /// Restricts the query to a set of aggregate ids.
    pub fn aggregate_ids(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.query.aggregate_ids.extend(ids);
        self
    }

    /// Restricts the query to one aggregate instance.
    pub fn aggregate(self, name: AggregateName, id: Uuid) -> Self {
        self.aggregate_name(name).aggregate_id(id)
    }

    /// Requires the aggregate version to be one of the given values.
    pub fn version(mut self, version: AggregateVersion) -> Self {
        self.query.aggregate_versions.exact.push(version);
        self
    }

    /// Adds a disjunctive inclusive lower version bound.
    pub fn version_min(mut self, min: AggregateVersion) -> Self {
        self.query.aggregate_versions.min.push(min);
        self
    }

    /// Adds a disjunctive inclusive upper version bound.
    pub fn version_max(mut self, max: AggregateVersion) -> Self {
        self.query.aggregate_versions.max.push(max);
        self
    }

    /// Adds an inclusive version range.
    pub fn version_range(mut self, start: AggregateVersion, end: AggregateVersion) -> Self {
        self.query
            .aggregate_versions
            .ranges
            .push(VersionRange { start, end });
        self
    }

    /// Appends a sort key. Earlier keys take precedence.
    pub fn sort_by(mut self, field: SortField, direction: SortDirection) -> Self {
        self.query.sortings.push(Sorting::new(field, direction));
        self
    }

    /// Finishes the query.
    pub fn build(self) -> Query {
        self.query
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Payload;
    use proptest::prelude::*;

    fn ename(s: &str) -> EventName {
        EventName::try_new(s).unwrap()
    }

    fn aname(s: &str) -> AggregateName {
        AggregateName::try_new(s).unwrap()
    }

    fn evt(name: &str) -> Event {
        Event::new(ename(name), Payload::new(()))
    }

    fn agg_evt(name: &str, agg: &str, id: Uuid, version: AggregateVersion) -> Event {
        evt(name).with_aggregate(aname(agg), id, version)
    }

    #[test]
    fn empty_query_matches_everything() {
        let q = Query::new();
        assert!(q.matches(&evt("anything")));
        assert!(q.matches(&agg_evt("anything", "order", Uuid::new_v4(), 12)));
    }

    #[test]
    fn name_and_id_membership() {
        let target = evt("foo");
        let q = Query::builder().name(ename("foo")).id(target.id()).build();
        assert!(q.matches(&target));
        assert!(!q.matches(&evt("foo"))); // different id
        assert!(!q.matches(&evt("bar")));
    }

    #[test]
    fn aggregate_constraints_fail_without_attribution() {
        let q = Query::builder().aggregate_name(aname("order")).build();
        assert!(!q.matches(&evt("foo")));
        assert!(q.matches(&agg_evt("foo", "order", Uuid::new_v4(), 1)));
        assert!(!q.matches(&agg_evt("foo", "cart", Uuid::new_v4(), 1)));
    }

    #[test]
    fn time_bounds_are_inclusive_at_nanosecond_precision() {
        let event = evt("foo");
        let t = event.time();

        assert!(Query::builder().time_min(t).build().matches(&event));
        assert!(Query::builder().time_max(t).build().matches(&event));
        assert!(!Query::builder()
            .time_min(t.minus_nanos(-1))
            .build()
            .matches(&event));
        assert!(!Query::builder()
            .time_max(t.minus_nanos(1))
            .build()
            .matches(&event));
        assert!(Query::builder().time_range(t, t).build().matches(&event));
    }

    #[test]
    fn version_min_and_max_are_disjunctive() {
        let id = Uuid::new_v4();
        let q = Query::builder().version_min(10).version_min(3).build();
        assert!(q.matches(&agg_evt("e", "a", id, 5))); // satisfies min 3
        assert!(!q.matches(&agg_evt("e", "a", id, 2)));

        let q = Query::builder().version_max(2).version_max(7).build();
        assert!(q.matches(&agg_evt("e", "a", id, 6))); // satisfies max 7
        assert!(!q.matches(&agg_evt("e", "a", id, 8)));
    }

    #[test]
    fn merge_unions_members_and_narrows_bounds() {
        let early = Timestamp::now();
        let late = early.minus_nanos(-1_000);

        let a = Query::builder().name(ename("a")).time_min(early).build();
        let b = Query::builder()
            .name(ename("b"))
            .name(ename("a"))
            .time_min(late)
            .time_max(late)
            .build();

        let merged = a.merge(b);
        assert_eq!(merged.names(), &[ename("a"), ename("b")]);
        assert_eq!(merged.times().min(), Some(late)); // later minimum wins
        assert_eq!(merged.times().max(), Some(late));
    }

    #[test]
    fn merge_identity_is_the_empty_query() {
        let q = Query::builder()
            .name(ename("a"))
            .version_min(2)
            .sort_by(SortField::Time, SortDirection::Desc)
            .build();
        assert_eq!(q.clone().merge(Query::new()), q);
        assert_eq!(Query::new().merge(q.clone()), q);
    }

    #[test]
    fn fingerprint_ignores_member_order_and_duplicates() {
        let a = Query::builder().name(ename("x")).name(ename("y")).build();
        let b = Query::builder()
            .name(ename("y"))
            .name(ename("x"))
            .name(ename("y"))
            .build();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_fields_and_sort_order() {
        let names = Query::builder().name(ename("x")).build();
        let aggregates = Query::builder().aggregate_name(aname("x")).build();
        assert_ne!(names.fingerprint(), aggregates.fingerprint());

        let asc = Query::builder()
            .sort_by(SortField::Time, SortDirection::Asc)
            .build();
        let desc = Query::builder()
            .sort_by(SortField::Time, SortDirection::Desc)
            .build();
        assert_ne!(asc.fingerprint(), desc.fingerprint());
        assert_ne!(Query::new().fingerprint(), asc.fingerprint());
    }

    #[test]
    fn multi_key_sort_is_stable_and_lexicographic() {
        let id_a = Uuid::from_u128(1);
        let id_b = Uuid::from_u128(2);
        let mut events = vec![
            agg_evt("e", "b", id_b, 2),
            agg_evt("e", "a", id_a, 2),
            agg_evt("e", "a", id_a, 1),
            agg_evt("e", "b", id_a, 1),
        ];

        sort_events(
            &mut events,
            &[
                Sorting::new(SortField::AggregateName, SortDirection::Asc),
                Sorting::new(SortField::AggregateVersion, SortDirection::Asc),
            ],
        );

        let keys: Vec<(String, AggregateVersion)> = events
            .iter()
            .map(|e| {
                let agg = e.aggregate().unwrap();
                (agg.name.to_string(), agg.version)
            })
            .collect();
        assert_eq!(
            keys,
            vec![
                ("a".into(), 1),
                ("a".into(), 2),
                ("b".into(), 1),
                ("b".into(), 2)
            ]
        );
    }

    proptest! {
        #[test]
        fn merge_is_associative_on_membership_fields(
            xs in prop::collection::vec("[a-z]{1,8}", 0..4),
            ys in prop::collection::vec("[a-z]{1,8}", 0..4),
            zs in prop::collection::vec("[a-z]{1,8}", 0..4),
        ) {
            let q = |names: &[String]| {
                Query::builder()
                    .names(names.iter().map(|n| ename(n)))
                    .build()
            };
            let left = q(&xs).merge(q(&ys)).merge(q(&zs));
            let right = q(&xs).merge(q(&ys).merge(q(&zs)));
            prop_assert_eq!(left, right);
        }

        #[test]
        fn fingerprint_is_stable_under_reordering(
            mut names in prop::collection::vec("[a-z]{1,8}", 1..6),
        ) {
            let forward = Query::builder().names(names.iter().map(|n| ename(n))).build();
            names.reverse();
            let backward = Query::builder().names(names.iter().map(|n| ename(n))).build();
            prop_assert_eq!(forward.fingerprint(), backward.fingerprint());
        }
    }
}
