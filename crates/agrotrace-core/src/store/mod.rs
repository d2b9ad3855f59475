//! # Ledger Storage
//!
//! The `LedgerStore` trait is the document store behind every component.
//! Two backends implement it:
//! - `MemoryStore`: BTreeMap collections (fast, volatile)
//! - `RedbStore`: redb tables with postcard-encoded documents (ACID, persistent)
//!
//! `StorageBackend` selects one at runtime and implements the trait by
//! delegation.
//!
//! ## Write guarantees
//!
//! - Events, records and pending markers are insert-only.
//! - `commit_record` is the idempotency point: the record, its unique
//!   source-event index entry and the VTI footprint increment are applied
//!   together or not at all.

mod memory;
mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use crate::{
    CarbonFootprintRecord, EmissionFactor, EventId, FactorId, PendingCalculation, TraceError,
    TraceEvent, Vti, VtiId,
};
use chrono::{DateTime, Utc};
use std::ops::Bound;
use std::path::Path;

// =============================================================================
// QUERY HELPERS
// =============================================================================

/// Position of an event in a per-VTI or per-field index.
///
/// Ordered by event time, then by ledger append sequence, so events sharing
/// a timestamp keep their append order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventCursor {
    pub timestamp_millis: i64,
    pub sequence: u64,
}

/// A range of event times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Bound<DateTime<Utc>>,
    pub end: Bound<DateTime<Utc>>,
}

impl TimeRange {
    /// `[start, end]`
    #[must_use]
    pub const fn closed(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Bound::Included(start),
            end: Bound::Included(end),
        }
    }

    /// `[start, end)`
    #[must_use]
    pub const fn half_open(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Bound::Included(start),
            end: Bound::Excluded(end),
        }
    }

    /// `[start, ∞)`
    #[must_use]
    pub const fn since(start: DateTime<Utc>) -> Self {
        Self {
            start: Bound::Included(start),
            end: Bound::Unbounded,
        }
    }

    #[must_use]
    pub fn contains(&self, t: &DateTime<Utc>) -> bool {
        let after_start = match &self.start {
            Bound::Included(s) => t >= s,
            Bound::Excluded(s) => t > s,
            Bound::Unbounded => true,
        };
        let before_end = match &self.end {
            Bound::Included(e) => t <= e,
            Bound::Excluded(e) => t < e,
            Bound::Unbounded => true,
        };
        after_start && before_end
    }

    /// Inclusive millisecond key bounds covering every instant in the range.
    #[must_use]
    pub fn millis_bounds(&self) -> (i64, i64) {
        let lower = match &self.start {
            Bound::Included(s) | Bound::Excluded(s) => s.timestamp_millis(),
            Bound::Unbounded => i64::MIN,
        };
        let upper = match &self.end {
            Bound::Included(e) | Bound::Excluded(e) => e.timestamp_millis(),
            Bound::Unbounded => i64::MAX,
        };
        (lower, upper)
    }
}

/// Result of an idempotent record commit.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// The record was written and the VTI footprint incremented.
    Inserted(CarbonFootprintRecord),
    /// A record for the same source event already existed; nothing changed.
    Existing(CarbonFootprintRecord),
}

// =============================================================================
// LEDGERSTORE TRAIT
// =============================================================================

/// Document collections of the traceability core.
///
/// All fallible operations return `Result<T, TraceError>`; backend failures
/// surface as `TraceError::Storage` and are the only retryable class.
pub trait LedgerStore {
    /// Insert a new VTI. Fails with `DuplicateVti` if the id is taken.
    fn insert_vti(&mut self, vti: &Vti) -> Result<(), TraceError>;

    /// Replace an existing VTI document. Fails with `VtiNotFound` if absent.
    fn update_vti(&mut self, vti: &Vti) -> Result<(), TraceError>;

    fn get_vti(&self, id: &VtiId) -> Result<Option<Vti>, TraceError>;

    fn vti_count(&self) -> Result<usize, TraceError>;

    /// Append an event. Fails with `DuplicateEvent` if the id is taken.
    fn append_event(&mut self, event: &TraceEvent) -> Result<(), TraceError>;

    fn get_event(&self, id: &EventId) -> Result<Option<TraceEvent>, TraceError>;

    /// One page of a VTI's events in ascending (time, sequence) order,
    /// strictly after `after`.
    fn events_for_vti_page(
        &self,
        vti: &VtiId,
        after: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<(EventCursor, TraceEvent)>, TraceError>;

    /// Events referencing a farm field within a time range, ascending.
    fn events_for_field(
        &self,
        field: &VtiId,
        range: TimeRange,
    ) -> Result<Vec<TraceEvent>, TraceError>;

    fn event_count(&self) -> Result<usize, TraceError>;

    /// One page of all events in ascending id order, strictly after `after`.
    fn events_page(
        &self,
        after: Option<&EventId>,
        limit: usize,
    ) -> Result<Vec<TraceEvent>, TraceError>;

    /// Insert a factor, assigning the next insertion revision.
    fn insert_factor(&mut self, factor: EmissionFactor) -> Result<EmissionFactor, TraceError>;

    /// Toggle the soft-delete flag of a factor.
    fn set_factor_active(
        &mut self,
        id: &FactorId,
        active: bool,
    ) -> Result<EmissionFactor, TraceError>;

    /// All factors (active or not) for a region and activity, in revision order.
    fn factors_for(
        &self,
        region: &str,
        activity_type: &str,
    ) -> Result<Vec<EmissionFactor>, TraceError>;

    /// All factors in revision order.
    fn factors(&self) -> Result<Vec<EmissionFactor>, TraceError>;

    /// Write a record unless one exists for the same source event.
    fn commit_record(
        &mut self,
        record: &CarbonFootprintRecord,
    ) -> Result<CommitOutcome, TraceError>;

    fn record_for_event(
        &self,
        event: &EventId,
    ) -> Result<Option<CarbonFootprintRecord>, TraceError>;

    /// A user's records with event time in `range`, ascending.
    fn records_for_user(
        &self,
        user: &VtiId,
        range: TimeRange,
    ) -> Result<Vec<CarbonFootprintRecord>, TraceError>;

    fn record_count(&self) -> Result<usize, TraceError>;

    /// Store a pending marker. Returns `false` if one already exists for the event.
    fn mark_pending(&mut self, pending: &PendingCalculation) -> Result<bool, TraceError>;

    fn pending(&self) -> Result<Vec<PendingCalculation>, TraceError>;
}

// =============================================================================
// STORAGE BACKEND
// =============================================================================

/// Runtime-selected storage backend.
#[derive(Debug)]
pub enum StorageBackend {
    /// In-memory collections (fast, volatile).
    InMemory(MemoryStore),
    /// Disk-backed redb database (ACID, persistent).
    Persistent(RedbStore),
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::InMemory(MemoryStore::new())
    }
}

impl StorageBackend {
    #[must_use]
    pub fn memory() -> Self {
        Self::default()
    }

    /// Open or create a redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        Ok(Self::Persistent(RedbStore::open(path)?))
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::Persistent(_))
    }
}

macro_rules! dispatch {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            StorageBackend::InMemory($store) => $call,
            StorageBackend::Persistent($store) => $call,
        }
    };
}

impl LedgerStore for StorageBackend {
    fn insert_vti(&mut self, vti: &Vti) -> Result<(), TraceError> {
        dispatch!(self, s => s.insert_vti(vti))
    }

    fn update_vti(&mut self, vti: &Vti) -> Result<(), TraceError> {
        dispatch!(self, s => s.update_vti(vti))
    }

    fn get_vti(&self, id: &VtiId) -> Result<Option<Vti>, TraceError> {
        dispatch!(self, s => s.get_vti(id))
    }

    fn vti_count(&self) -> Result<usize, TraceError> {
        dispatch!(self, s => s.vti_count())
    }

    fn append_event(&mut self, event: &TraceEvent) -> Result<(), TraceError> {
        dispatch!(self, s => s.append_event(event))
    }

    fn get_event(&self, id: &EventId) -> Result<Option<TraceEvent>, TraceError> {
        dispatch!(self, s => s.get_event(id))
    }

    fn events_for_vti_page(
        &self,
        vti: &VtiId,
        after: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<(EventCursor, TraceEvent)>, TraceError> {
        dispatch!(self, s => s.events_for_vti_page(vti, after, limit))
    }

    fn events_for_field(
        &self,
        field: &VtiId,
        range: TimeRange,
    ) -> Result<Vec<TraceEvent>, TraceError> {
        dispatch!(self, s => s.events_for_field(field, range))
    }

    fn event_count(&self) -> Result<usize, TraceError> {
        dispatch!(self, s => s.event_count())
    }

    fn events_page(
        &self,
        after: Option<&EventId>,
        limit: usize,
    ) -> Result<Vec<TraceEvent>, TraceError> {
        dispatch!(self, s => s.events_page(after, limit))
    }

    fn insert_factor(&mut self, factor: EmissionFactor) -> Result<EmissionFactor, TraceError> {
        dispatch!(self, s => s.insert_factor(factor))
    }

    fn set_factor_active(
        &mut self,
        id: &FactorId,
        active: bool,
    ) -> Result<EmissionFactor, TraceError> {
        dispatch!(self, s => s.set_factor_active(id, active))
    }

    fn factors_for(
        &self,
        region: &str,
        activity_type: &str,
    ) -> Result<Vec<EmissionFactor>, TraceError> {
        dispatch!(self, s => s.factors_for(region, activity_type))
    }

    fn factors(&self) -> Result<Vec<EmissionFactor>, TraceError> {
        dispatch!(self, s => s.factors())
    }

    fn commit_record(
        &mut self,
        record: &CarbonFootprintRecord,
    ) -> Result<CommitOutcome, TraceError> {
        dispatch!(self, s => s.commit_record(record))
    }

    fn record_for_event(
        &self,
        event: &EventId,
    ) -> Result<Option<CarbonFootprintRecord>, TraceError> {
        dispatch!(self, s => s.record_for_event(event))
    }

    fn records_for_user(
        &self,
        user: &VtiId,
        range: TimeRange,
    ) -> Result<Vec<CarbonFootprintRecord>, TraceError> {
        dispatch!(self, s => s.records_for_user(user, range))
    }

    fn record_count(&self) -> Result<usize, TraceError> {
        dispatch!(self, s => s.record_count())
    }

    fn mark_pending(&mut self, pending: &PendingCalculation) -> Result<bool, TraceError> {
        dispatch!(self, s => s.mark_pending(pending))
    }

    fn pending(&self) -> Result<Vec<PendingCalculation>, TraceError> {
        dispatch!(self, s => s.pending())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0)
            .single()
            .expect("date")
    }

    #[test]
    fn closed_range_includes_both_ends() {
        let range = TimeRange::closed(at(1), at(3));
        assert!(range.contains(&at(1)));
        assert!(range.contains(&at(3)));
        assert!(!range.contains(&at(4)));
    }

    #[test]
    fn half_open_range_excludes_end() {
        let range = TimeRange::half_open(at(1), at(3));
        assert!(range.contains(&at(1)));
        assert!(!range.contains(&at(3)));
        assert!(range.contains(&(at(3) - TimeDelta::nanoseconds(1))));
    }

    #[test]
    fn millis_bounds_cover_range() {
        let (lo, hi) = TimeRange::since(at(2)).millis_bounds();
        assert_eq!(lo, at(2).timestamp_millis());
        assert_eq!(hi, i64::MAX);
    }

    #[test]
    fn default_backend_is_memory() {
        let backend = StorageBackend::default();
        assert!(!backend.is_persistent());
        assert_eq!(backend.vti_count().expect("count"), 0);
    }
}
