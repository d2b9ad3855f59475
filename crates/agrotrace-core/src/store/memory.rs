//! # In-memory Ledger Store
//!
//! BTreeMap collections with the same secondary indexes as the redb backend.
//! Used by tests and by servers started with the `memory` backend.

use super::{CommitOutcome, EventCursor, LedgerStore, TimeRange};
use crate::{
    CarbonFootprintRecord, EmissionFactor, EventId, FactorId, PendingCalculation, RecordId,
    TraceError, TraceEvent, Vti, VtiId,
};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Volatile document store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    vtis: BTreeMap<VtiId, Vti>,
    events: BTreeMap<EventId, TraceEvent>,
    /// (vti, cursor) -> event id
    events_by_vti: BTreeMap<(VtiId, EventCursor), EventId>,
    /// (farm field, cursor) -> event id
    events_by_field: BTreeMap<(VtiId, EventCursor), EventId>,
    /// Shared append sequence for events and records.
    next_sequence: u64,
    /// revision -> factor
    factors: BTreeMap<u64, EmissionFactor>,
    factor_index: BTreeMap<FactorId, u64>,
    records: BTreeMap<RecordId, CarbonFootprintRecord>,
    /// Unique source event -> record
    records_by_source: BTreeMap<EventId, RecordId>,
    records_by_user: BTreeMap<(VtiId, EventCursor), RecordId>,
    pending: BTreeMap<EventId, PendingCalculation>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_cursor(&mut self, timestamp_millis: i64) -> EventCursor {
        let cursor = EventCursor {
            timestamp_millis,
            sequence: self.next_sequence,
        };
        self.next_sequence = self.next_sequence.saturating_add(1);
        cursor
    }

    fn scan(
        index: &BTreeMap<(VtiId, EventCursor), EventId>,
        key: &VtiId,
        range: &TimeRange,
    ) -> Vec<EventId> {
        let (lo, hi) = range.millis_bounds();
        if lo > hi {
            return Vec::new();
        }
        let lower = (
            key.clone(),
            EventCursor {
                timestamp_millis: lo,
                sequence: 0,
            },
        );
        let upper = (
            key.clone(),
            EventCursor {
                timestamp_millis: hi,
                sequence: u64::MAX,
            },
        );
        index
            .range(lower..=upper)
            .map(|(_, id)| id.clone())
            .collect()
    }
}

impl LedgerStore for MemoryStore {
    fn insert_vti(&mut self, vti: &Vti) -> Result<(), TraceError> {
        if self.vtis.contains_key(&vti.id) {
            return Err(TraceError::DuplicateVti(vti.id.clone()));
        }
        self.vtis.insert(vti.id.clone(), vti.clone());
        Ok(())
    }

    fn update_vti(&mut self, vti: &Vti) -> Result<(), TraceError> {
        match self.vtis.get_mut(&vti.id) {
            Some(existing) => {
                *existing = vti.clone();
                Ok(())
            }
            None => Err(TraceError::VtiNotFound(vti.id.clone())),
        }
    }

    fn get_vti(&self, id: &VtiId) -> Result<Option<Vti>, TraceError> {
        Ok(self.vtis.get(id).cloned())
    }

    fn vti_count(&self) -> Result<usize, TraceError> {
        Ok(self.vtis.len())
    }

    fn append_event(&mut self, event: &TraceEvent) -> Result<(), TraceError> {
        if self.events.contains_key(&event.id) {
            return Err(TraceError::DuplicateEvent(event.id.clone()));
        }
        let cursor = self.next_cursor(event.timestamp.timestamp_millis());
        self.events_by_vti
            .insert((event.vti_id.clone(), cursor), event.id.clone());
        if let Some(ref field) = event.farm_field_id {
            self.events_by_field
                .insert((field.clone(), cursor), event.id.clone());
        }
        self.events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    fn get_event(&self, id: &EventId) -> Result<Option<TraceEvent>, TraceError> {
        Ok(self.events.get(id).cloned())
    }

    fn events_for_vti_page(
        &self,
        vti: &VtiId,
        after: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<(EventCursor, TraceEvent)>, TraceError> {
        let lower = match after {
            Some(cursor) => Bound::Excluded((vti.clone(), cursor)),
            None => Bound::Included((
                vti.clone(),
                EventCursor {
                    timestamp_millis: i64::MIN,
                    sequence: 0,
                },
            )),
        };
        let upper = Bound::Included((
            vti.clone(),
            EventCursor {
                timestamp_millis: i64::MAX,
                sequence: u64::MAX,
            },
        ));

        let mut page = Vec::new();
        for ((_, cursor), id) in self.events_by_vti.range((lower, upper)).take(limit) {
            let event = self
                .events
                .get(id)
                .ok_or_else(|| TraceError::Storage(format!("dangling event index {id}")))?;
            page.push((*cursor, event.clone()));
        }
        Ok(page)
    }

    fn events_for_field(
        &self,
        field: &VtiId,
        range: TimeRange,
    ) -> Result<Vec<TraceEvent>, TraceError> {
        Ok(Self::scan(&self.events_by_field, field, &range)
            .into_iter()
            .filter_map(|id| self.events.get(&id))
            .filter(|e| range.contains(&e.timestamp))
            .cloned()
            .collect())
    }

    fn event_count(&self) -> Result<usize, TraceError> {
        Ok(self.events.len())
    }

    fn events_page(
        &self,
        after: Option<&EventId>,
        limit: usize,
    ) -> Result<Vec<TraceEvent>, TraceError> {
        let lower = match after {
            Some(id) => Bound::Excluded(id.clone()),
            None => Bound::Unbounded,
        };
        Ok(self
            .events
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, event)| event.clone())
            .collect())
    }

    fn insert_factor(&mut self, mut factor: EmissionFactor) -> Result<EmissionFactor, TraceError> {
        let revision = self
            .factors
            .last_key_value()
            .map(|(r, _)| r.saturating_add(1))
            .unwrap_or(0);
        factor.revision = revision;
        self.factor_index.insert(factor.id.clone(), revision);
        self.factors.insert(revision, factor.clone());
        Ok(factor)
    }

    fn set_factor_active(
        &mut self,
        id: &FactorId,
        active: bool,
    ) -> Result<EmissionFactor, TraceError> {
        let revision = self
            .factor_index
            .get(id)
            .ok_or_else(|| TraceError::FactorNotFound(id.clone()))?;
        let factor = self
            .factors
            .get_mut(revision)
            .ok_or_else(|| TraceError::FactorNotFound(id.clone()))?;
        factor.is_active = active;
        Ok(factor.clone())
    }

    fn factors_for(
        &self,
        region: &str,
        activity_type: &str,
    ) -> Result<Vec<EmissionFactor>, TraceError> {
        Ok(self
            .factors
            .values()
            .filter(|f| f.region == region && f.activity_type == activity_type)
            .cloned()
            .collect())
    }

    fn factors(&self) -> Result<Vec<EmissionFactor>, TraceError> {
        Ok(self.factors.values().cloned().collect())
    }

    fn commit_record(
        &mut self,
        record: &CarbonFootprintRecord,
    ) -> Result<CommitOutcome, TraceError> {
        if let Some(existing) = self
            .records_by_source
            .get(&record.source_event_id)
            .and_then(|id| self.records.get(id))
        {
            return Ok(CommitOutcome::Existing(existing.clone()));
        }

        let cursor = self.next_cursor(record.timestamp.timestamp_millis());
        self.records_by_source
            .insert(record.source_event_id.clone(), record.id.clone());
        self.records_by_user
            .insert((record.user_ref.clone(), cursor), record.id.clone());
        self.records.insert(record.id.clone(), record.clone());

        if let Some(vti) = record.vti_id.as_ref().and_then(|id| self.vtis.get_mut(id)) {
            vti.metadata.carbon_footprint_kg_co2e += record.calculated_emissions;
        }

        Ok(CommitOutcome::Inserted(record.clone()))
    }

    fn record_for_event(
        &self,
        event: &EventId,
    ) -> Result<Option<CarbonFootprintRecord>, TraceError> {
        Ok(self
            .records_by_source
            .get(event)
            .and_then(|id| self.records.get(id))
            .cloned())
    }

    fn records_for_user(
        &self,
        user: &VtiId,
        range: TimeRange,
    ) -> Result<Vec<CarbonFootprintRecord>, TraceError> {
        let (lo, hi) = range.millis_bounds();
        if lo > hi {
            return Ok(Vec::new());
        }
        let lower = (
            user.clone(),
            EventCursor {
                timestamp_millis: lo,
                sequence: 0,
            },
        );
        let upper = (
            user.clone(),
            EventCursor {
                timestamp_millis: hi,
                sequence: u64::MAX,
            },
        );
        Ok(self
            .records_by_user
            .range(lower..=upper)
            .filter_map(|(_, id)| self.records.get(id))
            .filter(|r| range.contains(&r.timestamp))
            .cloned()
            .collect())
    }

    fn record_count(&self) -> Result<usize, TraceError> {
        Ok(self.records.len())
    }

    fn mark_pending(&mut self, pending: &PendingCalculation) -> Result<bool, TraceError> {
        if self.pending.contains_key(&pending.event_id) {
            return Ok(false);
        }
        self.pending
            .insert(pending.event_id.clone(), pending.clone());
        Ok(true)
    }

    fn pending(&self) -> Result<Vec<PendingCalculation>, TraceError> {
        Ok(self.pending.values().cloned().collect())
    }
}
