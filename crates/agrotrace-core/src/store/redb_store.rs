//! # redb-backed Ledger Store
//!
//! A disk-backed document store using the redb embedded database:
//! - ACID transactions
//! - Crash safety (copy-on-write B-trees)
//! - MVCC (concurrent readers, single writer)
//!
//! Documents are postcard-encoded. Secondary indexes use composite tuple
//! keys so range scans come back in (key, event time, sequence) order.
//!
//! The single-writer model is what makes `commit_record` safe under
//! concurrent completions: the dedup check, the record insert and the
//! footprint increment run in one write transaction.

use super::{CommitOutcome, EventCursor, LedgerStore, TimeRange};
use crate::{
    CarbonFootprintRecord, EmissionFactor, EventId, FactorId, PendingCalculation, TraceError,
    TraceEvent, Vti, VtiId,
};
use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, Table, TableDefinition,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::ops::Bound;
use std::path::Path;

/// VTI documents: id -> postcard bytes
const VTIS: TableDefinition<&str, &[u8]> = TableDefinition::new("vtis");

/// Event documents: id -> postcard bytes
const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

/// (vti, event time millis, sequence) -> event id
const EVENTS_BY_VTI: TableDefinition<(&str, i64, u64), &str> =
    TableDefinition::new("events_by_vti");

/// (farm field, event time millis, sequence) -> event id
const EVENTS_BY_FIELD: TableDefinition<(&str, i64, u64), &str> =
    TableDefinition::new("events_by_field");

/// Factor documents: revision -> postcard bytes
const FACTORS: TableDefinition<u64, &[u8]> = TableDefinition::new("factors");

/// Factor id -> revision
const FACTOR_INDEX: TableDefinition<&str, u64> = TableDefinition::new("factor_index");

/// Record documents: id -> postcard bytes
const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Unique source event id -> record id
const RECORDS_BY_SOURCE: TableDefinition<&str, &str> = TableDefinition::new("records_by_source");

/// (user, event time millis, sequence) -> record id
const RECORDS_BY_USER: TableDefinition<(&str, i64, u64), &str> =
    TableDefinition::new("records_by_user");

/// Pending markers: source event id -> postcard bytes
const PENDING: TableDefinition<&str, &[u8]> = TableDefinition::new("pending");

/// Counters: key -> value
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const NEXT_SEQUENCE: &str = "next_sequence";
const NEXT_REVISION: &str = "next_factor_revision";

fn storage(e: impl std::fmt::Display) -> TraceError {
    TraceError::Storage(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TraceError> {
    postcard::to_allocvec(value).map_err(|e| TraceError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TraceError> {
    postcard::from_bytes(bytes).map_err(|e| TraceError::Serialization(e.to_string()))
}

/// Read a counter and store its successor.
fn bump(table: &mut Table<'_, &'static str, u64>, key: &str) -> Result<u64, TraceError> {
    let current = table.get(key).map_err(storage)?.map(|v| v.value()).unwrap_or(0);
    table
        .insert(key, current.saturating_add(1))
        .map_err(storage)?;
    Ok(current)
}

/// A disk-backed ledger store using redb.
pub struct RedbStore {
    db: Database,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a ledger database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let db = Database::create(path.as_ref()).map_err(storage)?;

        // Initialize tables if they don't exist
        {
            let write_txn = db.begin_write().map_err(storage)?;
            write_txn.open_table(VTIS).map_err(storage)?;
            write_txn.open_table(EVENTS).map_err(storage)?;
            write_txn.open_table(EVENTS_BY_VTI).map_err(storage)?;
            write_txn.open_table(EVENTS_BY_FIELD).map_err(storage)?;
            write_txn.open_table(FACTORS).map_err(storage)?;
            write_txn.open_table(FACTOR_INDEX).map_err(storage)?;
            write_txn.open_table(RECORDS).map_err(storage)?;
            write_txn.open_table(RECORDS_BY_SOURCE).map_err(storage)?;
            write_txn.open_table(RECORDS_BY_USER).map_err(storage)?;
            write_txn.open_table(PENDING).map_err(storage)?;
            write_txn.open_table(METADATA).map_err(storage)?;
            write_txn.commit().map_err(storage)?;
        }

        Ok(Self { db })
    }

    fn get_doc<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>, TraceError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(table).map_err(storage)?;
        match table.get(key).map_err(storage)? {
            Some(bytes) => Ok(Some(decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn count(&self, table: TableDefinition<&str, &[u8]>) -> Result<usize, TraceError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(table).map_err(storage)?;
        Ok(table.len().map_err(storage)? as usize)
    }
}

// =============================================================================
// LEDGERSTORE TRAIT IMPLEMENTATION
// =============================================================================

impl LedgerStore for RedbStore {
    fn insert_vti(&mut self, vti: &Vti) -> Result<(), TraceError> {
        let bytes = encode(vti)?;
        let write_txn = self.db.begin_write().map_err(storage)?;
        {
            let mut table = write_txn.open_table(VTIS).map_err(storage)?;
            if table.get(vti.id.as_str()).map_err(storage)?.is_some() {
                return Err(TraceError::DuplicateVti(vti.id.clone()));
            }
            table
                .insert(vti.id.as_str(), bytes.as_slice())
                .map_err(storage)?;
        }
        write_txn.commit().map_err(storage)
    }

    fn update_vti(&mut self, vti: &Vti) -> Result<(), TraceError> {
        let bytes = encode(vti)?;
        let write_txn = self.db.begin_write().map_err(storage)?;
        {
            let mut table = write_txn.open_table(VTIS).map_err(storage)?;
            if table.get(vti.id.as_str()).map_err(storage)?.is_none() {
                return Err(TraceError::VtiNotFound(vti.id.clone()));
            }
            table
                .insert(vti.id.as_str(), bytes.as_slice())
                .map_err(storage)?;
        }
        write_txn.commit().map_err(storage)
    }

    fn get_vti(&self, id: &VtiId) -> Result<Option<Vti>, TraceError> {
        self.get_doc(VTIS, id.as_str())
    }

    fn vti_count(&self) -> Result<usize, TraceError> {
        self.count(VTIS)
    }

    fn append_event(&mut self, event: &TraceEvent) -> Result<(), TraceError> {
        let bytes = encode(event)?;
        let millis = event.timestamp.timestamp_millis();
        let write_txn = self.db.begin_write().map_err(storage)?;
        {
            let mut events = write_txn.open_table(EVENTS).map_err(storage)?;
            if events.get(event.id.as_str()).map_err(storage)?.is_some() {
                return Err(TraceError::DuplicateEvent(event.id.clone()));
            }
            let mut meta = write_txn.open_table(METADATA).map_err(storage)?;
            let sequence = bump(&mut meta, NEXT_SEQUENCE)?;

            events
                .insert(event.id.as_str(), bytes.as_slice())
                .map_err(storage)?;

            let mut by_vti = write_txn.open_table(EVENTS_BY_VTI).map_err(storage)?;
            by_vti
                .insert((event.vti_id.as_str(), millis, sequence), event.id.as_str())
                .map_err(storage)?;

            if let Some(ref field) = event.farm_field_id {
                let mut by_field = write_txn.open_table(EVENTS_BY_FIELD).map_err(storage)?;
                by_field
                    .insert((field.as_str(), millis, sequence), event.id.as_str())
                    .map_err(storage)?;
            }
        }
        write_txn.commit().map_err(storage)
    }

    fn get_event(&self, id: &EventId) -> Result<Option<TraceEvent>, TraceError> {
        self.get_doc(EVENTS, id.as_str())
    }

    fn events_for_vti_page(
        &self,
        vti: &VtiId,
        after: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<(EventCursor, TraceEvent)>, TraceError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let index = read_txn.open_table(EVENTS_BY_VTI).map_err(storage)?;
        let events = read_txn.open_table(EVENTS).map_err(storage)?;

        let key = vti.as_str();
        let lower = match after {
            Some(c) => Bound::Excluded((key, c.timestamp_millis, c.sequence)),
            None => Bound::Included((key, i64::MIN, 0u64)),
        };
        let upper = Bound::Included((key, i64::MAX, u64::MAX));

        let mut page = Vec::new();
        for entry in index.range((lower, upper)).map_err(storage)?.take(limit) {
            let (k, v) = entry.map_err(storage)?;
            let (_, timestamp_millis, sequence) = k.value();
            let event_id = v.value();
            let bytes = events
                .get(event_id)
                .map_err(storage)?
                .ok_or_else(|| TraceError::Storage(format!("dangling event index {event_id}")))?;
            page.push((
                EventCursor {
                    timestamp_millis,
                    sequence,
                },
                decode(bytes.value())?,
            ));
        }
        Ok(page)
    }

    fn events_for_field(
        &self,
        field: &VtiId,
        range: TimeRange,
    ) -> Result<Vec<TraceEvent>, TraceError> {
        let (lo, hi) = range.millis_bounds();
        if lo > hi {
            return Ok(Vec::new());
        }
        let read_txn = self.db.begin_read().map_err(storage)?;
        let index = read_txn.open_table(EVENTS_BY_FIELD).map_err(storage)?;
        let events = read_txn.open_table(EVENTS).map_err(storage)?;

        let key = field.as_str();
        let mut out = Vec::new();
        for entry in index
            .range((key, lo, 0u64)..=(key, hi, u64::MAX))
            .map_err(storage)?
        {
            let (_, v) = entry.map_err(storage)?;
            if let Some(bytes) = events.get(v.value()).map_err(storage)? {
                let event: TraceEvent = decode(bytes.value())?;
                if range.contains(&event.timestamp) {
                    out.push(event);
                }
            }
        }
        Ok(out)
    }

    fn event_count(&self) -> Result<usize, TraceError> {
        self.count(EVENTS)
    }

    fn events_page(
        &self,
        after: Option<&EventId>,
        limit: usize,
    ) -> Result<Vec<TraceEvent>, TraceError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let events = read_txn.open_table(EVENTS).map_err(storage)?;

        let lower: Bound<&str> = match after {
            Some(id) => Bound::Excluded(id.as_str()),
            None => Bound::Unbounded,
        };
        let mut page = Vec::new();
        for entry in events
            .range::<&str>((lower, Bound::Unbounded))
            .map_err(storage)?
            .take(limit)
        {
            let (_, v) = entry.map_err(storage)?;
            page.push(decode(v.value())?);
        }
        Ok(page)
    }

    fn insert_factor(&mut self, mut factor: EmissionFactor) -> Result<EmissionFactor, TraceError> {
        let write_txn = self.db.begin_write().map_err(storage)?;
        {
            let mut meta = write_txn.open_table(METADATA).map_err(storage)?;
            factor.revision = bump(&mut meta, NEXT_REVISION)?;

            let bytes = encode(&factor)?;
            let mut factors = write_txn.open_table(FACTORS).map_err(storage)?;
            factors
                .insert(factor.revision, bytes.as_slice())
                .map_err(storage)?;
            let mut index = write_txn.open_table(FACTOR_INDEX).map_err(storage)?;
            index
                .insert(factor.id.as_str(), factor.revision)
                .map_err(storage)?;
        }
        write_txn.commit().map_err(storage)?;
        Ok(factor)
    }

    fn set_factor_active(
        &mut self,
        id: &FactorId,
        active: bool,
    ) -> Result<EmissionFactor, TraceError> {
        let write_txn = self.db.begin_write().map_err(storage)?;
        let factor = {
            let index = write_txn.open_table(FACTOR_INDEX).map_err(storage)?;
            let revision = index
                .get(id.as_str())
                .map_err(storage)?
                .map(|v| v.value())
                .ok_or_else(|| TraceError::FactorNotFound(id.clone()))?;

            let mut factors = write_txn.open_table(FACTORS).map_err(storage)?;
            let mut factor: EmissionFactor = {
                let bytes = factors
                    .get(revision)
                    .map_err(storage)?
                    .ok_or_else(|| TraceError::FactorNotFound(id.clone()))?;
                decode(bytes.value())?
            };
            factor.is_active = active;
            let bytes = encode(&factor)?;
            factors
                .insert(revision, bytes.as_slice())
                .map_err(storage)?;
            factor
        };
        write_txn.commit().map_err(storage)?;
        Ok(factor)
    }

    fn factors_for(
        &self,
        region: &str,
        activity_type: &str,
    ) -> Result<Vec<EmissionFactor>, TraceError> {
        Ok(self
            .factors()?
            .into_iter()
            .filter(|f| f.region == region && f.activity_type == activity_type)
            .collect())
    }

    fn factors(&self) -> Result<Vec<EmissionFactor>, TraceError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(FACTORS).map_err(storage)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(storage)? {
            let (_, v) = entry.map_err(storage)?;
            out.push(decode(v.value())?);
        }
        Ok(out)
    }

    fn commit_record(
        &mut self,
        record: &CarbonFootprintRecord,
    ) -> Result<CommitOutcome, TraceError> {
        let write_txn = self.db.begin_write().map_err(storage)?;
        {
            let by_source = write_txn.open_table(RECORDS_BY_SOURCE).map_err(storage)?;
            let existing = by_source
                .get(record.source_event_id.as_str())
                .map_err(storage)?
                .map(|v| v.value().to_string());
            if let Some(existing_id) = existing {
                let records = write_txn.open_table(RECORDS).map_err(storage)?;
                let bytes = records
                    .get(existing_id.as_str())
                    .map_err(storage)?
                    .ok_or_else(|| {
                        TraceError::Storage(format!("dangling record index {existing_id}"))
                    })?;
                // Dropping the transaction aborts it; nothing was written.
                return Ok(CommitOutcome::Existing(decode(bytes.value())?));
            }
        }

        {
            let mut meta = write_txn.open_table(METADATA).map_err(storage)?;
            let sequence = bump(&mut meta, NEXT_SEQUENCE)?;

            let bytes = encode(record)?;
            let mut records = write_txn.open_table(RECORDS).map_err(storage)?;
            records
                .insert(record.id.as_str(), bytes.as_slice())
                .map_err(storage)?;

            let mut by_source = write_txn.open_table(RECORDS_BY_SOURCE).map_err(storage)?;
            by_source
                .insert(record.source_event_id.as_str(), record.id.as_str())
                .map_err(storage)?;

            let mut by_user = write_txn.open_table(RECORDS_BY_USER).map_err(storage)?;
            by_user
                .insert(
                    (
                        record.user_ref.as_str(),
                        record.timestamp.timestamp_millis(),
                        sequence,
                    ),
                    record.id.as_str(),
                )
                .map_err(storage)?;

            if let Some(ref vti_id) = record.vti_id {
                let mut vtis = write_txn.open_table(VTIS).map_err(storage)?;
                let current: Option<Vti> = match vtis.get(vti_id.as_str()).map_err(storage)? {
                    Some(bytes) => Some(decode(bytes.value())?),
                    None => None,
                };
                if let Some(mut vti) = current {
                    vti.metadata.carbon_footprint_kg_co2e += record.calculated_emissions;
                    let bytes = encode(&vti)?;
                    vtis.insert(vti_id.as_str(), bytes.as_slice())
                        .map_err(storage)?;
                }
            }
        }

        write_txn.commit().map_err(storage)?;
        Ok(CommitOutcome::Inserted(record.clone()))
    }

    fn record_for_event(
        &self,
        event: &EventId,
    ) -> Result<Option<CarbonFootprintRecord>, TraceError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let by_source = read_txn.open_table(RECORDS_BY_SOURCE).map_err(storage)?;
        let records = read_txn.open_table(RECORDS).map_err(storage)?;
        let Some(record_id) = by_source.get(event.as_str()).map_err(storage)? else {
            return Ok(None);
        };
        match records.get(record_id.value()).map_err(storage)? {
            Some(bytes) => Ok(Some(decode(bytes.value())?)),
            None => Ok(None),
        }
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
        let read_txn = self.db.begin_read().map_err(storage)?;
        let index = read_txn.open_table(RECORDS_BY_USER).map_err(storage)?;
        let records = read_txn.open_table(RECORDS).map_err(storage)?;

        let key = user.as_str();
        let mut out = Vec::new();
        for entry in index
            .range((key, lo, 0u64)..=(key, hi, u64::MAX))
            .map_err(storage)?
        {
            let (_, v) = entry.map_err(storage)?;
            if let Some(bytes) = records.get(v.value()).map_err(storage)? {
                let record: CarbonFootprintRecord = decode(bytes.value())?;
                if range.contains(&record.timestamp) {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    fn record_count(&self) -> Result<usize, TraceError> {
        self.count(RECORDS)
    }

    fn mark_pending(&mut self, pending: &PendingCalculation) -> Result<bool, TraceError> {
        let bytes = encode(pending)?;
        let write_txn = self.db.begin_write().map_err(storage)?;
        {
            let mut table = write_txn.open_table(PENDING).map_err(storage)?;
            if table
                .get(pending.event_id.as_str())
                .map_err(storage)?
                .is_some()
            {
                return Ok(false);
            }
            table
                .insert(pending.event_id.as_str(), bytes.as_slice())
                .map_err(storage)?;
        }
        write_txn.commit().map_err(storage)?;
        Ok(true)
    }

    fn pending(&self) -> Result<Vec<PendingCalculation>, TraceError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(PENDING).map_err(storage)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(storage)? {
            let (_, v) = entry.map_err(storage)?;
            out.push(decode(v.value())?);
        }
        Ok(out)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AttrValue, Attributes, EventPayload, EventType, FactorSnapshot, RecordId, VtiMetadata,
        VtiStatus, VtiType,
    };
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0)
            .single()
            .expect("date")
    }

    fn vti(id: &str, vti_type: VtiType) -> Vti {
        Vti {
            id: VtiId::new(id),
            vti_type,
            status: VtiStatus::Active,
            linked_vtis: BTreeSet::new(),
            metadata: VtiMetadata::default(),
            is_public_traceable: false,
            creation_time: t0(),
        }
    }

    fn event(id: &str, vti: &str, at: DateTime<Utc>) -> TraceEvent {
        let mut attrs = Attributes::new();
        attrs.insert("note".into(), AttrValue::from("x"));
        TraceEvent {
            id: EventId::new(id),
            vti_id: VtiId::new(vti),
            event_type: EventType::new(EventType::OBSERVED),
            timestamp: at,
            recorded_at: at,
            actor_ref: VtiId::new("farmer"),
            geo_location: None,
            payload: EventPayload::Other(attrs),
            farm_field_id: Some(VtiId::new("field-1")),
            is_public_traceable: false,
        }
    }

    fn record(id: &str, source: &str, vti: Option<&str>, emissions: f64) -> CarbonFootprintRecord {
        CarbonFootprintRecord {
            id: RecordId::new(id),
            source_event_id: EventId::new(source),
            vti_id: vti.map(VtiId::new),
            user_ref: VtiId::new("farmer"),
            event_type: EventType::new(EventType::INPUT_APPLIED),
            timestamp: t0(),
            calculated_emissions: emissions,
            unit: "kg CO2e".into(),
            emission_factor_used: FactorSnapshot {
                factor_id: FactorId::new("f"),
                value: 1.5,
                unit: "kg CO2e".into(),
                source: "test".into(),
                region: "Global".into(),
                year: 2020,
            },
            data_source: "traceability_event".into(),
            region: "Global".into(),
            category: "farm_inputs".into(),
            subcategory: "urea".into(),
            details: Attributes::new(),
            created_at: t0(),
        }
    }

    #[test]
    fn insert_and_get_vti() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("test.redb")).expect("open db");

        store.insert_vti(&vti("a", VtiType::FarmField)).expect("insert");
        let loaded = store.get_vti(&VtiId::new("a")).expect("get").expect("exists");
        assert_eq!(loaded.vti_type, VtiType::FarmField);
        assert_eq!(store.vti_count().expect("count"), 1);

        let dup = store.insert_vti(&vti("a", VtiType::User));
        assert!(matches!(dup, Err(TraceError::DuplicateVti(_))));
    }

    #[test]
    fn update_missing_vti_fails() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("test.redb")).expect("open db");
        let result = store.update_vti(&vti("ghost", VtiType::User));
        assert!(matches!(result, Err(TraceError::VtiNotFound(_))));
    }

    #[test]
    fn events_page_in_time_then_append_order() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("test.redb")).expect("open db");

        store.append_event(&event("late", "b1", t0() + TimeDelta::hours(2))).expect("append");
        store.append_event(&event("tie-1", "b1", t0())).expect("append");
        store.append_event(&event("tie-2", "b1", t0())).expect("append");
        store.append_event(&event("other", "b2", t0())).expect("append");

        let first = store
            .events_for_vti_page(&VtiId::new("b1"), None, 2)
            .expect("page");
        let ids: Vec<_> = first.iter().map(|(_, e)| e.id.as_str()).collect();
        assert_eq!(ids, vec!["tie-1", "tie-2"]);

        let rest = store
            .events_for_vti_page(&VtiId::new("b1"), first.last().map(|(c, _)| *c), 10)
            .expect("page");
        let ids: Vec<_> = rest.iter().map(|(_, e)| e.id.as_str()).collect();
        assert_eq!(ids, vec!["late"]);
    }

    #[test]
    fn all_events_paged_by_id() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("test.redb")).expect("open db");

        for id in ["c", "a", "b"] {
            store.append_event(&event(id, "b1", t0())).expect("append");
        }

        let first = store.events_page(None, 2).expect("page");
        let ids: Vec<_> = first.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let rest = store
            .events_page(first.last().map(|e| &e.id), 2)
            .expect("page");
        let ids: Vec<_> = rest.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);

        assert!(store.events_page(Some(&EventId::new("c")), 2).expect("page").is_empty());
    }

    #[test]
    fn duplicate_event_rejected_and_original_kept() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("test.redb")).expect("open db");

        store.append_event(&event("e1", "b1", t0())).expect("append");
        let again = store.append_event(&event("e1", "b9", t0() + TimeDelta::days(1)));
        assert!(matches!(again, Err(TraceError::DuplicateEvent(_))));

        let kept = store.get_event(&EventId::new("e1")).expect("get").expect("exists");
        assert_eq!(kept.vti_id, VtiId::new("b1"));
        assert_eq!(store.event_count().expect("count"), 1);
    }

    #[test]
    fn field_scan_respects_range() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("test.redb")).expect("open db");

        store
            .append_event(&event("old", "b1", t0() - TimeDelta::days(400)))
            .expect("append");
        store.append_event(&event("new", "b1", t0())).expect("append");

        let found = store
            .events_for_field(
                &VtiId::new("field-1"),
                TimeRange::since(t0() - TimeDelta::days(365)),
            )
            .expect("scan");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, EventId::new("new"));
    }

    #[test]
    fn commit_record_is_idempotent_and_increments_once() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("test.redb")).expect("open db");
        store.insert_vti(&vti("b1", VtiType::FarmBatch)).expect("insert");

        let first = store
            .commit_record(&record("r1", "e1", Some("b1"), 15.0))
            .expect("commit");
        assert!(matches!(first, CommitOutcome::Inserted(_)));

        let second = store
            .commit_record(&record("r2", "e1", Some("b1"), 15.0))
            .expect("commit");
        match second {
            CommitOutcome::Existing(r) => assert_eq!(r.id, RecordId::new("r1")),
            CommitOutcome::Inserted(_) => unreachable!("duplicate source event inserted"),
        }

        assert_eq!(store.record_count().expect("count"), 1);
        let batch = store.get_vti(&VtiId::new("b1")).expect("get").expect("exists");
        assert_eq!(batch.metadata.carbon_footprint_kg_co2e, 15.0);
    }

    #[test]
    fn records_for_user_filters_by_range() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("test.redb")).expect("open db");

        let mut early = record("r1", "e1", None, 1.0);
        early.timestamp = t0() - TimeDelta::days(40);
        store.commit_record(&early).expect("commit");
        store.commit_record(&record("r2", "e2", None, 2.0)).expect("commit");

        let recent = store
            .records_for_user(
                &VtiId::new("farmer"),
                TimeRange::closed(t0() - TimeDelta::days(30), t0()),
            )
            .expect("range");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, RecordId::new("r2"));
    }

    #[test]
    fn factor_revisions_survive_reopen() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("test.redb");

        let factor = EmissionFactor {
            id: FactorId::new("f1"),
            revision: 0,
            region: "Kenya".into(),
            activity_type: "INPUT_APPLIED".into(),
            input_type: Some("urea".into()),
            factor_type: Some("kg".into()),
            year: 2021,
            value: 1.2,
            unit: "kg CO2e".into(),
            source: "test".into(),
            is_active: true,
        };

        {
            let mut store = RedbStore::open(&db_path).expect("open db");
            store.insert_factor(factor.clone()).expect("insert");
            store.set_factor_active(&FactorId::new("f1"), false).expect("deactivate");
        }

        let mut store = RedbStore::open(&db_path).expect("reopen");
        let second = store
            .insert_factor(EmissionFactor {
                id: FactorId::new("f2"),
                ..factor
            })
            .expect("insert");
        assert_eq!(second.revision, 1);

        let all = store.factors_for("Kenya", "INPUT_APPLIED").expect("factors");
        assert_eq!(all.len(), 2);
        assert!(!all[0].is_active);
        assert!(all[1].is_active);
    }

    #[test]
    fn pending_marker_written_once() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("test.redb")).expect("open db");

        let marker = PendingCalculation {
            event_id: EventId::new("t1"),
            vti_id: Some(VtiId::new("b1")),
            user_ref: VtiId::new("farmer"),
            event_type: EventType::new(EventType::TRANSPORTED),
            timestamp: t0(),
            reason: "transport calculation not available".into(),
            marked_at: t0(),
        };
        assert!(store.mark_pending(&marker).expect("mark"));
        assert!(!store.mark_pending(&marker).expect("mark"));
        assert_eq!(store.pending().expect("pending").len(), 1);
    }

    #[test]
    fn documents_persist_after_reopen() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("test.redb");
        {
            let mut store = RedbStore::open(&db_path).expect("open db");
            store.insert_vti(&vti("b1", VtiType::FarmBatch)).expect("insert");
            store.append_event(&event("e1", "b1", t0())).expect("append");
            store
                .commit_record(&record("r1", "e1", Some("b1"), 4.5))
                .expect("commit");
        }

        let store = RedbStore::open(&db_path).expect("reopen");
        assert_eq!(store.vti_count().expect("count"), 1);
        assert_eq!(store.event_count().expect("count"), 1);
        assert!(
            store
                .record_for_event(&EventId::new("e1"))
                .expect("get")
                .is_some()
        );
    }
}
