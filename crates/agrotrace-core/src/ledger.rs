//! # Traceability Event Ledger
//!
//! Append-only store of what happened to each VTI.
//!
//! - Appends are validated before anything is written
//! - Written events are never mutated or deleted
//! - Per-VTI reads come back in ascending (event time, append order)

use crate::clock::Clock;
use crate::primitives::{EVENT_PAGE_SIZE, MAX_EVENT_TYPE_LENGTH};
use crate::store::{EventCursor, LedgerStore, TimeRange};
use crate::{EventId, EventPayload, NewEvent, TraceError, TraceEvent, VtiId};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// The Traceability Event Ledger.
pub struct Ledger;

impl Ledger {
    /// Validate and append an event.
    ///
    /// The ledger write time is taken from `clock`; event time defaults to it.
    ///
    /// # Errors
    /// - `Validation` for an empty or oversized event type, bad coordinates
    ///   or a malformed typed payload
    /// - `VtiNotFound` for an unknown subject or farm field
    /// - `ActorNotFound` / `InvalidActor` for the acting VTI
    /// - `DuplicateEvent` if a caller-supplied id is taken
    pub fn append<S: LedgerStore + ?Sized>(
        store: &mut S,
        clock: &dyn Clock,
        new: NewEvent,
    ) -> Result<TraceEvent, TraceError> {
        let event_type = new.event_type;
        if event_type.as_str().trim().is_empty() {
            return Err(TraceError::validation("eventType", "must not be empty"));
        }
        if event_type.as_str().len() > MAX_EVENT_TYPE_LENGTH {
            return Err(TraceError::validation(
                "eventType",
                format!("longer than {MAX_EVENT_TYPE_LENGTH} characters"),
            ));
        }

        if store.get_vti(&new.vti_id)?.is_none() {
            return Err(TraceError::VtiNotFound(new.vti_id));
        }
        let actor = store
            .get_vti(&new.actor_ref)?
            .ok_or_else(|| TraceError::ActorNotFound(new.actor_ref.clone()))?;
        if !actor.vti_type.is_actor() {
            return Err(TraceError::InvalidActor {
                id: actor.id,
                vti_type: actor.vti_type,
            });
        }
        if let Some(ref field) = new.farm_field_id {
            if store.get_vti(field)?.is_none() {
                return Err(TraceError::VtiNotFound(field.clone()));
            }
        }
        if let Some(ref geo) = new.geo_location {
            geo.validate()?;
        }

        let payload = EventPayload::classify(&event_type, new.payload)?;

        let id = new.id.unwrap_or_else(EventId::generate);
        if id.as_str().trim().is_empty() {
            return Err(TraceError::validation("id", "must not be empty"));
        }

        let recorded_at = clock.now();
        let event = TraceEvent {
            id,
            vti_id: new.vti_id,
            event_type,
            timestamp: new.timestamp.unwrap_or(recorded_at),
            recorded_at,
            actor_ref: new.actor_ref,
            geo_location: new.geo_location,
            payload,
            farm_field_id: new.farm_field_id,
            is_public_traceable: new.is_public_traceable,
        };
        store.append_event(&event)?;
        Ok(event)
    }

    /// Fetch a single event.
    pub fn get<S: LedgerStore + ?Sized>(
        store: &S,
        id: &EventId,
    ) -> Result<Option<TraceEvent>, TraceError> {
        store.get_event(id)
    }

    /// Lazy, restartable scan of a VTI's events in ascending order.
    ///
    /// Clone the stream before consuming it to re-run the scan.
    #[must_use]
    pub fn query_by_vti<'a, S: LedgerStore + ?Sized>(
        store: &'a S,
        vti: &VtiId,
    ) -> VtiEventStream<'a, S> {
        VtiEventStream::new(store, vti.clone(), EVENT_PAGE_SIZE)
    }

    /// Events on a farm field since `since` whose type is in `event_types`.
    pub fn query_by_field<S: LedgerStore + ?Sized>(
        store: &S,
        field: &VtiId,
        event_types: &[&str],
        since: DateTime<Utc>,
    ) -> Result<Vec<TraceEvent>, TraceError> {
        Ok(store
            .events_for_field(field, TimeRange::since(since))?
            .into_iter()
            .filter(|e| event_types.iter().any(|t| e.event_type.is(t)))
            .collect())
    }
}

// =============================================================================
// PAGED STREAM
// =============================================================================

/// Iterator over one VTI's events, reading the store page by page.
///
/// Yields at most one error, then ends.
pub struct VtiEventStream<'a, S: ?Sized> {
    store: &'a S,
    vti: VtiId,
    page_size: usize,
    cursor: Option<EventCursor>,
    buffer: VecDeque<TraceEvent>,
    exhausted: bool,
}

impl<'a, S: LedgerStore + ?Sized> VtiEventStream<'a, S> {
    fn new(store: &'a S, vti: VtiId, page_size: usize) -> Self {
        Self {
            store,
            vti,
            page_size: page_size.max(1),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Use a different page size (minimum 1).
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn fill(&mut self) -> Result<(), TraceError> {
        let page = self
            .store
            .events_for_vti_page(&self.vti, self.cursor, self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        for (cursor, event) in page {
            self.cursor = Some(cursor);
            self.buffer.push_back(event);
        }
        Ok(())
    }
}

impl<S: ?Sized> Clone for VtiEventStream<'_, S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store,
            vti: self.vti.clone(),
            page_size: self.page_size,
            cursor: self.cursor,
            buffer: self.buffer.clone(),
            exhausted: self.exhausted,
        }
    }
}

impl<S: LedgerStore + ?Sized> Iterator for VtiEventStream<'_, S> {
    type Item = Result<TraceEvent, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

// =============================================================================
// TESTS
// =============================================================================
