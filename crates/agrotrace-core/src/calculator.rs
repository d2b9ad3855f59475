//! # Carbon Footprint Calculator
//!
//! Turns ledger events into carbon footprint records.
//!
//! Delivery of events is at-least-once, so every path here is idempotent:
//! - A record already committed for the source event is returned as
//!   `AlreadyRecorded`, and the store's `commit_record` re-checks the same
//!   key inside its write transaction
//! - `TRANSPORTED` events leave exactly one pending marker
//!
//! Factor misses and malformed payloads are soft outcomes. Only storage
//! failures come back as `Err`, and those are the caller's to redeliver.

use crate::clock::Clock;
use crate::primitives::{DATA_SOURCE_TRACEABILITY_EVENT, GLOBAL_REGION, INPUT_CATEGORY};
use crate::resolver::Resolver;
use crate::store::{CommitOutcome, LedgerStore};
use crate::{
    CarbonFootprintRecord, EventId, EventPayload, EventType, FactorQuery, FactorSnapshot,
    InputApplied, PendingCalculation, RecordId, TraceError, TraceEvent, VtiId,
};
use chrono::{DateTime, Utc};
use std::fmt;

/// Reason stored on `TRANSPORTED` pending markers.
pub const TRANSPORT_PENDING_REASON: &str = "transport emission calculation not available";

// =============================================================================
// REQUEST & OUTCOME
// =============================================================================

/// The view of an event the calculator works on.
///
/// Built from a ledger event, or directly from a submitted event document
/// that carries no subject VTI.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculationRequest {
    pub event_id: EventId,
    pub vti_id: Option<VtiId>,
    pub user_ref: VtiId,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl From<&TraceEvent> for CalculationRequest {
    fn from(event: &TraceEvent) -> Self {
        Self {
            event_id: event.id.clone(),
            vti_id: Some(event.vti_id.clone()),
            user_ref: event.actor_ref.clone(),
            event_type: event.event_type.clone(),
            timestamp: event.timestamp,
            payload: event.payload.clone(),
        }
    }
}

/// Why an event produced neither a record nor a pending marker.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// The event type is not calculated.
    NotRelevant,
    /// A required payload field is missing or malformed.
    MalformedPayload { field: &'static str, reason: String },
    /// No active factor for the key, regionally or globally.
    FactorNotFound(FactorQuery),
}

impl SkipReason {
    /// Whether the skip should be surfaced as a warning.
    #[must_use]
    pub fn is_warning(&self) -> bool {
        !matches!(self, Self::NotRelevant)
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRelevant => f.write_str("event type not relevant"),
            Self::MalformedPayload { field, reason } => write!(f, "invalid {field}: {reason}"),
            Self::FactorNotFound(q) => write!(
                f,
                "no emission factor for {}/{}/{} in {} or {GLOBAL_REGION}",
                q.activity_type,
                q.input_type.as_deref().unwrap_or("-"),
                q.factor_type.as_deref().unwrap_or("-"),
                q.region,
            ),
        }
    }
}

/// Result of processing one delivery of an event.
#[derive(Debug, Clone, PartialEq)]
pub enum CalculationOutcome {
    /// A new record was written and the VTI footprint incremented.
    Recorded(CarbonFootprintRecord),
    /// A record for this event already existed; nothing changed.
    AlreadyRecorded(CarbonFootprintRecord),
    /// A pending marker was written.
    Pending(PendingCalculation),
    /// A pending marker for this event already existed.
    AlreadyPending,
    /// Nothing was written.
    Skipped(SkipReason),
}

impl CalculationOutcome {
    /// The record this outcome refers to, if any.
    #[must_use]
    pub fn record(&self) -> Option<&CarbonFootprintRecord> {
        match self {
            Self::Recorded(r) | Self::AlreadyRecorded(r) => Some(r),
            _ => None,
        }
    }
}

// =============================================================================
// OBSERVER
// =============================================================================

/// Receives every calculation outcome.
pub trait CalculationObserver: Send + Sync {
    fn observe(&self, request: &CalculationRequest, outcome: &CalculationOutcome);
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl CalculationObserver for NoopObserver {
    fn observe(&self, _request: &CalculationRequest, _outcome: &CalculationOutcome) {}
}

// =============================================================================
// CALCULATOR
// =============================================================================

/// The Carbon Footprint Calculator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Calculator {
    resolver: Resolver,
}

impl Calculator {
    #[must_use]
    pub const fn new(resolver: Resolver) -> Self {
        Self { resolver }
    }

    /// Whether an event type is calculated at all.
    #[must_use]
    pub fn is_relevant(event_type: &EventType) -> bool {
        event_type.is(EventType::INPUT_APPLIED) || event_type.is(EventType::TRANSPORTED)
    }

    /// Process one delivery of an event.
    ///
    /// `region` is the acting user's region as resolved by the caller;
    /// `None` means `Global`.
    pub fn on_event_appended<S: LedgerStore + ?Sized>(
        &self,
        store: &mut S,
        clock: &dyn Clock,
        request: &CalculationRequest,
        region: Option<&str>,
        observer: &dyn CalculationObserver,
    ) -> Result<CalculationOutcome, TraceError> {
        let outcome = self.calculate(store, clock, request, region)?;
        observer.observe(request, &outcome);
        Ok(outcome)
    }

    fn calculate<S: LedgerStore + ?Sized>(
        &self,
        store: &mut S,
        clock: &dyn Clock,
        request: &CalculationRequest,
        region: Option<&str>,
    ) -> Result<CalculationOutcome, TraceError> {
        if !Self::is_relevant(&request.event_type) {
            return Ok(CalculationOutcome::Skipped(SkipReason::NotRelevant));
        }

        if let Some(existing) = store.record_for_event(&request.event_id)? {
            return Ok(CalculationOutcome::AlreadyRecorded(existing));
        }

        if request.event_type.is(EventType::TRANSPORTED) {
            let marker = PendingCalculation {
                event_id: request.event_id.clone(),
                vti_id: request.vti_id.clone(),
                user_ref: request.user_ref.clone(),
                event_type: request.event_type.clone(),
                timestamp: request.timestamp,
                reason: TRANSPORT_PENDING_REASON.to_string(),
                marked_at: clock.now(),
            };
            return Ok(if store.mark_pending(&marker)? {
                CalculationOutcome::Pending(marker)
            } else {
                CalculationOutcome::AlreadyPending
            });
        }

        let input = match Self::input_payload(request)? {
            Ok(input) => input,
            Err(skip) => return Ok(CalculationOutcome::Skipped(skip)),
        };

        let region = region
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(GLOBAL_REGION);
        let query = FactorQuery::new(region, EventType::INPUT_APPLIED)
            .input(input.input_type.as_str())
            .factor(input.unit.as_str());
        let Some(factor) = self.resolver.resolve(store, &query)? else {
            return Ok(CalculationOutcome::Skipped(SkipReason::FactorNotFound(
                query,
            )));
        };

        let emissions = input.quantity * factor.value;
        if !emissions.is_finite() {
            return Ok(CalculationOutcome::Skipped(SkipReason::MalformedPayload {
                field: "payload.quantity",
                reason: format!(
                    "{} times factor {} is out of range",
                    input.quantity, factor.value
                ),
            }));
        }

        let record = CarbonFootprintRecord {
            id: RecordId::generate(),
            source_event_id: request.event_id.clone(),
            vti_id: request.vti_id.clone(),
            user_ref: request.user_ref.clone(),
            event_type: request.event_type.clone(),
            timestamp: request.timestamp,
            calculated_emissions: emissions,
            unit: factor.unit.clone(),
            emission_factor_used: FactorSnapshot::from(&factor),
            data_source: DATA_SOURCE_TRACEABILITY_EVENT.to_string(),
            region: region.to_string(),
            category: INPUT_CATEGORY.to_string(),
            subcategory: input.input_type.clone(),
            details: request.payload.to_attributes(),
            created_at: clock.now(),
        };

        Ok(match store.commit_record(&record)? {
            CommitOutcome::Inserted(r) => CalculationOutcome::Recorded(r),
            CommitOutcome::Existing(r) => CalculationOutcome::AlreadyRecorded(r),
        })
    }

    /// Typed `INPUT_APPLIED` payload, or the field that makes it unusable.
    fn input_payload(
        request: &CalculationRequest,
    ) -> Result<Result<InputApplied, SkipReason>, TraceError> {
        if let EventPayload::InputApplied(ref p) = request.payload {
            return Ok(Ok(p.clone()));
        }
        match EventPayload::classify(&request.event_type, request.payload.to_attributes()) {
            Ok(EventPayload::InputApplied(p)) => Ok(Ok(p)),
            Ok(_) => Ok(Err(SkipReason::MalformedPayload {
                field: "payload",
                reason: "not an input payload".to_string(),
            })),
            Err(TraceError::Validation { field, reason }) => {
                Ok(Err(SkipReason::MalformedPayload { field, reason }))
            }
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::factors::FactorCatalog;
    use crate::store::MemoryStore;
    use crate::{AttrValue, Attributes, NewFactor};
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl CalculationObserver for Recording {
        fn observe(&self, request: &CalculationRequest, outcome: &CalculationOutcome) {
            let label = match outcome {
                CalculationOutcome::Recorded(_) => "recorded",
                CalculationOutcome::AlreadyRecorded(_) => "already_recorded",
                CalculationOutcome::Pending(_) => "pending",
                CalculationOutcome::AlreadyPending => "already_pending",
                CalculationOutcome::Skipped(_) => "skipped",
            };
            self.0
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(format!("{}:{label}", request.event_id));
        }
    }

    fn clock() -> FixedClock {
        FixedClock::new(
            Utc.with_ymd_and_hms(2024, 7, 15, 10, 0, 0)
                .single()
                .expect("date"),
        )
    }

    fn input_request(id: &str, input_type: &str, quantity: f64, unit: &str) -> CalculationRequest {
        let mut raw = Attributes::new();
        raw.insert("inputType".into(), input_type.into());
        raw.insert("quantity".into(), AttrValue::Number(quantity));
        raw.insert("unit".into(), unit.into());
        let event_type = EventType::new(EventType::INPUT_APPLIED);
        CalculationRequest {
            event_id: EventId::new(id),
            vti_id: None,
            user_ref: VtiId::new("farmer-1"),
            payload: EventPayload::classify(&event_type, raw).expect("payload"),
            event_type,
            timestamp: clock().now(),
        }
    }

    fn global_factor(store: &mut MemoryStore, input_type: &str, unit: &str, value: f64) {
        FactorCatalog::register(
            store,
            NewFactor {
                region: "Global".into(),
                activity_type: "INPUT_APPLIED".into(),
                input_type: Some(input_type.into()),
                factor_type: Some(unit.into()),
                year: 2020,
                value,
                unit: "kg CO2e".into(),
                source: "test".into(),
            },
        )
        .expect("factor");
    }

    #[test]
    fn computes_quantity_times_factor() {
        let mut store = MemoryStore::new();
        global_factor(&mut store, "urea", "kg", 1.5);

        let outcome = Calculator::default()
            .on_event_appended(
                &mut store,
                &clock(),
                &input_request("e1", "urea", 50.0, "kg"),
                None,
                &NoopObserver,
            )
            .expect("calculate");

        let record = outcome.record().expect("record");
        assert!(matches!(outcome, CalculationOutcome::Recorded(_)));
        assert_eq!(record.calculated_emissions, 75.0);
        assert_eq!(record.unit, "kg CO2e");
        assert_eq!(record.region, "Global");
        assert_eq!(record.category, "farm_inputs");
        assert_eq!(record.subcategory, "urea");
        assert_eq!(record.data_source, "traceability_event");
        assert_eq!(record.emission_factor_used.value, 1.5);
        assert_eq!(
            record.details.get("quantity"),
            Some(&AttrValue::Number(50.0))
        );
    }

    #[test]
    fn redelivery_is_a_no_op() {
        let mut store = MemoryStore::new();
        global_factor(&mut store, "urea", "kg", 1.5);
        let calculator = Calculator::default();
        let request = input_request("e1", "urea", 10.0, "kg");

        let first = calculator
            .on_event_appended(&mut store, &clock(), &request, None, &NoopObserver)
            .expect("first");
        let second = calculator
            .on_event_appended(&mut store, &clock(), &request, None, &NoopObserver)
            .expect("second");

        assert!(matches!(second, CalculationOutcome::AlreadyRecorded(_)));
        assert_eq!(first.record(), second.record());
        assert_eq!(store.record_count().expect("count"), 1);
    }

    #[test]
    fn irrelevant_events_are_skipped() {
        let mut store = MemoryStore::new();
        let mut request = input_request("e1", "urea", 10.0, "kg");
        request.event_type = EventType::new(EventType::HARVESTED);

        let outcome = Calculator::default()
            .on_event_appended(&mut store, &clock(), &request, None, &NoopObserver)
            .expect("calculate");
        assert_eq!(outcome, CalculationOutcome::Skipped(SkipReason::NotRelevant));
        assert!(!SkipReason::NotRelevant.is_warning());
    }

    #[test]
    fn missing_factor_is_soft() {
        let mut store = MemoryStore::new();
        let outcome = Calculator::default()
            .on_event_appended(
                &mut store,
                &clock(),
                &input_request("e1", "potash", 10.0, "kg"),
                Some("Kenya"),
                &NoopObserver,
            )
            .expect("calculate");

        let CalculationOutcome::Skipped(reason) = outcome else {
            unreachable!("expected a skip");
        };
        assert!(matches!(reason, SkipReason::FactorNotFound(ref q) if q.region == "Kenya"));
        assert!(reason.is_warning());
        assert_eq!(store.record_count().expect("count"), 0);
    }

    #[test]
    fn untyped_input_payload_names_missing_field() {
        let mut store = MemoryStore::new();
        let mut raw = Attributes::new();
        raw.insert("inputType".into(), "urea".into());
        raw.insert("quantity".into(), AttrValue::Number(3.0));
        let request = CalculationRequest {
            payload: EventPayload::Other(raw),
            ..input_request("e1", "urea", 1.0, "kg")
        };

        let outcome = Calculator::default()
            .on_event_appended(&mut store, &clock(), &request, None, &NoopObserver)
            .expect("calculate");
        assert!(matches!(
            outcome,
            CalculationOutcome::Skipped(SkipReason::MalformedPayload {
                field: "payload.unit",
                ..
            })
        ));
    }

    #[test]
    fn overflowing_emissions_are_not_recorded() {
        let mut store = MemoryStore::new();
        global_factor(&mut store, "urea", "kg", 10.0);

        let outcome = Calculator::default()
            .on_event_appended(
                &mut store,
                &clock(),
                &input_request("e1", "urea", 1e308, "kg"),
                None,
                &NoopObserver,
            )
            .expect("calculate");
        let CalculationOutcome::Skipped(reason) = outcome else {
            unreachable!("expected a skip");
        };
        assert!(matches!(
            reason,
            SkipReason::MalformedPayload {
                field: "payload.quantity",
                ..
            }
        ));
        assert!(reason.is_warning());
        assert_eq!(store.record_count().expect("count"), 0);
    }

    #[test]
    fn regional_factor_used_when_present() {
        let mut store = MemoryStore::new();
        global_factor(&mut store, "urea", "kg", 1.5);
        FactorCatalog::register(
            &mut store,
            NewFactor {
                region: "Kenya".into(),
                activity_type: "INPUT_APPLIED".into(),
                input_type: Some("urea".into()),
                factor_type: Some("kg".into()),
                year: 2019,
                value: 2.0,
                unit: "kg CO2e".into(),
                source: "KE inventory".into(),
            },
        )
        .expect("factor");

        let outcome = Calculator::default()
            .on_event_appended(
                &mut store,
                &clock(),
                &input_request("e1", "urea", 10.0, "kg"),
                Some("Kenya"),
                &NoopObserver,
            )
            .expect("calculate");
        let record = outcome.record().expect("record");
        assert_eq!(record.calculated_emissions, 20.0);
        assert_eq!(record.region, "Kenya");
    }

    #[test]
    fn transported_leaves_one_pending_marker() {
        let mut store = MemoryStore::new();
        let event_type = EventType::new(EventType::TRANSPORTED);
        let request = CalculationRequest {
            event_id: EventId::new("t1"),
            vti_id: Some(VtiId::new("batch-1")),
            user_ref: VtiId::new("farmer-1"),
            payload: EventPayload::classify(&event_type, Attributes::new()).expect("payload"),
            event_type,
            timestamp: clock().now(),
        };
        let observer = Recording::default();
        let calculator = Calculator::default();

        let first = calculator
            .on_event_appended(&mut store, &clock(), &request, None, &observer)
            .expect("first");
        let second = calculator
            .on_event_appended(&mut store, &clock(), &request, None, &observer)
            .expect("second");

        assert!(matches!(first, CalculationOutcome::Pending(ref p) if p.reason == TRANSPORT_PENDING_REASON));
        assert_eq!(second, CalculationOutcome::AlreadyPending);
        assert_eq!(store.pending().expect("pending").len(), 1);
        assert_eq!(
            *observer.0.lock().expect("lock"),
            vec!["t1:pending".to_string(), "t1:already_pending".to_string()]
        );
    }
}
