//! # Property-Based Tests
//!
//! Determinism and idempotency invariants checked with proptest.

use agrotrace_core::{
    AttrValue, Attributes, CalculationRequest, Calculator, EventId, EventPayload, EventType,
    FactorCatalog, FactorQuery, FixedClock, LedgerStore, MemoryStore, NewFactor, NoopObserver,
    Resolver, TieBreak, VtiId, round2, trend_percent,
};
use chrono::{TimeZone, Utc};
use proptest::collection::vec;
use proptest::prelude::*;

fn clock() -> FixedClock {
    FixedClock::new(
        Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0)
            .single()
            .expect("date"),
    )
}

fn urea(year: i32, value: f64) -> NewFactor {
    NewFactor {
        region: "Global".into(),
        activity_type: EventType::INPUT_APPLIED.into(),
        input_type: Some("urea".into()),
        factor_type: Some("kg".into()),
        year,
        value,
        unit: "kg CO2e".into(),
        source: "test".into(),
    }
}

fn request(id: &str, quantity: f64) -> CalculationRequest {
    let event_type = EventType::new(EventType::INPUT_APPLIED);
    let mut raw = Attributes::new();
    raw.insert("inputType".into(), "urea".into());
    raw.insert("quantity".into(), AttrValue::Number(quantity));
    raw.insert("unit".into(), "kg".into());
    CalculationRequest {
        event_id: EventId::new(id),
        vti_id: None,
        user_ref: VtiId::new("farmer"),
        payload: EventPayload::classify(&event_type, raw).expect("payload"),
        event_type,
        timestamp: Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).single().expect("date"),
    }
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// The same factor table always resolves to the same factor, with the
    /// maximum year among candidates.
    #[test]
    fn resolution_is_deterministic(
        years in vec(2000i32..2030, 1..20),
        latest in any::<bool>(),
    ) {
        let tie_break = if latest { TieBreak::LatestInserted } else { TieBreak::EarliestInserted };
        let query = FactorQuery::new("Kenya", EventType::INPUT_APPLIED).input("urea").factor("kg");

        let mut first = MemoryStore::new();
        let mut second = MemoryStore::new();
        for (i, year) in years.iter().enumerate() {
            FactorCatalog::register(&mut first, urea(*year, i as f64)).expect("register");
            FactorCatalog::register(&mut second, urea(*year, i as f64)).expect("register");
        }

        let resolver = Resolver::new(tie_break);
        let a = resolver.resolve(&first, &query).expect("resolve").expect("found");
        let b = resolver.resolve(&second, &query).expect("resolve").expect("found");
        prop_assert_eq!(a.value, b.value);
        prop_assert_eq!(Some(a.year), years.iter().copied().max());
    }

    /// Any number of redeliveries yields exactly one record per event.
    #[test]
    fn redelivery_never_duplicates(
        deliveries in vec(0usize..5, 1..40),
        quantity in 0.1f64..1000.0,
    ) {
        let mut store = MemoryStore::new();
        FactorCatalog::register(&mut store, urea(2020, 1.5)).expect("register");
        let calculator = Calculator::default();
        let clock = clock();

        for event in &deliveries {
            let req = request(&format!("evt-{event}"), quantity);
            calculator
                .on_event_appended(&mut store, &clock, &req, None, &NoopObserver)
                .expect("calculate");
        }

        let mut distinct = deliveries.clone();
        distinct.sort_unstable();
        distinct.dedup();
        prop_assert_eq!(store.record_count().expect("count"), distinct.len());
    }

    /// Trend is zero without a previous total and otherwise matches the
    /// relative change.
    #[test]
    fn trend_matches_relative_change(
        current in 0.0f64..1e6,
        previous in 0.0f64..1e6,
    ) {
        let trend = trend_percent(current, previous);
        if previous > 0.0 {
            let back = previous * (1.0 + trend / 100.0);
            prop_assert!((back - current).abs() <= 1e-6 * current.max(1.0));
        } else {
            prop_assert_eq!(trend, 0.0);
        }
    }

    /// Rounding never moves a value by more than half a cent.
    #[test]
    fn rounding_is_tight(value in -1e6f64..1e6) {
        prop_assert!((round2(value) - value).abs() <= 0.005 + 1e-9);
    }
}
