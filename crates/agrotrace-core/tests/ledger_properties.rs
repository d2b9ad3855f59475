//! # Ledger Property Tests
//!
//! The behavioural guarantees of the engine, each run against both the
//! in-memory and the redb backend.
//!
//! ## Groups
//! - Idempotency
//! - Factor resolution
//! - Provenance graph
//! - Calculation
//! - Aggregation
//! - Harvest linking
//! - End-to-end

use agrotrace_core::{
    Aggregator, AttrValue, CalculationOutcome, CalculationRequest, Calculator, Clock, EventId,
    EventType, FactorCatalog, FactorQuery, FixedClock, HarvestRequest, Ledger, LedgerStore,
    NewEvent, NewFactor, NewVti, NoopObserver, PeriodType, Registry, Resolver, StorageBackend,
    TraceError, Vti, VtiId, VtiMetadata, VtiStatus, VtiType,
};
use chrono::{TimeDelta, TimeZone, Utc};
use std::collections::BTreeSet;
use tempfile::TempDir;

// =============================================================================
// HARNESS
// =============================================================================

/// Run `check` once per backend.
fn on_each_backend(check: impl Fn(&mut StorageBackend)) {
    let mut memory = StorageBackend::memory();
    check(&mut memory);

    let dir = TempDir::new().expect("temp dir");
    let mut redb = StorageBackend::open(dir.path().join("ledger.redb")).expect("open redb");
    check(&mut redb);
}

fn clock() -> FixedClock {
    FixedClock::new(
        Utc.with_ymd_and_hms(2024, 8, 20, 14, 30, 0)
            .single()
            .expect("date"),
    )
}

fn factor(region: &str, input_type: &str, unit: &str, year: i32, value: f64) -> NewFactor {
    NewFactor {
        region: region.into(),
        activity_type: EventType::INPUT_APPLIED.into(),
        input_type: Some(input_type.into()),
        factor_type: Some(unit.into()),
        year,
        value,
        unit: "kg CO2e".into(),
        source: "test inventory".into(),
    }
}

fn actor(store: &mut StorageBackend, clock: &FixedClock, id: &str) -> VtiId {
    Registry::create(store, clock, NewVti::new(VtiType::User).with_id(id))
        .expect("actor")
        .id
}

fn input_event(vti: &VtiId, actor: &VtiId, input_type: &str, quantity: f64) -> NewEvent {
    NewEvent::new(vti.clone(), EventType::INPUT_APPLIED, actor.clone())
        .with_attr("inputType", input_type)
        .with_attr("quantity", AttrValue::Number(quantity))
        .with_attr("unit", "kg")
}

// =============================================================================
// IDEMPOTENCY
// =============================================================================

mod idempotency {
    use super::*;

    /// Calculating the same event twice yields exactly one record.
    #[test]
    fn double_delivery_single_record() {
        on_each_backend(|store| {
            let clock = clock();
            FactorCatalog::register(store, factor("Global", "urea", "kg", 2020, 2.0))
                .expect("factor");
            let farmer = actor(store, &clock, "farmer");
            let batch = Registry::create(store, &clock, NewVti::new(VtiType::FarmBatch))
                .expect("batch")
                .id;
            let event = Ledger::append(store, &clock, input_event(&batch, &farmer, "urea", 4.0))
                .expect("append");

            let calculator = Calculator::default();
            let request = CalculationRequest::from(&event);
            for _ in 0..2 {
                calculator
                    .on_event_appended(store, &clock, &request, None, &NoopObserver)
                    .expect("calculate");
            }

            assert_eq!(store.record_count().expect("count"), 1);
            let batch = store.get_vti(&batch).expect("get").expect("batch");
            assert_eq!(batch.metadata.carbon_footprint_kg_co2e, 8.0);
        });
    }

    /// A record committed between the pre-check and the commit is kept.
    #[test]
    fn commit_keeps_first_record() {
        on_each_backend(|store| {
            let clock = clock();
            FactorCatalog::register(store, factor("Global", "urea", "kg", 2020, 1.0))
                .expect("factor");
            let request = CalculationRequest {
                event_id: EventId::new("evt-1"),
                vti_id: None,
                user_ref: VtiId::new("farmer"),
                event_type: EventType::new(EventType::INPUT_APPLIED),
                timestamp: clock.now(),
                payload: agrotrace_core::EventPayload::classify(
                    &EventType::new(EventType::INPUT_APPLIED),
                    input_event(&VtiId::new("b"), &VtiId::new("a"), "urea", 3.0).payload,
                )
                .expect("payload"),
            };

            let first = Calculator::default()
                .on_event_appended(store, &clock, &request, None, &NoopObserver)
                .expect("first");
            let CalculationOutcome::Recorded(original) = first else {
                unreachable!("first delivery records");
            };

            let mut racing = original.clone();
            racing.id = agrotrace_core::RecordId::new("late");
            let outcome = store.commit_record(&racing).expect("commit");
            assert_eq!(outcome, agrotrace_core::CommitOutcome::Existing(original));
        });
    }
}

// =============================================================================
// FACTOR RESOLUTION
// =============================================================================

mod resolution {
    use super::*;

    /// A Kenya query with only a Global factor resolves to the Global one.
    #[test]
    fn fallback_to_global() {
        on_each_backend(|store| {
            FactorCatalog::register(store, factor("Global", "urea", "kg", 2020, 1.3))
                .expect("factor");
            let found = Resolver::default()
                .resolve(
                    store,
                    &FactorQuery::new("Kenya", EventType::INPUT_APPLIED)
                        .input("urea")
                        .factor("kg"),
                )
                .expect("resolve")
                .expect("found");
            assert_eq!(found.region, "Global");
        });
    }

    /// 2018 and 2021 factors with identical keys resolve to 2021.
    #[test]
    fn most_recent_year() {
        on_each_backend(|store| {
            FactorCatalog::register(store, factor("Global", "urea", "kg", 2018, 1.0))
                .expect("factor");
            FactorCatalog::register(store, factor("Global", "urea", "kg", 2021, 1.4))
                .expect("factor");
            let found = Resolver::default()
                .resolve(
                    store,
                    &FactorQuery::new("Global", EventType::INPUT_APPLIED)
                        .input("urea")
                        .factor("kg"),
                )
                .expect("resolve")
                .expect("found");
            assert_eq!(found.year, 2021);
            assert_eq!(found.value, 1.4);
        });
    }
}

// =============================================================================
// PROVENANCE GRAPH
// =============================================================================

mod provenance {
    use super::*;

    /// Creating a batch linked to A fails when A already reaches the batch id.
    #[test]
    fn cycle_rejected_on_create() {
        on_each_backend(|store| {
            let clock = clock();
            // A was imported with a forward reference to the batch id.
            let a = Vti {
                id: VtiId::new("A"),
                vti_type: VtiType::ProductLot,
                status: VtiStatus::Active,
                linked_vtis: BTreeSet::from([VtiId::new("batch-9")]),
                metadata: VtiMetadata::default(),
                is_public_traceable: false,
                creation_time: clock.now(),
            };
            store.insert_vti(&a).expect("insert A");

            let err = Registry::create(
                store,
                &clock,
                NewVti::new(VtiType::FarmBatch)
                    .with_id("batch-9")
                    .linked_to(a.id.clone()),
            )
            .expect_err("cycle");
            assert!(matches!(err, TraceError::Cycle { .. }));
            assert!(store.get_vti(&VtiId::new("batch-9")).expect("get").is_none());
        });
    }

    /// Linking back up a chain is rejected; the chain is untouched.
    #[test]
    fn cycle_rejected_on_link() {
        on_each_backend(|store| {
            let clock = clock();
            let mut prev = Registry::create(store, &clock, NewVti::new(VtiType::FarmField))
                .expect("root")
                .id;
            let root = prev.clone();
            for _ in 0..5 {
                prev = Registry::create(
                    store,
                    &clock,
                    NewVti::new(VtiType::ProductLot).linked_to(prev.clone()),
                )
                .expect("chain")
                .id;
            }

            let err = Registry::link(store, &root, std::slice::from_ref(&prev))
                .expect_err("cycle");
            assert!(matches!(err, TraceError::Cycle { .. }));
            let root = Registry::get(store, &root).expect("root");
            assert!(root.linked_vtis.is_empty());
        });
    }
}

// =============================================================================
// CALCULATION
// =============================================================================

mod calculation {
    use super::*;

    /// quantity 50 kg at 1.5 kg CO2e/kg is 75 kg CO2e.
    #[test]
    fn arithmetic() {
        on_each_backend(|store| {
            let clock = clock();
            FactorCatalog::register(store, factor("Global", "urea", "kg", 2020, 1.5))
                .expect("factor");
            let farmer = actor(store, &clock, "farmer");
            let batch = Registry::create(store, &clock, NewVti::new(VtiType::FarmBatch))
                .expect("batch")
                .id;
            let event = Ledger::append(store, &clock, input_event(&batch, &farmer, "urea", 50.0))
                .expect("append");

            let outcome = Calculator::default()
                .on_event_appended(
                    store,
                    &clock,
                    &CalculationRequest::from(&event),
                    None,
                    &NoopObserver,
                )
                .expect("calculate");
            let record = outcome.record().expect("record");
            assert_eq!(record.calculated_emissions, 75.0);
            assert_eq!(record.unit, "kg CO2e");
            assert_eq!(record.source_event_id, event.id);
        });
    }

    /// TRANSPORTED events leave a listable pending marker, never a record.
    #[test]
    fn transport_pending() {
        on_each_backend(|store| {
            let clock = clock();
            let farmer = actor(store, &clock, "farmer");
            let batch = Registry::create(store, &clock, NewVti::new(VtiType::FarmBatch))
                .expect("batch")
                .id;
            let event = Ledger::append(
                store,
                &clock,
                NewEvent::new(batch.clone(), EventType::TRANSPORTED, farmer)
                    .with_attr("distanceKm", AttrValue::Number(120.0))
                    .with_attr("mode", "truck"),
            )
            .expect("append");

            let outcome = Calculator::default()
                .on_event_appended(
                    store,
                    &clock,
                    &CalculationRequest::from(&event),
                    None,
                    &NoopObserver,
                )
                .expect("calculate");
            assert!(matches!(outcome, CalculationOutcome::Pending(_)));

            let pending = store.pending().expect("pending");
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].event_id, event.id);
            assert_eq!(store.record_count().expect("count"), 0);
        });
    }
}

// =============================================================================
// HARVEST LINKING
// =============================================================================

mod harvest {
    use super::*;

    /// Matching events older than the lookback are not linked.
    #[test]
    fn lookback_window_excludes_old_events() {
        on_each_backend(|store| {
            let clock = clock();
            let farmer = actor(store, &clock, "farmer");
            let field = Registry::create(store, &clock, NewVti::new(VtiType::FarmField))
                .expect("field")
                .id;

            let mut expected = Vec::new();
            for (id, ty, age) in [
                ("planted-old", EventType::PLANTED, 500),
                ("planted", EventType::PLANTED, 200),
                ("fertilized", EventType::INPUT_APPLIED, 120),
                ("scouted", EventType::OBSERVED, 30),
                ("harvested", EventType::HARVESTED, 1),
            ] {
                let mut new = NewEvent::new(field.clone(), ty, farmer.clone())
                    .with_id(EventId::new(id))
                    .on_field(field.clone())
                    .at(clock.now() - TimeDelta::days(age));
                if ty == EventType::INPUT_APPLIED {
                    new = new
                        .with_attr("inputType", "urea")
                        .with_attr("quantity", AttrValue::Number(5.0))
                        .with_attr("unit", "kg");
                }
                Ledger::append(store, &clock, new).expect("append");
                if age <= 365 && ty != EventType::HARVESTED {
                    expected.push(EventId::new(id));
                }
            }

            let batch = Registry::create_harvest_batch(
                store,
                &clock,
                HarvestRequest::new(field.clone()),
                TimeDelta::days(365),
            )
            .expect("harvest");
            assert_eq!(batch.metadata.linked_pre_harvest_events, expected);
            assert!(batch.linked_vtis.contains(&field));
        });
    }
}

// =============================================================================
// END-TO-END
// =============================================================================

mod end_to_end {
    use super::*;

    /// nitrogen 10 kg at 1.5 ⇒ one record of 15, visible in the month summary.
    #[test]
    fn append_calculate_summarize() {
        on_each_backend(|store| {
            let clock = clock();
            FactorCatalog::register(store, factor("Global", "nitrogen", "kg", 2019, 1.5))
                .expect("factor");
            let farmer = actor(store, &clock, "farmer-1");
            Registry::create(
                store,
                &clock,
                NewVti::new(VtiType::FarmBatch).with_id("batch-1"),
            )
            .expect("batch");

            let event = Ledger::append(
                store,
                &clock,
                input_event(&VtiId::new("batch-1"), &farmer, "nitrogen", 10.0),
            )
            .expect("append");
            let outcome = Calculator::default()
                .on_event_appended(
                    store,
                    &clock,
                    &CalculationRequest::from(&event),
                    Some("Global"),
                    &NoopObserver,
                )
                .expect("calculate");
            assert_eq!(
                outcome.record().map(|r| r.calculated_emissions),
                Some(15.0)
            );

            let summary = Aggregator::summarize(store, &farmer, PeriodType::Month, clock.now())
                .expect("summary");
            assert_eq!(summary.total_emissions, 15.0);
            assert_eq!(summary.record_count, 1);
            assert_eq!(summary.trend_percent, 0.0);

            let batch = Registry::get(store, &VtiId::new("batch-1")).expect("batch");
            assert_eq!(batch.metadata.carbon_footprint_kg_co2e, 15.0);
        });
    }

    /// Events for one VTI stream back in event-time order on both backends.
    #[test]
    fn ledger_order_survives_paging() {
        on_each_backend(|store| {
            let clock = clock();
            let farmer = actor(store, &clock, "farmer");
            let batch = Registry::create(store, &clock, NewVti::new(VtiType::FarmBatch))
                .expect("batch")
                .id;
            for hours in (0..10).rev() {
                Ledger::append(
                    store,
                    &clock,
                    NewEvent::new(batch.clone(), EventType::OBSERVED, farmer.clone())
                        .at(clock.now() - TimeDelta::hours(hours)),
                )
                .expect("append");
            }

            let times: Vec<_> = Ledger::query_by_vti(&*store, &batch)
                .with_page_size(3)
                .map(|e| e.expect("event").timestamp)
                .collect();
            assert_eq!(times.len(), 10);
            assert!(times.windows(2).all(|w| w[0] <= w[1]));
        });
    }
}
