//! # agrotrace-core
//!
//! The traceability registry and carbon accounting engine.
//!
//! This crate holds the provenance graph of Verified Traceability
//! Identifiers (VTIs), the append-only event ledger, the emission factor
//! catalog and resolver, and the carbon footprint calculation and
//! aggregation pipeline.
//!
//! ## Data Flow
//!
//! Actors append events to the `Ledger`. Each appended event is handed to
//! the `Calculator`, which resolves a factor and commits at most one
//! `CarbonFootprintRecord` per source event. The `Aggregator` reads records
//! on demand to build windowed summaries.
//!
//! ## Architectural Constraints
//!
//! - Has NO async, NO network dependencies (pure Rust)
//! - Every component receives its store, clock and collaborators explicitly
//! - Events and records are insert-only
//! - Deterministic containers only (`BTreeMap`, `BTreeSet`)

// =============================================================================
// MODULES
// =============================================================================

pub mod aggregator;
pub mod calculator;
pub mod clock;
pub mod factors;
pub mod ledger;
pub mod primitives;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    AttrValue, Attributes, CARBON_FOOTPRINT_KEY, CarbonFootprintRecord, EmissionFactor, EventId,
    EventPayload, EventType, FactorId, FactorQuery, FactorSnapshot, GeoLocation, InputApplied,
    LINKED_PRE_HARVEST_KEY, NewEvent, NewFactor, PendingCalculation, RecordId, TraceError,
    TraceEvent, Transported, Vti, VtiId, VtiMetadata, VtiStatus, VtiType,
};

// =============================================================================
// RE-EXPORTS: Storage
// =============================================================================

pub use store::{
    CommitOutcome, EventCursor, LedgerStore, MemoryStore, RedbStore, StorageBackend, TimeRange,
};

// =============================================================================
// RE-EXPORTS: Components
// =============================================================================

pub use aggregator::{Aggregator, PeriodType, SUMMARY_UNIT, Summary, round2, trend_percent};
pub use calculator::{
    CalculationObserver, CalculationOutcome, CalculationRequest, Calculator, NoopObserver,
    SkipReason, TRANSPORT_PENDING_REASON,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use factors::FactorCatalog;
pub use ledger::{Ledger, VtiEventStream};
pub use registry::{HarvestRequest, NewVti, ProvenanceStep, Registry};
pub use resolver::{Resolver, TieBreak};
