//! # Core Type Definitions
//!
//! This module contains all document types of the traceability ledger:
//! - Identifiers (`VtiId`, `EventId`, `FactorId`, `RecordId`)
//! - The provenance node (`Vti`, `VtiType`, `VtiStatus`, `VtiMetadata`)
//! - Ledger entries (`TraceEvent`, `NewEvent`, `EventType`, `EventPayload`)
//! - Emission factors and derived carbon records
//! - Error types (`TraceError`)
//!
//! ## Determinism Guarantees
//!
//! Open-ended maps use `BTreeMap` so every serialized document and every
//! query result has a stable ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Generate a fresh random (v4 UUID) identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Get the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Verified Traceability Identifier: a node of the provenance graph.
    VtiId
);
string_id!(
    /// Identifier of a ledger event.
    EventId
);
string_id!(
    /// Identifier of an emission factor.
    FactorId
);
string_id!(
    /// Identifier of a carbon footprint record.
    RecordId
);

// =============================================================================
// VTI TYPE & STATUS
// =============================================================================

/// The kind of entity a VTI stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VtiType {
    User,
    Organization,
    FarmField,
    FarmBatch,
    ProductLot,
    ProcessedProduct,
}

impl VtiType {
    /// All known variants, in declaration order.
    pub const ALL: [VtiType; 6] = [
        Self::User,
        Self::Organization,
        Self::FarmField,
        Self::FarmBatch,
        Self::ProductLot,
        Self::ProcessedProduct,
    ];

    /// Wire name of the variant.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Organization => "organization",
            Self::FarmField => "farm_field",
            Self::FarmBatch => "farm_batch",
            Self::ProductLot => "product_lot",
            Self::ProcessedProduct => "processed_product",
        }
    }

    /// Only users and organizations may act on the ledger.
    #[must_use]
    pub const fn is_actor(self) -> bool {
        matches!(self, Self::User | Self::Organization)
    }
}

impl fmt::Display for VtiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VtiType {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| TraceError::validation("type", format!("unknown VTI type '{s}'")))
    }
}

/// Lifecycle state of a VTI. `Archived` is terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum VtiStatus {
    #[default]
    Active,
    InTransit,
    Processed,
    Sold,
    Archived,
}

impl VtiStatus {
    pub const ALL: [VtiStatus; 5] = [
        Self::Active,
        Self::InTransit,
        Self::Processed,
        Self::Sold,
        Self::Archived,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::InTransit => "in_transit",
            Self::Processed => "processed",
            Self::Sold => "sold",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Archived)
    }
}

impl fmt::Display for VtiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VtiStatus {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| TraceError::validation("status", format!("unknown VTI status '{s}'")))
    }
}

// =============================================================================
// ATTRIBUTE VALUES
// =============================================================================

/// A value in an open attribute map.
///
/// Externally tagged so that it round-trips through the non-self-describing
/// storage encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Text(String),
    Number(f64),
    Flag(bool),
    List(Vec<AttrValue>),
    Map(BTreeMap<String, AttrValue>),
}

impl AttrValue {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view; numeric strings are accepted since form clients send them.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<f64> for AttrValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        Self::Flag(b)
    }
}

/// Open key/value map carried by VTI metadata and residual event payloads.
pub type Attributes = BTreeMap<String, AttrValue>;

// =============================================================================
// VTI
// =============================================================================

/// Metadata key holding the running carbon footprint aggregate.
pub const CARBON_FOOTPRINT_KEY: &str = "carbonFootprintKgCO2e";

/// Metadata key holding the pre-harvest events linked to a batch.
pub const LINKED_PRE_HARVEST_KEY: &str = "linkedPreHarvestEvents";

/// VTI metadata: system-owned fields plus open type-specific attributes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VtiMetadata {
    /// Running total, only ever increased by recorded carbon footprints.
    pub carbon_footprint_kg_co2e: f64,
    /// Ledger events linked at harvest time (farm batches only).
    pub linked_pre_harvest_events: Vec<EventId>,
    /// Type-specific attributes.
    pub attributes: Attributes,
}

impl VtiMetadata {
    #[must_use]
    pub fn with_attributes(attributes: Attributes) -> Self {
        Self {
            attributes,
            ..Self::default()
        }
    }

    /// Merge a patch: top-level keys replace wholesale.
    ///
    /// System-owned keys cannot be patched.
    pub fn merge(&mut self, patch: Attributes) -> Result<(), TraceError> {
        for key in patch.keys() {
            if key == CARBON_FOOTPRINT_KEY || key == LINKED_PRE_HARVEST_KEY {
                return Err(TraceError::validation(
                    "metadata",
                    format!("'{key}' is maintained by the ledger and cannot be patched"),
                ));
            }
        }
        self.attributes.extend(patch);
        Ok(())
    }
}

/// A node in the provenance graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vti {
    pub id: VtiId,
    pub vti_type: VtiType,
    pub status: VtiStatus,
    /// Outgoing references; the graph they form is acyclic.
    pub linked_vtis: BTreeSet<VtiId>,
    pub metadata: VtiMetadata,
    pub is_public_traceable: bool,
    pub creation_time: DateTime<Utc>,
}

// =============================================================================
// EVENTS
// =============================================================================

/// Open enumeration of ledger event types.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(pub String);

impl EventType {
    pub const INPUT_APPLIED: &'static str = "INPUT_APPLIED";
    pub const TRANSPORTED: &'static str = "TRANSPORTED";
    pub const PLANTED: &'static str = "PLANTED";
    pub const OBSERVED: &'static str = "OBSERVED";
    pub const HARVESTED: &'static str = "HARVESTED";

    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is(&self, name: &str) -> bool {
        self.0 == name
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coordinate pair attached to an event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoLocation {
    pub fn validate(&self) -> Result<(), TraceError> {
        if !(-90.0..=90.0).contains(&self.latitude) || !(-180.0..=180.0).contains(&self.longitude)
        {
            return Err(TraceError::validation(
                "geoLocation",
                "coordinates out of range",
            ));
        }
        Ok(())
    }
}

/// Payload of an `INPUT_APPLIED` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputApplied {
    pub input_type: String,
    pub quantity: f64,
    pub unit: String,
    /// Any further keys supplied by the client.
    pub extra: Attributes,
}

/// Payload of a `TRANSPORTED` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transported {
    pub distance_km: Option<f64>,
    pub mode: Option<String>,
    pub extra: Attributes,
}

/// Event payload, typed for the event types the calculator understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    InputApplied(InputApplied),
    Transported(Transported),
    /// Any other event type, kept verbatim.
    Other(Attributes),
}

impl EventPayload {
    /// Classify a raw payload for the given event type.
    ///
    /// `INPUT_APPLIED` requires `inputType`, `unit` and a positive `quantity`.
    pub fn classify(event_type: &EventType, mut raw: Attributes) -> Result<Self, TraceError> {
        if event_type.is(EventType::INPUT_APPLIED) {
            let input_type = take_text(&mut raw, "inputType")?;
            let unit = take_text(&mut raw, "unit")?;
            let quantity = raw
                .remove("quantity")
                .ok_or_else(|| TraceError::validation("payload.quantity", "missing"))?
                .as_number()
                .ok_or_else(|| TraceError::validation("payload.quantity", "not a number"))?;
            if !quantity.is_finite() || quantity <= 0.0 {
                return Err(TraceError::validation(
                    "payload.quantity",
                    "must be greater than zero",
                ));
            }
            return Ok(Self::InputApplied(InputApplied {
                input_type,
                quantity,
                unit,
                extra: raw,
            }));
        }

        if event_type.is(EventType::TRANSPORTED) {
            let distance_km = raw.remove("distanceKm").and_then(|v| v.as_number());
            let mode = raw
                .remove("mode")
                .and_then(|v| v.as_text().map(str::to_string));
            return Ok(Self::Transported(Transported {
                distance_km,
                mode,
                extra: raw,
            }));
        }

        Ok(Self::Other(raw))
    }

    /// Flatten back into the wire attribute map.
    #[must_use]
    pub fn to_attributes(&self) -> Attributes {
        match self {
            Self::InputApplied(p) => {
                let mut out = p.extra.clone();
                out.insert("inputType".into(), p.input_type.as_str().into());
                out.insert("quantity".into(), p.quantity.into());
                out.insert("unit".into(), p.unit.as_str().into());
                out
            }
            Self::Transported(p) => {
                let mut out = p.extra.clone();
                if let Some(d) = p.distance_km {
                    out.insert("distanceKm".into(), d.into());
                }
                if let Some(ref m) = p.mode {
                    out.insert("mode".into(), m.as_str().into());
                }
                out
            }
            Self::Other(attrs) => attrs.clone(),
        }
    }
}

fn take_text(raw: &mut Attributes, key: &'static str) -> Result<String, TraceError> {
    let field = match key {
        "inputType" => "payload.inputType",
        "unit" => "payload.unit",
        _ => "payload",
    };
    match raw.remove(key) {
        Some(AttrValue::Text(s)) if !s.trim().is_empty() => Ok(s),
        Some(_) => Err(TraceError::validation(field, "must be a non-empty string")),
        None => Err(TraceError::validation(field, "missing")),
    }
}

/// An immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub id: EventId,
    pub vti_id: VtiId,
    pub event_type: EventType,
    /// Event time as reported by the actor (defaults to `recorded_at`).
    pub timestamp: DateTime<Utc>,
    /// Ledger write time.
    pub recorded_at: DateTime<Utc>,
    pub actor_ref: VtiId,
    pub geo_location: Option<GeoLocation>,
    pub payload: EventPayload,
    pub farm_field_id: Option<VtiId>,
    pub is_public_traceable: bool,
}

/// An event as submitted for appending.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Caller-chosen id; generated when absent.
    pub id: Option<EventId>,
    pub vti_id: VtiId,
    pub event_type: EventType,
    pub timestamp: Option<DateTime<Utc>>,
    pub actor_ref: VtiId,
    pub geo_location: Option<GeoLocation>,
    pub payload: Attributes,
    pub farm_field_id: Option<VtiId>,
    pub is_public_traceable: bool,
}

impl NewEvent {
    #[must_use]
    pub fn new(vti_id: VtiId, event_type: impl Into<String>, actor_ref: VtiId) -> Self {
        Self {
            id: None,
            vti_id,
            event_type: EventType::new(event_type),
            timestamp: None,
            actor_ref,
            geo_location: None,
            payload: Attributes::new(),
            farm_field_id: None,
            is_public_traceable: false,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn on_field(mut self, field: VtiId) -> Self {
        self.farm_field_id = Some(field);
        self
    }

    #[must_use]
    pub fn with_attr(mut self, key: &str, value: impl Into<AttrValue>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }
}

// =============================================================================
// EMISSION FACTORS
// =============================================================================

/// A region/activity-scoped conversion factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionFactor {
    pub id: FactorId,
    /// Insertion order assigned by the store; drives the tie-break rule.
    pub revision: u64,
    pub region: String,
    pub activity_type: String,
    pub input_type: Option<String>,
    pub factor_type: Option<String>,
    pub year: i32,
    pub value: f64,
    pub unit: String,
    pub source: String,
    pub is_active: bool,
}

/// A factor as submitted by administrators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFactor {
    pub region: String,
    pub activity_type: String,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub factor_type: Option<String>,
    pub year: i32,
    pub value: f64,
    pub unit: String,
    #[serde(default)]
    pub source: String,
}

/// The lookup key for factor resolution (year excluded).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactorQuery {
    pub region: String,
    pub activity_type: String,
    pub input_type: Option<String>,
    pub factor_type: Option<String>,
}

impl FactorQuery {
    #[must_use]
    pub fn new(region: impl Into<String>, activity_type: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            activity_type: activity_type.into(),
            input_type: None,
            factor_type: None,
        }
    }

    #[must_use]
    pub fn input(mut self, input_type: impl Into<String>) -> Self {
        self.input_type = Some(input_type.into());
        self
    }

    #[must_use]
    pub fn factor(mut self, factor_type: impl Into<String>) -> Self {
        self.factor_type = Some(factor_type.into());
        self
    }

    /// The same key in another region.
    #[must_use]
    pub fn in_region(&self, region: &str) -> Self {
        Self {
            region: region.to_string(),
            ..self.clone()
        }
    }

    /// Whether an active factor matches this key exactly.
    #[must_use]
    pub fn matches(&self, factor: &EmissionFactor) -> bool {
        factor.is_active
            && factor.region == self.region
            && factor.activity_type == self.activity_type
            && factor.input_type == self.input_type
            && factor.factor_type == self.factor_type
    }
}

// =============================================================================
// CARBON FOOTPRINT RECORDS
// =============================================================================

/// Immutable copy of the factor a record was computed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorSnapshot {
    pub factor_id: FactorId,
    pub value: f64,
    pub unit: String,
    pub source: String,
    pub region: String,
    pub year: i32,
}

impl From<&EmissionFactor> for FactorSnapshot {
    fn from(f: &EmissionFactor) -> Self {
        Self {
            factor_id: f.id.clone(),
            value: f.value,
            unit: f.unit.clone(),
            source: f.source.clone(),
            region: f.region.clone(),
            year: f.year,
        }
    }
}

/// A derived, append-only emission fact. At most one exists per source event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarbonFootprintRecord {
    pub id: RecordId,
    pub source_event_id: EventId,
    pub vti_id: Option<VtiId>,
    pub user_ref: VtiId,
    pub event_type: EventType,
    /// Copied from the source event.
    pub timestamp: DateTime<Utc>,
    pub calculated_emissions: f64,
    pub unit: String,
    pub emission_factor_used: FactorSnapshot,
    pub data_source: String,
    pub region: String,
    pub category: String,
    pub subcategory: String,
    pub details: Attributes,
    pub created_at: DateTime<Utc>,
}

/// Explicit marker for a relevant event whose calculation is not available yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCalculation {
    pub event_id: EventId,
    pub vti_id: Option<VtiId>,
    pub user_ref: VtiId,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub marked_at: DateTime<Utc>,
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the traceability core.
///
/// Factor lookup misses are not errors; the resolver returns `None`.
#[derive(Debug, Error)]
pub enum TraceError {
    /// A required field is missing or malformed.
    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// The referenced VTI does not exist.
    #[error("VTI not found: {0}")]
    VtiNotFound(VtiId),

    /// The acting VTI does not exist.
    #[error("Actor not found: {0}")]
    ActorNotFound(VtiId),

    /// The acting VTI is not a user or organization.
    #[error("Actor {id} is a {vti_type}, expected user or organization")]
    InvalidActor { id: VtiId, vti_type: VtiType },

    /// Linking would close a cycle in the provenance graph.
    #[error("Linking {vti} to {via} would create a cycle")]
    Cycle { vti: VtiId, via: VtiId },

    /// The provenance walk exceeded the depth guard.
    #[error("Provenance graph deeper than {0} levels")]
    LinkDepthExceeded(usize),

    /// A VTI with this id already exists.
    #[error("VTI already exists: {0}")]
    DuplicateVti(VtiId),

    /// An event with this id already exists.
    #[error("Event already exists: {0}")]
    DuplicateEvent(EventId),

    /// Status change not permitted.
    #[error("Cannot move {id} from {from} to {to}")]
    InvalidTransition {
        id: VtiId,
        from: VtiStatus,
        to: VtiStatus,
    },

    /// Administrative operation on an unknown factor.
    #[error("Emission factor not found: {0}")]
    FactorNotFound(FactorId),

    /// The storage layer failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A stored document could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TraceError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Whether redelivering the same work may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

// =============================================================================
// TESTS
// =============================================================================
