//! # API Request/Response Types
//!
//! This module defines the JSON structures for the HTTP API and the
//! conversions between JSON documents and core attribute maps.

use agrotrace_core::{
    AttrValue, Attributes, CARBON_FOOTPRINT_KEY, CalculationRequest, Calculator,
    CarbonFootprintRecord, EmissionFactor, EventId, EventPayload, EventType, GeoLocation,
    HarvestRequest, LINKED_PRE_HARVEST_KEY, NewEvent, NewVti, PendingCalculation, ProvenanceStep,
    Summary, TraceError, TraceEvent, Vti, VtiId,
};
use agrotrace_core::primitives::MAX_HARVEST_LOOKBACK_DAYS;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Default number of events returned by `GET /vti/{id}/events`.
pub const DEFAULT_EVENT_LIMIT: usize = 100;

/// Upper bound on `limit` for `GET /vti/{id}/events`.
pub const MAX_EVENT_LIMIT: usize = 1000;

// =============================================================================
// JSON <-> ATTRIBUTES
// =============================================================================

/// Convert a JSON value into an attribute value. `null` has no counterpart.
#[must_use]
pub fn attr_from_json(value: &Value) -> Option<AttrValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(AttrValue::Flag(*b)),
        Value::Number(n) => n.as_f64().map(AttrValue::Number),
        Value::String(s) => Some(AttrValue::Text(s.clone())),
        Value::Array(items) => Some(AttrValue::List(
            items.iter().filter_map(attr_from_json).collect(),
        )),
        Value::Object(map) => Some(AttrValue::Map(attributes_from_json(map))),
    }
}

/// Convert a JSON object into an attribute map, dropping `null` members.
#[must_use]
pub fn attributes_from_json(map: &Map<String, Value>) -> Attributes {
    map.iter()
        .filter_map(|(k, v)| attr_from_json(v).map(|a| (k.clone(), a)))
        .collect()
}

#[must_use]
pub fn attr_to_json(value: &AttrValue) -> Value {
    match value {
        AttrValue::Text(s) => Value::String(s.clone()),
        AttrValue::Number(n) => Number::from_f64(*n).map_or(Value::Null, Value::Number),
        AttrValue::Flag(b) => Value::Bool(*b),
        AttrValue::List(items) => Value::Array(items.iter().map(attr_to_json).collect()),
        AttrValue::Map(map) => Value::Object(attributes_to_json(map)),
    }
}

#[must_use]
pub fn attributes_to_json(attributes: &Attributes) -> Map<String, Value> {
    attributes
        .iter()
        .map(|(k, v)| (k.clone(), attr_to_json(v)))
        .collect()
}

fn ids(raw: &[String]) -> Vec<VtiId> {
    raw.iter().map(|s| VtiId::new(s.as_str())).collect()
}

// =============================================================================
// ERROR BODIES
// =============================================================================

/// Response types that can carry an error message.
pub trait ErrorBody {
    fn error(message: String) -> Self;
}

/// Generic failure body: `{success: false, error}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: Option<String>,
}

impl ErrorBody for ErrorResponse {
    fn error(message: String) -> Self {
        Self {
            success: false,
            error: Some(message),
        }
    }
}

// =============================================================================
// HEALTH / STATUS
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Store counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub vti_count: usize,
    pub event_count: usize,
    pub factor_count: usize,
    pub record_count: usize,
    pub pending_count: usize,
    pub persistent: bool,
}

// =============================================================================
// VTI
// =============================================================================

/// Wire form of a VTI. System-owned metadata keys are merged into `metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VtiJson {
    pub id: String,
    #[serde(rename = "type")]
    pub vti_type: String,
    pub status: String,
    pub linked_vtis: Vec<String>,
    pub metadata: Map<String, Value>,
    pub is_public_traceable: bool,
    pub creation_time: DateTime<Utc>,
}

impl From<&Vti> for VtiJson {
    fn from(vti: &Vti) -> Self {
        let mut metadata = attributes_to_json(&vti.metadata.attributes);
        metadata.insert(
            CARBON_FOOTPRINT_KEY.to_string(),
            Number::from_f64(vti.metadata.carbon_footprint_kg_co2e)
                .map_or(Value::Null, Value::Number),
        );
        if !vti.metadata.linked_pre_harvest_events.is_empty() {
            metadata.insert(
                LINKED_PRE_HARVEST_KEY.to_string(),
                Value::Array(
                    vti.metadata
                        .linked_pre_harvest_events
                        .iter()
                        .map(|e| Value::String(e.to_string()))
                        .collect(),
                ),
            );
        }
        Self {
            id: vti.id.to_string(),
            vti_type: vti.vti_type.as_str().to_string(),
            status: vti.status.as_str().to_string(),
            linked_vtis: vti.linked_vtis.iter().map(ToString::to_string).collect(),
            metadata,
            is_public_traceable: vti.is_public_traceable,
            creation_time: vti.creation_time,
        }
    }
}

/// `POST /vti` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVtiRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub vti_type: String,
    #[serde(default)]
    pub linked_vtis: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub is_public_traceable: bool,
}

impl CreateVtiRequest {
    pub fn to_new_vti(&self) -> Result<NewVti, TraceError> {
        Ok(NewVti {
            id: self.id.as_deref().map(VtiId::new),
            vti_type: self.vti_type.parse()?,
            linked_vtis: ids(&self.linked_vtis),
            attributes: attributes_from_json(&self.metadata),
            is_public_traceable: self.is_public_traceable,
        })
    }
}

/// `POST /vti/harvest` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestBatchRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub farm_field_id: String,
    #[serde(default)]
    pub linked_vtis: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub is_public_traceable: bool,
    /// Overrides the configured lookback window.
    #[serde(default)]
    pub lookback_days: Option<i64>,
}

impl HarvestBatchRequest {
    pub fn to_request(&self) -> Result<HarvestRequest, TraceError> {
        if self.farm_field_id.trim().is_empty() {
            return Err(TraceError::validation("farmFieldId", "must not be empty"));
        }
        self.lookback(TimeDelta::zero())?;
        Ok(HarvestRequest {
            id: self.id.as_deref().map(VtiId::new),
            farm_field_id: VtiId::new(self.farm_field_id.as_str()),
            linked_vtis: ids(&self.linked_vtis),
            attributes: attributes_from_json(&self.metadata),
            is_public_traceable: self.is_public_traceable,
        })
    }

    /// The requested lookback window, or `default` when none was given.
    pub fn lookback(&self, default: TimeDelta) -> Result<TimeDelta, TraceError> {
        let Some(days) = self.lookback_days else {
            return Ok(default);
        };
        if !(1..=MAX_HARVEST_LOOKBACK_DAYS).contains(&days) {
            return Err(TraceError::validation(
                "lookbackDays",
                format!("must be between 1 and {MAX_HARVEST_LOOKBACK_DAYS}"),
            ));
        }
        TimeDelta::try_days(days)
            .ok_or_else(|| TraceError::validation("lookbackDays", "out of range"))
    }
}

/// `PUT /vti/{id}/status` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: String,
}

/// `POST /vti/{id}/links` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRequest {
    pub linked_vtis: Vec<String>,
}

impl LinkRequest {
    #[must_use]
    pub fn targets(&self) -> Vec<VtiId> {
        ids(&self.linked_vtis)
    }
}

/// Single-VTI response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VtiResponse {
    pub success: bool,
    pub vti: Option<VtiJson>,
    pub error: Option<String>,
}

impl VtiResponse {
    #[must_use]
    pub fn success(vti: &Vti) -> Self {
        Self {
            success: true,
            vti: Some(VtiJson::from(vti)),
            error: None,
        }
    }
}

impl ErrorBody for VtiResponse {
    fn error(message: String) -> Self {
        Self {
            success: false,
            vti: None,
            error: Some(message),
        }
    }
}

/// `GET /vti/{id}/trace` query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceQuery {
    pub depth: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStepJson {
    pub depth: usize,
    pub vti: VtiJson,
}

/// Upstream provenance of a VTI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceResponse {
    pub success: bool,
    pub steps: Vec<TraceStepJson>,
    pub error: Option<String>,
}

impl TraceResponse {
    #[must_use]
    pub fn success(steps: &[ProvenanceStep]) -> Self {
        Self {
            success: true,
            steps: steps
                .iter()
                .map(|s| TraceStepJson {
                    depth: s.depth,
                    vti: VtiJson::from(&s.vti),
                })
                .collect(),
            error: None,
        }
    }
}

impl ErrorBody for TraceResponse {
    fn error(message: String) -> Self {
        Self {
            success: false,
            steps: Vec::new(),
            error: Some(message),
        }
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Wire form of a ledger event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventJson {
    pub id: String,
    pub vti_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub actor_ref: String,
    pub geo_location: Option<GeoLocation>,
    pub payload: Map<String, Value>,
    pub farm_field_id: Option<String>,
    pub is_public_traceable: bool,
}

impl From<&TraceEvent> for EventJson {
    fn from(event: &TraceEvent) -> Self {
        Self {
            id: event.id.to_string(),
            vti_id: event.vti_id.to_string(),
            event_type: event.event_type.to_string(),
            timestamp: event.timestamp,
            recorded_at: event.recorded_at,
            actor_ref: event.actor_ref.to_string(),
            geo_location: event.geo_location,
            payload: attributes_to_json(&event.payload.to_attributes()),
            farm_field_id: event.farm_field_id.as_ref().map(ToString::to_string),
            is_public_traceable: event.is_public_traceable,
        }
    }
}

/// `POST /events` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEventRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub vti_id: String,
    pub event_type: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub actor_ref: String,
    #[serde(default)]
    pub geo_location: Option<GeoLocation>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub farm_field_id: Option<String>,
    #[serde(default)]
    pub is_public_traceable: bool,
}

impl AppendEventRequest {
    #[must_use]
    pub fn to_new_event(&self) -> NewEvent {
        NewEvent {
            id: self.id.as_deref().map(EventId::new),
            vti_id: VtiId::new(self.vti_id.as_str()),
            event_type: EventType::new(self.event_type.as_str()),
            timestamp: self.timestamp,
            actor_ref: VtiId::new(self.actor_ref.as_str()),
            geo_location: self.geo_location,
            payload: attributes_from_json(&self.payload),
            farm_field_id: self.farm_field_id.as_deref().map(VtiId::new),
            is_public_traceable: self.is_public_traceable,
        }
    }
}

/// Single-event response. `calculation` reports what the trigger did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResponse {
    pub success: bool,
    pub event: Option<EventJson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calculation: Option<String>,
    pub error: Option<String>,
}

impl EventResponse {
    #[must_use]
    pub fn success(event: &TraceEvent, calculation: Option<&str>) -> Self {
        Self {
            success: true,
            event: Some(EventJson::from(event)),
            calculation: calculation.map(str::to_string),
            error: None,
        }
    }
}

impl ErrorBody for EventResponse {
    fn error(message: String) -> Self {
        Self {
            success: false,
            event: None,
            calculation: None,
            error: Some(message),
        }
    }
}

/// `GET /vti/{id}/events` query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

impl EventsQuery {
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_EVENT_LIMIT)
            .clamp(1, MAX_EVENT_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventListResponse {
    pub success: bool,
    pub events: Vec<EventJson>,
    pub error: Option<String>,
}

impl EventListResponse {
    #[must_use]
    pub fn success(events: &[TraceEvent]) -> Self {
        Self {
            success: true,
            events: events.iter().map(EventJson::from).collect(),
            error: None,
        }
    }
}

impl ErrorBody for EventListResponse {
    fn error(message: String) -> Self {
        Self {
            success: false,
            events: Vec::new(),
            error: Some(message),
        }
    }
}

// =============================================================================
// EMISSION FACTORS
// =============================================================================

/// Wire form of an emission factor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactorJson {
    pub id: String,
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

impl From<&EmissionFactor> for FactorJson {
    fn from(f: &EmissionFactor) -> Self {
        Self {
            id: f.id.to_string(),
            revision: f.revision,
            region: f.region.clone(),
            activity_type: f.activity_type.clone(),
            input_type: f.input_type.clone(),
            factor_type: f.factor_type.clone(),
            year: f.year,
            value: f.value,
            unit: f.unit.clone(),
            source: f.source.clone(),
            is_active: f.is_active,
        }
    }
}

/// `PUT /factors/{id}/active` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetActiveRequest {
    pub is_active: bool,
}

/// `GET /factors/resolve` query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveQuery {
    #[serde(default)]
    pub region: Option<String>,
    pub activity_type: String,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub factor_type: Option<String>,
}

/// Single-factor response. A resolution miss is `factor: null` with a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorResponse {
    pub success: bool,
    pub factor: Option<FactorJson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub error: Option<String>,
}

impl FactorResponse {
    #[must_use]
    pub fn success(factor: &EmissionFactor) -> Self {
        Self {
            success: true,
            factor: Some(FactorJson::from(factor)),
            message: None,
            error: None,
        }
    }

    #[must_use]
    pub fn not_found() -> Self {
        Self {
            success: true,
            factor: None,
            message: Some("not found".to_string()),
            error: None,
        }
    }
}

impl ErrorBody for FactorResponse {
    fn error(message: String) -> Self {
        Self {
            success: false,
            factor: None,
            message: None,
            error: Some(message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorListResponse {
    pub success: bool,
    pub factors: Vec<FactorJson>,
    pub error: Option<String>,
}

impl FactorListResponse {
    #[must_use]
    pub fn success(factors: &[EmissionFactor]) -> Self {
        Self {
            success: true,
            factors: factors.iter().map(FactorJson::from).collect(),
            error: None,
        }
    }
}

impl ErrorBody for FactorListResponse {
    fn error(message: String) -> Self {
        Self {
            success: false,
            factors: Vec::new(),
            error: Some(message),
        }
    }
}

// =============================================================================
// PENDING CALCULATIONS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingJson {
    pub event_id: String,
    pub vti_id: Option<String>,
    pub user_ref: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub marked_at: DateTime<Utc>,
}

impl From<&PendingCalculation> for PendingJson {
    fn from(p: &PendingCalculation) -> Self {
        Self {
            event_id: p.event_id.to_string(),
            vti_id: p.vti_id.as_ref().map(ToString::to_string),
            user_ref: p.user_ref.to_string(),
            event_type: p.event_type.to_string(),
            timestamp: p.timestamp,
            reason: p.reason.clone(),
            marked_at: p.marked_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingListResponse {
    pub success: bool,
    pub pending: Vec<PendingJson>,
    pub error: Option<String>,
}

impl PendingListResponse {
    #[must_use]
    pub fn success(pending: &[PendingCalculation]) -> Self {
        Self {
            success: true,
            pending: pending.iter().map(PendingJson::from).collect(),
            error: None,
        }
    }
}

impl ErrorBody for PendingListResponse {
    fn error(message: String) -> Self {
        Self {
            success: false,
            pending: Vec::new(),
            error: Some(message),
        }
    }
}

// =============================================================================
// CARBON FOOTPRINT
// =============================================================================

/// `POST /carbon-footprint` body after validation.
#[derive(Debug, Clone, PartialEq)]
pub enum CarbonFootprintSubmission {
    /// The event type is not calculated.
    NotRelevant,
    Calculate(CalculationRequest),
}

impl CarbonFootprintSubmission {
    /// Validate `{eventId, eventData}`.
    ///
    /// `eventData` carries `eventType`, `actorRef` (or `userRef`), an optional
    /// `vtiId`, an optional RFC 3339 `timestamp` and the `payload` object.
    pub fn parse(body: &Value, now: DateTime<Utc>) -> Result<Self, TraceError> {
        let event_id = required_text(body.get("eventId"), "eventId")?;
        let data = body
            .get("eventData")
            .and_then(Value::as_object)
            .ok_or_else(|| TraceError::validation("eventData", "missing or not an object"))?;

        let event_type =
            EventType::new(required_text(data.get("eventType"), "eventData.eventType")?);
        if !Calculator::is_relevant(&event_type) {
            return Ok(Self::NotRelevant);
        }

        let actor = data.get("actorRef").or_else(|| data.get("userRef"));
        let user_ref = VtiId::new(required_text(actor, "eventData.actorRef")?);

        let vti_id = match data.get("vtiId") {
            None | Some(Value::Null) => None,
            Some(v) => Some(VtiId::new(required_text(Some(v), "eventData.vtiId")?)),
        };

        let timestamp = match data.get("timestamp") {
            None | Some(Value::Null) => now,
            Some(v) => {
                let text = required_text(Some(v), "eventData.timestamp")?;
                DateTime::parse_from_rfc3339(&text)
                    .map_err(|e| TraceError::validation("eventData.timestamp", e.to_string()))?
                    .with_timezone(&Utc)
            }
        };

        let raw = match data.get("payload") {
            None | Some(Value::Null) => Attributes::new(),
            Some(Value::Object(map)) => attributes_from_json(map),
            Some(_) => {
                return Err(TraceError::validation(
                    "eventData.payload",
                    "must be an object",
                ));
            }
        };
        let payload = EventPayload::classify(&event_type, raw)?;

        Ok(Self::Calculate(CalculationRequest {
            event_id: EventId::new(event_id),
            vti_id,
            user_ref,
            event_type,
            timestamp,
            payload,
        }))
    }
}

fn required_text(value: Option<&Value>, field: &'static str) -> Result<String, TraceError> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(_) => Err(TraceError::validation(field, "must be a non-empty string")),
        None => Err(TraceError::validation(field, "missing")),
    }
}

/// `POST /carbon-footprint` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarbonFootprintResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emissions: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carbon_data_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CarbonFootprintResponse {
    #[must_use]
    pub fn recorded(record: &CarbonFootprintRecord) -> Self {
        Self {
            success: Some(true),
            emissions: Some(record.calculated_emissions),
            unit: Some(record.unit.clone()),
            carbon_data_id: Some(record.id.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn message(message: &str) -> Self {
        Self {
            message: Some(message.to_string()),
            ..Self::default()
        }
    }
}

impl ErrorBody for CarbonFootprintResponse {
    fn error(message: String) -> Self {
        Self {
            success: Some(false),
            error: Some(message),
            ..Self::default()
        }
    }
}

// =============================================================================
// DASHBOARD
// =============================================================================

/// `GET /dashboard` query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardQuery {
    pub period: Option<String>,
}

/// Summary of the caller merged with their practices and certifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardResponse {
    pub success: bool,
    #[serde(flatten)]
    pub summary: Option<Summary>,
    #[serde(default)]
    pub practices: Vec<String>,
    #[serde(default)]
    pub certifications: Vec<String>,
    pub error: Option<String>,
}

impl DashboardResponse {
    #[must_use]
    pub fn success(summary: Summary, practices: Vec<String>, certifications: Vec<String>) -> Self {
        Self {
            success: true,
            summary: Some(summary),
            practices,
            certifications,
            error: None,
        }
    }
}

impl ErrorBody for DashboardResponse {
    fn error(message: String) -> Self {
        Self {
            success: false,
            summary: None,
            practices: Vec::new(),
            certifications: Vec::new(),
            error: Some(message),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
