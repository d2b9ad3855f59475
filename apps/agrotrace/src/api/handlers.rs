//! # API Endpoint Handlers
//!
//! This module implements the actual HTTP endpoint handlers.
//!
//! Errors map to status codes by class: validation and referential errors
//! are 400 (404 when the VTI named in the path is unknown), duplicates and
//! forbidden transitions 409, storage failures 500.

use super::{
    AppState,
    auth::Caller,
    types::{
        AppendEventRequest, CarbonFootprintResponse, CarbonFootprintSubmission, CreateVtiRequest,
        DashboardQuery, DashboardResponse, ErrorBody, ErrorResponse, EventListResponse,
        EventResponse, EventsQuery, FactorListResponse, FactorResponse, HarvestBatchRequest,
        HealthResponse, LinkRequest, PendingListResponse, ResolveQuery, SetActiveRequest,
        StatusResponse, StatusUpdateRequest, TraceQuery, TraceResponse, VtiResponse,
        attributes_from_json,
    },
};
use agrotrace_core::{
    Aggregator, CalculationOutcome, CalculationRequest, EventId, FactorCatalog, FactorId,
    FactorQuery, Ledger, LedgerStore, NewFactor, PeriodType, Registry, Resolver, SkipReason,
    TraceError, VtiId, VtiStatus,
    primitives::{GLOBAL_REGION, MAX_LINK_DEPTH},
};
use axum::{
    Extension, Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::{Map, Value};

// =============================================================================
// ERROR MAPPING
// =============================================================================

fn status_for(e: &TraceError) -> StatusCode {
    match e {
        TraceError::Validation { .. }
        | TraceError::VtiNotFound(_)
        | TraceError::ActorNotFound(_)
        | TraceError::InvalidActor { .. }
        | TraceError::Cycle { .. }
        | TraceError::LinkDepthExceeded(_) => StatusCode::BAD_REQUEST,
        TraceError::DuplicateVti(_)
        | TraceError::DuplicateEvent(_)
        | TraceError::InvalidTransition { .. } => StatusCode::CONFLICT,
        TraceError::FactorNotFound(_) => StatusCode::NOT_FOUND,
        TraceError::Storage(_) | TraceError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn failure<R: ErrorBody>(e: &TraceError) -> (StatusCode, Json<R>) {
    let status = status_for(e);
    if status.is_server_error() {
        tracing::error!(event = "request_failed", error = %e, "Request failed");
    }
    (status, Json(R::error(e.to_string())))
}

/// Like `failure`, but an unknown VTI named in the path is a 404.
fn path_failure<R: ErrorBody>(id: &VtiId, e: &TraceError) -> (StatusCode, Json<R>) {
    match e {
        TraceError::VtiNotFound(missing) if missing == id => {
            (StatusCode::NOT_FOUND, Json(R::error(e.to_string())))
        }
        _ => failure(e),
    }
}

fn rejected<R: ErrorBody>(rejection: &JsonRejection) -> (StatusCode, Json<R>) {
    (
        StatusCode::BAD_REQUEST,
        Json(R::error(format!("Invalid request body: {}", rejection.body_text()))),
    )
}

// =============================================================================
// HEALTH / STATUS
// =============================================================================

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

/// Store counts.
pub async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.read().await;
    let counts = (|| -> Result<StatusResponse, TraceError> {
        Ok(StatusResponse {
            vti_count: store.vti_count()?,
            event_count: store.event_count()?,
            factor_count: store.factors()?.len(),
            record_count: store.record_count()?,
            pending_count: store.pending()?.len(),
            persistent: store.is_persistent(),
        })
    })();

    match counts {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => failure::<ErrorResponse>(&e).into_response(),
    }
}

// =============================================================================
// VTI REGISTRY
// =============================================================================

/// Create a VTI.
pub async fn create_vti_handler(
    State(state): State<AppState>,
    payload: Result<Json<CreateVtiRequest>, JsonRejection>,
) -> impl IntoResponse {
    let request = match payload {
        Ok(Json(r)) => r,
        Err(r) => return rejected::<VtiResponse>(&r),
    };
    let new = match request.to_new_vti() {
        Ok(n) => n,
        Err(e) => return failure(&e),
    };

    let mut store = state.store.write().await;
    match Registry::create(&mut *store, state.pipeline.clock.as_ref(), new) {
        Ok(vti) => {
            tracing::info!(
                event = "vti_created",
                id = %vti.id,
                vti_type = %vti.vti_type,
                "VTI created"
            );
            (StatusCode::CREATED, Json(VtiResponse::success(&vti)))
        }
        Err(e) => failure(&e),
    }
}

/// Create a farm batch at harvest, linking its field's pre-harvest events.
pub async fn harvest_handler(
    State(state): State<AppState>,
    payload: Result<Json<HarvestBatchRequest>, JsonRejection>,
) -> impl IntoResponse {
    let request = match payload {
        Ok(Json(r)) => r,
        Err(r) => return rejected::<VtiResponse>(&r),
    };
    let harvest = match request.to_request() {
        Ok(h) => h,
        Err(e) => return failure(&e),
    };
    let lookback = match request.lookback(state.config.engine.harvest_lookback()) {
        Ok(l) => l,
        Err(e) => return failure(&e),
    };

    let mut store = state.store.write().await;
    match Registry::create_harvest_batch(
        &mut *store,
        state.pipeline.clock.as_ref(),
        harvest,
        lookback,
    ) {
        Ok(vti) => {
            tracing::info!(
                event = "harvest_batch_created",
                id = %vti.id,
                linked_events = vti.metadata.linked_pre_harvest_events.len(),
                "Harvest batch created"
            );
            (StatusCode::CREATED, Json(VtiResponse::success(&vti)))
        }
        Err(e) => failure(&e),
    }
}

/// Fetch a VTI.
pub async fn get_vti_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = VtiId::new(id);
    let store = state.store.read().await;
    match Registry::get(&*store, &id) {
        Ok(vti) => (StatusCode::OK, Json(VtiResponse::success(&vti))),
        Err(e) => path_failure(&id, &e),
    }
}

/// Merge a metadata patch.
pub async fn update_metadata_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<Map<String, Value>>, JsonRejection>,
) -> impl IntoResponse {
    let patch = match payload {
        Ok(Json(p)) => attributes_from_json(&p),
        Err(r) => return rejected::<VtiResponse>(&r),
    };
    let id = VtiId::new(id);
    let mut store = state.store.write().await;
    match Registry::update_metadata(&mut *store, &id, patch) {
        Ok(vti) => (StatusCode::OK, Json(VtiResponse::success(&vti))),
        Err(e) => path_failure(&id, &e),
    }
}

/// Change lifecycle status.
pub async fn update_status_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<StatusUpdateRequest>, JsonRejection>,
) -> impl IntoResponse {
    let status = match payload {
        Ok(Json(r)) => match r.status.parse::<VtiStatus>() {
            Ok(s) => s,
            Err(e) => return failure(&e),
        },
        Err(r) => return rejected::<VtiResponse>(&r),
    };
    let id = VtiId::new(id);
    let mut store = state.store.write().await;
    match Registry::update_status(&mut *store, &id, status) {
        Ok(vti) => (StatusCode::OK, Json(VtiResponse::success(&vti))),
        Err(e) => path_failure(&id, &e),
    }
}

/// Add outgoing links.
pub async fn link_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<LinkRequest>, JsonRejection>,
) -> impl IntoResponse {
    let targets = match payload {
        Ok(Json(r)) => r.targets(),
        Err(r) => return rejected::<VtiResponse>(&r),
    };
    let id = VtiId::new(id);
    let mut store = state.store.write().await;
    match Registry::link(&mut *store, &id, &targets) {
        Ok(vti) => (StatusCode::OK, Json(VtiResponse::success(&vti))),
        Err(e) => path_failure(&id, &e),
    }
}

/// Upstream provenance closure.
pub async fn trace_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TraceQuery>,
) -> impl IntoResponse {
    let id = VtiId::new(id);
    let depth = query.depth.unwrap_or(MAX_LINK_DEPTH).min(MAX_LINK_DEPTH);
    let store = state.store.read().await;
    match Registry::trace(&*store, &id, depth) {
        Ok(steps) => (StatusCode::OK, Json(TraceResponse::success(&steps))),
        Err(e) => path_failure(&id, &e),
    }
}

// =============================================================================
// EVENT LEDGER
// =============================================================================

/// Append an event and hand it to the calculation trigger.
pub async fn append_event_handler(
    State(state): State<AppState>,
    payload: Result<Json<AppendEventRequest>, JsonRejection>,
) -> impl IntoResponse {
    let request = match payload {
        Ok(Json(r)) => r,
        Err(r) => return rejected::<EventResponse>(&r),
    };

    let appended = {
        let mut store = state.store.write().await;
        Ledger::append(
            &mut *store,
            state.pipeline.clock.as_ref(),
            request.to_new_event(),
        )
    };
    let event = match appended {
        Ok(event) => event,
        Err(e) => return failure(&e),
    };
    tracing::info!(
        event = "event_appended",
        id = %event.id,
        vti = %event.vti_id,
        event_type = %event.event_type,
        "Event appended"
    );

    let dispatch = state
        .delivery
        .dispatch(&state.pipeline, CalculationRequest::from(&event))
        .await;
    let calculation = match dispatch {
        Ok(ref d) => d.label(),
        Err(ref e) => {
            tracing::error!(
                event = "carbon_failed",
                source_event = %event.id,
                error = %e,
                "Calculation failed after append"
            );
            "failed"
        }
    };

    (
        StatusCode::CREATED,
        Json(EventResponse::success(&event, Some(calculation))),
    )
}

/// Fetch a single event.
pub async fn get_event_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = EventId::new(id);
    let store = state.store.read().await;
    match Ledger::get(&*store, &id) {
        Ok(Some(event)) => (StatusCode::OK, Json(EventResponse::success(&event, None))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(EventResponse::error(format!("Event not found: {id}"))),
        ),
        Err(e) => failure(&e),
    }
}

/// A VTI's events in event-time order.
pub async fn vti_events_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let id = VtiId::new(id);
    let store = state.store.read().await;
    if let Err(e) = Registry::get(&*store, &id) {
        return path_failure(&id, &e);
    }
    let events: Result<Vec<_>, _> = Ledger::query_by_vti(&*store, &id)
        .take(query.limit())
        .collect();
    match events {
        Ok(events) => (StatusCode::OK, Json(EventListResponse::success(&events))),
        Err(e) => failure(&e),
    }
}

// =============================================================================
// EMISSION FACTORS
// =============================================================================

/// Register a factor.
pub async fn register_factor_handler(
    State(state): State<AppState>,
    payload: Result<Json<NewFactor>, JsonRejection>,
) -> impl IntoResponse {
    let factor = match payload {
        Ok(Json(f)) => f,
        Err(r) => return rejected::<FactorResponse>(&r),
    };
    let mut store = state.store.write().await;
    match FactorCatalog::register(&mut *store, factor) {
        Ok(factor) => {
            tracing::info!(
                event = "factor_registered",
                id = %factor.id,
                region = %factor.region,
                year = factor.year,
                "Emission factor registered"
            );
            (StatusCode::CREATED, Json(FactorResponse::success(&factor)))
        }
        Err(e) => failure(&e),
    }
}

/// Soft delete or restore a factor.
pub async fn set_factor_active_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<SetActiveRequest>, JsonRejection>,
) -> impl IntoResponse {
    let active = match payload {
        Ok(Json(r)) => r.is_active,
        Err(r) => return rejected::<FactorResponse>(&r),
    };
    let mut store = state.store.write().await;
    match FactorCatalog::set_active(&mut *store, &FactorId::new(id), active) {
        Ok(factor) => (StatusCode::OK, Json(FactorResponse::success(&factor))),
        Err(e) => failure(&e),
    }
}

/// All factors.
pub async fn list_factors_handler(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.read().await;
    match FactorCatalog::list(&*store) {
        Ok(factors) => (StatusCode::OK, Json(FactorListResponse::success(&factors))),
        Err(e) => failure(&e),
    }
}

/// Resolve the factor that would be used for a key.
pub async fn resolve_factor_handler(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
) -> impl IntoResponse {
    let region = query
        .region
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(GLOBAL_REGION);
    let mut key = FactorQuery::new(region, query.activity_type.as_str());
    if let Some(ref input) = query.input_type {
        key = key.input(input.as_str());
    }
    if let Some(ref factor) = query.factor_type {
        key = key.factor(factor.as_str());
    }

    let store = state.store.read().await;
    match Resolver::new(state.config.engine.tie_break).resolve(&*store, &key) {
        Ok(Some(factor)) => (StatusCode::OK, Json(FactorResponse::success(&factor))),
        Ok(None) => (StatusCode::OK, Json(FactorResponse::not_found())),
        Err(e) => failure(&e),
    }
}

// =============================================================================
// CARBON ACCOUNTING
// =============================================================================

/// Calculations awaiting a transport model.
pub async fn pending_handler(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.read().await;
    match store.pending() {
        Ok(pending) => (StatusCode::OK, Json(PendingListResponse::success(&pending))),
        Err(e) => failure(&e),
    }
}

/// Calculate the footprint of a submitted event document.
pub async fn carbon_footprint_handler(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> impl IntoResponse {
    let body = match payload {
        Ok(Json(b)) => b,
        Err(r) => return rejected::<CarbonFootprintResponse>(&r),
    };

    let request = match CarbonFootprintSubmission::parse(&body, state.pipeline.clock.now()) {
        Ok(CarbonFootprintSubmission::Calculate(request)) => request,
        Ok(CarbonFootprintSubmission::NotRelevant) => {
            return (
                StatusCode::OK,
                Json(CarbonFootprintResponse::message("not relevant")),
            );
        }
        Err(e) => return failure(&e),
    };

    match state.pipeline.deliver_with_retry(&request).await {
        Ok(CalculationOutcome::Recorded(record) | CalculationOutcome::AlreadyRecorded(record)) => (
            StatusCode::OK,
            Json(CarbonFootprintResponse::recorded(&record)),
        ),
        Ok(CalculationOutcome::Pending(_) | CalculationOutcome::AlreadyPending) => (
            StatusCode::OK,
            Json(CarbonFootprintResponse::message("pending")),
        ),
        Ok(CalculationOutcome::Skipped(SkipReason::FactorNotFound(_))) => (
            StatusCode::OK,
            Json(CarbonFootprintResponse::message("not found")),
        ),
        Ok(CalculationOutcome::Skipped(SkipReason::NotRelevant)) => (
            StatusCode::OK,
            Json(CarbonFootprintResponse::message("not relevant")),
        ),
        Ok(CalculationOutcome::Skipped(reason @ SkipReason::MalformedPayload { .. })) => (
            StatusCode::BAD_REQUEST,
            Json(CarbonFootprintResponse::error(reason.to_string())),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(CarbonFootprintResponse::error(format!(
                "Calculation failed: {e}"
            ))),
        ),
    }
}

/// The caller's sustainability summary.
pub async fn dashboard_handler(
    State(state): State<AppState>,
    caller: Option<Extension<Caller>>,
    Query(query): Query<DashboardQuery>,
) -> impl IntoResponse {
    let Some(user) = caller.as_ref().and_then(|Extension(c)| c.user()).cloned() else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(DashboardResponse::error("Unauthorized".to_string())),
        );
    };

    let period = match query.period.as_deref() {
        None => PeriodType::default(),
        Some(p) => match p.parse::<PeriodType>() {
            Ok(p) => p,
            Err(e) => return failure(&e),
        },
    };

    let summary = {
        let store = state.store.read().await;
        Aggregator::summarize(&*store, &user, period, state.pipeline.clock.now())
    };
    let profile = state
        .config
        .profiles
        .get(user.as_str())
        .cloned()
        .unwrap_or_default();

    match summary {
        Ok(summary) => (
            StatusCode::OK,
            Json(DashboardResponse::success(
                summary,
                profile.practices,
                profile.certifications,
            )),
        ),
        Err(e) => failure(&e),
    }
}
