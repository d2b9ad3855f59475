//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use agrotrace::api::{self, AppState, FactorJson, PendingJson};
use agrotrace::config::Config;
use agrotrace::trigger::{recalculate, spawn_worker};
use agrotrace_core::{
    Aggregator, FactorCatalog, FactorQuery, Ledger, LedgerStore, NewFactor, PeriodType, Resolver,
    StorageBackend, TraceError, TraceEvent, VtiId,
};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum file size for factor import (10 MB).
const MAX_IMPORT_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), TraceError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| TraceError::Storage(format!("Cannot read file metadata: {e}")))?;

    if metadata.len() > max_size {
        return Err(TraceError::validation(
            "file",
            format!(
                "size {} bytes exceeds maximum allowed {} bytes",
                metadata.len(),
                max_size
            ),
        ));
    }
    Ok(())
}

/// Canonicalize an input path and make sure it names a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, TraceError> {
    let canonical = path.canonicalize().map_err(|e| {
        TraceError::Storage(format!("Invalid file path '{}': {e}", path.display()))
    })?;

    if !canonical.is_file() {
        return Err(TraceError::Storage(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_default()
    );
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

/// Start the HTTP server with the background calculation worker.
pub async fn cmd_server(
    db_path: &Path,
    backend: &str,
    config: Config,
    host: Option<String>,
    port: Option<u16>,
) -> Result<(), TraceError> {
    let store = open_store(db_path, backend)?;
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    let trigger = config.trigger.clone();
    let regions = config.regions.len();

    let state = AppState::new(store, config);
    let (delivery, worker) = spawn_worker(Arc::clone(&state.pipeline), &trigger);
    let state = state.with_delivery(delivery);

    println!("AgroTrace Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Host:     {}", host);
    println!("  Port:     {}", port);
    println!("  Backend:  {}", backend);
    println!("  Database: {:?}", db_path);
    println!("  Regions:  {}", regions);
    println!();
    println!("Endpoints:");
    println!("  POST /vti               - Create a VTI");
    println!("  POST /events            - Append a ledger event");
    println!("  POST /factors           - Register an emission factor");
    println!("  POST /carbon-footprint  - Calculate a submitted event");
    println!("  GET  /dashboard         - Caller's carbon summary");
    println!("  GET  /status            - Store counts");
    println!("  GET  /health            - Health check");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let addr = format!("{}:{}", host, port);
    let served = api::run_server(&addr, state).await;

    // Every delivery handle is gone with the router; the worker drains and exits.
    if let Err(e) = worker.await {
        tracing::error!("Calculation worker failed: {}", e);
    }
    served
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Create an empty database.
pub fn cmd_init(db_path: &Path, backend: &str, force: bool) -> Result<(), TraceError> {
    if backend != "redb" {
        return Err(TraceError::validation(
            "backend",
            "only the redb backend has a database to initialize",
        ));
    }
    if db_path.exists() {
        if !force {
            return Err(TraceError::Storage(
                "Database already exists. Use --force to overwrite.".to_string(),
            ));
        }
        std::fs::remove_file(db_path)
            .map_err(|e| TraceError::Storage(format!("Remove {}: {e}", db_path.display())))?;
    }

    let _store = StorageBackend::open(db_path)?;
    println!("Initialized new redb database at {:?}", db_path);
    Ok(())
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show store counts.
pub fn cmd_status(db_path: &Path, backend: &str, json_mode: bool) -> Result<(), TraceError> {
    let store = open_store(db_path, backend)?;
    let vtis = store.vti_count()?;
    let events = store.event_count()?;
    let factors = store.factors()?.len();
    let records = store.record_count()?;
    let pending = store.pending()?.len();

    if json_mode {
        print_json(&serde_json::json!({
            "database": db_path.to_string_lossy(),
            "backend": backend,
            "vti_count": vtis,
            "event_count": events,
            "factor_count": factors,
            "record_count": records,
            "pending_count": pending
        }));
        return Ok(());
    }

    println!("AgroTrace Ledger Status");
    println!("=======================");
    println!("Database: {:?}", db_path);
    println!("Backend:  {}", backend);
    println!();
    println!("VTIs:     {}", vtis);
    println!("Events:   {}", events);
    println!("Factors:  {}", factors);
    println!("Records:  {}", records);
    println!("Pending:  {}", pending);

    Ok(())
}

// =============================================================================
// FACTOR COMMANDS
// =============================================================================

/// Import a JSON array of factors; nothing is written unless all are valid.
pub fn cmd_factors_import(
    db_path: &Path,
    backend: &str,
    json_mode: bool,
    file: &Path,
) -> Result<(), TraceError> {
    let file = validate_file_path(file)?;
    validate_file_size(&file, MAX_IMPORT_FILE_SIZE)?;

    let text = std::fs::read_to_string(&file)
        .map_err(|e| TraceError::Storage(format!("Read {}: {e}", file.display())))?;
    let factors: Vec<NewFactor> = serde_json::from_str(&text)
        .map_err(|e| TraceError::Serialization(format!("Invalid factor file: {e}")))?;

    let mut store = open_store(db_path, backend)?;
    let imported = FactorCatalog::import(&mut store, factors)?;
    tracing::info!(event = "factors_imported", count = imported.len(), "Factors imported");

    if json_mode {
        print_json(&serde_json::json!({
            "imported": imported.len(),
            "factors": imported.iter().map(FactorJson::from).collect::<Vec<_>>()
        }));
    } else {
        println!("Imported {} emission factors from {:?}", imported.len(), file);
    }
    Ok(())
}

/// List all factors.
pub fn cmd_factors_list(db_path: &Path, backend: &str, json_mode: bool) -> Result<(), TraceError> {
    let store = open_store(db_path, backend)?;
    let factors = FactorCatalog::list(&store)?;

    if json_mode {
        print_json(&serde_json::json!({
            "factors": factors.iter().map(FactorJson::from).collect::<Vec<_>>()
        }));
        return Ok(());
    }

    println!("Emission Factors ({})", factors.len());
    println!("=================");
    for f in &factors {
        println!(
            "{} [{}] {}/{}/{}/{} {} = {} {} ({}){}",
            f.id,
            f.revision,
            f.region,
            f.activity_type,
            f.input_type.as_deref().unwrap_or("-"),
            f.factor_type.as_deref().unwrap_or("-"),
            f.year,
            f.value,
            f.unit,
            f.source,
            if f.is_active { "" } else { " inactive" }
        );
    }
    Ok(())
}

/// Show which factor a key resolves to.
pub fn cmd_factors_resolve(
    db_path: &Path,
    backend: &str,
    json_mode: bool,
    config: &Config,
    region: &str,
    activity: &str,
    input: Option<String>,
    factor_type: Option<String>,
) -> Result<(), TraceError> {
    let store = open_store(db_path, backend)?;
    let mut query = FactorQuery::new(region, activity);
    if let Some(input) = input {
        query = query.input(input);
    }
    if let Some(factor_type) = factor_type {
        query = query.factor(factor_type);
    }

    let resolved = Resolver::new(config.engine.tie_break).resolve(&store, &query)?;

    if json_mode {
        print_json(&serde_json::json!({
            "factor": resolved.as_ref().map(FactorJson::from),
            "message": if resolved.is_none() { Some("not found") } else { None }
        }));
        return Ok(());
    }

    match resolved {
        Some(f) => println!(
            "{} ({} {}): {} {} from {}",
            f.id, f.region, f.year, f.value, f.unit, f.source
        ),
        None => println!("not found"),
    }
    Ok(())
}

// =============================================================================
// SUMMARY COMMAND
// =============================================================================

/// Show a user's summary for the window ending now.
pub fn cmd_summary(
    db_path: &Path,
    backend: &str,
    json_mode: bool,
    user: &str,
    period: &str,
) -> Result<(), TraceError> {
    let period: PeriodType = period.parse()?;
    let store = open_store(db_path, backend)?;
    let summary = Aggregator::summarize(&store, &VtiId::new(user), period, Utc::now())?;

    if json_mode {
        print_json(&serde_json::to_value(&summary).unwrap_or_default());
        return Ok(());
    }

    println!("Carbon Summary: {} ({})", summary.user_id, summary.period);
    println!("==============");
    println!(
        "Window:   {} .. {}",
        summary.window_start.to_rfc3339(),
        summary.window_end.to_rfc3339()
    );
    println!(
        "Total:    {} {} ({} records)",
        summary.total_emissions, summary.unit, summary.record_count
    );
    println!(
        "Previous: {} {} ({} records)",
        summary.previous_total_emissions, summary.unit, summary.previous_record_count
    );
    println!("Trend:    {}%", summary.trend_percent);
    for (category, total) in &summary.by_category {
        println!("  {:<16} {}", category, total);
    }
    Ok(())
}

// =============================================================================
// EVENTS COMMAND
// =============================================================================

/// List a VTI's events.
pub fn cmd_events(
    db_path: &Path,
    backend: &str,
    json_mode: bool,
    vti: &str,
    limit: usize,
) -> Result<(), TraceError> {
    let store = open_store(db_path, backend)?;
    let vti = VtiId::new(vti);
    if store.get_vti(&vti)?.is_none() {
        return Err(TraceError::VtiNotFound(vti));
    }
    let events: Vec<TraceEvent> = Ledger::query_by_vti(&store, &vti)
        .take(limit)
        .collect::<Result<_, _>>()?;

    if json_mode {
        print_json(&serde_json::json!({
            "vti": vti.as_str(),
            "events": events.iter().map(api::EventJson::from).collect::<Vec<_>>()
        }));
        return Ok(());
    }

    println!("Events for {} ({})", vti, events.len());
    for e in &events {
        println!(
            "{}  {:<14} {}  by {}",
            e.timestamp.to_rfc3339(),
            e.event_type,
            e.id,
            e.actor_ref
        );
    }
    Ok(())
}

// =============================================================================
// PENDING COMMAND
// =============================================================================

/// List pending calculations.
pub fn cmd_pending(db_path: &Path, backend: &str, json_mode: bool) -> Result<(), TraceError> {
    let store = open_store(db_path, backend)?;
    let pending = store.pending()?;

    if json_mode {
        print_json(&serde_json::json!({
            "pending": pending.iter().map(PendingJson::from).collect::<Vec<_>>()
        }));
        return Ok(());
    }

    println!("Pending Calculations ({})", pending.len());
    for p in &pending {
        println!("{}  {}  {}", p.event_id, p.event_type, p.reason);
    }
    Ok(())
}

// =============================================================================
// RECALCULATE COMMAND
// =============================================================================

/// Replay carbon-relevant events whose calculation never completed.
pub async fn cmd_recalculate(
    db_path: &Path,
    backend: &str,
    json_mode: bool,
    config: Config,
) -> Result<(), TraceError> {
    let store = open_store(db_path, backend)?;
    let state = AppState::new(store, config);
    let totals = recalculate(&state.pipeline).await?;

    if json_mode {
        print_json(&serde_json::json!({
            "scanned": totals.scanned,
            "delivered": totals.delivered,
            "recorded": totals.recorded,
            "failed": totals.failed,
        }));
        return Ok(());
    }

    println!("Recalculation");
    println!("  Events scanned:  {}", totals.scanned);
    println!("  Redelivered:     {}", totals.delivered);
    println!("  Records written: {}", totals.recorded);
    println!("  Failed:          {}", totals.failed);
    Ok(())
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Open the store for the selected backend.
pub fn open_store(db_path: &Path, backend: &str) -> Result<StorageBackend, TraceError> {
    match backend {
        "redb" => StorageBackend::open(db_path),
        "memory" => Ok(StorageBackend::memory()),
        other => Err(TraceError::validation(
            "backend",
            format!("expected redb or memory, got '{other}'"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(matches!(
            open_store(Path::new("unused.db"), "file"),
            Err(TraceError::Validation { field: "backend", .. })
        ));
    }

    #[test]
    fn import_is_all_or_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("ledger.db");
        let file = dir.path().join("factors.json");
        std::fs::write(
            &file,
            r#"[
                {"region": "Global", "activityType": "INPUT_APPLIED", "inputType": "urea",
                 "factorType": "kg", "year": 2020, "value": 1.5, "unit": "kg CO2e"},
                {"region": "", "activityType": "INPUT_APPLIED", "year": 2020,
                 "value": 1.0, "unit": "kg CO2e"}
            ]"#,
        )
        .expect("write");

        let result = cmd_factors_import(&db, "redb", true, &file);
        assert!(matches!(
            result,
            Err(TraceError::Validation { field: "region", .. })
        ));
        let store = open_store(&db, "redb").expect("open");
        assert_eq!(store.factors().expect("factors").len(), 0);
    }

    #[test]
    fn init_refuses_existing_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("ledger.db");
        cmd_init(&db, "redb", false).expect("init");
        assert!(cmd_init(&db, "redb", false).is_err());
        cmd_init(&db, "redb", true).expect("forced init");
    }

    #[tokio::test]
    async fn recalculate_records_missed_inputs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("ledger.db");
        {
            let mut store = open_store(&db, "redb").expect("open");
            let clock = agrotrace_core::SystemClock;
            FactorCatalog::register(
                &mut store,
                NewFactor {
                    region: "Global".into(),
                    activity_type: "INPUT_APPLIED".into(),
                    input_type: Some("urea".into()),
                    factor_type: Some("kg".into()),
                    year: 2020,
                    value: 1.5,
                    unit: "kg CO2e".into(),
                    source: "test".into(),
                },
            )
            .expect("factor");
            let farmer = agrotrace_core::Registry::create(
                &mut store,
                &clock,
                agrotrace_core::NewVti::new(agrotrace_core::VtiType::User),
            )
            .expect("farmer");
            Ledger::append(
                &mut store,
                &clock,
                agrotrace_core::NewEvent::new(farmer.id.clone(), "INPUT_APPLIED", farmer.id)
                    .with_attr("inputType", "urea")
                    .with_attr("quantity", 4.0)
                    .with_attr("unit", "kg"),
            )
            .expect("append");
        }

        cmd_recalculate(&db, "redb", true, Config::default())
            .await
            .expect("recalculate");
        let store = open_store(&db, "redb").expect("reopen");
        assert_eq!(store.record_count().expect("count"), 1);
    }
}
