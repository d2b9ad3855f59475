//! # Calculation Trigger
//!
//! Connects ledger appends to the carbon footprint calculator.
//!
//! Every successful append produces a `CalculationRequest`. In queued mode
//! requests go through a bounded channel to a worker task; in inline mode
//! the appending request runs the calculation itself. Either way a delivery
//! that fails with a retryable error is redelivered with linear backoff, and
//! the calculator's idempotency makes redelivery safe.
//!
//! Events whose delivery was abandoned can be replayed later with
//! [`recalculate`], which sweeps the ledger for carbon-relevant events that
//! have neither a record nor a pending marker.

use crate::config::TriggerConfig;
use crate::regions::{StaticRegions, resolve_region};
use agrotrace_core::primitives::EVENT_PAGE_SIZE;
use agrotrace_core::{
    CalculationObserver, CalculationOutcome, CalculationRequest, Calculator, Clock, EventId,
    LedgerStore, StorageBackend, TraceError,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

/// Store shared between the HTTP handlers and the worker.
pub type SharedStore = Arc<RwLock<StorageBackend>>;

// =============================================================================
// OBSERVER
// =============================================================================

/// Logs every calculation outcome through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl CalculationObserver for TracingObserver {
    fn observe(&self, request: &CalculationRequest, outcome: &CalculationOutcome) {
        match outcome {
            CalculationOutcome::Recorded(record) => tracing::info!(
                event = "carbon_recorded",
                source_event = %request.event_id,
                record = %record.id,
                emissions = record.calculated_emissions,
                unit = %record.unit,
                region = %record.region,
                "Carbon footprint recorded"
            ),
            CalculationOutcome::AlreadyRecorded(record) => tracing::debug!(
                event = "carbon_duplicate",
                source_event = %request.event_id,
                record = %record.id,
                "Redelivery ignored"
            ),
            CalculationOutcome::Pending(marker) => tracing::info!(
                event = "carbon_pending",
                source_event = %request.event_id,
                reason = %marker.reason,
                "Calculation marked pending"
            ),
            CalculationOutcome::AlreadyPending => tracing::debug!(
                event = "carbon_pending_duplicate",
                source_event = %request.event_id,
                "Pending marker already present"
            ),
            CalculationOutcome::Skipped(reason) if reason.is_warning() => tracing::warn!(
                event = "carbon_skipped",
                source_event = %request.event_id,
                reason = %reason,
                "Calculation skipped"
            ),
            CalculationOutcome::Skipped(reason) => tracing::debug!(
                event = "carbon_skipped",
                source_event = %request.event_id,
                reason = %reason,
                "Calculation skipped"
            ),
        }
    }
}

/// Short machine-readable name of an outcome.
#[must_use]
pub fn outcome_label(outcome: &CalculationOutcome) -> &'static str {
    match outcome {
        CalculationOutcome::Recorded(_) => "recorded",
        CalculationOutcome::AlreadyRecorded(_) => "already_recorded",
        CalculationOutcome::Pending(_) => "pending",
        CalculationOutcome::AlreadyPending => "already_pending",
        CalculationOutcome::Skipped(_) => "skipped",
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

/// Everything one calculation delivery needs.
pub struct Pipeline {
    pub store: SharedStore,
    pub clock: Arc<dyn Clock>,
    pub calculator: Calculator,
    pub regions: StaticRegions,
    pub region_timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl Pipeline {
    /// Run one delivery: resolve the region, then calculate under the write lock.
    pub async fn deliver(
        &self,
        request: &CalculationRequest,
    ) -> Result<CalculationOutcome, TraceError> {
        let region = resolve_region(&self.regions, &request.user_ref, self.region_timeout).await;
        let mut store = self.store.write().await;
        self.calculator.on_event_appended(
            &mut *store,
            self.clock.as_ref(),
            request,
            region.as_deref(),
            &TracingObserver,
        )
    }

    /// Deliver, redelivering on retryable failures up to `max_attempts`.
    pub async fn deliver_with_retry(
        &self,
        request: &CalculationRequest,
    ) -> Result<CalculationOutcome, TraceError> {
        let mut attempt: u32 = 1;
        loop {
            match self.deliver(request).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    tracing::warn!(
                        event = "carbon_retry",
                        source_event = %request.event_id,
                        attempt,
                        error = %e,
                        "Calculation failed, redelivering"
                    );
                    tokio::time::sleep(self.backoff_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delay before redelivery number `attempt`, growing linearly.
    fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(attempt)
    }
}

// =============================================================================
// RECALCULATION
// =============================================================================

/// Totals from one [`recalculate`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recalculation {
    pub scanned: usize,
    pub delivered: usize,
    pub recorded: usize,
    pub failed: usize,
}

/// Redeliver every carbon-relevant ledger event that has no record and no
/// pending marker.
///
/// The ledger is read one page at a time and the store lock is released
/// between deliveries. A delivery that still fails is logged and counted;
/// the sweep continues with the next event.
pub async fn recalculate(pipeline: &Pipeline) -> Result<Recalculation, TraceError> {
    let pending: BTreeSet<EventId> = pipeline
        .store
        .read()
        .await
        .pending()?
        .into_iter()
        .map(|p| p.event_id)
        .collect();

    let mut totals = Recalculation::default();
    let mut after: Option<EventId> = None;
    loop {
        let page = pipeline
            .store
            .read()
            .await
            .events_page(after.as_ref(), EVENT_PAGE_SIZE)?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.id.clone());

        for event in &page {
            totals.scanned += 1;
            if !Calculator::is_relevant(&event.event_type) || pending.contains(&event.id) {
                continue;
            }
            if pipeline.store.read().await.record_for_event(&event.id)?.is_some() {
                continue;
            }
            totals.delivered += 1;
            match pipeline.deliver_with_retry(&CalculationRequest::from(event)).await {
                Ok(CalculationOutcome::Recorded(_)) => totals.recorded += 1,
                Ok(_) => {}
                Err(e) => {
                    totals.failed += 1;
                    tracing::error!(
                        event = "carbon_failed",
                        source_event = %event.id,
                        error = %e,
                        "Recalculation failed"
                    );
                }
            }
        }

        if page.len() < EVENT_PAGE_SIZE {
            break;
        }
    }

    tracing::info!(
        event = "recalculation_completed",
        scanned = totals.scanned,
        delivered = totals.delivered,
        recorded = totals.recorded,
        failed = totals.failed,
        "Ledger recalculation completed"
    );
    Ok(totals)
}

// =============================================================================
// DELIVERY
// =============================================================================

/// How appended events reach the calculator.
#[derive(Clone)]
pub enum Delivery {
    /// The appending request runs the calculation before responding.
    Inline,
    /// Requests are queued for the background worker.
    Queued(mpsc::Sender<CalculationRequest>),
}

/// Result of handing an appended event to the trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Completed(CalculationOutcome),
    Queued,
}

impl Dispatch {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed(outcome) => outcome_label(outcome),
            Self::Queued => "queued",
        }
    }
}

impl Delivery {
    /// Hand a request to the calculator.
    ///
    /// A full queue applies backpressure to the caller.
    pub async fn dispatch(
        &self,
        pipeline: &Pipeline,
        request: CalculationRequest,
    ) -> Result<Dispatch, TraceError> {
        match self {
            Self::Inline => Ok(Dispatch::Completed(
                pipeline.deliver_with_retry(&request).await?,
            )),
            Self::Queued(sender) => {
                sender
                    .send(request)
                    .await
                    .map_err(|_| TraceError::Storage("Calculation queue closed".to_string()))?;
                Ok(Dispatch::Queued)
            }
        }
    }
}

/// Start the background worker; returns its delivery handle and task.
///
/// The worker exits once every `Delivery` clone has been dropped and the
/// queue has drained.
pub fn spawn_worker(
    pipeline: Arc<Pipeline>,
    config: &TriggerConfig,
) -> (Delivery, JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel(config.queue_capacity);
    let handle = tokio::spawn(run_worker(pipeline, receiver));
    (Delivery::Queued(sender), handle)
}

async fn run_worker(pipeline: Arc<Pipeline>, mut receiver: mpsc::Receiver<CalculationRequest>) {
    tracing::info!(event = "trigger_started", "Calculation worker started");
    while let Some(request) = receiver.recv().await {
        if let Err(e) = pipeline.deliver_with_retry(&request).await {
            tracing::error!(
                event = "carbon_failed",
                source_event = %request.event_id,
                error = %e,
                "Calculation abandoned"
            );
        }
    }
    tracing::info!(event = "trigger_stopped", "Calculation worker stopped");
}

// =============================================================================
// TESTS
// =============================================================================
