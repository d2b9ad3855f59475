//! # Region Resolution
//!
//! Maps an acting user to the region used for emission factor lookup.
//! Every lookup runs under a timeout; a miss or a timeout degrades to the
//! global factor set instead of failing the calculation.

use agrotrace_core::VtiId;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

/// A source of user regions.
pub trait RegionSource: Send + Sync {
    fn region_for(&self, actor: &VtiId) -> impl Future<Output = Option<String>> + Send;
}

/// Region table loaded from the `[regions]` configuration section.
#[derive(Debug, Clone, Default)]
pub struct StaticRegions {
    table: BTreeMap<String, String>,
}

impl StaticRegions {
    #[must_use]
    pub fn new(table: BTreeMap<String, String>) -> Self {
        Self { table }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl RegionSource for StaticRegions {
    async fn region_for(&self, actor: &VtiId) -> Option<String> {
        self.table
            .get(actor.as_str())
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
    }
}

/// Resolve `actor`'s region, giving up after `timeout`.
///
/// `None` means the calculator falls back to `Global`.
pub async fn resolve_region<R: RegionSource>(
    source: &R,
    actor: &VtiId,
    timeout: Duration,
) -> Option<String> {
    if let Ok(region) = tokio::time::timeout(timeout, source.region_for(actor)).await {
        region
    } else {
        tracing::warn!(
            event = "region_timeout",
            actor = %actor,
            timeout_ms = timeout.as_millis() as u64,
            "Region lookup timed out, using Global"
        );
        None
    }
}
