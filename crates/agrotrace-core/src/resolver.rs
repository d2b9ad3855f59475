//! # Emission Factor Resolver
//!
//! Regional lookup with a single fallback step:
//! 1. Active factors matching the exact key in the requested region
//! 2. The same key in the `Global` region
//! 3. Otherwise no factor (a soft miss, never an error)
//!
//! Within a region the most recent `year` wins. Ties on year are broken by
//! insertion revision according to the configured `TieBreak`.

use crate::primitives::GLOBAL_REGION;
use crate::store::LedgerStore;
use crate::{EmissionFactor, FactorQuery, TraceError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Which factor wins when several share the maximum year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// The most recently registered factor wins.
    #[default]
    LatestInserted,
    /// The first registered factor wins.
    EarliestInserted,
}

/// Factor resolution over a ledger store.
#[derive(Debug, Clone, Copy, Default)]
pub struct Resolver {
    tie_break: TieBreak,
}

impl Resolver {
    #[must_use]
    pub const fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }

    #[must_use]
    pub const fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Resolve a factor, falling back to `Global` once.
    pub fn resolve<S: LedgerStore + ?Sized>(
        &self,
        store: &S,
        query: &FactorQuery,
    ) -> Result<Option<EmissionFactor>, TraceError> {
        if let Some(found) = self.best_in_region(store, query)? {
            return Ok(Some(found));
        }
        if query.region == GLOBAL_REGION {
            return Ok(None);
        }
        self.best_in_region(store, &query.in_region(GLOBAL_REGION))
    }

    fn best_in_region<S: LedgerStore + ?Sized>(
        &self,
        store: &S,
        query: &FactorQuery,
    ) -> Result<Option<EmissionFactor>, TraceError> {
        Ok(store
            .factors_for(&query.region, &query.activity_type)?
            .into_iter()
            .filter(|f| query.matches(f))
            .max_by(|a, b| self.rank(a, b)))
    }

    fn rank(&self, a: &EmissionFactor, b: &EmissionFactor) -> Ordering {
        let by_revision = match self.tie_break {
            TieBreak::LatestInserted => a.revision.cmp(&b.revision),
            TieBreak::EarliestInserted => b.revision.cmp(&a.revision),
        };
        a.year.cmp(&b.year).then(by_revision)
    }
}
