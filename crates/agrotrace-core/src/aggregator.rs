//! # Sustainability Aggregator
//!
//! Windowed roll-ups of a user's carbon footprint records.
//!
//! - Current window: `[now - w, now]`
//! - Previous window: `[now - 2w, now - w)`, so a record on the shared
//!   boundary is counted once, in the current window
//! - Totals are rounded to two decimals after the trend is computed

use crate::store::{LedgerStore, TimeRange};
use crate::{TraceError, VtiId};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Unit reported on summaries.
pub const SUMMARY_UNIT: &str = "kg CO2e";

/// Fixed lookback windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    #[default]
    Month,
    Quarter,
    Year,
}

impl PeriodType {
    /// Window length in days.
    #[must_use]
    pub const fn days(self) -> i64 {
        match self {
            Self::Month => 30,
            Self::Quarter => 90,
            Self::Year => 365,
        }
    }

    #[must_use]
    pub fn window(self) -> TimeDelta {
        TimeDelta::days(self.days())
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::Year => "year",
        }
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeriodType {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "month" => Ok(Self::Month),
            "quarter" => Ok(Self::Quarter),
            "year" => Ok(Self::Year),
            other => Err(TraceError::validation(
                "period",
                format!("expected month, quarter or year, got '{other}'"),
            )),
        }
    }
}

/// A user's footprint over one window compared with the one before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub user_id: VtiId,
    pub period: PeriodType,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_emissions: f64,
    pub record_count: usize,
    pub previous_total_emissions: f64,
    pub previous_record_count: usize,
    pub trend_percent: f64,
    pub unit: String,
    /// Current-window totals per record category.
    pub by_category: BTreeMap<String, f64>,
}

/// The Sustainability Aggregator.
pub struct Aggregator;

impl Aggregator {
    /// Summarize `user`'s records for the window of `period` ending at `now`.
    pub fn summarize<S: LedgerStore + ?Sized>(
        store: &S,
        user: &VtiId,
        period: PeriodType,
        now: DateTime<Utc>,
    ) -> Result<Summary, TraceError> {
        let window = period.window();
        let start = now - window;

        let current = store.records_for_user(user, TimeRange::closed(start, now))?;
        let previous = store.records_for_user(user, TimeRange::half_open(start - window, start))?;

        let total: f64 = current.iter().map(|r| r.calculated_emissions).sum();
        let previous_total: f64 = previous.iter().map(|r| r.calculated_emissions).sum();

        let mut by_category: BTreeMap<String, f64> = BTreeMap::new();
        for record in &current {
            *by_category.entry(record.category.clone()).or_insert(0.0) +=
                record.calculated_emissions;
        }
        for value in by_category.values_mut() {
            *value = round2(*value);
        }

        Ok(Summary {
            user_id: user.clone(),
            period,
            window_start: start,
            window_end: now,
            total_emissions: round2(total),
            record_count: current.len(),
            previous_total_emissions: round2(previous_total),
            previous_record_count: previous.len(),
            trend_percent: round2(trend_percent(total, previous_total)),
            unit: SUMMARY_UNIT.to_string(),
            by_category,
        })
    }
}

/// Percentage change from `previous` to `current`; zero when there is no
/// previous total to compare against.
#[must_use]
pub fn trend_percent(current: f64, previous: f64) -> f64 {
    if previous > 0.0 {
        (current - previous) / previous * 100.0
    } else {
        0.0
    }
}

/// Round to two decimal places.
#[must_use]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::{
        Attributes, CarbonFootprintRecord, EventId, EventType, FactorId, FactorSnapshot,
        RecordId,
    };
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0)
            .single()
            .expect("date")
    }

    fn record(n: u32, at: DateTime<Utc>, emissions: f64, category: &str) -> CarbonFootprintRecord {
        CarbonFootprintRecord {
            id: RecordId::new(format!("r{n}")),
            source_event_id: EventId::new(format!("e{n}")),
            vti_id: None,
            user_ref: VtiId::new("farmer"),
            event_type: EventType::new(EventType::INPUT_APPLIED),
            timestamp: at,
            calculated_emissions: emissions,
            unit: "kg CO2e".into(),
            emission_factor_used: FactorSnapshot {
                factor_id: FactorId::new("f"),
                value: 1.0,
                unit: "kg CO2e".into(),
                source: "test".into(),
                region: "Global".into(),
                year: 2020,
            },
            data_source: "traceability_event".into(),
            region: "Global".into(),
            category: category.into(),
            subcategory: "urea".into(),
            details: Attributes::new(),
            created_at: at,
        }
    }

    #[test]
    fn trend_math() {
        assert_eq!(trend_percent(120.0, 100.0), 20.0);
        assert_eq!(trend_percent(80.0, 100.0), -20.0);
        assert_eq!(trend_percent(500.0, 0.0), 0.0);
    }

    #[test]
    fn rounds_to_two_decimals() {
        assert_eq!(round2(1.005_1), 1.01);
        assert_eq!(round2(2.344), 2.34);
    }

    #[test]
    fn period_parsing() {
        assert_eq!("quarter".parse::<PeriodType>().ok(), Some(PeriodType::Quarter));
        assert!("week".parse::<PeriodType>().is_err());
        assert_eq!(PeriodType::Year.days(), 365);
    }

    #[test]
    fn windows_split_current_and_previous() {
        let mut store = MemoryStore::new();
        let now = now();
        store
            .commit_record(&record(1, now - TimeDelta::days(2), 70.0, "farm_inputs"))
            .expect("commit");
        store
            .commit_record(&record(2, now - TimeDelta::days(20), 50.0, "transport"))
            .expect("commit");
        store
            .commit_record(&record(3, now - TimeDelta::days(45), 100.0, "farm_inputs"))
            .expect("commit");
        store
            .commit_record(&record(4, now - TimeDelta::days(75), 999.0, "farm_inputs"))
            .expect("commit");

        let summary = Aggregator::summarize(&store, &VtiId::new("farmer"), PeriodType::Month, now)
            .expect("summary");
        assert_eq!(summary.total_emissions, 120.0);
        assert_eq!(summary.record_count, 2);
        assert_eq!(summary.previous_total_emissions, 100.0);
        assert_eq!(summary.trend_percent, 20.0);
        assert_eq!(summary.by_category.get("transport"), Some(&50.0));
        assert_eq!(summary.unit, "kg CO2e");
    }

    #[test]
    fn boundary_record_counted_once() {
        let mut store = MemoryStore::new();
        let now = now();
        store
            .commit_record(&record(1, now - TimeDelta::days(30), 10.0, "farm_inputs"))
            .expect("commit");

        let summary = Aggregator::summarize(&store, &VtiId::new("farmer"), PeriodType::Month, now)
            .expect("summary");
        assert_eq!(summary.record_count, 1);
        assert_eq!(summary.previous_record_count, 0);
        assert_eq!(summary.trend_percent, 0.0);
    }

    #[test]
    fn other_users_are_excluded() {
        let mut store = MemoryStore::new();
        let mut foreign = record(1, now(), 10.0, "farm_inputs");
        foreign.user_ref = VtiId::new("neighbour");
        store.commit_record(&foreign).expect("commit");

        let summary = Aggregator::summarize(&store, &VtiId::new("farmer"), PeriodType::Year, now())
            .expect("summary");
        assert_eq!(summary.record_count, 0);
        assert_eq!(summary.total_emissions, 0.0);
    }
}
