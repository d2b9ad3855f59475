//! # Emission Factor Catalog
//!
//! Administrative writes to the factor store. Factors are never physically
//! removed; `set_active(false)` hides them from resolution.

use crate::primitives::{MAX_FACTOR_YEAR, MIN_FACTOR_YEAR};
use crate::store::LedgerStore;
use crate::{EmissionFactor, FactorId, NewFactor, TraceError};

/// Factor administration.
pub struct FactorCatalog;

impl FactorCatalog {
    /// Validate a submitted factor.
    ///
    /// A factor is valid if:
    /// - region, activity type and unit are non-empty
    /// - value is finite and non-negative
    /// - year lies within `MIN_FACTOR_YEAR..=MAX_FACTOR_YEAR`
    pub fn validate(factor: &NewFactor) -> Result<(), TraceError> {
        if factor.region.trim().is_empty() {
            return Err(TraceError::validation("region", "must not be empty"));
        }
        if factor.activity_type.trim().is_empty() {
            return Err(TraceError::validation("activityType", "must not be empty"));
        }
        if factor.unit.trim().is_empty() {
            return Err(TraceError::validation("unit", "must not be empty"));
        }
        if !factor.value.is_finite() || factor.value < 0.0 {
            return Err(TraceError::validation(
                "value",
                "must be a non-negative number",
            ));
        }
        if !(MIN_FACTOR_YEAR..=MAX_FACTOR_YEAR).contains(&factor.year) {
            return Err(TraceError::validation(
                "year",
                format!("must be between {MIN_FACTOR_YEAR} and {MAX_FACTOR_YEAR}"),
            ));
        }
        Ok(())
    }

    /// Register a new active factor.
    pub fn register<S: LedgerStore + ?Sized>(
        store: &mut S,
        factor: NewFactor,
    ) -> Result<EmissionFactor, TraceError> {
        Self::validate(&factor)?;
        store.insert_factor(EmissionFactor {
            id: FactorId::generate(),
            revision: 0,
            region: factor.region.trim().to_string(),
            activity_type: factor.activity_type.trim().to_string(),
            input_type: non_blank(factor.input_type),
            factor_type: non_blank(factor.factor_type),
            year: factor.year,
            value: factor.value,
            unit: factor.unit,
            source: factor.source,
            is_active: true,
        })
    }

    /// Register many factors; nothing is written unless all are valid.
    pub fn import<S: LedgerStore + ?Sized>(
        store: &mut S,
        factors: Vec<NewFactor>,
    ) -> Result<Vec<EmissionFactor>, TraceError> {
        for factor in &factors {
            Self::validate(factor)?;
        }
        factors
            .into_iter()
            .map(|f| Self::register(store, f))
            .collect()
    }

    /// Soft delete (or restore) a factor.
    pub fn set_active<S: LedgerStore + ?Sized>(
        store: &mut S,
        id: &FactorId,
        active: bool,
    ) -> Result<EmissionFactor, TraceError> {
        store.set_factor_active(id, active)
    }

    /// All factors in insertion order.
    pub fn list<S: LedgerStore + ?Sized>(store: &S) -> Result<Vec<EmissionFactor>, TraceError> {
        store.factors()
    }
}

/// Optional key parts: blank means absent.
fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn urea(year: i32, value: f64) -> NewFactor {
        NewFactor {
            region: "Global".into(),
            activity_type: "INPUT_APPLIED".into(),
            input_type: Some("urea".into()),
            factor_type: Some("kg".into()),
            year,
            value,
            unit: "kg CO2e".into(),
            source: "IPCC 2019".into(),
        }
    }

    #[test]
    fn register_assigns_id_and_revision() {
        let mut store = MemoryStore::new();
        let a = FactorCatalog::register(&mut store, urea(2018, 1.1)).expect("a");
        let b = FactorCatalog::register(&mut store, urea(2021, 1.3)).expect("b");
        assert_ne!(a.id, b.id);
        assert!(b.revision > a.revision);
        assert!(a.is_active);
    }

    #[test]
    fn register_rejects_bad_factors() {
        let mut store = MemoryStore::new();
        assert!(FactorCatalog::register(&mut store, urea(2020, -0.1)).is_err());
        assert!(FactorCatalog::register(&mut store, urea(1800, 1.0)).is_err());
        assert!(FactorCatalog::register(&mut store, urea(2020, f64::NAN)).is_err());

        let blank_unit = NewFactor {
            unit: " ".into(),
            ..urea(2020, 1.0)
        };
        let err = FactorCatalog::register(&mut store, blank_unit).expect_err("blank unit");
        assert!(matches!(err, TraceError::Validation { field: "unit", .. }));
        assert!(FactorCatalog::list(&store).expect("list").is_empty());
    }

    #[test]
    fn blank_optional_keys_become_absent() {
        let mut store = MemoryStore::new();
        let factor = FactorCatalog::register(
            &mut store,
            NewFactor {
                input_type: Some("".into()),
                factor_type: None,
                ..urea(2020, 1.0)
            },
        )
        .expect("register");
        assert_eq!(factor.input_type, None);
    }

    #[test]
    fn import_is_all_or_nothing() {
        let mut store = MemoryStore::new();
        let result = FactorCatalog::import(&mut store, vec![urea(2020, 1.0), urea(2020, -1.0)]);
        assert!(result.is_err());
        assert!(FactorCatalog::list(&store).expect("list").is_empty());

        let ok = FactorCatalog::import(&mut store, vec![urea(2020, 1.0), urea(2021, 1.2)])
            .expect("import");
        assert_eq!(ok.len(), 2);
    }

    #[test]
    fn set_active_unknown_factor() {
        let mut store = MemoryStore::new();
        let err = FactorCatalog::set_active(&mut store, &FactorId::new("nope"), false)
            .expect_err("unknown");
        assert!(matches!(err, TraceError::FactorNotFound(_)));
    }
}
