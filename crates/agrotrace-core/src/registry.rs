//! # VTI Registry
//!
//! Creates and mutates provenance identifiers.
//!
//! - Every link target must exist when the link is written
//! - The link graph stays acyclic; each write walks the upstream closure
//!   breadth-first with a visited set and a depth guard
//! - `archived` is terminal
//! - The footprint aggregate is never written here; only `commit_record`
//!   moves it

use crate::clock::Clock;
use crate::ledger::Ledger;
use crate::primitives::{
    MAX_HARVEST_LOOKBACK_DAYS, MAX_LINK_DEPTH, MAX_LINKED_VTIS, PRE_HARVEST_EVENT_TYPES,
};
use crate::store::LedgerStore;
use crate::{Attributes, TraceError, Vti, VtiId, VtiMetadata, VtiStatus, VtiType};
use chrono::TimeDelta;
use std::collections::{BTreeSet, VecDeque};

/// A VTI as submitted for creation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVti {
    /// Caller-chosen id (imports from external identity systems); generated when absent.
    pub id: Option<VtiId>,
    pub vti_type: VtiType,
    pub linked_vtis: Vec<VtiId>,
    pub attributes: Attributes,
    pub is_public_traceable: bool,
}

impl NewVti {
    #[must_use]
    pub fn new(vti_type: VtiType) -> Self {
        Self {
            id: None,
            vti_type,
            linked_vtis: Vec::new(),
            attributes: Attributes::new(),
            is_public_traceable: false,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(VtiId::new(id));
        self
    }

    #[must_use]
    pub fn linked_to(mut self, target: VtiId) -> Self {
        self.linked_vtis.push(target);
        self
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    #[must_use]
    pub fn public(mut self) -> Self {
        self.is_public_traceable = true;
        self
    }
}

/// Request for the harvest-derived creation path.
#[derive(Debug, Clone, PartialEq)]
pub struct HarvestRequest {
    pub id: Option<VtiId>,
    pub farm_field_id: VtiId,
    /// Extra links besides the originating field.
    pub linked_vtis: Vec<VtiId>,
    pub attributes: Attributes,
    pub is_public_traceable: bool,
}

impl HarvestRequest {
    #[must_use]
    pub fn new(farm_field_id: VtiId) -> Self {
        Self {
            id: None,
            farm_field_id,
            linked_vtis: Vec::new(),
            attributes: Attributes::new(),
            is_public_traceable: false,
        }
    }
}

/// One node of an upstream provenance walk.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvenanceStep {
    /// Distance from the starting VTI (direct links are 1).
    pub depth: usize,
    pub vti: Vti,
}

/// The VTI Registry.
pub struct Registry;

impl Registry {
    /// Create a new VTI.
    ///
    /// # Errors
    /// - `VtiNotFound` naming the first missing link target
    /// - `Cycle` if a link target already reaches the new id
    /// - `DuplicateVti` if a caller-supplied id is taken
    /// - `Validation` for reserved metadata keys or too many links
    pub fn create<S: LedgerStore + ?Sized>(
        store: &mut S,
        clock: &dyn Clock,
        new: NewVti,
    ) -> Result<Vti, TraceError> {
        Self::insert_new(store, clock, new, VtiMetadata::default())
    }

    /// Validate and insert a VTI whose metadata starts from `base`.
    fn insert_new<S: LedgerStore + ?Sized>(
        store: &mut S,
        clock: &dyn Clock,
        new: NewVti,
        base: VtiMetadata,
    ) -> Result<Vti, TraceError> {
        let id = new.id.unwrap_or_else(VtiId::generate);
        if id.as_str().trim().is_empty() {
            return Err(TraceError::validation("id", "must not be empty"));
        }
        if store.get_vti(&id)?.is_some() {
            return Err(TraceError::DuplicateVti(id));
        }

        let linked = Self::checked_targets(store, &id, &new.linked_vtis)?;

        let mut metadata = base;
        metadata.merge(new.attributes)?;

        let vti = Vti {
            id,
            vti_type: new.vti_type,
            status: VtiStatus::Active,
            linked_vtis: linked,
            metadata,
            is_public_traceable: new.is_public_traceable,
            creation_time: clock.now(),
        };
        store.insert_vti(&vti)?;
        Ok(vti)
    }

    /// Create a `farm_batch` linked to its field and to the field's
    /// pre-harvest events within `lookback`.
    ///
    /// Events older than `now - lookback` are not linked even if their type
    /// matches.
    pub fn create_harvest_batch<S: LedgerStore + ?Sized>(
        store: &mut S,
        clock: &dyn Clock,
        request: HarvestRequest,
        lookback: TimeDelta,
    ) -> Result<Vti, TraceError> {
        let field = Self::get(store, &request.farm_field_id)?;
        if field.vti_type != VtiType::FarmField {
            return Err(TraceError::validation(
                "farmFieldId",
                format!("{} is a {}, expected farm_field", field.id, field.vti_type),
            ));
        }
        let within_cap =
            TimeDelta::try_days(MAX_HARVEST_LOOKBACK_DAYS).is_some_and(|max| lookback <= max);
        if lookback < TimeDelta::zero() || !within_cap {
            return Err(TraceError::validation(
                "lookbackDays",
                format!("must be between 0 and {MAX_HARVEST_LOOKBACK_DAYS} days"),
            ));
        }
        let since = clock.now().checked_sub_signed(lookback).ok_or_else(|| {
            TraceError::validation("lookbackDays", "reaches before the earliest timestamp")
        })?;

        let pre_harvest =
            Ledger::query_by_field(store, &field.id, &PRE_HARVEST_EVENT_TYPES, since)?;

        let mut linked = request.linked_vtis;
        if !linked.contains(&field.id) {
            linked.push(field.id.clone());
        }

        let base = VtiMetadata {
            linked_pre_harvest_events: pre_harvest.into_iter().map(|e| e.id).collect(),
            ..VtiMetadata::default()
        };
        Self::insert_new(
            store,
            clock,
            NewVti {
                id: request.id,
                vti_type: VtiType::FarmBatch,
                linked_vtis: linked,
                attributes: request.attributes,
                is_public_traceable: request.is_public_traceable,
            },
            base,
        )
    }

    /// Fetch a VTI.
    pub fn get<S: LedgerStore + ?Sized>(store: &S, id: &VtiId) -> Result<Vti, TraceError> {
        store
            .get_vti(id)?
            .ok_or_else(|| TraceError::VtiNotFound(id.clone()))
    }

    /// Merge a metadata patch; top-level keys replace wholesale.
    pub fn update_metadata<S: LedgerStore + ?Sized>(
        store: &mut S,
        id: &VtiId,
        patch: Attributes,
    ) -> Result<Vti, TraceError> {
        let mut vti = Self::get(store, id)?;
        vti.metadata.merge(patch)?;
        store.update_vti(&vti)?;
        Ok(vti)
    }

    /// Move a VTI to another lifecycle state.
    ///
    /// Same-state updates are no-ops. Nothing leaves `archived`.
    pub fn update_status<S: LedgerStore + ?Sized>(
        store: &mut S,
        id: &VtiId,
        status: VtiStatus,
    ) -> Result<Vti, TraceError> {
        let mut vti = Self::get(store, id)?;
        if vti.status == status {
            return Ok(vti);
        }
        if vti.status.is_terminal() {
            return Err(TraceError::InvalidTransition {
                id: id.clone(),
                from: vti.status,
                to: status,
            });
        }
        vti.status = status;
        store.update_vti(&vti)?;
        Ok(vti)
    }

    /// Add links to an existing VTI under the same checks as `create`.
    pub fn link<S: LedgerStore + ?Sized>(
        store: &mut S,
        id: &VtiId,
        targets: &[VtiId],
    ) -> Result<Vti, TraceError> {
        let mut vti = Self::get(store, id)?;
        let fresh: Vec<VtiId> = targets
            .iter()
            .filter(|t| !vti.linked_vtis.contains(*t))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(vti);
        }
        if vti.linked_vtis.len() + fresh.len() > MAX_LINKED_VTIS {
            return Err(TraceError::validation(
                "linkedVtis",
                format!("at most {MAX_LINKED_VTIS} links per VTI"),
            ));
        }
        let checked = Self::checked_targets(store, id, &fresh)?;
        vti.linked_vtis.extend(checked);
        store.update_vti(&vti)?;
        Ok(vti)
    }

    /// Upstream provenance closure of a VTI, breadth-first, up to `depth`
    /// levels (capped at `MAX_LINK_DEPTH`).
    ///
    /// Dangling link targets are skipped.
    pub fn trace<S: LedgerStore + ?Sized>(
        store: &S,
        id: &VtiId,
        depth: usize,
    ) -> Result<Vec<ProvenanceStep>, TraceError> {
        let root = Self::get(store, id)?;
        let max_depth = depth.min(MAX_LINK_DEPTH);

        let mut visited = BTreeSet::from([root.id.clone()]);
        let mut queue: VecDeque<(usize, VtiId)> =
            root.linked_vtis.iter().map(|t| (1, t.clone())).collect();
        let mut steps = Vec::new();

        while let Some((level, next)) = queue.pop_front() {
            if level > max_depth || !visited.insert(next.clone()) {
                continue;
            }
            let Some(vti) = store.get_vti(&next)? else {
                continue;
            };
            for upstream in &vti.linked_vtis {
                if !visited.contains(upstream) {
                    queue.push_back((level + 1, upstream.clone()));
                }
            }
            steps.push(ProvenanceStep { depth: level, vti });
        }
        Ok(steps)
    }

    /// Validate link targets for `id`: bounded count, existence, acyclicity.
    fn checked_targets<S: LedgerStore + ?Sized>(
        store: &S,
        id: &VtiId,
        targets: &[VtiId],
    ) -> Result<BTreeSet<VtiId>, TraceError> {
        let unique: BTreeSet<VtiId> = targets.iter().cloned().collect();
        if unique.len() > MAX_LINKED_VTIS {
            return Err(TraceError::validation(
                "linkedVtis",
                format!("at most {MAX_LINKED_VTIS} links per VTI"),
            ));
        }
        for target in &unique {
            if store.get_vti(target)?.is_none() {
                return Err(TraceError::VtiNotFound(target.clone()));
            }
        }
        for target in &unique {
            Self::ensure_unreachable(store, target, id)?;
        }
        Ok(unique)
    }

    /// Fail with `Cycle` if `from` (or anything upstream of it) is `id`.
    fn ensure_unreachable<S: LedgerStore + ?Sized>(
        store: &S,
        from: &VtiId,
        id: &VtiId,
    ) -> Result<(), TraceError> {
        let cycle = || TraceError::Cycle {
            vti: id.clone(),
            via: from.clone(),
        };
        if from == id {
            return Err(cycle());
        }

        let mut visited = BTreeSet::from([from.clone()]);
        let mut frontier = vec![from.clone()];
        let mut level = 0;

        while !frontier.is_empty() {
            if level >= MAX_LINK_DEPTH {
                return Err(TraceError::LinkDepthExceeded(MAX_LINK_DEPTH));
            }
            let mut next = Vec::new();
            for current in &frontier {
                let Some(vti) = store.get_vti(current)? else {
                    continue;
                };
                for upstream in vti.linked_vtis {
                    if &upstream == id {
                        return Err(cycle());
                    }
                    if visited.insert(upstream.clone()) {
                        next.push(upstream);
                    }
                }
            }
            frontier = next;
            level += 1;
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
