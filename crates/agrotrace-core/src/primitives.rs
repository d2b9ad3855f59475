//! # Ledger Primitives
//!
//! Hardcoded constants for the traceability core.
//!
//! These values bound every query and walk so that no operation grows with
//! the size of the ledger.

/// Region used when no region-specific factor exists or the actor's region
/// cannot be determined.
pub const GLOBAL_REGION: &str = "Global";

/// Provenance tag written on records derived from ledger events.
pub const DATA_SOURCE_TRACEABILITY_EVENT: &str = "traceability_event";

/// Category written on records derived from `INPUT_APPLIED` events.
pub const INPUT_CATEGORY: &str = "farm_inputs";

/// Maximum depth of a provenance walk.
///
/// - Cycle checks and trace queries stop here.
/// - A deeper graph is reported as an error, never silently truncated
///   during cycle checks.
pub const MAX_LINK_DEPTH: usize = 64;

/// Maximum number of links a single write may add.
pub const MAX_LINKED_VTIS: usize = 256;

/// Default lookback for harvest-time provenance linking, in days.
pub const DEFAULT_HARVEST_LOOKBACK_DAYS: i64 = 365;

/// Longest accepted harvest lookback, in days.
pub const MAX_HARVEST_LOOKBACK_DAYS: i64 = 36_500;

/// Event types linked into a harvest batch's pre-harvest history.
pub const PRE_HARVEST_EVENT_TYPES: [&str; 3] = ["PLANTED", "INPUT_APPLIED", "OBSERVED"];

/// Page size used by lazy ledger scans.
pub const EVENT_PAGE_SIZE: usize = 256;

/// Maximum length for event type strings.
pub const MAX_EVENT_TYPE_LENGTH: usize = 64;

/// Earliest and latest accepted emission factor years.
pub const MIN_FACTOR_YEAR: i32 = 1990;
pub const MAX_FACTOR_YEAR: i32 = 2100;
