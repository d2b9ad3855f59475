//! # agrotrace
//!
//! The async shell around `agrotrace-core`: HTTP API, configuration,
//! region resolution and the ledger-to-calculator trigger.
//!
//! Exposed as a library so integration tests can build the router
//! without binding a socket.

pub mod api;
pub mod config;
pub mod regions;
pub mod trigger;
