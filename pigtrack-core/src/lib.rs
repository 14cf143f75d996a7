//! Core of the pig tracking pipeline: the per-tick detection engine, the
//! dedup fingerprint, and the shared store (reference data, telemetry,
//! per-pig state, notifications outbox) with in-memory and PostgreSQL
//! backends.

pub mod config;
pub mod dedup;
pub mod engine;
pub mod snapshot;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod types;
