//! Weather observation ingestion.
//!
//! Fetches per-site observations from the Open-Meteo archive and forecast
//! APIs, normalizes them into one canonical shape and upserts them into
//! PostgreSQL keyed by `(site_id, source, observation_time)`. A companion
//! auditor verifies that key stays unique in the store.

pub mod audit;
pub mod config;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod sites;
pub mod store;
