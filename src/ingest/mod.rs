/// Extraction and normalization for the Open-Meteo data sources.
///
/// Submodules:
/// - `fetch`: per-site HTTP GET with classified failures and retry/backoff.
/// - `open_meteo`: request plans and response shapes for archive and forecast APIs.
/// - `normalize`: payload to canonical `Observation` mapping with range checks.

pub mod fetch;
pub mod normalize;
pub mod open_meteo;
