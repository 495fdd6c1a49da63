/// Site registry for the weather ingestion pipeline.
///
/// The registry is an external document listing every monitoring site a run
/// fans out over. It is the single source of truth for site identifiers;
/// it is read once at startup and never mutated during a run.
///
/// Accepted formats, chosen by file extension:
///
/// ```toml
/// [[sites]]
/// site_id = "ba-01"
/// name = "Buenos Aires"
/// latitude = -34.6037
/// longitude = -58.3816
/// timezone = "America/Argentina/Buenos_Aires"
/// ```
///
/// or JSON, either a bare array of site objects or `{ "sites": [...] }`.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::model::{SetupError, Site};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    sites: Vec<Site>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonRegistry {
    Bare(Vec<Site>),
    Wrapped(RegistryDocument),
}

/// Ordered, validated, read-only collection of sites.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteRegistry {
    sites: Vec<Site>,
}

impl SiteRegistry {
    /// Validate and wrap an already-parsed site list.
    pub fn new(sites: Vec<Site>) -> Result<Self, String> {
        validate(&sites)?;
        Ok(SiteRegistry { sites })
    }

    /// Load the registry document at `path`. Any problem is a fatal setup
    /// error: a run must never start against a partial registry.
    pub fn load(path: &Path) -> Result<Self, SetupError> {
        let fail = |reason: String| SetupError::Registry {
            path: path.display().to_string(),
            reason,
        };

        let text = std::fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let sites = if is_json {
            parse_json(&text)
        } else {
            parse_toml(&text)
        }
        .map_err(fail)?;

        SiteRegistry::new(sites).map_err(fail)
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Looks up a site by id. Returns `None` if not found.
    pub fn find(&self, site_id: &str) -> Option<&Site> {
        self.sites.iter().find(|s| s.site_id == site_id)
    }

    /// Site ids in registry order.
    pub fn site_ids(&self) -> Vec<&str> {
        self.sites.iter().map(|s| s.site_id.as_str()).collect()
    }
}

pub fn parse_toml(text: &str) -> Result<Vec<Site>, String> {
    toml::from_str::<RegistryDocument>(text)
        .map(|doc| doc.sites)
        .map_err(|e| format!("TOML parse error: {}", e))
}

pub fn parse_json(text: &str) -> Result<Vec<Site>, String> {
    match serde_json::from_str::<JsonRegistry>(text) {
        Ok(JsonRegistry::Bare(sites)) => Ok(sites),
        Ok(JsonRegistry::Wrapped(doc)) => Ok(doc.sites),
        Err(e) => Err(format!("JSON parse error: {}", e)),
    }
}

fn validate(sites: &[Site]) -> Result<(), String> {
    if sites.is_empty() {
        return Err("registry contains no sites".to_string());
    }

    let mut seen = HashSet::new();
    for site in sites {
        if site.site_id.trim().is_empty() {
            return Err(format!("site '{}' has a blank site_id", site.name));
        }
        if !seen.insert(site.site_id.as_str()) {
            return Err(format!("duplicate site_id '{}'", site.site_id));
        }
        if !(-90.0..=90.0).contains(&site.latitude) {
            return Err(format!("site '{}' latitude {} out of range", site.site_id, site.latitude));
        }
        if !(-180.0..=180.0).contains(&site.longitude) {
            return Err(format!(
                "site '{}' longitude {} out of range",
                site.site_id, site.longitude
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_TOML: &str = r#"
[[sites]]
site_id = "ba-01"
name = "Buenos Aires"
latitude = -34.6037
longitude = -58.3816
timezone = "America/Argentina/Buenos_Aires"

[[sites]]
site_id = "cba-01"
name = "Cordoba"
latitude = -31.4201
longitude = -64.1888
"#;

    fn site(id: &str) -> Site {
        Site {
            site_id: id.to_string(),
            name: format!("Site {}", id),
            latitude: 0.0,
            longitude: 0.0,
            timezone: None,
        }
    }

    fn write_temp(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .expect("temp file");
        file.write_all(contents.as_bytes()).expect("write registry");
        file
    }

    #[test]
    fn test_toml_registry_loads_in_order() {
        let file = write_temp(".toml", SAMPLE_TOML);
        let registry = SiteRegistry::load(file.path()).expect("valid registry");

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.site_ids(), vec!["ba-01", "cba-01"]);
        assert_eq!(
            registry.find("ba-01").and_then(|s| s.timezone.as_deref()),
            Some("America/Argentina/Buenos_Aires")
        );
        assert_eq!(registry.find("cba-01").map(|s| s.timezone.clone()), Some(None));
    }

    #[test]
    fn test_json_registry_bare_and_wrapped() {
        let bare = r#"[{"site_id": "1", "name": "Rosario", "latitude": -32.95, "longitude": -60.66}]"#;
        let wrapped = r#"{"sites": [{"site_id": "1", "name": "Rosario", "latitude": -32.95, "longitude": -60.66}]}"#;

        assert_eq!(parse_json(bare).unwrap().len(), 1);
        assert_eq!(parse_json(wrapped).unwrap().len(), 1);

        let file = write_temp(".json", bare);
        let registry = SiteRegistry::load(file.path()).expect("valid JSON registry");
        assert_eq!(registry.sites()[0].name, "Rosario");
    }

    #[test]
    fn test_missing_file_is_a_setup_error() {
        let result = SiteRegistry::load(Path::new("/nonexistent/sites.toml"));
        assert!(matches!(result, Err(SetupError::Registry { .. })));
    }

    #[test]
    fn test_unparseable_registry_is_a_setup_error() {
        let file = write_temp(".toml", "[[sites]]\nsite_id = ");
        assert!(matches!(SiteRegistry::load(file.path()), Err(SetupError::Registry { .. })));
    }

    #[test]
    fn test_empty_registry_is_rejected() {
        assert!(SiteRegistry::new(Vec::new()).is_err());
    }

    #[test]
    fn test_duplicate_site_ids_are_rejected() {
        let err = SiteRegistry::new(vec![site("a"), site("b"), site("a")]).unwrap_err();
        assert!(err.contains("duplicate site_id 'a'"), "got: {}", err);
    }

    #[test]
    fn test_blank_site_id_is_rejected() {
        assert!(SiteRegistry::new(vec![site("  ")]).is_err());
    }

    #[test]
    fn test_out_of_range_coordinates_are_rejected() {
        let mut bad_lat = site("a");
        bad_lat.latitude = 91.0;
        assert!(SiteRegistry::new(vec![bad_lat]).is_err());

        let mut bad_lon = site("b");
        bad_lon.longitude = -180.5;
        assert!(SiteRegistry::new(vec![bad_lon]).is_err());
    }

    #[test]
    fn test_find_returns_none_for_unknown_id() {
        let registry = SiteRegistry::new(vec![site("a")]).unwrap();
        assert!(registry.find("zz").is_none());
    }
}
