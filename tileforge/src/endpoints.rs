use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::error;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::filters::FilterTable;

pub const DEFAULT_MAXZOOM: u8 = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    #[default]
    #[serde(rename = "static")]
    StaticFiles,
    Render,
    Mvt,
}

/// One rendering recipe for a URL path, validated at parse time.
///
/// Serializes to its canonical config form, so a parsed table round-trips.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointParams {
    #[serde(rename = "type")]
    pub kind: EndpointKind,
    pub minzoom: u8,
    pub maxzoom: u8,
    #[serde(rename = "data_zoom_offset")]
    pub zoom_offset: i32,
    #[serde(rename = "data_provider")]
    pub provider_name: String,
    #[serde(rename = "style")]
    pub style_name: String,
    pub allow_layers_query: bool,
    #[serde(rename = "allow_utfgrid")]
    pub allow_utf_grid: bool,
    pub utfgrid_key: String,
    #[serde(
        rename = "metatile_size",
        skip_serializing_if = "is_false",
        serialize_with = "serialize_auto"
    )]
    pub auto_metatile_size: bool,
    pub metatile_width: u32,
    pub metatile_height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_map: Option<PathBuf>,
    #[serde(skip)]
    pub filter_table: Option<Arc<FilterTable>>,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_auto<S: Serializer>(_auto: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str("auto")
}

/// Raw config shape of one endpoint entry; unknown fields are ignored and a
/// type-mismatched entry fails wholesale (logged and dropped by the parser).
#[derive(Debug, Deserialize)]
struct EndpointEntry {
    #[serde(rename = "type", default)]
    kind: EndpointKind,
    #[serde(default)]
    minzoom: u8,
    #[serde(default = "default_maxzoom")]
    maxzoom: u8,
    #[serde(rename = "data_zoom_offset", default)]
    data_zoom_offset: i32,
    #[serde(rename = "data_provider", default)]
    data_provider: String,
    #[serde(default)]
    style: String,
    #[serde(default)]
    allow_layers_query: bool,
    #[serde(default)]
    allow_utfgrid: bool,
    #[serde(default)]
    utfgrid_key: String,
    #[serde(default)]
    filter_map: Option<PathBuf>,
    #[serde(default)]
    metatile_size: Option<Value>,
    #[serde(default)]
    metatile_width: Option<u32>,
    #[serde(default)]
    metatile_height: Option<u32>,
}

fn default_maxzoom() -> u8 {
    DEFAULT_MAXZOOM
}

/// Immutable snapshot of path -> endpoint variants, published via atomic
/// pointer swap. One path may declare multiple variants tried in order.
#[derive(Debug, Default, PartialEq)]
pub struct EndpointTable {
    endpoints: HashMap<String, Vec<Arc<EndpointParams>>>,
}

impl EndpointTable {
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&[Arc<EndpointParams>]> {
        self.endpoints.get(path).map(Vec::as_slice)
    }

    /// Longest-prefix match of a request path against the endpoint paths.
    #[must_use]
    pub fn resolve(&self, request_path: &str) -> Option<(&str, &[Arc<EndpointParams>])> {
        self.endpoints
            .iter()
            .filter(|(path, _)| request_path.starts_with(path.as_str()))
            .max_by_key(|(path, _)| path.len())
            .map(|(path, params)| (path.as_str(), params.as_slice()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Canonical config form of the table.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = serde_json::Map::with_capacity(self.endpoints.len());
        for (path, params) in &self.endpoints {
            let list = params
                .iter()
                .map(|p| serde_json::to_value(&**p).unwrap_or(Value::Null))
                .collect();
            object.insert(path.clone(), Value::Array(list));
        }
        Value::Object(object)
    }
}

/// Parses the `server.endpoints` object. Invalid entries are logged and
/// dropped, never fatal; a non-object yields `None`.
#[must_use]
pub fn parse_endpoints(jendpoints: &Value) -> Option<EndpointTable> {
    let object = jendpoints.as_object()?;
    let mut endpoints = HashMap::with_capacity(object.len());
    for (path, jendpoint) in object {
        if endpoints.contains_key(path) {
            error!("Duplicate endpoint path: {path}");
            continue;
        }
        let mut variants = Vec::new();
        match jendpoint.as_array() {
            Some(entries) => {
                for jparams in entries {
                    let entry: EndpointEntry = match serde_json::from_value(jparams.clone()) {
                        Ok(entry) => entry,
                        Err(e) => {
                            error!("Invalid endpoint entry for '{path}': {e}");
                            continue;
                        }
                    };
                    if let Some(params) = validate(path, entry) {
                        variants.push(Arc::new(params));
                    }
                }
            }
            None => error!("Endpoint '{path}' must be a list of parameter objects"),
        }
        endpoints.insert(path.clone(), variants);
    }
    Some(EndpointTable { endpoints })
}

fn validate(path: &str, entry: EndpointEntry) -> Option<EndpointParams> {
    let mut params = EndpointParams {
        kind: entry.kind,
        minzoom: entry.minzoom,
        maxzoom: entry.maxzoom,
        zoom_offset: entry.data_zoom_offset,
        provider_name: entry.data_provider,
        style_name: entry.style,
        allow_layers_query: entry.allow_layers_query,
        allow_utf_grid: false,
        utfgrid_key: String::new(),
        auto_metatile_size: false,
        metatile_width: 1,
        metatile_height: 1,
        filter_map: None,
        filter_table: None,
    };

    match params.kind {
        EndpointKind::StaticFiles => {
            if params.provider_name.is_empty() {
                error!("No provider name for endpoint '{path}' provided!");
                return None;
            }
        }
        EndpointKind::Render => {
            params.allow_utf_grid = entry.allow_utfgrid;
            params.utfgrid_key = entry.utfgrid_key;
            if params.allow_utf_grid && params.utfgrid_key.is_empty() {
                error!("No utfgrid key for endpoint '{path}' provided!");
                params.allow_utf_grid = false;
            }
            if params.style_name.is_empty() {
                error!("No style name for endpoint '{path}' provided!");
                return None;
            }
        }
        EndpointKind::Mvt => {
            if params.provider_name.is_empty() {
                error!("No provider name for endpoint '{path}' provided!");
                return None;
            }
            if let Some(filter_map) = entry.filter_map {
                match FilterTable::load(&filter_map, params.maxzoom) {
                    Ok(table) => {
                        params.filter_table = Some(Arc::new(table));
                        params.filter_map = Some(filter_map);
                    }
                    Err(e) => {
                        error!("{e}");
                        return None;
                    }
                }
            }
        }
    }

    match entry.metatile_size {
        Some(Value::String(size)) if size == "auto" => {
            if params.provider_name.is_empty() {
                error!("Auto metatile size can be used only with data provider!");
            } else {
                params.auto_metatile_size = true;
            }
        }
        Some(Value::String(size)) => {
            error!("Invalid metatile size '{size}' for endpoint '{path}'");
        }
        Some(Value::Number(size)) => match size.as_u64().and_then(|n| u32::try_from(n).ok()) {
            Some(size) => {
                params.metatile_width = size.max(1);
                params.metatile_height = size.max(1);
            }
            None => error!("Invalid metatile size '{size}' for endpoint '{path}'"),
        },
        Some(_) | None => {
            params.metatile_width = entry.metatile_width.unwrap_or(1);
            params.metatile_height = entry.metatile_height.unwrap_or(1);
        }
    }

    Some(params)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use serde_json::json;

    use super::*;

    fn single(table: &EndpointTable, path: &str) -> Arc<EndpointParams> {
        let params = table.get(path).unwrap();
        assert_eq!(params.len(), 1);
        Arc::clone(&params[0])
    }

    #[test]
    fn parse_applies_defaults() {
        let table = parse_endpoints(&json!({
            "/t/": [{"type": "render", "style": "base"}]
        }))
        .unwrap();
        let params = single(&table, "/t/");
        assert_eq!(params.kind, EndpointKind::Render);
        assert_eq!(params.minzoom, 0);
        assert_eq!(params.maxzoom, DEFAULT_MAXZOOM);
        assert_eq!(params.zoom_offset, 0);
        assert_eq!(params.style_name, "base");
        assert_eq!((params.metatile_width, params.metatile_height), (1, 1));
        assert!(!params.allow_utf_grid);
        assert!(!params.auto_metatile_size);
    }

    #[test]
    fn invalid_entries_are_dropped_not_fatal() {
        let table = parse_endpoints(&json!({
            "/a/": [{"type": "render"}],                    // no style
            "/b/": [{"type": "static"}],                    // no provider
            "/c/": [{"type": "mvt"}],                       // no provider
            "/d/": [{"type": "teapot", "style": "base"}],   // unknown type
            "/e/": [{"type": "render", "style": "base", "minzoom": "low"}], // mistyped field
            "/ok/": [{"type": "render", "style": "base"}],
        }))
        .unwrap();
        assert_eq!(table.len(), 6);
        for path in ["/a/", "/b/", "/c/", "/d/", "/e/"] {
            assert!(table.get(path).unwrap().is_empty(), "{path} should be empty");
        }
        assert_eq!(table.get("/ok/").unwrap().len(), 1);

        assert_eq!(parse_endpoints(&json!("not an object")), None);
    }

    #[test]
    fn utfgrid_without_key_is_forced_off() {
        let table = parse_endpoints(&json!({
            "/t/": [
                {"type": "render", "style": "base", "allow_utfgrid": true},
                {"type": "render", "style": "base", "allow_utfgrid": true, "utfgrid_key": "name"},
            ]
        }))
        .unwrap();
        let params = table.get("/t/").unwrap();
        assert!(!params[0].allow_utf_grid);
        assert!(params[1].allow_utf_grid);
        assert_eq!(params[1].utfgrid_key, "name");
    }

    #[test]
    fn metatile_variants() {
        let table = parse_endpoints(&json!({
            "/square/": [{"type": "render", "style": "s", "metatile_size": 4}],
            "/explicit/": [{"type": "render", "style": "s",
                            "metatile_width": 2, "metatile_height": 3}],
            "/auto/": [{"type": "render", "style": "s", "data_provider": "osm",
                        "metatile_size": "auto"}],
            "/auto-no-provider/": [{"type": "render", "style": "s", "metatile_size": "auto"}],
        }))
        .unwrap();

        let square = single(&table, "/square/");
        assert_eq!((square.metatile_width, square.metatile_height), (4, 4));

        let explicit = single(&table, "/explicit/");
        assert_eq!((explicit.metatile_width, explicit.metatile_height), (2, 3));

        let auto = single(&table, "/auto/");
        assert!(auto.auto_metatile_size);
        assert_eq!((auto.metatile_width, auto.metatile_height), (1, 1));

        // falls back to 1x1 with an error log
        let fallback = single(&table, "/auto-no-provider/");
        assert!(!fallback.auto_metatile_size);
        assert_eq!((fallback.metatile_width, fallback.metatile_height), (1, 1));
    }

    #[test]
    fn inverted_zoom_range_still_parses() {
        let table = parse_endpoints(&json!({
            "/t/": [{"type": "render", "style": "s", "minzoom": 10, "maxzoom": 5}]
        }))
        .unwrap();
        let params = single(&table, "/t/");
        assert_eq!((params.minzoom, params.maxzoom), (10, 5));
    }

    #[test]
    fn mvt_filter_table_is_loaded_at_parse_time() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"roads": 10}}"#).unwrap();
        let filter_path = file.path().to_string_lossy().to_string();

        let table = parse_endpoints(&json!({
            "/v/": [{"type": "mvt", "data_provider": "osm", "filter_map": filter_path,
                     "maxzoom": 14}],
            "/broken/": [{"type": "mvt", "data_provider": "osm",
                          "filter_map": "/nonexistent/filter.json"}],
        }))
        .unwrap();

        let params = single(&table, "/v/");
        let filter = params.filter_table.as_ref().unwrap();
        assert!(filter.allows("roads", 10));
        assert!(!filter.allows("roads", 11));

        assert!(table.get("/broken/").unwrap().is_empty());
    }

    #[test]
    fn resolve_picks_the_longest_prefix() {
        let table = parse_endpoints(&json!({
            "/t/": [{"type": "render", "style": "coarse"}],
            "/t/hd/": [{"type": "render", "style": "fine"}],
        }))
        .unwrap();

        let (path, params) = table.resolve("/t/hd/3/1/2.png").unwrap();
        assert_eq!(path, "/t/hd/");
        assert_eq!(params[0].style_name, "fine");

        let (path, _) = table.resolve("/t/3/1/2.png").unwrap();
        assert_eq!(path, "/t/");

        assert!(table.resolve("/other/3/1/2.png").is_none());
    }

    #[test]
    fn canonical_form_round_trips() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"roads": true}}"#).unwrap();
        let filter_path = file.path().to_string_lossy().to_string();

        let table = parse_endpoints(&json!({
            "/t/": [
                {"type": "render", "style": "base", "metatile_size": 2,
                 "allow_utfgrid": true, "utfgrid_key": "name"},
                {"type": "render", "style": "base", "minzoom": 5, "data_zoom_offset": -1},
            ],
            "/auto/": [{"type": "render", "style": "s", "data_provider": "osm",
                        "metatile_size": "auto"}],
            "/v/": [{"type": "mvt", "data_provider": "osm", "filter_map": filter_path}],
            "/files/": [{"type": "static", "data_provider": "assets"}],
        }))
        .unwrap();

        let reparsed = parse_endpoints(&table.to_value()).unwrap();
        assert_eq!(reparsed, table);
    }
}
