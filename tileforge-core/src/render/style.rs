use std::path::PathBuf;

use log::{error, warn};
use serde_json::Value;

/// One entry of the `render.styles` configuration section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleInfo {
    pub name: String,
    pub path: PathBuf,
    pub allow_grid_render: bool,
    pub version: u64,
}

/// Parses a single style node. Returns `None` (with an error log) when the
/// entry is unusable; a non-bool `allow_utfgrid` only warns.
pub(crate) fn parse_style_info(name: &str, value: &Value) -> Option<StyleInfo> {
    if name.is_empty() {
        error!("Invalid style node name");
        return None;
    }
    let path = match value.get("map") {
        Some(Value::String(path)) if !path.is_empty() => PathBuf::from(path),
        None | Some(Value::Null) => {
            error!("No map path for style {name} provided!");
            return None;
        }
        Some(_) => {
            error!("Map path for style {name} should have string type!");
            return None;
        }
    };

    let mut info = StyleInfo {
        name: name.to_string(),
        path,
        allow_grid_render: false,
        version: 0,
    };
    match value.get("allow_utfgrid") {
        Some(Value::Bool(allow)) => info.allow_grid_render = *allow,
        Some(_) => warn!("allow_utfgrid for style {name} should have bool type!"),
        None => {}
    }
    if let Some(version) = value.get("version").and_then(Value::as_u64) {
        info.version = version;
    }
    Some(info)
}

/// Parses a whole `render.styles` object for a style update. Any unusable
/// entry aborts the update, unlike the lenient per-entry skip at startup.
pub(crate) fn parse_styles(value: &Value) -> Option<Vec<StyleInfo>> {
    let object = value.as_object()?;
    let mut styles = Vec::with_capacity(object.len());
    for (name, jstyle) in object {
        styles.push(parse_style_info(name, jstyle)?);
    }
    Some(styles)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_full_entry() {
        let info = parse_style_info(
            "base",
            &json!({"map": "/maps/base.json", "allow_utfgrid": true, "version": 3}),
        )
        .unwrap();
        assert_eq!(info.name, "base");
        assert_eq!(info.path, PathBuf::from("/maps/base.json"));
        assert!(info.allow_grid_render);
        assert_eq!(info.version, 3);
    }

    #[test]
    fn missing_or_mistyped_map_path_is_rejected() {
        assert_eq!(parse_style_info("s", &json!({})), None);
        assert_eq!(parse_style_info("s", &json!({"map": null})), None);
        assert_eq!(parse_style_info("s", &json!({"map": 4})), None);
        assert_eq!(parse_style_info("s", &json!({"map": ""})), None);
        assert_eq!(parse_style_info("", &json!({"map": "/m.json"})), None);
    }

    #[test]
    fn non_bool_utfgrid_flag_only_warns() {
        let info = parse_style_info("s", &json!({"map": "/m.json", "allow_utfgrid": "yes"})).unwrap();
        assert!(!info.allow_grid_render);
    }

    #[test]
    fn update_parse_is_all_or_nothing() {
        let ok = parse_styles(&json!({
            "a": {"map": "/a.json"},
            "b": {"map": "/b.json", "version": 1},
        }))
        .unwrap();
        assert_eq!(ok.len(), 2);

        assert_eq!(
            parse_styles(&json!({"a": {"map": "/a.json"}, "b": {}})),
            None
        );
        assert_eq!(parse_styles(&json!("not an object")), None);
    }
}
