// Merging of JSON configuration documents from a search-path list. The
// document contents are opaque to the framework; only log-level keys are
// interpreted elsewhere.

use std::path::Path;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use serde_json::Value;

use crate::error::ConfigError;

/// Deep-merge `overlay` into `base`. Objects merge key by key; any other
/// kind of node in the overlay replaces the base node.
pub fn merge_values(base: &mut Value, overlay: &Value) {
  match (base, overlay) {
    (Value::Object(base_map), Value::Object(overlay_map)) => {
      for (key, overlay_value) in overlay_map {
        match base_map.get_mut(key) {
          Some(base_value) => merge_values(base_value, overlay_value),
          None => {
            base_map.insert(key.clone(), overlay_value.clone());
          }
        }
      }
    }
    (base, overlay) => *base = overlay.clone(),
  }
}

/// Merge the JSON documents at `paths` in order; later documents override
/// earlier ones. With `ignore_missing`, absent files are skipped; if every
/// file is absent the result is [`ConfigError::NotFound`].
pub fn merge_files<P: AsRef<Path>>(
  paths: &[P],
  ignore_missing: bool,
) -> Result<Value, ConfigError> {
  let mut merged = Value::Object(serde_json::Map::new());
  let mut found = false;
  for path in paths {
    let path = path.as_ref();
    let text = match std::fs::read_to_string(path) {
      Ok(text) => text,
      Err(e) if ignore_missing && e.kind() == std::io::ErrorKind::NotFound => {
        debug!("config file {} not present, skipping", path.display());
        continue;
      }
      Err(e) => {
        return Err(ConfigError::Io {
          path: path.display().to_string(),
          source: e,
        })
      }
    };
    let document: Value = serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
      path: path.display().to_string(),
      source: e,
    })?;
    merge_values(&mut merged, &document);
    found = true;
  }
  if !found {
    return Err(ConfigError::NotFound);
  }
  Ok(merged)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::io::Write;

  #[test]
  fn overlay_leaves_override_base() {
    let mut base = json!({"a": 1, "nested": {"x": 1, "y": 2}});
    let overlay = json!({"nested": {"y": 3, "z": 4}, "b": 2});
    merge_values(&mut base, &overlay);
    assert_eq!(
      base,
      json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 3, "z": 4}})
    );
  }

  #[test]
  fn non_object_overlay_replaces_node() {
    let mut base = json!({"a": {"deep": true}});
    merge_values(&mut base, &json!({"a": 7}));
    assert_eq!(base, json!({"a": 7}));
  }

  #[test]
  fn later_files_override_earlier_ones() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root.json");
    let leaf = dir.path().join("leaf.json");
    writeln!(std::fs::File::create(&root).unwrap(), r#"{{"a": 1, "b": 1}}"#).unwrap();
    writeln!(std::fs::File::create(&leaf).unwrap(), r#"{{"b": 2}}"#).unwrap();

    let merged = merge_files(&[root, leaf], true).unwrap();
    assert_eq!(merged, json!({"a": 1, "b": 2}));
  }

  #[test]
  fn missing_files_are_skipped_when_requested() {
    let dir = tempfile::tempdir().unwrap();
    let present = dir.path().join("present.json");
    writeln!(std::fs::File::create(&present).unwrap(), r#"{{"a": 1}}"#).unwrap();
    let absent = dir.path().join("absent.json");

    let merged = merge_files(&[absent.clone(), present], true).unwrap();
    assert_eq!(merged, json!({"a": 1}));

    assert!(matches!(
      merge_files(&[absent], true),
      Err(ConfigError::NotFound)
    ));
  }
}
